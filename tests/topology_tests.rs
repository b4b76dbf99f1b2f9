//! Membership changes through the leader.


use std::time::Duration;

use raft_lite::{NodeState, RaftError, TopologyModification};
use test_harness::{assert_eventually, url_for, TestCluster};

#[tokio::test]
async fn test_added_nodes_get_sequential_tags() {
    let mut cluster = TestCluster::new(3).await;

    let tags: Vec<String> = cluster.nodes.values().map(|node| node.tag()).collect();
    assert_eq!(tags, vec!["A", "B", "C"]);

    let leader = cluster.node("a").engine.topology();
    assert_eq!(leader.last_node_id, "C");
    assert_eq!(leader.get_url_from_tag("B"), Some(url_for("b").as_str()));

    // every node runs the same cluster
    for node in cluster.nodes.values() {
        assert_eq!(node.engine.topology().topology_id, leader.topology_id);
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_adding_known_url_is_idempotent() {
    let mut cluster = TestCluster::new(2).await;
    let leader = cluster.node("a").engine.clone();
    let commit = leader.commit_index();

    let tag = leader
        .add_to_cluster(&url_for("b"), None, TopologyModification::Voter)
        .await
        .unwrap();
    assert_eq!(tag, "B");
    assert_eq!(leader.commit_index(), commit, "no new entry for a no-op change");

    let err = leader
        .add_to_cluster(&url_for("b"), Some("Q"), TopologyModification::Voter)
        .await
        .unwrap_err();
    assert!(matches!(err, RaftError::InvalidOperation(_)));

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_promotable_is_promoted_once_caught_up() {
    let mut cluster = TestCluster::new(2).await;
    let leader = cluster.node("a").engine.clone();
    for i in 0..5 {
        leader.put(format!("cmd-{i}").into_bytes()).await.unwrap();
    }

    let tag = cluster.join("c", TopologyModification::Promotable).await;

    tokio::time::timeout(
        Duration::from_secs(5),
        leader.wait_for_topology(TopologyModification::Voter, Some(tag.as_str())),
    )
    .await
    .expect("promotable should become a voter")
    .unwrap();

    let joined = cluster.node("c").engine.clone();
    assert_eventually(
        || async { joined.topology().is_voter(&tag) },
        Duration::from_secs(2),
        "Promoted node should learn it is a voter",
    )
    .await;
    assert_eq!(leader.topology().voters_count(), 3);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_non_voter_replicates_without_voting() {
    let mut cluster = TestCluster::new(2).await;
    let tag = cluster.join("w", TopologyModification::NonVoter).await;
    let leader = cluster.node("a").engine.clone();

    let topology = leader.topology();
    assert!(topology.watchers.contains_key(&tag));
    assert_eq!(topology.voters_count(), 2);

    leader.put(b"watched".to_vec()).await.unwrap();
    let watcher = cluster.node("w");
    let state_machine = watcher.state_machine.clone();
    assert_eventually(
        || async { state_machine.applied_payloads() == vec![b"watched".to_vec()] },
        Duration::from_secs(2),
        "Watcher should apply committed entries",
    )
    .await;
    assert_eq!(watcher.state(), NodeState::Follower);

    // a watcher cannot run for office
    let err = watcher
        .engine
        .trigger_election(raft_lite::raft::ElectionKind::Timeout)
        .unwrap_err();
    assert!(matches!(err, RaftError::InvalidOperation(_)));

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_removed_node_becomes_passive() {
    let mut cluster = TestCluster::new(3).await;
    let leader = cluster.node("a").engine.clone();
    let removed = cluster.node("c").engine.clone();

    leader.remove_from_cluster("C").await.unwrap();

    tokio::time::timeout(
        Duration::from_secs(2),
        leader.wait_for_topology(TopologyModification::Remove, Some("C")),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(leader.topology().voters_count(), 2);

    assert_eventually(
        || async { removed.current_state() == NodeState::Passive },
        Duration::from_secs(2),
        "Removed node should reset to passive",
    )
    .await;
    assert_eq!(removed.tag(), "?");
    assert!(removed.topology().is_passive());

    // the remaining pair still commits
    leader.put(b"after-removal".to_vec()).await.unwrap();

    // removing an absent node is a no-op
    leader.remove_from_cluster("C").await.unwrap();

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_leader_cannot_remove_or_demote_itself() {
    let mut cluster = TestCluster::new(3).await;
    let leader = cluster.node("a").engine.clone();

    let err = leader.remove_from_cluster("A").await.unwrap_err();
    assert!(matches!(err, RaftError::InvalidOperation(_)));

    let err = leader
        .add_to_cluster(&url_for("a"), None, TopologyModification::NonVoter)
        .await
        .unwrap_err();
    assert!(matches!(err, RaftError::InvalidOperation(_)));

    let err = leader
        .add_to_cluster(&url_for("x"), None, TopologyModification::Remove)
        .await
        .unwrap_err();
    assert!(matches!(err, RaftError::InvalidOperation(_)));

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_topology_changes_require_the_leader() {
    let mut cluster = TestCluster::new(3).await;
    let follower = cluster.node("b").engine.clone();

    let err = follower
        .add_to_cluster(&url_for("d"), None, TopologyModification::Voter)
        .await
        .unwrap_err();
    assert!(matches!(err, RaftError::NotLeading { .. }));

    let err = follower.remove_from_cluster("C").await.unwrap_err();
    assert!(matches!(err, RaftError::NotLeading { .. }));

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_wait_for_topology_resolves_on_join() {
    let mut cluster = TestCluster::new(1).await;
    let leader = cluster.node("a").engine.clone();

    let waiter = {
        let leader = leader.clone();
        tokio::spawn(async move {
            leader
                .wait_for_topology(TopologyModification::Voter, Some("B"))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());

    cluster.join("b", TopologyModification::Voter).await;
    tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .expect("waiter should resolve")
        .unwrap()
        .unwrap();

    // without a tag the node waits on its own role
    tokio::time::timeout(
        Duration::from_millis(100),
        leader.wait_for_topology(TopologyModification::Voter, None),
    )
    .await
    .unwrap()
    .unwrap();

    cluster.shutdown().await;
}
