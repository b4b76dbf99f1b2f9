//! Leader election across in-process clusters.


use std::time::Duration;

use raft_lite::raft::ElectionKind;
use raft_lite::transport::local::LocalNetwork;
use raft_lite::{NodeState, RaftError};
use test_harness::{assert_eventually, follower_engine, url_for, wait_for, TestCluster};

#[tokio::test]
async fn test_bootstrap_single_node_becomes_leader() {
    let mut cluster = TestCluster::empty();
    cluster.bootstrap("a").await;

    let node = cluster.node("a");
    assert_eq!(node.tag(), "A");
    assert_eq!(node.current_term(), 1);
    assert_eq!(node.engine.voted_for().unwrap().as_deref(), Some("A"));

    let topology = node.engine.topology();
    assert!(topology.topology_id.is_some());
    assert_eq!(topology.members.keys().collect::<Vec<_>>(), vec!["A"]);

    // noop of the new term is committed before office is taken
    assert!(node.engine.commit_index() >= 1);

    let states: Vec<NodeState> = node
        .engine
        .state_history()
        .iter()
        .map(|transition| transition.to)
        .collect();
    assert!(states.ends_with(&[NodeState::Candidate, NodeState::LeaderElect, NodeState::Leader]));

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_bootstrap_twice_is_rejected() {
    let mut cluster = TestCluster::empty();
    cluster.bootstrap("a").await;

    let node = cluster.node("a");
    let err = node.engine.bootstrap(&node.url).unwrap_err();
    assert!(matches!(err, RaftError::InvalidOperation(_)));

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_three_nodes_agree_on_leader() {
    let mut cluster = TestCluster::new(3).await;

    let leader = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");
    let leader_tag = cluster.node(&leader).tag();

    assert_eventually(
        || async {
            cluster.nodes.values().all(|node| {
                node.is_leader() || node.engine.leader_tag().as_deref() == Some(leader_tag.as_str())
            })
        },
        Duration::from_secs(2),
        "All nodes should agree on leader",
    )
    .await;

    assert_eq!(cluster.count_leaders(), 1);
    let term = cluster.node(&leader).current_term();
    for node in cluster.nodes.values() {
        assert_eq!(node.current_term(), term, "terms differ on {}", node.name);
        assert_eq!(node.engine.topology().voters_count(), 3);
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_trial_then_real_election_between_followers() {
    let network = LocalNetwork::new();
    let engines: Vec<_> = ["A", "B", "C"]
        .into_iter()
        .map(|tag| {
            let url = url_for(tag);
            let engine = follower_engine(tag, &["A", "B", "C"], network.transport_for(&url));
            network.register(&url, &engine);
            engine
        })
        .collect();
    let (a, b, c) = (&engines[0], &engines[1], &engines[2]);

    a.trigger_election(ElectionKind::Timeout).unwrap();

    assert_eventually(
        || async { a.current_state() == NodeState::Leader },
        Duration::from_secs(2),
        "A should win term 1",
    )
    .await;
    assert_eq!(a.current_term(), 1);

    // exactly one term was spent: the trial round left no trace
    assert_eventually(
        || async {
            [b, c].iter().all(|voter| {
                voter.current_term() == 1
                    && voter.current_state() == NodeState::Follower
                    && voter.leader_tag().as_deref() == Some("A")
            })
        },
        Duration::from_secs(2),
        "Voters should follow A in term 1",
    )
    .await;
    let votes: Vec<String> = [b, c]
        .iter()
        .filter_map(|voter| voter.voted_for().unwrap())
        .collect();
    assert!(!votes.is_empty());
    assert!(votes.iter().all(|voted| voted == "A"));

    for engine in &engines {
        engine.shutdown().await;
    }
}

#[tokio::test]
async fn test_passive_node_cannot_run_for_office() {
    let mut cluster = TestCluster::empty();
    let node = cluster.spawn_node("a");

    assert_eq!(node.state(), NodeState::Passive);
    let err = node.engine.trigger_election(ElectionKind::Timeout).unwrap_err();
    assert!(matches!(err, RaftError::InvalidOperation(_)));

    // a passive node never times out into an election
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(node.state(), NodeState::Passive);
    assert_eq!(node.current_term(), 0);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_stable_leader_keeps_its_term() {
    let mut cluster = TestCluster::new(3).await;
    let leader = cluster.wait_for_leader(Duration::from_secs(5)).await.unwrap();
    let term = cluster.node(&leader).current_term();

    // heartbeats keep every follower from starting an election
    tokio::time::sleep(Duration::from_millis(800)).await;

    assert_eq!(cluster.leader().map(|node| node.name.clone()), Some(leader.clone()));
    for node in cluster.nodes.values() {
        assert_eq!(node.current_term(), term);
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_forced_election_replaces_live_leader() {
    let mut cluster = TestCluster::new(3).await;
    let leader = cluster.wait_for_leader(Duration::from_secs(5)).await.unwrap();
    let old_term = cluster.node(&leader).current_term();

    let challenger = cluster.followers()[0].name.clone();
    cluster
        .node(&challenger)
        .engine
        .trigger_election(ElectionKind::Forced)
        .unwrap();

    let engine = cluster.node(&challenger).engine.clone();
    assert_eventually(
        || async { engine.current_state() == NodeState::Leader },
        Duration::from_secs(5),
        "Forced candidate should take over",
    )
    .await;
    assert!(engine.current_term() > old_term);

    assert_eventually(
        || async { cluster.count_leaders() == 1 },
        Duration::from_secs(2),
        "Old leader should step down",
    )
    .await;

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_regular_election_does_not_disrupt_live_leader() {
    let mut cluster = TestCluster::new(3).await;
    let leader = cluster.wait_for_leader(Duration::from_secs(5)).await.unwrap();
    let term = cluster.node(&leader).current_term();

    let challenger = cluster.followers()[0].name.clone();
    cluster
        .node(&challenger)
        .engine
        .trigger_election(ElectionKind::Timeout)
        .unwrap();

    // the other follower still hears from the leader and denies the trial,
    // so no term is burnt
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(cluster.node(&leader).current_term(), term);
    assert!(cluster.node(&leader).is_leader());

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_step_down_leads_to_new_election() {
    let mut cluster = TestCluster::new(3).await;
    let leader = cluster.wait_for_leader(Duration::from_secs(5)).await.unwrap();
    let term = cluster.node(&leader).current_term();

    cluster.node(&leader).engine.step_down("test").unwrap();

    let found = wait_for(
        || async {
            cluster
                .leader()
                .is_some_and(|node| node.current_term() > term)
        },
        Duration::from_secs(5),
        Duration::from_millis(20),
    )
    .await;
    assert!(found, "Cluster should elect a leader in a later term");

    let err = cluster
        .followers()
        .first()
        .map(|node| node.engine.step_down("not leading").unwrap_err())
        .unwrap();
    assert!(matches!(err, RaftError::NotLeading { .. }));

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_wait_for_leave_state() {
    let mut cluster = TestCluster::new(3).await;
    let leader = cluster.wait_for_leader(Duration::from_secs(5)).await.unwrap();
    let engine = cluster.node(&leader).engine.clone();
    let term = engine.current_term();

    let waiter = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.wait_for_leave_state(NodeState::Leader, term).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());

    engine.step_down("test").unwrap();
    tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .expect("waiter should resolve")
        .unwrap()
        .unwrap();

    cluster.shutdown().await;
}
