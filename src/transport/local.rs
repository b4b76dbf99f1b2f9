//! In-process transport that routes calls straight into registered engines.
//!
//! Nodes are addressed by url. Links can be cut to simulate partitions;
//! a cut link fails every call on it with a connection error, exactly like
//! a dead socket would.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};

use crate::error::{RaftError, Result};
use crate::raft::engine::ConsensusEngine;
use crate::raft::rpc::{AppendEntries, AppendEntriesResponse, Hello, RequestVote, RequestVoteResponse};

use super::{BoxFuture, RemoteConnection, Transport};

#[derive(Default)]
pub struct LocalNetwork {
    nodes: RwLock<HashMap<String, Weak<ConsensusEngine>>>,
    cut_links: RwLock<HashSet<(String, String)>>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Transport used by the node listening on `url`.
    pub fn transport_for(self: &Arc<Self>, url: &str) -> Arc<LocalTransport> {
        Arc::new(LocalTransport {
            network: self.clone(),
            source_url: url.to_string(),
        })
    }

    pub fn register(&self, url: &str, engine: &Arc<ConsensusEngine>) {
        self.nodes
            .write()
            .expect("network mutex poisoned")
            .insert(url.to_string(), Arc::downgrade(engine));
    }

    pub fn unregister(&self, url: &str) {
        self.nodes
            .write()
            .expect("network mutex poisoned")
            .remove(url);
    }

    /// Cut every link between `group_a` and `group_b`, in both directions.
    pub fn partition(&self, group_a: &[&str], group_b: &[&str]) {
        let mut cut = self.cut_links.write().expect("network mutex poisoned");
        for a in group_a {
            for b in group_b {
                cut.insert((a.to_string(), b.to_string()));
                cut.insert((b.to_string(), a.to_string()));
            }
        }
    }

    /// Cut `url` off from every other registered node.
    pub fn isolate(&self, url: &str) {
        let others: Vec<String> = self
            .nodes
            .read()
            .expect("network mutex poisoned")
            .keys()
            .filter(|other| other.as_str() != url)
            .cloned()
            .collect();
        let others: Vec<&str> = others.iter().map(String::as_str).collect();
        self.partition(&[url], &others);
    }

    /// Restore every link touching `url`.
    pub fn heal(&self, url: &str) {
        self.cut_links
            .write()
            .expect("network mutex poisoned")
            .retain(|(a, b)| a != url && b != url);
    }

    pub fn heal_all(&self) {
        self.cut_links
            .write()
            .expect("network mutex poisoned")
            .clear();
    }

    fn is_reachable(&self, from: &str, to: &str) -> bool {
        !self
            .cut_links
            .read()
            .expect("network mutex poisoned")
            .contains(&(from.to_string(), to.to_string()))
    }

    fn resolve(&self, from: &str, to: &str) -> Result<Arc<ConsensusEngine>> {
        if !self.is_reachable(from, to) {
            return Err(RaftError::Connection(format!("{from} cannot reach {to}")));
        }
        self.nodes
            .read()
            .expect("network mutex poisoned")
            .get(to)
            .and_then(Weak::upgrade)
            .ok_or_else(|| RaftError::Connection(format!("no node listening on {to}")))
    }
}

pub struct LocalTransport {
    network: Arc<LocalNetwork>,
    source_url: String,
}

impl Transport for LocalTransport {
    fn connect<'a>(
        &'a self,
        tag: &'a str,
        url: &'a str,
    ) -> BoxFuture<'a, Result<Arc<dyn RemoteConnection>>> {
        Box::pin(async move {
            self.network.resolve(&self.source_url, url)?;
            let connection: Arc<dyn RemoteConnection> = Arc::new(LocalConnection {
                network: self.network.clone(),
                source_url: self.source_url.clone(),
                target_url: url.to_string(),
                peer_tag: tag.to_string(),
                closed: AtomicBool::new(false),
            });
            Ok(connection)
        })
    }
}

struct LocalConnection {
    network: Arc<LocalNetwork>,
    source_url: String,
    target_url: String,
    peer_tag: String,
    closed: AtomicBool,
}

impl LocalConnection {
    fn target(&self) -> Result<Arc<ConsensusEngine>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RaftError::Connection(format!(
                "connection to {} is closed",
                self.target_url
            )));
        }
        self.network.resolve(&self.source_url, &self.target_url)
    }
}

impl RemoteConnection for LocalConnection {
    fn peer_tag(&self) -> &str {
        &self.peer_tag
    }

    fn hello(&self, hello: Hello) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.target()?.handle_hello(&hello) })
    }

    fn request_vote(&self, request: RequestVote) -> BoxFuture<'_, Result<RequestVoteResponse>> {
        Box::pin(async move { self.target()?.handle_request_vote(&request) })
    }

    fn append_entries(
        &self,
        request: AppendEntries,
    ) -> BoxFuture<'_, Result<AppendEntriesResponse>> {
        Box::pin(async move { self.target()?.handle_append_entries(&request) })
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
