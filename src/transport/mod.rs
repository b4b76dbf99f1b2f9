//! Stream abstraction beneath the consensus protocol.
//!
//! The traits use manually desugared async methods (pinned boxed futures)
//! so they stay object safe and a connection can be handed from an
//! election ambassador to the leader that reuses it.

pub mod local;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::Result;
use crate::raft::rpc::{AppendEntries, AppendEntriesResponse, Hello, RequestVote, RequestVoteResponse};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Opens connections to peers.
pub trait Transport: Send + Sync + 'static {
    fn connect<'a>(
        &'a self,
        tag: &'a str,
        url: &'a str,
    ) -> BoxFuture<'a, Result<Arc<dyn RemoteConnection>>>;
}

/// One established connection to a peer. Requests are answered in order.
pub trait RemoteConnection: Send + Sync {
    /// Tag of the peer this connection was opened for.
    fn peer_tag(&self) -> &str;

    fn hello(&self, hello: Hello) -> BoxFuture<'_, Result<()>>;

    fn request_vote(&self, request: RequestVote) -> BoxFuture<'_, Result<RequestVoteResponse>>;

    fn append_entries(&self, request: AppendEntries)
        -> BoxFuture<'_, Result<AppendEntriesResponse>>;

    fn close(&self) {}
}
