//! Coordination store contract.
//!
//! The region tree is persisted in an external, consistent, hierarchical
//! key/value store (ZooKeeper-like). This module defines the operations the
//! subsystem needs from such a store and a typed, cancellable watch stream.
//!
//! # Paths
//!
//! Paths are absolute, `/`-separated and never end with `/`. Creating a node
//! creates any missing ancestors with empty data.
//!
//! # Watches
//!
//! [`CoordinationStore::watch`] returns a [`WatchSubscription`] that stays
//! registered until it is cancelled or dropped. It reports every change to the
//! watched node and to all nodes below it, in the order the store applied them.

mod memory;

pub use memory::InMemoryCoordinationStore;

use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use tokio::sync::mpsc;

use super::error::CoordinationResult;

/// What happened to a watched node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchEventKind {
    Created,
    DataChanged,
    Deleted,
}

/// A change notification for a single node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub path: String,
    pub kind: WatchEventKind,
}

impl WatchEvent {
    pub fn new(path: impl Into<String>, kind: WatchEventKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

/// A persistent, recursive watch on a subtree of the store.
///
/// Events are delivered through an unbounded channel so the store never
/// blocks on a slow consumer. Dropping the subscription cancels it.
#[derive(Debug)]
pub struct WatchSubscription {
    path: String,
    receiver: mpsc::UnboundedReceiver<WatchEvent>,
}

impl WatchSubscription {
    pub fn new(path: impl Into<String>, receiver: mpsc::UnboundedReceiver<WatchEvent>) -> Self {
        Self {
            path: path.into(),
            receiver,
        }
    }

    /// Root of the watched subtree.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Next event, or `None` once the subscription is cancelled or the store closed.
    pub async fn next_event(&mut self) -> Option<WatchEvent> {
        self.receiver.recv().await
    }

    /// Stop receiving events. Already queued events can still be drained.
    pub fn cancel(&mut self) {
        self.receiver.close();
    }
}

impl Stream for WatchSubscription {
    type Item = WatchEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().receiver.poll_recv(cx)
    }
}

/// Hierarchical key/value store with watches.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Create a node. Fails with `NodeExists` when the node is already present.
    async fn create_node(&self, path: &str, data: Bytes) -> CoordinationResult<()>;

    /// Create a node named `<prefix><sequence>` where `sequence` is a
    /// zero-padded counter that strictly increases per parent. Returns the full path.
    async fn create_sequential_node(&self, prefix: &str, data: Bytes)
    -> CoordinationResult<String>;

    /// Read a node's data. Fails with `NotFound` when the node is absent.
    async fn read_node(&self, path: &str) -> CoordinationResult<Bytes>;

    /// Replace a node's data, creating the node when it is absent.
    async fn set_data(&self, path: &str, data: Bytes) -> CoordinationResult<()>;

    /// Replace the data only if it currently equals `expected`.
    ///
    /// Returns `Ok(false)` when the current value differs and `NotFound` when
    /// the node is absent.
    async fn test_and_replace(
        &self,
        path: &str,
        expected: &[u8],
        new: Bytes,
    ) -> CoordinationResult<bool>;

    /// Delete a node and everything below it. Deleting an absent node is not an error.
    async fn delete_recursive(&self, path: &str) -> CoordinationResult<()>;

    async fn exists(&self, path: &str) -> CoordinationResult<bool>;

    /// Names (not paths) of the direct children, sorted.
    async fn get_children(&self, path: &str) -> CoordinationResult<Vec<String>>;

    /// Subscribe to changes of `path` and its whole subtree.
    async fn watch(&self, path: &str) -> CoordinationResult<WatchSubscription>;

    /// Read a node as UTF-8 text.
    async fn read_string(&self, path: &str) -> CoordinationResult<String> {
        let data = self.read_node(path).await?;
        Ok(String::from_utf8_lossy(&data).into_owned())
    }
}
