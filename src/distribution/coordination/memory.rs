//! In-memory coordination store.
//!
//! A complete implementation of [`CoordinationStore`] backed by an ordered map.
//! Clones share the same state, so several partitioners, syncers and
//! allocators in one process can observe each other's writes exactly as
//! separate processes would through a real store.
//!
//! Besides the store contract it offers a few hooks for tests: write counting,
//! a dump of all paths, and failure injection for reads or writes of paths
//! containing a fragment.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{RwLock, mpsc};
use tracing::trace;

use super::{CoordinationStore, WatchEvent, WatchEventKind, WatchSubscription};
use crate::distribution::error::{CoordinationError, CoordinationResult};

/// Node table and per-parent sequence counters.
#[derive(Debug, Default)]
struct StoreState {
    nodes: BTreeMap<String, Bytes>,
    sequences: HashMap<String, u64>,
}

#[derive(Debug)]
struct Watcher {
    prefix: String,
    sender: mpsc::UnboundedSender<WatchEvent>,
}

impl Watcher {
    fn covers(&self, path: &str) -> bool {
        path == self.prefix
            || (path.starts_with(&self.prefix)
                && path.as_bytes().get(self.prefix.len()) == Some(&b'/'))
            || self.prefix == "/"
    }
}

/// Injected failure: reads or writes whose path contains `fragment` fail.
#[derive(Debug, Clone)]
struct FailureRule {
    fragment: String,
    reads: bool,
    remaining: usize,
    error: CoordinationError,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryCoordinationStore {
    state: Arc<RwLock<StoreState>>,
    watchers: Arc<Mutex<Vec<Watcher>>>,
    failures: Arc<Mutex<Vec<FailureRule>>>,
    /// Number of successful write operations
    writes: Arc<AtomicU64>,
    closed: Arc<AtomicBool>,
}

impl InMemoryCoordinationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful write calls since creation.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Every path currently stored, in order.
    pub async fn paths(&self) -> Vec<String> {
        self.state.read().await.nodes.keys().cloned().collect()
    }

    /// Paths at or below `prefix`.
    pub async fn paths_under(&self, prefix: &str) -> Vec<String> {
        let state = self.state.read().await;
        state
            .nodes
            .keys()
            .filter(|path| is_at_or_below(path, prefix))
            .cloned()
            .collect()
    }

    /// Make the next `times` writes to a path containing `fragment` fail with `error`.
    pub fn fail_writes_matching(
        &self,
        fragment: impl Into<String>,
        times: usize,
        error: CoordinationError,
    ) {
        self.push_failure(fragment.into(), false, times, error);
    }

    /// Make the next `times` reads of a path containing `fragment` fail with `error`.
    pub fn fail_reads_matching(
        &self,
        fragment: impl Into<String>,
        times: usize,
        error: CoordinationError,
    ) {
        self.push_failure(fragment.into(), true, times, error);
    }

    fn push_failure(&self, fragment: String, reads: bool, times: usize, error: CoordinationError) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.push(FailureRule {
                fragment,
                reads,
                remaining: times,
                error,
            });
        }
    }

    pub fn clear_failures(&self) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.clear();
        }
    }

    /// Close the store: all calls fail with `Closed` and watches end.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Ok(mut watchers) = self.watchers.lock() {
            watchers.clear();
        }
    }

    pub fn watcher_count(&self) -> usize {
        self.watchers
            .lock()
            .map(|mut watchers| {
                watchers.retain(|w| !w.sender.is_closed());
                watchers.len()
            })
            .unwrap_or(0)
    }

    fn check_open(&self) -> CoordinationResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CoordinationError::Closed);
        }
        Ok(())
    }

    fn check_injected_failure(&self, path: &str, reads: bool) -> CoordinationResult<()> {
        let Ok(mut failures) = self.failures.lock() else {
            return Ok(());
        };
        if let Some(rule) = failures
            .iter_mut()
            .find(|rule| rule.reads == reads && rule.remaining > 0 && path.contains(&rule.fragment))
        {
            rule.remaining -= 1;
            return Err(rule.error.clone());
        }
        failures.retain(|rule| rule.remaining > 0);
        Ok(())
    }

    fn before_write(&self, path: &str) -> CoordinationResult<()> {
        self.check_open()?;
        validate_path(path)?;
        self.check_injected_failure(path, false)
    }

    fn after_write(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }

    /// Deliver events to every watcher covering their path.
    ///
    /// Called while the state lock is held so all watchers observe writes in
    /// the order they were applied.
    fn dispatch(&self, events: Vec<WatchEvent>) {
        if events.is_empty() {
            return;
        }
        let Ok(mut watchers) = self.watchers.lock() else {
            return;
        };
        watchers.retain(|watcher| !watcher.sender.is_closed());
        for event in events {
            trace!(path = %event.path, kind = ?event.kind, "Dispatching watch event");
            for watcher in watchers.iter().filter(|w| w.covers(&event.path)) {
                let _ = watcher.sender.send(event.clone());
            }
        }
    }
}

fn validate_path(path: &str) -> CoordinationResult<()> {
    let valid = path.starts_with('/')
        && (path == "/" || !path.ends_with('/'))
        && !path.contains("//");
    if !valid {
        return Err(CoordinationError::InvalidPath(path.to_string()));
    }
    Ok(())
}

fn is_at_or_below(path: &str, prefix: &str) -> bool {
    path == prefix
        || (path.starts_with(prefix) && path.as_bytes().get(prefix.len()) == Some(&b'/'))
}

fn parent_of(path: &str) -> Option<&str> {
    match path.rfind('/') {
        Some(0) if path.len() > 1 => Some("/"),
        Some(0) | None => None,
        Some(idx) => Some(&path[..idx]),
    }
}

/// Insert empty ancestors of `path` that do not exist yet.
fn create_ancestors(state: &mut StoreState, path: &str, events: &mut Vec<WatchEvent>) {
    let mut missing = Vec::new();
    let mut current = parent_of(path);
    while let Some(parent) = current {
        if parent == "/" || state.nodes.contains_key(parent) {
            break;
        }
        missing.push(parent.to_string());
        current = parent_of(parent);
    }
    for ancestor in missing.into_iter().rev() {
        state.nodes.insert(ancestor.clone(), Bytes::new());
        events.push(WatchEvent::new(ancestor, WatchEventKind::Created));
    }
}

#[async_trait]
impl CoordinationStore for InMemoryCoordinationStore {
    async fn create_node(&self, path: &str, data: Bytes) -> CoordinationResult<()> {
        self.before_write(path)?;
        let mut state = self.state.write().await;
        if state.nodes.contains_key(path) {
            return Err(CoordinationError::NodeExists(path.to_string()));
        }

        let mut events = Vec::new();
        create_ancestors(&mut state, path, &mut events);
        state.nodes.insert(path.to_string(), data);
        events.push(WatchEvent::new(path, WatchEventKind::Created));

        self.dispatch(events);
        self.after_write();
        Ok(())
    }

    async fn create_sequential_node(
        &self,
        prefix: &str,
        data: Bytes,
    ) -> CoordinationResult<String> {
        self.before_write(prefix)?;
        let parent = parent_of(prefix)
            .ok_or_else(|| CoordinationError::InvalidPath(prefix.to_string()))?
            .to_string();

        let mut state = self.state.write().await;
        let sequence = state.sequences.entry(parent).or_insert(0);
        let path = format!("{prefix}{:010}", *sequence);
        *sequence += 1;

        let mut events = Vec::new();
        create_ancestors(&mut state, &path, &mut events);
        state.nodes.insert(path.clone(), data);
        events.push(WatchEvent::new(path.clone(), WatchEventKind::Created));

        self.dispatch(events);
        self.after_write();
        Ok(path)
    }

    async fn read_node(&self, path: &str) -> CoordinationResult<Bytes> {
        self.check_open()?;
        self.check_injected_failure(path, true)?;
        self.state
            .read()
            .await
            .nodes
            .get(path)
            .cloned()
            .ok_or_else(|| CoordinationError::NotFound(path.to_string()))
    }

    async fn set_data(&self, path: &str, data: Bytes) -> CoordinationResult<()> {
        self.before_write(path)?;
        let mut state = self.state.write().await;

        let mut events = Vec::new();
        let kind = if state.nodes.contains_key(path) {
            WatchEventKind::DataChanged
        } else {
            create_ancestors(&mut state, path, &mut events);
            WatchEventKind::Created
        };
        state.nodes.insert(path.to_string(), data);
        events.push(WatchEvent::new(path, kind));

        self.dispatch(events);
        self.after_write();
        Ok(())
    }

    async fn test_and_replace(
        &self,
        path: &str,
        expected: &[u8],
        new: Bytes,
    ) -> CoordinationResult<bool> {
        self.before_write(path)?;
        let mut state = self.state.write().await;
        let current = state
            .nodes
            .get_mut(path)
            .ok_or_else(|| CoordinationError::NotFound(path.to_string()))?;

        if current.as_ref() != expected {
            return Ok(false);
        }
        *current = new;

        self.dispatch(vec![WatchEvent::new(path, WatchEventKind::DataChanged)]);
        self.after_write();
        Ok(true)
    }

    async fn delete_recursive(&self, path: &str) -> CoordinationResult<()> {
        self.before_write(path)?;
        let mut state = self.state.write().await;

        let doomed: Vec<String> = state
            .nodes
            .range(path.to_string()..)
            .map(|(key, _)| key)
            .take_while(|key| key.starts_with(path))
            .filter(|key| is_at_or_below(key, path))
            .cloned()
            .collect();

        if doomed.is_empty() {
            return Ok(());
        }

        // Deepest nodes first, matching a bottom-up recursive delete.
        let mut events = Vec::with_capacity(doomed.len());
        for key in doomed.iter().rev() {
            state.nodes.remove(key);
            events.push(WatchEvent::new(key.clone(), WatchEventKind::Deleted));
        }
        state
            .sequences
            .retain(|parent, _| !is_at_or_below(parent, path));

        self.dispatch(events);
        self.after_write();
        Ok(())
    }

    async fn exists(&self, path: &str) -> CoordinationResult<bool> {
        self.check_open()?;
        Ok(self.state.read().await.nodes.contains_key(path))
    }

    async fn get_children(&self, path: &str) -> CoordinationResult<Vec<String>> {
        self.check_open()?;
        let state = self.state.read().await;
        if path != "/" && !state.nodes.contains_key(path) {
            return Err(CoordinationError::NotFound(path.to_string()));
        }

        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };
        let children = state
            .nodes
            .range(prefix.clone()..)
            .map(|(key, _)| key)
            .take_while(|key| key.starts_with(&prefix))
            .filter_map(|key| {
                let rest = &key[prefix.len()..];
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
            })
            .collect();
        Ok(children)
    }

    async fn watch(&self, path: &str) -> CoordinationResult<WatchSubscription> {
        self.check_open()?;
        validate_path(path)?;
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut watchers = self
            .watchers
            .lock()
            .map_err(|_| CoordinationError::Unavailable("watch registry poisoned".to_string()))?;
        watchers.push(Watcher {
            prefix: path.to_string(),
            sender,
        });
        Ok(WatchSubscription::new(path, receiver))
    }
}
