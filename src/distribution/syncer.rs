//! Watch-driven mirror of a group's region tree.
//!
//! The [`RegionTreeSyncer`] keeps an in-memory [`RegionTree`] consistent with
//! the coordination store:
//!
//! ```text
//!   store ──watch(group)──▶ event task ──▶ sync_region() ──▶ new Arc<RegionTree>
//!                                              │                  │
//!                                              ▼                  ▼
//!                                        RegionIdMapper     callbacks + snapshot
//! ```
//!
//! Only two kinds of store events matter: a rewrite of the group's version
//! marker (the group was recreated, so everything is rebuilt) and a region's
//! `mutation` stamp (one region changed, so that region and the presence of its
//! children are re-read). All tree mutation happens under one async mutex;
//! readers take lock-free `Arc` snapshots that are never modified in place.
//!
//! Callbacks run synchronously on the event task, before the new snapshot is
//! published, and must not block.
//!
//! An event that still fails after the store retries is not dropped: the event
//! task re-reads the whole tree with backoff until the mirror matches the store
//! again. If that gives up too, the next store event triggers the resync.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, Weak};
use std::time::{Duration, Instant};

use backon::BackoffBuilder;
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::constants::REGION_EVENT_CHANNEL_CAPACITY;
use crate::hyperrectangle::Hyperrectangle;

use super::coordination::{CoordinationStore, WatchEvent, WatchEventKind, WatchSubscription};
use super::error::{CoordinationError, RegionError, RegionResult};
use super::id_mapper::RegionIdMapper;
use super::membership::NodeId;
use super::metrics;
use super::paths::{StorePaths, child_path, region_of_mutation_path};
use super::region::{Region, RegionId, RegionState, RegionTree};
use super::region_store::{RegionStore, StoredRegion};
use super::retry;

// =============================================================================
// Events and callbacks
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionEventKind {
    Added,
    Removed,
    Changed,
}

impl RegionEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegionEventKind::Added => "added",
            RegionEventKind::Removed => "removed",
            RegionEventKind::Changed => "changed",
        }
    }
}

impl fmt::Display for RegionEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A region that appeared, disappeared or changed in the mirrored tree.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionEvent {
    pub kind: RegionEventKind,
    pub region: Region,
}

impl RegionEvent {
    fn new(kind: RegionEventKind, region: Region) -> Self {
        Self { kind, region }
    }
}

/// Handle returned by [`RegionTreeSyncer::register_callback`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

pub type RegionCallback = Arc<dyn Fn(&RegionEvent) + Send + Sync>;

// =============================================================================
// Syncer
// =============================================================================

#[derive(Default)]
struct SyncState {
    /// Whether the version marker has been read at least once.
    loaded: bool,
    version: Option<String>,
    tree: Option<Arc<RegionTree>>,
    /// Last applied mutation stamp per region.
    versions: HashMap<RegionId, u64>,
    /// A failed event was never recovered from; resync before the next one.
    stale: bool,
}

pub struct RegionTreeSyncer {
    group: String,
    paths: StorePaths,
    store: Arc<dyn CoordinationStore>,
    region_store: RegionStore,
    local_node: Option<NodeId>,
    mapper: Arc<RegionIdMapper>,
    state: Mutex<SyncState>,
    /// Version marker of the published snapshot; `None` until the first load.
    published_version: std::sync::RwLock<Option<Option<String>>>,
    snapshots: watch::Sender<Option<Arc<RegionTree>>>,
    callbacks: std::sync::RwLock<Vec<(CallbackId, RegionCallback)>>,
    next_callback_id: AtomicU64,
    events: broadcast::Sender<RegionEvent>,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl fmt::Debug for RegionTreeSyncer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegionTreeSyncer")
            .field("group", &self.group)
            .field("local_node", &self.local_node)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl RegionTreeSyncer {
    /// Subscribe to the group, load the current tree and start the event task.
    pub async fn start(
        store: Arc<dyn CoordinationStore>,
        paths: StorePaths,
        group: impl Into<String>,
        local_node: Option<NodeId>,
        mapper: Arc<RegionIdMapper>,
    ) -> RegionResult<Arc<Self>> {
        let group = group.into();
        // Subscribe before the first read so no change falls in between.
        let subscription = store.watch(&paths.group_path(&group)).await?;

        let (snapshots, _) = watch::channel(None);
        let (events, _) = broadcast::channel(REGION_EVENT_CHANNEL_CAPACITY);
        let syncer = Arc::new(Self {
            group,
            paths,
            region_store: RegionStore::new(Arc::clone(&store)),
            store,
            local_node,
            mapper,
            state: Mutex::new(SyncState::default()),
            published_version: std::sync::RwLock::new(None),
            snapshots,
            callbacks: std::sync::RwLock::new(Vec::new()),
            next_callback_id: AtomicU64::new(1),
            events,
            task: std::sync::Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        let handle = tokio::spawn(Self::run(Arc::downgrade(&syncer), subscription));
        *syncer.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        syncer.root_node().await?;
        info!(group = %syncer.group, local_node = ?syncer.local_node, "Started region tree syncer");
        Ok(syncer)
    }

    async fn run(syncer: Weak<Self>, mut subscription: WatchSubscription) {
        while let Some(event) = subscription.next_event().await {
            let Some(syncer) = syncer.upgrade() else {
                break;
            };
            let result = if syncer.take_stale().await {
                syncer.resync().await
            } else {
                syncer.handle_event(&event).await
            };
            if let Err(e) = result {
                warn!(
                    group = %syncer.group,
                    path = %event.path,
                    error = %e,
                    "Failed to apply coordination store event"
                );
                syncer.recover().await;
            }
        }
        debug!(path = subscription.path(), "Region tree watch ended");
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn paths(&self) -> &StorePaths {
        &self.paths
    }

    pub fn local_node(&self) -> Option<&NodeId> {
        self.local_node.as_ref()
    }

    pub fn mapper(&self) -> &Arc<RegionIdMapper> {
        &self.mapper
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_running(&self) -> RegionResult<()> {
        if self.is_closed() {
            return Err(RegionError::Shutdown(self.group.clone()));
        }
        Ok(())
    }

    /// Current tree, rebuilt first if the group's version marker changed.
    ///
    /// Returns `None` when the group or its root region does not exist.
    /// Without an intervening change the same `Arc` is returned every time.
    pub async fn root_node(&self) -> RegionResult<Option<Arc<RegionTree>>> {
        self.ensure_running()?;
        let version = self.read_version().await?;
        if self.is_published(&version) {
            return Ok(self.snapshot());
        }

        let mut state = self.state.lock().await;
        self.check_version(&mut state).await?;
        Ok(state.tree.clone())
    }

    fn is_published(&self, version: &Option<String>) -> bool {
        self.published_version
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|published| published == version)
    }

    /// Last published tree, without touching the store.
    pub fn snapshot(&self) -> Option<Arc<RegionTree>> {
        self.snapshots.borrow().clone()
    }

    /// Store path of `id` in the current snapshot.
    pub fn region_path(&self, id: RegionId) -> RegionResult<String> {
        let tree = self
            .snapshot()
            .ok_or_else(|| RegionError::GroupNotFound(self.group.clone()))?;
        self.paths.region_path(&tree, id)
    }

    /// Re-read every region of the tree from the store.
    pub async fn refresh(&self) -> RegionResult<Option<Arc<RegionTree>>> {
        self.ensure_running()?;
        let mut state = self.state.lock().await;
        self.check_version(&mut state).await?;

        let Some(tree) = state.tree.clone() else {
            return Ok(None);
        };
        state.versions.clear();
        let ids: Vec<RegionId> = tree.iter().iter().map(|region| region.id).collect();
        for id in ids {
            let present = state.tree.as_ref().is_some_and(|current| current.contains(id));
            if present {
                self.sync_region(&mut state, id, false).await?;
            }
        }
        Ok(state.tree.clone())
    }

    /// Block until a published tree satisfies `predicate`.
    pub async fn wait_for<P>(
        &self,
        what: impl Into<String>,
        timeout: Duration,
        mut predicate: P,
    ) -> RegionResult<Arc<RegionTree>>
    where
        P: FnMut(&RegionTree) -> bool,
    {
        let mut snapshots = self.snapshots.subscribe();
        let waited = tokio::time::timeout(
            timeout,
            snapshots.wait_for(|tree| tree.as_deref().is_some_and(&mut predicate)),
        )
        .await;

        match waited {
            Ok(Ok(tree)) => Option::clone(&*tree)
                .ok_or_else(|| RegionError::GroupNotFound(self.group.clone())),
            Ok(Err(_)) => Err(RegionError::Shutdown(self.group.clone())),
            Err(_) => {
                metrics::WAIT_TIMEOUTS
                    .with_label_values(&["structure"])
                    .inc();
                Err(RegionError::Timeout {
                    what: what.into(),
                    waited: timeout,
                })
            }
        }
    }

    /// Block until `region` is in the tree with state `expected`.
    pub async fn wait_for_state(
        &self,
        region: RegionId,
        expected: RegionState,
        timeout: Duration,
    ) -> RegionResult<Arc<RegionTree>> {
        self.wait_for(
            format!("region {region} to reach state {expected}"),
            timeout,
            |tree| tree.get(region).is_some_and(|r| r.state == expected),
        )
        .await
    }

    /// Block until `region` is no longer in the tree.
    pub async fn wait_for_removal(
        &self,
        region: RegionId,
        timeout: Duration,
    ) -> RegionResult<Arc<RegionTree>> {
        self.wait_for(format!("region {region} to disappear"), timeout, |tree| {
            !tree.contains(region)
        })
        .await
    }

    pub fn register_callback<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(&RegionEvent) + Send + Sync + 'static,
    {
        let id = CallbackId(self.next_callback_id.fetch_add(1, Ordering::Relaxed));
        self.callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(callback)));
        id
    }

    /// Returns `false` if the callback was not registered.
    pub fn unregister_callback(&self, id: CallbackId) -> bool {
        let mut callbacks = self
            .callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = callbacks.len();
        callbacks.retain(|(registered, _)| *registered != id);
        callbacks.len() != before
    }

    /// Stream of region events. Slow receivers observe `Lagged`.
    pub fn subscribe(&self) -> broadcast::Receiver<RegionEvent> {
        self.events.subscribe()
    }

    /// Stop the event task. Later calls that touch the store fail with `Shutdown`.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
        self.callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        info!(group = %self.group, "Stopped region tree syncer");
    }

    // =========================================================================
    // Event handling
    // =========================================================================

    async fn take_stale(&self) -> bool {
        std::mem::take(&mut self.state.lock().await.stale)
    }

    /// Re-read the whole tree, rebuilding it when the group changed underneath.
    async fn resync(&self) -> RegionResult<()> {
        let mut state = self.state.lock().await;
        let version = self.read_version().await?;
        if !state.loaded || state.version != version || state.tree.is_none() {
            return self.reload(&mut state, version, "resync").await;
        }
        drop(state);
        self.refresh().await?;
        Ok(())
    }

    /// Resync with backoff after an event could not be applied.
    async fn recover(&self) {
        for delay in retry::resync_policy().build() {
            tokio::time::sleep(delay).await;
            if self.is_closed() {
                return;
            }
            match self.resync().await {
                Ok(()) => {
                    info!(group = %self.group, "Region tree resynchronized");
                    return;
                }
                Err(e) => {
                    debug!(group = %self.group, error = %e, ?delay, "Region tree resync failed");
                }
            }
        }
        warn!(group = %self.group, "Giving up region tree resync until the next store event");
        self.state.lock().await.stale = true;
    }

    async fn handle_event(&self, event: &WatchEvent) -> RegionResult<()> {
        if self.is_closed() {
            return Ok(());
        }

        if event.path == self.paths.group_version_path(&self.group) {
            metrics::SYNC_EVENTS.with_label_values(&["version"]).inc();
            let mut state = self.state.lock().await;
            return self.check_version(&mut state).await;
        }

        let Some(region_path) = region_of_mutation_path(&event.path) else {
            return Ok(());
        };
        // A deleted stamp means the region itself went away; its parent's
        // stamp reports that.
        if event.kind == WatchEventKind::Deleted {
            return Ok(());
        }

        metrics::SYNC_EVENTS.with_label_values(&["mutation"]).inc();
        trace!(group = %self.group, path = region_path, "Region mutation observed");
        let mut state = self.state.lock().await;
        self.sync_path(&mut state, region_path).await
    }

    async fn check_version(&self, state: &mut SyncState) -> RegionResult<()> {
        let version = self.read_version().await?;
        if state.loaded && state.version == version {
            return Ok(());
        }
        let reason = if state.loaded {
            "version-changed"
        } else {
            "initial"
        };
        self.reload(state, version, reason).await
    }

    /// Discard everything and load the tree from scratch.
    async fn reload(
        &self,
        state: &mut SyncState,
        version: Option<String>,
        reason: &str,
    ) -> RegionResult<()> {
        let started = Instant::now();
        let loaded = match version {
            Some(_) => self.load_tree().await?,
            None => None,
        };

        metrics::TREE_REBUILDS.with_label_values(&[reason]).inc();
        debug!(
            group = %self.group,
            reason,
            version = ?version,
            regions = loaded.as_ref().map_or(0, |(tree, _)| tree.len()),
            "Rebuilt region tree"
        );

        state.loaded = true;
        state.version = version;
        self.mapper.clear();

        let (tree, versions) = match loaded {
            Some((tree, versions)) => (Some(tree), versions),
            None => (None, HashMap::new()),
        };
        self.replace_tree(state, tree, versions);
        *self
            .published_version
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(state.version.clone());
        metrics::record_sync("tree", started.elapsed().as_secs_f64());
        Ok(())
    }

    async fn sync_path(&self, state: &mut SyncState, region_path: &str) -> RegionResult<()> {
        if !state.loaded {
            return self.check_version(state).await;
        }
        let Ok(numbers) = self.paths.child_numbers_from_path(&self.group, region_path) else {
            return Ok(());
        };

        let Some(tree) = state.tree.clone() else {
            // The root was incomplete when we last looked.
            let version = self.read_version().await?;
            return self.reload(state, version, "root-created").await;
        };

        // Sync the deepest region we already know on the way to the path.
        let mut target = tree.root_id();
        let mut resolved = true;
        for number in &numbers {
            match tree.child(target, *number) {
                Some(child) => target = child.id,
                None => {
                    resolved = false;
                    break;
                }
            }
        }
        self.sync_region(state, target, resolved).await
    }

    /// Re-read one region: its own data and which children exist.
    ///
    /// Children that are new (or were replaced under the same number) are
    /// loaded with their whole subtree; children that vanished are removed
    /// with theirs. With `skip_unchanged`, a region whose stamp was already
    /// applied is left alone.
    async fn sync_region(
        &self,
        state: &mut SyncState,
        id: RegionId,
        skip_unchanged: bool,
    ) -> RegionResult<()> {
        let started = Instant::now();
        let Some(tree) = state.tree.clone() else {
            return Ok(());
        };

        // Walk up until we find a region that still exists unchanged.
        let mut current = id;
        let (path, stored) = loop {
            let path = self.paths.region_path(&tree, current)?;
            match self.read_region(&path).await? {
                Some(stored) if stored.id == current => break (path, stored),
                _ => match tree.get(current).and_then(|region| region.parent) {
                    Some(parent) => current = parent,
                    None => {
                        let version = self.read_version().await?;
                        return self.reload(state, version, "root-replaced").await;
                    }
                },
            }
        };

        if skip_unchanged
            && current == id
            && state.versions.get(&current) == Some(&stored.mutation_version)
        {
            return Ok(());
        }

        let level = tree.region(current)?.level;
        let mut keep = BTreeSet::new();
        let mut loaded = Vec::new();
        for number in &stored.child_numbers {
            let child = child_path(&path, *number);
            if !self.region_store.is_complete(&child).await? {
                continue;
            }
            if let Some(existing) = tree.child(current, *number) {
                match self.region_store.read_region_id(&child).await {
                    Ok(child_id) if child_id == existing.id => {
                        keep.insert(*number);
                        continue;
                    }
                    Ok(_) => {}
                    Err(e) if e.is_not_found() => continue,
                    Err(e) => return Err(e),
                }
            }
            loaded.extend(self.load_subtree(child, current, *number, level + 1).await?);
        }

        let mut working = (*tree).clone();
        let mut events = Vec::new();

        if let Some(region) = working.region_mut(current) {
            if region.bounding_box != stored.bounding_box
                || region.state != stored.state
                || region.systems != stored.systems
            {
                region.bounding_box = stored.bounding_box.clone();
                region.state = stored.state;
                region.systems = stored.systems.clone();
                events.push(RegionEvent::new(RegionEventKind::Changed, region.clone()));
            }
        }

        let stale: Vec<RegionId> = working
            .region(current)?
            .children
            .iter()
            .filter(|(number, _)| !keep.contains(*number))
            .map(|(_, child)| *child)
            .collect();
        for child in stale {
            for removed in working.remove_subtree(child) {
                state.versions.remove(&removed.id);
                events.push(RegionEvent::new(RegionEventKind::Removed, removed));
            }
        }

        let mut added = Vec::with_capacity(loaded.len());
        for (region, version) in loaded {
            state.versions.insert(region.id, version);
            added.push(region.id);
            working.insert_child(region)?;
        }
        events.extend(
            added
                .into_iter()
                .filter_map(|id| working.get(id).cloned())
                .map(|region| RegionEvent::new(RegionEventKind::Added, region)),
        );

        state.versions.insert(current, stored.mutation_version);
        if !events.is_empty() {
            debug!(
                group = %self.group,
                region_id = %current,
                events = events.len(),
                "Synchronized region"
            );
            state.tree = Some(Arc::new(working));
            self.publish(state, events);
        }
        metrics::record_sync("region", started.elapsed().as_secs_f64());
        Ok(())
    }

    // =========================================================================
    // Loading
    // =========================================================================

    async fn read_version(&self) -> RegionResult<Option<String>> {
        let path = self.paths.group_version_path(&self.group);
        let result = retry::with_store_policy(
            || self.store.read_string(&path),
            |e: &CoordinationError| e.is_retriable(),
        )
        .await;
        match result {
            Ok(version) => Ok(Some(version)),
            Err(CoordinationError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_region(&self, path: &str) -> RegionResult<Option<StoredRegion>> {
        retry::with_store_policy(
            || self.region_store.read_region(path),
            |e: &RegionError| e.is_retriable(),
        )
        .await
    }

    fn region_from_stored(
        &self,
        stored: &StoredRegion,
        parent: Option<RegionId>,
        child_number: u32,
        level: u32,
    ) -> Region {
        Region {
            id: stored.id,
            group: self.group.clone(),
            child_number,
            parent,
            children: Default::default(),
            bounding_box: stored.bounding_box.clone(),
            state: stored.state,
            systems: stored.systems.clone(),
            level,
        }
    }

    /// Load a subtree breadth-first. Parents always precede their children.
    async fn load_subtree(
        &self,
        path: String,
        parent: RegionId,
        child_number: u32,
        level: u32,
    ) -> RegionResult<Vec<(Region, u64)>> {
        let mut loaded = Vec::new();
        let mut queue = VecDeque::from([(path, parent, child_number, level)]);

        while let Some((path, parent, child_number, level)) = queue.pop_front() {
            let Some(stored) = self.read_region(&path).await? else {
                continue;
            };
            for number in &stored.child_numbers {
                queue.push_back((child_path(&path, *number), stored.id, *number, level + 1));
            }
            loaded.push((
                self.region_from_stored(&stored, Some(parent), child_number, level),
                stored.mutation_version,
            ));
        }
        Ok(loaded)
    }

    async fn load_tree(&self) -> RegionResult<Option<(RegionTree, HashMap<RegionId, u64>)>> {
        let root_path = self.paths.root_region_path(&self.group);
        let Some(root) = self.read_region(&root_path).await? else {
            return Ok(None);
        };

        let mut versions = HashMap::new();
        versions.insert(root.id, root.mutation_version);
        let mut tree = RegionTree::with_root(self.region_from_stored(&root, None, 0, 0));

        for number in &root.child_numbers {
            let child = child_path(&root_path, *number);
            for (region, version) in self.load_subtree(child, root.id, *number, 1).await? {
                versions.insert(region.id, version);
                tree.insert_child(region)?;
            }
        }
        Ok(Some((tree, versions)))
    }

    // =========================================================================
    // Publishing
    // =========================================================================

    fn replace_tree(
        &self,
        state: &mut SyncState,
        tree: Option<RegionTree>,
        versions: HashMap<RegionId, u64>,
    ) {
        let mut events = Vec::new();
        if let Some(old) = state.tree.take() {
            // Reverse pre-order: every child before its parent.
            events.extend(
                old.iter()
                    .into_iter()
                    .rev()
                    .map(|region| RegionEvent::new(RegionEventKind::Removed, region.clone())),
            );
        }
        if let Some(new) = &tree {
            events.extend(
                new.iter()
                    .into_iter()
                    .map(|region| RegionEvent::new(RegionEventKind::Added, region.clone())),
            );
        }
        state.versions = versions;
        state.tree = tree.map(Arc::new);
        self.publish(state, events);
    }

    /// Mappings first, then callbacks, then the snapshot, so anyone woken by
    /// the snapshot observes every side effect of the change.
    fn publish(&self, state: &SyncState, events: Vec<RegionEvent>) {
        let tree = state.tree.clone();
        metrics::TREE_REGIONS
            .with_label_values(&[self.group.as_str()])
            .set(tree.as_ref().map_or(0, |tree| tree.len() as i64));

        self.update_mappings(tree.as_deref());
        for event in &events {
            self.dispatch(event);
        }
        self.snapshots.send_replace(tree);
    }

    /// Map every region the local node hosts in an active state, unmap the rest.
    fn update_mappings(&self, tree: Option<&RegionTree>) {
        let Some(local) = &self.local_node else {
            return;
        };

        let desired: HashMap<RegionId, &Hyperrectangle> = tree
            .map(|tree| {
                tree.regions_hosted_by(local)
                    .into_iter()
                    .filter(|region| region.state.is_active())
                    .map(|region| (region.id, &region.bounding_box))
                    .collect()
            })
            .unwrap_or_default();

        for mapped in self.mapper.all_region_ids() {
            let unchanged = desired
                .get(&mapped)
                .is_some_and(|bbox| self.mapper.bounding_box(mapped).as_ref() == Some(*bbox));
            if !unchanged {
                self.mapper.remove_mapping(mapped);
            }
        }
        for (id, bbox) in desired {
            self.mapper.add_mapping(id, bbox.clone());
        }
    }

    fn dispatch(&self, event: &RegionEvent) {
        metrics::REGION_EVENTS
            .with_label_values(&[event.kind.as_str()])
            .inc();

        let callbacks: Vec<RegionCallback> = self
            .callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        for callback in callbacks {
            callback(event);
        }
        // No receivers is fine.
        let _ = self.events.send(event.clone());
    }
}

impl Drop for RegionTreeSyncer {
    fn drop(&mut self) {
        if let Some(handle) = self
            .task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distribution::coordination::InMemoryCoordinationStore;
    use bytes::Bytes;

    const WAIT: Duration = Duration::from_secs(5);

    struct Fixture {
        store: Arc<InMemoryCoordinationStore>,
        paths: StorePaths,
        regions: RegionStore,
    }

    impl Fixture {
        fn new() -> Self {
            let store = Arc::new(InMemoryCoordinationStore::new());
            Self {
                regions: RegionStore::new(store.clone()),
                paths: StorePaths::new("test").unwrap(),
                store,
            }
        }

        async fn write_version(&self, version: &str) {
            self.store
                .set_data(
                    &self.paths.group_version_path("g"),
                    Bytes::from(version.to_string()),
                )
                .await
                .unwrap();
        }

        async fn write_region(&self, path: &str, id: u64, bbox: &Hyperrectangle) {
            self.regions
                .create_region_node(path, RegionId(id), bbox, RegionState::Active)
                .await
                .unwrap();
            self.regions.mark_mutation_complete(path).await.unwrap();
        }

        async fn syncer(&self, local: Option<&str>) -> Arc<RegionTreeSyncer> {
            RegionTreeSyncer::start(
                self.store.clone(),
                self.paths.clone(),
                "g",
                local.map(NodeId::from),
                Arc::new(RegionIdMapper::new("g")),
            )
            .await
            .unwrap()
        }
    }

    #[tokio::test]
    async fn test_absent_group_is_none() {
        let fixture = Fixture::new();
        let syncer = fixture.syncer(None).await;
        assert!(syncer.root_node().await.unwrap().is_none());
        assert!(syncer.snapshot().is_none());
    }

    #[tokio::test]
    async fn test_loads_existing_tree() {
        let fixture = Fixture::new();
        fixture.write_version("v1").await;
        let root = fixture.paths.root_region_path("g");
        let full = Hyperrectangle::full_space(1);
        let (left, right) = full.split_at(0, 0.0).unwrap();
        fixture.write_region(&root, 0, &full).await;
        fixture.write_region(&child_path(&root, 0), 1, &left).await;
        fixture.write_region(&child_path(&root, 1), 2, &right).await;

        let syncer = fixture.syncer(None).await;
        let tree = syncer.root_node().await.unwrap().unwrap();
        assert_eq!(tree.len(), 3);
        assert_eq!(tree.child(RegionId(0), 1).unwrap().id, RegionId(2));
        assert_eq!(tree.get(RegionId(1)).unwrap().level, 1);
    }

    #[tokio::test]
    async fn test_incomplete_child_is_ignored_until_marked() {
        let fixture = Fixture::new();
        fixture.write_version("v1").await;
        let root = fixture.paths.root_region_path("g");
        fixture.write_region(&root, 0, &Hyperrectangle::full_space(1)).await;
        let syncer = fixture.syncer(None).await;

        let child = child_path(&root, 0);
        fixture
            .regions
            .create_region_node(&child, RegionId(1), &Hyperrectangle::full_space(1), RegionState::Creating)
            .await
            .unwrap();
        fixture.regions.mark_mutation_complete(&root).await.unwrap();
        syncer.refresh().await.unwrap();
        assert_eq!(syncer.snapshot().unwrap().len(), 1);

        fixture.regions.mark_mutation_complete(&child).await.unwrap();
        syncer
            .wait_for("child to appear", WAIT, |tree| tree.contains(RegionId(1)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_local_mappings_follow_state() {
        let fixture = Fixture::new();
        fixture.write_version("v1").await;
        let root = fixture.paths.root_region_path("g");
        fixture.write_region(&root, 0, &Hyperrectangle::full_space(1)).await;
        let syncer = fixture.syncer(Some("n1")).await;
        assert!(syncer.mapper().is_empty());

        fixture.regions.add_system(&root, &NodeId::from("n1")).await.unwrap();
        syncer
            .mapper()
            .wait_until_mapping_appears(RegionId(0), WAIT)
            .await
            .unwrap();

        fixture.regions.set_state(&root, RegionState::Splitting).await.unwrap();
        syncer
            .mapper()
            .wait_until_mapping_disappears(RegionId(0), WAIT)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_times_out() {
        let fixture = Fixture::new();
        let syncer = fixture.syncer(None).await;
        let err = syncer
            .wait_for("never", Duration::from_millis(20), |_| true)
            .await
            .unwrap_err();
        assert!(matches!(err, RegionError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_shutdown_rejects_calls() {
        let fixture = Fixture::new();
        let syncer = fixture.syncer(None).await;
        syncer.shutdown();
        assert!(matches!(
            syncer.root_node().await,
            Err(RegionError::Shutdown(_))
        ));
    }
}
