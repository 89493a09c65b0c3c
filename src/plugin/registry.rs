//! Concurrent store of plugin records.
//!
//! Records live in a sharded map, each behind its own `RwLock`, so work on
//! one plugin never blocks lookups or calls on another. Lifecycle changes
//! for an id are serialized by a separate async transition lock held by
//! the manager across the whole operation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{
    env_prefix, Capability, DispatchGate, ErrorInfo, ErrorKind, Plugin, PluginError, PluginManifest,
    PluginRecord, PluginResult, PluginSnapshot, PluginState, RecordStats, ResolvedConfig,
    Transition,
};

#[derive(Debug)]
struct Slot {
    seq: u64,
    record: RwLock<PluginRecord>,
}

/// What a capability call needs from an ACTIVE record.
#[derive(Clone)]
pub struct DispatchTarget {
    pub instance: Arc<dyn Plugin>,
    pub gate: Arc<DispatchGate>,
    pub manifest: Arc<PluginManifest>,
}

/// Held transition lock for one id.
#[must_use = "the transition lock is released when the guard is dropped"]
pub struct TransitionGuard<'a> {
    registry: &'a PluginRegistry,
    id: String,
    lock: Arc<Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl std::fmt::Debug for TransitionGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransitionGuard").field("id", &self.id).finish()
    }
}

impl Drop for TransitionGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Two owners left means the map and this guard; a waiter holds a third.
        let records = &self.registry.records;
        self.registry.transition_locks.remove_if(&self.id, |id, lock| {
            Arc::ptr_eq(lock, &self.lock)
                && Arc::strong_count(lock) == 2
                && !records.contains_key(id)
        });
    }
}

/// Registry of loaded plugins, keyed by id.
#[derive(Debug, Default)]
pub struct PluginRegistry {
    records: DashMap<String, Arc<Slot>>,
    transition_locks: DashMap<String, Arc<Mutex<()>>>,
    admission: parking_lot::Mutex<()>,
    next_seq: AtomicU64,
}

impl PluginRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, id: &str) -> PluginResult<Arc<Slot>> {
        self.records
            .get(id)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| PluginError::NotFound(id.to_string()))
    }

    /// Acquire the transition lock for `id`.
    ///
    /// The lock entry is dropped with the last guard once `id` has no record,
    /// so unknown ids leave nothing behind.
    pub async fn lock_transitions(&self, id: &str) -> TransitionGuard<'_> {
        let lock = Arc::clone(
            self.transition_locks
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        );
        let guard = Arc::clone(&lock).lock_owned().await;
        TransitionGuard { registry: self, id: id.to_string(), lock, guard: Some(guard) }
    }

    /// Number of live transition lock entries.
    pub fn transition_lock_count(&self) -> usize {
        self.transition_locks.len()
    }

    /// Add a record; fails if the id is taken.
    ///
    /// Also fails when the id's `PLUGIN_<ID>_` variables would overlap
    /// another record's, as `open-ai` and `open_ai` or `ds` and `ds-x` do.
    pub fn insert(&self, record: PluginRecord) -> PluginResult<()> {
        let _admission = self.admission.lock();
        let id = record.id();
        if !self.records.contains_key(id) {
            if let Some(other) = self.env_prefix_clash(id) {
                return Err(PluginError::InvalidManifest(format!(
                    "plugin id '{id}' shares environment prefix {} with loaded plugin '{other}'",
                    env_prefix(id)
                )));
            }
        }
        match self.records.entry(id.to_string()) {
            Entry::Occupied(e) => Err(PluginError::AlreadyLoaded(e.key().clone())),
            Entry::Vacant(e) => {
                let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
                e.insert(Arc::new(Slot { seq, record: RwLock::new(record) }));
                Ok(())
            }
        }
    }

    fn env_prefix_clash(&self, id: &str) -> Option<String> {
        let prefix = env_prefix(id);
        self.records.iter().find_map(|entry| {
            let other = env_prefix(entry.key());
            (other.starts_with(&prefix) || prefix.starts_with(&other)).then(|| entry.key().clone())
        })
    }

    /// Add or replace a record, returning the replaced one's snapshot.
    ///
    /// A replacement keeps the original registration position.
    pub fn upsert(&self, record: PluginRecord) -> Option<PluginSnapshot> {
        let id = record.id().to_string();
        match self.records.entry(id) {
            Entry::Occupied(mut e) => {
                let seq = e.get().seq;
                let old = e.insert(Arc::new(Slot { seq, record: RwLock::new(record) }));
                let snapshot = old.record.read().snapshot();
                Some(snapshot)
            }
            Entry::Vacant(e) => {
                let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
                e.insert(Arc::new(Slot { seq, record: RwLock::new(record) }));
                None
            }
        }
    }

    /// Snapshot of one record.
    pub fn get(&self, id: &str) -> PluginResult<PluginSnapshot> {
        Ok(self.slot(id)?.record.read().snapshot())
    }

    /// Run `f` with read access to a record.
    pub fn with_record<T>(&self, id: &str, f: impl FnOnce(&PluginRecord) -> T) -> PluginResult<T> {
        let slot = self.slot(id)?;
        let record = slot.record.read();
        Ok(f(&record))
    }

    /// Current state of a record.
    pub fn state(&self, id: &str) -> PluginResult<PluginState> {
        self.with_record(id, PluginRecord::state)
    }

    /// Check if a record exists.
    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    /// Remove a record, returning its final snapshot.
    pub fn remove(&self, id: &str) -> Option<PluginSnapshot> {
        self.records.remove(id).map(|(_, slot)| slot.record.read().snapshot())
    }

    fn sorted_slots(&self) -> Vec<Arc<Slot>> {
        let mut slots: Vec<Arc<Slot>> = self.records.iter().map(|e| Arc::clone(e.value())).collect();
        slots.sort_by_key(|s| s.seq);
        slots
    }

    /// All records in registration order.
    pub fn list(&self) -> Vec<PluginSnapshot> {
        self.sorted_slots().iter().map(|s| s.record.read().snapshot()).collect()
    }

    /// ACTIVE records declaring `capability`, in registration order.
    pub fn list_by_capability(&self, capability: Capability) -> Vec<PluginSnapshot> {
        self.sorted_slots()
            .iter()
            .filter_map(|s| {
                let record = s.record.read();
                (record.state == PluginState::Active && record.manifest.has_capability(capability))
                    .then(|| record.snapshot())
            })
            .collect()
    }

    /// Records from `provider` in any state, in registration order.
    pub fn list_by_provider(&self, provider: &str) -> Vec<PluginSnapshot> {
        self.sorted_slots()
            .iter()
            .filter_map(|s| {
                let record = s.record.read();
                (record.manifest.provider == provider).then(|| record.snapshot())
            })
            .collect()
    }

    /// Ids of all records.
    pub fn ids(&self) -> Vec<String> {
        self.sorted_slots().iter().map(|s| s.record.read().id().to_string()).collect()
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Instance and gate of an ACTIVE record.
    pub fn dispatch_target(&self, id: &str) -> PluginResult<DispatchTarget> {
        let slot = self.slot(id)?;
        let record = slot.record.read();
        if record.state != PluginState::Active {
            return Err(PluginError::NotReady { plugin: id.to_string(), state: record.state });
        }
        let instance = record
            .instance
            .clone()
            .ok_or_else(|| PluginError::NotReady { plugin: id.to_string(), state: record.state })?;
        Ok(DispatchTarget {
            instance,
            gate: Arc::clone(&record.gate),
            manifest: Arc::clone(&record.manifest),
        })
    }

    /// Update call statistics. Never touches the lifecycle state.
    pub fn update_stats(&self, id: &str, f: impl FnOnce(&mut RecordStats)) {
        if let Ok(slot) = self.slot(id) {
            f(&mut slot.record.write().stats);
        }
    }

    /// Move `id` from `expected` to `next` without payload.
    ///
    /// Entering READY requires an instance; use [`apply`](Self::apply) for that.
    pub fn compare_and_swap_state(
        &self,
        id: &str,
        expected: PluginState,
        next: PluginState,
    ) -> PluginResult<()> {
        self.apply(id, expected, Transition::to(next)).map(|_| ())
    }

    /// Apply a transition if the record is in `expected` and the table allows it.
    ///
    /// Keeps the record invariants: an instance is held only in READY, ACTIVE
    /// and DISABLED, and `last_error` is set only in ERROR. An instance
    /// detached by the move is returned so the caller can clean it up.
    pub fn apply(
        &self,
        id: &str,
        expected: PluginState,
        transition: Transition,
    ) -> PluginResult<Option<Arc<dyn Plugin>>> {
        let slot = self.slot(id)?;
        let mut record = slot.record.write();
        let next = transition.to.unwrap_or(record.state);

        let invalid = |from: PluginState| PluginError::InvalidTransition {
            plugin: id.to_string(),
            from,
            requested: format!("move to {next}"),
        };

        if record.state != expected || !expected.can_transition_to(next) {
            return Err(invalid(record.state));
        }
        if next == PluginState::Unloaded {
            // UNLOADED is reached by removing the record.
            return Err(invalid(record.state));
        }

        let detached = if next.has_instance() {
            if record.instance.is_none() {
                record.instance = transition.instance;
            }
            if record.instance.is_none() {
                return Err(invalid(record.state));
            }
            None
        } else {
            record.instance.take()
        };

        if let Some(instance) = &record.instance {
            if !instance.reentrant() {
                record.gate.set_serialized(true);
            }
        }

        record.last_error = if next == PluginState::Error {
            Some(transition.error.unwrap_or_else(|| ErrorInfo {
                kind: ErrorKind::RuntimeFailure,
                message: format!("plugin '{id}' entered ERROR"),
            }))
        } else {
            None
        };

        if let Some(config) = transition.config {
            record.config = Some(config);
        }

        tracing::debug!(plugin_id = %id, from = %record.state, to = %next, "state transition");
        record.state = next;
        record.state_changed_at = Utc::now();

        Ok(detached)
    }

    /// Replace the config of a record holding an instance.
    pub fn set_config(&self, id: &str, config: ResolvedConfig) -> PluginResult<()> {
        let slot = self.slot(id)?;
        slot.record.write().config = Some(config);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::testing::StubPlugin;
    use std::path::PathBuf;

    fn manifest(id: &str, capability: Capability) -> Arc<PluginManifest> {
        Arc::new(
            serde_json::from_value(serde_json::json!({
                "id": id,
                "name": id,
                "version": "1.0.0",
                "capabilities": [{"type": capability.as_str()}]
            }))
            .unwrap(),
        )
    }

    fn record(id: &str) -> PluginRecord {
        PluginRecord::new(manifest(id, Capability::Embedding), PathBuf::from(format!("{id}.xpkg")))
    }

    fn record_in(id: &str, state: PluginState) -> PluginRecord {
        let mut r = record(id);
        r.state = state;
        if state.has_instance() {
            r.instance = Some(Arc::new(StubPlugin::new(id)));
        }
        if state == PluginState::Error {
            r.last_error = Some(PluginError::RuntimeFailure("boom".into()).info());
        }
        r
    }

    #[test]
    fn test_insert_rejects_duplicates() {
        let registry = PluginRegistry::new();
        registry.insert(record("a")).unwrap();
        assert!(matches!(registry.insert(record("a")), Err(PluginError::AlreadyLoaded(_))));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_get_not_found() {
        let registry = PluginRegistry::new();
        assert!(matches!(registry.get("ghost"), Err(PluginError::NotFound(_))));
    }

    #[test]
    fn test_upsert_keeps_position() {
        let registry = PluginRegistry::new();
        registry.insert(record("a")).unwrap();
        registry.insert(record("b")).unwrap();
        assert!(registry.upsert(record("a")).is_some());
        assert!(registry.upsert(record("c")).is_none());
        assert_eq!(registry.ids(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_transition_table_through_apply() {
        let movable: Vec<PluginState> =
            PluginState::ALL.into_iter().filter(|s| *s != PluginState::Unloaded).collect();

        for from in &movable {
            for to in &movable {
                let registry = PluginRegistry::new();
                registry.insert(record_in("p", *from)).unwrap();

                let t = Transition::to(*to).with_instance(Arc::new(StubPlugin::new("p")));
                let result = registry.apply("p", *from, t);

                if from.can_transition_to(*to) {
                    assert!(result.is_ok(), "{from} -> {to} should succeed");
                    let snapshot = registry.get("p").unwrap();
                    assert_eq!(snapshot.state, *to);
                    assert_eq!(snapshot.has_instance, to.has_instance());
                    assert_eq!(snapshot.last_error.is_some(), *to == PluginState::Error);
                } else {
                    assert!(
                        matches!(result, Err(PluginError::InvalidTransition { .. })),
                        "{from} -> {to} should be rejected"
                    );
                    assert_eq!(registry.state("p").unwrap(), *from);
                }
            }
        }
    }

    #[test]
    fn test_compare_and_swap_state() {
        let registry = PluginRegistry::new();
        registry.insert(record_in("p", PluginState::Ready)).unwrap();

        registry.compare_and_swap_state("p", PluginState::Ready, PluginState::Active).unwrap();
        assert!(matches!(
            registry.compare_and_swap_state("p", PluginState::Ready, PluginState::Active),
            Err(PluginError::InvalidTransition { .. })
        ));
        registry.compare_and_swap_state("p", PluginState::Active, PluginState::Disabled).unwrap();
        registry.compare_and_swap_state("p", PluginState::Disabled, PluginState::Active).unwrap();
    }

    #[test]
    fn test_ready_requires_instance() {
        let registry = PluginRegistry::new();
        registry.insert(record_in("p", PluginState::Initializing)).unwrap();
        assert!(registry
            .compare_and_swap_state("p", PluginState::Initializing, PluginState::Ready)
            .is_err());
    }

    #[test]
    fn test_unloading_detaches_instance() {
        let registry = PluginRegistry::new();
        registry.insert(record_in("p", PluginState::Active)).unwrap();
        let detached = registry
            .apply("p", PluginState::Active, Transition::to(PluginState::Unloading))
            .unwrap();
        assert!(detached.is_some());
        assert!(!registry.get("p").unwrap().has_instance);
    }

    #[test]
    fn test_list_by_capability_only_active() {
        let registry = PluginRegistry::new();
        registry.insert(record_in("a", PluginState::Active)).unwrap();
        registry.insert(record_in("b", PluginState::Ready)).unwrap();
        registry.insert(record_in("c", PluginState::Active)).unwrap();

        let mut chat = PluginRecord::new(manifest("d", Capability::Chat), PathBuf::from("d"));
        chat.state = PluginState::Active;
        chat.instance = Some(Arc::new(StubPlugin::new("d")));
        registry.insert(chat).unwrap();

        let ids: Vec<String> =
            registry.list_by_capability(Capability::Embedding).into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[test]
    fn test_env_prefix_clash_rejected() {
        let registry = PluginRegistry::new();
        registry.insert(record("open-ai")).unwrap();
        registry.insert(record("ds")).unwrap();

        for id in ["open_ai", "open.ai", "ds-x", "open-ai-v2"] {
            let err = registry.insert(record(id)).unwrap_err();
            assert!(matches!(err, PluginError::InvalidManifest(_)), "{id}");
        }
        assert!(matches!(registry.insert(record("ds")), Err(PluginError::AlreadyLoaded(_))));

        registry.insert(record("dsx")).unwrap();
        assert_eq!(registry.ids(), vec!["open-ai", "ds", "dsx"]);

        registry.remove("ds");
        registry.insert(record("ds-x")).unwrap();
    }

    #[test]
    fn test_list_by_provider_any_state() {
        let registry = PluginRegistry::new();
        for (id, provider, state) in [
            ("ds-embed", "dashscope", PluginState::Active),
            ("oa-chat", "openai", PluginState::Active),
            ("ds-rerank", "dashscope", PluginState::Error),
            ("ds-chat", "dashscope", PluginState::Disabled),
        ] {
            let mut r = record_in(id, state);
            let mut m = (*r.manifest).clone();
            m.provider = provider.to_string();
            r.manifest = Arc::new(m);
            registry.insert(r).unwrap();
        }

        let ids: Vec<String> =
            registry.list_by_provider("dashscope").into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["ds-embed", "ds-rerank", "ds-chat"]);
        assert!(registry.list_by_provider("cohere").is_empty());
    }

    #[test]
    fn test_dispatch_target_requires_active() {
        let registry = PluginRegistry::new();
        registry.insert(record_in("p", PluginState::Ready)).unwrap();
        assert!(matches!(registry.dispatch_target("p"), Err(PluginError::NotReady { .. })));
        registry.compare_and_swap_state("p", PluginState::Ready, PluginState::Active).unwrap();
        assert!(registry.dispatch_target("p").is_ok());
    }

    #[tokio::test]
    async fn test_transition_locks_for_unknown_ids_are_released() {
        let registry = PluginRegistry::new();
        for i in 0..1000 {
            let id = format!("ghost-{i}");
            let _guard = registry.lock_transitions(&id).await;
            assert!(matches!(registry.state(&id), Err(PluginError::NotFound(_))));
        }
        assert_eq!(registry.len(), 0);
        assert_eq!(registry.transition_lock_count(), 0);
    }

    #[tokio::test]
    async fn test_transition_lock_kept_while_record_exists() {
        let registry = PluginRegistry::new();
        {
            let _guard = registry.lock_transitions("p").await;
            registry.insert(record("p")).unwrap();
        }
        assert_eq!(registry.transition_lock_count(), 1);

        {
            let _guard = registry.lock_transitions("p").await;
            registry.remove("p");
        }
        assert_eq!(registry.transition_lock_count(), 0);
    }

    #[tokio::test]
    async fn test_transition_lock_kept_for_waiter() {
        let registry = Arc::new(PluginRegistry::new());
        let guard = registry.lock_transitions("p").await;

        let r = Arc::clone(&registry);
        let waiter = tokio::spawn(async move {
            let _g = r.lock_transitions("p").await;
            r.transition_lock_count()
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        drop(guard);

        // The waiter locked the same entry, so it was still present.
        assert_eq!(waiter.await.unwrap(), 1);
        assert_eq!(registry.transition_lock_count(), 0);
    }

    #[tokio::test]
    async fn test_transition_lock_serializes() {
        let registry = Arc::new(PluginRegistry::new());
        let guard = registry.lock_transitions("p").await;

        let r = Arc::clone(&registry);
        let waiter = tokio::spawn(async move {
            let _g = r.lock_transitions("p").await;
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        let _other = registry.lock_transitions("q").await;
        drop(guard);
        waiter.await.unwrap();
    }
}
