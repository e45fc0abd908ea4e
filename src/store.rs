//! A caching, auto-creating store of switches over a pluggable [`Backend`].
//!
//! The cache is a read accelerator, not a source of truth. Writes go straight to the backend and
//! replace the local cache entry, so a process always observes its own writes. Writes made by
//! other stores sharing the backend are picked up according to the [`RefreshPolicy`].
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
    time::Instant,
};

use crate::{
    backend::Backend,
    config::{RefreshPolicy, SwitchDefaults},
    switch::Conditions,
    Error, Result, Switch, SwitchStatus,
};

/// Notification fired after a switch was written or removed.
#[derive(Debug, Clone)]
pub enum SwitchChange {
    /// The switch was created or updated.
    Saved(Arc<Switch>),
    /// The switch with this key was deleted.
    Deleted(String),
}

impl SwitchChange {
    /// Key of the switch that changed.
    pub fn key(&self) -> &str {
        match self {
            SwitchChange::Saved(switch) => &switch.key,
            SwitchChange::Deleted(key) => key,
        }
    }
}

/// Receives [`SwitchChange`] notifications, e.g. to invalidate caches living next to the store.
///
/// Listeners run on the writing thread after the backend write succeeded, and may call back into
/// the store.
pub trait SwitchListener: Send + Sync {
    /// Called once per change.
    fn on_change(&self, change: &SwitchChange);
}

impl<T: Fn(&SwitchChange) + Send + Sync> SwitchListener for T {
    fn on_change(&self, change: &SwitchChange) {
        self(change);
    }
}

struct Cache {
    /// `None` entries remember that the backend has no such switch.
    switches: HashMap<String, Option<Arc<Switch>>>,
    generation: Option<u64>,
    refreshed_at: Instant,
    /// Bumped on every local write and invalidation. A backend read only lands in the cache if
    /// the epoch did not move while it was in flight.
    epoch: u64,
}

impl Cache {
    fn touch(&mut self) {
        self.epoch = self.epoch.wrapping_add(1);
    }
}

/// `SwitchStore` provides thread-safe (`Sync`) cached access to switches.
pub struct SwitchStore {
    backend: Arc<dyn Backend>,
    auto_create: bool,
    switch_defaults: SwitchDefaults,
    refresh_policy: RefreshPolicy,
    cache: RwLock<Cache>,
    listeners: RwLock<Vec<Arc<dyn SwitchListener>>>,
}

impl SwitchStore {
    /// Create a store over `backend` with auto-creation enabled and no defaults table.
    pub fn new(backend: Arc<dyn Backend>) -> SwitchStore {
        SwitchStore {
            backend,
            auto_create: true,
            switch_defaults: SwitchDefaults::new(),
            refresh_policy: RefreshPolicy::default(),
            cache: RwLock::new(Cache {
                switches: HashMap::new(),
                generation: None,
                refreshed_at: Instant::now(),
                epoch: 0,
            }),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Whether [`SwitchStore::get`] creates missing switches.
    pub fn with_auto_create(mut self, auto_create: bool) -> SwitchStore {
        self.auto_create = auto_create;
        self
    }

    /// Status, label, and description of switches created on first access.
    pub fn with_switch_defaults(mut self, switch_defaults: SwitchDefaults) -> SwitchStore {
        self.switch_defaults = switch_defaults;
        self
    }

    /// How writes made by other stores over the same backend are picked up.
    pub fn with_refresh_policy(mut self, refresh_policy: RefreshPolicy) -> SwitchStore {
        self.refresh_policy = refresh_policy;
        self
    }

    /// Register a listener fired after every save and delete made through this store.
    pub fn subscribe(&self, listener: impl SwitchListener + 'static) {
        self.listeners
            .write()
            .expect("thread holding listeners lock should not panic")
            .push(Arc::new(listener));
    }

    /// Get a switch, creating and persisting it when missing and auto-creation is enabled.
    ///
    /// New switches take status, label, and description from the defaults table; keys without a
    /// table entry are created `Global`.
    pub fn get(&self, key: &str) -> Result<Arc<Switch>> {
        if let Some(switch) = self.find(key)? {
            return Ok(switch);
        }
        if !self.auto_create {
            return Err(Error::SwitchNotFound(key.to_owned()));
        }
        self.create(key)
    }

    /// Get a switch for evaluation.
    ///
    /// Unlike [`SwitchStore::get`], only keys listed in the defaults table are auto-created; any
    /// other missing key yields `None` so evaluation can fall back to the caller's default.
    pub fn lookup(&self, key: &str) -> Result<Option<Arc<Switch>>> {
        if let Some(switch) = self.find(key)? {
            return Ok(Some(switch));
        }
        if self.auto_create && self.switch_defaults.contains_key(key) {
            return self.create(key).map(Some);
        }
        Ok(None)
    }

    /// Existence check that never auto-creates.
    pub fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.find(key)?.is_some())
    }

    /// Every stored switch, ordered by key. Reloads and warms the whole cache.
    pub fn list(&self) -> Result<Vec<Arc<Switch>>> {
        self.refresh()?;
        let cache = self.read_cache();
        let mut switches = cache
            .switches
            .values()
            .flatten()
            .cloned()
            .collect::<Vec<_>>();
        switches.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(switches)
    }

    /// Insert or replace a switch.
    pub fn save(&self, switch: Switch) -> Result<Arc<Switch>> {
        self.backend.save(&switch)?;
        let switch = Arc::new(switch);
        {
            let mut cache = self.write_cache();
            cache.switches.insert(switch.key.clone(), Some(switch.clone()));
            cache.touch();
        }

        log::debug!(target: "switchyard", switch:serde; "saved switch");
        self.notify(&SwitchChange::Saved(switch.clone()));
        Ok(switch)
    }

    /// Load the current persisted state of `key`, apply `f`, and persist the result.
    ///
    /// Missing switches are created first, from the defaults table if listed. Writing always
    /// creates: auto-creation only governs reads. Concurrent updates of the same key are
    /// last-write-wins.
    pub fn update<R>(
        &self,
        key: &str,
        f: impl FnOnce(&mut Switch) -> Result<R>,
    ) -> Result<(Arc<Switch>, R)> {
        let mut switch = match self.backend.load(key)? {
            Some(switch) => switch,
            None => self.default_switch(key),
        };
        let result = f(&mut switch)?;
        let switch = self.save(switch)?;
        Ok((switch, result))
    }

    /// Change the status of a switch.
    pub fn set_status(&self, key: &str, status: SwitchStatus) -> Result<Arc<Switch>> {
        self.update(key, |switch| {
            switch.status = status;
            Ok(())
        })
        .map(|(switch, ())| switch)
    }

    /// Replace all stored conditions of a switch.
    pub fn set_conditions(&self, key: &str, conditions: Conditions) -> Result<Arc<Switch>> {
        self.update(key, |switch| {
            switch.conditions = conditions;
            Ok(())
        })
        .map(|(switch, ())| switch)
    }

    /// Remove all stored conditions of a switch.
    pub fn clear_conditions(&self, key: &str) -> Result<Arc<Switch>> {
        self.set_conditions(key, Conditions::new())
    }

    /// Remove a switch from the backend and the cache.
    pub fn delete(&self, key: &str) -> Result<()> {
        self.backend.delete(key)?;
        {
            let mut cache = self.write_cache();
            cache.switches.insert(key.to_owned(), None);
            cache.touch();
        }

        log::debug!(target: "switchyard", key; "deleted switch");
        self.notify(&SwitchChange::Deleted(key.to_owned()));
        Ok(())
    }

    /// Reload the whole table from the backend, replacing the cache.
    ///
    /// If this store wrote while the table was being read, the snapshot may predate that write:
    /// the cache is emptied instead and entries are reloaded one by one.
    pub fn refresh(&self) -> Result<()> {
        let epoch = self.read_cache().epoch;
        let generation = self.backend.generation()?;
        let switches = self.backend.list_all()?;

        let mut cache = self.write_cache();
        cache.refreshed_at = Instant::now();
        if cache.epoch != epoch {
            log::debug!(target: "switchyard", generation; "switches written during reload, dropping cached switches");
            cache.switches.clear();
            cache.generation = None;
            cache.touch();
            return Ok(());
        }
        cache.switches = switches
            .into_iter()
            .map(|switch| (switch.key.clone(), Some(Arc::new(switch))))
            .collect();
        cache.generation = Some(generation);

        log::debug!(target: "switchyard", generation, count = cache.switches.len(); "reloaded switches");
        Ok(())
    }

    /// Drop the cached entry for `key`.
    pub fn invalidate(&self, key: &str) {
        let mut cache = self.write_cache();
        cache.switches.remove(key);
        cache.touch();
    }

    /// Drop every cached entry.
    pub fn clear_cache(&self) {
        let mut cache = self.write_cache();
        cache.switches.clear();
        cache.touch();
    }

    fn find(&self, key: &str) -> Result<Option<Arc<Switch>>> {
        self.sync()?;

        let epoch = {
            let cache = self.read_cache();
            if let Some(entry) = cache.switches.get(key) {
                return Ok(entry.clone());
            }
            cache.epoch
        };

        let switch = self.backend.load(key)?.map(Arc::new);
        log::trace!(target: "switchyard", key, found = switch.is_some(); "loaded switch from backend");

        let mut cache = self.write_cache();
        if cache.epoch == epoch {
            cache.switches.insert(key.to_owned(), switch.clone());
            return Ok(switch);
        }
        // A local write landed during the load; whatever it left in the cache is newer.
        match cache.switches.get(key) {
            Some(entry) => Ok(entry.clone()),
            None => Ok(switch),
        }
    }

    fn create(&self, key: &str) -> Result<Arc<Switch>> {
        log::debug!(target: "switchyard", key; "auto-creating switch");
        self.save(self.default_switch(key))
    }

    fn default_switch(&self, key: &str) -> Switch {
        match self.switch_defaults.get(key) {
            Some(default) => Switch {
                label: default.label.clone(),
                description: default.description.clone(),
                ..Switch::new(key, default.status())
            },
            None => Switch::new(key, SwitchStatus::Global),
        }
    }

    /// Apply the refresh policy before serving a read.
    fn sync(&self) -> Result<()> {
        match self.refresh_policy {
            RefreshPolicy::Never => Ok(()),
            RefreshPolicy::OnGenerationChange => {
                let generation = self.backend.generation()?;
                if self.read_cache().generation == Some(generation) {
                    return Ok(());
                }
                let mut cache = self.write_cache();
                if cache.generation != Some(generation) {
                    log::debug!(target: "switchyard", generation; "backend changed, dropping cached switches");
                    cache.switches.clear();
                    cache.generation = Some(generation);
                    cache.touch();
                }
                Ok(())
            }
            RefreshPolicy::Interval(interval) => {
                if self.read_cache().refreshed_at.elapsed() >= interval {
                    self.refresh()?;
                }
                Ok(())
            }
        }
    }

    fn notify(&self, change: &SwitchChange) {
        let listeners = self
            .listeners
            .read()
            .expect("thread holding listeners lock should not panic")
            .clone();
        for listener in listeners {
            listener.on_change(change);
        }
    }

    fn read_cache(&self) -> std::sync::RwLockReadGuard<'_, Cache> {
        // self.cache.read() should always return Ok(). Err() is possible only if the lock is
        // poisoned (writer panicked while holding the lock), which should never happen.
        self.cache
            .read()
            .expect("thread holding cache lock should not panic")
    }

    fn write_cache(&self) -> std::sync::RwLockWriteGuard<'_, Cache> {
        self.cache
            .write()
            .expect("thread holding cache lock should not panic")
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            mpsc, Arc, Mutex,
        },
        time::Duration,
    };

    use super::{SwitchChange, SwitchStore};
    use crate::{
        backend::{Backend, MemoryBackend},
        config::{RefreshPolicy, SwitchDefault, SwitchDefaults},
        Error, Result, Switch, SwitchStatus,
    };

    fn store_over(backend: &Arc<MemoryBackend>) -> SwitchStore {
        SwitchStore::new(backend.clone())
    }

    #[test]
    fn get_auto_creates_global_switch() {
        let backend = Arc::new(MemoryBackend::new());
        let store = store_over(&backend);

        assert!(!store.contains("test").unwrap());
        let switch = store.get("test").unwrap();
        assert_eq!(switch.status, SwitchStatus::Global);
        assert!(backend.load("test").unwrap().is_some());
        assert!(store.contains("test").unwrap());
    }

    #[test]
    fn get_without_auto_create_fails() {
        let store = SwitchStore::new(Arc::new(MemoryBackend::new())).with_auto_create(false);
        assert!(matches!(store.get("test"), Err(Error::SwitchNotFound(key)) if key == "test"));
        assert!(store.lookup("test").unwrap().is_none());
    }

    #[test]
    fn lookup_only_creates_from_defaults_table() {
        let store = SwitchStore::new(Arc::new(MemoryBackend::new())).with_switch_defaults(
            SwitchDefaults::from([(
                "inactive_by_default".to_owned(),
                SwitchDefault {
                    is_active: false,
                    label: Some("Default Inactive".to_owned()),
                    description: None,
                },
            )]),
        );

        assert!(store.lookup("unknown").unwrap().is_none());
        assert!(!store.contains("unknown").unwrap());

        let switch = store.lookup("inactive_by_default").unwrap().unwrap();
        assert_eq!(switch.status, SwitchStatus::Disabled);
        assert_eq!(switch.label.as_deref(), Some("Default Inactive"));
        assert!(store.contains("inactive_by_default").unwrap());
    }

    #[test]
    fn own_writes_are_visible_immediately() {
        let store = SwitchStore::new(Arc::new(MemoryBackend::new()))
            .with_refresh_policy(RefreshPolicy::Never);

        store.save(Switch::new("test", SwitchStatus::Disabled)).unwrap();
        assert_eq!(store.get("test").unwrap().status, SwitchStatus::Disabled);

        store.set_status("test", SwitchStatus::Global).unwrap();
        assert_eq!(store.get("test").unwrap().status, SwitchStatus::Global);

        store.delete("test").unwrap();
        assert!(!store.contains("test").unwrap());
    }

    #[test]
    fn foreign_writes_follow_refresh_policy() {
        let backend = Arc::new(MemoryBackend::new());
        let writer = store_over(&backend);
        let watching = store_over(&backend);
        let stale = store_over(&backend).with_refresh_policy(RefreshPolicy::Never);

        writer.save(Switch::new("test", SwitchStatus::Disabled)).unwrap();
        assert_eq!(watching.get("test").unwrap().status, SwitchStatus::Disabled);
        assert_eq!(stale.get("test").unwrap().status, SwitchStatus::Disabled);

        writer.set_status("test", SwitchStatus::Global).unwrap();
        assert_eq!(watching.get("test").unwrap().status, SwitchStatus::Global);
        // cached entry survives until refreshed explicitly
        assert_eq!(stale.get("test").unwrap().status, SwitchStatus::Disabled);

        stale.refresh().unwrap();
        assert_eq!(stale.get("test").unwrap().status, SwitchStatus::Global);
    }

    #[test]
    fn interval_policy_reloads_when_expired() {
        let backend = Arc::new(MemoryBackend::new());
        let writer = store_over(&backend);
        let reader = store_over(&backend).with_refresh_policy(RefreshPolicy::Interval(Duration::ZERO));

        writer.save(Switch::new("test", SwitchStatus::Disabled)).unwrap();
        assert_eq!(reader.get("test").unwrap().status, SwitchStatus::Disabled);
        writer.set_status("test", SwitchStatus::Selective).unwrap();
        assert_eq!(reader.get("test").unwrap().status, SwitchStatus::Selective);
    }

    #[test]
    fn writes_create_missing_switch_without_auto_create() {
        let backend = Arc::new(MemoryBackend::new());
        let store = store_over(&backend).with_auto_create(false);

        let switch = store.set_status("test", SwitchStatus::Disabled).unwrap();
        assert_eq!(switch.status, SwitchStatus::Disabled);
        assert!(backend.load("test").unwrap().is_some());
        assert_eq!(store.get("test").unwrap().status, SwitchStatus::Disabled);

        store.clear_conditions("other").unwrap();
        assert_eq!(store.get("other").unwrap().status, SwitchStatus::Global);
    }

    /// Backend that parks the first `load` or `list_all` after reading, until released.
    struct PausingBackend {
        inner: MemoryBackend,
        paused: Mutex<Option<(mpsc::Sender<()>, mpsc::Receiver<()>)>>,
    }

    impl PausingBackend {
        /// Returns the backend, a receiver signalled once a read is parked, and the release
        /// sender.
        fn new(inner: MemoryBackend) -> (PausingBackend, mpsc::Receiver<()>, mpsc::Sender<()>) {
            let (parked_tx, parked_rx) = mpsc::channel();
            let (release_tx, release_rx) = mpsc::channel();
            let backend = PausingBackend {
                inner,
                paused: Mutex::new(Some((parked_tx, release_rx))),
            };
            (backend, parked_rx, release_tx)
        }

        fn pause(&self) {
            let paused = self.paused.lock().unwrap().take();
            if let Some((parked, release)) = paused {
                parked.send(()).unwrap();
                release.recv().unwrap();
            }
        }
    }

    impl Backend for PausingBackend {
        fn load(&self, key: &str) -> Result<Option<Switch>> {
            let switch = self.inner.load(key);
            self.pause();
            switch
        }

        fn save(&self, switch: &Switch) -> Result<()> {
            self.inner.save(switch)
        }

        fn delete(&self, key: &str) -> Result<()> {
            self.inner.delete(key)
        }

        fn list_all(&self) -> Result<Vec<Switch>> {
            let switches = self.inner.list_all();
            self.pause();
            switches
        }

        fn generation(&self) -> Result<u64> {
            self.inner.generation()
        }
    }

    fn paused_store() -> (Arc<SwitchStore>, mpsc::Receiver<()>, mpsc::Sender<()>) {
        let (backend, parked, release) = PausingBackend::new(MemoryBackend::with_switches([
            Switch::new("test", SwitchStatus::Disabled),
        ]));
        let store = SwitchStore::new(Arc::new(backend)).with_refresh_policy(RefreshPolicy::Never);
        (Arc::new(store), parked, release)
    }

    #[test]
    fn in_flight_load_does_not_hide_own_write() {
        let (store, parked, release) = paused_store();

        let reader = {
            let store = store.clone();
            std::thread::spawn(move || store.get("test").unwrap())
        };
        parked.recv().unwrap();
        store.set_status("test", SwitchStatus::Global).unwrap();
        release.send(()).unwrap();
        reader.join().unwrap();

        assert_eq!(store.get("test").unwrap().status, SwitchStatus::Global);
    }

    #[test]
    fn in_flight_refresh_does_not_hide_own_write() {
        let (store, parked, release) = paused_store();

        let refresher = {
            let store = store.clone();
            std::thread::spawn(move || store.refresh().unwrap())
        };
        parked.recv().unwrap();
        store.set_status("test", SwitchStatus::Global).unwrap();
        release.send(()).unwrap();
        refresher.join().unwrap();

        assert_eq!(store.get("test").unwrap().status, SwitchStatus::Global);
        assert_eq!(store.list().unwrap()[0].status, SwitchStatus::Global);
    }

    #[test]
    fn listeners_see_saves_and_deletes() {
        let store = SwitchStore::new(Arc::new(MemoryBackend::new()));
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            store.subscribe(move |change: &SwitchChange| {
                let entry = match change {
                    SwitchChange::Saved(switch) => format!("saved {}", switch.key),
                    SwitchChange::Deleted(key) => format!("deleted {key}"),
                };
                seen.lock().unwrap().push(entry);
            });
        }

        store.set_status("test", SwitchStatus::Disabled).unwrap();
        store.delete("test").unwrap();

        assert_eq!(*seen.lock().unwrap(), ["saved test", "deleted test"]);
    }

    #[test]
    fn listener_may_subscribe_from_callback() {
        let store = Arc::new(SwitchStore::new(Arc::new(MemoryBackend::new())));
        let late_calls = Arc::new(AtomicUsize::new(0));
        {
            let weak = Arc::downgrade(&store);
            let late_calls = late_calls.clone();
            let subscribed = AtomicBool::new(false);
            store.subscribe(move |_: &SwitchChange| {
                if subscribed.swap(true, Ordering::SeqCst) {
                    return;
                }
                let late_calls = late_calls.clone();
                if let Some(store) = weak.upgrade() {
                    store.subscribe(move |_: &SwitchChange| {
                        late_calls.fetch_add(1, Ordering::SeqCst);
                    });
                }
            });
        }

        store.set_status("test", SwitchStatus::Disabled).unwrap();
        assert_eq!(late_calls.load(Ordering::SeqCst), 0);
        store.delete("test").unwrap();
        assert_eq!(late_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn list_is_sorted_by_key() {
        let backend = Arc::new(MemoryBackend::with_switches([
            Switch::new("b", SwitchStatus::Global),
            Switch::new("a:child", SwitchStatus::Inherit),
            Switch::new("a", SwitchStatus::Disabled),
        ]));
        let store = store_over(&backend);
        let keys = store
            .list()
            .unwrap()
            .iter()
            .map(|s| s.key.clone())
            .collect::<Vec<_>>();
        assert_eq!(keys, ["a", "a:child", "b"]);
    }

    #[test]
    fn concurrent_writers_to_different_keys() {
        let store = Arc::new(SwitchStore::new(Arc::new(MemoryBackend::new())));
        let handles = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    store
                        .set_status(&format!("key{i}"), SwitchStatus::Disabled)
                        .unwrap();
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.list().unwrap().len(), 8);
    }
}
