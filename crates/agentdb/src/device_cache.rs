//! Cached copy of the node as last fetched from the exchange.
//!
//! Refreshed by the background sync path and read by request handlers. The
//! device and the last sync error are replaced together under one lock, so a
//! reader sees either the previous sync result or the new one.

use std::fmt::Display;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, warn};

#[derive(Debug)]
struct Snapshot<D> {
    device: Option<D>,
    last_error: Option<String>,
}

#[derive(Debug)]
pub struct DeviceCache<D> {
    inner: RwLock<Snapshot<D>>,
}

impl<D> Default for DeviceCache<D> {
    fn default() -> Self {
        Self {
            inner: RwLock::new(Snapshot {
                device: None,
                last_error: None,
            }),
        }
    }
}

impl<D: Clone> DeviceCache<D> {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached device and the error of the last failed sync, if any.
    pub fn get(&self) -> (Option<D>, Option<String>) {
        let snap = self.read();
        (snap.device.clone(), snap.last_error.clone())
    }

    pub fn device(&self) -> Option<D> {
        self.read().device.clone()
    }

    pub fn last_error(&self) -> Option<String> {
        self.read().last_error.clone()
    }

    /// Store a freshly fetched device and clear any previous error.
    pub fn set(&self, device: D) {
        let mut snap = self.write();
        snap.device = Some(device);
        snap.last_error = None;
    }

    /// A failed fetch drops the cached device.
    pub fn record_error(&self, error: impl Display) {
        let mut snap = self.write();
        snap.device = None;
        snap.last_error = Some(error.to_string());
    }

    pub fn clear(&self) {
        let mut snap = self.write();
        snap.device = None;
        snap.last_error = None;
    }

    /// Run `fetch` and record its outcome.
    pub fn sync_with<E: Display>(&self, fetch: impl FnOnce() -> Result<D, E>) -> Result<D, E> {
        match fetch() {
            Ok(device) => {
                self.set(device.clone());
                debug!("exchange node cache refreshed");
                Ok(device)
            }
            Err(e) => {
                warn!(error = %e, "failed to fetch node from the exchange");
                self.record_error(&e);
                Err(e)
            }
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Snapshot<D>> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Snapshot<D>> {
        self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[derive(Debug, Clone, PartialEq)]
    struct Node {
        id: String,
    }

    fn node(id: &str) -> Node {
        Node { id: id.to_string() }
    }

    #[test]
    fn starts_empty() {
        let cache: DeviceCache<Node> = DeviceCache::new();
        assert_eq!(cache.get(), (None, None));
    }

    #[test]
    fn sync_failure_replaces_device_with_error() {
        let cache = DeviceCache::new();
        cache.sync_with(|| Ok::<_, String>(node("n1"))).unwrap();
        assert_eq!(cache.device(), Some(node("n1")));

        let err = cache.sync_with(|| Err::<Node, _>("unreachable".to_string()));
        assert!(err.is_err());
        assert_eq!(cache.get(), (None, Some("unreachable".to_string())));

        cache.set(node("n2"));
        assert_eq!(cache.get(), (Some(node("n2")), None));
    }

    #[test]
    fn readers_see_whole_snapshots() {
        let cache = Arc::new(DeviceCache::new());
        let writer = {
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                for i in 0..100 {
                    if i % 2 == 0 {
                        cache.set(node("n"));
                    } else {
                        cache.record_error("down");
                    }
                }
            })
        };
        for _ in 0..100 {
            let (device, error) = cache.get();
            assert!(device.is_none() || error.is_none());
        }
        writer.join().unwrap();
    }
}
