//! `KvStore`: the opaque, byte-addressed persistent map the schedule store
//! is built on. The core only ever reserves a contiguous key range and
//! treats values as opaque bytes — it has no idea that a `sled`-backed
//! host binary, a flash page, or (in tests) a `HashMap` is underneath.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::trace;

/// Key type for the reserved schedule-store key range. The core does not
/// otherwise interpret keys.
pub type Key = u32;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("kv backend error: {0}")]
    Backend(String),

    #[cfg(feature = "sled-store")]
    #[error("sled backend error: {0}")]
    Sled(#[from] sled::Error),
}

/// Callback invoked when any key inside a subscribed range changes. Runs on
/// whatever thread the backend delivers notifications on — it must not
/// block; it exists only to set a rebuild flag (see `store::ScheduleStore`).
pub type ChangeCallback = Box<dyn Fn() + Send + Sync>;

/// Collaborator interface for persistent key/value storage.
pub trait KvStore: Send + Sync {
    fn read(&self, key: Key) -> crate::error::Result<Option<Vec<u8>>>;
    fn write(&self, key: Key, bytes: &[u8]) -> crate::error::Result<()>;
    fn delete(&self, key: Key) -> crate::error::Result<()>;

    fn exists(&self, key: Key) -> crate::error::Result<bool> {
        Ok(self.read(key)?.is_some())
    }

    /// Register `callback` to fire whenever a write or delete lands on a
    /// key in `range`. A store may coalesce multiple changes into one
    /// callback invocation; the core never relies on one callback per
    /// change, only on "at least one callback after at least one change".
    fn subscribe(&self, range: Range<Key>, callback: ChangeCallback);
}

struct Subscription {
    range: Range<Key>,
    callback: ChangeCallback,
}

/// In-memory `KvStore`, used by tests and as a reference implementation for
/// hosts without persistent storage.
#[derive(Default)]
pub struct MemoryKvStore {
    data: Mutex<HashMap<Key, Vec<u8>>>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn notify(&self, key: Key) {
        let subs = self.subscriptions.lock().unwrap();
        for sub in subs.iter() {
            if sub.range.contains(&key) {
                (sub.callback)();
            }
        }
    }
}

impl KvStore for MemoryKvStore {
    fn read(&self, key: Key) -> crate::error::Result<Option<Vec<u8>>> {
        Ok(self.data.lock().unwrap().get(&key).cloned())
    }

    fn write(&self, key: Key, bytes: &[u8]) -> crate::error::Result<()> {
        self.data.lock().unwrap().insert(key, bytes.to_vec());
        self.notify(key);
        Ok(())
    }

    fn delete(&self, key: Key) -> crate::error::Result<()> {
        self.data.lock().unwrap().remove(&key);
        self.notify(key);
        Ok(())
    }

    fn subscribe(&self, range: Range<Key>, callback: ChangeCallback) {
        self.subscriptions
            .lock()
            .unwrap()
            .push(Subscription { range, callback });
    }
}

/// `sled`-backed `KvStore` adapter, for hosts that want real persistence
/// instead of the in-memory test double. `sled`'s own prefix-watch API
/// gives us change notification for free.
#[cfg(feature = "sled-store")]
pub struct SledKvStore {
    db: sled::Db,
    // Keeps subscriber threads alive for the lifetime of the store.
    watchers: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

#[cfg(feature = "sled-store")]
impl SledKvStore {
    pub fn open(path: impl AsRef<std::path::Path>) -> crate::error::Result<Self> {
        let db = sled::open(path).map_err(KvError::from)?;
        Ok(Self {
            db,
            watchers: Mutex::new(Vec::new()),
        })
    }

    fn key_bytes(key: Key) -> [u8; 4] {
        key.to_be_bytes()
    }
}

#[cfg(feature = "sled-store")]
impl KvStore for SledKvStore {
    fn read(&self, key: Key) -> crate::error::Result<Option<Vec<u8>>> {
        Ok(self
            .db
            .get(Self::key_bytes(key))
            .map_err(KvError::from)?
            .map(|ivec| ivec.to_vec()))
    }

    fn write(&self, key: Key, bytes: &[u8]) -> crate::error::Result<()> {
        self.db
            .insert(Self::key_bytes(key), bytes)
            .map_err(KvError::from)?;
        Ok(())
    }

    fn delete(&self, key: Key) -> crate::error::Result<()> {
        self.db.remove(Self::key_bytes(key)).map_err(KvError::from)?;
        Ok(())
    }

    fn subscribe(&self, range: Range<Key>, callback: ChangeCallback) {
        let start = Self::key_bytes(range.start);
        let end = Self::key_bytes(range.end);
        let subscriber = self.db.watch_prefix(vec![]);
        let callback: Arc<ChangeCallback> = Arc::new(callback);
        let handle = std::thread::Builder::new()
            .name("kv-watch".into())
            .spawn(move || {
                for event in subscriber {
                    let touched = match &event {
                        sled::Event::Insert { key, .. } | sled::Event::Remove { key } => {
                            key.as_ref() >= start.as_slice() && key.as_ref() < end.as_slice()
                        }
                    };
                    if touched {
                        trace!("kv change notification for subscribed range");
                        (callback)();
                    }
                }
            })
            .expect("spawn kv watcher thread");
        self.watchers.lock().unwrap().push(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn write_and_read_roundtrip() {
        let kv = MemoryKvStore::new();
        kv.write(5, &[1, 2, 3]).unwrap();
        assert_eq!(kv.read(5).unwrap(), Some(vec![1, 2, 3]));
        assert!(kv.exists(5).unwrap());
        kv.delete(5).unwrap();
        assert_eq!(kv.read(5).unwrap(), None);
    }

    #[test]
    fn subscription_fires_only_within_range() {
        let kv = MemoryKvStore::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        kv.subscribe(10..20, Box::new(move || {
            hits2.fetch_add(1, Ordering::SeqCst);
        }));
        kv.write(15, b"x").unwrap();
        kv.write(25, b"y").unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
