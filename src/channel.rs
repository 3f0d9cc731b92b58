//! The task-data bus: statically defined, typed, single-message channels
//! with an observer list.
//!
//! A [`Channel<T>`] is meant to live as a `static`, defined with
//! [`define_channel`], the same way a reserved battery/IMU/location channel
//! would be in the host application. The core itself never interprets the
//! bytes behind a channel id — it only consumes the handful of reserved
//! channels it owns (e.g. the watchdog) through this same machinery.

use std::any::Any;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

/// A compile-time channel identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(pub u32);

struct Observer<T> {
    priority: i32,
    callback: Box<dyn Fn(&T) + Send + Sync>,
}

/// A typed, single-message channel with an ordered observer list.
///
/// The single `Mutex<Option<T>>` doubles as both the publish slot and the
/// claim lock: `claim` holds the guard for the duration of an in-place
/// mutation, `publish` holds it only long enough to replace the slot. This
/// is exactly the "claim/publish protocol, one writer at a time" contract
/// with no extra bookkeeping.
pub struct Channel<T> {
    slot: Mutex<Option<T>>,
    publish_count: AtomicU64,
    last_publish_ticks: AtomicU64,
    has_published: std::sync::atomic::AtomicBool,
    observers: Mutex<Vec<Observer<T>>>,
}

impl<T> Channel<T> {
    pub const fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            publish_count: AtomicU64::new(0),
            last_publish_ticks: AtomicU64::new(0),
            has_published: std::sync::atomic::AtomicBool::new(false),
            observers: Mutex::new(Vec::new()),
        }
    }

    /// Register an observer. Stable-sorted by `priority`, lower first —
    /// ties keep registration order.
    pub fn register_observer(&self, priority: i32, callback: impl Fn(&T) + Send + Sync + 'static) {
        let mut observers = self.observers.lock().unwrap();
        let pos = observers
            .iter()
            .position(|o| o.priority > priority)
            .unwrap_or(observers.len());
        observers.insert(pos, Observer { priority, callback });
    }

    pub fn publish_count(&self) -> u64 {
        self.publish_count.load(Ordering::SeqCst)
    }

    /// `u64::MAX` if never published, else `now_ticks - last_publish_ticks`
    /// converted to milliseconds via the supplied ticks-per-second.
    pub fn data_age_ms(&self, now_ticks: u64, ticks_per_second: u64) -> u64 {
        if !self.has_published.load(Ordering::SeqCst) {
            return u64::MAX;
        }
        let last = self.last_publish_ticks.load(Ordering::SeqCst);
        let delta_ticks = now_ticks.saturating_sub(last);
        delta_ticks.saturating_mul(1000) / ticks_per_second.max(1)
    }

    /// Never blocks on a claim: briefly locks the slot to replace contents,
    /// then notifies observers in priority order before returning. A
    /// second publish always overwrites the first; observers already
    /// dispatched from a prior publish are allowed to finish.
    pub fn publish(&self, message: T, now_ticks: u64)
    where
        T: Clone,
    {
        {
            let mut slot = self.slot.lock().unwrap();
            *slot = Some(message.clone());
        }
        self.publish_count.fetch_add(1, Ordering::SeqCst);
        self.last_publish_ticks.store(now_ticks, Ordering::SeqCst);
        self.has_published.store(true, Ordering::SeqCst);

        // Observers are dispatched without holding the slot lock, so an
        // observer that itself publishes does not deadlock.
        let observers = self.observers.lock().unwrap();
        for observer in observers.iter() {
            (observer.callback)(&message);
        }
    }

    /// Copy the current message out. Never blocks on a claim.
    pub fn read(&self) -> Option<T>
    where
        T: Clone,
    {
        self.slot.lock().unwrap().clone()
    }

    /// Acquire exclusive write access to mutate the slot in place. Returns
    /// `None` if the claim could not be acquired within `timeout`.
    pub fn claim(&self, timeout: std::time::Duration) -> Option<ChannelClaim<'_, T>> {
        // std::sync::Mutex has no try_lock_for; approximate with a short
        // polling loop, matching what a non-priority-inheriting RTOS mutex
        // primitive would do for a bounded wait.
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if let Ok(guard) = self.slot.try_lock() {
                return Some(ChannelClaim { guard });
            }
            if std::time::Instant::now() >= deadline {
                return None;
            }
            std::thread::yield_now();
        }
    }
}

impl<T> Default for Channel<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard returned by [`Channel::claim`]. Releases the claim when
/// dropped.
pub struct ChannelClaim<'a, T> {
    guard: std::sync::MutexGuard<'a, Option<T>>,
}

impl<'a, T> ChannelClaim<'a, T> {
    pub fn get(&self) -> Option<&T> {
        self.guard.as_ref()
    }

    pub fn get_mut(&mut self) -> &mut Option<T> {
        &mut self.guard
    }
}

/// Defines a `static` [`Channel<T>`], the Rust equivalent of the
/// `CHAN_DEFINE`/`CHAN_GET`/`CHAN_TYPE` macro trio. The channel id is a
/// plain `const` alongside it, since `macro_rules!` cannot mint a second
/// identifier from the first without a helper crate like `paste`.
///
/// ```ignore
/// define_channel!(BATTERY, u8);
/// pub const BATTERY_ID: ChannelId = ChannelId(1);
/// BATTERY.publish(87, now_ticks);
/// ```
#[macro_export]
macro_rules! define_channel {
    ($name:ident, $ty:ty) => {
        pub static $name: $crate::channel::Channel<$ty> = $crate::channel::Channel::new();
    };
}

/// Runtime lookup of statically-defined channels by id, for collaborators
/// (an RPC bridge, a diagnostics dump) that only carry a [`ChannelId`] and
/// not the channel's message type. Channels stay plain `static`s defined
/// with [`define_channel`]; registering one here is opt-in, not required to
/// use the channel directly by name.
#[derive(Default)]
pub struct ChannelRegistry {
    channels: RwLock<FxHashMap<ChannelId, &'static (dyn Any + Send + Sync)>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self { channels: RwLock::new(FxHashMap::default()) }
    }

    /// Register `channel` under `id`, replacing any channel already
    /// registered there.
    pub fn register<T: Send + Sync + 'static>(&self, id: ChannelId, channel: &'static Channel<T>) {
        self.channels.write().insert(id, channel);
    }

    /// Look up the channel registered under `id`, if any, downcasting it to
    /// `Channel<T>`. Returns `None` on a type mismatch as well as a missing
    /// id — both are a caller bug, not something this module can recover
    /// from in isolation.
    pub fn get<T: Send + Sync + 'static>(&self, id: ChannelId) -> Option<&'static Channel<T>> {
        let any_ref = *self.channels.read().get(&id)?;
        any_ref.downcast_ref::<Channel<T>>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    #[test]
    fn publish_then_read() {
        let chan: Channel<u32> = Channel::new();
        assert_eq!(chan.read(), None);
        assert_eq!(chan.data_age_ms(1000, 1000), u64::MAX);
        chan.publish(42, 1000);
        assert_eq!(chan.read(), Some(42));
        assert_eq!(chan.publish_count(), 1);
        assert_eq!(chan.data_age_ms(1500, 1000), 500);
    }

    #[test]
    fn observers_fire_in_priority_order() {
        let chan: Channel<u32> = Channel::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for (priority, tag) in [(10, "b"), (0, "a"), (20, "c")] {
            let order = order.clone();
            chan.register_observer(priority, move |_| {
                order.lock().unwrap().push(tag);
            });
        }
        chan.publish(1, 0);
        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn claim_excludes_publish() {
        let chan: Channel<u32> = Channel::new();
        let claim = chan.claim(std::time::Duration::from_millis(50)).unwrap();
        assert!(claim.get().is_none());
        drop(claim);
        chan.publish(7, 0);
        assert_eq!(chan.read(), Some(7));
    }

    #[test]
    fn second_publish_overwrites_first() {
        let chan: Channel<u32> = Channel::new();
        let seen = Arc::new(AtomicU32::new(0));
        let seen2 = seen.clone();
        chan.register_observer(0, move |v| {
            seen2.store(*v, Ordering::SeqCst);
        });
        chan.publish(1, 0);
        chan.publish(2, 1);
        assert_eq!(chan.read(), Some(2));
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    define_channel!(REGISTRY_TEST_CHANNEL, u32);

    #[test]
    fn registry_resolves_by_id_and_type() {
        let registry = ChannelRegistry::new();
        let id = ChannelId(7);
        registry.register(id, &REGISTRY_TEST_CHANNEL);

        REGISTRY_TEST_CHANNEL.publish(99, 0);
        let resolved = registry.get::<u32>(id).expect("channel registered under id");
        assert_eq!(resolved.read(), Some(99));

        assert!(registry.get::<u8>(id).is_none(), "wrong type must not downcast");
        assert!(registry.get::<u32>(ChannelId(8)).is_none(), "unregistered id must miss");
    }
}
