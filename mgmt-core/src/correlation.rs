//! Correlation of inbound responses with outstanding requests
//!
//! Every in-flight request registers its correlation key (a management
//! sequence number, or a CoAP token) and receives a [`DeliverySlot`]. The
//! receive path looks the key up and pushes the decoded response, or an
//! error, into that slot.
//!
//! # Slot Semantics
//! - A slot has capacity one. The first result wins; a late or duplicate
//!   delivery is dropped without blocking the deliverer.
//! - Delivering does not remove the registration. The request owner removes
//!   it, either with [`CorrelationRegistry::unregister`] or by dropping the
//!   slot.
//! - [`CorrelationRegistry::fail_all`] delivers one error to every slot and
//!   clears the table.
//!
//! The key table is guarded by a single mutex. The lock is never held while
//! a result is pushed into a slot.

use crate::error::{MgmtError, MgmtResult};
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

type Outcome<V> = MgmtResult<V>;

#[derive(Debug)]
struct Entry<V> {
    id: u64,
    tx: mpsc::Sender<Outcome<V>>,
}

#[derive(Debug)]
struct Table<K, V> {
    entries: HashMap<K, Entry<V>>,
    next_id: u64,
}

/// Key → delivery slot table
///
/// Cloning the registry yields another handle to the same table.
#[derive(Debug)]
pub struct CorrelationRegistry<K, V> {
    table: Arc<Mutex<Table<K, V>>>,
}

impl<K, V> Clone for CorrelationRegistry<K, V> {
    fn clone(&self) -> Self {
        Self {
            table: Arc::clone(&self.table),
        }
    }
}

impl<K, V> Default for CorrelationRegistry<K, V>
where
    K: Eq + Hash + Clone + Debug,
{
    fn default() -> Self {
        Self::new()
    }
}

fn lock<K, V>(table: &Mutex<Table<K, V>>) -> MutexGuard<'_, Table<K, V>> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<K, V> CorrelationRegistry<K, V>
where
    K: Eq + Hash + Clone + Debug,
{
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            table: Arc::new(Mutex::new(Table {
                entries: HashMap::new(),
                next_id: 0,
            })),
        }
    }

    /// Register a listener for `key`
    ///
    /// # Errors
    /// Returns `MgmtError::DuplicateKey` if `key` already has an active slot.
    /// Two concurrent requests must never share a key, so this is reported
    /// rather than overwritten.
    pub fn register(&self, key: K) -> MgmtResult<DeliverySlot<K, V>> {
        let mut table = lock(&self.table);
        if table.entries.contains_key(&key) {
            return Err(MgmtError::DuplicateKey(format!("{:?}", key)));
        }

        let id = table.next_id;
        table.next_id = table.next_id.wrapping_add(1);

        let (tx, rx) = mpsc::channel(1);
        table.entries.insert(key.clone(), Entry { id, tx });

        Ok(DeliverySlot {
            key,
            id,
            rx,
            table: Arc::downgrade(&self.table),
        })
    }

    /// Remove the listener for `key`, if any
    ///
    /// Returns `true` if a listener was removed. Safe to call whether or not
    /// the key is registered.
    pub fn unregister(&self, key: &K) -> bool {
        lock(&self.table).entries.remove(key).is_some()
    }

    /// Push a response into the slot registered for `key`
    ///
    /// Returns `true` if the slot accepted the value. Data for an unknown key,
    /// or for a slot that already holds a result, is dropped.
    pub fn deliver(&self, key: &K, value: V) -> bool {
        self.push(key, Ok(value))
    }

    /// Push an error into the slot registered for `key`
    ///
    /// Used to abort one specific wait. Returns `true` if the slot accepted
    /// the error.
    pub fn fail_one(&self, key: &K, err: MgmtError) -> bool {
        self.push(key, Err(err))
    }

    /// Deliver `err` to every registered slot and clear the table
    ///
    /// Returns the number of listeners that were failed.
    pub fn fail_all(&self, err: MgmtError) -> usize {
        let drained: Vec<(K, Entry<V>)> = lock(&self.table).entries.drain().collect();
        let count = drained.len();
        for (key, entry) in drained {
            if let Err(TrySendError::Full(_)) = entry.tx.try_send(Err(err.clone())) {
                log::debug!("Listener {:?} already holds a result, dropping error", key);
            }
        }
        count
    }

    /// Check whether `key` has an active listener
    pub fn contains(&self, key: &K) -> bool {
        lock(&self.table).entries.contains_key(key)
    }

    /// Number of active listeners
    pub fn len(&self) -> usize {
        lock(&self.table).entries.len()
    }

    /// Check whether there are no active listeners
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push(&self, key: &K, outcome: Outcome<V>) -> bool {
        // Clone the sender so the table lock is released before delivery
        let tx = match lock(&self.table).entries.get(key) {
            Some(entry) => entry.tx.clone(),
            None => {
                log::debug!("No listener for {:?}, dropping", key);
                return false;
            }
        };

        match tx.try_send(outcome) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                log::debug!("Listener {:?} already holds a result, dropping", key);
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

/// Single-use receiving end of a registration
///
/// Dropping the slot removes its registration, unless the key has since
/// been unregistered and registered again by someone else.
#[derive(Debug)]
pub struct DeliverySlot<K, V>
where
    K: Eq + Hash + Clone + Debug,
{
    key: K,
    id: u64,
    rx: mpsc::Receiver<Outcome<V>>,
    table: Weak<Mutex<Table<K, V>>>,
}

impl<K, V> DeliverySlot<K, V>
where
    K: Eq + Hash + Clone + Debug,
{
    /// Correlation key of this slot
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Wait for the result
    ///
    /// If the registration is removed before anything was delivered, this
    /// resolves to `MgmtError::Disconnected`.
    pub async fn recv(&mut self) -> MgmtResult<V> {
        match self.rx.recv().await {
            Some(outcome) => outcome,
            None => Err(MgmtError::Disconnected(format!(
                "listener {:?} removed before a response arrived",
                self.key
            ))),
        }
    }

    /// Take the result if one has already been delivered
    pub fn try_recv(&mut self) -> Option<MgmtResult<V>> {
        self.rx.try_recv().ok()
    }
}

impl<K, V> Drop for DeliverySlot<K, V>
where
    K: Eq + Hash + Clone + Debug,
{
    fn drop(&mut self) {
        if let Some(table) = self.table.upgrade() {
            let mut table = lock(&table);
            if table.entries.get(&self.key).map(|e| e.id) == Some(self.id) {
                table.entries.remove(&self.key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, task};

    #[test]
    fn test_duplicate_key_rejected() {
        let reg: CorrelationRegistry<u8, Vec<u8>> = CorrelationRegistry::new();
        let _slot = reg.register(7).unwrap();

        let err = reg.register(7).unwrap_err();
        assert!(matches!(err, MgmtError::DuplicateKey(_)));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let reg: CorrelationRegistry<u8, Vec<u8>> = CorrelationRegistry::new();
        assert!(!reg.unregister(&1));

        let _slot = reg.register(1).unwrap();
        assert!(reg.unregister(&1));
        assert!(!reg.unregister(&1));

        // Key can be reused right away
        let _again = reg.register(1).unwrap();
        assert!(reg.contains(&1));
    }

    #[tokio::test]
    async fn test_deliver_keeps_registration() {
        let reg: CorrelationRegistry<u8, Vec<u8>> = CorrelationRegistry::new();
        let mut slot = reg.register(3).unwrap();

        assert!(reg.deliver(&3, vec![1, 2, 3]));
        assert!(reg.contains(&3));
        assert_eq!(slot.recv().await.unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_deliver_unknown_key_is_dropped() {
        let reg: CorrelationRegistry<u8, Vec<u8>> = CorrelationRegistry::new();
        assert!(!reg.deliver(&9, vec![0xff]));
        assert!(reg.is_empty());
    }

    #[tokio::test]
    async fn test_first_delivery_wins() {
        let reg: CorrelationRegistry<u8, &'static str> = CorrelationRegistry::new();
        let mut slot = reg.register(5).unwrap();

        assert!(reg.deliver(&5, "first"));
        // Capacity one: the second delivery must not block and is dropped
        assert!(!reg.deliver(&5, "second"));
        assert!(!reg.fail_one(&5, MgmtError::RxAborted));

        assert_eq!(slot.recv().await.unwrap(), "first");
        assert!(slot.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_fail_one_only_affects_its_key() {
        let reg: CorrelationRegistry<u8, Vec<u8>> = CorrelationRegistry::new();
        let mut a = reg.register(1).unwrap();
        let mut b = reg.register(2).unwrap();

        assert!(reg.fail_one(&1, MgmtError::RxAborted));
        assert!(matches!(a.recv().await, Err(MgmtError::RxAborted)));
        assert!(b.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_fail_all_unblocks_everyone() {
        let reg: CorrelationRegistry<u8, Vec<u8>> = CorrelationRegistry::new();
        let mut slots: Vec<_> = (0..4).map(|k| reg.register(k).unwrap()).collect();

        let failed = reg.fail_all(MgmtError::Disconnected("link lost".into()));
        assert_eq!(failed, 4);
        assert!(reg.is_empty());

        for slot in slots.iter_mut() {
            assert!(matches!(slot.recv().await, Err(MgmtError::Disconnected(_))));
        }
    }

    #[test]
    fn test_waiter_wakes_on_delivery() {
        let reg: CorrelationRegistry<u8, u32> = CorrelationRegistry::new();
        let mut slot = reg.register(42).unwrap();

        let mut wait = task::spawn(slot.recv());
        assert_pending!(wait.poll());

        assert!(reg.deliver(&42, 1000));
        assert!(wait.is_woken());
        assert_eq!(assert_ready!(wait.poll()).unwrap(), 1000);
    }

    #[test]
    fn test_drop_unregisters() {
        let reg: CorrelationRegistry<u8, Vec<u8>> = CorrelationRegistry::new();
        let slot = reg.register(11).unwrap();
        drop(slot);
        assert!(!reg.contains(&11));
    }

    #[test]
    fn test_stale_slot_does_not_remove_newer_registration() {
        let reg: CorrelationRegistry<u8, Vec<u8>> = CorrelationRegistry::new();
        let stale = reg.register(8).unwrap();
        reg.unregister(&8);

        let _fresh = reg.register(8).unwrap();
        drop(stale);
        assert!(reg.contains(&8));
    }

    #[tokio::test]
    async fn test_recv_after_unregister_reports_error() {
        let reg: CorrelationRegistry<u8, Vec<u8>> = CorrelationRegistry::new();
        let mut slot = reg.register(4).unwrap();
        reg.unregister(&4);
        assert!(matches!(slot.recv().await, Err(MgmtError::Disconnected(_))));
    }
}
