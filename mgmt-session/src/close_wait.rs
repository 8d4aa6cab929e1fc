//! Single-waiter close synchronization

use mgmt_core::{MgmtError, MgmtResult};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;

type Notice = Option<MgmtError>;

/// The registered waiter's id and, until it has been notified, its sender
#[derive(Debug, Default)]
struct Slot {
    waiter: Option<(u64, Option<oneshot::Sender<Notice>>)>,
    next_id: u64,
}

fn lock(slot: &Mutex<Slot>) -> MutexGuard<'_, Slot> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Holds at most one "waiting for the link to close" registration
///
/// Cloning yields another handle to the same slot.
#[derive(Debug, Clone, Default)]
pub struct CloseWait {
    slot: Arc<Mutex<Slot>>,
}

impl CloseWait {
    /// Create an empty slot
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the waiter
    ///
    /// The registration lasts until the returned guard is dropped, even
    /// after the disconnect has been reported to it.
    ///
    /// # Errors
    /// `MgmtError::MultipleWaiters` if a waiter is already registered; that
    /// registration is left untouched.
    pub fn register(&self) -> MgmtResult<CloseWaitGuard> {
        let mut slot = lock(&self.slot);
        if slot.waiter.is_some() {
            return Err(MgmtError::MultipleWaiters);
        }

        let id = slot.next_id;
        slot.next_id = slot.next_id.wrapping_add(1);
        let (tx, rx) = oneshot::channel();
        slot.waiter = Some((id, Some(tx)));

        Ok(CloseWaitGuard {
            id,
            rx,
            slot: Arc::clone(&self.slot),
        })
    }

    /// Report a disconnect to the registered waiter
    ///
    /// The registration itself stays in place until the waiter's guard is
    /// dropped. Returns `true` if a waiter was notified.
    pub fn notify(&self, cause: Notice) -> bool {
        let sender = lock(&self.slot)
            .waiter
            .as_mut()
            .and_then(|(_, tx)| tx.take());
        match sender {
            Some(tx) => tx.send(cause).is_ok(),
            None => false,
        }
    }

    /// Check if a waiter currently holds the slot
    pub fn is_registered(&self) -> bool {
        lock(&self.slot).waiter.is_some()
    }
}

/// An active close-wait registration
#[derive(Debug)]
pub struct CloseWaitGuard {
    id: u64,
    rx: oneshot::Receiver<Notice>,
    slot: Arc<Mutex<Slot>>,
}

impl CloseWaitGuard {
    /// Wait for the disconnect notification
    ///
    /// Resolves to the disconnect's cause (`None` for an orderly close).
    pub async fn wait(&mut self) -> MgmtResult<Notice> {
        (&mut self.rx)
            .await
            .map_err(|_| MgmtError::Disconnected("close waiter dropped".to_string()))
    }
}

impl Drop for CloseWaitGuard {
    fn drop(&mut self) {
        let mut slot = lock(&self.slot);
        if matches!(slot.waiter, Some((id, _)) if id == self.id) {
            slot.waiter = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, task};

    #[test]
    fn test_second_waiter_rejected() {
        let cw = CloseWait::new();
        let _first = cw.register().unwrap();
        assert!(matches!(cw.register(), Err(MgmtError::MultipleWaiters)));
        // The first registration survives the rejected attempt
        assert!(cw.is_registered());
    }

    #[test]
    fn test_guard_drop_clears() {
        let cw = CloseWait::new();
        drop(cw.register().unwrap());
        assert!(!cw.is_registered());
        assert!(cw.register().is_ok());
    }

    #[test]
    fn test_notify_wakes_waiter() {
        let cw = CloseWait::new();
        let mut guard = cw.register().unwrap();

        let mut wait = task::spawn(guard.wait());
        assert_pending!(wait.poll());

        assert!(cw.notify(Some(MgmtError::Disconnected("gone".into()))));
        assert!(wait.is_woken());
        let cause = assert_ready!(wait.poll()).unwrap();
        assert!(matches!(cause, Some(MgmtError::Disconnected(_))));
        drop(wait);

        // The marker outlives the notification
        assert!(cw.is_registered());
        assert!(!cw.notify(None));
    }

    #[test]
    fn test_notified_waiter_still_excludes_others() {
        let cw = CloseWait::new();
        let guard = cw.register().unwrap();
        assert!(cw.notify(None));

        assert!(matches!(cw.register(), Err(MgmtError::MultipleWaiters)));
        drop(guard);
        assert!(cw.register().is_ok());
    }

    #[test]
    fn test_notify_without_waiter() {
        assert!(!CloseWait::new().notify(None));
    }
}
