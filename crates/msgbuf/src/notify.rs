//! Notifier capability: an external hook invoked when a buffer's
//! occupancy crosses a configured threshold.
//!
//! The core does not know what a notifier target is; it only holds an
//! `Arc<dyn Notify>` (the Arc is the retain/release contract) and calls
//! it outside any lock, since the callback may itself take locks.

use std::sync::Arc;

use crate::error::Result;
use crate::global;

/// What the notifier wants to happen after this call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyControl {
    /// Keep the notifier registered.
    Keep,
    /// Do not call this notifier again; the buffer clears its slot.
    Remove,
}

/// Which occupancy transition a notifier watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifierKind {
    /// Fires after a post pushes the message count above the threshold.
    Rise,
    /// Fires after a consume drops the message count below the threshold
    /// (a threshold of zero or less fires on every consume).
    Fall,
}

/// An occupancy notifier. Implementations must be cheap to call and must
/// not block indefinitely; they run on the producer/consumer thread that
/// crossed the threshold.
pub trait Notify: Send + Sync {
    /// Called with no buffer or listener lock held.
    fn notify(&self) -> Result<NotifyControl>;
}

/// A registered notifier with its threshold.
pub(crate) struct NotifierSlot {
    pub(crate) hook: Arc<dyn Notify>,
    pub(crate) threshold: i64,
}

/// Runs a notifier that was picked (and its Arc cloned) under the lock.
///
/// `clear_slot` re-locks, compares identities and detaches the slot when
/// the notifier asked to be removed; it must return the detached slot so
/// it is dropped here, after the lock is released again. Failures go to
/// the process-wide error sink and never poison the buffer.
pub(crate) fn run_notifier<F>(hook: Arc<dyn Notify>, clear_slot: F)
where
    F: FnOnce(&Arc<dyn Notify>) -> Option<NotifierSlot>,
{
    match hook.notify() {
        Ok(NotifyControl::Keep) => {}
        Ok(NotifyControl::Remove) => {
            let detached = clear_slot(&hook);
            drop(detached);
        }
        Err(err) => global::report_notifier_error(&err),
    }
}

/// `true` when a slot holds exactly this hook.
pub(crate) fn same_hook(slot: &Option<NotifierSlot>, hook: &Arc<dyn Notify>) -> bool {
    slot.as_ref()
        .is_some_and(|s| Arc::ptr_eq(&s.hook, hook))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter(AtomicUsize);
    impl Notify for Counter {
        fn notify(&self) -> Result<NotifyControl> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(NotifyControl::Keep)
        }
    }

    #[test]
    fn test_run_notifier_keep_leaves_slot_alone() {
        let hook: Arc<dyn Notify> = Arc::new(Counter(AtomicUsize::new(0)));
        let mut cleared = false;
        run_notifier(Arc::clone(&hook), |_| {
            cleared = true;
            None
        });
        assert!(!cleared);
    }

    struct OneShot;
    impl Notify for OneShot {
        fn notify(&self) -> Result<NotifyControl> {
            Ok(NotifyControl::Remove)
        }
    }

    #[test]
    fn test_run_notifier_remove_clears_slot() {
        let hook: Arc<dyn Notify> = Arc::new(OneShot);
        let mut cleared = false;
        run_notifier(Arc::clone(&hook), |h| {
            assert!(Arc::ptr_eq(h, &hook));
            cleared = true;
            None
        });
        assert!(cleared);
    }

    #[test]
    fn test_same_hook_compares_identity() {
        let a: Arc<dyn Notify> = Arc::new(OneShot);
        let b: Arc<dyn Notify> = Arc::new(OneShot);
        let slot = Some(NotifierSlot {
            hook: Arc::clone(&a),
            threshold: 0,
        });
        assert!(same_hook(&slot, &a));
        assert!(!same_hook(&slot, &b));
        assert!(!same_hook(&None, &a));
    }
}
