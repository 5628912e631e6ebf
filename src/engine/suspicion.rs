//! Cancellable suspicion deadlines, at most one per member.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::engine::{event_for_change, EngineInner};
use crate::member::{Member, MemberId};

#[derive(Default)]
pub(crate) struct SuspicionTimers {
    timers: Mutex<HashMap<MemberId, JoinHandle<()>>>,
}

impl SuspicionTimers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a deadline for the member, replacing any existing one.
    pub fn start<F>(&self, id: MemberId, after: Duration, on_expire: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            on_expire();
        });
        if let Some(previous) = self.timers.lock().insert(id, handle) {
            previous.abort();
        }
    }

    /// Disarm the member's timer. A timer cancelled before its deadline
    /// never invokes its callback.
    pub fn cancel(&self, id: &MemberId) {
        if let Some(handle) = self.timers.lock().remove(id) {
            handle.abort();
        }
    }

    pub fn cancel_all(&self) {
        for (_, handle) in self.timers.lock().drain() {
            handle.abort();
        }
    }

    /// Forget a timer from within its own expiry callback.
    fn finished(&self, id: &MemberId) {
        self.timers.lock().remove(id);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.timers.lock().len()
    }
}

/// Start the suspect-to-dead countdown for a member.
///
/// The expiry callback re-enters the engine's serialisation point before
/// touching the table, so a refutation or ack that raced the deadline wins:
/// `mark_dead` is gated on the incarnation observed at suspicion time.
pub(crate) fn arm_suspicion(inner: &Arc<EngineInner>, member: Member, cluster_size: usize) {
    let deadline = inner.config.suspicion_timeout(cluster_size);
    debug!(member = %member.id, ?deadline, "suspicion timer armed");

    let engine = inner.clone();
    let id = member.id.clone();
    let incarnation = member.incarnation;
    inner.timers.start(member.id, deadline, move || {
        engine.timers.finished(&id);
        if engine.stopped.load(Ordering::SeqCst) {
            return;
        }

        let declared_dead = {
            let mut st = engine.state.lock();
            let change = st.table.mark_dead(&id, incarnation);
            if let Some(change) = &change {
                st.disseminator.enqueue(change.member().clone());
                engine.emit(event_for_change(change));
            }
            change.is_some()
        };
        if declared_dead {
            info!(member = %id, "suspicion expired, member declared dead");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::{sleep, Duration};

    fn id(n: &str) -> MemberId {
        MemberId::new(n, format!("{}:7946", n))
    }

    #[tokio::test]
    async fn expiry_invokes_callback_once() {
        let timers = SuspicionTimers::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = fired.clone();
        timers.start(id("a"), Duration::from_millis(10), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_prevents_future_invocation() {
        let timers = SuspicionTimers::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = fired.clone();
        timers.start(id("a"), Duration::from_millis(20), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        timers.cancel(&id("a"));

        sleep(Duration::from_millis(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(timers.len(), 0);
    }

    #[tokio::test]
    async fn restart_replaces_the_previous_timer() {
        let timers = SuspicionTimers::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let first = fired.clone();
        timers.start(id("a"), Duration::from_millis(10), move || {
            first.fetch_add(10, Ordering::SeqCst);
        });
        let second = fired.clone();
        timers.start(id("a"), Duration::from_millis(30), move || {
            second.fetch_add(1, Ordering::SeqCst);
        });

        sleep(Duration::from_millis(80)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1, "only the replacement fires");
    }

    #[tokio::test]
    async fn cancel_all_disarms_everything() {
        let timers = SuspicionTimers::new();
        let fired = Arc::new(AtomicUsize::new(0));

        for n in ["a", "b", "c"] {
            let counter = fired.clone();
            timers.start(id(n), Duration::from_millis(20), move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        timers.cancel_all();

        sleep(Duration::from_millis(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
