//! The periodic probe loop and pending-probe bookkeeping.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::engine::events::{ErrorKind, Event};
use crate::engine::suspicion::arm_suspicion;
use crate::engine::{event_for_change, EngineInner};
use crate::member::MemberId;
use crate::message::Message;

/// How often a waiter re-checks its pending probe for an ack.
const ACK_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Bookkeeping for a probe awaiting its ack, keyed by sequence number in
/// the engine state. Removed by the waiter that created it.
#[derive(Debug)]
pub(crate) struct PendingProbe {
    pub target: MemberId,
    pub started: Instant,
    pub ack_seen: bool,
    pub indirect: bool,
    /// Set when this probe runs on behalf of a PingReq requester.
    pub requester: Option<MemberId>,
}

impl PendingProbe {
    pub fn direct(target: MemberId) -> Self {
        Self {
            target,
            started: Instant::now(),
            ack_seen: false,
            indirect: false,
            requester: None,
        }
    }

    pub fn proxy(target: MemberId, requester: MemberId) -> Self {
        Self {
            requester: Some(requester),
            ..Self::direct(target)
        }
    }
}

pub(crate) async fn probe_loop(inner: Arc<EngineInner>) {
    loop {
        if inner.stopped.load(Ordering::SeqCst) {
            break;
        }
        probe_round(&inner).await;
        tokio::time::sleep(inner.config.protocol_period).await;
    }
}

/// One protocol period: probe a round-robin target directly, fall back to
/// indirect probing, and suspect the target if both stay silent.
async fn probe_round(inner: &Arc<EngineInner>) {
    if let Some(retention) = inner.config.dead_retention {
        let swept = inner.state.lock().table.sweep_dead(retention);
        for id in swept {
            debug!(member = %id, "garbage-collected dead member");
        }
    }

    let Some((target, seq, ping)) = prepare_direct_probe(inner) else {
        return;
    };

    debug!(member = %target, seq, "probing");
    let mut acked = false;
    match inner.transport.send(&ping, &target).await {
        Ok(()) => {
            acked = inner.wait_for_ack(seq, inner.config.ping_timeout).await;
        }
        Err(err) => {
            // A failed send counts as a timed-out probe.
            warn!(member = %target, %err, "ping send failed");
            inner.emit(Event::Error(ErrorKind::Transport));
        }
    }

    if !acked && !inner.stopped.load(Ordering::SeqCst) {
        acked = indirect_probe(inner, seq, &target).await;
    }

    let pending = inner.state.lock().probes.remove(&seq);
    let acked = acked || pending.as_ref().is_some_and(|p| p.ack_seen);
    if acked || inner.stopped.load(Ordering::SeqCst) {
        return;
    }

    if let Some(pending) = pending {
        debug!(
            member = %target,
            indirect = pending.indirect,
            elapsed = ?pending.started.elapsed(),
            "probe timed out"
        );
    }
    suspect(inner, &target);
}

fn prepare_direct_probe(inner: &Arc<EngineInner>) -> Option<(MemberId, u64, Message)> {
    let mut st = inner.state.lock();
    let local_id = st.local.id.clone();
    let target = st.table.next_round_robin(&[local_id])?;
    let seq = inner.next_seq();
    let payload = inner.payload_locked(&mut st);
    st.probes.insert(seq, PendingProbe::direct(target.id.clone()));
    Some((target.id, seq, Message::Ping { seq, payload }))
}

/// Ask up to `indirect_probe_count` random alive members to probe the
/// target on our behalf, then wait for any correlated ack.
async fn indirect_probe(inner: &Arc<EngineInner>, seq: u64, target: &MemberId) -> bool {
    let helpers = {
        let mut st = inner.state.lock();
        let local_id = st.local.id.clone();
        if let Some(pending) = st.probes.get_mut(&seq) {
            pending.indirect = true;
        }
        st.table
            .random_alive(inner.config.indirect_probe_count, &[local_id, target.clone()])
    };
    if helpers.is_empty() {
        return false;
    }

    debug!(member = %target, helpers = helpers.len(), "falling back to indirect probes");
    for helper in &helpers {
        let message = {
            let mut st = inner.state.lock();
            let payload = inner.payload_locked(&mut st);
            Message::PingReq {
                seq,
                target: target.clone(),
                payload,
            }
        };
        if let Err(err) = inner.transport.send(&message, &helper.id).await {
            warn!(helper = %helper.id, %err, "ping-req send failed");
        }
    }

    inner.wait_for_ack(seq, inner.config.ping_timeout).await
}

fn suspect(inner: &Arc<EngineInner>, target: &MemberId) {
    let (change, cluster_size) = {
        let mut st = inner.state.lock();
        let Some(current) = st.table.get(target).cloned() else {
            return;
        };
        let change = st.table.mark_suspect(target, current.incarnation);
        if let Some(change) = &change {
            st.disseminator.enqueue(change.member().clone());
            inner.emit(event_for_change(change));
        }
        (change, st.table.len())
    };

    if let Some(change) = change {
        info!(member = %target, "no ack from direct or indirect probes, member suspected");
        arm_suspicion(inner, change.member().clone(), cluster_size);
    }
}

impl EngineInner {
    /// Poll the pending probe until its ack flag is set or the deadline
    /// passes. The serialisation point is only held for each check, never
    /// across the sleeps.
    pub(crate) async fn wait_for_ack(&self, seq: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let st = self.state.lock();
                match st.probes.get(&seq) {
                    Some(pending) if pending.ack_seen => return true,
                    Some(_) => {}
                    None => return false,
                }
            }
            if Instant::now() >= deadline || self.stopped.load(Ordering::SeqCst) {
                return false;
            }
            tokio::time::sleep(ACK_POLL_INTERVAL).await;
        }
    }
}
