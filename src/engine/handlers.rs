//! Inbound message handling.
//!
//! For every message the piggybacked payload is ingested before the message
//! itself is answered or correlated, so replies always carry current gossip.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, info};

use crate::engine::events::Event;
use crate::engine::probe::PendingProbe;
use crate::engine::suspicion::arm_suspicion;
use crate::engine::{event_for_change, EngineInner, EngineState};
use crate::member::{Member, MemberId, Status};
use crate::membership::Change;
use crate::message::{GossipPayload, Message};

pub(crate) async fn receive_loop(inner: Arc<EngineInner>) {
    while let Some((message, sender)) = inner.transport.recv().await {
        if inner.stopped.load(Ordering::SeqCst) {
            break;
        }
        handle_message(&inner, message, sender).await;
    }
    debug!("transport stream ended, receive loop exiting");
}

async fn handle_message(inner: &Arc<EngineInner>, message: Message, sender: MemberId) {
    match message {
        Message::Ping { seq, payload } => handle_ping(inner, seq, payload, sender).await,
        Message::PingReq {
            seq,
            target,
            payload,
        } => handle_ping_req(inner, seq, target, payload, sender),
        Message::Ack {
            seq,
            responder,
            payload,
        } => handle_ack(inner, seq, responder, payload),
        Message::Nack { seq, target } => {
            // Informational: no probe or table state changes.
            debug!(seq, target = %target, "nack received");
        }
    }
}

async fn handle_ping(
    inner: &Arc<EngineInner>,
    seq: u64,
    payload: GossipPayload,
    sender: MemberId,
) {
    let (ack, revived) = {
        let mut st = inner.state.lock();
        ingest_locked(inner, &mut st, payload);
        observe_sender(inner, &mut st, &sender);
        let revived = revive_sender_locked(inner, &mut st, &sender);
        let reply_payload = inner.payload_locked(&mut st);
        let ack = Message::Ack {
            seq,
            responder: st.local.id.clone(),
            payload: reply_payload,
        };
        (ack, revived)
    };
    if let Some(id) = revived {
        inner.timers.cancel(&id);
    }

    if let Err(err) = inner.transport.send(&ack, &sender).await {
        debug!(member = %sender, %err, "ack send failed");
    }
}

/// A ping arriving from a suspect is itself evidence of life.
fn revive_sender_locked(
    inner: &Arc<EngineInner>,
    st: &mut EngineState,
    sender: &MemberId,
) -> Option<MemberId> {
    let current = st
        .table
        .get(sender)
        .or_else(|| st.table.find_by_address(&sender.address))
        .cloned()?;
    if current.status != Status::Suspect {
        return None;
    }

    let refreshed = current.incarnation.wrapping_add(1);
    if let Some(change) = st.table.mark_alive(&current.id, refreshed) {
        st.disseminator.enqueue(change.member().clone());
        inner.emit(event_for_change(&change));
    }
    Some(current.id)
}

/// Join-by-observation: a pinging process we have never heard of enters the
/// table alive. Senders already known under their gossip identity are
/// matched by routing address, since a Ping carries no sender field.
fn observe_sender(inner: &Arc<EngineInner>, st: &mut EngineState, sender: &MemberId) {
    if *sender == st.local.id
        || sender.address == st.local.id.address
        || st.table.has_address(&sender.address)
    {
        return;
    }

    let fresh = Member::alive(sender.clone());
    let applied = st.table.apply(fresh.clone());
    if applied.accepted {
        st.disseminator.enqueue(fresh);
    }
    if let Some(change) = applied.change {
        info!(member = %sender, "member joined by observation");
        inner.emit(event_for_change(&change));
    }
}

/// Probe the target on behalf of the requester. The wait runs in its own
/// task so the receive loop keeps draining.
fn handle_ping_req(
    inner: &Arc<EngineInner>,
    seq_req: u64,
    target: MemberId,
    payload: GossipPayload,
    requester: MemberId,
) {
    {
        let mut st = inner.state.lock();
        ingest_locked(inner, &mut st, payload);
    }

    let engine = inner.clone();
    let task = tokio::spawn(async move {
        proxy_probe(&engine, seq_req, target, requester).await;
    });
    // Track the wait so shutdown() can abort it with the loops.
    let mut tasks = inner.tasks.lock();
    tasks.retain(|t| !t.is_finished());
    tasks.push(task);
}

async fn proxy_probe(
    inner: &Arc<EngineInner>,
    seq_req: u64,
    target: MemberId,
    requester: MemberId,
) {
    if inner.stopped.load(Ordering::SeqCst) {
        return;
    }

    let (seq_local, ping) = {
        let mut st = inner.state.lock();
        let seq_local = inner.next_seq();
        st.probes
            .insert(seq_local, PendingProbe::proxy(target.clone(), requester.clone()));
        let payload = inner.payload_locked(&mut st);
        (seq_local, Message::Ping { seq: seq_local, payload })
    };

    debug!(member = %target, requester = %requester, "probing on behalf of requester");
    let sent = match inner.transport.send(&ping, &target).await {
        Ok(()) => true,
        Err(err) => {
            // Unreachable target: answer with a Nack straight away.
            debug!(member = %target, %err, "proxy ping send failed");
            false
        }
    };
    let acked = sent && inner.wait_for_ack(seq_local, inner.config.ping_timeout).await;
    if let Some(pending) = inner.state.lock().probes.remove(&seq_local) {
        if !acked {
            debug!(member = %pending.target, requester = ?pending.requester,
                "indirect probe target stayed silent");
        }
    }

    if inner.stopped.load(Ordering::SeqCst) {
        return;
    }

    let reply = if acked {
        let mut st = inner.state.lock();
        let payload = inner.payload_locked(&mut st);
        Message::Ack {
            seq: seq_req,
            responder: target,
            payload,
        }
    } else {
        Message::Nack {
            seq: seq_req,
            target,
        }
    };
    if let Err(err) = inner.transport.send(&reply, &requester).await {
        debug!(member = %requester, %err, "indirect probe reply failed");
    }
}

fn handle_ack(inner: &Arc<EngineInner>, seq: u64, responder: MemberId, payload: GossipPayload) {
    {
        let mut st = inner.state.lock();
        ingest_locked(inner, &mut st, payload);

        // The ack counts only if its responder matches the recorded target.
        match st.probes.get_mut(&seq) {
            Some(pending) if pending.target == responder => pending.ack_seen = true,
            Some(pending) => {
                debug!(seq, responder = %responder, expected = %pending.target,
                    "ack responder does not match probe target");
            }
            None => {}
        }

        // Any ack vouching for a suspect is evidence of life.
        if let Some(current) = st.table.get(&responder).cloned() {
            if current.status == Status::Suspect {
                let refreshed = current.incarnation.wrapping_add(1);
                if let Some(change) = st.table.mark_alive(&responder, refreshed) {
                    st.disseminator.enqueue(change.member().clone());
                    inner.emit(event_for_change(&change));
                }
            }
        }
    }

    inner.timers.cancel(&responder);
}

/// Apply a piggybacked payload under the serialisation point: refute
/// rumours about ourselves, merge the rest through the disseminator, and
/// keep suspicion timers in step with the resulting changes.
pub(crate) fn ingest_locked(
    inner: &Arc<EngineInner>,
    st: &mut EngineState,
    payload: GossipPayload,
) {
    if payload.is_empty() {
        return;
    }

    let mut remote = Vec::with_capacity(payload.len());
    for update in payload {
        if update.id == st.local.id {
            if update.status != Status::Alive && update.incarnation >= st.local.incarnation {
                let refuted = refute_locked(st, update.incarnation);
                inner.emit(Event::IncarnationIncremented(refuted));
            }
            continue;
        }
        remote.push(update);
    }

    let changes = {
        let EngineState {
            table,
            disseminator,
            ..
        } = st;
        disseminator.ingest(remote, table)
    };

    let cluster_size = st.table.len();
    for change in &changes {
        inner.emit(event_for_change(change));
        match change {
            Change::Joined(member) | Change::StatusChanged(member, _)
                if member.status == Status::Suspect =>
            {
                arm_suspicion(inner, member.clone(), cluster_size);
            }
            Change::StatusChanged(member, _) => inner.timers.cancel(&member.id),
            Change::Joined(_) => {}
        }
    }
}

/// Advance our own incarnation past an unflattering rumour and gossip the
/// corrected record.
fn refute_locked(st: &mut EngineState, observed: u64) -> u64 {
    let refuted = observed.wrapping_add(1);
    st.local.incarnation = refuted;
    st.local.status = Status::Alive;

    let record = st.local.clone();
    st.table.apply(record.clone());
    st.disseminator.enqueue(record);
    info!(incarnation = refuted, "refuted rumour about local member");
    refuted
}
