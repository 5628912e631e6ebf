//! The SWIM protocol engine.
//!
//! The engine owns the local member record and drives three concurrent
//! activities: the probe loop, the receive loop, and suspicion expiries.
//! Every mutation of the membership table, the broadcast queue, the
//! pending-probe map, or the local incarnation happens under one mutex (the
//! serialisation point); sends, sleeps, and timer waits always run outside
//! it.

pub mod events;
mod handlers;
mod probe;
mod suspicion;

pub use events::{ErrorKind, Event, EventStream};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Result, SwimError};
use crate::member::{Member, MemberId, Status};
use crate::membership::{Change, Disseminator, MembershipTable};
use crate::message::{GossipPayload, Message};
use crate::settings::SwimConfig;
use crate::transport::Transport;

use probe::PendingProbe;
use suspicion::SuspicionTimers;

/// How many alive members receive the departing gossip on `leave`.
const LEAVE_NOTIFY_SAMPLE: usize = 3;

/// Handle to a running SWIM instance.
///
/// Cloning is cheap; all clones drive the same engine.
#[derive(Clone)]
pub struct SwimEngine {
    inner: Arc<EngineInner>,
}

pub(crate) struct EngineInner {
    pub(crate) config: SwimConfig,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) state: Mutex<EngineState>,
    seq: AtomicU64,
    pub(crate) timers: SuspicionTimers,
    events: Mutex<Option<broadcast::Sender<Event>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    pub(crate) stopped: AtomicBool,
}

/// Everything guarded by the serialisation point.
pub(crate) struct EngineState {
    pub(crate) local: Member,
    pub(crate) table: MembershipTable,
    pub(crate) disseminator: Disseminator,
    pub(crate) probes: HashMap<u64, PendingProbe>,
}

impl SwimEngine {
    /// Build an engine around a transport. The local member enters the
    /// table immediately; nothing runs until [`start`](Self::start).
    pub fn new(local: Member, config: SwimConfig, transport: Arc<dyn Transport>) -> Self {
        let (events_tx, _) = broadcast::channel(config.event_buffer.max(1));

        let mut table = MembershipTable::new();
        table.upsert(local.clone());

        let inner = Arc::new(EngineInner {
            config,
            transport,
            state: Mutex::new(EngineState {
                local,
                table,
                disseminator: Disseminator::new(),
                probes: HashMap::new(),
            }),
            seq: AtomicU64::new(0),
            timers: SuspicionTimers::new(),
            events: Mutex::new(Some(events_tx)),
            tasks: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        });
        Self { inner }
    }

    /// Spawn the probe and receive loops. Calling `start` twice, or after
    /// `stop`, is a no-op.
    pub fn start(&self) {
        let mut tasks = self.inner.tasks.lock();
        if !tasks.is_empty() || self.inner.stopped.load(Ordering::SeqCst) {
            return;
        }

        let local_id = {
            let mut st = self.inner.state.lock();
            // Seed our own record so first contacts learn the real
            // identity behind our address.
            let local = st.local.clone();
            st.disseminator.enqueue(local);
            st.local.id.clone()
        };

        info!(local = %local_id, "starting swim engine");
        tasks.push(tokio::spawn(probe::probe_loop(self.inner.clone())));
        tasks.push(tokio::spawn(handlers::receive_loop(self.inner.clone())));
    }

    /// Stop the engine: cancel the loops, all pending probe waits and
    /// suspicion timers, and close the event stream.
    pub fn stop(&self) {
        self.inner.shutdown();
    }

    /// Contact the given seeds to enter their cluster. Succeeds if at least
    /// one seed could be sent to.
    pub async fn join(&self, seeds: &[MemberId]) -> Result<()> {
        if seeds.is_empty() {
            return Err(SwimError::JoinFailed("no seeds provided".to_string()));
        }

        let mut introductions = Vec::new();
        {
            let mut st = self.inner.state.lock();
            let local = st.local.clone();
            st.disseminator.enqueue(local.clone());

            for seed in seeds {
                if *seed == local.id {
                    continue;
                }
                let fresh = Member::alive(seed.clone());
                let applied = st.table.apply(fresh.clone());
                if applied.accepted {
                    st.disseminator.enqueue(fresh);
                }
                if let Some(change) = applied.change {
                    self.inner.emit(event_for_change(&change));
                }

                let payload = self.inner.payload_locked(&mut st);
                introductions.push((seed.clone(), Message::Ping { seq: 0, payload }));
            }
        }
        if introductions.is_empty() {
            return Err(SwimError::JoinFailed(
                "all seeds name the local member".to_string(),
            ));
        }

        let mut reached = 0usize;
        for (seed, message) in &introductions {
            match self.inner.transport.send(message, seed).await {
                Ok(()) => reached += 1,
                Err(err) => warn!(seed = %seed, %err, "seed ping failed"),
            }
        }
        if reached == 0 {
            return Err(SwimError::JoinFailed(
                "could not reach any seed".to_string(),
            ));
        }

        info!(seeds = introductions.len(), reached, "join initiated");
        Ok(())
    }

    /// Leave the cluster: mark ourselves Dead, gossip the departure to a
    /// few alive members, emit [`Event::LocalLeft`], and stop.
    pub async fn leave(&self) {
        let (notifications, local_id) = {
            let mut st = self.inner.state.lock();
            st.local.status = Status::Dead;
            let record = st.local.clone();
            st.table.apply(record.clone());
            st.disseminator.enqueue(record);

            let local_id = st.local.id.clone();
            let targets = st.table.random_alive(LEAVE_NOTIFY_SAMPLE, &[local_id.clone()]);
            let mut notifications = Vec::with_capacity(targets.len());
            for target in targets {
                let seq = self.inner.next_seq();
                let payload = self.inner.payload_locked(&mut st);
                notifications.push((target.id, Message::Ping { seq, payload }));
            }
            (notifications, local_id)
        };

        for (target, message) in &notifications {
            if let Err(err) = self.inner.transport.send(message, target).await {
                debug!(member = %target, %err, "leave notification failed");
            }
        }

        self.inner.emit(Event::LocalLeft(local_id.clone()));
        info!(local = %local_id, "left the cluster");
        self.inner.shutdown();
    }

    /// Snapshot of every member currently in the table, the local one
    /// included.
    pub fn members(&self) -> Vec<Member> {
        self.inner.state.lock().table.members()
    }

    pub fn alive_count(&self) -> usize {
        self.inner.state.lock().table.alive_count()
    }

    /// The local member record, reflecting refutations.
    pub fn local(&self) -> Member {
        self.inner.state.lock().local.clone()
    }

    /// Subscribe to membership events. Streams created after `stop` are
    /// already closed.
    pub fn events(&self) -> EventStream {
        match self.inner.events.lock().as_ref() {
            Some(tx) => EventStream::new(tx.subscribe()),
            None => EventStream::closed(),
        }
    }
}

impl EngineInner {
    fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.timers.cancel_all();
        *self.events.lock() = None;
        debug!("engine stopped");
    }

    /// Next probe sequence number; wraps on overflow. Zero is reserved for
    /// join pings.
    pub(crate) fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    pub(crate) fn emit(&self, event: Event) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        if let Some(tx) = self.events.lock().as_ref() {
            let _ = tx.send(event);
        }
    }

    /// Draw the gossip payload for one outgoing message. Must be called
    /// with the serialisation point held.
    pub(crate) fn payload_locked(&self, st: &mut EngineState) -> GossipPayload {
        let limit = self.config.dissemination_limit(st.table.len());
        st.disseminator
            .payload_for_message(self.config.max_payload_size, limit)
    }
}

pub(crate) fn event_for_change(change: &Change) -> Event {
    match change {
        Change::Joined(member) => Event::Joined(member.clone()),
        Change::StatusChanged(member, _) => match member.status {
            Status::Alive => Event::Recovered(member.clone()),
            Status::Suspect => Event::Suspected(member.clone()),
            Status::Dead => Event::Failed(member.clone()),
        },
    }
}
