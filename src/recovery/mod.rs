//! Recovery machine.
//!
//! One task runs per configured participant. A task owns a bounded health
//! event queue (HEQ) for its target and picks a role from each event:
//!
//! * remote target RECOVERING: replay every record addressed to it, up to the
//!   newest tid at the start, one acknowledged REDO at a time, then END_OF_LOG;
//! * remote target FAILED: eviction of the records it originated, toward every
//!   participant that has not reported PERSISTENT for them;
//! * anything else: nothing.
//!
//! The local task additionally drains the end-of-log queue (EOLQ) and reports
//! RECOVERED once every remote participant that counts has replayed its log.

mod ops;

pub use ops::{next_matching, DefaultOps, RecoveryOps};

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use tokio::{spawn, sync::Notify};
use tracing::{debug, info, trace, warn};

use crate::{
    common::ParticipantId,
    config::ClusterConfig,
    error::Result,
    health::{HaState, ProcessEvent},
    log::LogIter,
    message::{Message, MessageFlags},
    queue::BoundedQueue,
    tx_desc::{ParticipantState, Tid},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineState {
    Init,
    Started,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EolItem {
    Eol { source: ParticipantId },
    Ha { source: ParticipantId, state: HaState },
    End,
}

#[derive(Clone)]
pub struct RecoveryMachine {
    shared: Arc<Shared>,
}

struct Shared {
    local: ParticipantId,
    ops: Arc<dyn RecoveryOps>,
    inner: Mutex<Inner>,
    stopped: Notify,
}

struct Inner {
    state: MachineState,
    task_list: Vec<TaskEntry>,
    running: usize,
    eolq: Option<Arc<BoundedQueue<EolItem>>>,
}

struct TaskEntry {
    target: ParticipantId,
    volatile: bool,
    heq: Arc<BoundedQueue<HaState>>,
}

/// What the local task knows about one remote participant.
#[derive(Debug, Clone, Copy)]
struct RemoteView {
    volatile: bool,
    last_known_ha_state: HaState,
    last_known_eol: bool,
}

impl RemoteView {
    fn is_ignored(&self) -> bool {
        self.volatile && matches!(self.last_known_ha_state, HaState::Unknown | HaState::Failed)
    }

    fn was_log_replayed(&self) -> bool {
        self.is_ignored()
            || (matches!(
                self.last_known_ha_state,
                HaState::Online | HaState::Recovering
            ) && self.last_known_eol)
    }
}

impl RecoveryMachine {
    /// One task per participant in `config`. A local participant missing from
    /// `config` simply gets no local task.
    pub fn new(local: ParticipantId, ops: Arc<dyn RecoveryOps>, config: &ClusterConfig) -> Self {
        let mut task_list = Vec::new();
        let mut eolq = None;
        for participant in &config.participants {
            if participant.id == local {
                eolq = Some(Arc::new(BoundedQueue::new(
                    format!("eolq {}", local),
                    config.eolq_capacity,
                )));
            }
            task_list.push(TaskEntry {
                target: participant.id,
                volatile: participant.volatile,
                heq: Arc::new(BoundedQueue::new(
                    format!("heq {} -> {}", local, participant.id),
                    config.heq_capacity,
                )),
            });
        }
        Self {
            shared: Arc::new(Shared {
                local,
                ops,
                inner: Mutex::new(Inner {
                    state: MachineState::Init,
                    task_list,
                    running: 0,
                    eolq,
                }),
                stopped: Notify::new(),
            }),
        }
    }

    pub fn state(&self) -> MachineState {
        self.shared.inner.lock().unwrap().state
    }

    pub fn start(&self) {
        let mut inner = self.shared.inner.lock().unwrap();
        assert_eq!(inner.state, MachineState::Init, "recovery machine started twice");
        let remote_list: HashMap<_, _> = inner
            .task_list
            .iter()
            .filter(|task| task.target != self.shared.local)
            .map(|task| {
                (
                    task.target,
                    RemoteView {
                        volatile: task.volatile,
                        last_known_ha_state: HaState::Unknown,
                        last_known_eol: false,
                    },
                )
            })
            .collect();
        let mut running = 0;
        for task in &inner.task_list {
            let shared = self.shared.clone();
            let heq = task.heq.clone();
            let (target, volatile) = (task.target, task.volatile);
            if target != self.shared.local {
                spawn(async move {
                    remote_task(&shared, target, volatile, heq).await;
                    shared.deregister();
                });
            } else if let Some(eolq) = inner.eolq.clone() {
                let remote_list = remote_list.clone();
                spawn(async move {
                    local_task(&shared, heq, eolq, volatile, remote_list).await;
                    shared.deregister();
                });
            } else {
                continue;
            }
            running += 1;
        }
        inner.running = running;
        inner.state = if inner.running == 0 {
            MachineState::Stopped
        } else {
            MachineState::Started
        };
        info!("recovery machine {} started with {} tasks", self.shared.local, inner.running);
    }

    /// Post a health transition of `target`. Remote transitions are mirrored to
    /// the local task through the EOLQ.
    pub fn ha_event(&self, target: ParticipantId, state: HaState) {
        let inner = self.shared.inner.lock().unwrap();
        let task = match inner.task_list.iter().find(|task| task.target == target) {
            Some(task) => task,
            None => {
                debug!("ha event {} for unknown participant {}", state, target);
                return;
            }
        };
        trace!("{}: heq {} <- {}", self.shared.local, target, state);
        task.heq.put(state);
        if target != self.shared.local {
            if let Some(eolq) = &inner.eolq {
                eolq.put(EolItem::Ha {
                    source: target,
                    state,
                });
            }
        }
    }

    /// Feed an incoming REDO. Only END_OF_LOG markers matter here; the record
    /// itself was already merged by the receiver.
    pub fn redo_post(&self, message: &Message) {
        if !message.is_eol() {
            return;
        }
        let inner = self.shared.inner.lock().unwrap();
        match (&inner.eolq, inner.state) {
            (Some(eolq), MachineState::Started) => {
                if !eolq.put(EolItem::Eol {
                    source: message.initiator,
                }) {
                    trace!("end of log from {} after local recovery", message.initiator);
                }
            }
            _ => warn!(
                "{}: end of log from {} while local recovery is not running",
                self.shared.local, message.initiator
            ),
        }
    }

    /// End every queue and wait until all tasks have terminated. Returns at
    /// once for a machine that never started.
    pub async fn stop(&self) {
        let notified = {
            let inner = self.shared.inner.lock().unwrap();
            if inner.state != MachineState::Started {
                return;
            }
            for task in &inner.task_list {
                task.heq.end();
            }
            if let Some(eolq) = &inner.eolq {
                eolq.put(EolItem::End);
                eolq.end();
            }
            // created under the lock, so the last deregister cannot be missed
            self.shared.stopped.notified()
        };
        notified.await;
        info!("recovery machine {} stopped", self.shared.local);
    }
}

impl Shared {
    fn deregister(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.running -= 1;
        if inner.running == 0 {
            inner.state = MachineState::Stopped;
            self.stopped.notify_waiters();
        }
    }
}

async fn remote_task(
    shared: &Shared,
    target: ParticipantId,
    volatile: bool,
    heq: Arc<BoundedQueue<HaState>>,
) {
    while let Some(state) = heq.get().await {
        trace!("{}: task {} observed {}", shared.local, target, state);
        let result = match state {
            HaState::Recovering if volatile => Ok(()),
            HaState::Recovering => remote_recovery(shared, target).await,
            HaState::Failed => eviction(shared, target).await,
            // TRANSIENT may come back with its log intact, so only FAILED
            // evicts
            _ => Ok(()),
        };
        if let Err(err) = result {
            warn!(
                "{}: recovery of {} interrupted: {}",
                shared.local, target, err
            );
        }
    }
    trace!("{}: task {} ends", shared.local, target);
}

async fn remote_recovery(shared: &Shared, target: ParticipantId) -> Result<()> {
    let watermark = shared.ops.last_tid();
    info!(
        "{}: replaying log to {} up to {:?}",
        shared.local, target, watermark
    );
    if let Some(watermark) = watermark {
        let mut iter = shared.ops.log_iter_init();
        let result = replay(shared, target, watermark, &mut iter).await;
        shared.ops.log_iter_fini(iter);
        result?;
    }
    shared
        .ops
        .redo_post(target, Message::end_of_log(shared.local))
        .await
}

async fn replay(
    shared: &Shared,
    target: ParticipantId,
    watermark: Tid,
    iter: &mut LogIter,
) -> Result<()> {
    while let Some(record) = shared.ops.log_iter_next(iter, Some(target), None) {
        if record.txd.id > watermark {
            break;
        }
        trace!("{}: redo {} to {}", shared.local, record.txd.id, target);
        shared
            .ops
            .redo_post(target, Message::redo(shared.local, record, MessageFlags::NONE))
            .await?;
    }
    Ok(())
}

async fn eviction(shared: &Shared, target: ParticipantId) -> Result<()> {
    let watermark = match shared.ops.last_tid() {
        Some(watermark) => watermark,
        None => return Ok(()),
    };
    info!("{}: evicting {} up to {}", shared.local, target, watermark);
    let mut iter = shared.ops.log_iter_init();
    let result = evict(shared, target, watermark, &mut iter).await;
    shared.ops.log_iter_fini(iter);
    result
}

async fn evict(
    shared: &Shared,
    target: ParticipantId,
    watermark: Tid,
    iter: &mut LogIter,
) -> Result<()> {
    while let Some(record) = shared.ops.log_iter_next(iter, None, Some(target)) {
        if record.txd.id > watermark {
            break;
        }
        let lagging: Vec<_> = record
            .txd
            .participants
            .iter()
            .filter(|participant| {
                participant.state != ParticipantState::Persistent
                    && participant.id != target
                    && participant.id != shared.local
            })
            .map(|participant| participant.id)
            .collect();
        for participant in lagging {
            trace!(
                "{}: eviction redo {} to {}",
                shared.local,
                record.txd.id,
                participant
            );
            let message = Message::redo(shared.local, record.clone(), MessageFlags::EVICTION);
            shared.ops.redo_post(participant, message).await?;
        }
    }
    Ok(())
}

async fn local_task(
    shared: &Shared,
    heq: Arc<BoundedQueue<HaState>>,
    eolq: Arc<BoundedQueue<EolItem>>,
    volatile: bool,
    mut remote_list: HashMap<ParticipantId, RemoteView>,
) {
    // nothing to replay into a participant without durable storage
    let mut recovered = volatile;
    if let Some(state) = wait_for_start(&heq).await {
        if state == HaState::Online {
            warn!("{}: told to skip recovery", shared.local);
            recovered = true;
        }
        debug!("{}: local recovery waits for end of log", shared.local);
        while !recovered {
            match eolq.get().await {
                Some(EolItem::Eol { source }) => {
                    if let Some(view) = remote_list.get_mut(&source) {
                        view.last_known_eol = true;
                    }
                }
                Some(EolItem::Ha { source, state }) => {
                    if let Some(view) = remote_list.get_mut(&source) {
                        view.last_known_ha_state = state;
                        if matches!(state, HaState::Transient | HaState::Failed) {
                            view.last_known_eol = false;
                        }
                    }
                }
                Some(EolItem::End) | None => break,
            }
            recovered = is_local_recovery_completed(shared.local, &remote_list);
        }
        if recovered {
            info!("{}: recovered", shared.local);
            shared.ops.ha_event_post(shared.local, ProcessEvent::Recovered);
        }
    }

    eolq.finish();
    while heq.get().await.is_some() {}
}

/// The state that starts local recovery: RECOVERING, or ONLINE which skips
/// it. `None` once the queue has ended.
async fn wait_for_start(heq: &BoundedQueue<HaState>) -> Option<HaState> {
    while let Some(state) = heq.get().await {
        if matches!(state, HaState::Recovering | HaState::Online) {
            return Some(state);
        }
    }
    None
}

// TODO: a participant that stays RECOVERING without ever sending END_OF_LOG
// holds local recovery forever; a timeout would need a health-side policy.
fn is_local_recovery_completed(
    local: ParticipantId,
    remote_list: &HashMap<ParticipantId, RemoteView>,
) -> bool {
    if remote_list.is_empty() {
        warn!("{}: no remote participant, recovery cannot complete", local);
        return false;
    }
    remote_list.values().all(RemoteView::was_log_replayed)
}
