//! Local transaction state machine.
//!
//! ```text
//! INIT -close-> IN_PROGRESS -first ack-> EXECUTED -all acked-> EXECUTED_ALL
//!      -all persistent-> STABLE -finalize-> DONE
//! IN_PROGRESS -fail-> FAILED
//! ```
//!
//! The move to EXECUTED_ALL is posted as a deferred step and applied by
//! [`Dtx::run_deferred`], never in the same step as the ack that triggered it.
//! Persistence notices reaching the log while the dtx is open are routed to the
//! same deferred queue.

use std::sync::Arc;

use tokio::{
    select,
    sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
};
use tracing::{debug, trace};

use crate::{
    clock::ClockSource,
    common::{Opaque, ParticipantId},
    config::ClusterConfig,
    error::{Error, Result},
    log::{Log, LogOp},
    tx_desc::{ParticipantState, Tid, TxDesc},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DtxState {
    Init,
    InProgress,
    Executed,
    ExecutedAll,
    Stable,
    Done,
    Failed,
}

#[derive(Debug)]
enum Deferred {
    ExecutedAll,
}

pub struct Dtx<L: Log> {
    log: Arc<L>,
    clock: Arc<ClockSource>,
    config: Arc<ClusterConfig>,
    local: ParticipantId,

    state: DtxState,
    txd: TxDesc,
    opened: bool,
    acked: Vec<bool>,
    nr_executed: usize,

    deferred_tx: UnboundedSender<Deferred>,
    deferred_rx: UnboundedReceiver<Deferred>,
    notice_tx: UnboundedSender<TxDesc>,
    notice_rx: UnboundedReceiver<TxDesc>,
}

impl<L: Log> Dtx<L> {
    pub fn new(
        log: Arc<L>,
        clock: Arc<ClockSource>,
        config: Arc<ClusterConfig>,
        local: ParticipantId,
    ) -> Self {
        let (deferred_tx, deferred_rx) = unbounded_channel();
        let (notice_tx, notice_rx) = unbounded_channel();
        Self {
            log,
            clock,
            config,
            local,
            state: DtxState::Init,
            txd: TxDesc::default(),
            opened: false,
            acked: Vec::new(),
            nr_executed: 0,
            deferred_tx,
            deferred_rx,
            notice_tx,
            notice_rx,
        }
    }

    pub fn state(&self) -> DtxState {
        self.state
    }

    pub fn tid(&self) -> Tid {
        self.txd.id
    }

    pub fn copy_txd(&self) -> TxDesc {
        self.txd.copy()
    }

    pub fn nr_executed(&self) -> usize {
        self.nr_executed
    }

    fn expect_state(&self, expected: &[DtxState], operation: &str) -> Result<()> {
        if expected.contains(&self.state) {
            Ok(())
        } else {
            Err(Error::protocol(format!(
                "{} in state {:?}",
                operation, self.state
            )))
        }
    }

    fn set_state(&mut self, state: DtxState) {
        trace!("dtx {} {:?} -> {:?}", self.txd.id, self.state, state);
        self.state = state;
    }

    /// Allocate `n` participant slots and assign the transaction id.
    pub fn open(&mut self, n: usize) -> Result<()> {
        self.expect_state(&[DtxState::Init], "open")?;
        if self.opened {
            return Err(Error::protocol("dtx opened twice"));
        }
        self.txd = TxDesc::init(n)?;
        self.acked = vec![false; n];
        self.prepare()?;
        self.opened = true;
        Ok(())
    }

    fn prepare(&mut self) -> Result<()> {
        self.txd.id = Tid::new(self.clock.now()?, self.local);
        debug_assert!(self.txd.id.is_valid());
        Ok(())
    }

    /// Resolve `user_service` to its DTM0 participant and put it in slot
    /// `index`.
    pub fn assign_participant(&mut self, index: usize, user_service: u64) -> Result<()> {
        self.expect_state(&[DtxState::Init], "assign")?;
        let target = self.config.resolve_service(user_service)?;
        let slot = self
            .txd
            .participants
            .get_mut(index)
            .ok_or_else(|| Error::protocol(format!("participant index {} out of range", index)))?;
        if slot.id.is_valid() {
            return Err(Error::protocol(format!("participant slot {} assigned twice", index)));
        }
        slot.id = target;
        slot.state = ParticipantState::InProgress;
        debug!("dtx {} slot {}: service {} => {}", self.txd.id, index, user_service, target);
        Ok(())
    }

    /// Log the transaction. The participant list is frozen from here on.
    pub fn close(&mut self, payload: Option<Opaque>) -> Result<()> {
        self.expect_state(&[DtxState::Init], "close")?;
        if !self.opened || !self.txd.is_well_formed() {
            return Err(Error::protocol(format!("close of incomplete dtx {}", self.txd)));
        }
        self.log.update_now(LogOp::Create, &self.txd, payload)?;
        self.log.attach(self.txd.id, self.notice_tx.clone());
        self.set_state(DtxState::InProgress);
        Ok(())
    }

    /// Record the EXECUTED ack of slot `index`. A repeated ack for the same
    /// slot is ignored.
    pub fn mark_executed(&mut self, index: usize) -> Result<()> {
        self.expect_state(&[DtxState::InProgress, DtxState::Executed], "executed ack")?;
        let n = self.txd.participants.len();
        let slot = self
            .txd
            .participants
            .get_mut(index)
            .ok_or_else(|| Error::protocol(format!("participant index {} out of range", index)))?;
        assert!(slot.state >= ParticipantState::InProgress);
        if self.acked[index] {
            debug!("dtx {} duplicate ack from slot {}", self.txd.id, index);
            return Ok(());
        }
        slot.state = slot.state.max(ParticipantState::Executed);
        self.acked[index] = true;
        self.nr_executed += 1;
        if self.state == DtxState::InProgress {
            self.set_state(DtxState::Executed);
        }
        self.log.update_now(LogOp::Executed, &self.txd, None)?;
        if self.nr_executed == n {
            self.deferred_tx
                .send(Deferred::ExecutedAll)
                .map_err(|_| Error::Shutdown)?;
        }
        Ok(())
    }

    /// Merge a persistence notice. Late notices for a finished dtx are
    /// accepted and only recorded in the log.
    pub fn apply_persistence_notice(&mut self, update: &TxDesc) -> Result<()> {
        if self.state == DtxState::Done {
            if let Err(Error::NotFound) = self.log.find(&update.id) {
                self.log.update_now(LogOp::Persistent, update, None)?;
            }
            return Ok(());
        }
        if self.state == DtxState::Init || self.state == DtxState::Failed {
            return Err(Error::protocol(format!(
                "persistence notice in state {:?}",
                self.state
            )));
        }
        self.txd.apply(update)?;
        self.log.update_now(LogOp::Persistent, &self.txd, None)?;
        if self.state == DtxState::ExecutedAll && self.txd.is_persistent() {
            self.set_state(DtxState::Stable);
        }
        Ok(())
    }

    /// Apply every deferred step queued so far. Returns how many ran.
    pub fn run_deferred(&mut self) -> Result<usize> {
        let mut count = 0;
        loop {
            if let Ok(step) = self.deferred_rx.try_recv() {
                self.run_step(step);
            } else if let Ok(update) = self.notice_rx.try_recv() {
                self.apply_persistence_notice(&update)?;
            } else {
                return Ok(count);
            }
            count += 1;
        }
    }

    fn run_step(&mut self, step: Deferred) {
        match step {
            Deferred::ExecutedAll => {
                assert_eq!(self.state, DtxState::Executed);
                assert_eq!(self.nr_executed, self.txd.participants.len());
                self.set_state(DtxState::ExecutedAll);
                if self.txd.is_persistent() {
                    self.set_state(DtxState::Stable);
                }
            }
        }
    }

    /// Suspend until the dtx is STABLE, applying deferred steps as they
    /// arrive.
    pub async fn wait_stable(&mut self) -> Result<()> {
        loop {
            self.run_deferred()?;
            match self.state {
                DtxState::Stable | DtxState::Done => return Ok(()),
                DtxState::Failed => return Err(Error::protocol("dtx failed")),
                _ => {}
            }
            select! {
                Some(step) = self.deferred_rx.recv() => self.run_step(step),
                Some(update) = self.notice_rx.recv() => self.apply_persistence_notice(&update)?,
                else => return Err(Error::Shutdown),
            }
        }
    }

    pub fn fail(&mut self, reason: &str) -> Result<()> {
        self.expect_state(&[DtxState::InProgress], "fail")?;
        debug!("dtx {} failed: {}", self.txd.id, reason);
        self.log.detach(&self.txd.id);
        self.set_state(DtxState::Failed);
        Ok(())
    }

    pub fn finalize(&mut self) -> Result<()> {
        self.expect_state(&[DtxState::Stable], "finalize")?;
        self.log.detach(&self.txd.id);
        self.set_state(DtxState::Done);
        Ok(())
    }
}

impl<L: Log> Drop for Dtx<L> {
    fn drop(&mut self) {
        if self.opened {
            self.log.detach(&self.txd.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        log::{PersistentLog, VolatileLog},
        tx_desc::ParticipantState::*,
    };

    fn config() -> Arc<ClusterConfig> {
        let mut config = ClusterConfig::default();
        for i in 1..=3 {
            config.push_participant(ParticipantId(i), format!("replica-{}", i - 1), false);
            config.map_service(100 + i, ParticipantId(i));
        }
        config.push_participant(ParticipantId(9), "client-A", true);
        Arc::new(config)
    }

    fn new_dtx<L: Log>(log: Arc<L>) -> Dtx<L> {
        Dtx::new(log, Arc::new(ClockSource::manual(1000)), config(), ParticipantId(9))
    }

    fn opened_dtx<L: Log>(log: Arc<L>) -> Dtx<L> {
        let mut dtx = new_dtx(log);
        dtx.open(3).unwrap();
        for i in 0..3 {
            dtx.assign_participant(i, 101 + i as u64).unwrap();
        }
        dtx
    }

    fn notice(dtx: &Dtx<impl Log>, persistent: &[usize]) -> TxDesc {
        let mut update = dtx.copy_txd();
        for participant in &mut update.participants {
            participant.state = InProgress;
        }
        for i in persistent {
            update.participants[*i].state = Persistent;
        }
        update
    }

    #[tokio::test(start_paused = true)]
    async fn lifecycle() {
        let log = Arc::new(VolatileLog::new());
        let mut dtx = opened_dtx(log.clone());
        assert_eq!(dtx.state(), DtxState::Init);
        dtx.close(Some(b"put k v".to_vec())).unwrap();
        assert_eq!(dtx.state(), DtxState::InProgress);
        let tid = dtx.tid();
        assert_eq!(log.find(&tid).unwrap().payload, Some(b"put k v".to_vec()));

        dtx.mark_executed(0).unwrap();
        assert_eq!(dtx.state(), DtxState::Executed);
        dtx.mark_executed(1).unwrap();
        dtx.mark_executed(2).unwrap();
        // the last ack only schedules the move
        assert_eq!(dtx.state(), DtxState::Executed);
        assert_eq!(dtx.run_deferred().unwrap(), 1);
        assert_eq!(dtx.state(), DtxState::ExecutedAll);

        for i in 0..3 {
            log.deliver_notice(&notice(&dtx, &[i])).unwrap();
        }
        assert!(!log.find(&tid).unwrap().txd.is_persistent());
        dtx.wait_stable().await.unwrap();
        assert_eq!(dtx.state(), DtxState::Stable);

        dtx.finalize().unwrap();
        assert_eq!(dtx.state(), DtxState::Done);
        assert!(log.find(&tid).unwrap().txd.is_persistent());
        log.prune_now(&tid).unwrap();
        assert!(log.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn notices_before_all_executed() {
        let log = Arc::new(VolatileLog::new());
        let mut dtx = opened_dtx(log.clone());
        dtx.close(None).unwrap();
        log.deliver_notice(&notice(&dtx, &[0, 1, 2])).unwrap();
        dtx.run_deferred().unwrap();
        // persistent everywhere but not every ack seen yet
        assert_eq!(dtx.state(), DtxState::InProgress);
        for i in 0..3 {
            dtx.mark_executed(i).unwrap();
        }
        dtx.run_deferred().unwrap();
        assert_eq!(dtx.state(), DtxState::Stable);
    }

    #[test]
    fn late_notice_after_done() {
        let log = Arc::new(VolatileLog::new());
        let mut dtx = opened_dtx(log.clone());
        dtx.close(None).unwrap();
        for i in 0..3 {
            dtx.mark_executed(i).unwrap();
        }
        dtx.apply_persistence_notice(&notice(&dtx, &[0, 1, 2])).unwrap();
        dtx.run_deferred().unwrap();
        dtx.finalize().unwrap();
        let late = notice(&dtx, &[1]);

        log.prune_now(&dtx.tid()).unwrap();
        dtx.apply_persistence_notice(&late).unwrap();
        assert_eq!(dtx.state(), DtxState::Done);
        let record = log.find(&late.id).unwrap();
        assert_eq!(record.payload, None);

        // the same through the log once the owner detached
        log.prune_now(&dtx.tid()).unwrap();
        log.deliver_notice(&late).unwrap();
        assert_eq!(log.find(&late.id).unwrap().payload, None);
    }

    #[test]
    fn duplicate_ack_counts_once() {
        let log = Arc::new(VolatileLog::new());
        let mut dtx = opened_dtx(log);
        dtx.close(None).unwrap();
        dtx.mark_executed(0).unwrap();
        dtx.mark_executed(0).unwrap();
        dtx.mark_executed(1).unwrap();
        assert_eq!(dtx.nr_executed(), 2);
        dtx.run_deferred().unwrap();
        assert_eq!(dtx.state(), DtxState::Executed);

        dtx.mark_executed(2).unwrap();
        dtx.mark_executed(2).unwrap();
        assert_eq!(dtx.run_deferred().unwrap(), 1);
        assert_eq!(dtx.state(), DtxState::ExecutedAll);
        assert!(dtx.copy_txd().all_in_state(Executed));
    }

    #[test]
    fn unresolvable_participant() {
        let mut dtx = new_dtx(Arc::new(VolatileLog::new()));
        dtx.open(1).unwrap();
        assert!(matches!(dtx.assign_participant(0, 555), Err(Error::NotFound)));
        assert!(matches!(dtx.assign_participant(1, 101), Err(Error::Protocol(_))));
        assert!(matches!(dtx.close(None), Err(Error::Protocol(_))));
    }

    #[test]
    fn failure_is_terminal() {
        let log = Arc::new(PersistentLog::open_in_memory().unwrap());
        let mut dtx = opened_dtx(log);
        dtx.close(None).unwrap();
        dtx.fail("execution error").unwrap();
        assert_eq!(dtx.state(), DtxState::Failed);
        assert!(dtx.mark_executed(0).is_err());
        assert!(dtx.finalize().is_err());
    }

    #[test]
    fn mismatched_notice_is_protocol() {
        let log = Arc::new(VolatileLog::new());
        let mut dtx = opened_dtx(log);
        dtx.close(None).unwrap();
        let mut foreign = dtx.copy_txd();
        foreign.participants.pop();
        assert!(matches!(
            dtx.apply_persistence_notice(&foreign),
            Err(Error::Protocol(_))
        ));
    }
}
