use std::{collections::HashMap, sync::Mutex};

use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use super::{Credit, Log, LogOp, LogRecord, Records, StorageTx};
use crate::{
    common::Opaque,
    error::Result,
    tx_desc::{Tid, TxDesc},
};

/// Client-side log. Nothing survives the process; storage transactions are
/// only used for credit accounting.
#[derive(Default)]
pub struct VolatileLog {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    records: Records,
    // open dtx handles own their records, so notices for them are handed over
    // instead of being applied here
    sinks: HashMap<Tid, UnboundedSender<TxDesc>>,
}

impl VolatileLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every record. Used at shutdown.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.records.clear();
        inner.sinks.clear();
    }
}

impl Log for VolatileLog {
    fn is_persistent(&self) -> bool {
        false
    }

    fn credit(&self, op: LogOp, txd: &TxDesc, payload: Option<&[u8]>) -> Credit {
        self.inner.lock().unwrap().records.credit(op, txd, payload)
    }

    fn commit(&self, _tx: StorageTx) -> Result<()> {
        Ok(())
    }

    fn update(&self, tx: &mut StorageTx, txd: &TxDesc, payload: Option<Opaque>) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .records
            .update(tx, txd, payload)
            .map(|_| ())
    }

    fn find(&self, tid: &Tid) -> Result<LogRecord> {
        self.inner.lock().unwrap().records.find(tid)
    }

    fn prune(&self, tx: &mut StorageTx, tid: &Tid) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        for id in inner.records.prune(tx, tid, false)? {
            inner.sinks.remove(&id);
        }
        Ok(())
    }

    fn deliver_notice(&self, update: &TxDesc) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(sink) = inner.sinks.get(&update.id) {
            if sink.send(update.copy()).is_ok() {
                return Ok(());
            }
            inner.sinks.remove(&update.id);
        }
        // owner is gone (already done, or never existed here): keep the
        // progress as a record without payload
        debug!("notice without owner {}", update);
        let mut tx = StorageTx::new(inner.records.credit(LogOp::Persistent, update, None));
        inner.records.update(&mut tx, update, None).map(|_| ())
    }

    fn attach(&self, tid: Tid, sink: UnboundedSender<TxDesc>) {
        self.inner.lock().unwrap().sinks.insert(tid, sink);
    }

    fn detach(&self, tid: &Tid) {
        self.inner.lock().unwrap().sinks.remove(tid);
    }

    fn last_tid(&self) -> Option<Tid> {
        self.inner.lock().unwrap().records.last_tid()
    }

    fn next_after(&self, cursor: Option<&Tid>) -> Option<LogRecord> {
        self.inner.lock().unwrap().records.next_after(cursor)
    }

    fn len(&self) -> usize {
        self.inner.lock().unwrap().records.len()
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc::unbounded_channel;

    use super::*;
    use crate::{
        common::ParticipantId,
        error::Error,
        log::tests::{self, txd},
        tx_desc::ParticipantState::*,
    };

    #[test]
    fn contract() {
        tests::update_never_regresses(&VolatileLog::new());
        tests::payload_attaches_once(&VolatileLog::new());
        tests::prune_empty_is_not_found(&VolatileLog::new());
        tests::ordered_iteration(&VolatileLog::new());
    }

    #[test]
    fn prune_is_unconditional() {
        let log = VolatileLog::new();
        log.update_now(LogOp::Create, &txd(1, &[InProgress]), None)
            .unwrap();
        log.update_now(LogOp::Create, &txd(2, &[Executed]), None)
            .unwrap();
        log.update_now(LogOp::Create, &txd(3, &[InProgress]), None)
            .unwrap();
        log.prune_now(&Tid::new(2, ParticipantId(1))).unwrap();
        assert_eq!(log.len(), 1);
        assert!(log.find(&Tid::new(3, ParticipantId(1))).is_ok());
        assert!(matches!(
            log.prune_now(&Tid::new(2, ParticipantId(1))),
            Err(Error::NotFound)
        ));
    }

    #[test]
    fn notice_goes_to_owner() {
        let log = VolatileLog::new();
        let desc = txd(1, &[InProgress, InProgress]);
        log.update_now(LogOp::Create, &desc, None).unwrap();
        let (tx, mut rx) = unbounded_channel();
        log.attach(desc.id, tx);

        log.deliver_notice(&txd(1, &[Persistent, InProgress])).unwrap();
        assert_eq!(rx.try_recv().unwrap(), txd(1, &[Persistent, InProgress]));
        // not applied behind the owner's back
        assert_eq!(log.find(&desc.id).unwrap().txd, desc);
    }

    #[test]
    fn notice_without_owner_is_recorded() {
        let log = VolatileLog::new();
        let (tx, rx) = unbounded_channel();
        log.attach(Tid::new(4, ParticipantId(1)), tx);
        drop(rx);

        log.deliver_notice(&txd(4, &[Persistent])).unwrap();
        let record = log.find(&Tid::new(4, ParticipantId(1))).unwrap();
        assert_eq!(record.payload, None);
        assert!(record.txd.is_persistent());
    }

    #[test]
    fn clear() {
        let log = VolatileLog::new();
        log.update_now(LogOp::Create, &txd(1, &[InProgress]), None)
            .unwrap();
        log.clear();
        assert!(log.is_empty());
    }
}
