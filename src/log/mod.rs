//! Distributed transaction log.
//!
//! Two implementations share one contract: [`VolatileLog`] keeps records in
//! memory on the client side, [`PersistentLog`] backs them with SQLite on the
//! server side. Both guard their whole state with a single lock, and every
//! mutating call runs inside a [`StorageTx`] opened with a reserved [`Credit`].

pub mod persistent;
pub mod volatile;

use std::{
    collections::BTreeMap,
    ops::{AddAssign, Bound},
};

use tokio::sync::mpsc::UnboundedSender;
use tracing::trace;

pub use persistent::PersistentLog;
pub use volatile::VolatileLog;

use crate::{
    common::{encoded_len, Opaque},
    error::{Error, Result},
    tx_desc::{Tid, TxDesc},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOp {
    Create,
    Sent,
    Executed,
    Persistent,
    Redo,
    Prune,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Credit {
    pub records: u64,
    pub bytes: u64,
}

impl AddAssign for Credit {
    fn add_assign(&mut self, other: Self) {
        self.records += other.records;
        self.bytes += other.bytes;
    }
}

impl Credit {
    fn covers(&self, other: &Self) -> bool {
        self.records >= other.records && self.bytes >= other.bytes
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub txd: TxDesc,
    pub payload: Option<Opaque>,
}

impl LogRecord {
    /// `self` with `update` merged in. A payload, once attached, is kept.
    pub(crate) fn merged(mut self, update: LogRecord) -> Result<Self> {
        self.txd.apply(&update.txd)?;
        if self.payload.is_none() {
            self.payload = update.payload;
        }
        Ok(self)
    }
}

#[derive(Debug)]
pub(crate) enum Staged {
    Put(LogRecord),
    Remove(Tid),
}

/// Durable-storage transaction. Writes are staged here and become durable on
/// [`Log::commit`].
#[derive(Debug)]
pub struct StorageTx {
    reserved: Credit,
    used: Credit,
    pub(crate) staged: Vec<Staged>,
}

impl StorageTx {
    pub fn new(reserved: Credit) -> Self {
        Self {
            reserved,
            used: Credit::default(),
            staged: Vec::new(),
        }
    }

    pub fn reserved(&self) -> Credit {
        self.reserved
    }

    pub fn used(&self) -> Credit {
        self.used
    }

    fn charge(&mut self, credit: Credit) -> Result<()> {
        let mut used = self.used;
        used += credit;
        if !self.reserved.covers(&used) {
            return Err(Error::protocol(format!(
                "storage transaction over credit: reserved {:?}, need {:?}",
                self.reserved, used
            )));
        }
        self.used = used;
        Ok(())
    }
}

pub trait Log: Send + Sync + 'static {
    fn is_persistent(&self) -> bool;

    /// Resource cost of one `op` on `txd`. Must be reserved through
    /// [`Log::begin`] before the mutating call.
    fn credit(&self, op: LogOp, txd: &TxDesc, payload: Option<&[u8]>) -> Credit;

    fn begin(&self, credit: Credit) -> StorageTx {
        StorageTx::new(credit)
    }

    fn commit(&self, tx: StorageTx) -> Result<()>;

    /// Insert the record for `txd.id`, or merge `txd` into the stored one.
    fn update(&self, tx: &mut StorageTx, txd: &TxDesc, payload: Option<Opaque>) -> Result<()>;

    fn find(&self, tid: &Tid) -> Result<LogRecord>;

    /// Remove every record up to and including `tid`.
    fn prune(&self, tx: &mut StorageTx, tid: &Tid) -> Result<()>;

    /// Apply a persistence notice that arrived from the network.
    fn deliver_notice(&self, update: &TxDesc) -> Result<()>;

    /// Hand notices for `tid` to its open dtx instead of applying them here.
    /// Only meaningful where the dtx owns the record.
    fn attach(&self, _tid: Tid, _sink: UnboundedSender<TxDesc>) {}

    fn detach(&self, _tid: &Tid) {}

    /// Newest tid in the log, the recovery watermark.
    fn last_tid(&self) -> Option<Tid>;

    /// Oldest record strictly after `cursor` (or the oldest overall).
    fn next_after(&self, cursor: Option<&Tid>) -> Option<LogRecord>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Credit, begin, update and commit in one go.
    fn update_now(&self, op: LogOp, txd: &TxDesc, payload: Option<Opaque>) -> Result<()> {
        let credit = self.credit(op, txd, payload.as_deref());
        let mut tx = self.begin(credit);
        self.update(&mut tx, txd, payload)?;
        self.commit(tx)
    }

    fn prune_now(&self, tid: &Tid) -> Result<()> {
        let credit = self.credit(LogOp::Prune, &TxDesc::new(*tid, []), None);
        let mut tx = self.begin(credit);
        self.prune(&mut tx, tid)?;
        self.commit(tx)
    }
}

/// Cursor over a log for one recovery task. Pruning behind or ahead of the
/// cursor is harmless; the next call resumes after the last returned tid.
#[derive(Debug, Default, Clone)]
pub struct LogIter {
    cursor: Option<Tid>,
}

impl LogIter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&mut self, log: &dyn Log) -> Option<LogRecord> {
        let record = log.next_after(self.cursor.as_ref())?;
        self.cursor = Some(record.txd.id);
        Some(record)
    }
}

/// In-memory record table shared by both log flavours. Callers hold the log
/// lock while using it.
#[derive(Debug, Default)]
pub(crate) struct Records(BTreeMap<Tid, LogRecord>);

impl Records {
    pub(crate) fn credit(&self, op: LogOp, txd: &TxDesc, payload: Option<&[u8]>) -> Credit {
        match op {
            LogOp::Prune => Credit {
                records: self.0.range(..=txd.id).count() as u64,
                bytes: 0,
            },
            // an update may still turn into an insert when notices overtake the
            // record they refer to
            _ => Credit {
                records: 1,
                bytes: encoded_len(txd) + payload.map(|payload| payload.len() as u64).unwrap_or(0),
            },
        }
    }

    /// Validate `txd` against the stored record and charge `tx` for writing
    /// it, without touching the table.
    pub(crate) fn check_update(
        &self,
        tx: &mut StorageTx,
        txd: &TxDesc,
        payload: Option<&[u8]>,
    ) -> Result<()> {
        if !txd.is_well_formed() {
            return Err(Error::protocol(format!("malformed descriptor {}", txd)));
        }
        let bytes = encoded_len(txd) + payload.map(|p| p.len() as u64).unwrap_or(0);
        match self.0.get(&txd.id) {
            Some(record) => {
                if !record.txd.has_same_participants(txd) {
                    return Err(Error::protocol(format!(
                        "update {} does not match stored {}",
                        txd, record.txd
                    )));
                }
                tx.charge(Credit { records: 0, bytes })
            }
            None => tx.charge(Credit { records: 1, bytes }),
        }
    }

    /// Merge `update` into the stored record, or insert it. Returns the
    /// record as stored.
    pub(crate) fn merge(&mut self, update: LogRecord) -> Result<LogRecord> {
        let record = match self.0.get(&update.txd.id) {
            Some(record) => record.clone().merged(update)?,
            None => update,
        };
        trace!("log put {}", record.txd);
        self.0.insert(record.txd.id, record.clone());
        Ok(record)
    }

    pub(crate) fn update(
        &mut self,
        tx: &mut StorageTx,
        txd: &TxDesc,
        payload: Option<Opaque>,
    ) -> Result<LogRecord> {
        self.check_update(tx, txd, payload.as_deref())?;
        self.merge(LogRecord {
            txd: txd.copy(),
            payload,
        })
    }

    pub(crate) fn find(&self, tid: &Tid) -> Result<LogRecord> {
        self.0.get(tid).cloned().ok_or(Error::NotFound)
    }

    /// Checks the prune precondition without removing anything. With
    /// `require_persistent` unset only the presence of `tid` is checked.
    pub(crate) fn check_prune(&self, tid: &Tid, require_persistent: bool) -> Result<usize> {
        let mut count = 0;
        for (id, record) in self.0.range(..=*tid) {
            if require_persistent && !record.txd.is_persistent() {
                return Err(Error::protocol(format!(
                    "prune up to {} blocked by {}",
                    tid, id
                )));
            }
            count += 1;
        }
        if self.0.contains_key(tid) {
            Ok(count)
        } else {
            Err(Error::NotFound)
        }
    }

    /// Check the prune precondition and charge `tx`. Returns the tids that a
    /// prune up to `tid` removes.
    pub(crate) fn check_prune_tx(
        &self,
        tx: &mut StorageTx,
        tid: &Tid,
        require_persistent: bool,
    ) -> Result<Vec<Tid>> {
        let count = self.check_prune(tid, require_persistent)?;
        tx.charge(Credit {
            records: count as u64,
            bytes: 0,
        })?;
        Ok(self.0.range(..=*tid).map(|(id, _)| *id).collect())
    }

    pub(crate) fn prune(
        &mut self,
        tx: &mut StorageTx,
        tid: &Tid,
        require_persistent: bool,
    ) -> Result<Vec<Tid>> {
        let removed = self.check_prune_tx(tx, tid, require_persistent)?;
        for id in &removed {
            self.0.remove(id);
        }
        trace!("log prune up to {}: {} records", tid, removed.len());
        Ok(removed)
    }

    pub(crate) fn remove(&mut self, tid: &Tid) {
        self.0.remove(tid);
    }

    pub(crate) fn clear(&mut self) {
        self.0.clear();
    }

    pub(crate) fn last_tid(&self) -> Option<Tid> {
        self.0.keys().next_back().copied()
    }

    pub(crate) fn next_after(&self, cursor: Option<&Tid>) -> Option<LogRecord> {
        let lower = match cursor {
            Some(tid) => Bound::Excluded(*tid),
            None => Bound::Unbounded,
        };
        self.0
            .range((lower, Bound::Unbounded))
            .next()
            .map(|(_, record)| record.clone())
    }

    pub(crate) fn insert_loaded(&mut self, record: LogRecord) {
        self.0.insert(record.txd.id, record);
    }

    pub(crate) fn len(&self) -> usize {
        self.0.len()
    }
}
