use std::{collections::BTreeMap, path::Path, sync::Mutex};

use bincode::Options;
use rusqlite::{params, Connection};
use tracing::{debug, info};

use super::{Credit, Log, LogOp, LogRecord, Records, Staged, StorageTx};
use crate::{
    common::{Opaque, ParticipantId},
    error::{Error, Result},
    tx_desc::{Participant, ParticipantState, Tid, TxDesc},
};

/// Server-side log. Records live in memory for lookups and iteration, and in
/// the `dtm0_log` table of a SQLite database for durability. A write reaches
/// both when its storage transaction commits; a dropped transaction leaves no
/// trace.
pub struct PersistentLog {
    inner: Mutex<Inner>,
}

struct Inner {
    connection: Connection,
    records: Records,
}

// rows keep u64 fields bit-cast into SQLite's signed integers
fn to_sql(n: u64) -> i64 {
    n as i64
}

fn from_sql(n: i64) -> u64 {
    n as u64
}

fn encode_states(participants: &[Participant]) -> Vec<u8> {
    let states: Vec<_> = participants
        .iter()
        .map(|participant| (participant.id.0, participant.state.to_code()))
        .collect();
    bincode::DefaultOptions::new().serialize(&states).unwrap()
}

fn decode_states(bytes: &[u8]) -> Result<Vec<Participant>> {
    let states: Vec<(u64, u8)> = bincode::DefaultOptions::new()
        .deserialize(bytes)
        .map_err(|_| Error::Malformed)?;
    states
        .into_iter()
        .map(|(id, code)| {
            Ok(Participant {
                id: ParticipantId(id),
                state: ParticipantState::from_code(code)?,
            })
        })
        .collect()
}

impl PersistentLog {
    /// Create the log schema in `connection` if it does not exist yet, then
    /// load whatever the table already holds.
    pub fn create(connection: Connection) -> Result<Self> {
        connection.execute_batch(
            "CREATE TABLE IF NOT EXISTS dtm0_log (
                timestamp INTEGER NOT NULL,
                origin INTEGER NOT NULL,
                states BLOB NOT NULL,
                payload BLOB,
                PRIMARY KEY (timestamp, origin)
            )",
        )?;
        let mut records = Records::default();
        {
            let mut stmt = connection
                .prepare_cached("SELECT timestamp, origin, states, payload FROM dtm0_log")?;
            let mut row_list = stmt.query([])?;
            while let Some(row) = row_list.next()? {
                let id = Tid::new(
                    from_sql(row.get(0)?),
                    ParticipantId(from_sql(row.get(1)?)),
                );
                let states: Vec<u8> = row.get(2)?;
                let payload: Option<Opaque> = row.get(3)?;
                records.insert_loaded(LogRecord {
                    txd: TxDesc {
                        id,
                        participants: decode_states(&states)?,
                    },
                    payload,
                });
            }
        }
        info!("persistent log ready with {} records", records.len());
        Ok(Self {
            inner: Mutex::new(Inner {
                connection,
                records,
            }),
        })
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::create(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::create(Connection::open_in_memory()?)
    }
}

impl Log for PersistentLog {
    fn is_persistent(&self) -> bool {
        true
    }

    fn credit(&self, op: LogOp, txd: &TxDesc, payload: Option<&[u8]>) -> Credit {
        self.inner.lock().unwrap().records.credit(op, txd, payload)
    }

    /// Staged updates are merged against the record as it stands at commit
    /// time, so transactions on one tid may commit in any order. The memory
    /// table follows only once the SQLite transaction has committed.
    fn commit(&self, tx: StorageTx) -> Result<()> {
        if tx.staged.is_empty() {
            return Ok(());
        }
        let n_staged = tx.staged.len();
        let mut inner = self.inner.lock().unwrap();
        let Inner {
            connection,
            records,
        } = &mut *inner;
        let mut written: BTreeMap<Tid, Option<LogRecord>> = BTreeMap::new();
        let transaction = connection.transaction()?;
        for staged in tx.staged {
            match staged {
                Staged::Put(update) => {
                    let id = update.txd.id;
                    let current = match written.get(&id) {
                        Some(record) => record.clone(),
                        None => records.find(&id).ok(),
                    };
                    let record = match current {
                        Some(current) => current.merged(update)?,
                        None => update,
                    };
                    transaction
                        .prepare_cached(
                            "INSERT OR REPLACE INTO dtm0_log (timestamp, origin, states, payload)
                            VALUES (?, ?, ?, ?)",
                        )?
                        .execute(params![
                            to_sql(id.timestamp),
                            to_sql(id.origin.0),
                            encode_states(&record.txd.participants),
                            &record.payload,
                        ])?;
                    written.insert(id, Some(record));
                }
                Staged::Remove(tid) => {
                    transaction
                        .prepare_cached("DELETE FROM dtm0_log WHERE timestamp = ? AND origin = ?")?
                        .execute(params![to_sql(tid.timestamp), to_sql(tid.origin.0)])?;
                    written.insert(tid, None);
                }
            }
        }
        transaction.commit()?;
        for (tid, record) in written {
            match record {
                Some(record) => {
                    records.insert_loaded(record);
                }
                None => records.remove(&tid),
            }
        }
        debug!("committed {} staged writes", n_staged);
        Ok(())
    }

    fn update(&self, tx: &mut StorageTx, txd: &TxDesc, payload: Option<Opaque>) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .records
            .check_update(tx, txd, payload.as_deref())?;
        tx.staged.push(Staged::Put(LogRecord {
            txd: txd.copy(),
            payload,
        }));
        Ok(())
    }

    fn find(&self, tid: &Tid) -> Result<LogRecord> {
        self.inner.lock().unwrap().records.find(tid)
    }

    fn prune(&self, tx: &mut StorageTx, tid: &Tid) -> Result<()> {
        let removed = self
            .inner
            .lock()
            .unwrap()
            .records
            .check_prune_tx(tx, tid, true)?;
        tx.staged.extend(removed.into_iter().map(Staged::Remove));
        Ok(())
    }

    fn deliver_notice(&self, update: &TxDesc) -> Result<()> {
        self.update_now(LogOp::Persistent, update, None)
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
