//! Transaction descriptor: a transaction id plus the replication progress of
//! every participant.

use std::{
    cmp::Ordering,
    fmt::{self, Display, Formatter},
};

use serde_derive::{Deserialize, Serialize};

use crate::{
    common::ParticipantId,
    error::{Error, Result},
};

pub type Timestamp = u64;

/// Transaction id. Ordered by timestamp first, originator second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Tid {
    pub timestamp: Timestamp,
    pub origin: ParticipantId,
}

impl Tid {
    pub fn new(timestamp: Timestamp, origin: ParticipantId) -> Self {
        Self { timestamp, origin }
    }

    pub fn is_valid(&self) -> bool {
        self.timestamp != 0 && self.timestamp != Timestamp::MAX && self.origin.is_valid()
    }
}

impl Ord for Tid {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then(self.origin.cmp(&other.origin))
    }
}

impl PartialOrd for Tid {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Display for Tid {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.timestamp, self.origin)
    }
}

/// Progress of one participant. Never decreases for the lifetime of a
/// transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ParticipantState {
    Init,
    InProgress,
    Executed,
    Persistent,
}

impl Default for ParticipantState {
    fn default() -> Self {
        Self::Init
    }
}

impl ParticipantState {
    pub(crate) fn to_code(self) -> u8 {
        self as u8
    }

    pub(crate) fn from_code(code: u8) -> Result<Self> {
        Ok(match code {
            0 => Self::Init,
            1 => Self::InProgress,
            2 => Self::Executed,
            3 => Self::Persistent,
            _ => return Err(Error::protocol(format!("unknown participant state {}", code))),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Participant {
    pub id: ParticipantId,
    pub state: ParticipantState,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TxDesc {
    pub id: Tid,
    pub participants: Vec<Participant>,
}

impl TxDesc {
    /// Descriptor with `n` unassigned participant slots.
    pub fn init(n: usize) -> Result<Self> {
        let mut participants = Vec::new();
        participants
            .try_reserve_exact(n)
            .map_err(|_| Error::OutOfMemory)?;
        participants.resize(n, Participant::default());
        Ok(Self {
            id: Tid::default(),
            participants,
        })
    }

    pub fn new(id: Tid, participants: impl IntoIterator<Item = (ParticipantId, ParticipantState)>) -> Self {
        Self {
            id,
            participants: participants
                .into_iter()
                .map(|(id, state)| Participant { id, state })
                .collect(),
        }
    }

    /// Deep copy. Kept as a named operation because callers hand descriptors
    /// across ownership boundaries (dtx to log, log to wire).
    pub fn copy(&self) -> Self {
        self.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn is_well_formed(&self) -> bool {
        self.id.is_valid()
            && self.participants.iter().enumerate().all(|(i, participant)| {
                participant.id.is_valid()
                    && self.participants[..i]
                        .iter()
                        .all(|other| other.id != participant.id)
            })
    }

    pub fn has_same_participants(&self, other: &Self) -> bool {
        self.participants.len() == other.participants.len()
            && self
                .participants
                .iter()
                .zip(&other.participants)
                .all(|(a, b)| a.id == b.id)
    }

    /// Merge `update` into `self`: every participant state becomes the max of
    /// both sides.
    pub fn apply(&mut self, update: &Self) -> Result<()> {
        if self.id != update.id {
            return Err(Error::protocol(format!(
                "apply across transactions: {} <- {}",
                self.id, update.id
            )));
        }
        if !self.has_same_participants(update) {
            return Err(Error::protocol(format!(
                "participant set mismatch for {}",
                self.id
            )));
        }
        for (target, source) in self.participants.iter_mut().zip(&update.participants) {
            target.state = target.state.max(source.state);
        }
        Ok(())
    }

    pub fn all_in_state(&self, state: ParticipantState) -> bool {
        self.participants
            .iter()
            .all(|participant| participant.state == state)
    }

    pub fn is_persistent(&self) -> bool {
        self.all_in_state(ParticipantState::Persistent)
    }

    pub fn position(&self, id: ParticipantId) -> Option<usize> {
        self.participants
            .iter()
            .position(|participant| participant.id == id)
    }

    pub fn participated(&self, id: ParticipantId) -> bool {
        self.position(id).is_some()
    }

    pub fn state_of(&self, id: ParticipantId) -> Option<ParticipantState> {
        self.position(id).map(|i| self.participants[i].state)
    }

    /// Raise the state of participant `id`, if present.
    pub fn raise(&mut self, id: ParticipantId, state: ParticipantState) -> bool {
        if let Some(i) = self.position(id) {
            let slot = &mut self.participants[i].state;
            *slot = (*slot).max(state);
            true
        } else {
            false
        }
    }
}

impl Display for TxDesc {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} [", self.id)?;
        for (i, participant) in self.participants.iter().enumerate() {
            if i != 0 {
                write!(f, " ")?;
            }
            write!(f, "{}:{:?}", participant.id, participant.state)?;
        }
        write!(f, "]")
    }
}
