use std::{
    fmt::{self, Display, Formatter},
    ops::BitOr,
};

use serde_derive::{Deserialize, Serialize};

use crate::{
    common::{Opaque, ParticipantId},
    error::RemoteError,
    log::LogRecord,
    tx_desc::TxDesc,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    /// Test only: ask a persistent participant to execute.
    Execute,
    /// Test only: execution acknowledgement.
    Executed,
    /// Persistence notice.
    Persistent,
    /// Replay of a logged transaction.
    Redo,
    Test,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MessageFlags(u8);

impl MessageFlags {
    pub const NONE: Self = Self(0);
    pub const END_OF_LOG: Self = Self(1);
    pub const EVICTION: Self = Self(1 << 1);

    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for MessageFlags {
    type Output = Self;
    fn bitor(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

/// One replication message. `initiator` and `flags` are only meaningful for
/// REDO.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub kind: MessageKind,
    pub txd: TxDesc,
    pub payload: Opaque,
    pub initiator: ParticipantId,
    pub flags: MessageFlags,
}

impl Message {
    fn new(kind: MessageKind, txd: TxDesc, payload: Opaque) -> Self {
        Self {
            kind,
            txd,
            payload,
            initiator: ParticipantId::INVALID,
            flags: MessageFlags::NONE,
        }
    }

    pub fn persistent(txd: TxDesc) -> Self {
        Self::new(MessageKind::Persistent, txd, Opaque::new())
    }

    pub fn execute(txd: TxDesc, payload: Opaque) -> Self {
        Self::new(MessageKind::Execute, txd, payload)
    }

    pub fn executed(txd: TxDesc) -> Self {
        Self::new(MessageKind::Executed, txd, Opaque::new())
    }

    pub fn test(payload: Opaque) -> Self {
        Self::new(MessageKind::Test, TxDesc::default(), payload)
    }

    pub fn redo(initiator: ParticipantId, record: LogRecord, flags: MessageFlags) -> Self {
        Self {
            initiator,
            flags,
            ..Self::new(MessageKind::Redo, record.txd, record.payload.unwrap_or_default())
        }
    }

    /// Marker closing a log replay. Carries no record.
    pub fn end_of_log(initiator: ParticipantId) -> Self {
        Self {
            initiator,
            flags: MessageFlags::END_OF_LOG,
            ..Self::new(MessageKind::Redo, TxDesc::default(), Opaque::new())
        }
    }

    pub fn is_eol(&self) -> bool {
        self.kind == MessageKind::Redo && self.flags.contains(MessageFlags::END_OF_LOG)
    }

    pub fn is_eviction(&self) -> bool {
        self.kind == MessageKind::Redo && self.flags.contains(MessageFlags::EVICTION)
    }

    pub fn payload(&self) -> Option<Opaque> {
        if self.payload.is_empty() {
            None
        } else {
            Some(self.payload.clone())
        }
    }
}

impl Display for Message {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {}", self.kind, self.txd)?;
        if self.kind == MessageKind::Redo {
            write!(
                f,
                " from {}{}{}",
                self.initiator,
                if self.is_eol() { " eol" } else { "" },
                if self.is_eviction() { " eviction" } else { "" }
            )?;
        }
        Ok(())
    }
}

/// What travels on the wire between two participants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Envelope {
    Request {
        id: u64,
        source: ParticipantId,
        reply_wanted: bool,
        message: Message,
    },
    Reply {
        id: u64,
        result: Result<Option<Message>, RemoteError>,
    },
}
