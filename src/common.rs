use std::{
    fmt::{self, Display, Formatter},
    io::Cursor,
    str::FromStr,
};

use bincode::Options;
use serde::{Deserialize, Serialize};
use serde_derive::{Deserialize as DeriveDeserialize, Serialize as DeriveSerialize};

use crate::{
    error::{Error, Result},
    transport::MAX_MESSAGE_LEN,
};

pub type Opaque = Vec<u8>;

/// Identity of a DTM0 participant. Zero is reserved as the invalid id.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, DeriveSerialize, DeriveDeserialize,
)]
pub struct ParticipantId(pub u64);

impl ParticipantId {
    pub const INVALID: Self = Self(0);

    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

impl Display for ParticipantId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

impl FromStr for ParticipantId {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        let id = s.trim_start_matches('p');
        let id = id
            .parse()
            .map_err(|_| Error::Config(format!("invalid participant id: {}", s)))?;
        Ok(Self(id))
    }
}

// every decode goes through here, so a peer sending garbage costs an error
// value instead of a panic
pub fn deserialize<M: for<'a> Deserialize<'a>>(bytes: &[u8]) -> Result<M> {
    bincode::DefaultOptions::new()
        .allow_trailing_bytes()
        .deserialize(bytes)
        .map_err(|_| Error::Malformed)
}

/// Writer for a transport buffer. The encoding must fit, see [`fit`].
pub fn serialize<M: Serialize>(message: M) -> impl FnOnce(&mut [u8]) -> u16 {
    move |buffer| {
        let mut cursor = Cursor::new(buffer);
        bincode::DefaultOptions::new()
            .serialize_into(&mut cursor, &message)
            .unwrap();
        cursor.position() as u16
    }
}

pub fn encoded_len<M: Serialize>(message: &M) -> u64 {
    bincode::DefaultOptions::new()
        .serialized_size(message)
        .unwrap_or(0)
}

/// Pass `message` through if its encoding fits in [`MAX_MESSAGE_LEN`].
pub fn fit<M: Serialize>(message: M) -> Result<M> {
    let len = encoded_len(&message);
    if len > MAX_MESSAGE_LEN as u64 {
        return Err(Error::protocol(format!(
            "message of {} bytes over the {} byte limit",
            len, MAX_MESSAGE_LEN
        )));
    }
    Ok(message)
}
