//! Cluster configuration.
//!
//! The configuration file is line oriented, `#` starts a comment:
//!
//! ```text
//! participant 1 replica-0 durable
//! participant 2 replica-1 durable
//! participant 9 client-A volatile
//! service 101 1        # user service 101 is replicated by participant 1
//! connect-timeout 1000
//! reply-timeout 10000
//! ```
//!
//! Every node must read the same file.

use std::{collections::HashMap, str::FromStr, time::Duration};

use crate::{
    common::ParticipantId,
    error::{Error, Result},
};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_HEQ_CAPACITY: usize = 32;
pub const DEFAULT_EOLQ_CAPACITY: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantConfig {
    pub id: ParticipantId,
    pub address: String,
    /// Volatile participants (clients) keep no durable log.
    pub volatile: bool,
}

#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub participants: Vec<ParticipantConfig>,
    service_table: HashMap<u64, ParticipantId>,
    pub connect_timeout: Duration,
    pub reply_timeout: Duration,
    pub heq_capacity: usize,
    pub eolq_capacity: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            participants: Vec::new(),
            service_table: HashMap::new(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            heq_capacity: DEFAULT_HEQ_CAPACITY,
            eolq_capacity: DEFAULT_EOLQ_CAPACITY,
        }
    }
}

impl ClusterConfig {
    pub fn push_participant(&mut self, id: ParticipantId, address: impl Into<String>, volatile: bool) {
        self.participants.push(ParticipantConfig {
            id,
            address: address.into(),
            volatile,
        });
    }

    pub fn map_service(&mut self, user_service: u64, participant: ParticipantId) {
        self.service_table.insert(user_service, participant);
    }

    pub fn participant(&self, id: ParticipantId) -> Result<&ParticipantConfig> {
        self.participants
            .iter()
            .find(|participant| participant.id == id)
            .ok_or(Error::NotFound)
    }

    pub fn address_of(&self, id: ParticipantId) -> Result<&str> {
        Ok(&self.participant(id)?.address)
    }

    pub fn participant_at(&self, address: &str) -> Option<&ParticipantConfig> {
        self.participants
            .iter()
            .find(|participant| participant.address == address)
    }

    pub fn is_volatile(&self, id: ParticipantId) -> bool {
        self.participant(id)
            .map(|participant| participant.volatile)
            .unwrap_or(false)
    }

    /// Physical replication target of a logical user service.
    pub fn resolve_service(&self, user_service: u64) -> Result<ParticipantId> {
        self.service_table
            .get(&user_service)
            .copied()
            .ok_or(Error::NotFound)
    }

    /// Lowest user service replicated by `participant`.
    pub fn service_of(&self, participant: ParticipantId) -> Result<u64> {
        self.service_table
            .iter()
            .filter(|(_, id)| **id == participant)
            .map(|(user_service, _)| *user_service)
            .min()
            .ok_or(Error::NotFound)
    }
}

fn parse_value<T: FromStr>(prompt: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::Config(format!("invalid value for {}: {}", prompt, value)))
}

impl FromStr for ClusterConfig {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        let mut config = Self::default();
        for line in s.lines() {
            let line = if let Some((line, _)) = line.split_once('#') {
                line.trim()
            } else {
                line.trim()
            };
            if line.is_empty() {
                continue;
            }
            let (prompt, value) = line
                .split_once(char::is_whitespace)
                .ok_or_else(|| Error::Config(format!("missing value: {}", line)))?;
            let value = value.trim();
            match prompt {
                "participant" => {
                    let field_list: Vec<_> = value.split_whitespace().collect();
                    let (id, address, kind) = match field_list[..] {
                        [id, address, kind] => (id, address, kind),
                        _ => return Err(Error::Config(format!("bad participant line: {}", line))),
                    };
                    let volatile = match kind {
                        "durable" => false,
                        "volatile" => true,
                        _ => return Err(Error::Config(format!("unknown participant kind: {}", kind))),
                    };
                    let id: ParticipantId = id.parse()?;
                    if !id.is_valid() || config.participant(id).is_ok() {
                        return Err(Error::Config(format!("invalid or duplicated participant {}", id)));
                    }
                    config.push_participant(id, address, volatile);
                }
                "service" => {
                    let (user_service, participant) = value
                        .split_once(char::is_whitespace)
                        .ok_or_else(|| Error::Config(format!("bad service line: {}", line)))?;
                    let user_service = parse_value(prompt, user_service)?;
                    let participant = participant.trim().parse()?;
                    config.map_service(user_service, participant);
                }
                "connect-timeout" => {
                    config.connect_timeout = Duration::from_millis(parse_value(prompt, value)?)
                }
                "reply-timeout" => {
                    config.reply_timeout = Duration::from_millis(parse_value(prompt, value)?)
                }
                "heq-capacity" => config.heq_capacity = parse_value(prompt, value)?,
                "eolq-capacity" => config.eolq_capacity = parse_value(prompt, value)?,
                _ => return Err(Error::Config(format!("unexpected prompt: {}", prompt))),
            }
        }
        for participant in config.service_table.values() {
            config.participant(*participant).map_err(|_| {
                Error::Config(format!("service mapped to unknown participant {}", participant))
            })?;
        }
        Ok(config)
    }
}
