//! Cluster health view.
//!
//! The health subsystem is external to DTM0; this hub stands in for it inside
//! one process. It holds the last known state of every participant, fans state
//! changes out to subscribers and accepts process events such as RECOVERED.

use std::{
    collections::HashMap,
    fmt::{self, Display, Formatter},
    sync::Mutex,
};

use serde_derive::{Deserialize, Serialize};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info};

use crate::common::ParticipantId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HaState {
    Unknown,
    Online,
    Recovering,
    Transient,
    Failed,
}

impl Default for HaState {
    fn default() -> Self {
        Self::Unknown
    }
}

impl Display for HaState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "unknown",
            Self::Online => "online",
            Self::Recovering => "recovering",
            Self::Transient => "transient",
            Self::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessEvent {
    Recovered,
}

#[derive(Default)]
pub struct Ha {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    state_table: HashMap<ParticipantId, HaState>,
    state_subscriber_list: Vec<UnboundedSender<(ParticipantId, HaState)>>,
    event_list: Vec<(ParticipantId, ProcessEvent)>,
    event_subscriber_list: Vec<UnboundedSender<(ParticipantId, ProcessEvent)>>,
}

impl Ha {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, id: ParticipantId) -> HaState {
        self.inner
            .lock()
            .unwrap()
            .state_table
            .get(&id)
            .copied()
            .unwrap_or_default()
    }

    pub fn set_state(&self, id: ParticipantId, state: HaState) {
        let mut inner = self.inner.lock().unwrap();
        debug!("ha {} -> {}", id, state);
        inner.state_table.insert(id, state);
        inner
            .state_subscriber_list
            .retain(|subscriber| subscriber.send((id, state)).is_ok());
    }

    /// Every later state change of every participant, in order.
    pub fn subscribe(&self) -> UnboundedReceiver<(ParticipantId, HaState)> {
        let (tx, rx) = unbounded_channel();
        self.inner.lock().unwrap().state_subscriber_list.push(tx);
        rx
    }

    pub fn subscribe_events(&self) -> UnboundedReceiver<(ParticipantId, ProcessEvent)> {
        let (tx, rx) = unbounded_channel();
        self.inner.lock().unwrap().event_subscriber_list.push(tx);
        rx
    }

    /// A participant reporting RECOVERED while RECOVERING is moved to ONLINE.
    pub fn post_event(&self, source: ParticipantId, event: ProcessEvent) {
        let recovering = {
            let mut inner = self.inner.lock().unwrap();
            info!("ha event {:?} from {}", event, source);
            inner.event_list.push((source, event));
            inner
                .event_subscriber_list
                .retain(|subscriber| subscriber.send((source, event)).is_ok());
            inner.state_table.get(&source) == Some(&HaState::Recovering)
        };
        if event == ProcessEvent::Recovered && recovering {
            self.set_state(source, HaState::Online);
        }
    }

    pub fn events(&self) -> Vec<(ParticipantId, ProcessEvent)> {
        self.inner.lock().unwrap().event_list.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recovered_moves_to_online() {
        let ha = Ha::new();
        let mut rx = ha.subscribe();
        ha.set_state(ParticipantId(1), HaState::Recovering);
        ha.post_event(ParticipantId(1), ProcessEvent::Recovered);
        assert_eq!(ha.state(ParticipantId(1)), HaState::Online);
        assert_eq!(rx.try_recv().unwrap(), (ParticipantId(1), HaState::Recovering));
        assert_eq!(rx.try_recv().unwrap(), (ParticipantId(1), HaState::Online));
        assert_eq!(ha.events(), [(ParticipantId(1), ProcessEvent::Recovered)]);
    }

    #[test]
    fn recovered_while_online_is_recorded_only() {
        let ha = Ha::new();
        ha.set_state(ParticipantId(1), HaState::Online);
        ha.post_event(ParticipantId(1), ProcessEvent::Recovered);
        assert_eq!(ha.state(ParticipantId(1)), HaState::Online);
        assert_eq!(ha.state(ParticipantId(2)), HaState::Unknown);
    }
}
