use std::sync::Arc;

use async_trait::async_trait;
use tracing::Span;

use crate::{
    common::ParticipantId,
    drlink::DrLink,
    error::Result,
    health::{Ha, ProcessEvent},
    log::{Log, LogIter, LogRecord},
    message::Message,
    transport::Transport,
    tx_desc::Tid,
};

/// Everything the recovery machine does to the outside world. Tests swap in
/// their own implementation; [`DefaultOps`] is the production binding.
#[async_trait]
pub trait RecoveryOps: Send + Sync + 'static {
    /// Deliver a REDO to `target` and wait for its acknowledgement.
    async fn redo_post(&self, target: ParticipantId, message: Message) -> Result<()>;

    fn ha_event_post(&self, source: ParticipantId, event: ProcessEvent);

    fn log_iter_init(&self) -> LogIter {
        LogIter::new()
    }

    /// Next record in tid order, restricted to records `target` participates
    /// in and to records originated by `origin` when those are given.
    fn log_iter_next(
        &self,
        iter: &mut LogIter,
        target: Option<ParticipantId>,
        origin: Option<ParticipantId>,
    ) -> Option<LogRecord>;

    fn log_iter_fini(&self, _iter: LogIter) {}

    fn last_tid(&self) -> Option<Tid>;
}

pub fn next_matching(
    log: &dyn Log,
    iter: &mut LogIter,
    target: Option<ParticipantId>,
    origin: Option<ParticipantId>,
) -> Option<LogRecord> {
    loop {
        let record = iter.next(log)?;
        let addressed = target.map_or(true, |target| record.txd.participated(target));
        let originated = origin.map_or(true, |origin| record.txd.id.origin == origin);
        if addressed && originated {
            return Some(record);
        }
    }
}

pub struct DefaultOps<T: Transport<Address = String>, L: Log> {
    log: Arc<L>,
    link: Arc<DrLink<T>>,
    ha: Arc<Ha>,
}

impl<T: Transport<Address = String>, L: Log> DefaultOps<T, L> {
    pub fn new(log: Arc<L>, link: Arc<DrLink<T>>, ha: Arc<Ha>) -> Self {
        Self { log, link, ha }
    }
}

#[async_trait]
impl<T: Transport<Address = String>, L: Log> RecoveryOps for DefaultOps<T, L> {
    async fn redo_post(&self, target: ParticipantId, message: Message) -> Result<()> {
        self.link
            .post(message, target, &Span::current(), true)
            .await
            .map(|_| ())
    }

    fn ha_event_post(&self, source: ParticipantId, event: ProcessEvent) {
        self.ha.post_event(source, event);
    }

    fn log_iter_next(
        &self,
        iter: &mut LogIter,
        target: Option<ParticipantId>,
        origin: Option<ParticipantId>,
    ) -> Option<LogRecord> {
        next_matching(&*self.log, iter, target, origin)
    }

    fn last_tid(&self) -> Option<Tid> {
        self.log.last_tid()
    }
}
