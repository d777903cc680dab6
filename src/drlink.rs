//! Replication link: delivers one message to one participant.
//!
//! A post walks `LOCKING -> [DISCONNECTING] -> [CONNECTING] -> SENDING ->
//! [WAITING_FOR_REPLY] -> DONE | FAILED`. The per-destination lock is held for
//! the whole walk, so connect and send sequences to one peer never interleave
//! and at most one round trip per destination is in flight. Transport failures
//! are returned as they are; nothing is retried here.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use tokio::{
    spawn,
    sync::{oneshot, Mutex as AsyncMutex},
    time::timeout,
};
use tracing::{debug, debug_span, trace, warn, Instrument, Span};

use crate::{
    common::{fit, serialize, ParticipantId},
    config::ClusterConfig,
    error::{Error, RemoteError, Result},
    latency::{Latency, LocalLatency, MeasureClock},
    message::{Envelope, Message},
    transport::{Receiver, Session, Transport, TxAgent},
};

type Reply = std::result::Result<Option<Message>, RemoteError>;

struct Link {
    session: Option<Session<String>>,
    latency: LocalLatency,
}

pub struct DrLink<T: Transport<Address = String>> {
    local: ParticipantId,
    address: String,
    transport: T::TxAgent,
    config: Arc<ClusterConfig>,
    clock: MeasureClock,

    link_table: Mutex<HashMap<ParticipantId, Arc<AsyncMutex<Link>>>>,
    latency_table: Mutex<HashMap<ParticipantId, Latency>>,
    reply_table: Mutex<HashMap<u64, oneshot::Sender<Reply>>>,
    request_number: AtomicU64,
}

impl<T: Transport<Address = String>> Receiver<T> for DrLink<T> {
    fn get_address(&self) -> &String {
        &self.address
    }
}

impl<T: Transport<Address = String>> DrLink<T> {
    /// The link sends from the address configured for `local`.
    pub fn new(transport: &T, local: ParticipantId, config: Arc<ClusterConfig>) -> Result<Self> {
        let address = config.address_of(local)?.to_string();
        Ok(Self {
            local,
            address,
            transport: transport.tx_agent(),
            config,
            clock: MeasureClock::default(),
            link_table: Mutex::new(HashMap::new()),
            latency_table: Mutex::new(HashMap::new()),
            reply_table: Mutex::new(HashMap::new()),
            request_number: AtomicU64::new(0),
        })
    }

    pub fn local(&self) -> ParticipantId {
        self.local
    }

    fn link(&self, target: ParticipantId) -> Arc<AsyncMutex<Link>> {
        let mut link_table = self.link_table.lock().unwrap();
        link_table
            .entry(target)
            .or_insert_with(|| {
                let latency = Latency::new(format!("{} -> {}", self.local, target));
                let local_latency = latency.local();
                self.latency_table.lock().unwrap().insert(target, latency);
                Arc::new(AsyncMutex::new(Link {
                    session: None,
                    latency: local_latency,
                }))
            })
            .clone()
    }

    /// Send `message` to `target`. With `wait_for_ack` the destination stays
    /// locked until the reply arrives, and the reply body is returned.
    pub async fn post(
        &self,
        message: Message,
        target: ParticipantId,
        causal_parent: &Span,
        wait_for_ack: bool,
    ) -> Result<Option<Message>> {
        let span = debug_span!(
            parent: causal_parent,
            "post",
            source = %self.local,
            %target,
            kind = ?message.kind
        );
        let result = self
            .post_internal(message, target, wait_for_ack)
            .instrument(span)
            .await;
        match &result {
            Ok(_) => trace!("{} -> {}: done", self.local, target),
            Err(err) => debug!("{} -> {}: failed: {}", self.local, target, err),
        }
        result
    }

    async fn post_internal(
        &self,
        message: Message,
        target: ParticipantId,
        wait_for_ack: bool,
    ) -> Result<Option<Message>> {
        let participant = self.config.participant(target)?;
        let dest = participant.address.clone();
        let volatile = participant.volatile;
        let id = self.request_number.fetch_add(1, Ordering::SeqCst) + 1;
        let request = fit(Envelope::Request {
            id,
            source: self.local,
            reply_wanted: wait_for_ack,
            message,
        })?;

        trace!("locking");
        let link = self.link(target);
        let mut link = link.lock().await;
        let measure = self.clock.measure();

        let session = match link.session.take() {
            Some(session) if session.is_alive() && !volatile => session,
            stale => {
                if let Some(session) = stale {
                    trace!("disconnecting");
                    session.cancel();
                }
                trace!("connecting to {}", dest);
                timeout(
                    self.config.connect_timeout,
                    self.transport.connect(&self.address, &dest),
                )
                .await
                .map_err(|_| Error::Timeout)??
            }
        };

        let reply = if wait_for_ack {
            let (tx, rx) = oneshot::channel();
            self.reply_table.lock().unwrap().insert(id, tx);
            Some(rx)
        } else {
            None
        };
        trace!("sending request {}", id);
        if let Err(err) = self.transport.send_session(&session, serialize(request)) {
            self.reply_table.lock().unwrap().remove(&id);
            return Err(err);
        }
        link.session = Some(session);

        let reply = match reply {
            Some(reply) => reply,
            None => return Ok(None),
        };
        trace!("waiting for reply {}", id);
        let result = match timeout(self.config.reply_timeout, reply).await {
            Ok(Ok(result)) => result.map_err(Error::from),
            Ok(Err(_)) => Err(Error::Shutdown),
            Err(_) => {
                self.reply_table.lock().unwrap().remove(&id);
                Err(Error::Timeout)
            }
        };
        if result.is_ok() {
            link.latency += measure;
        }
        result
    }

    /// Run [`DrLink::post`] in the background. The outcome goes to
    /// `completion` when given, otherwise failures are only logged.
    pub fn post_detached(
        self: &Arc<Self>,
        message: Message,
        target: ParticipantId,
        causal_parent: &Span,
        wait_for_ack: bool,
        completion: Option<oneshot::Sender<Result<Option<Message>>>>,
    ) {
        let link = self.clone();
        let causal_parent = causal_parent.clone();
        spawn(async move {
            let result = link
                .post(message, target, &causal_parent, wait_for_ack)
                .await;
            match completion {
                Some(completion) => {
                    let _ = completion.send(result);
                }
                None => {
                    if let Err(err) = result {
                        warn!("{} -> {}: detached post failed: {}", link.local, target, err);
                    }
                }
            }
        });
    }

    /// Hand a reply to the post waiting for it. Late replies are dropped.
    pub fn complete(&self, id: u64, result: Reply) {
        match self.reply_table.lock().unwrap().remove(&id) {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => trace!("late reply {} dropped", id),
        }
    }

    /// Answer request `id` that arrived from `remote`.
    pub fn reply(&self, remote: &String, id: u64, result: Reply) {
        let envelope = fit(Envelope::Reply { id, result }).unwrap_or_else(|err| {
            warn!("{}: reply {} to {} not sent: {}", self.local, id, remote, err);
            Envelope::Reply {
                id,
                result: Err(RemoteError::from(&err)),
            }
        });
        self.transport
            .send_message(self, remote, serialize(envelope));
    }

    /// Latency of every destination posted to so far. Meant for shutdown:
    /// every link is dropped first so that its samples are flushed.
    pub fn latency_report(&self) -> Vec<String> {
        self.link_table.lock().unwrap().clear();
        let mut latency_table = self.latency_table.lock().unwrap();
        let mut target_list: Vec<_> = latency_table.keys().copied().collect();
        target_list.sort();
        target_list
            .into_iter()
            .filter_map(|target| {
                let latency = latency_table.get_mut(&target)?;
                latency.refresh();
                Some(latency.to_string())
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::{join, time::Instant};

    use super::*;
    use crate::{
        common::deserialize,
        message::MessageKind,
        tests::TRACING,
        transport::simulated::{self, Network},
    };

    fn config() -> Arc<ClusterConfig> {
        let mut config = ClusterConfig::default();
        config.push_participant(ParticipantId(1), "replica-0", false);
        config.push_participant(ParticipantId(2), "replica-1", false);
        config.push_participant(ParticipantId(9), "client-A", true);
        Arc::new(config)
    }

    type SimLink = DrLink<simulated::Transport>;

    /// Client link for p9 and an echoing server at p1. The server answers
    /// `reply_delay` after each request and never answers TEST messages
    /// carrying the payload `b"drop"`.
    struct Cluster {
        client: Arc<SimLink>,
        network: Network,
        stop: oneshot::Sender<()>,
    }

    fn cluster(reply_delay: Duration) -> Cluster {
        let config = config();
        let mut transport = simulated::Transport::new();
        let network = transport.network();
        let client = Arc::new(SimLink::new(&transport, ParticipantId(9), config.clone()).unwrap());
        let server = Arc::new(SimLink::new(&transport, ParticipantId(1), config).unwrap());
        transport.register(&*client, {
            let client = client.clone();
            move |_, buffer| {
                if let Ok(Envelope::Reply { id, result }) = deserialize(buffer.as_ref()) {
                    client.complete(id, result);
                }
            }
        });
        transport.register(&*server, {
            let server = server.clone();
            move |remote, buffer| {
                if let Ok(Envelope::Request {
                    id,
                    reply_wanted: true,
                    message,
                    ..
                }) = deserialize(buffer.as_ref())
                {
                    if message.payload != b"drop" {
                        server.reply(&remote, id, Ok(Some(message)));
                    }
                }
            }
        });
        transport.insert_filter(1, simulated::Transport::delay_from("replica-0", reply_delay));
        let (stop, stop_rx) = oneshot::channel();
        spawn(async move { transport.deliver_until(stop_rx).await });
        Cluster {
            client,
            network,
            stop,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn round_trip() {
        *TRACING;
        let cluster = cluster(Duration::from_millis(1));
        let reply = cluster
            .client
            .post(Message::test(b"ping".to_vec()), ParticipantId(1), &Span::none(), true)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.kind, MessageKind::Test);
        assert_eq!(reply.payload, b"ping");
        let report = cluster.client.latency_report();
        assert_eq!(report.len(), 1);
        assert!(report[0].starts_with("p9 -> p1: 1 round trips"));
        cluster.stop.send(()).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_posts_to_one_destination_serialize() {
        *TRACING;
        let cluster = cluster(Duration::from_millis(10));
        let client = &cluster.client;
        let span = Span::none();
        let start = Instant::now();
        let (first, second) = join!(
            client.post(Message::test(b"1".to_vec()), ParticipantId(1), &span, true),
            client.post(Message::test(b"2".to_vec()), ParticipantId(1), &span, true),
        );
        first.unwrap();
        second.unwrap();
        assert!(Instant::now() - start >= Duration::from_millis(20));

        assert_eq!(cluster.network.connect_count("client-A", "replica-0"), 1);
        let arrival_list = cluster.network.arrival_list();
        let route_list: Vec<_> = arrival_list
            .iter()
            .map(|arrival| (arrival.source.as_str(), arrival.dest.as_str()))
            .collect();
        assert_eq!(
            route_list,
            [
                ("client-A", "replica-0"),
                ("replica-0", "client-A"),
                ("client-A", "replica-0"),
                ("replica-0", "client-A"),
            ]
        );
        // second request leaves only after the first reply is back
        assert!(arrival_list[2].at >= arrival_list[1].at);
        cluster.stop.send(()).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failures_are_surfaced() {
        *TRACING;
        let cluster = cluster(Duration::ZERO);
        let client = &cluster.client;

        // no receiver registered at replica-1
        let result = client
            .post(Message::test(vec![]), ParticipantId(2), &Span::none(), true)
            .await;
        assert!(matches!(result, Err(Error::NotConnected(_))));

        let result = client
            .post(Message::test(vec![]), ParticipantId(5), &Span::none(), true)
            .await;
        assert!(matches!(result, Err(Error::NotFound)));

        let result = client
            .post(Message::test(b"drop".to_vec()), ParticipantId(1), &Span::none(), true)
            .await;
        assert!(matches!(result, Err(Error::Timeout)));

        cluster.network.isolate("replica-0");
        let result = client
            .post(Message::test(vec![]), ParticipantId(1), &Span::none(), true)
            .await;
        assert!(matches!(result, Err(Error::Timeout)));
        assert!(result.unwrap_err().is_transport());

        cluster.network.rejoin("replica-0");
        assert!(client
            .post(Message::test(vec![]), ParticipantId(1), &Span::none(), true)
            .await
            .is_ok());
        assert_eq!(cluster.network.connect_count("client-A", "replica-0"), 2);
        cluster.stop.send(()).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_message_is_refused() {
        *TRACING;
        let cluster = cluster(Duration::ZERO);
        let result = cluster
            .client
            .post(Message::test(vec![7; 10_000]), ParticipantId(1), &Span::none(), true)
            .await;
        assert!(matches!(result, Err(Error::Protocol(_))));
        assert_eq!(cluster.network.connect_count("client-A", "replica-0"), 0);
        // the link stays usable
        cluster
            .client
            .post(Message::test(b"small".to_vec()), ParticipantId(1), &Span::none(), true)
            .await
            .unwrap();
        cluster.stop.send(()).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn detached_post_completes() {
        *TRACING;
        let cluster = cluster(Duration::ZERO);
        let (tx, rx) = oneshot::channel();
        cluster.client.post_detached(
            Message::test(b"bg".to_vec()),
            ParticipantId(1),
            &Span::none(),
            true,
            Some(tx),
        );
        let reply = rx.await.unwrap().unwrap().unwrap();
        assert_eq!(reply.payload, b"bg");
        cluster.stop.send(()).unwrap();
    }
}
