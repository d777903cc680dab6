//! Per-participant DTM0 service: one log, one replication link and one
//! recovery machine, wired to the transport and the health hub.

use std::sync::{Arc, Mutex};

use tokio::{
    spawn,
    sync::mpsc::{unbounded_channel, UnboundedReceiver},
    task::JoinHandle,
};
use tracing::{debug, trace, warn, Span};

use crate::{
    common::{deserialize, ParticipantId},
    config::ClusterConfig,
    drlink::DrLink,
    error::{Error, RemoteError, Result},
    health::{Ha, HaState},
    log::{Log, LogOp},
    message::{Envelope, Message, MessageKind},
    recovery::{DefaultOps, RecoveryMachine},
    transport::Transport,
    tx_desc::{ParticipantState, Tid, TxDesc},
};

pub struct Dtm0Service<T: Transport<Address = String>, L: Log> {
    local: ParticipantId,
    config: Arc<ClusterConfig>,
    log: Arc<L>,
    link: Arc<DrLink<T>>,
    machine: RecoveryMachine,
    ha: Arc<Ha>,

    rx: Mutex<Option<UnboundedReceiver<(String, T::RxBuffer)>>>,
    task_list: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Transport<Address = String>, L: Log> Dtm0Service<T, L> {
    /// Build the service for `local` and register it on `transport`. Nothing
    /// runs before [`Dtm0Service::start`].
    pub fn register_new(
        transport: &mut T,
        local: ParticipantId,
        config: Arc<ClusterConfig>,
        log: Arc<L>,
        ha: Arc<Ha>,
    ) -> Result<Arc<Self>> {
        let link = Arc::new(DrLink::new(transport, local, config.clone())?);
        let ops = DefaultOps::new(log.clone(), link.clone(), ha.clone());
        let machine = RecoveryMachine::new(local, Arc::new(ops), &config);

        let (tx, rx) = unbounded_channel();
        transport.register(&*link, move |remote, buffer| {
            if tx.send((remote, buffer)).is_err() {
                trace!("receive after service stop");
            }
        });
        debug!("{} registered, persistent log: {}", local, log.is_persistent());
        Ok(Arc::new(Self {
            local,
            config,
            log,
            link,
            machine,
            ha,
            rx: Mutex::new(Some(rx)),
            task_list: Mutex::new(Vec::new()),
        }))
    }

    pub fn local(&self) -> ParticipantId {
        self.local
    }

    pub fn log(&self) -> &Arc<L> {
        &self.log
    }

    pub fn link(&self) -> &Arc<DrLink<T>> {
        &self.link
    }

    pub fn machine(&self) -> &RecoveryMachine {
        &self.machine
    }

    /// Start receiving, start the recovery machine and feed it the current
    /// and every later health state.
    pub fn start(self: &Arc<Self>) {
        let rx = match self.rx.lock().unwrap().take() {
            Some(rx) => rx,
            None => {
                warn!("{} started twice", self.local);
                return;
            }
        };
        let receive = spawn(self.clone().receive_loop(rx));

        self.machine.start();
        let mut state_rx = self.ha.subscribe();
        for participant in &self.config.participants {
            let state = self.ha.state(participant.id);
            if state != HaState::Unknown {
                self.ha_state_changed(participant.id, state);
            }
        }
        let service = self.clone();
        let bridge = spawn(async move {
            while let Some((id, state)) = state_rx.recv().await {
                service.ha_state_changed(id, state);
            }
        });
        self.task_list.lock().unwrap().extend([receive, bridge]);
    }

    pub async fn stop(&self) {
        self.machine.stop().await;
        for task in self.task_list.lock().unwrap().drain(..) {
            task.abort();
        }
        debug!("{} stopped", self.local);
    }

    pub fn ha_state_changed(&self, id: ParticipantId, state: HaState) {
        self.machine.ha_event(id, state);
    }

    async fn receive_loop(self: Arc<Self>, mut rx: UnboundedReceiver<(String, T::RxBuffer)>) {
        while let Some((remote, buffer)) = rx.recv().await {
            match deserialize(buffer.as_ref()) {
                Ok(Envelope::Request {
                    id,
                    source,
                    reply_wanted,
                    message,
                }) => {
                    trace!("{} <- {}: {}", self.local, source, message);
                    let result = self.handle_request(message);
                    if let Err(err) = &result {
                        warn!("{}: request from {} failed: {}", self.local, source, err);
                    }
                    if reply_wanted {
                        let result = result.map_err(|err| RemoteError::from(&err));
                        self.link.reply(&remote, id, result);
                    }
                }
                Ok(Envelope::Reply { id, result }) => self.link.complete(id, result),
                Err(err) => warn!("{}: from {}: {}", self.local, remote, err),
            }
        }
    }

    fn handle_request(&self, message: Message) -> Result<Option<Message>> {
        match message.kind {
            MessageKind::Redo => {
                if !message.is_eol() {
                    self.log
                        .update_now(LogOp::Redo, &message.txd, message.payload())?;
                }
                self.machine.redo_post(&message);
                Ok(None)
            }
            MessageKind::Persistent => {
                self.log.deliver_notice(&message.txd)?;
                self.prune_if_persistent(&message.txd.id);
                Ok(None)
            }
            MessageKind::Execute => {
                let mut txd = message.txd.copy();
                if !txd.raise(self.local, ParticipantState::Executed) {
                    return Err(Error::protocol(format!(
                        "{} is not a participant of {}",
                        self.local, txd
                    )));
                }
                self.log
                    .update_now(LogOp::Executed, &txd, message.payload())?;
                Ok(Some(Message::executed(txd)))
            }
            MessageKind::Test => Ok(Some(message)),
            MessageKind::Executed => Err(Error::protocol("EXECUTED is a reply, not a request")),
        }
    }

    /// Only a durable log is pruned here. A volatile prune drops the whole
    /// prefix, which may still belong to open transactions.
    fn prune_if_persistent(&self, tid: &Tid) {
        if !self.log.is_persistent() {
            return;
        }
        match self.log.find(tid) {
            Ok(record) if record.txd.is_persistent() => match self.log.prune_now(tid) {
                Ok(()) => debug!("{}: pruned up to {}", self.local, tid),
                Err(err) => warn!("{}: prune up to {} refused: {}", self.local, tid, err),
            },
            _ => {}
        }
    }

    /// The local store committed `txd`: record PERSISTENT for this participant
    /// and tell the originator.
    pub fn on_committed(&self, txd: &TxDesc) -> Result<()> {
        let mut txd = txd.copy();
        if !txd.raise(self.local, ParticipantState::Persistent) {
            return Err(Error::protocol(format!(
                "{} is not a participant of {}",
                self.local, txd
            )));
        }
        self.log.update_now(LogOp::Persistent, &txd, None)?;
        let origin = txd.id.origin;
        if origin != self.local {
            self.link.post_detached(
                Message::persistent(txd),
                origin,
                &Span::current(),
                false,
                None,
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::{sync::oneshot, time::sleep};

    use super::*;
    use crate::{
        clock::ClockSource,
        dtx::{Dtx, DtxState},
        health::ProcessEvent,
        log::{PersistentLog, VolatileLog},
        tests::TRACING,
        transport::simulated,
    };

    const S1: ParticipantId = ParticipantId(1);
    const S2: ParticipantId = ParticipantId(2);
    const C: ParticipantId = ParticipantId(9);

    type Server = Dtm0Service<simulated::Transport, PersistentLog>;
    type Client = Dtm0Service<simulated::Transport, VolatileLog>;

    struct Cluster {
        config: Arc<ClusterConfig>,
        ha: Arc<Ha>,
        server_list: Vec<Arc<Server>>,
        client: Arc<Client>,
        stop: oneshot::Sender<()>,
    }

    fn cluster(ha: Arc<Ha>) -> Cluster {
        let mut config = ClusterConfig::default();
        config.push_participant(S1, "replica-0", false);
        config.push_participant(S2, "replica-1", false);
        config.push_participant(C, "client-A", true);
        config.map_service(101, S1);
        config.map_service(102, S2);
        let config = Arc::new(config);

        let mut transport = simulated::Transport::new();
        let server_list: Vec<_> = [S1, S2]
            .into_iter()
            .map(|id| {
                let log = Arc::new(PersistentLog::open_in_memory().unwrap());
                Server::register_new(&mut transport, id, config.clone(), log, ha.clone()).unwrap()
            })
            .collect();
        let client = Client::register_new(
            &mut transport,
            C,
            config.clone(),
            Arc::new(VolatileLog::new()),
            ha.clone(),
        )
        .unwrap();
        transport.insert_filter(
            1,
            simulated::Transport::delay(Duration::from_micros(10), Duration::from_micros(50)),
        );
        let (stop, stop_rx) = oneshot::channel();
        spawn(async move { transport.deliver_until(stop_rx).await });
        for server in &server_list {
            server.start();
        }
        client.start();
        Cluster {
            config,
            ha,
            server_list,
            client,
            stop,
        }
    }

    impl Cluster {
        /// Run one client transaction against the servers in `target_list`
        /// until every one of them answered EXECUTED.
        async fn execute(&self, target_list: &[usize]) -> Dtx<VolatileLog> {
            let mut dtx = Dtx::new(
                self.client.log().clone(),
                Arc::new(ClockSource::physical()),
                self.config.clone(),
                C,
            );
            dtx.open(target_list.len()).unwrap();
            for (index, target) in target_list.iter().enumerate() {
                dtx.assign_participant(index, 101 + *target as u64).unwrap();
            }
            dtx.close(Some(b"put".to_vec())).unwrap();
            for (index, target) in target_list.iter().enumerate() {
                let reply = self
                    .client
                    .link()
                    .post(
                        Message::execute(dtx.copy_txd(), b"put".to_vec()),
                        self.server_list[*target].local(),
                        &Span::none(),
                        true,
                    )
                    .await
                    .unwrap()
                    .unwrap();
                assert_eq!(reply.kind, MessageKind::Executed);
                dtx.mark_executed(index).unwrap();
            }
            dtx
        }

        async fn shutdown(self) {
            for server in &self.server_list {
                server.stop().await;
            }
            self.client.stop().await;
            let _ = self.stop.send(());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transaction_becomes_stable_through_notices() {
        *TRACING;
        let ha = Arc::new(Ha::new());
        for id in [S1, S2, C] {
            ha.set_state(id, HaState::Online);
        }
        let cluster = cluster(ha);
        let mut dtx = cluster.execute(&[0, 1]).await;
        let tid = dtx.tid();

        for server in &cluster.server_list {
            let record = server.log().find(&tid).unwrap();
            assert_eq!(record.payload, Some(b"put".to_vec()));
            assert_eq!(record.txd.state_of(server.local()), Some(ParticipantState::Executed));
            server.on_committed(&record.txd).unwrap();
        }
        dtx.wait_stable().await.unwrap();
        assert_eq!(dtx.state(), DtxState::Stable);
        dtx.finalize().unwrap();
        assert!(cluster.client.log().find(&tid).unwrap().txd.is_persistent());

        // a full notice lets a server drop the record
        cluster
            .client
            .link()
            .post(Message::persistent(dtx.copy_txd()), S1, &Span::none(), true)
            .await
            .unwrap();
        assert!(matches!(cluster.server_list[0].log().find(&tid), Err(Error::NotFound)));
        // S2 only knows about itself
        assert!(!cluster.server_list[1].log().find(&tid).unwrap().txd.is_persistent());

        cluster.client.log().prune_now(&tid).unwrap();
        cluster.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn recovering_server_catches_up() {
        *TRACING;
        let ha = Arc::new(Ha::new());
        ha.set_state(S1, HaState::Online);
        let cluster = cluster(ha.clone());

        // S2 is down while the write happens
        let dtx = cluster.execute(&[0]).await;
        let tid = dtx.tid();
        let missed = TxDesc::new(
            Tid::new(tid.timestamp + 1, C),
            [(S1, ParticipantState::Executed), (S2, ParticipantState::InProgress)],
        );
        cluster.server_list[0]
            .log()
            .update_now(LogOp::Create, &missed, Some(b"missed".to_vec()))
            .unwrap();
        assert!(cluster.server_list[1].log().is_empty());

        ha.set_state(S2, HaState::Recovering);
        for _ in 0..1000 {
            if ha.state(S2) == HaState::Online {
                break;
            }
            sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(ha.state(S2), HaState::Online);
        assert!(ha.events().contains(&(S2, ProcessEvent::Recovered)));

        let record = cluster.server_list[1].log().find(&missed.id).unwrap();
        assert_eq!(record.payload, Some(b"missed".to_vec()));
        // the record addressed only to S1 was not replayed
        assert!(matches!(cluster.server_list[1].log().find(&tid), Err(Error::NotFound)));

        drop(dtx);
        cluster.shutdown().await;
    }
}
