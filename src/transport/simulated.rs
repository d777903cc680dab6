//! In-process network for tests and the simulation binary.
//!
//! Every message goes through one channel owned by [`Transport`], which must be
//! driven with [`Transport::deliver`] or [`Transport::deliver_until`]. Filters
//! can drop or delay messages, and [`Network`] can isolate a node, which
//! cancels its sessions and silently loses its traffic.

use std::{
    collections::{HashMap, HashSet},
    future::pending,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use futures::Future;
use rand::{thread_rng, Rng};
use tokio::{
    pin, select, spawn,
    sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    time::{sleep, sleep_until, Instant},
};
use tracing::trace;

use crate::{
    error::{Error, Result},
    transport::{self, Receiver, Session, MAX_MESSAGE_LEN},
};

type Address = String;
type Message = Vec<u8>;

/// Simulated connection setup cost.
pub const CONNECT_LATENCY: Duration = Duration::from_micros(100);

pub struct Transport {
    rx: UnboundedReceiver<(Address, Address, Message, bool)>,
    tx: UnboundedSender<(Address, Address, Message, bool)>,
    recv_table: RecvTable,
    filter_table: FilterTable,
    network: Network,
}
type RecvTable = HashMap<Address, Box<dyn Fn(Address, RxBuffer) + Send>>;
type FilterTable =
    HashMap<u32, Box<dyn Fn(&Address, &Address, &[u8], &mut Duration) -> bool + Send>>;

#[derive(Debug, Clone)]
pub struct RxBuffer(Message);
impl AsRef<[u8]> for RxBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Arrival {
    pub at: Instant,
    pub source: Address,
    pub dest: Address,
    pub length: usize,
}

/// Shared view of the simulated network. Cheap to clone; stays usable after
/// the transport itself moved into its delivery task.
#[derive(Clone, Default)]
pub struct Network(Arc<Mutex<NetworkState>>);

#[derive(Default)]
struct NetworkState {
    registered: HashSet<Address>,
    isolated: HashSet<Address>,
    session_list: Vec<Session<Address>>,
    connect_count: HashMap<(Address, Address), usize>,
    arrival_list: Vec<Arrival>,
}

impl Network {
    /// Cut `address` off: its sessions are cancelled, connects to or from it
    /// hang, and its traffic is lost until [`Network::rejoin`].
    pub fn isolate(&self, address: &str) {
        let mut state = self.0.lock().unwrap();
        state.isolated.insert(address.to_string());
        state.session_list.retain(|session| {
            let involved = session.source() == address || session.dest() == address;
            if involved {
                session.cancel();
            }
            !involved
        });
    }

    pub fn rejoin(&self, address: &str) {
        self.0.lock().unwrap().isolated.remove(address);
    }

    pub fn connect_count(&self, source: &str, dest: &str) -> usize {
        self.0
            .lock()
            .unwrap()
            .connect_count
            .get(&(source.to_string(), dest.to_string()))
            .copied()
            .unwrap_or(0)
    }

    pub fn arrival_list(&self) -> Vec<Arrival> {
        self.0.lock().unwrap().arrival_list.clone()
    }

    fn is_cut(&self, source: &str, dest: &str) -> bool {
        let state = self.0.lock().unwrap();
        state.isolated.contains(source) || state.isolated.contains(dest)
    }
}

#[derive(Clone)]
pub struct TxAgent {
    tx: UnboundedSender<(Address, Address, Message, bool)>,
    network: Network,
}

fn encode(message: impl FnOnce(&mut [u8]) -> u16) -> Message {
    let mut buffer = [0; MAX_MESSAGE_LEN];
    let message_length = message(&mut buffer);
    buffer[..message_length as usize].to_vec()
}

#[async_trait]
impl transport::TxAgent for TxAgent {
    type Transport = Transport;

    fn send_message(
        &self,
        source: &impl Receiver<Self::Transport>,
        dest: &Address,
        message: impl FnOnce(&mut [u8]) -> u16,
    ) {
        let message = encode(message);
        // the delivery loop may be gone at shutdown, nothing to report then
        let _ = self
            .tx
            .send((source.get_address().clone(), dest.clone(), message, false));
    }

    async fn connect(&self, source: &Address, dest: &Address) -> Result<Session<Address>> {
        sleep(CONNECT_LATENCY).await;
        if self.network.is_cut(source, dest) {
            trace!("{} -> {} connect hangs", source, dest);
            pending::<()>().await;
        }
        let mut state = self.network.0.lock().unwrap();
        if !state.registered.contains(dest) {
            return Err(Error::NotConnected(dest.clone()));
        }
        let session = Session::new(source.clone(), dest.clone());
        state.session_list.push(session.clone());
        *state
            .connect_count
            .entry((source.clone(), dest.clone()))
            .or_default() += 1;
        trace!("{} -> {} connected", source, dest);
        Ok(session)
    }

    fn send_session(
        &self,
        session: &Session<Address>,
        message: impl FnOnce(&mut [u8]) -> u16,
    ) -> Result<()> {
        if !session.is_alive() {
            return Err(Error::NotConnected(session.dest().clone()));
        }
        let message = encode(message);
        self.tx
            .send((session.source().clone(), session.dest().clone(), message, false))
            .map_err(|_| Error::Shutdown)
    }
}

impl transport::Transport for Transport {
    type Address = Address;
    type RxBuffer = RxBuffer;
    type TxAgent = TxAgent;

    fn tx_agent(&self) -> Self::TxAgent {
        TxAgent {
            tx: self.tx.clone(),
            network: self.network.clone(),
        }
    }

    fn register(
        &mut self,
        receiver: &impl Receiver<Self>,
        rx_agent: impl Fn(Self::Address, Self::RxBuffer) + 'static + Send,
    ) where
        Self: Sized,
    {
        let address = receiver.get_address().clone();
        self.network
            .0
            .lock()
            .unwrap()
            .registered
            .insert(address.clone());
        self.recv_table.insert(address, Box::new(rx_agent));
    }

    fn ephemeral_address(&self) -> Self::Address {
        let mut label = 'A' as u32;
        loop {
            let address = format!("client-{}", char::from_u32(label).unwrap());
            if !self.recv_table.contains_key(&address) {
                return address;
            }
            label += 1;
        }
    }
}

impl Default for Transport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport {
    pub fn new() -> Self {
        let (tx, rx) = unbounded_channel();
        Self {
            rx,
            tx,
            recv_table: HashMap::new(),
            filter_table: HashMap::new(),
            network: Network::default(),
        }
    }

    pub fn network(&self) -> Network {
        self.network.clone()
    }

    pub async fn deliver(&mut self, duration: Duration) {
        let start = Instant::now();
        let deadline = start + duration;
        loop {
            select! {
                _ = sleep_until(deadline) => break,
                Some((source, dest, message, filtered)) = self.rx.recv() => {
                    self.deliver_internal(source, dest, message, filtered, start);
                }
            }
        }
    }

    pub async fn deliver_until<T>(&mut self, predict: impl Future<Output = T>) -> T {
        let start = Instant::now();
        pin!(predict);
        loop {
            select! {
                output = &mut predict => return output,
                Some((source, dest, message, filtered)) = self.rx.recv() => {
                    self.deliver_internal(source, dest, message, filtered, start)
                }
            }
        }
    }

    fn deliver_internal(
        &self,
        source: Address,
        dest: Address,
        message: Message,
        filtered: bool,
        start: Instant,
    ) {
        if filtered {
            if self.network.is_cut(&source, &dest) {
                trace!("{} -> {} lost in partition", source, dest);
                return;
            }
            if let Some(rx_agent) = self.recv_table.get(&dest) {
                self.network
                    .0
                    .lock()
                    .unwrap()
                    .arrival_list
                    .push(Arrival {
                        at: Instant::now(),
                        source: source.clone(),
                        dest: dest.clone(),
                        length: message.len(),
                    });
                rx_agent(source, RxBuffer(message));
            } else {
                trace!("{} -> {} no receiver", source, dest);
            }
            return;
        }

        let mut delay = Duration::ZERO;
        let mut drop = false;
        for filter in self.filter_table.values() {
            if !filter(&source, &dest, &message, &mut delay) {
                drop = true;
                break;
            }
        }
        trace!(
            "{:?} {} -> {} [message size = {}] {}",
            Instant::now() - start,
            source,
            dest,
            message.len(),
            if drop {
                "[drop]".to_string()
            } else {
                format!("[delay = {:?}]", delay)
            }
        );

        if !drop {
            let tx = self.tx.clone();
            spawn(async move {
                sleep(delay).await;
                let _ = tx.send((source, dest, message, true));
            });
        }
    }

    pub async fn deliver_now(&mut self) {
        self.deliver(Duration::from_micros(1)).await;
    }

    pub fn insert_filter(
        &mut self,
        filter_id: u32,
        filter: impl Fn(&Address, &Address, &[u8], &mut Duration) -> bool + 'static + Send,
    ) {
        self.filter_table.insert(filter_id, Box::new(filter));
    }

    pub fn remove_filter(&mut self, filter_id: u32) {
        self.filter_table.remove(&filter_id);
    }

    pub fn delay(
        min: Duration,
        max: Duration,
    ) -> impl Fn(&Address, &Address, &[u8], &mut Duration) -> bool + 'static + Send {
        move |_, _, _, delay| {
            *delay += thread_rng().gen_range(min..max);
            true
        }
    }

    /// Fixed delay on every message from `source`.
    pub fn delay_from(
        source: &str,
        amount: Duration,
    ) -> impl Fn(&Address, &Address, &[u8], &mut Duration) -> bool + 'static + Send {
        let source = source.to_string();
        move |from, _, _, delay| {
            if *from == source {
                *delay += amount;
            }
            true
        }
    }
}
