pub mod simulated;

use std::{
    fmt::Debug,
    hash::Hash,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use async_trait::async_trait;

use crate::error::Result;

/// Largest encoded message a transport buffer holds.
pub const MAX_MESSAGE_LEN: usize = 9000;

pub trait Transport
where
    Self: 'static,
{
    type Address: Clone + Eq + Hash + Debug + Send + Sync;
    type RxBuffer: AsRef<[u8]> + Send;
    // shared by the replication link and the recovery tasks, which run on any
    // worker thread
    type TxAgent: TxAgent<Transport = Self> + Clone + Send + Sync;

    fn tx_agent(&self) -> Self::TxAgent;

    fn register(
        &mut self,
        receiver: &impl Receiver<Self>,
        rx_agent: impl Fn(Self::Address, Self::RxBuffer) + 'static + Send,
    ) where
        Self: Sized;

    fn ephemeral_address(&self) -> Self::Address;
}

pub trait Receiver<T: Transport> {
    fn get_address(&self) -> &T::Address;
}

/// Established connection from `source` to `dest`. Any holder may cancel it;
/// the transport cancels it when either end goes away.
#[derive(Debug, Clone)]
pub struct Session<A> {
    source: A,
    dest: A,
    alive: Arc<AtomicBool>,
}

impl<A> Session<A> {
    pub fn new(source: A, dest: A) -> Self {
        Self {
            source,
            dest,
            alive: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn source(&self) -> &A {
        &self.source
    }

    pub fn dest(&self) -> &A {
        &self.dest
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

pub type Address<T> = <T as Transport>::Address;

#[async_trait]
pub trait TxAgent {
    type Transport: Transport;

    /// Best-effort datagram, used for replies.
    fn send_message(
        &self,
        source: &impl Receiver<Self::Transport>,
        dest: &Address<Self::Transport>,
        message: impl FnOnce(&mut [u8]) -> u16,
    );

    /// Establish a session. May never complete if the peer is unreachable;
    /// callers bound it with their own timeout.
    async fn connect(
        &self,
        source: &Address<Self::Transport>,
        dest: &Address<Self::Transport>,
    ) -> Result<Session<Address<Self::Transport>>>;

    /// Fails `NotConnected` on a cancelled session.
    fn send_session(
        &self,
        session: &Session<Address<Self::Transport>>,
        message: impl FnOnce(&mut [u8]) -> u16,
    ) -> Result<()>;
}
