//! In-process transports.
//!
//! `ChannelTransport` is a duplex pipe over tokio mpsc channels: what one end sends,
//! the other receives. `MemoryNetwork` is a `Connector` over such pipes, where
//! netrons listen on addresses and every connect hands the far end to the
//! listener's `accept`.

use std::sync::Arc;
use std::sync::Weak;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tracing::debug;

use crate::address::Address;
use crate::error::Error;
use crate::error::Result;
use crate::netron::Netron;
use crate::transport;
use crate::transport::Connector;
use crate::transport::Transport;
use crate::transport::TransportError;

/// A duplex channel transport using tokio mpsc channels.
pub struct ChannelTransport {
    tx: std::sync::Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    closed: watch::Sender<bool>,
}

impl ChannelTransport {
    fn new(tx: mpsc::UnboundedSender<Vec<u8>>, rx: mpsc::UnboundedReceiver<Vec<u8>>) -> Self {
        let (closed, _) = watch::channel(false);
        Self { tx: std::sync::Mutex::new(Some(tx)), rx: Mutex::new(rx), closed }
    }

    /// Creates a pair of transports connected to each other.
    ///
    /// Messages sent on `a` are received by `b` and vice versa.
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        (Self::new(tx_a, rx_b), Self::new(tx_b, rx_a))
    }

    fn sender(&self) -> Option<mpsc::UnboundedSender<Vec<u8>>> {
        self.tx.lock().ok().and_then(|tx| tx.clone())
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, payload: &[u8]) -> transport::Result<()> {
        let Some(tx) = self.sender() else {
            return Err(TransportError::ConnectionLost("transport closed".into()));
        };
        tx.send(payload.to_vec())
            .map_err(|_| TransportError::ConnectionLost("channel closed".into()))
    }

    async fn recv(&self) -> transport::Result<Option<Vec<u8>>> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Ok(None);
        }
        let mut rx = self.rx.lock().await;
        tokio::select! {
            msg = rx.recv() => Ok(msg),
            _ = closed.wait_for(|c| *c) => Ok(None),
        }
    }

    async fn close(&self) {
        // Dropping our sender ends the far side's stream.
        if let Ok(mut tx) = self.tx.lock() {
            tx.take();
        }
        self.closed.send_replace(true);
    }
}

/// An in-memory network of listening netrons.
#[derive(Default)]
pub struct MemoryNetwork {
    listeners: DashMap<String, Weak<Netron>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes `netron` reachable at `address`, normalised with its own config.
    pub fn listen(&self, address: &str, netron: &Arc<Netron>) -> Result<Address> {
        let config = netron.config();
        let address = Address::parse(address, &config.protocol, config.default_port)?;
        match self.listeners.entry(address.key()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(Error::Exists(format!("{address} is already in use")))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::downgrade(netron));
                debug!(%address, uid = netron.uid(), "listening");
                Ok(address)
            }
        }
    }

    pub fn unlisten(&self, address: &Address) -> bool {
        self.listeners.remove(&address.key()).is_some()
    }
}

#[async_trait]
impl Connector for MemoryNetwork {
    async fn connect(&self, address: &Address) -> transport::Result<Box<dyn Transport>> {
        let listener = self.listeners.get(&address.key()).and_then(|l| l.upgrade());
        let Some(listener) = listener else {
            return Err(TransportError::Refused(address.to_string()));
        };
        let (local, remote) = ChannelTransport::pair();
        listener.accept(Box::new(remote));
        Ok(Box::new(local))
    }
}
