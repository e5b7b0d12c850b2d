//! # Remote Peers
//!
//! A `Peer` is one remote endpoint: its status, its request/reply correlation table
//! and the per-peer bookkeeping the core keeps on its behalf.
//!
//! Requests are correlated by stream id. The receive pump (owned by the core) hands
//! every reply to `resolve`, which completes the matching awaiter exactly once.
//! Replies nobody waits for are dropped.

use std::fmt;
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::DashSet;
use futures::future::BoxFuture;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tracing::debug;

use crate::address::Address;
use crate::error::Error;
use crate::error::Result;
use crate::events::ListenerId;
use crate::transport::Transport;
use crate::transport::TransportError;
use crate::wire::Action;
use crate::wire::Definition;
use crate::wire::DefinitionId;
use crate::wire::Packet;
use crate::wire::Status;
use crate::wire::Value;

/// Local handle for a peer, stable before the remote uid is known.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

/// Handler for events emitted by a remote peer.
pub type RemoteHandler = Arc<dyn Fn(Arc<Peer>, Vec<Value>) -> BoxFuture<'static, ()> + Send + Sync>;

pub struct Peer {
    id: PeerId,
    address: Option<Address>,
    transport: OnceLock<Arc<dyn Transport>>,
    status: watch::Sender<Status>,
    uid: OnceLock<String>,
    is_super: AtomicBool,
    stream_seq: AtomicU32,
    awaiters: DashMap<u32, oneshot::Sender<Packet>>,
    disconnected: AtomicBool,

    /// Definitions announced by the remote side, by id.
    pub(crate) defs: DashMap<DefinitionId, Definition>,
    /// Remote contexts by name.
    pub(crate) context_defs: DashMap<String, DefinitionId>,
    /// Contexts we attached on this (super) peer: name -> definition id.
    pub(crate) attached_contexts: DashMap<String, DefinitionId>,
    /// Definition ids the remote side attached on us through CONTEXT_ATTACH.
    pub(crate) own_def_ids: DashSet<DefinitionId>,
    /// Forwarding listeners installed on our emitter for this peer, by event name.
    pub(crate) event_forwarders: DashMap<String, ListenerId>,
    /// Our handlers for events this peer emits, by event name.
    pub(crate) remote_handlers: DashMap<String, Vec<(ListenerId, RemoteHandler)>>,
}

impl Peer {
    fn new(id: PeerId, address: Option<Address>, status: Status) -> Self {
        let (status, _) = watch::channel(status);
        Self {
            id,
            address,
            transport: OnceLock::new(),
            status,
            uid: OnceLock::new(),
            is_super: AtomicBool::new(false),
            stream_seq: AtomicU32::new(1),
            awaiters: DashMap::new(),
            disconnected: AtomicBool::new(false),
            defs: DashMap::new(),
            context_defs: DashMap::new(),
            attached_contexts: DashMap::new(),
            own_def_ids: DashSet::new(),
            event_forwarders: DashMap::new(),
            remote_handlers: DashMap::new(),
        }
    }

    /// A peer we are dialing. The transport is attached once connected.
    pub(crate) fn outbound(id: PeerId, address: Address) -> Self {
        Self::new(id, Some(address), Status::Offline)
    }

    /// A peer that dialed us; it waits for the remote handshake.
    pub(crate) fn inbound(id: PeerId, transport: Arc<dyn Transport>) -> Self {
        let peer = Self::new(id, None, Status::Handshaking);
        let _ = peer.transport.set(transport);
        peer
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn address(&self) -> Option<&Address> {
        self.address.as_ref()
    }

    /// Whether the remote side dialed us.
    pub fn is_inbound(&self) -> bool {
        self.address.is_none()
    }

    /// Remote uid, known once the handshake completes.
    pub fn uid(&self) -> Option<&str> {
        self.uid.get().map(String::as_str)
    }

    pub fn is_super(&self) -> bool {
        self.is_super.load(Ordering::Acquire)
    }

    pub fn status(&self) -> Status {
        *self.status.borrow()
    }

    /// Names of the contexts the remote side exposes.
    pub fn context_names(&self) -> Vec<String> {
        self.context_defs.iter().map(|e| e.key().clone()).collect()
    }

    /// Names of the contexts we attached on this peer.
    pub fn attached_context_names(&self) -> Vec<String> {
        self.attached_contexts.iter().map(|e| e.key().clone()).collect()
    }

    /// A disconnected peer stays OFFLINE.
    pub(crate) fn set_status(&self, status: Status) {
        if self.is_disconnected() && status != Status::Offline {
            return;
        }
        self.status.send_replace(status);
    }

    pub(crate) fn set_transport(&self, transport: Arc<dyn Transport>) -> Result<()> {
        self.transport
            .set(transport)
            .map_err(|_| Error::IllegalState(format!("{} already has a transport", self.id)))
    }

    pub(crate) fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport.get().cloned()
    }

    pub(crate) fn set_identity(&self, uid: String, is_super: bool) -> Result<()> {
        self.is_super.store(is_super, Ordering::Release);
        self.uid
            .set(uid)
            .map_err(|_| Error::IllegalState(format!("{} already completed a handshake", self.id)))
    }

    /// Flips the peer into its terminal state. Returns false if it already was.
    pub(crate) fn mark_disconnected(&self) -> bool {
        !self.disconnected.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    /// Waits until the peer is either online or gone, returning the final status.
    pub(crate) async fn settled(&self) -> Status {
        let mut rx = self.status.subscribe();
        let result = rx
            .wait_for(|s| matches!(s, Status::Online) || self.is_disconnected())
            .await
            .map(|s| *s);
        match result {
            Ok(status) if !self.is_disconnected() => status,
            _ => Status::Offline,
        }
    }

    /// Resolves once the peer drops to OFFLINE.
    pub(crate) async fn offline(&self) {
        let mut rx = self.status.subscribe();
        let _ = rx.wait_for(|s| matches!(s, Status::Offline)).await;
    }

    pub(crate) fn next_stream_id(&self) -> u32 {
        self.stream_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Frames and writes one packet, stamped with the current status.
    ///
    /// # Errors
    /// `IllegalState` unless the peer is handshaking or online.
    pub(crate) async fn send(&self, impulse: bool, stream_id: u32, action: Action, data: Value) -> Result<()> {
        let status = self.status();
        if !status.can_send() {
            return Err(Error::IllegalState(format!("cannot send to {} while {status}", self.id)));
        }
        let Some(transport) = self.transport() else {
            return Err(Error::IllegalState(format!("{} has no transport", self.id)));
        };

        let packet = Packet::new(stream_id, impulse, status, action, data);
        let bytes = packet.encode()?;
        debug!(peer = %self.id, stream_id, ?action, impulse, "send");
        transport.send(&bytes).await?;
        Ok(())
    }

    pub(crate) async fn reply(&self, stream_id: u32, action: Action, data: Value) -> Result<()> {
        self.send(false, stream_id, action, data).await
    }

    /// Sends a request and waits for the correlated reply.
    ///
    /// The awaiter is registered before the write, and removed again on send
    /// failure or when `deadline` passes.
    pub(crate) async fn request(&self, action: Action, data: Value, deadline: Duration) -> Result<Packet> {
        let stream_id = self.next_stream_id();
        let (tx, rx) = oneshot::channel();
        self.awaiters.insert(stream_id, tx);

        if let Err(e) = self.send(true, stream_id, action, data).await {
            self.awaiters.remove(&stream_id);
            return Err(e);
        }

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(packet)) => Ok(packet),
            Ok(Err(_)) => {
                self.awaiters.remove(&stream_id);
                Err(TransportError::ConnectionLost(format!("{} dropped", self.id)).into())
            }
            Err(_) => {
                self.awaiters.remove(&stream_id);
                Err(Error::Timeout(deadline))
            }
        }
    }

    /// Hands a reply to its awaiter. Returns false when nobody was waiting.
    pub(crate) fn resolve(&self, packet: Packet) -> bool {
        match self.awaiters.remove(&packet.stream_id) {
            Some((_, tx)) => {
                let _ = tx.send(packet);
                true
            }
            None => false,
        }
    }

    pub fn pending_requests(&self) -> usize {
        self.awaiters.len()
    }

    /// Records definitions the remote side announced.
    pub(crate) fn ingest_definition(&self, def: Definition) {
        self.defs.insert(def.id, def);
    }

    pub(crate) fn add_context_def(&self, name: String, def: Definition) {
        self.context_defs.insert(name, def.id);
        self.ingest_definition(def);
    }

    /// Forgets a detached remote context along with its definition.
    pub(crate) fn remove_context_def(&self, name: &str) -> Option<DefinitionId> {
        let (_, id) = self.context_defs.remove(name)?;
        self.defs.remove(&id);
        Some(id)
    }

    pub(crate) fn context_definition(&self, name: &str) -> Option<Definition> {
        let id = *self.context_defs.get(name)?;
        self.defs.get(&id).map(|d| d.clone())
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("uid", &self.uid())
            .field("status", &self.status())
            .finish()
    }
}
