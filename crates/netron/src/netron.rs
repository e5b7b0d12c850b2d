//! # Netron Core
//!
//! The engine that owns every registry: attached contexts, stubs by definition id,
//! stubs handed to specific peers, cached interfaces and peers by uid and address.
//!
//! Uses DashMap for the registries so the receive pumps of many peers can mutate
//! them concurrently without a global lock.
//!
//! ## Release cascade
//! Releasing a definition removes it and, transitively, every stub whose parent is
//! already released. No child definition stays reachable once its root is gone.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::Weak;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::address::Address;
use crate::config::NetronConfig;
use crate::context;
use crate::context::Context;
use crate::context::same_instance;
use crate::error::Error;
use crate::error::ErrorKind;
use crate::error::RemoteError;
use crate::error::Result;
use crate::events::CONTEXT_ATTACH_EVENT;
use crate::events::CONTEXT_DETACH_EVENT;
use crate::events::EventEmitter;
use crate::events::LifecycleEvent;
use crate::events::LifecycleListener;
use crate::events::LifecycleQueue;
use crate::events::Listener;
use crate::events::ListenerId;
use crate::hooks::DefaultHooks;
use crate::hooks::Hooks;
use crate::interface::Interface;
use crate::marshal;
use crate::peer::Peer;
use crate::peer::PeerId;
use crate::peer::RemoteHandler;
use crate::stub::Stub;
use crate::transport::Connector;
use crate::transport::Transport;
use crate::twin::TwinFactory;
use crate::twin::TwinInterpreter;
use crate::twin::TwinRegistry;
use crate::wire::Action;
use crate::wire::Definition;
use crate::wire::DefinitionId;
use crate::wire::Packet;
use crate::wire::ROOT_PARENT;
use crate::wire::Status;
use crate::wire::Value;
use crate::wire::WireError;

pub struct Netron {
    pub(crate) me: Weak<Netron>,
    uid: String,
    pub(crate) config: NetronConfig,
    pub(crate) hooks: Arc<dyn Hooks>,
    connector: OnceLock<Arc<dyn Connector>>,
    twin_interpreter: OnceLock<Arc<dyn TwinInterpreter>>,
    def_seq: AtomicU32,
    peer_seq: AtomicU64,
    handler_seq: AtomicU64,
    contexts: DashMap<String, Arc<Stub>>,
    stubs: DashMap<DefinitionId, Arc<Stub>>,
    stubs_by_peer: DashMap<String, Vec<Arc<Stub>>>,
    interfaces: DashMap<(Option<String>, DefinitionId), Interface>,
    peers_by_uid: DashMap<String, Arc<Peer>>,
    peers_by_address: DashMap<String, Arc<Peer>>,
    twins: TwinRegistry,
    pub(crate) emitter: Arc<EventEmitter>,
    pub(crate) lifecycle: LifecycleQueue,
}

impl Netron {
    pub fn new(config: NetronConfig) -> Arc<Self> {
        Self::with_hooks(config, Arc::new(DefaultHooks))
    }

    pub fn with_hooks(config: NetronConfig, hooks: Arc<dyn Hooks>) -> Arc<Self> {
        let emitter = Arc::new(EventEmitter::new());
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            uid: uuid::Uuid::new_v4().to_string(),
            config,
            hooks,
            connector: OnceLock::new(),
            twin_interpreter: OnceLock::new(),
            def_seq: AtomicU32::new(1),
            peer_seq: AtomicU64::new(1),
            handler_seq: AtomicU64::new(1),
            contexts: DashMap::new(),
            stubs: DashMap::new(),
            stubs_by_peer: DashMap::new(),
            interfaces: DashMap::new(),
            peers_by_uid: DashMap::new(),
            peers_by_address: DashMap::new(),
            twins: TwinRegistry::default(),
            lifecycle: LifecycleQueue::new(emitter.clone()),
            emitter,
        })
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn config(&self) -> &NetronConfig {
        &self.config
    }

    pub fn set_connector(&self, connector: Arc<dyn Connector>) -> Result<()> {
        self.connector
            .set(connector)
            .map_err(|_| Error::Exists("a connector is already installed".into()))
    }

    pub fn set_twin_interpreter(&self, interpreter: Arc<dyn TwinInterpreter>) -> Result<()> {
        self.twin_interpreter
            .set(interpreter)
            .map_err(|_| Error::Exists("a twin interpreter is already installed".into()))
    }

    /// Registers the override used for every interface whose definition is named `name`.
    pub fn set_interface_twin(&self, name: &str, factory: TwinFactory) -> Result<()> {
        self.twins.register(name, factory)
    }

    fn next_def_id(&self) -> DefinitionId {
        self.def_seq.fetch_add(1, Ordering::Relaxed)
    }

    fn next_peer_id(&self) -> PeerId {
        PeerId(self.peer_seq.fetch_add(1, Ordering::Relaxed))
    }

    fn next_handler_id(&self) -> ListenerId {
        self.handler_seq.fetch_add(1, Ordering::Relaxed)
    }

    // ========================================================================
    //  PEERS
    // ========================================================================

    /// Connects to `address` (`host[:port]`), completing the handshake.
    ///
    /// Concurrent and repeated calls for the same normalised address share one
    /// peer and one transport-level connection.
    pub async fn connect(&self, address: &str) -> Result<Arc<Peer>> {
        let address = Address::parse(address, &self.config.protocol, self.config.default_port)?;

        let (peer, fresh) = match self.peers_by_address.entry(address.key()) {
            Entry::Occupied(existing) => (existing.get().clone(), false),
            Entry::Vacant(slot) => {
                let peer = Arc::new(Peer::outbound(self.next_peer_id(), address.clone()));
                slot.insert(peer.clone());
                (peer, true)
            }
        };

        if !fresh {
            return match peer.settled().await {
                Status::Online => Ok(peer),
                _ => Err(Error::Connect(format!("connection to {address} failed"))),
            };
        }

        match self.establish(&peer, &address).await {
            Ok(()) => Ok(peer),
            Err(e) => {
                warn!(%address, error = %e, "connect failed");
                self.peer_disconnected(&peer).await;
                Err(Error::Connect(format!("{address}: {e}")))
            }
        }
    }

    async fn establish(&self, peer: &Arc<Peer>, address: &Address) -> Result<()> {
        let connector = self
            .connector
            .get()
            .cloned()
            .ok_or_else(|| Error::InvalidArgument("no connector installed".into()))?;

        self.lifecycle.submit(LifecycleEvent::PeerCreate(peer.clone()));
        peer.set_status(Status::Connecting);

        let transport = self.open_transport(connector.as_ref(), address).await?;
        peer.set_transport(Arc::from(transport))?;
        self.start_pump(peer.clone());
        self.lifecycle.submit(LifecycleEvent::PeerConnect(peer.clone()));

        peer.set_status(Status::Handshaking);
        let payload = self.handshake_payload(peer);
        let reply = tokio::select! {
            reply = peer.request(Action::Get, payload, self.config.response_deadline()) => reply?,
            _ = peer.offline() => {
                return Err(Error::Connect(format!("{address} disconnected during handshake")));
            }
        };
        self.receive_initial(peer, reply.data)?;

        peer.set_status(Status::Online);
        info!(peer = %peer.id(), uid = ?peer.uid(), %address, "peer online");
        self.lifecycle.submit(LifecycleEvent::PeerOnline(peer.clone()));
        self.bootstrap(peer).await;
        Ok(())
    }

    /// Transport-level connect with exponential back-off between attempts.
    async fn open_transport(&self, connector: &dyn Connector, address: &Address) -> Result<Box<dyn Transport>> {
        let mut attempt = 0;
        loop {
            match connector.connect(address).await {
                Ok(transport) => return Ok(transport),
                Err(e) if attempt < self.config.reconnects => {
                    attempt += 1;
                    let delay = self.config.retry_delay(attempt);
                    debug!(%address, attempt, ?delay, error = %e, "retrying connect");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Takes over an inbound connection. The peer waits for the remote handshake.
    pub fn accept(&self, transport: Box<dyn Transport>) -> Arc<Peer> {
        let peer = Arc::new(Peer::inbound(self.next_peer_id(), Arc::from(transport)));
        info!(peer = %peer.id(), "inbound connection");
        self.lifecycle.submit(LifecycleEvent::PeerCreate(peer.clone()));
        self.lifecycle.submit(LifecycleEvent::PeerConnect(peer.clone()));
        self.start_pump(peer.clone());
        peer
    }

    /// Spawns the receive loop for `peer`. When the stream ends the peer is
    /// torn down.
    fn start_pump(&self, peer: Arc<Peer>) {
        let Some(transport) = peer.transport() else {
            return;
        };
        let netron = self.me.clone();

        tokio::spawn(async move {
            loop {
                let bytes = match transport.recv().await {
                    Ok(Some(bytes)) => bytes,
                    Ok(None) => {
                        debug!(peer = %peer.id(), "stream closed");
                        break;
                    }
                    Err(e) => {
                        warn!(peer = %peer.id(), error = %e, "transport error in pump");
                        break;
                    }
                };
                let Some(netron) = netron.upgrade() else {
                    return;
                };
                match Packet::decode(&bytes) {
                    Ok(packet) => netron.route(&peer, packet).await,
                    Err(e) => warn!(peer = %peer.id(), error = %e, "dropping malformed packet"),
                }
            }

            if let Some(netron) = netron.upgrade() {
                netron.peer_disconnected(&peer).await;
            }
        });
    }

    pub(crate) fn handshake_payload(&self, peer: &Arc<Peer>) -> Value {
        let mut fields = self.hooks.handshake_payload(self, peer);
        let defs = self
            .contexts
            .iter()
            .map(|e| (e.key().clone(), Value::Definition(e.value().definition().clone())))
            .collect();
        fields.insert("uid".into(), Value::Str(self.uid.clone()));
        fields.insert("isSuper".into(), Value::Bool(self.config.is_super));
        fields.insert("defs".into(), Value::Map(defs));
        Value::Map(fields)
    }

    /// Ingests a handshake payload: identity, super flag and announced contexts.
    /// Returns the remaining fields.
    pub(crate) fn receive_initial(&self, peer: &Arc<Peer>, data: Value) -> Result<BTreeMap<String, Value>> {
        let violation = |what: &str| Error::Wire(WireError::ProtocolViolation(format!("handshake {what}")));

        let Value::Map(mut fields) = data else {
            return Err(violation("payload must be a map"));
        };
        let Some(Value::Str(uid)) = fields.remove("uid") else {
            return Err(violation("payload has no uid"));
        };
        let is_super = matches!(fields.remove("isSuper"), Some(Value::Bool(true)));

        match fields.remove("defs") {
            Some(Value::Map(defs)) => {
                for (name, def) in defs {
                    match def {
                        Value::Definition(def) => peer.add_context_def(name, def),
                        _ => return Err(violation("defs must map names to definitions")),
                    }
                }
            }
            Some(Value::Null) | None => {}
            Some(_) => return Err(violation("defs must be a map")),
        }

        peer.set_identity(uid.clone(), is_super)?;
        if let Some(previous) = self.peers_by_uid.insert(uid.clone(), peer.clone()) {
            if !Arc::ptr_eq(&previous, peer) {
                warn!(%uid, "replacing peer registered under the same uid");
            }
        }
        Ok(fields)
    }

    /// Tracks the remote's context attach/detach events after it comes online.
    async fn bootstrap(&self, peer: &Arc<Peer>) {
        let attached: RemoteHandler = Arc::new(|peer: Arc<Peer>, args: Vec<Value>| {
            async move {
                let Some(Value::Map(fields)) = args.first() else {
                    return;
                };
                if let (Some(Value::Str(name)), Some(Value::Definition(def))) = (fields.get("id"), fields.get("def")) {
                    peer.add_context_def(name.clone(), def.clone());
                }
            }
            .boxed()
        });
        let detached: RemoteHandler = Arc::new(|peer: Arc<Peer>, args: Vec<Value>| {
            async move {
                if let Some(Value::Str(name)) = args.first().and_then(Value::as_map).and_then(|m| m.get("id")) {
                    peer.remove_context_def(name);
                }
            }
            .boxed()
        });

        for (event, handler) in [(CONTEXT_ATTACH_EVENT, attached), (CONTEXT_DETACH_EVENT, detached)] {
            let id = self.next_handler_id();
            if let Err(e) = self.subscribe_remote(peer, event, id, handler).await {
                warn!(peer = %peer.id(), event, error = %e, "bootstrap subscription failed");
            }
        }
    }

    pub async fn disconnect(&self, uid: &str) -> Result<()> {
        let peer = self.peer(uid)?;
        self.peer_disconnected(&peer).await;
        Ok(())
    }

    pub async fn disconnect_all(&self) {
        let mut peers: Vec<Arc<Peer>> = self.peers_by_uid.iter().map(|e| e.value().clone()).collect();
        for entry in self.peers_by_address.iter() {
            if !peers.iter().any(|p| Arc::ptr_eq(p, entry.value())) {
                peers.push(entry.value().clone());
            }
        }
        for peer in peers {
            self.peer_disconnected(&peer).await;
        }
    }

    /// Tears down everything kept on behalf of `peer`. Safe to call repeatedly.
    pub(crate) async fn peer_disconnected(&self, peer: &Arc<Peer>) {
        if !peer.mark_disconnected() {
            return;
        }
        peer.set_status(Status::Offline);
        if let Some(transport) = peer.transport() {
            transport.close().await;
        }

        if let Some(address) = peer.address() {
            self.peers_by_address.remove_if(&address.key(), |_, p| Arc::ptr_eq(p, peer));
        }

        let forwarders: Vec<(String, ListenerId)> =
            peer.event_forwarders.iter().map(|e| (e.key().clone(), *e.value())).collect();
        for (event, id) in forwarders {
            self.emitter.off(&event, id);
        }
        peer.event_forwarders.clear();

        if let Some(uid) = peer.uid() {
            self.peers_by_uid.remove_if(uid, |_, p| Arc::ptr_eq(p, peer));

            let mut released: Vec<DefinitionId> = match self.stubs_by_peer.remove(uid) {
                Some((_, stubs)) => stubs.iter().map(|s| s.id()).collect(),
                None => Vec::new(),
            };
            released.extend(self.stubs.iter().filter(|e| e.value().uid() == Some(uid)).map(|e| *e.key()));
            for def_id in released {
                self.release_originated(def_id);
            }

            self.interfaces.retain(|(owner, _), _| owner.as_deref() != Some(uid));
        }

        info!(peer = %peer.id(), uid = ?peer.uid(), "peer offline");
        self.lifecycle.submit(LifecycleEvent::PeerOffline(peer.clone()));
    }

    pub fn peer(&self, uid: &str) -> Result<Arc<Peer>> {
        self.peers_by_uid
            .get(uid)
            .map(|p| p.clone())
            .ok_or_else(|| Error::Unknown(format!("Unknown peer '{uid}'")))
    }

    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.peers_by_uid.iter().map(|e| e.value().clone()).collect()
    }

    pub fn peer_for_interface(&self, iface: &Interface) -> Result<Arc<Peer>> {
        match iface.uid() {
            Some(uid) => self.peer(uid),
            None => Err(Error::InvalidArgument(format!("interface '{}' is local", iface.name()))),
        }
    }

    // ========================================================================
    //  CONTEXTS AND STUBS
    // ========================================================================

    /// Exposes `instance` under `name` (its class name by default).
    pub fn attach_context(&self, instance: Arc<dyn Context>, name: Option<&str>) -> Result<DefinitionId> {
        context::validate(instance.as_ref())?;
        let name = name.unwrap_or(instance.name()).to_string();

        if self.contexts.iter().any(|e| same_instance(e.value().instance(), &instance)) {
            return Err(Error::IllegalState(format!("instance is already attached as a context ('{name}')")));
        }

        let stub = match self.contexts.entry(name.clone()) {
            Entry::Occupied(_) => return Err(Error::Exists(format!("Context '{name}' already attached"))),
            Entry::Vacant(slot) => {
                let stub = Arc::new(Stub::new(self.next_def_id(), ROOT_PARENT, instance, None));
                slot.insert(stub.clone());
                stub
            }
        };
        self.stubs.insert(stub.id(), stub.clone());

        info!(name, def_id = stub.id(), "context attached");
        self.lifecycle.submit(LifecycleEvent::ContextAttach { name, definition: stub.definition().clone() });
        Ok(stub.id())
    }

    pub fn detach_context(&self, name: &str) -> Result<()> {
        let Some((_, stub)) = self.contexts.remove(name) else {
            return Err(Error::Unknown(format!("Unknown context '{name}'")));
        };
        let def_id = stub.id();
        self.release_originated(def_id);

        info!(name, def_id, "context detached");
        self.lifecycle.submit(LifecycleEvent::ContextDetach { name: name.to_string(), def_id });
        Ok(())
    }

    pub fn has_context(&self, name: &str) -> bool {
        self.contexts.contains_key(name)
    }

    pub fn context_names(&self) -> Vec<String> {
        self.contexts.iter().map(|e| e.key().clone()).collect()
    }

    pub fn stub_by_id(&self, def_id: DefinitionId) -> Option<Arc<Stub>> {
        self.stubs.get(&def_id).map(|s| s.clone())
    }

    /// Exposes `instance` to the peer `uid`, reusing its stub if it already has one.
    pub fn ref_context(&self, uid: &str, instance: Arc<dyn Context>) -> Result<Definition> {
        self.ref_context_with_parent(uid, instance, ROOT_PARENT)
    }

    pub(crate) fn ref_context_with_parent(
        &self,
        uid: &str,
        instance: Arc<dyn Context>,
        parent: DefinitionId,
    ) -> Result<Definition> {
        context::validate(instance.as_ref())?;

        let mut stubs = self.stubs_by_peer.entry(uid.to_string()).or_default();
        if let Some(stub) = stubs.iter().find(|s| same_instance(s.instance(), &instance)) {
            return Ok(stub.definition().clone());
        }

        let stub = Arc::new(Stub::new(self.next_def_id(), parent, instance, Some(uid.to_string())));
        stubs.push(stub.clone());
        drop(stubs);
        self.stubs.insert(stub.id(), stub.clone());

        debug!(uid, def_id = stub.id(), parent, "context referenced");
        Ok(stub.definition().clone())
    }

    /// Drops every stub handed out for `instance`, with their descendants.
    /// Attached contexts are left alone; use `detach_context` for those.
    pub fn release_context(&self, instance: &Arc<dyn Context>) -> Result<()> {
        let ids: Vec<DefinitionId> = self
            .stubs
            .iter()
            .filter(|e| e.value().uid().is_some() && same_instance(e.value().instance(), instance))
            .map(|e| *e.key())
            .collect();
        if ids.is_empty() {
            return Err(Error::NotExists(format!("context '{}' is not referenced", instance.name())));
        }
        for def_id in ids {
            self.release_originated(def_id);
        }
        Ok(())
    }

    /// Removes `root` and everything transitively derived from it. Returns the
    /// released ids.
    pub(crate) fn release_originated(&self, root: DefinitionId) -> HashSet<DefinitionId> {
        let mut released = HashSet::from([root]);
        let mut frontier = vec![root];

        while let Some(parent) = frontier.pop() {
            let children: Vec<DefinitionId> = self
                .stubs
                .iter()
                .filter(|e| e.value().definition().parent_id == parent)
                .map(|e| *e.key())
                .collect();
            for child in children {
                if released.insert(child) {
                    frontier.push(child);
                }
            }
        }

        for def_id in &released {
            if let Some((_, stub)) = self.stubs.remove(def_id) {
                self.forget_peer_stub(&stub);
            }
        }
        debug!(root, count = released.len(), "released definitions");
        released
    }

    fn forget_peer_stub(&self, stub: &Arc<Stub>) {
        let Some(uid) = stub.uid() else {
            return;
        };
        if let Some(mut stubs) = self.stubs_by_peer.get_mut(uid) {
            stubs.retain(|s| !Arc::ptr_eq(s, stub));
        }
        self.stubs_by_peer.remove_if(uid, |_, stubs| stubs.is_empty());
    }

    /// Asks the super peer `uid` to host `instance` under `name`.
    pub async fn attach_context_remote(
        &self,
        uid: &str,
        instance: Arc<dyn Context>,
        name: Option<&str>,
    ) -> Result<DefinitionId> {
        let peer = self.super_peer(uid)?;
        context::validate(instance.as_ref())?;
        let name = name.unwrap_or(instance.name()).to_string();
        if peer.attached_contexts.contains_key(&name) {
            return Err(Error::Exists(format!("Context '{name}' already attached on '{uid}'")));
        }

        let def = self.ref_context(uid, instance)?;
        let data = Value::List(vec![Value::Str(name.clone()), Value::Definition(def.clone())]);
        let outcome = async {
            let reply = peer.request(Action::ContextAttach, data, self.config.response_deadline()).await?;
            self.process_result(&peer, reply.data)
        }
        .await;
        if let Err(e) = outcome {
            self.release_originated(def.id);
            return Err(e);
        }

        peer.attached_contexts.insert(name.clone(), def.id);
        info!(uid, name, def_id = def.id, "context attached remotely");
        Ok(def.id)
    }

    pub async fn detach_context_remote(&self, uid: &str, name: &str) -> Result<()> {
        let peer = self.super_peer(uid)?;
        let Some(def_id) = peer.attached_contexts.get(name).map(|id| *id) else {
            return Err(Error::NotExists(format!("Context '{name}' not attached on '{uid}'")));
        };

        let data = Value::List(vec![Value::Str(name.to_string()), Value::from(def_id)]);
        let reply = peer.request(Action::ContextDetach, data, self.config.response_deadline()).await?;
        self.process_result(&peer, reply.data)?;

        peer.attached_contexts.remove(name);
        self.release_originated(def_id);
        info!(uid, name, def_id, "context detached remotely");
        Ok(())
    }

    fn super_peer(&self, uid: &str) -> Result<Arc<Peer>> {
        let peer = self.peer(uid)?;
        if !peer.is_super() {
            return Err(Error::Unknown(format!("peer '{uid}' is not a super peer")));
        }
        Ok(peer)
    }

    // ========================================================================
    //  DEFINITIONS AND INTERFACES
    // ========================================================================

    /// Definition of context `name`, local when `uid` is `None`.
    pub fn definition_by_name(&self, name: &str, uid: Option<&str>) -> Result<Definition> {
        let found = match uid {
            None => self.contexts.get(name).map(|s| s.definition().clone()),
            Some(uid) => self.peer(uid)?.context_definition(name),
        };
        found.ok_or_else(|| Error::Unknown(format!("Unknown context '{name}'")))
    }

    pub fn interface_by_name(&self, name: &str, uid: Option<&str>) -> Result<Interface> {
        let def = self.definition_by_name(name, uid)?;
        self.interface_for(def, uid)
    }

    pub fn interface_by_id(&self, def_id: DefinitionId, uid: Option<&str>) -> Result<Interface> {
        let found = match uid {
            None => self.stub_by_id(def_id).map(|s| s.definition().clone()),
            Some(uid) => self.peer(uid)?.defs.get(&def_id).map(|d| d.clone()),
        };
        let def = found.ok_or_else(|| Error::Unknown(format!("Unknown definition '{def_id}'")))?;
        self.interface_for(def, uid)
    }

    /// The cached interface for `(uid, def.id)`, built on first use.
    pub fn interface_for(&self, def: Definition, uid: Option<&str>) -> Result<Interface> {
        let key = (uid.map(str::to_string), def.id);
        if let Some(existing) = self.interfaces.get(&key) {
            return Ok(existing.clone());
        }

        let accept_inline = uid.is_none() || self.config.accept_twins;
        let interpreter = self.twin_interpreter.get().map(|i| &**i);
        let twin = self.twins.resolve(&def, interpreter, accept_inline)?;

        let base = Interface::plain(def, key.0.clone(), self.me.clone());
        let iface = match twin {
            Some(twin) => Interface::with_twin(base, twin),
            None => base,
        };
        Ok(self.interfaces.entry(key).or_insert(iface).clone())
    }

    pub fn release_interface(&self, iface: &Interface) -> Result<()> {
        let key = (iface.uid().map(str::to_string), iface.def_id());
        match self.interfaces.remove_if(&key, |_, cached| cached.same(iface)) {
            Some(_) => Ok(()),
            None => Err(Error::NotExists(format!("interface '{}' is not cached", iface.name()))),
        }
    }

    // ========================================================================
    //  CALLS
    // ========================================================================

    fn local_stub(&self, def_id: DefinitionId) -> Result<Arc<Stub>> {
        self.stub_by_id(def_id)
            .ok_or_else(|| Error::NotExists(format!("Context with definition id '{def_id}' not exists")))
    }

    /// Reads a property or calls a method on definition `def_id` owned by `uid`
    /// (local when `None`).
    pub async fn get(&self, uid: Option<&str>, def_id: DefinitionId, name: &str, args: Vec<Value>) -> Result<Value> {
        let Some(uid) = uid else {
            return self.local_stub(def_id)?.get(self, name, args, None).await;
        };
        let peer = self.peer(uid)?;
        let args = marshal::marshal_args(self, &peer, args)?;
        let data = Value::List(vec![Value::from(def_id), Value::from(name), Value::List(args)]);
        let reply = peer.request(Action::Get, data, self.config.response_deadline()).await?;
        self.process_result(&peer, reply.data)
    }

    /// Writes a property (or calls a method) without waiting for a result.
    pub async fn set(&self, uid: Option<&str>, def_id: DefinitionId, name: &str, value: Value) -> Result<()> {
        let Some(uid) = uid else {
            return self.local_stub(def_id)?.set(self, name, value, None).await;
        };
        let peer = self.peer(uid)?;
        let value = marshal::marshal(self, &peer, value, ROOT_PARENT)?;
        let data = Value::List(vec![Value::from(def_id), Value::from(name), value]);
        peer.send(true, peer.next_stream_id(), Action::Set, data).await
    }

    pub async fn call(&self, uid: Option<&str>, def_id: DefinitionId, method: &str, args: Vec<Value>) -> Result<Value> {
        self.get(uid, def_id, method, args).await
    }

    pub async fn call_void(&self, uid: Option<&str>, def_id: DefinitionId, method: &str, args: Vec<Value>) -> Result<()> {
        self.set(uid, def_id, method, Value::List(args)).await
    }

    /// Round-trips a PING to `uid`. A local ping succeeds immediately.
    pub async fn ping(&self, uid: Option<&str>) -> Result<()> {
        let Some(uid) = uid else {
            return Ok(());
        };
        let peer = self.peer(uid)?;
        peer.request(Action::Ping, Value::Null, self.config.response_deadline()).await?;
        Ok(())
    }

    /// Unpacks an `[errFlag, result]` reply.
    pub(crate) fn process_result(&self, peer: &Arc<Peer>, data: Value) -> Result<Value> {
        let violation = || Error::Wire(WireError::ProtocolViolation("reply must be [errFlag, result]".into()));
        let Some([flag, result]) = data.into_list().and_then(|l| <[Value; 2]>::try_from(l).ok()) else {
            return Err(violation());
        };
        let failed = match flag {
            Value::Bool(b) => b,
            Value::Int(n) => n != 0,
            _ => return Err(violation()),
        };

        if failed {
            return Err(match result {
                Value::Error(remote) => remote.into(),
                other => Error::Remote(RemoteError::new(ErrorKind::Other, format!("{other:?}"))),
            });
        }
        marshal::unmarshal(self, peer, result)
    }

    // ========================================================================
    //  EVENTS
    // ========================================================================

    pub fn on(&self, event: &str, listener: Listener) -> ListenerId {
        self.emitter.on(event, listener)
    }

    pub fn off(&self, event: &str, id: ListenerId) -> bool {
        self.emitter.off(event, id)
    }

    /// Emits a local event, awaiting every listener including remote forwarders.
    pub async fn emit(&self, event: &str, args: Vec<Value>) -> usize {
        self.emitter.emit(event, args).await
    }

    pub fn on_lifecycle(&self, listener: LifecycleListener) -> ListenerId {
        self.lifecycle.subscribe(listener)
    }

    pub fn off_lifecycle(&self, id: ListenerId) -> bool {
        self.lifecycle.unsubscribe(id)
    }

    /// Subscribes to `event` on peer `uid`, or on every connected peer.
    pub async fn on_remote(&self, uid: Option<&str>, event: &str, handler: RemoteHandler) -> Result<ListenerId> {
        let peers = match uid {
            Some(uid) => vec![self.peer(uid)?],
            None => self.peers(),
        };
        let id = self.next_handler_id();
        for peer in peers {
            self.subscribe_remote(&peer, event, id, handler.clone()).await?;
        }
        Ok(id)
    }

    pub async fn off_remote(&self, uid: Option<&str>, event: &str, id: ListenerId) -> Result<()> {
        let peers = match uid {
            Some(uid) => vec![self.peer(uid)?],
            None => self.peers(),
        };
        for peer in peers {
            self.unsubscribe_remote(&peer, event, id).await?;
        }
        Ok(())
    }

    /// The first handler for an event sends EVENT_ON.
    async fn subscribe_remote(&self, peer: &Arc<Peer>, event: &str, id: ListenerId, handler: RemoteHandler) -> Result<()> {
        let first = {
            let mut handlers = peer.remote_handlers.entry(event.to_string()).or_default();
            handlers.push((id, handler));
            handlers.len() == 1
        };
        if !first {
            return Ok(());
        }

        let sent = peer.request(Action::EventOn, Value::from(event), self.config.response_deadline()).await;
        if let Err(e) = sent {
            if let Some(mut handlers) = peer.remote_handlers.get_mut(event) {
                handlers.retain(|(hid, _)| *hid != id);
            }
            peer.remote_handlers.remove_if(event, |_, h| h.is_empty());
            return Err(e);
        }
        Ok(())
    }

    /// Removing the last handler for an event sends EVENT_OFF.
    async fn unsubscribe_remote(&self, peer: &Arc<Peer>, event: &str, id: ListenerId) -> Result<()> {
        let emptied = match peer.remote_handlers.get_mut(event) {
            Some(mut handlers) => {
                let before = handlers.len();
                handlers.retain(|(hid, _)| *hid != id);
                handlers.len() != before && handlers.is_empty()
            }
            None => false,
        };
        if !emptied {
            return Ok(());
        }
        peer.remote_handlers.remove_if(event, |_, h| h.is_empty());
        peer.request(Action::EventOff, Value::from(event), self.config.response_deadline()).await?;
        Ok(())
    }
}
