//! # Events
//!
//! Two mechanisms live here:
//! - `EventEmitter`, the engine's named async event bus. Emitting awaits every
//!   listener. Remote subscribers are plain listeners on this bus.
//! - `LifecycleQueue`, which delivers lifecycle events strictly in submission
//!   order per key. Each key gets a single-consumer task that drains its queue and
//!   exits when idle.

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::BoxFuture;
use futures::future::join_all;
use tokio::sync::mpsc;
use tracing::debug;

use crate::peer::Peer;
use crate::peer::PeerId;
use crate::wire::Definition;
use crate::wire::DefinitionId;
use crate::wire::Value;

pub type ListenerId = u64;

pub type Listener = Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, ()> + Send + Sync>;

pub type LifecycleListener = Arc<dyn Fn(LifecycleEvent) -> BoxFuture<'static, ()> + Send + Sync>;

/// Named event emitted when a context is attached, with `{id, defId, def}`.
pub const CONTEXT_ATTACH_EVENT: &str = "context attach";
/// Named event emitted when a context is detached, with `{id, defId}`.
pub const CONTEXT_DETACH_EVENT: &str = "context detach";

#[derive(Default)]
pub struct EventEmitter {
    next_id: AtomicU64,
    listeners: DashMap<String, Vec<(ListenerId, Listener)>>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, event: impl Into<String>, listener: Listener) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.listeners.entry(event.into()).or_default().push((id, listener));
        id
    }

    /// Removes one listener. Returns false if it was not registered.
    pub fn off(&self, event: &str, id: ListenerId) -> bool {
        let Some(mut list) = self.listeners.get_mut(event) else {
            return false;
        };
        let before = list.len();
        list.retain(|(lid, _)| *lid != id);
        let removed = list.len() != before;
        let empty = list.is_empty();
        drop(list);
        if empty {
            self.listeners.remove_if(event, |_, l| l.is_empty());
        }
        removed
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.listeners.get(event).map_or(0, |l| l.len())
    }

    /// Calls every listener for `event` and waits for all of them.
    /// Returns how many listeners ran.
    pub async fn emit(&self, event: &str, args: Vec<Value>) -> usize {
        let listeners: Vec<Listener> = match self.listeners.get(event) {
            Some(list) => list.iter().map(|(_, l)| l.clone()).collect(),
            None => return 0,
        };
        let count = listeners.len();
        join_all(listeners.iter().map(|l| l(args.clone()))).await;
        count
    }
}

#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    PeerCreate(Arc<Peer>),
    PeerConnect(Arc<Peer>),
    PeerOnline(Arc<Peer>),
    PeerOffline(Arc<Peer>),
    ContextAttach { name: String, definition: Definition },
    ContextDetach { name: String, def_id: DefinitionId },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum EventKey {
    Peer(PeerId),
    Context(String),
}

impl LifecycleEvent {
    pub(crate) fn key(&self) -> EventKey {
        match self {
            Self::PeerCreate(peer)
            | Self::PeerConnect(peer)
            | Self::PeerOnline(peer)
            | Self::PeerOffline(peer) => EventKey::Peer(peer.id()),
            Self::ContextAttach { name, .. } | Self::ContextDetach { name, .. } => {
                EventKey::Context(name.clone())
            }
        }
    }

    /// The named event mirrored onto the emitter, if any.
    fn as_named(&self) -> Option<(&'static str, Value)> {
        match self {
            Self::ContextAttach { name, definition } => Some((
                CONTEXT_ATTACH_EVENT,
                Value::map([
                    ("id", Value::Str(name.clone())),
                    ("defId", Value::from(definition.id)),
                    ("def", Value::Definition(definition.clone())),
                ]),
            )),
            Self::ContextDetach { name, def_id } => Some((
                CONTEXT_DETACH_EVENT,
                Value::map([("id", Value::Str(name.clone())), ("defId", Value::from(*def_id))]),
            )),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub(crate) struct LifecycleQueue {
    queues: Arc<DashMap<EventKey, mpsc::UnboundedSender<LifecycleEvent>>>,
    listeners: Arc<DashMap<ListenerId, LifecycleListener>>,
    next_id: Arc<AtomicU64>,
    emitter: Arc<EventEmitter>,
}

impl LifecycleQueue {
    pub(crate) fn new(emitter: Arc<EventEmitter>) -> Self {
        Self {
            queues: Arc::new(DashMap::new()),
            listeners: Arc::new(DashMap::new()),
            next_id: Arc::new(AtomicU64::new(1)),
            emitter,
        }
    }

    pub(crate) fn subscribe(&self, listener: LifecycleListener) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.insert(id, listener);
        id
    }

    pub(crate) fn unsubscribe(&self, id: ListenerId) -> bool {
        self.listeners.remove(&id).is_some()
    }

    /// Queues an event behind every earlier event with the same key.
    /// Must be called from within a tokio runtime.
    pub(crate) fn submit(&self, event: LifecycleEvent) {
        let key = event.key();
        match self.queues.entry(key.clone()) {
            Entry::Occupied(queue) => {
                let _ = queue.get().send(event);
            }
            Entry::Vacant(slot) => {
                let (tx, rx) = mpsc::unbounded_channel();
                let _ = tx.send(event);
                slot.insert(tx);
                tokio::spawn(self.clone().drain(key, rx));
            }
        }
    }

    async fn drain(self, key: EventKey, mut rx: mpsc::UnboundedReceiver<LifecycleEvent>) {
        loop {
            while let Ok(event) = rx.try_recv() {
                self.deliver(event).await;
            }
            // Senders only push while holding the shard lock, so an empty queue
            // observed under the same lock cannot miss an event.
            let mut idle = false;
            self.queues.remove_if(&key, |_, _| {
                idle = rx.is_empty();
                idle
            });
            if idle {
                debug!(?key, "lifecycle queue idle");
                return;
            }
        }
    }

    async fn deliver(&self, event: LifecycleEvent) {
        let listeners: Vec<LifecycleListener> = self.listeners.iter().map(|e| e.value().clone()).collect();
        join_all(listeners.iter().map(|l| l(event.clone()))).await;
        if let Some((name, payload)) = event.as_named() {
            self.emitter.emit(name, vec![payload]).await;
        }
    }
}
