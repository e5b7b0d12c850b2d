//! # Packet Dispatch
//!
//! Receive-side state machine. Dispatch switches on action, then on the status the
//! sender declared, then on impulse.
//!
//! Replies are resolved inline by the pump so a waiting caller is never stuck
//! behind a slow request. A request is started inline and moves to its own task
//! only once it suspends, so a SET is applied before a GET that follows it. The
//! inbound handshake also runs inline, so the peer is ONLINE before its next
//! packet is routed.
//!
//! Protocol violations are logged and the packet is dropped; one confused peer
//! never tears down the pump.

use std::sync::Arc;

use futures::FutureExt;
use futures::future::join_all;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::error::Error;
use crate::error::Result;
use crate::events::LifecycleEvent;
use crate::events::Listener;
use crate::marshal;
use crate::netron::Netron;
use crate::peer::Peer;
use crate::wire::Action;
use crate::wire::DefinitionId;
use crate::wire::Packet;
use crate::wire::Status;
use crate::wire::Value;
use crate::wire::WireError;

fn violation(what: impl Into<String>) -> Error {
    Error::Wire(WireError::ProtocolViolation(what.into()))
}

fn def_id_of(value: &Value) -> Option<DefinitionId> {
    value.as_int().and_then(|id| DefinitionId::try_from(id).ok())
}

/// Splits a `[defId, name, payload]` request body.
fn split_request(data: Value) -> Result<(DefinitionId, String, Value)> {
    let Some([def_id, name, payload]) = data.into_list().and_then(|l| <[Value; 3]>::try_from(l).ok()) else {
        return Err(violation("request must be [defId, name, payload]"));
    };
    let Some(def_id) = def_id_of(&def_id) else {
        return Err(violation("definition id must be an unsigned 32-bit integer"));
    };
    let Value::Str(name) = name else {
        return Err(violation("member name must be a string"));
    };
    Ok((def_id, name, payload))
}

fn ack(outcome: Result<Value>) -> Value {
    match outcome {
        Ok(value) => Value::List(vec![Value::Int(0), value]),
        Err(e) => Value::List(vec![Value::Int(1), Value::Error(e.to_remote())]),
    }
}

impl Netron {
    pub(crate) async fn route(&self, peer: &Arc<Peer>, packet: Packet) {
        debug!(
            peer = %peer.id(),
            stream_id = packet.stream_id,
            action = ?packet.action,
            status = %packet.status,
            impulse = packet.impulse,
            "recv"
        );

        if packet.action.is_stream() {
            if let Err(e) = self.hooks.stream(self, peer, packet).await {
                warn!(peer = %peer.id(), error = %e, "stream packet not handled");
            }
            return;
        }

        if !packet.impulse {
            match packet.action {
                Action::Get => {
                    warn!(peer = %peer.id(), status = %packet.status, "GET without impulse cannot be answered, dropping");
                    return;
                }
                Action::Custom(_) => {}
                _ => {
                    let stream_id = packet.stream_id;
                    if !peer.resolve(packet) {
                        debug!(peer = %peer.id(), stream_id, "no awaiter for reply, dropping");
                    }
                    return;
                }
            }
        }

        if packet.impulse && packet.action == Action::Get && packet.status == Status::Handshaking {
            self.accept_handshake(peer, packet).await;
            return;
        }

        let Some(netron) = self.me.upgrade() else {
            return;
        };
        let peer = peer.clone();
        let mut handler = Box::pin(async move {
            if let Err(e) = netron.process_request(&peer, packet).await {
                warn!(peer = %peer.id(), error = %e, "request failed");
            }
        });
        // Requests start in arrival order: the handler runs up to its first
        // suspension before the next packet is read. Only the rest is spawned.
        if futures::poll!(&mut handler).is_pending() {
            tokio::spawn(handler);
        }
    }

    async fn process_request(&self, peer: &Arc<Peer>, packet: Packet) -> Result<()> {
        let online = packet.status == Status::Online;
        match (packet.action, online && packet.impulse) {
            (Action::Get, true) => self.handle_get(peer, packet).await,
            (Action::Set, true) => self.handle_set(peer, packet).await,
            (Action::Ping, _) if packet.impulse => peer.reply(packet.stream_id, Action::Ping, Value::Null).await,
            (Action::ContextAttach, true) => self.handle_context_attach(peer, packet).await,
            (Action::ContextDetach, true) => self.handle_context_detach(peer, packet).await,
            (Action::EventOn, true) => self.handle_event_on(peer, packet).await,
            (Action::EventOff, true) => self.handle_event_off(peer, packet).await,
            (Action::EventEmit, true) => self.handle_event_emit(peer, packet).await,
            _ => self.hooks.process_packet(self, peer, packet).await,
        }
    }

    async fn accept_handshake(&self, peer: &Arc<Peer>, packet: Packet) {
        if !peer.is_inbound() {
            warn!(peer = %peer.id(), "handshake request from a peer we dialed, dropping");
            return;
        }
        if peer.uid().is_some() {
            warn!(peer = %peer.id(), "repeated handshake, dropping");
            return;
        }

        let extras = match self.receive_initial(peer, packet.data) {
            Ok(extras) => extras,
            Err(e) => {
                warn!(peer = %peer.id(), error = %e, "bad handshake");
                self.peer_disconnected(peer).await;
                return;
            }
        };
        if let Err(e) = self.hooks.confirm_peer(self, peer, &extras).await {
            warn!(peer = %peer.id(), error = %e, "peer rejected");
            self.peer_disconnected(peer).await;
            return;
        }

        let reply = self.handshake_payload(peer);
        if let Err(e) = peer.reply(packet.stream_id, Action::Set, reply).await {
            warn!(peer = %peer.id(), error = %e, "handshake reply failed");
            self.peer_disconnected(peer).await;
            return;
        }

        peer.set_status(Status::Online);
        info!(peer = %peer.id(), uid = ?peer.uid(), "peer online");
        self.lifecycle.submit(LifecycleEvent::PeerOnline(peer.clone()));
    }

    /// GET: read a property or call a method, reply `[errFlag, result]` with SET.
    async fn handle_get(&self, peer: &Arc<Peer>, packet: Packet) -> Result<()> {
        let stream_id = packet.stream_id;
        let (def_id, member, args) = split_request(packet.data)?;
        let args = match args {
            Value::List(args) => args,
            Value::Null => Vec::new(),
            other => vec![other],
        };

        let outcome = match self.stub_by_id(def_id) {
            Some(stub) => stub.get(self, &member, args, Some(peer)).await,
            None => Err(Error::NotExists(format!("Context with definition id '{def_id}' not exists"))),
        };
        if let Err(Error::IllegalState(msg)) = &outcome {
            warn!(peer = %peer.id(), def_id, member, error = %msg, "illegal state in GET, not replying");
            return Ok(());
        }

        match peer.reply(stream_id, Action::Set, ack(outcome)).await {
            Err(e @ (Error::Wire(_) | Error::Codec(_))) => {
                // The result itself could not be framed; report that instead.
                peer.reply(stream_id, Action::Set, ack(Err(e))).await
            }
            other => other,
        }
    }

    /// SET: fire-and-forget write or void call. Failures stay on this side.
    async fn handle_set(&self, peer: &Arc<Peer>, packet: Packet) -> Result<()> {
        let (def_id, member, value) = split_request(packet.data)?;
        let Some(stub) = self.stub_by_id(def_id) else {
            return Err(Error::NotExists(format!("Context with definition id '{def_id}' not exists")));
        };
        stub.set(self, &member, value, Some(peer)).await
    }

    async fn handle_context_attach(&self, peer: &Arc<Peer>, packet: Packet) -> Result<()> {
        let Some([name, def]) = packet.data.into_list().and_then(|l| <[Value; 2]>::try_from(l).ok()) else {
            return Err(violation("context attach must be [name, definition]"));
        };
        let (Value::Str(name), Value::Definition(def)) = (name, def) else {
            return Err(violation("context attach must be [name, definition]"));
        };

        let def_id = def.id;
        let outcome = self.hooks.context_attach(self, peer, name, def).await;
        if outcome.is_ok() {
            peer.own_def_ids.insert(def_id);
        }
        peer.reply(packet.stream_id, Action::ContextAttach, ack(outcome.map(|_| Value::Null))).await
    }

    async fn handle_context_detach(&self, peer: &Arc<Peer>, packet: Packet) -> Result<()> {
        let Some([name, def_id]) = packet.data.into_list().and_then(|l| <[Value; 2]>::try_from(l).ok()) else {
            return Err(violation("context detach must be [name, defId]"));
        };
        let (Value::Str(name), Some(def_id)) = (name, def_id_of(&def_id)) else {
            return Err(violation("context detach must be [name, defId]"));
        };

        let outcome = self.hooks.context_detach(self, peer, name, def_id).await;
        if outcome.is_ok() {
            peer.own_def_ids.remove(&def_id);
        }
        peer.reply(packet.stream_id, Action::ContextDetach, ack(outcome.map(|_| Value::Null))).await
    }

    /// EVENT_ON: install one forwarding listener per (peer, event).
    async fn handle_event_on(&self, peer: &Arc<Peer>, packet: Packet) -> Result<()> {
        let Value::Str(event) = packet.data else {
            return Err(violation("event name must be a string"));
        };
        if !peer.event_forwarders.contains_key(&event) {
            let id = self.emitter.on(event.clone(), self.forwarder(peer, &event));
            if let Some(stale) = peer.event_forwarders.insert(event.clone(), id) {
                self.emitter.off(&event, stale);
            }
            debug!(peer = %peer.id(), event, "remote subscribed");
        }
        peer.reply(packet.stream_id, Action::EventOn, Value::Null).await
    }

    async fn handle_event_off(&self, peer: &Arc<Peer>, packet: Packet) -> Result<()> {
        let Value::Str(event) = packet.data else {
            return Err(violation("event name must be a string"));
        };
        if let Some((_, id)) = peer.event_forwarders.remove(&event) {
            self.emitter.off(&event, id);
            debug!(peer = %peer.id(), event, "remote unsubscribed");
        }
        peer.reply(packet.stream_id, Action::EventOff, Value::Null).await
    }

    /// EVENT_EMIT: run our handlers for the peer's event, then acknowledge.
    async fn handle_event_emit(&self, peer: &Arc<Peer>, packet: Packet) -> Result<()> {
        let mut args = packet.data.into_list().unwrap_or_default();
        if args.is_empty() {
            return Err(violation("event emit must be [event, ...args]"));
        }
        let Value::Str(event) = args.remove(0) else {
            return Err(violation("event name must be a string"));
        };

        let handlers: Vec<_> = peer
            .remote_handlers
            .get(&event)
            .map(|list| list.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default();
        join_all(handlers.iter().map(|h| h(peer.clone(), args.clone()))).await;

        peer.reply(packet.stream_id, Action::EventEmit, Value::Null).await
    }

    /// A listener that relays a local event to `peer` as EVENT_EMIT.
    fn forwarder(&self, peer: &Arc<Peer>, event: &str) -> Listener {
        let netron = self.me.clone();
        let target = Arc::downgrade(peer);
        let event = event.to_string();

        Arc::new(move |args: Vec<Value>| {
            let netron = netron.clone();
            let target = target.clone();
            let event = event.clone();
            async move {
                let (Some(netron), Some(peer)) = (netron.upgrade(), target.upgrade()) else {
                    return;
                };
                if netron.config.is_super && originated_by(&peer, args.first()) {
                    debug!(peer = %peer.id(), event, "not echoing event to its originator");
                    return;
                }
                let args = match marshal::marshal_args(&netron, &peer, args) {
                    Ok(args) => args,
                    Err(e) => {
                        warn!(peer = %peer.id(), event, error = %e, "cannot forward event");
                        return;
                    }
                };
                let mut data = Vec::with_capacity(args.len() + 1);
                data.push(Value::Str(event.clone()));
                data.extend(args);
                let deadline = netron.config.response_deadline();
                if let Err(e) = peer.request(Action::EventEmit, Value::List(data), deadline).await {
                    warn!(peer = %peer.id(), event, error = %e, "event forward failed");
                }
            }
            .boxed()
        })
    }
}

/// Whether the first event argument names a definition `peer` attached on us.
fn originated_by(peer: &Peer, first: Option<&Value>) -> bool {
    let def_id = match first {
        Some(Value::Map(fields)) => fields.get("defId").and_then(def_id_of),
        Some(Value::Reference(reference)) => Some(reference.def_id),
        Some(Value::Definition(def)) => Some(def.id),
        _ => None,
    };
    def_id.is_some_and(|id| peer.own_def_ids.contains(&id))
}
