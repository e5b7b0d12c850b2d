//! Customisation points of the core. Every method has a default, so
//! `DefaultHooks` is a complete, conservative implementation.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Error;
use crate::error::Result;
use crate::netron::Netron;
use crate::peer::Peer;
use crate::wire::Definition;
use crate::wire::DefinitionId;
use crate::wire::Packet;
use crate::wire::Value;

#[async_trait]
pub trait Hooks: Send + Sync + 'static {
    /// Extra fields merged into the handshake sent to a new peer.
    fn handshake_payload(&self, _netron: &Netron, _peer: &Arc<Peer>) -> BTreeMap<String, Value> {
        BTreeMap::new()
    }

    /// Vets an inbound handshake. An error disconnects the peer.
    async fn confirm_peer(
        &self,
        _netron: &Netron,
        _peer: &Arc<Peer>,
        _payload: &BTreeMap<String, Value>,
    ) -> Result<()> {
        Ok(())
    }

    /// Packets the core does not handle itself: custom actions, and anything
    /// arriving from a peer that is not online.
    async fn process_packet(&self, _netron: &Netron, peer: &Arc<Peer>, packet: Packet) -> Result<()> {
        Err(Error::NotImplemented(format!(
            "action {:?} with status {} from {}",
            packet.action,
            packet.status,
            peer.id()
        )))
    }

    /// A peer asks this (super) node to host `definition` under `name` on its behalf.
    async fn context_attach(
        &self,
        _netron: &Netron,
        _peer: &Arc<Peer>,
        _name: String,
        _definition: Definition,
    ) -> Result<()> {
        Err(Error::NotImplemented("remote context attach".into()))
    }

    async fn context_detach(
        &self,
        _netron: &Netron,
        _peer: &Arc<Peer>,
        _name: String,
        _def_id: DefinitionId,
    ) -> Result<()> {
        Err(Error::NotImplemented("remote context detach".into()))
    }

    /// STREAM_* packets. Stream state belongs to the transport layer.
    async fn stream(&self, _netron: &Netron, _peer: &Arc<Peer>, packet: Packet) -> Result<()> {
        Err(Error::NotImplemented(format!("stream action {:?}", packet.action)))
    }
}

pub struct DefaultHooks;

impl Hooks for DefaultHooks {}
