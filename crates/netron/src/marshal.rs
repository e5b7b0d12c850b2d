//! Argument and result rewriting between local objects and wire values.
//!
//! Outgoing: an `Interface` becomes a `Reference` to its definition, a local
//! `Context` is exposed to the destination peer as a fresh `Definition`.
//! Incoming: a `Reference` resolves to the local instance, a `Definition` becomes
//! an `Interface` owned by the sending peer.

use std::sync::Arc;

use crate::error::Error;
use crate::error::Result;
use crate::netron::Netron;
use crate::peer::Peer;
use crate::wire::DefinitionId;
use crate::wire::ROOT_PARENT;
use crate::wire::Reference;
use crate::wire::Value;

fn peer_uid(peer: &Peer) -> Result<String> {
    peer.uid()
        .map(str::to_string)
        .ok_or_else(|| Error::IllegalState(format!("{} has not completed its handshake", peer.id())))
}

/// Rewrites a value for sending to `peer`. Contexts become children of `parent`.
pub(crate) fn marshal(netron: &Netron, peer: &Peer, value: Value, parent: DefinitionId) -> Result<Value> {
    match value {
        Value::Interface(iface) => Ok(Value::Reference(Reference::new(iface.def_id()))),
        Value::Context(instance) => {
            let uid = peer_uid(peer)?;
            Ok(Value::Definition(netron.ref_context_with_parent(&uid, instance, parent)?))
        }
        Value::List(items) => items
            .into_iter()
            .map(|item| marshal(netron, peer, item, parent))
            .collect::<Result<Vec<_>>>()
            .map(Value::List),
        Value::Map(entries) => entries
            .into_iter()
            .map(|(k, v)| marshal(netron, peer, v, parent).map(|v| (k, v)))
            .collect::<Result<_>>()
            .map(Value::Map),
        other => Ok(other),
    }
}

pub(crate) fn marshal_args(netron: &Netron, peer: &Peer, args: Vec<Value>) -> Result<Vec<Value>> {
    args.into_iter().map(|arg| marshal(netron, peer, arg, ROOT_PARENT)).collect()
}

/// Rewrites a value received from `peer` into local objects.
pub(crate) fn unmarshal(netron: &Netron, peer: &Arc<Peer>, value: Value) -> Result<Value> {
    match value {
        Value::Reference(reference) => match netron.stub_by_id(reference.def_id) {
            Some(stub) => Ok(Value::Context(stub.instance().clone())),
            None => Err(Error::NotExists(format!(
                "Context with definition id '{}' not exists",
                reference.def_id
            ))),
        },
        Value::Definition(def) => {
            let uid = peer_uid(peer)?;
            peer.ingest_definition(def.clone());
            Ok(Value::Interface(netron.interface_for(def, Some(&uid))?))
        }
        Value::Definitions(defs) => {
            let uid = peer_uid(peer)?;
            let mut ifaces = Vec::with_capacity(defs.len());
            for def in defs {
                peer.ingest_definition(def.clone());
                ifaces.push(Value::Interface(netron.interface_for(def, Some(&uid))?));
            }
            Ok(Value::List(ifaces))
        }
        Value::List(items) => items
            .into_iter()
            .map(|item| unmarshal(netron, peer, item))
            .collect::<Result<Vec<_>>>()
            .map(Value::List),
        Value::Map(entries) => entries
            .into_iter()
            .map(|(k, v)| unmarshal(netron, peer, v).map(|v| (k, v)))
            .collect::<Result<_>>()
            .map(Value::Map),
        other => Ok(other),
    }
}

pub(crate) fn unmarshal_all(netron: &Netron, peer: &Arc<Peer>, args: Vec<Value>) -> Result<Vec<Value>> {
    args.into_iter().map(|arg| unmarshal(netron, peer, arg)).collect()
}
