use std::sync::Arc;
use std::time::Duration;

use netpack::Decoder;
use netpack::Encoder;

use crate::address::Address;
use crate::config::NetronConfig;
use crate::context::Context;
use crate::context::ContextBuilder;
use crate::error::Error;
use crate::error::ErrorKind;
use crate::error::RemoteError;
use crate::netron::Netron;
use crate::peer::Peer;
use crate::peer::PeerId;
use crate::wire::Action;
use crate::wire::Definition;
use crate::wire::Definitions;
use crate::wire::MemberMeta;
use crate::wire::Packet;
use crate::wire::Reference;
use crate::wire::Status;
use crate::wire::TwinSource;
use crate::wire::Value;
use crate::wire::WireError;
use crate::wire::value::decode_from_bytes;
use crate::wire::value::encode_to_bytes;

// ============================================================================
//  HELPERS
// ============================================================================

fn calc() -> Arc<dyn Context> {
    ContextBuilder::new("Calc")
        .method("add", |args: Vec<Value>| async move {
            let sum = args.iter().filter_map(Value::as_int).sum::<i64>();
            Ok::<_, Error>(Value::Int(sum))
        })
        .readonly("version", "1.0")
        .build()
}

fn calc_definition() -> Definition {
    Definition {
        id: 7,
        parent_id: 0,
        name: "Calc".into(),
        description: Some("adds numbers".into()),
        members: vec![
            ("add".into(), MemberMeta::method()),
            ("version".into(), MemberMeta::readonly()),
            ("total".into(), MemberMeta::property()),
        ],
        twin: Some(TwinSource::Node("class Twin {}".into())),
        uid: Some("never-sent".into()),
    }
}

// ============================================================================
//  WIRE VALUES
// ============================================================================

#[test]
fn test_definition_roundtrip_drops_uid() -> anyhow::Result<()> {
    let def = calc_definition();
    let bytes = encode_to_bytes(&Value::Definition(def.clone()))?;

    let Value::Definition(back) = decode_from_bytes(&bytes)? else {
        panic!("expected a definition");
    };
    assert_eq!(back.uid, None);
    assert_eq!(back, Definition { uid: None, ..def });
    assert_eq!(back.members[0].0, "add");
    assert_eq!(back.members[2].0, "total");
    Ok(())
}

#[test]
fn test_definitions_keep_insertion_order() -> anyhow::Result<()> {
    let mut defs = Definitions::new();
    for id in [9, 3, 5] {
        defs.push(Definition { id, twin: None, ..calc_definition() });
    }
    let bytes = encode_to_bytes(&Value::Definitions(defs))?;

    let Value::Definitions(back) = decode_from_bytes(&bytes)? else {
        panic!("expected definitions");
    };
    let ids: Vec<u32> = back.iter().map(|d| d.id).collect();
    assert_eq!(ids, vec![9, 3, 5]);
    Ok(())
}

#[test]
fn test_reference_and_error_extensions() -> anyhow::Result<()> {
    let value = Value::List(vec![
        Value::Reference(Reference::new(42)),
        Value::Error(RemoteError::new(ErrorKind::NotExists, "gone")),
        Value::map([("nested", Value::Bytes(vec![1, 2]))]),
    ]);
    let back = decode_from_bytes(&encode_to_bytes(&value)?)?;
    assert_eq!(back, value);
    Ok(())
}

#[test]
fn test_local_values_cannot_be_encoded() {
    let err = encode_to_bytes(&Value::Context(calc())).unwrap_err();
    assert_eq!(err, WireError::UnsupportedValue("context"));
}

#[test]
fn test_depth_limit_both_ways() -> anyhow::Result<()> {
    let mut deep = Value::Null;
    for _ in 0..=crate::wire::MAX_DEPTH + 1 {
        deep = Value::List(vec![deep]);
    }
    assert_eq!(encode_to_bytes(&deep).unwrap_err(), WireError::DepthLimit);

    // Build the same nesting by hand and make sure the decoder refuses it too.
    let mut enc = Encoder::new();
    for _ in 0..=crate::wire::MAX_DEPTH + 1 {
        enc.list_begin()?;
    }
    enc.null()?;
    for _ in 0..=crate::wire::MAX_DEPTH + 1 {
        enc.list_end()?;
    }
    let bytes = enc.into_bytes()?;
    let mut dec = Decoder::new(&bytes);
    assert_eq!(crate::wire::value::decode_value(&mut dec).unwrap_err(), WireError::DepthLimit);
    Ok(())
}

#[test]
fn test_unknown_extension_is_rejected() -> anyhow::Result<()> {
    let mut enc = Encoder::new();
    enc.ext_begin(99)?;
    enc.null()?;
    enc.ext_end()?;
    let bytes = enc.into_bytes()?;
    assert_eq!(decode_from_bytes(&bytes).unwrap_err(), WireError::UnknownExtension(99));
    Ok(())
}

// ============================================================================
//  PACKETS
// ============================================================================

#[test]
fn test_packet_roundtrip() -> anyhow::Result<()> {
    let packet = Packet::new(
        12,
        true,
        Status::Online,
        Action::Get,
        Value::List(vec![Value::Int(7), Value::from("add"), Value::List(vec![Value::Int(2), Value::Int(3)])]),
    );
    let back = Packet::decode(&packet.encode()?)?;
    assert_eq!(back, packet);
    assert_eq!(back.packet_id, 1);
    Ok(())
}

#[test]
fn test_packet_without_magic_is_malformed() -> anyhow::Result<()> {
    let mut enc = Encoder::new();
    enc.list_begin()?;
    enc.u32(1)?;
    enc.u32(1)?;
    enc.u32(0x4000_0301)?;
    enc.null()?;
    enc.list_end()?;
    let bytes = enc.into_bytes()?;
    assert_eq!(Packet::decode(&bytes).unwrap_err(), WireError::MalformedFlags(0x4000_0301));
    Ok(())
}

#[test]
fn test_packet_with_wrong_arity() -> anyhow::Result<()> {
    let mut enc = Encoder::new();
    enc.list_begin()?;
    enc.u32(1)?;
    enc.u32(1)?;
    enc.list_end()?;
    let bytes = enc.into_bytes()?;
    assert!(matches!(Packet::decode(&bytes), Err(WireError::ProtocolViolation(_))));
    Ok(())
}

// ============================================================================
//  CONTEXTS, STUBS AND THE RELEASE CASCADE
// ============================================================================

#[tokio::test]
async fn test_attach_rejects_invalid_and_duplicate_contexts() {
    let netron = Netron::new(NetronConfig::default());

    let empty = ContextBuilder::new("Empty").build();
    assert!(matches!(netron.attach_context(empty, None), Err(Error::NotValid(_))));

    let anonymous = ContextBuilder::new("").readonly("x", 1).build();
    assert!(matches!(netron.attach_context(anonymous, None), Err(Error::NotValid(_))));

    netron.attach_context(calc(), None).expect("first attach");
    assert!(matches!(netron.attach_context(calc(), None), Err(Error::Exists(_))));
    assert!(netron.has_context("Calc"));
    assert_eq!(netron.context_names(), vec!["Calc".to_string()]);
}

#[tokio::test]
async fn test_same_instance_cannot_be_attached_twice() {
    let netron = Netron::new(NetronConfig::default());
    let instance = calc();
    netron.attach_context(instance.clone(), Some("a")).expect("attach");
    assert!(matches!(
        netron.attach_context(instance, Some("b")),
        Err(Error::IllegalState(_))
    ));
}

#[tokio::test]
async fn test_detach_unknown_context() {
    let netron = Netron::new(NetronConfig::default());
    assert!(matches!(netron.detach_context("missing"), Err(Error::Unknown(_))));
}

#[tokio::test]
async fn test_release_cascade_removes_descendants() {
    let netron = Netron::new(NetronConfig::default());
    let root_id = netron.attach_context(calc(), None).expect("attach");

    let child = ContextBuilder::new("Child").readonly("n", 1).build();
    let grandchild = ContextBuilder::new("Grandchild").readonly("n", 2).build();
    let child_def = netron.ref_context_with_parent("peer-a", child, root_id).expect("child");
    let grandchild_def = netron
        .ref_context_with_parent("peer-a", grandchild, child_def.id)
        .expect("grandchild");
    assert_eq!(child_def.parent_id, root_id);

    netron.detach_context("Calc").expect("detach");
    assert!(netron.stub_by_id(root_id).is_none());
    assert!(netron.stub_by_id(child_def.id).is_none());
    assert!(netron.stub_by_id(grandchild_def.id).is_none());
}

#[tokio::test]
async fn test_ref_context_reuses_stub_per_peer() {
    let netron = Netron::new(NetronConfig::default());
    let instance = calc();

    let first = netron.ref_context("peer-a", instance.clone()).expect("ref");
    let again = netron.ref_context("peer-a", instance.clone()).expect("ref");
    let other = netron.ref_context("peer-b", instance.clone()).expect("ref");

    assert_eq!(first.id, again.id);
    assert_ne!(first.id, other.id);
    assert_eq!(first.uid.as_deref(), Some("peer-a"));

    netron.release_context(&instance).expect("release");
    assert!(netron.stub_by_id(first.id).is_none());
    assert!(netron.stub_by_id(other.id).is_none());
    assert!(matches!(netron.release_context(&instance), Err(Error::NotExists(_))));
}

// ============================================================================
//  LOCAL INTERFACES
// ============================================================================

#[tokio::test]
async fn test_local_interface_calls_stub_directly() -> anyhow::Result<()> {
    let netron = Netron::new(NetronConfig::default());
    netron.attach_context(calc(), None)?;

    let iface = netron.interface_by_name("Calc", None)?;
    assert!(iface.same(&netron.interface_by_name("Calc", None)?));
    assert_eq!(iface.uid(), None);

    assert_eq!(iface.call("add", vec![Value::Int(2), Value::Int(3)]).await?, Value::Int(5));
    assert_eq!(iface.get("version", None).await?, Value::from("1.0"));
    assert!(matches!(iface.set("version", Value::from("2.0")).await, Err(Error::InvalidArgument(_))));
    assert!(matches!(iface.call("nope", vec![]).await, Err(Error::NotExists(_))));
    Ok(())
}

#[tokio::test]
async fn test_property_default_replaces_null() -> anyhow::Result<()> {
    let netron = Netron::new(NetronConfig::default());
    let store = ContextBuilder::new("Store").property("slot", Value::Null).build();
    netron.attach_context(store, None)?;
    let iface = netron.interface_by_name("Store", None)?;

    assert_eq!(iface.get("slot", Some(Value::Int(9))).await?, Value::Int(9));
    iface.set("slot", Value::Int(4)).await?;
    assert_eq!(iface.get("slot", Some(Value::Int(9))).await?, Value::Int(4));
    Ok(())
}

#[tokio::test]
async fn test_release_interface_evicts_cache() -> anyhow::Result<()> {
    let netron = Netron::new(NetronConfig::default());
    netron.attach_context(calc(), None)?;
    let first = netron.interface_by_name("Calc", None)?;

    netron.release_interface(&first)?;
    assert!(matches!(netron.release_interface(&first), Err(Error::NotExists(_))));
    let second = netron.interface_by_name("Calc", None)?;
    assert!(!first.same(&second));
    Ok(())
}

#[tokio::test]
async fn test_unknown_peer_lookups() {
    let netron = Netron::new(NetronConfig::default());
    assert!(matches!(netron.peer("ghost"), Err(Error::Unknown(_))));
    assert!(matches!(netron.interface_by_name("Calc", Some("ghost")), Err(Error::Unknown(_))));
    assert!(matches!(netron.ping(Some("ghost")).await, Err(Error::Unknown(_))));
    assert!(netron.ping(None).await.is_ok());
}

#[tokio::test]
async fn test_unknown_local_definition_id() {
    let netron = Netron::new(NetronConfig::default());
    let err = netron.interface_by_id(99, None).unwrap_err();
    assert!(matches!(&err, Error::Unknown(msg) if msg == "Unknown definition '99'"), "{err}");
}

// ============================================================================
//  PEERS
// ============================================================================

fn dialed_peer(uid: Option<&str>) -> anyhow::Result<Arc<Peer>> {
    let peer = Peer::outbound(PeerId(1), Address::parse("server", "netron:", 8888)?);
    if let Some(uid) = uid {
        peer.set_identity(uid.to_string(), false)?;
    }
    Ok(Arc::new(peer))
}

#[tokio::test]
async fn test_send_requires_handshaking_or_online() -> anyhow::Result<()> {
    let peer = dialed_peer(None)?;
    assert_eq!(peer.status(), Status::Offline);
    assert!(matches!(peer.send(true, 1, Action::Ping, Value::Null).await, Err(Error::IllegalState(_))));

    peer.set_status(Status::Connecting);
    let sent = peer.request(Action::Ping, Value::Null, Duration::from_secs(1)).await;
    assert!(matches!(sent, Err(Error::IllegalState(_))));
    assert_eq!(peer.pending_requests(), 0);

    // Handshaking is allowed by status, but nothing is connected yet.
    peer.set_status(Status::Handshaking);
    let err = peer.send(true, 2, Action::Ping, Value::Null).await.unwrap_err();
    assert!(matches!(&err, Error::IllegalState(msg) if msg.contains("no transport")), "{err}");
    Ok(())
}

#[test]
fn test_detached_context_forgets_definition() -> anyhow::Result<()> {
    let peer = dialed_peer(Some("remote"))?;
    peer.add_context_def("Calc".into(), calc_definition());
    assert!(peer.context_definition("Calc").is_some());

    assert_eq!(peer.remove_context_def("Calc"), Some(7));
    assert!(peer.context_definition("Calc").is_none());
    assert!(!peer.defs.contains_key(&7));
    assert_eq!(peer.remove_context_def("Calc"), None);
    Ok(())
}

#[tokio::test]
async fn test_definitions_result_becomes_interfaces() -> anyhow::Result<()> {
    let netron = Netron::new(NetronConfig::default());
    let peer = dialed_peer(Some("remote"))?;

    let mut defs = Definitions::new();
    for id in [4, 8] {
        defs.push(Definition { id, twin: None, uid: None, ..calc_definition() });
    }
    let reply = Value::List(vec![Value::Int(0), Value::Definitions(defs)]);

    let Value::List(items) = netron.process_result(&peer, reply)? else {
        panic!("expected a list");
    };
    let ifaces: Vec<_> = items.into_iter().filter_map(Value::into_interface).collect();
    assert_eq!(ifaces.len(), 2);
    assert_eq!(ifaces.iter().map(|i| i.def_id()).collect::<Vec<_>>(), vec![4, 8]);
    assert!(ifaces.iter().all(|i| i.uid() == Some("remote")));
    assert!(peer.defs.contains_key(&4) && peer.defs.contains_key(&8));
    Ok(())
}
