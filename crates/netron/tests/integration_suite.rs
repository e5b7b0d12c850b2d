//! Integration tests for netron peers talking over the in-memory network.

use std::sync::Arc;
use std::time::Duration;

use netron::Context;
use netron::ContextBuilder;
use netron::Error;
use netron::Netron;
use netron::NetronConfig;
use netron::Peer;
use netron::Value;
use netron::channel::MemoryNetwork;
use netron::wire::Status;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Makes `server` reachable as "server".
fn serve(server: &Arc<Netron>) -> Arc<MemoryNetwork> {
    let network = MemoryNetwork::new();
    network.listen("server", server).expect("listen");
    network
}

async fn dial(network: &Arc<MemoryNetwork>, config: NetronConfig) -> (Arc<Netron>, Arc<Peer>) {
    let client = Netron::new(config);
    client.set_connector(network.clone()).expect("connector");
    let peer = client.connect("server").await.expect("connect");
    (client, peer)
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

fn calc() -> Arc<dyn Context> {
    ContextBuilder::new("Calc")
        .description("adds numbers")
        .method("add", |args: Vec<Value>| async move {
            let sum = args.iter().filter_map(Value::as_int).sum::<i64>();
            Ok::<_, Error>(Value::Int(sum))
        })
        .readonly("version", "1.0")
        .build()
}

/// A context handing out one child context, and checking whether an argument is that child.
fn factory() -> Arc<dyn Context> {
    let child = ContextBuilder::new("Counter")
        .method("inc", |args: Vec<Value>| async move {
            let n = args.first().and_then(Value::as_int).unwrap_or(0);
            Ok::<_, Error>(Value::Int(n + 1))
        })
        .build();
    let handed = child.clone();

    ContextBuilder::new("Factory")
        .method("child", move |_args: Vec<Value>| {
            let child = handed.clone();
            async move { Ok::<_, Error>(Value::Context(child)) }
        })
        .method("is_child", move |args: Vec<Value>| {
            let child = child.clone();
            async move {
                let same = matches!(
                    args.first(),
                    Some(Value::Context(other)) if std::ptr::addr_eq(Arc::as_ptr(other), Arc::as_ptr(&child))
                );
                Ok::<_, Error>(Value::Bool(same))
            }
        })
        .build()
}

// --- Test 1: Handshake ---

#[tokio::test]
async fn test_handshake_exchanges_identity_and_contexts() {
    init_tracing();
    let server = Netron::new(NetronConfig::default());
    server.attach_context(calc(), None).expect("attach");
    let network = serve(&server);

    let (client, peer) = dial(&network, NetronConfig::default()).await;

    assert_eq!(peer.uid(), Some(server.uid()));
    assert_eq!(peer.status(), Status::Online);
    assert!(!peer.is_super());
    assert_eq!(peer.context_names(), vec!["Calc".to_string()]);
    assert!(client.peer(server.uid()).is_ok());
    assert!(eventually(|| server.peer(client.uid()).is_ok()).await);
}

// --- Test 2: Remote Calls ---

#[tokio::test]
async fn test_remote_call_then_detach() {
    init_tracing();
    let server = Netron::new(NetronConfig::default());
    server.attach_context(calc(), None).expect("attach");
    let network = serve(&server);
    let (client, peer) = dial(&network, NetronConfig::default()).await;
    let uid = server.uid().to_string();

    let calc = client.interface_by_name("Calc", Some(&uid)).expect("interface");
    assert_eq!(calc.definition().description.as_deref(), Some("adds numbers"));
    let sum = calc.call("add", vec![Value::from(2), Value::from(3)]).await.expect("add");
    assert_eq!(sum, Value::Int(5));
    assert_eq!(calc.get("version", None).await.expect("version"), Value::from("1.0"));

    server.detach_context("Calc").expect("detach");
    let err = calc.call("add", vec![Value::from(2), Value::from(3)]).await.unwrap_err();
    assert!(matches!(&err, Error::NotExists(msg) if msg.contains("not exists")), "{err}");

    assert!(eventually(|| peer.context_names().is_empty()).await);
    assert!(matches!(client.interface_by_name("Calc", Some(&uid)), Err(Error::Unknown(_))));
}

#[tokio::test]
async fn test_context_attached_after_connect_is_announced() {
    init_tracing();
    let server = Netron::new(NetronConfig::default());
    let network = serve(&server);
    let (client, peer) = dial(&network, NetronConfig::default()).await;

    server.attach_context(calc(), None).expect("attach");
    assert!(eventually(|| peer.context_names().contains(&"Calc".to_string())).await);

    let calc = client.interface_by_name("Calc", Some(server.uid())).expect("interface");
    let sum = calc.call("add", vec![Value::from(40), Value::from(2)]).await.expect("add");
    assert_eq!(sum, Value::Int(42));
}

#[tokio::test]
async fn test_unknown_definition_id() {
    init_tracing();
    let server = Netron::new(NetronConfig::default());
    let network = serve(&server);
    let (client, _peer) = dial(&network, NetronConfig::default()).await;

    let err = client.call(Some(server.uid()), 9999, "add", vec![]).await.unwrap_err();
    assert!(
        matches!(&err, Error::NotExists(msg) if msg == "Context with definition id '9999' not exists"),
        "{err}"
    );
}

#[tokio::test]
async fn test_remote_properties() {
    init_tracing();
    let server = Netron::new(NetronConfig::default());
    let store = ContextBuilder::new("Store")
        .property("slot", Value::Null)
        .readonly("version", 2)
        .build();
    server.attach_context(store, None).expect("attach");
    let network = serve(&server);
    let (client, _peer) = dial(&network, NetronConfig::default()).await;

    let store = client.interface_by_name("Store", Some(server.uid())).expect("interface");
    assert_eq!(store.get("slot", Some(Value::from(7))).await.expect("default"), Value::Int(7));

    store.set("slot", Value::from("filled")).await.expect("set");
    assert_eq!(store.get("slot", None).await.expect("get"), Value::from("filled"));

    assert!(matches!(store.set("version", Value::from(3)).await, Err(Error::InvalidArgument(_))));
    assert_eq!(store.get("version", None).await.expect("version"), Value::Int(2));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_requests_start_in_arrival_order() {
    init_tracing();
    let server = Netron::new(NetronConfig::default());
    let store = ContextBuilder::new("Store").property("slot", Value::Null).build();
    server.attach_context(store, None).expect("attach");
    let network = serve(&server);
    let (client, _peer) = dial(&network, NetronConfig::default()).await;

    let store = client.interface_by_name("Store", Some(server.uid())).expect("interface");
    for i in 0..300 {
        store.set("slot", Value::Int(i)).await.expect("set");
        assert_eq!(store.get("slot", None).await.expect("get"), Value::Int(i), "read after write #{i}");
    }
}

#[tokio::test]
async fn test_void_call_does_not_wait() {
    init_tracing();
    let server = Netron::new(NetronConfig::default());
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let sink = ContextBuilder::new("Sink")
        .method("push", move |args: Vec<Value>| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(args);
                Ok::<_, Error>(Value::Null)
            }
        })
        .build();
    server.attach_context(sink, None).expect("attach");
    let network = serve(&server);
    let (client, _peer) = dial(&network, NetronConfig::default()).await;

    let sink = client.interface_by_name("Sink", Some(server.uid())).expect("interface");
    sink.call_void("push", vec![Value::from(1), Value::from("x")]).await.expect("call_void");

    let args = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("delivered")
        .expect("open");
    assert_eq!(args, vec![Value::Int(1), Value::from("x")]);
}

// --- Test 3: Marshalling ---

#[tokio::test]
async fn test_returned_context_becomes_interface_and_comes_back_as_reference() {
    init_tracing();
    let server = Netron::new(NetronConfig::default());
    let factory_id = server.attach_context(factory(), None).expect("attach");
    let network = serve(&server);
    let (client, _peer) = dial(&network, NetronConfig::default()).await;

    let factory = client.interface_by_name("Factory", Some(server.uid())).expect("interface");
    let first = factory.call("child", vec![]).await.expect("child").into_interface().expect("interface");
    let second = factory.call("child", vec![]).await.expect("child").into_interface().expect("interface");

    // The same instance handed twice to the same peer keeps one definition.
    assert_eq!(first.def_id(), second.def_id());
    assert!(first.same(&second));
    assert_eq!(first.name(), "Counter");
    assert_eq!(first.uid(), Some(server.uid()));

    let stub = server.stub_by_id(first.def_id()).expect("stub");
    assert_eq!(stub.definition().parent_id, factory_id);
    assert_eq!(stub.uid(), Some(client.uid()));

    assert_eq!(first.call("inc", vec![Value::from(41)]).await.expect("inc"), Value::Int(42));

    let is_child = factory
        .call("is_child", vec![Value::Interface(first.clone())])
        .await
        .expect("is_child");
    assert_eq!(is_child, Value::Bool(true));
    assert_eq!(factory.call("is_child", vec![Value::from(1)]).await.expect("is_child"), Value::Bool(false));
}

// --- Test 4: Release Cascade ---

#[tokio::test]
async fn test_detach_releases_handed_out_children() {
    init_tracing();
    let server = Netron::new(NetronConfig::default());
    server.attach_context(factory(), None).expect("attach");
    let network = serve(&server);
    let (client, _peer) = dial(&network, NetronConfig::default()).await;

    let factory = client.interface_by_name("Factory", Some(server.uid())).expect("interface");
    let child = factory.call("child", vec![]).await.expect("child").into_interface().expect("interface");
    assert!(server.stub_by_id(child.def_id()).is_some());

    server.detach_context("Factory").expect("detach");
    assert!(server.stub_by_id(child.def_id()).is_none());

    let err = child.call("inc", vec![Value::from(1)]).await.unwrap_err();
    assert!(matches!(err, Error::NotExists(_)));
}

#[tokio::test]
async fn test_disconnect_releases_peer_state_on_both_sides() {
    init_tracing();
    let server = Netron::new(NetronConfig::default());
    let factory_id = server.attach_context(factory(), None).expect("attach");
    let network = serve(&server);
    let (client, peer) = dial(&network, NetronConfig::default()).await;
    let uid = server.uid().to_string();

    let factory = client.interface_by_name("Factory", Some(&uid)).expect("interface");
    let child = factory.call("child", vec![]).await.expect("child").into_interface().expect("interface");
    let child_id = child.def_id();

    client.disconnect(&uid).await.expect("disconnect");
    assert_eq!(peer.status(), Status::Offline);
    assert!(matches!(client.peer(&uid), Err(Error::Unknown(_))));
    assert!(matches!(client.interface_by_id(child_id, Some(&uid)), Err(Error::Unknown(_))));

    assert!(eventually(|| server.stub_by_id(child_id).is_none()).await);
    assert!(eventually(|| server.peers().is_empty()).await);
    assert!(server.stub_by_id(factory_id).is_some());

    assert!(matches!(child.call("inc", vec![]).await, Err(Error::Unknown(_))));
}

// --- Test 5: Connection Management ---

#[tokio::test]
async fn test_concurrent_connects_share_one_peer() {
    init_tracing();
    let server = Netron::new(NetronConfig::default());
    let network = serve(&server);
    let client = Netron::new(NetronConfig::default());
    client.set_connector(network.clone()).expect("connector");

    let (a, b) = tokio::join!(client.connect("server"), client.connect("server:8888"));
    let (a, b) = (a.expect("first"), b.expect("second"));
    assert!(Arc::ptr_eq(&a, &b));

    let again = client.connect("netron://server").await.expect("third");
    assert!(Arc::ptr_eq(&a, &again));
    assert_eq!(client.peers().len(), 1);
    assert!(eventually(|| server.peers().len() == 1).await);
}

#[tokio::test]
async fn test_connect_refused() {
    init_tracing();
    let network = MemoryNetwork::new();
    let client = Netron::new(NetronConfig { reconnects: 1, retry_timeout: 5, ..NetronConfig::default() });
    client.set_connector(network.clone()).expect("connector");

    let err = client.connect("nowhere").await.unwrap_err();
    assert!(matches!(err, Error::Connect(_)), "{err}");
    assert!(client.peers().is_empty());

    // A failed attempt leaves nothing behind, so a later listener is reachable.
    let server = Netron::new(NetronConfig::default());
    network.listen("nowhere", &server).expect("listen");
    let peer = client.connect("nowhere").await.expect("connect");
    assert_eq!(peer.uid(), Some(server.uid()));
}

#[tokio::test]
async fn test_connect_without_connector() {
    let client = Netron::new(NetronConfig::default());
    assert!(matches!(client.connect("server").await, Err(Error::Connect(_))));
}

#[tokio::test]
async fn test_invalid_address() {
    let client = Netron::new(NetronConfig::default());
    assert!(matches!(client.connect("server:notaport").await, Err(Error::InvalidArgument(_))));
}

#[tokio::test]
async fn test_ping() {
    init_tracing();
    let server = Netron::new(NetronConfig::default());
    let network = serve(&server);
    let (client, peer) = dial(&network, NetronConfig::default()).await;

    client.ping(Some(server.uid())).await.expect("ping");
    assert_eq!(peer.pending_requests(), 0);
}

#[tokio::test]
async fn test_response_timeout() {
    init_tracing();
    let server = Netron::new(NetronConfig::default());
    let slow = ContextBuilder::new("Slow")
        .method("wait", |_args: Vec<Value>| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, Error>(Value::Null)
        })
        .build();
    server.attach_context(slow, None).expect("attach");
    let network = serve(&server);
    let (client, peer) = dial(&network, NetronConfig { response_timeout: 50, ..NetronConfig::default() }).await;

    let slow = client.interface_by_name("Slow", Some(server.uid())).expect("interface");
    let err = slow.call("wait", vec![]).await.unwrap_err();
    assert!(matches!(err, Error::Timeout(d) if d == Duration::from_millis(50)), "{err}");
    assert_eq!(peer.pending_requests(), 0);
}

#[tokio::test]
async fn test_application_errors_cross_the_wire() {
    init_tracing();
    let server = Netron::new(NetronConfig::default());
    let picky = ContextBuilder::new("Picky")
        .method("check", |args: Vec<Value>| async move {
            match args.first() {
                Some(Value::Str(_)) => Ok(Value::Bool(true)),
                _ => Err(Error::InvalidArgument("expected a string".into())),
            }
        })
        .build();
    server.attach_context(picky, None).expect("attach");
    let network = serve(&server);
    let (client, _peer) = dial(&network, NetronConfig::default()).await;

    let picky = client.interface_by_name("Picky", Some(server.uid())).expect("interface");
    assert_eq!(picky.call("check", vec![Value::from("ok")]).await.expect("check"), Value::Bool(true));
    let err = picky.call("check", vec![Value::from(1)]).await.unwrap_err();
    assert!(matches!(&err, Error::InvalidArgument(msg) if msg == "expected a string"), "{err}");
}

#[tokio::test]
async fn test_illegal_state_in_handler_gets_no_reply() {
    init_tracing();
    let server = Netron::new(NetronConfig::default());
    let gate = ContextBuilder::new("Gate")
        .method("jammed", |_args: Vec<Value>| async move {
            Err::<Value, _>(Error::IllegalState("out of sync".into()))
        })
        .method("shut", |_args: Vec<Value>| async move {
            Err::<Value, _>(Error::InvalidArgument("gate is shut".into()))
        })
        .build();
    server.attach_context(gate, None).expect("attach");
    let network = serve(&server);
    let (client, peer) = dial(&network, NetronConfig { response_timeout: 100, ..NetronConfig::default() }).await;

    let gate = client.interface_by_name("Gate", Some(server.uid())).expect("interface");
    let err = gate.call("jammed", vec![]).await.unwrap_err();
    assert!(matches!(err, Error::Timeout(d) if d == Duration::from_millis(100)), "{err}");
    assert_eq!(peer.pending_requests(), 0);

    // Other failures on the same stub are still answered.
    assert!(matches!(gate.call("shut", vec![]).await, Err(Error::InvalidArgument(_))));
}
