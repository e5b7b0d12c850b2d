//! Remote event subscriptions and ordered lifecycle notifications.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use futures::FutureExt;

use netron::ContextBuilder;
use netron::Error;
use netron::Netron;
use netron::NetronConfig;
use netron::Peer;
use netron::Value;
use netron::channel::MemoryNetwork;
use netron::events::CONTEXT_ATTACH_EVENT;
use netron::events::CONTEXT_DETACH_EVENT;
use netron::events::LifecycleEvent;
use netron::events::LifecycleListener;
use netron::events::Listener;
use netron::peer::RemoteHandler;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn serve(server: &Arc<Netron>) -> Arc<MemoryNetwork> {
    let network = MemoryNetwork::new();
    network.listen("server", server).expect("listen");
    network
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

/// A remote handler recording every argument list it receives.
fn recorder(seen: &Arc<Mutex<Vec<Vec<Value>>>>) -> RemoteHandler {
    let seen = seen.clone();
    Arc::new(move |_peer: Arc<Peer>, args: Vec<Value>| {
        let seen = seen.clone();
        async move {
            seen.lock().unwrap().push(args);
        }
        .boxed()
    })
}

fn label(event: &LifecycleEvent) -> String {
    match event {
        LifecycleEvent::PeerCreate(_) => "create".into(),
        LifecycleEvent::PeerConnect(_) => "connect".into(),
        LifecycleEvent::PeerOnline(_) => "online".into(),
        LifecycleEvent::PeerOffline(_) => "offline".into(),
        LifecycleEvent::ContextAttach { name, .. } => format!("attach {name}"),
        LifecycleEvent::ContextDetach { name, .. } => format!("detach {name}"),
    }
}

fn lifecycle_log(netron: &Netron) -> Arc<Mutex<Vec<String>>> {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    let listener: LifecycleListener = Arc::new(move |event: LifecycleEvent| {
        let sink = sink.clone();
        async move {
            sink.lock().unwrap().push(label(&event));
        }
        .boxed()
    });
    netron.on_lifecycle(listener);
    log
}

// --- Test 1: Remote Events ---

#[tokio::test]
async fn test_remote_event_roundtrip() {
    init_tracing();
    let server = Netron::new(NetronConfig::default());
    let network = serve(&server);
    let client = Netron::new(NetronConfig::default());
    client.set_connector(network.clone()).expect("connector");
    client.connect("server").await.expect("connect");
    let uid = server.uid().to_string();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let id = client.on_remote(Some(&uid), "e", recorder(&seen)).await.expect("on_remote");

    // Emitting awaits the forwarder, which awaits the remote handlers.
    let ran = server.emit("e", vec![Value::from(1), Value::from("x")]).await;
    assert_eq!(ran, 1);
    assert_eq!(*seen.lock().unwrap(), vec![vec![Value::Int(1), Value::from("x")]]);

    client.off_remote(Some(&uid), "e", id).await.expect("off_remote");
    assert_eq!(server.emit("e", vec![Value::from(2)]).await, 0);
    assert_eq!(seen.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_remote_handlers_share_one_subscription() {
    init_tracing();
    let server = Netron::new(NetronConfig::default());
    let network = serve(&server);
    let client = Netron::new(NetronConfig::default());
    client.set_connector(network.clone()).expect("connector");
    client.connect("server").await.expect("connect");
    let uid = server.uid().to_string();

    let first = Arc::new(Mutex::new(Vec::new()));
    let second = Arc::new(Mutex::new(Vec::new()));
    let a = client.on_remote(Some(&uid), "tick", recorder(&first)).await.expect("first");
    let b = client.on_remote(Some(&uid), "tick", recorder(&second)).await.expect("second");
    assert_ne!(a, b);

    assert_eq!(server.emit("tick", vec![]).await, 1);
    assert_eq!(first.lock().unwrap().len(), 1);
    assert_eq!(second.lock().unwrap().len(), 1);

    // The subscription stays until the last handler goes.
    client.off_remote(Some(&uid), "tick", a).await.expect("off a");
    assert_eq!(server.emit("tick", vec![]).await, 1);
    client.off_remote(Some(&uid), "tick", b).await.expect("off b");
    assert_eq!(server.emit("tick", vec![]).await, 0);

    assert_eq!(first.lock().unwrap().len(), 1);
    assert_eq!(second.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn test_contexts_in_event_arguments_are_marshalled() {
    init_tracing();
    let server = Netron::new(NetronConfig::default());
    let network = serve(&server);
    let client = Netron::new(NetronConfig::default());
    client.set_connector(network.clone()).expect("connector");
    client.connect("server").await.expect("connect");
    let uid = server.uid().to_string();

    let seen = Arc::new(Mutex::new(Vec::new()));
    client.on_remote(Some(&uid), "created", recorder(&seen)).await.expect("on_remote");

    let item = ContextBuilder::new("Item").readonly("label", "first").build();
    server.emit("created", vec![Value::Context(item)]).await;

    let args = seen.lock().unwrap().pop().expect("delivered");
    let Some(Value::Definition(def)) = args.first() else {
        panic!("expected a definition, got {args:?}");
    };
    assert_eq!(def.name, "Item");
    assert!(server.stub_by_id(def.id).is_some());

    let item = client.interface_for(def.clone(), Some(&uid)).expect("interface");
    assert_eq!(item.get("label", None).await.expect("label"), Value::from("first"));
}

#[tokio::test]
async fn test_local_listeners_and_off() {
    let netron = Netron::new(NetronConfig::default());
    let hits = Arc::new(Mutex::new(0));
    let counter = hits.clone();
    let listener: Listener = Arc::new(move |_args: Vec<Value>| {
        let counter = counter.clone();
        async move {
            *counter.lock().unwrap() += 1;
        }
        .boxed()
    });

    let id = netron.on("local", listener);
    assert_eq!(netron.emit("local", vec![]).await, 1);
    assert!(netron.off("local", id));
    assert!(!netron.off("local", id));
    assert_eq!(netron.emit("local", vec![]).await, 0);
    assert_eq!(*hits.lock().unwrap(), 1);
}

#[tokio::test]
async fn test_on_remote_for_unknown_peer() {
    let netron = Netron::new(NetronConfig::default());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let err = netron.on_remote(Some("ghost"), "e", recorder(&seen)).await.unwrap_err();
    assert!(matches!(err, Error::Unknown(_)));
}

// --- Test 2: Lifecycle ---

#[tokio::test]
async fn test_peer_lifecycle_order() {
    init_tracing();
    let server = Netron::new(NetronConfig::default());
    let network = serve(&server);
    let client = Netron::new(NetronConfig::default());
    client.set_connector(network.clone()).expect("connector");
    let client_log = lifecycle_log(&client);
    let server_log = lifecycle_log(&server);

    client.connect("server").await.expect("connect");
    let expected = ["create", "connect", "online"].map(String::from).to_vec();
    assert!(eventually(|| *client_log.lock().unwrap() == expected).await);
    assert!(eventually(|| *server_log.lock().unwrap() == expected).await);

    client.disconnect(server.uid()).await.expect("disconnect");
    let expected = ["create", "connect", "online", "offline"].map(String::from).to_vec();
    assert!(eventually(|| *client_log.lock().unwrap() == expected).await);
    assert!(eventually(|| *server_log.lock().unwrap() == expected).await);
}

#[tokio::test]
async fn test_context_lifecycle_and_named_events() {
    let netron = Netron::new(NetronConfig::default());
    let log = lifecycle_log(&netron);

    let named = Arc::new(Mutex::new(Vec::new()));
    for event in [CONTEXT_ATTACH_EVENT, CONTEXT_DETACH_EVENT] {
        let named = named.clone();
        let listener: Listener = Arc::new(move |args: Vec<Value>| {
            let named = named.clone();
            async move {
                let id = args
                    .first()
                    .and_then(Value::as_map)
                    .and_then(|m| m.get("id"))
                    .and_then(Value::as_str)
                    .map(|id| format!("{event} {id}"));
                named.lock().unwrap().extend(id);
            }
            .boxed()
        });
        netron.on(event, listener);
    }

    let calc = ContextBuilder::new("Calc").readonly("version", 1).build();
    let def_id = netron.attach_context(calc, None).expect("attach");
    netron.detach_context("Calc").expect("detach");
    assert!(netron.stub_by_id(def_id).is_none());

    let expected = vec!["attach Calc".to_string(), "detach Calc".to_string()];
    assert!(eventually(|| *log.lock().unwrap() == expected).await);
    let expected = vec!["context attach Calc".to_string(), "context detach Calc".to_string()];
    assert!(eventually(|| *named.lock().unwrap() == expected).await);
}

#[tokio::test]
async fn test_off_lifecycle() {
    let netron = Netron::new(NetronConfig::default());
    let seen = Arc::new(Mutex::new(0));
    let counter = seen.clone();
    let listener: LifecycleListener = Arc::new(move |_event: LifecycleEvent| {
        let counter = counter.clone();
        async move {
            *counter.lock().unwrap() += 1;
        }
        .boxed()
    });
    let id = netron.on_lifecycle(listener);
    assert!(netron.off_lifecycle(id));
    assert!(!netron.off_lifecycle(id));

    let calc = ContextBuilder::new("Calc").readonly("version", 1).build();
    netron.attach_context(calc, None).expect("attach");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(*seen.lock().unwrap(), 0);
}
