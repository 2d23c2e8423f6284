use heapsync_core::{NodeKind, ReplayEngine};
use heapsync_proto::{parse_broker_url, SequenceTracker, SubscribeRequest, TopicScheme, UpdateFrame};
use heapsync_server::{Server, ServerConfig, StoreType};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use uuid::Uuid;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mqtt_subscribe_roundtrip() {
    if std::env::var("HEAPSYNC_INTEGRATION").is_err() {
        eprintln!("Skipping integration test; set HEAPSYNC_INTEGRATION=1 to run");
        return;
    }

    let broker = std::env::var("HEAPSYNC_MQTT_BROKER")
        .unwrap_or_else(|_| "tcp://localhost:1883".to_string());
    let (host, port) = parse_broker_url(&broker).unwrap();

    let tenant = format!("integration-{}", Uuid::new_v4().simple());
    let mut config = ServerConfig::default();
    config.delivery.mqtt_broker = broker.clone();
    config.delivery.tenant = tenant.clone();
    config.persistence.store_type = StoreType::Memory;
    config.heaps = vec!["greeting".to_string()];

    let (server, outbox) = Server::new(config).unwrap();
    let heap = server.heap("greeting").unwrap();
    {
        let mut tx = heap.begin_update().unwrap();
        let root = tx.ensure_root(NodeKind::Map).unwrap();
        tx.set_field(root, "message", "hello").unwrap();
    }

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server_task = tokio::spawn(server.run_until(outbox, async {
        let _ = stop_rx.await;
    }));
    // Give the server time to subscribe to its control topics
    tokio::time::sleep(Duration::from_secs(1)).await;

    let scheme = TopicScheme::new(&tenant);
    let request = SubscribeRequest::new("greeting");

    let mut opts = MqttOptions::new(format!("client-{}", Uuid::new_v4()), host, port);
    opts.set_keep_alive(Duration::from_secs(5));
    let (client, mut eventloop) = AsyncClient::new(opts, 10);
    client
        .subscribe(
            scheme.frames("greeting", request.subscriber_id),
            QoS::AtLeastOnce,
        )
        .await
        .unwrap();

    let (frames_tx, mut frames_rx) = mpsc::channel(8);
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    if frames_tx.send(publish.payload.to_vec()).await.is_err() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
    });

    client
        .publish(
            scheme.subscribe("greeting"),
            QoS::AtLeastOnce,
            false,
            request.to_cbor().unwrap(),
        )
        .await
        .unwrap();

    let mut tracker = SequenceTracker::new();
    let mut engine = ReplayEngine::new();

    let payload = timeout(Duration::from_secs(10), frames_rx.recv())
        .await
        .expect("timed out waiting for initial frame")
        .unwrap();
    let frame = UpdateFrame::from_cbor(&payload).unwrap();
    tracker.accept(&frame).unwrap();
    engine.receive(&frame.to_delivery().unwrap()).unwrap();

    {
        let mut tx = heap.begin_update().unwrap();
        let root = tx.ensure_root(NodeKind::Map).unwrap();
        tx.set_field(root, "message", "hello again").unwrap();
    }

    let payload = timeout(Duration::from_secs(10), frames_rx.recv())
        .await
        .expect("timed out waiting for update frame")
        .unwrap();
    let frame = UpdateFrame::from_cbor(&payload).unwrap();
    tracker.accept(&frame).unwrap();
    engine.receive(&frame.to_delivery().unwrap()).unwrap();

    heap.read(|table| assert_eq!(engine.mirror().table(), table));

    let _ = stop_tx.send(());
    timeout(Duration::from_secs(5), server_task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}
