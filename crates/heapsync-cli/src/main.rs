//! # heapsync CLI
//!
//! Command-line utilities for inspecting frames and watching heaps.

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use heapsync_core::{NodeId, NodeKind, NodeTable, ReplayEngine, ReplayState, Slot};
use heapsync_proto::{
    parse_broker_url, FrameKind, SequenceTracker, SubscribeRequest, TopicScheme,
    UnsubscribeRequest, UpdateFrame,
};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde_json::{json, Value};
use std::env;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_help();
        return Ok(());
    }

    match args[1].as_str() {
        "decode" => {
            if args.len() < 3 {
                eprintln!("Usage: heapsync decode <frame>");
                std::process::exit(1);
            }
            let decoded = decode_frame(&args[2])?;
            println!("{}", serde_json::to_string_pretty(&decoded)?);
        }
        "topics" => {
            if args.len() < 4 {
                eprintln!("Usage: heapsync topics <tenant> <heap>");
                std::process::exit(1);
            }
            let scheme = TopicScheme::new(&args[2]);
            let subscribe = scheme.subscribe(&args[3]);
            let base = subscribe.strip_suffix("/subscribe").unwrap_or(&subscribe);
            println!("subscribe:   {subscribe}");
            println!("unsubscribe: {}", scheme.unsubscribe(&args[3]));
            println!("frames:      {base}/sub/+");
        }
        "watch" => {
            if args.len() < 5 {
                eprintln!("Usage: heapsync watch <broker> <tenant> <heap>");
                std::process::exit(1);
            }
            watch(&args[2], &args[3], &args[4]).await?;
        }
        "help" | "--help" | "-h" => {
            print_help();
        }
        cmd => {
            eprintln!("Unknown command: {cmd}");
            print_help();
            std::process::exit(1);
        }
    }

    Ok(())
}

/// Decode a base64url frame into its actions.
fn decode_frame(encoded: &str) -> Result<Value> {
    let bytes = URL_SAFE_NO_PAD
        .decode(encoded.trim())
        .context("Frame is not base64url")?;
    let frame = UpdateFrame::from_cbor(&bytes).context("Failed to decode frame")?;
    let delivery = frame.to_delivery().context("Failed to decode frame payload")?;
    Ok(json!({
        "heap_id": frame.heap_id,
        "sequence": frame.sequence,
        "kind": frame.kind,
        "actions": delivery.update().actions(),
    }))
}

/// Most `null` entries a sparse list is padded with before it is rendered
/// as an object keyed by index instead.
const MAX_LIST_PADDING: usize = 64;

/// Render a mirrored tree as JSON. Small gaps in sparse lists become `null`;
/// lists with larger gaps render as `{"<index>": value}`.
fn tree_json(table: &NodeTable) -> Value {
    table
        .root()
        .map_or(Value::Null, |root| node_json(table, root))
}

fn node_json(table: &NodeTable, id: NodeId) -> Value {
    let Some(node) = table.get(id) else {
        return Value::Null;
    };
    match node.kind() {
        NodeKind::Scalar => node
            .value()
            .map_or(Value::Null, |value| Value::String(value.to_string())),
        NodeKind::Map => Value::Object(
            node.children()
                .filter_map(|(slot, child)| match slot {
                    Slot::Field(name) => Some((name.clone(), node_json(table, child))),
                    Slot::Index(_) => None,
                })
                .collect(),
        ),
        NodeKind::List => {
            let entries: Vec<(u32, Value)> = node
                .children()
                .filter_map(|(slot, child)| match slot {
                    Slot::Index(index) => Some((*index, node_json(table, child))),
                    Slot::Field(_) => None,
                })
                .collect();
            list_json(entries)
        }
    }
}

/// `entries` arrive in ascending index order.
fn list_json(entries: Vec<(u32, Value)>) -> Value {
    let span = entries
        .last()
        .map_or(0, |(index, _)| u64::from(*index) + 1);
    let padding = span - entries.len() as u64;
    if padding > MAX_LIST_PADDING as u64 {
        return Value::Object(
            entries
                .into_iter()
                .map(|(index, value)| (index.to_string(), value))
                .collect(),
        );
    }

    let mut items = Vec::with_capacity(entries.len() + MAX_LIST_PADDING);
    for (index, value) in entries {
        while (items.len() as u64) < u64::from(index) {
            items.push(Value::Null);
        }
        items.push(value);
    }
    Value::Array(items)
}

/// Client-side state for one watched heap.
struct View {
    engine: ReplayEngine,
    tracker: SequenceTracker,
    resyncing: bool,
}

impl View {
    fn new() -> Self {
        Self {
            engine: ReplayEngine::new(),
            tracker: SequenceTracker::new(),
            resyncing: true,
        }
    }

    /// Drop local state and wait for a fresh baseline.
    fn reset(&mut self) {
        *self = Self::new();
    }

    fn is_terminated(&self) -> bool {
        self.engine.state() == ReplayState::Terminated
    }

    /// Apply one frame. Returns the tree when it changed.
    fn accept(&mut self, payload: &[u8]) -> Result<Option<Value>> {
        let frame = UpdateFrame::from_cbor(payload)?;
        if self.resyncing {
            // Frames still in flight from the previous stream
            if frame.sequence != 0 || frame.kind != FrameKind::Initial {
                return Ok(None);
            }
            self.resyncing = false;
        }
        self.tracker.accept(&frame)?;
        self.engine.receive(&frame.to_delivery()?)?;
        Ok(Some(tree_json(self.engine.mirror().table())))
    }
}

async fn send_subscribe(
    client: &AsyncClient,
    scheme: &TopicScheme,
    request: &SubscribeRequest,
) -> Result<()> {
    client
        .publish(
            scheme.subscribe(&request.heap_id),
            QoS::AtLeastOnce,
            false,
            request.to_cbor()?,
        )
        .await
        .context("Failed to send subscribe request")
}

/// Subscribe to a heap and print its tree after every frame.
async fn watch(broker: &str, tenant: &str, heap_id: &str) -> Result<()> {
    let (host, port) = parse_broker_url(broker)?;
    if heap_id.is_empty() {
        bail!("Heap id must not be empty");
    }

    let scheme = TopicScheme::new(tenant);
    let request = SubscribeRequest::new(heap_id);
    let frames_topic = scheme.frames(heap_id, request.subscriber_id);

    let mut mqtt_options = MqttOptions::new(
        format!("heapsync-watch-{}", request.subscriber_id),
        host,
        port,
    );
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 10);

    let mut view = View::new();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    client
                        .subscribe(&frames_topic, QoS::AtLeastOnce)
                        .await
                        .context("Failed to subscribe to frames topic")?;
                    view.reset();
                    send_subscribe(&client, &scheme, &request).await?;
                    tracing::info!(heap_id, topic = %frames_topic, "Subscribed");
                }
                Ok(Event::Incoming(Packet::Publish(publish))) if publish.topic == frames_topic => {
                    match view.accept(&publish.payload) {
                        Ok(Some(tree)) => println!("{}", serde_json::to_string_pretty(&tree)?),
                        Ok(None) => {}
                        Err(err) => {
                            tracing::warn!(error = %err, "Lost sync, resubscribing");
                            view.reset();
                            send_subscribe(&client, &scheme, &request).await?;
                        }
                    }
                    if view.is_terminated() {
                        tracing::info!(heap_id, "Heap terminated");
                        return Ok(());
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(error = %err, "MQTT error");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            },

            _ = &mut ctrl_c => break,
        }
    }

    let unsubscribe = UnsubscribeRequest {
        heap_id: request.heap_id.clone(),
        subscriber_id: request.subscriber_id,
    };
    client
        .publish(
            scheme.unsubscribe(heap_id),
            QoS::AtLeastOnce,
            false,
            unsubscribe.to_cbor()?,
        )
        .await
        .context("Failed to send unsubscribe request")?;
    // Drive the event loop until the broker acknowledges
    let _ = tokio::time::timeout(Duration::from_secs(2), async {
        while let Ok(event) = eventloop.poll().await {
            if matches!(event, Event::Incoming(Packet::PubAck(_))) {
                break;
            }
        }
    })
    .await;

    Ok(())
}

fn print_help() {
    println!(
        r#"heapsync CLI

USAGE:
    heapsync <COMMAND> [OPTIONS]

COMMANDS:
    decode <frame>                  Decode a base64url update frame to JSON
    topics <tenant> <heap>          Show the MQTT topics used for a heap
    watch <broker> <tenant> <heap>  Subscribe to a heap and print its tree
    help                            Show this help message

EXAMPLES:
    heapsync topics plant-7 orders
    heapsync watch tcp://localhost:1883 default status
"#
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use heapsync_core::{HeapOptions, SharedHeap};

    fn frame_payload(heap: &SharedHeap, sequence: u64, delivery: &heapsync_core::Delivery) -> Vec<u8> {
        UpdateFrame::from_delivery(heap.heap_id(), sequence, delivery)
            .unwrap()
            .to_cbor()
            .unwrap()
    }

    #[test]
    fn tree_renders_maps_and_sparse_lists() {
        let heap = SharedHeap::new("orders", HeapOptions::default());
        {
            let mut tx = heap.begin_update().unwrap();
            let root = tx.ensure_root(NodeKind::Map).unwrap();
            tx.set_field(root, "customer", "acme").unwrap();
            let lines = tx.ensure_field(root, "lines", NodeKind::List).unwrap();
            tx.set_index(lines, 0, "bolts").unwrap();
            tx.set_index(lines, 2, "nuts").unwrap();
        }

        let tree = heap.read(tree_json);
        assert_eq!(
            tree,
            json!({"customer": "acme", "lines": ["bolts", null, "nuts"]})
        );
    }

    #[test]
    fn widely_sparse_lists_render_keyed_by_index() {
        let heap = SharedHeap::new("orders", HeapOptions::default());
        {
            let mut tx = heap.begin_update().unwrap();
            let root = tx.ensure_root(NodeKind::List).unwrap();
            tx.set_index(root, 0, "first").unwrap();
            tx.set_index(root, u32::MAX, "last").unwrap();
        }

        let tree = heap.read(tree_json);
        assert_eq!(tree, json!({"0": "first", "4294967295": "last"}));
    }

    #[test]
    fn view_skips_stale_frames_until_baseline() {
        let heap = SharedHeap::new("orders", HeapOptions::default());
        let mut sub = heap.subscribe().unwrap();
        {
            let mut tx = heap.begin_update().unwrap();
            let root = tx.ensure_root(NodeKind::Map).unwrap();
            tx.set_field(root, "state", "open").unwrap();
        }
        let first = sub.try_recv().unwrap().unwrap();
        {
            let mut tx = heap.begin_update().unwrap();
            tx.set_field(NodeId(0), "state", "closed").unwrap();
        }
        let second = sub.try_recv().unwrap().unwrap();

        let mut view = View::new();
        assert!(view
            .accept(&frame_payload(&heap, 1, &second))
            .unwrap()
            .is_none());
        assert_eq!(
            view.accept(&frame_payload(&heap, 0, &first)).unwrap(),
            Some(json!({"state": "open"}))
        );
        assert!(view.accept(&frame_payload(&heap, 2, &second)).is_err());
    }

    #[test]
    fn view_fails_on_dropped_stream() {
        let heap = SharedHeap::new("orders", HeapOptions::default());
        let mut sub = heap.subscribe().unwrap();
        {
            let mut tx = heap.begin_update().unwrap();
            tx.ensure_root(NodeKind::Map).unwrap();
        }
        let first = sub.try_recv().unwrap().unwrap();

        let mut view = View::new();
        view.accept(&frame_payload(&heap, 0, &first)).unwrap();
        let dropped = UpdateFrame::dropped("orders", 1, "subscriber fell behind")
            .to_cbor()
            .unwrap();
        let err = view.accept(&dropped).unwrap_err();
        assert!(err.to_string().contains("fell behind"));

        view.reset();
        assert_eq!(
            view.accept(&frame_payload(&heap, 0, &first)).unwrap(),
            Some(json!({}))
        );
    }

    #[test]
    fn decode_prints_actions() {
        let heap = SharedHeap::new("orders", HeapOptions::default());
        let mut sub = heap.subscribe().unwrap();
        {
            let mut tx = heap.begin_update().unwrap();
            tx.ensure_root(NodeKind::Map).unwrap();
        }
        let delivery = sub.try_recv().unwrap().unwrap();
        let encoded = URL_SAFE_NO_PAD.encode(frame_payload(&heap, 0, &delivery));

        let decoded = decode_frame(&encoded).unwrap();
        assert_eq!(decoded["heap_id"], "orders");
        assert_eq!(decoded["kind"], "initial");
        assert_eq!(decoded["actions"][0]["action"], "install_root");
        assert!(decode_frame("%%%").is_err());
    }
}
