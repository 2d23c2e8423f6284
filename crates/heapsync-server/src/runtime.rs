//! Server runtime orchestration.

use crate::config::{ServerConfig, StoreType};
use crate::persistence::{SqliteActionLog, SqliteStore};
use crate::replication::{MqttTransport, Outgoing};
use crate::status::{StatusHeap, STATUS_HEAP_ID};
use anyhow::{bail, Context, Result};
use heapsync_core::{HeapError, SharedHeap, SubscriberId, Subscription};
use heapsync_proto::{MessageType, SubscribeRequest, TopicScheme, UnsubscribeRequest, UpdateFrame};
use parking_lot::Mutex;
use rumqttc::{Event, Packet};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Frames buffered between forwarders and the MQTT client.
pub const OUTBOX_CAPACITY: usize = 1024;

/// One client subscription being forwarded to MQTT.
#[derive(Debug)]
struct Forwarder {
    heap_id: String,
    subscription_id: SubscriberId,
    task: JoinHandle<()>,
}

/// The server runtime: hosted heaps plus the forwarders feeding their
/// subscribers.
pub struct Server {
    server_id: Uuid,
    config: ServerConfig,
    topic_scheme: TopicScheme,
    heaps: HashMap<String, Arc<SharedHeap>>,
    status: StatusHeap,
    forwarders: HashMap<Uuid, Forwarder>,
    outbox: mpsc::Sender<Outgoing>,
}

impl Server {
    /// Create the server, opening or recovering every configured heap.
    ///
    /// Returns the server and the receiving end of its outbox, which
    /// [`run`](Self::run) hands to the MQTT client.
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be opened or a heap's log does not
    /// replay.
    pub fn new(config: ServerConfig) -> Result<(Self, mpsc::Receiver<Outgoing>)> {
        let server_id = config.server_id.unwrap_or_else(Uuid::new_v4);
        let options = config.heap_options();

        let store = match config.persistence.store_type {
            StoreType::Sqlite => Some(Arc::new(Mutex::new(
                SqliteStore::open(&config.persistence.db_path)
                    .context("Failed to open SQLite database")?,
            ))),
            StoreType::Memory => None,
        };

        let status = StatusHeap::start(
            server_id,
            &config.delivery.tenant,
            chrono::Utc::now(),
            options,
        )
        .context("Failed to start status heap")?;

        let mut heaps = HashMap::new();
        heaps.insert(STATUS_HEAP_ID.to_string(), Arc::clone(status.heap()));
        for heap_id in &config.heaps {
            if heaps.contains_key(heap_id) {
                bail!("Heap id '{heap_id}' is reserved or listed twice");
            }
            let heap = match &store {
                Some(store) => {
                    let log = SqliteActionLog::new(Arc::clone(store), heap_id.clone());
                    SharedHeap::with_log(heap_id.clone(), Box::new(log), options)
                        .with_context(|| format!("Failed to recover heap '{heap_id}'"))?
                }
                None => SharedHeap::new(heap_id.clone(), options),
            };
            status
                .record(&heap)
                .context("Failed to record heap status")?;
            heaps.insert(heap_id.clone(), Arc::new(heap));
        }

        tracing::info!(
            %server_id,
            heaps = heaps.len(),
            store = ?config.persistence.store_type,
            "Server initialized"
        );

        let (outbox, outbox_rx) = mpsc::channel(OUTBOX_CAPACITY);
        let topic_scheme = TopicScheme::new(&config.delivery.tenant);
        Ok((
            Self {
                server_id,
                config,
                topic_scheme,
                heaps,
                status,
                forwarders: HashMap::new(),
                outbox,
            },
            outbox_rx,
        ))
    }

    /// Server identifier.
    #[must_use]
    pub fn server_id(&self) -> Uuid {
        self.server_id
    }

    /// A hosted heap, for application writers.
    #[must_use]
    pub fn heap(&self, heap_id: &str) -> Option<Arc<SharedHeap>> {
        self.heaps.get(heap_id).cloned()
    }

    /// Number of client subscriptions currently forwarded.
    #[must_use]
    pub fn forwarder_count(&self) -> usize {
        self.forwarders
            .values()
            .filter(|forwarder| !forwarder.task.is_finished())
            .count()
    }

    /// Handle an incoming MQTT publish.
    pub fn handle_message(&mut self, topic: &str, payload: &[u8]) {
        self.forwarders
            .retain(|_, forwarder| !forwarder.task.is_finished());

        let Some((heap_id, msg_type)) = self.topic_scheme.parse(topic) else {
            tracing::debug!(topic, "Ignoring message on unknown topic");
            return;
        };

        match msg_type {
            MessageType::Subscribe => match SubscribeRequest::from_cbor(payload) {
                Ok(request) if request.heap_id == heap_id => self.subscribe(&request),
                Ok(request) => tracing::warn!(
                    topic_heap = %heap_id,
                    request_heap = %request.heap_id,
                    "Heap mismatch in subscribe request"
                ),
                Err(err) => tracing::warn!(error = %err, "Failed to decode SubscribeRequest"),
            },
            MessageType::Unsubscribe => match UnsubscribeRequest::from_cbor(payload) {
                Ok(request) => self.unsubscribe(&request),
                Err(err) => tracing::warn!(error = %err, "Failed to decode UnsubscribeRequest"),
            },
            MessageType::Frames(_) => {}
        }
    }

    fn subscribe(&mut self, request: &SubscribeRequest) {
        let Some(heap) = self.heaps.get(&request.heap_id).cloned() else {
            tracing::warn!(heap_id = %request.heap_id, "Subscribe request for unknown heap");
            return;
        };

        // A repeated id is a client resync: drop the old stream first
        if let Some(previous) = self.forwarders.remove(&request.subscriber_id) {
            self.release(previous);
        }

        let subscription = match heap.subscribe() {
            Ok(subscription) => subscription,
            Err(err) => {
                tracing::warn!(
                    heap_id = %request.heap_id,
                    subscriber_id = %request.subscriber_id,
                    error = %err,
                    "Subscribe rejected"
                );
                return;
            }
        };

        let topic = self
            .topic_scheme
            .frames(&request.heap_id, request.subscriber_id);
        tracing::info!(
            heap_id = %request.heap_id,
            subscriber_id = %request.subscriber_id,
            client_version = %request.version,
            topic = %topic,
            "Forwarding subscription"
        );

        let subscription_id = subscription.id();
        let forward = Forward {
            subscription,
            topic,
            outbox: self.outbox.clone(),
            sequence: 0,
        };
        let status = self.status.clone();
        let exited = Arc::clone(&heap);
        let task = tokio::spawn(async move {
            forward.run().await;
            record_status(&status, &exited);
        });

        self.forwarders.insert(
            request.subscriber_id,
            Forwarder {
                heap_id: request.heap_id.clone(),
                subscription_id,
                task,
            },
        );
        record_status(&self.status, &heap);
    }

    fn unsubscribe(&mut self, request: &UnsubscribeRequest) {
        match self.forwarders.remove(&request.subscriber_id) {
            Some(forwarder) if forwarder.heap_id == request.heap_id => self.release(forwarder),
            Some(forwarder) => {
                tracing::warn!(
                    subscriber_id = %request.subscriber_id,
                    heap_id = %request.heap_id,
                    "Unsubscribe names the wrong heap"
                );
                self.forwarders.insert(request.subscriber_id, forwarder);
            }
            None => {
                tracing::debug!(subscriber_id = %request.subscriber_id, "Unknown subscriber");
            }
        }
    }

    fn release(&self, forwarder: Forwarder) {
        if let Some(heap) = self.heaps.get(&forwarder.heap_id) {
            heap.unsubscribe(forwarder.subscription_id);
            record_status(&self.status, heap);
        }
    }

    /// Run until Ctrl+C. Heaps are left as they are, not terminated.
    ///
    /// # Errors
    ///
    /// Returns error if the MQTT transport cannot be created.
    pub async fn run(self, outbox: mpsc::Receiver<Outgoing>) -> Result<()> {
        self.run_until(outbox, async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "Failed to listen for shutdown signal");
            }
        })
        .await
    }

    /// Run until `shutdown` completes.
    ///
    /// # Errors
    ///
    /// Returns error if the MQTT transport cannot be created.
    pub async fn run_until(
        mut self,
        outbox: mpsc::Receiver<Outgoing>,
        shutdown: impl Future<Output = ()>,
    ) -> Result<()> {
        tracing::info!("Starting server runtime");

        let (transport, mut eventloop) = MqttTransport::new(
            &self.config.delivery.mqtt_broker,
            &format!("heapsync-{}", self.server_id),
            self.topic_scheme.clone(),
        )
        .context("Failed to create MQTT transport")?;
        let publisher = tokio::spawn(transport.clone().drain(outbox));

        tracing::info!("Server running, press Ctrl+C to stop");

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                event = eventloop.poll() => {
                    handle_event(&mut self, &transport, event).await;
                }

                () = &mut shutdown => {
                    tracing::info!("Shutdown signal received");
                    break;
                }
            }
        }

        for (_, forwarder) in self.forwarders.drain() {
            forwarder.task.abort();
        }
        publisher.abort();
        tracing::info!("Server stopped");
        Ok(())
    }
}

async fn handle_event(
    server: &mut Server,
    transport: &MqttTransport,
    event: Result<Event, rumqttc::ConnectionError>,
) {
    match event {
        Ok(Event::Incoming(Packet::ConnAck(_))) => {
            // Sessions are clean, so every (re)connect subscribes again. The
            // request queue may be full of frames queued during an outage and
            // only drains while the event loop is polled.
            let transport = transport.clone();
            tokio::spawn(async move {
                if let Err(err) = transport.subscribe_control().await {
                    tracing::error!(error = %err, "Failed to subscribe to control topics");
                }
            });
        }
        Ok(Event::Incoming(Packet::Publish(publish))) => {
            tracing::debug!(
                topic = %publish.topic,
                payload_len = publish.payload.len(),
                "Received control message"
            );
            server.handle_message(&publish.topic, &publish.payload);
        }
        Ok(_) => {}
        Err(e) => {
            tracing::error!(error = %e, "MQTT error");
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
        }
    }
}

fn record_status(status: &StatusHeap, heap: &SharedHeap) {
    if heap.heap_id() == STATUS_HEAP_ID {
        return;
    }
    if let Err(err) = status.record(heap) {
        tracing::warn!(heap_id = %heap.heap_id(), error = %err, "Failed to update status heap");
    }
}

/// Turns one subscription into sequenced frames on `topic`.
///
/// A stream the server gives up on ends with a [`FrameKind::Dropped`]
/// frame so the client knows to resubscribe.
///
/// [`FrameKind::Dropped`]: heapsync_proto::FrameKind::Dropped
struct Forward {
    subscription: Subscription,
    topic: String,
    outbox: mpsc::Sender<Outgoing>,
    sequence: u64,
}

impl Forward {
    async fn run(mut self) {
        loop {
            let delivery = match self.subscription.recv().await {
                Ok(Some(delivery)) => delivery,
                Ok(None) => {
                    tracing::debug!(
                        heap_id = %self.subscription.heap_id(),
                        subscriber_id = %self.subscription.id(),
                        reason = ?self.subscription.close_reason(),
                        "Subscription ended"
                    );
                    return;
                }
                Err(err) => {
                    tracing::warn!(
                        heap_id = %self.subscription.heap_id(),
                        subscriber_id = %self.subscription.id(),
                        error = %err,
                        "Subscription failed"
                    );
                    self.drop_stream(&err.to_string()).await;
                    return;
                }
            };

            let frame = match UpdateFrame::from_delivery(
                self.subscription.heap_id(),
                self.sequence,
                &delivery,
            ) {
                Ok(frame) => frame,
                Err(err) => {
                    let err = HeapError::from(err);
                    tracing::error!(
                        heap_id = %self.subscription.heap_id(),
                        error = %err,
                        "Failed to encode frame"
                    );
                    self.drop_stream(&err.to_string()).await;
                    return;
                }
            };

            if !self.send(&frame).await {
                return;
            }
            tracing::debug!(
                heap_id = %self.subscription.heap_id(),
                sequence = frame.sequence,
                actions = delivery.update().len(),
                "Queued frame"
            );
        }
    }

    /// Queue `frame`; false once the outbox is gone.
    async fn send(&mut self, frame: &UpdateFrame) -> bool {
        let payload = match frame.to_cbor() {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!(heap_id = %frame.heap_id, error = %err, "Failed to serialize frame");
                return false;
            }
        };
        let outgoing = Outgoing {
            topic: self.topic.clone(),
            payload,
        };
        if self.outbox.send(outgoing).await.is_err() {
            return false;
        }
        self.sequence += 1;
        true
    }

    async fn drop_stream(&mut self, reason: &str) {
        let frame = UpdateFrame::dropped(self.subscription.heap_id(), self.sequence, reason);
        self.send(&frame).await;
    }
}
