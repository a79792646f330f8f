//! `rumqttc`-backed transport.

use crate::config::MqttOptions;
use async_trait::async_trait;
use clustersync_core::{Envelope, EnvelopeStream, Transport, TransportError, EXTENSION_CLUSTER_NAME};
use clustersync_proto::{json, Topics};
use rumqttc::{AsyncClient, Event, EventLoop, Outgoing, Packet, QoS};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const CHANNEL_CAPACITY: usize = 100;
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// MQTT transport.
///
/// The event loop runs on a background task from [`MqttTransport::connect`]
/// until the transport is closed or its cancellation token fires. Closing
/// sends DISCONNECT to the broker before the loop is stopped.
pub struct MqttTransport {
    client: AsyncClient,
    sub_qos: QoS,
    pub_qos: QoS,
    subscriptions: Vec<String>,
    active: watch::Sender<Vec<String>>,
    inbound: Mutex<Option<mpsc::Receiver<Result<Envelope, TransportError>>>>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
    closing: CancellationToken,
    cancel: CancellationToken,
}

impl MqttTransport {
    /// Connect to the broker and start the event loop.
    ///
    /// `subscriptions` are only subscribed once [`Transport::subscribe`] is called.
    ///
    /// # Errors
    ///
    /// Returns error if the broker does not acknowledge the connection
    /// within the dial timeout.
    pub async fn connect(
        options: &MqttOptions,
        client_id: &str,
        subscriptions: Vec<String>,
        cancel: CancellationToken,
    ) -> Result<Self, TransportError> {
        let mut mqtt_options =
            rumqttc::MqttOptions::new(client_id, &options.broker_host, options.broker_port);
        mqtt_options.set_keep_alive(options.keep_alive);

        let (client, mut eventloop) = AsyncClient::new(mqtt_options, CHANNEL_CAPACITY);

        let broker = format!("{}:{}", options.broker_host, options.broker_port);
        tokio::time::timeout(options.dial_timeout, wait_for_connack(&mut eventloop))
            .await
            .map_err(|_| TransportError::Connection(format!("timed out connecting to {broker}")))??;

        tracing::info!(broker, client_id, "Connected to MQTT broker");

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (active, active_rx) = watch::channel(Vec::new());

        let event_loop = tokio::spawn(run_eventloop(
            eventloop,
            client.clone(),
            options.topics.clone(),
            options.sub_qos,
            options.reconnect_delay,
            active_rx,
            tx,
            cancel.clone(),
        ));

        Ok(Self {
            client,
            sub_qos: options.sub_qos,
            pub_qos: options.pub_qos,
            subscriptions,
            active,
            inbound: Mutex::new(Some(rx)),
            event_loop: Mutex::new(Some(event_loop)),
            closing: cancel.child_token(),
            cancel,
        })
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn send(&self, address: &str, envelope: &Envelope) -> Result<(), TransportError> {
        if self.closing.is_cancelled() {
            return Err(TransportError::Closed);
        }

        let payload = json::to_json(envelope).map_err(|e| TransportError::Wire(e.to_string()))?;

        tracing::debug!(
            topic = address,
            event_type = %envelope.event_type,
            payload_len = payload.len(),
            "Publishing event"
        );

        self.client
            .publish(address, self.pub_qos, false, payload)
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn subscribe(&self) -> Result<EnvelopeStream, TransportError> {
        let rx = self
            .inbound
            .lock()
            .await
            .take()
            .ok_or_else(|| TransportError::Subscribe("already subscribed".to_string()))?;

        for topic in &self.subscriptions {
            tracing::info!(topic, "Subscribing to MQTT topic");
            self.client
                .subscribe(topic, self.sub_qos)
                .await
                .map_err(|e| TransportError::Subscribe(e.to_string()))?;
        }
        // re-subscribed by the event loop after every reconnect
        self.active.send_replace(self.subscriptions.clone());

        Ok(rx)
    }

    async fn close(&self) {
        self.closing.cancel();
        if let Err(err) = self.client.disconnect().await {
            tracing::debug!(error = %err, "MQTT disconnect after close");
        }

        // the event loop exits once DISCONNECT is written
        if let Some(event_loop) = self.event_loop.lock().await.take() {
            if tokio::time::timeout(DISCONNECT_TIMEOUT, event_loop).await.is_err() {
                tracing::warn!("MQTT event loop did not flush DISCONNECT in time");
            }
        }
        self.cancel.cancel();
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), TransportError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
            Ok(_) => {}
            Err(e) => return Err(TransportError::Connection(e.to_string())),
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_eventloop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    topics: Topics,
    sub_qos: QoS,
    reconnect_delay: Duration,
    active: watch::Receiver<Vec<String>>,
    tx: mpsc::Sender<Result<Envelope, TransportError>>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                tracing::debug!(
                    topic = %publish.topic,
                    payload_len = publish.payload.len(),
                    "Received MQTT message"
                );

                let envelope = decode_publish(&topics, &publish.topic, &publish.payload);
                if let Err(err) = &envelope {
                    tracing::warn!(error = %err, topic = %publish.topic, "Failed to decode event");
                }

                if tx.send(envelope).await.is_err() {
                    tracing::debug!(topic = %publish.topic, "Event receiver dropped, discarding message");
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                tracing::info!("Reconnected to MQTT broker");
                let topics = active.borrow().clone();
                for topic in topics {
                    if let Err(err) = client.try_subscribe(topic.clone(), sub_qos) {
                        tracing::warn!(error = %err, topic, "Failed to re-subscribe");
                    }
                }
            }
            Ok(Event::Incoming(Packet::SubAck(_))) => {
                tracing::debug!("Subscription acknowledged");
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                tracing::info!("Disconnected from MQTT broker");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(error = %e, "MQTT error");
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(reconnect_delay) => {}
                }
            }
        }
    }

    tracing::info!("MQTT event loop stopped");
}

/// Decode a publish, checking the topic's cluster segment against the envelope.
fn decode_publish(topics: &Topics, topic: &str, payload: &[u8]) -> Result<Envelope, TransportError> {
    let envelope = json::from_json(payload).map_err(|e| TransportError::Wire(e.to_string()))?;

    if let (Some(from_topic), Some(claimed)) = (
        topics.cluster_of(topic),
        envelope.extension_str(EXTENSION_CLUSTER_NAME),
    ) {
        if from_topic != claimed {
            return Err(TransportError::Wire(format!(
                "topic {topic} is for cluster {from_topic}, event claims {claimed}"
            )));
        }
    }

    Ok(envelope)
}
