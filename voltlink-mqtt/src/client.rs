//! MQTT command/status bus client.

use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, Event, EventLoop, Incoming, LastWill, MqttOptions, Outgoing, QoS,
    SubscribeReasonCode,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use voltlink_common::{BusEvent, BusMessage, Command, CommandSink, CommandValue, TopicBuilder};

use crate::config::MqttConfig;
use crate::error::BusError;

/// Capacity of the client request queue.
const REQUEST_CAPACITY: usize = 64;

/// How long a graceful disconnect may take to flush.
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// Retained online/offline announcement for this client.
///
/// `online` is published on every successful (re)connect, `offline` is
/// registered as the last will and published before a clean disconnect.
#[derive(Debug, Clone)]
pub struct Presence {
    pub topic: String,
    pub online: serde_json::Value,
    pub offline: serde_json::Value,
}

/// Publishes waiting for the broker's PUBACK.
///
/// Requests reach the event loop in the order they are queued, so waiters
/// are matched to outgoing packet ids first in, first out. `None` marks a
/// publish nobody waits for.
#[derive(Default)]
struct PendingAcks {
    queued: VecDeque<Option<oneshot::Sender<bool>>>,
    inflight: HashMap<u16, oneshot::Sender<bool>>,
}

impl PendingAcks {
    fn sent(&mut self, pkid: u16) {
        if let Some(Some(waiter)) = self.queued.pop_front() {
            self.inflight.insert(pkid, waiter);
        }
    }

    fn acknowledged(&mut self, pkid: u16) {
        if let Some(waiter) = self.inflight.remove(&pkid) {
            let _ = waiter.send(true);
        }
    }

    fn fail_all(&mut self) {
        for waiter in self.queued.drain(..).flatten() {
            let _ = waiter.send(false);
        }
        for (_, waiter) in self.inflight.drain() {
            let _ = waiter.send(false);
        }
    }
}

/// Parameters of the background event loop.
struct LoopContext {
    client: AsyncClient,
    subscriptions: Vec<String>,
    presence: Option<(String, Vec<u8>)>,
    connected: Arc<AtomicBool>,
    acks: Arc<Mutex<PendingAcks>>,
    events: mpsc::Sender<BusEvent>,
    connect_timeout: Duration,
    reconnect_period: Duration,
}

/// Publishes commands and receives device/system status over MQTT.
///
/// The connection is maintained in the background: every failure or drop
/// is followed by a retry after the reconnect period, forever, and every
/// successful connect re-subscribes the fixed status topic set.
pub struct BusClient {
    client: AsyncClient,
    topics: TopicBuilder,
    connected: Arc<AtomicBool>,
    acks: Arc<Mutex<PendingAcks>>,
    closed: AtomicBool,
    publish_timeout: Duration,
    presence: Option<Presence>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BusClient {
    /// Start the client and its event loop.
    ///
    /// Must be called within a Tokio runtime. Returns once the loop is
    /// spawned; connectivity is reported through `events`.
    pub fn connect(
        config: &MqttConfig,
        status_topics: Vec<String>,
        events: mpsc::Sender<BusEvent>,
    ) -> Result<Self, BusError> {
        Self::start(config, status_topics, None, events)
    }

    /// Like [`BusClient::connect`], announcing `presence` on the broker.
    pub fn connect_with_presence(
        config: &MqttConfig,
        status_topics: Vec<String>,
        presence: Presence,
        events: mpsc::Sender<BusEvent>,
    ) -> Result<Self, BusError> {
        Self::start(config, status_topics, Some(presence), events)
    }

    fn start(
        config: &MqttConfig,
        status_topics: Vec<String>,
        presence: Option<Presence>,
        events: mpsc::Sender<BusEvent>,
    ) -> Result<Self, BusError> {
        config.validate()?;
        let broker = config.broker()?;
        let client_id = config.client_id();

        let mut options = MqttOptions::new(client_id.clone(), broker.host.clone(), broker.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
        options.set_clean_session(true);
        if let Some(username) = &broker.username {
            options.set_credentials(username.clone(), broker.password.clone().unwrap_or_default());
        }

        let announce = match &presence {
            Some(p) => {
                let offline = serde_json::to_vec(&p.offline)?;
                options.set_last_will(LastWill::new(
                    p.topic.clone(),
                    offline,
                    QoS::AtLeastOnce,
                    true,
                ));
                Some((p.topic.clone(), serde_json::to_vec(&p.online)?))
            }
            None => None,
        };

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let connected = Arc::new(AtomicBool::new(false));
        let acks = Arc::new(Mutex::new(PendingAcks::default()));
        let (shutdown, shutdown_rx) = watch::channel(false);

        info!(
            host = %broker.host,
            port = broker.port,
            client_id = %client_id,
            topics = status_topics.len(),
            "Starting bus client"
        );

        let context = LoopContext {
            client: client.clone(),
            subscriptions: status_topics,
            presence: announce,
            connected: Arc::clone(&connected),
            acks: Arc::clone(&acks),
            events,
            connect_timeout: config.connect_timeout(),
            reconnect_period: config.reconnect_period(),
        };
        let task = tokio::spawn(run_event_loop(eventloop, context, shutdown_rx));

        Ok(Self {
            client,
            topics: TopicBuilder::new(config.namespace.clone()),
            connected,
            acks,
            closed: AtomicBool::new(false),
            publish_timeout: config.publish_timeout(),
            presence,
            shutdown,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.connected.load(Ordering::SeqCst)
    }

    /// Publish a command on the device's command topic.
    ///
    /// Resolves once the broker acknowledges the publish. Returns `false` if
    /// the command is incomplete, the broker is not connected, the connection
    /// drops first, or no acknowledgement arrives within the publish timeout.
    pub async fn publish(&self, command: &Command) -> bool {
        if !command.is_complete() {
            warn!(
                device = %command.device_id,
                command = %command.command,
                "Refusing incomplete command"
            );
            return false;
        }
        if !self.is_connected() {
            warn!(
                device = %command.device_id,
                command = %command.command,
                "Broker not connected, command not sent"
            );
            return false;
        }

        let topic = self.topics.command_topic(&command.device_id);
        let payload = match serde_json::to_vec(&command.to_payload(voltlink_common::now())) {
            Ok(payload) => payload,
            Err(e) => {
                error!(device = %command.device_id, error = %e, "Failed to encode command");
                return false;
            }
        };

        let sent = self.send(topic, payload, false).await;
        if sent {
            info!(device = %command.device_id, command = %command.command, "Command published");
        }
        sent
    }

    /// Publish a control for the `system` pseudo-device.
    pub async fn publish_system_control(
        &self,
        control: &str,
        value: Option<CommandValue>,
    ) -> bool {
        self.publish(&Command::system(control, value)).await
    }

    /// Publish an arbitrary JSON document.
    pub async fn publish_json(&self, topic: &str, value: &serde_json::Value, retain: bool) -> bool {
        if !self.is_connected() {
            debug!(topic, "Broker not connected, message not sent");
            return false;
        }
        match serde_json::to_vec(value) {
            Ok(payload) => self.send(topic.to_string(), payload, retain).await,
            Err(e) => {
                error!(topic, error = %e, "Failed to encode message");
                false
            }
        }
    }

    async fn send(&self, topic: String, payload: Vec<u8>, retain: bool) -> bool {
        let ack = {
            // The event loop clears the queue under this lock when the link drops
            let mut acks = self.acks.lock();
            if !self.connected.load(Ordering::SeqCst) {
                debug!(topic = %topic, "Broker not connected, message not sent");
                return false;
            }
            if let Err(e) = self
                .client
                .try_publish(topic.clone(), QoS::AtLeastOnce, retain, payload)
            {
                warn!(topic = %topic, error = %e, "Publish rejected");
                return false;
            }
            let (tx, rx) = oneshot::channel();
            acks.queued.push_back(Some(tx));
            rx
        };

        match tokio::time::timeout(self.publish_timeout, ack).await {
            Ok(Ok(true)) => {
                debug!(topic = %topic, retain, "Publish acknowledged");
                true
            }
            Ok(_) => {
                warn!(topic = %topic, "Connection lost before the broker acknowledged");
                false
            }
            Err(_) => {
                warn!(
                    topic = %topic,
                    timeout_ms = self.publish_timeout.as_millis() as u64,
                    "Publish timed out"
                );
                false
            }
        }
    }

    /// Announce offline status, send DISCONNECT and stop the event loop.
    ///
    /// Safe to call more than once.
    pub async fn disconnect(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if self.connected.load(Ordering::SeqCst) {
            if let Some(presence) = &self.presence {
                match serde_json::to_vec(&presence.offline) {
                    Ok(payload) => {
                        self.send(presence.topic.clone(), payload, true).await;
                    }
                    Err(e) => error!(error = %e, "Failed to encode offline status"),
                }
            }
            // Queued behind any pending publish; the loop stops once it is sent
            match tokio::time::timeout(self.publish_timeout, self.client.disconnect()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(error = %e, "Failed to queue disconnect"),
                Err(_) => debug!("Timed out queueing disconnect"),
            }
        }

        let _ = self.shutdown.send(true);

        let task = self.task.lock().take();
        if let Some(mut task) = task {
            if tokio::time::timeout(DISCONNECT_GRACE, &mut task).await.is_err() {
                warn!("Bus event loop did not stop in time, aborting");
                task.abort();
            }
        }
        self.connected.store(false, Ordering::SeqCst);

        info!("Bus client disconnected");
    }
}

#[async_trait]
impl CommandSink for BusClient {
    async fn publish(&self, command: &Command) -> bool {
        BusClient::publish(self, command).await
    }

    fn is_connected(&self) -> bool {
        BusClient::is_connected(self)
    }
}

enum PollFailure {
    Connection(rumqttc::ConnectionError),
    Timeout,
}

impl std::fmt::Display for PollFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PollFailure::Connection(e) => write!(f, "{}", e),
            PollFailure::Timeout => write!(f, "connect timed out"),
        }
    }
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    ctx: LoopContext,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let connected = ctx.connected.load(Ordering::SeqCst);
        if *shutdown.borrow() && !connected {
            break;
        }

        // While connected the loop runs until the queued DISCONNECT goes out,
        // so pending publishes are flushed first.
        let outcome = if connected {
            eventloop.poll().await.map_err(PollFailure::Connection)
        } else {
            tokio::select! {
                result = tokio::time::timeout(ctx.connect_timeout, eventloop.poll()) => match result {
                    Ok(result) => result.map_err(PollFailure::Connection),
                    Err(_) => Err(PollFailure::Timeout),
                },
                _ = shutdown.changed() => break,
            }
        };

        match outcome {
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                on_connected(&ctx).await;
                if *shutdown.borrow() {
                    let _ = ctx.client.try_disconnect();
                }
            }
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                if let Some(message) = decode_message(&publish.topic, &publish.payload) {
                    emit(&ctx.events, BusEvent::Message(message)).await;
                }
            }
            Ok(Event::Incoming(Incoming::SubAck(ack))) => {
                for code in &ack.return_codes {
                    if matches!(code, SubscribeReasonCode::Failure) {
                        warn!(pkid = ack.pkid, "Broker rejected a subscription");
                    }
                }
            }
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => ctx.acks.lock().sent(pkid),
            Ok(Event::Incoming(Incoming::PubAck(ack))) => ctx.acks.lock().acknowledged(ack.pkid),
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                ctx.connected.store(false, Ordering::SeqCst);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                let was_connected = {
                    let mut acks = ctx.acks.lock();
                    // Requests of the lost session are not replayed; their
                    // callers see the failure instead
                    eventloop.clean();
                    eventloop.pending.clear();
                    acks.fail_all();
                    ctx.connected.swap(false, Ordering::SeqCst)
                };
                if was_connected {
                    warn!(error = %e, "Broker connection lost");
                    emit(&ctx.events, BusEvent::Disconnected).await;
                } else {
                    debug!(error = %e, "Broker connection attempt failed");
                }

                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    _ = tokio::time::sleep(ctx.reconnect_period) => {}
                    _ = shutdown.changed() => break,
                }
            }
        }
    }

    ctx.acks.lock().fail_all();
    debug!("Bus event loop stopped");
}

async fn on_connected(ctx: &LoopContext) {
    resume_session(ctx);
    emit(&ctx.events, BusEvent::Connected).await;
}

/// Mark the link up, re-subscribe and announce presence.
fn resume_session(ctx: &LoopContext) {
    let mut acks = ctx.acks.lock();
    ctx.connected.store(true, Ordering::SeqCst);
    info!("Connected to broker");

    for topic in &ctx.subscriptions {
        match ctx.client.try_subscribe(topic.clone(), QoS::AtLeastOnce) {
            Ok(()) => debug!(topic = %topic, "Subscribed"),
            Err(e) => warn!(topic = %topic, error = %e, "Subscribe failed"),
        }
    }

    if let Some((topic, payload)) = &ctx.presence {
        match ctx
            .client
            .try_publish(topic.clone(), QoS::AtLeastOnce, true, payload.clone())
        {
            Ok(()) => acks.queued.push_back(None),
            Err(e) => warn!(topic = %topic, error = %e, "Failed to announce presence"),
        }
    }
}

/// Decode an inbound payload as JSON. Malformed payloads are dropped.
fn decode_message(topic: &str, payload: &[u8]) -> Option<BusMessage> {
    match serde_json::from_slice(payload) {
        Ok(data) => Some(BusMessage {
            topic: topic.to_string(),
            data,
        }),
        Err(e) => {
            warn!(topic, error = %e, "Dropping malformed bus payload");
            None
        }
    }
}

async fn emit(events: &mpsc::Sender<BusEvent>, event: BusEvent) {
    if events.send(event).await.is_err() {
        debug!("Bus event receiver dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_message() {
        let message = decode_message("energy/heatpump/status", br#"{"mode":"eco"}"#).unwrap();
        assert_eq!(message.topic, "energy/heatpump/status");
        assert_eq!(message.data["mode"], "eco");
    }

    #[test]
    fn test_acks_match_outgoing_order() {
        let mut acks = PendingAcks::default();
        let (first_tx, mut first) = oneshot::channel();
        let (second_tx, mut second) = oneshot::channel();
        acks.queued.push_back(Some(first_tx));
        acks.queued.push_back(None);
        acks.queued.push_back(Some(second_tx));

        acks.sent(7);
        acks.sent(8);
        acks.sent(9);
        assert!(acks.queued.is_empty());

        acks.acknowledged(9);
        assert_eq!(second.try_recv(), Ok(true));
        assert!(first.try_recv().is_err());

        acks.acknowledged(8);
        acks.fail_all();
        assert_eq!(first.try_recv(), Ok(false));
        assert!(acks.inflight.is_empty());
    }

    #[test]
    fn test_decode_malformed_message() {
        assert!(decode_message("energy/solar/status", b"not json").is_none());
        assert!(decode_message("energy/solar/status", b"").is_none());
    }
}
