//! Integration tests for the bus client.
//!
//! A minimal in-process MQTT 3.1.1 broker accepts the client, acknowledges
//! its packets (publishes optionally) and records what it receives, so the connect, subscribe,
//! publish and reconnect paths can be exercised without an external broker.

use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::mpsc;
use voltlink_common::{BusEvent, Command, CommandSink, CommandValue};
use voltlink_mqtt::{BusClient, MqttConfig, Presence};

#[derive(Debug, Clone, PartialEq)]
enum Seen {
    Subscribe(String),
    Publish {
        topic: String,
        payload: Vec<u8>,
        retain: bool,
    },
    Disconnect,
}

enum Outbound {
    Bytes(Vec<u8>),
    Close,
}

struct FakeBroker {
    addr: SocketAddr,
    seen: mpsc::UnboundedReceiver<Seen>,
    current: Arc<Mutex<Option<mpsc::UnboundedSender<Outbound>>>>,
}

impl FakeBroker {
    async fn start() -> Self {
        Self::bind(true).await
    }

    /// A broker that takes publishes but never sends PUBACK.
    async fn without_puback() -> Self {
        Self::bind(false).await
    }

    async fn bind(ack_publishes: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (seen_tx, seen) = mpsc::unbounded_channel();
        let current = Arc::new(Mutex::new(None));

        tokio::spawn(serve(listener, seen_tx, Arc::clone(&current), ack_publishes));

        Self {
            addr,
            seen,
            current,
        }
    }

    fn url(&self) -> String {
        format!("mqtt://{}", self.addr)
    }

    fn send(&self, out: Outbound) {
        if let Some(tx) = self.current.lock().as_ref() {
            let _ = tx.send(out);
        }
    }

    /// Deliver a QoS 0 publish to the connected client.
    fn publish(&self, topic: &str, payload: &[u8]) {
        let mut body = Vec::new();
        body.extend_from_slice(&(topic.len() as u16).to_be_bytes());
        body.extend_from_slice(topic.as_bytes());
        body.extend_from_slice(payload);

        let mut packet = vec![0x30];
        encode_len(body.len(), &mut packet);
        packet.extend(body);
        self.send(Outbound::Bytes(packet));
    }

    fn drop_connection(&self) {
        self.send(Outbound::Close);
    }

    async fn next_seen(&mut self) -> Seen {
        tokio::time::timeout(Duration::from_secs(3), self.seen.recv())
            .await
            .expect("broker saw nothing in time")
            .expect("broker stopped")
    }

    /// Wait for a publish on `topic`, skipping everything else.
    async fn next_publish_on(&mut self, topic: &str) -> (Vec<u8>, bool) {
        loop {
            if let Seen::Publish {
                topic: t,
                payload,
                retain,
            } = self.next_seen().await
            {
                if t == topic {
                    return (payload, retain);
                }
            }
        }
    }
}

fn encode_len(mut len: usize, out: &mut Vec<u8>) {
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if len == 0 {
            break;
        }
    }
}

async fn read_packet(reader: &mut OwnedReadHalf) -> std::io::Result<(u8, Vec<u8>)> {
    let header = reader.read_u8().await?;
    let mut len = 0usize;
    let mut multiplier = 1usize;
    loop {
        let byte = reader.read_u8().await?;
        len += (byte & 0x7f) as usize * multiplier;
        if byte & 0x80 == 0 {
            break;
        }
        multiplier *= 128;
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok((header, body))
}

fn read_str(body: &[u8], at: usize) -> (String, usize) {
    let len = u16::from_be_bytes([body[at], body[at + 1]]) as usize;
    let text = String::from_utf8_lossy(&body[at + 2..at + 2 + len]).into_owned();
    (text, at + 2 + len)
}

async fn serve(
    listener: TcpListener,
    seen: mpsc::UnboundedSender<Seen>,
    current: Arc<Mutex<Option<mpsc::UnboundedSender<Outbound>>>>,
    ack_publishes: bool,
) {
    while let Ok((stream, _)) = listener.accept().await {
        let (mut reader, mut writer) = stream.into_split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        *current.lock() = Some(out_tx.clone());

        let writer_task = tokio::spawn(async move {
            while let Some(out) = out_rx.recv().await {
                match out {
                    Outbound::Bytes(bytes) => {
                        if writer.write_all(&bytes).await.is_err() {
                            break;
                        }
                    }
                    Outbound::Close => {
                        let _ = writer.shutdown().await;
                        break;
                    }
                }
            }
        });

        while let Ok((header, body)) = read_packet(&mut reader).await {
            match header >> 4 {
                // CONNECT
                1 => {
                    let _ = out_tx.send(Outbound::Bytes(vec![0x20, 0x02, 0x00, 0x00]));
                }
                // PUBLISH
                3 => {
                    let qos = (header >> 1) & 0x03;
                    let (topic, mut at) = read_str(&body, 0);
                    if qos > 0 {
                        let pkid = [body[at], body[at + 1]];
                        at += 2;
                        if ack_publishes {
                            let _ = out_tx.send(Outbound::Bytes(vec![0x40, 0x02, pkid[0], pkid[1]]));
                        }
                    }
                    let _ = seen.send(Seen::Publish {
                        topic,
                        payload: body[at..].to_vec(),
                        retain: header & 0x01 == 1,
                    });
                }
                // SUBSCRIBE
                8 => {
                    let pkid = [body[0], body[1]];
                    let mut at = 2;
                    let mut count = 0;
                    while at < body.len() {
                        let (topic, next) = read_str(&body, at);
                        at = next + 1;
                        count += 1;
                        let _ = seen.send(Seen::Subscribe(topic));
                    }
                    let mut ack = vec![0x90];
                    encode_len(2 + count, &mut ack);
                    ack.extend_from_slice(&pkid);
                    ack.extend(std::iter::repeat_n(0x01, count));
                    let _ = out_tx.send(Outbound::Bytes(ack));
                }
                // PINGREQ
                12 => {
                    let _ = out_tx.send(Outbound::Bytes(vec![0xD0, 0x00]));
                }
                // DISCONNECT
                14 => {
                    let _ = seen.send(Seen::Disconnect);
                    break;
                }
                _ => {}
            }
        }

        current.lock().take();
        drop(out_tx);
        let _ = writer_task.await;
    }
}

fn config(url: String) -> MqttConfig {
    MqttConfig {
        url,
        keep_alive_secs: 5,
        connect_timeout_ms: 500,
        reconnect_period_ms: 100,
        publish_timeout_ms: 500,
        ..Default::default()
    }
}

fn status_topics() -> Vec<String> {
    vec![
        "energy/solar/status".to_string(),
        "energy/heatpump/status".to_string(),
        "energy/system/controls".to_string(),
    ]
}

fn presence() -> Presence {
    Presence {
        topic: "energy/relay/status".to_string(),
        online: serde_json::json!({ "status": "running" }),
        offline: serde_json::json!({ "status": "offline" }),
    }
}

async fn next_event(rx: &mut mpsc::Receiver<BusEvent>) -> BusEvent {
    tokio::time::timeout(Duration::from_secs(3), rx.recv())
        .await
        .expect("no bus event in time")
        .expect("bus event channel closed")
}

async fn subscriptions(broker: &mut FakeBroker, count: usize) -> Vec<String> {
    let mut topics = Vec::new();
    while topics.len() < count {
        if let Seen::Subscribe(topic) = broker.next_seen().await {
            topics.push(topic);
        }
    }
    topics
}

#[tokio::test]
async fn test_connect_subscribes_fixed_topic_set() {
    let mut broker = FakeBroker::start().await;
    let (tx, mut rx) = mpsc::channel(64);
    let client =
        BusClient::connect_with_presence(&config(broker.url()), status_topics(), presence(), tx)
            .unwrap();

    assert_eq!(next_event(&mut rx).await, BusEvent::Connected);
    assert!(client.is_connected());
    assert_eq!(subscriptions(&mut broker, 3).await, status_topics());

    let (payload, retain) = broker.next_publish_on("energy/relay/status").await;
    let status: serde_json::Value = serde_json::from_slice(&payload).unwrap();
    assert_eq!(status["status"], "running");
    assert!(retain);

    client.disconnect().await;
}

#[tokio::test]
async fn test_publish_command_payload() {
    let mut broker = FakeBroker::start().await;
    let (tx, mut rx) = mpsc::channel(64);
    let client = BusClient::connect(&config(broker.url()), status_topics(), tx).unwrap();
    assert_eq!(next_event(&mut rx).await, BusEvent::Connected);

    let command = Command::new("heatpump", "set_temperature").with_value(21.5);
    assert!(client.publish(&command).await);

    let (payload, retain) = broker.next_publish_on("energy/heatpump/command").await;
    assert!(!retain);
    let body: serde_json::Value = serde_json::from_slice(&payload).unwrap();
    assert_eq!(body["command"], "set_temperature");
    assert_eq!(body["value"], 21.5);
    assert!(body["timestamp"].is_string());
    assert!(body.get("deviceId").is_none());

    assert!(
        client
            .publish_system_control("grid_export", Some(false.into()))
            .await
    );
    let (payload, _) = broker.next_publish_on("energy/system/command").await;
    let body: serde_json::Value = serde_json::from_slice(&payload).unwrap();
    assert_eq!(body["command"], "grid_export");
    assert_eq!(body["value"], false);

    client.disconnect().await;
}

#[tokio::test]
async fn test_integer_value_published_as_integer() {
    let mut broker = FakeBroker::start().await;
    let (tx, mut rx) = mpsc::channel(64);
    let client = BusClient::connect(&config(broker.url()), status_topics(), tx).unwrap();
    assert_eq!(next_event(&mut rx).await, BusEvent::Connected);

    let command: Command =
        serde_json::from_str(r#"{"deviceId":"charger","command":"set_current","value":16}"#)
            .unwrap();
    assert_eq!(command.value, Some(CommandValue::Integer(16)));
    assert!(client.publish(&command).await);

    let (payload, _) = broker.next_publish_on("energy/charger/command").await;
    let text = String::from_utf8(payload).unwrap();
    assert!(text.contains(r#""value":16,"#), "payload was {}", text);

    client.disconnect().await;
}

#[tokio::test]
async fn test_publish_requires_broker_acknowledgement() {
    let mut broker = FakeBroker::without_puback().await;
    let (tx, mut rx) = mpsc::channel(64);
    let client = BusClient::connect(&config(broker.url()), status_topics(), tx).unwrap();
    assert_eq!(next_event(&mut rx).await, BusEvent::Connected);

    let started = Instant::now();
    assert!(!client.publish(&Command::new("heatpump", "stop")).await);
    assert!(started.elapsed() >= Duration::from_millis(400));

    // The broker got the packet, it just never confirmed it
    broker.next_publish_on("energy/heatpump/command").await;

    client.disconnect().await;
}

#[tokio::test]
async fn test_connection_loss_fails_pending_publish() {
    let mut broker = FakeBroker::without_puback().await;
    let mut cfg = config(broker.url());
    cfg.publish_timeout_ms = 10_000;
    let (tx, mut rx) = mpsc::channel(64);
    let client = Arc::new(BusClient::connect(&cfg, status_topics(), tx).unwrap());
    assert_eq!(next_event(&mut rx).await, BusEvent::Connected);

    let publisher = Arc::clone(&client);
    let pending =
        tokio::spawn(async move { publisher.publish(&Command::new("solar", "stop")).await });

    broker.next_publish_on("energy/solar/command").await;
    broker.drop_connection();

    let sent = tokio::time::timeout(Duration::from_secs(3), pending)
        .await
        .expect("publish still waiting after the connection dropped")
        .unwrap();
    assert!(!sent);
    assert_eq!(next_event(&mut rx).await, BusEvent::Disconnected);

    client.disconnect().await;
}

#[tokio::test]
async fn test_inbound_status_becomes_message() {
    let mut broker = FakeBroker::start().await;
    let (tx, mut rx) = mpsc::channel(64);
    let client = BusClient::connect(&config(broker.url()), status_topics(), tx).unwrap();
    assert_eq!(next_event(&mut rx).await, BusEvent::Connected);
    subscriptions(&mut broker, 3).await;

    broker.publish("energy/heatpump/status", b"definitely not json");
    broker.publish("energy/heatpump/status", br#"{"mode":"eco","temperature":45.5}"#);

    match next_event(&mut rx).await {
        BusEvent::Message(message) => {
            assert_eq!(message.topic, "energy/heatpump/status");
            assert_eq!(message.data["mode"], "eco");
            assert_eq!(message.data["temperature"], 45.5);
        }
        other => panic!("expected a message, got {:?}", other),
    }

    client.disconnect().await;
}

#[tokio::test]
async fn test_broker_loss_and_reconnect() {
    let mut broker = FakeBroker::start().await;
    let (tx, mut rx) = mpsc::channel(64);
    let client = BusClient::connect(&config(broker.url()), status_topics(), tx).unwrap();
    assert_eq!(next_event(&mut rx).await, BusEvent::Connected);
    subscriptions(&mut broker, 3).await;

    broker.drop_connection();
    assert_eq!(next_event(&mut rx).await, BusEvent::Disconnected);
    assert!(!client.is_connected());
    assert!(!client.publish(&Command::new("solar", "stop")).await);

    // Reconnects and subscribes again
    assert_eq!(next_event(&mut rx).await, BusEvent::Connected);
    assert_eq!(subscriptions(&mut broker, 3).await, status_topics());
    assert!(client.publish(&Command::new("solar", "stop")).await);

    client.disconnect().await;
}

#[tokio::test]
async fn test_disconnect_announces_offline() {
    let mut broker = FakeBroker::start().await;
    let (tx, mut rx) = mpsc::channel(64);
    let client =
        BusClient::connect_with_presence(&config(broker.url()), status_topics(), presence(), tx)
            .unwrap();
    assert_eq!(next_event(&mut rx).await, BusEvent::Connected);
    broker.next_publish_on("energy/relay/status").await;

    client.disconnect().await;
    client.disconnect().await;

    let (payload, retain) = broker.next_publish_on("energy/relay/status").await;
    let status: serde_json::Value = serde_json::from_slice(&payload).unwrap();
    assert_eq!(status["status"], "offline");
    assert!(retain);

    loop {
        if broker.next_seen().await == Seen::Disconnect {
            break;
        }
    }
    assert!(!client.is_connected());
    assert!(!client.publish(&Command::new("solar", "stop")).await);
}

#[tokio::test]
async fn test_unreachable_broker() {
    // Nothing listens on the discard port
    let (tx, _rx) = mpsc::channel(64);
    let client =
        BusClient::connect(&config("mqtt://127.0.0.1:9".to_string()), status_topics(), tx)
            .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!client.is_connected());
    assert!(!CommandSink::is_connected(&client));
    assert!(!client.publish(&Command::new("solar", "stop")).await);
    assert!(
        !client
            .publish_json("energy/relay/status", &serde_json::json!({}), true)
            .await
    );

    client.disconnect().await;
    client.disconnect().await;
}

#[tokio::test]
async fn test_incomplete_command_is_refused() {
    let mut broker = FakeBroker::start().await;
    let (tx, mut rx) = mpsc::channel(64);
    let client = BusClient::connect(&config(broker.url()), status_topics(), tx).unwrap();
    assert_eq!(next_event(&mut rx).await, BusEvent::Connected);
    subscriptions(&mut broker, 3).await;

    assert!(!client.publish(&Command::new("", "stop")).await);
    assert!(!client.publish(&Command::new("solar", " ")).await);

    client.disconnect().await;
}

#[test]
fn test_invalid_url_is_rejected() {
    let (tx, _rx) = mpsc::channel(1);
    let result = BusClient::connect(
        &config("mqtts://broker:8883".to_string()),
        status_topics(),
        tx,
    );
    assert!(result.is_err());
}
