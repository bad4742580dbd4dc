//! Viewer registry and broadcast.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use voltlink_common::{
    BusEvent, BusMessage, CommandSink, ConnectionState, DeviceDescriptor, Envelope, PollerEvent,
    Reading,
};

use crate::protocol::{INVALID_FORMAT, ViewerRequest, parse_frame};

/// Identifier assigned to a viewer on registration.
pub type ViewerId = Uuid;

/// Outbound queue capacity per viewer.
pub const VIEWER_QUEUE: usize = 64;

/// Lifecycle of a viewer connection as seen by the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ViewerState {
    Open,
    Closed,
}

/// Fan-out hub between the relay's event sources and its viewers.
///
/// Each viewer is represented by the sending half of its outbound queue.
/// Dropping that sender ends the viewer's writer task, which closes the
/// socket.
pub struct Hub {
    devices: Vec<DeviceDescriptor>,
    sink: Arc<dyn CommandSink>,
    viewers: Mutex<HashMap<ViewerId, mpsc::Sender<String>>>,
    closed: AtomicBool,
}

impl Hub {
    pub fn new(devices: Vec<DeviceDescriptor>, sink: Arc<dyn CommandSink>) -> Self {
        Self {
            devices,
            sink,
            viewers: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Register a viewer and queue its initial snapshot.
    ///
    /// The snapshot is queued under the registry lock, ahead of any
    /// broadcast the viewer can observe. Returns `None` once the hub is
    /// closed.
    pub fn on_connect(&self, outbound: mpsc::Sender<String>) -> Option<ViewerId> {
        let snapshot = encode(&Envelope::system_status(json!({
            "devices": self.devices,
            "brokerConnected": self.sink.is_connected(),
        })))?;

        let mut viewers = self.viewers.lock();
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }

        if let Err(e) = outbound.try_send(snapshot) {
            debug!(error = %e, "Viewer went away before its snapshot");
            return None;
        }

        let id = Uuid::new_v4();
        viewers.insert(id, outbound);
        info!(viewer = %id, viewers = viewers.len(), "Viewer connected");
        Some(id)
    }

    /// Deregister a viewer. Unknown ids are ignored.
    pub fn on_disconnect(&self, id: ViewerId) {
        let mut viewers = self.viewers.lock();
        if viewers.remove(&id).is_some() {
            info!(viewer = %id, viewers = viewers.len(), "Viewer disconnected");
        }
    }

    pub fn viewer_count(&self) -> usize {
        self.viewers.lock().len()
    }

    pub fn viewer_state(&self, id: ViewerId) -> ViewerState {
        if self.viewers.lock().contains_key(&id) {
            ViewerState::Open
        } else {
            ViewerState::Closed
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn on_device_data(&self, readings: &[Reading]) {
        self.broadcast(&Envelope::device_data(readings));
    }

    pub fn on_bus_message(&self, message: &BusMessage) {
        self.broadcast(&Envelope::system_status(json!({
            "topic": message.topic,
            "data": message.data,
        })));
    }

    pub fn on_device_status(&self, device_id: &str, state: ConnectionState) {
        self.broadcast(&Envelope::system_status(json!({
            "deviceId": device_id,
            "status": state,
        })));
    }

    pub fn on_broker_status(&self, connected: bool) {
        self.broadcast(&Envelope::system_status(json!({
            "brokerConnected": connected,
        })));
    }

    /// Handle one text frame from a viewer.
    ///
    /// Replies go to that viewer only.
    pub async fn on_viewer_message(&self, id: ViewerId, raw: &str) {
        let request = match parse_frame(raw) {
            Ok(request) => request,
            Err(e) => {
                warn!(viewer = %id, error = %e, "Rejected viewer frame");
                self.send_to(id, &Envelope::error(INVALID_FORMAT));
                return;
            }
        };

        match request {
            ViewerRequest::Command(command) => {
                let sent = self.sink.publish(&command).await;
                if !sent {
                    warn!(
                        viewer = %id,
                        device = %command.device_id,
                        command = %command.command,
                        "Command was not published"
                    );
                }
                self.send_to(
                    id,
                    &Envelope::system_status(json!({
                        "commandSent": sent,
                        "command": command,
                    })),
                );
            }
            ViewerRequest::Ping => {
                self.send_to(id, &Envelope::system_status(json!({ "pong": true })));
            }
            ViewerRequest::Unknown(kind) => {
                warn!(viewer = %id, kind = %kind, "Unknown message kind");
            }
        }
    }

    /// Drop every viewer's outbound queue and refuse new viewers.
    pub fn close(&self) {
        let mut viewers = self.viewers.lock();
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let count = viewers.len();
        viewers.clear();
        info!(viewers = count, "Hub closed");
    }

    /// Consume poller and bus events until both channels close.
    pub async fn run_events(
        &self,
        mut poller_rx: mpsc::Receiver<PollerEvent>,
        mut bus_rx: mpsc::Receiver<BusEvent>,
    ) {
        let mut poller_open = true;
        let mut bus_open = true;

        while poller_open || bus_open {
            tokio::select! {
                event = poller_rx.recv(), if poller_open => match event {
                    Some(event) => self.on_poller_event(event),
                    None => poller_open = false,
                },
                event = bus_rx.recv(), if bus_open => match event {
                    Some(event) => self.on_bus_event(event),
                    None => bus_open = false,
                },
            }
        }

        debug!("Event sources closed");
    }

    fn on_poller_event(&self, event: PollerEvent) {
        match event {
            PollerEvent::DataUpdate(readings) => self.on_device_data(&readings),
            PollerEvent::DeviceConnected(id) => {
                self.on_device_status(&id, ConnectionState::Connected)
            }
            PollerEvent::DeviceDisconnected(id) => {
                self.on_device_status(&id, ConnectionState::Disconnected)
            }
        }
    }

    fn on_bus_event(&self, event: BusEvent) {
        match event {
            BusEvent::Message(message) => self.on_bus_message(&message),
            BusEvent::Connected => self.on_broker_status(true),
            BusEvent::Disconnected => self.on_broker_status(false),
        }
    }

    fn broadcast(&self, envelope: &Envelope) {
        let Some(text) = encode(envelope) else {
            return;
        };

        let mut viewers = self.viewers.lock();
        viewers.retain(|id, outbound| match outbound.try_send(text.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(viewer = %id, "Viewer queue full, dropping message");
                true
            }
            Err(TrySendError::Closed(_)) => {
                debug!(viewer = %id, "Removing closed viewer");
                false
            }
        });
    }

    fn send_to(&self, id: ViewerId, envelope: &Envelope) {
        let Some(text) = encode(envelope) else {
            return;
        };

        let mut viewers = self.viewers.lock();
        let Some(outbound) = viewers.get(&id) else {
            return;
        };
        match outbound.try_send(text) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(viewer = %id, "Viewer queue full, dropping reply");
            }
            Err(TrySendError::Closed(_)) => {
                viewers.remove(&id);
            }
        }
    }
}

fn encode(envelope: &Envelope) -> Option<String> {
    match envelope.to_json() {
        Ok(text) => Some(text),
        Err(e) => {
            error!(error = %e, kind = ?envelope.kind, "Failed to encode envelope");
            None
        }
    }
}
