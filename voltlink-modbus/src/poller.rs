//! Periodic multi-device polling.
//!
//! The poller owns one connection per reachable device. Each round reads
//! every connected device concurrently, while reads on a single device stay
//! strictly sequential on that device's connection.

use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use voltlink_common::{ConnectionState, DeviceDescriptor, PollerEvent, Reading};

use crate::config::PollerSettings;
use crate::connector::{DeviceConnector, RegisterReader};
use crate::error::PollerError;

type Link = tokio::sync::Mutex<Box<dyn RegisterReader>>;

/// Round statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PollStats {
    /// Scheduled rounds completed since start
    pub rounds_completed: u64,
    /// Duration of the last scheduled round in milliseconds
    pub last_round_ms: u64,
    /// Devices that produced an online reading in the last scheduled round
    pub devices_online: usize,
}

#[derive(Default)]
struct Registry {
    devices: Vec<DeviceDescriptor>,
    links: HashMap<String, Arc<Link>>,
    states: HashMap<String, ConnectionState>,
    reconnecting: HashMap<String, JoinHandle<()>>,
}

struct PollerInner {
    settings: PollerSettings,
    connector: Arc<dyn DeviceConnector>,
    events: mpsc::Sender<PollerEvent>,
    registry: Mutex<Registry>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
    closed: AtomicBool,
    rounds_completed: AtomicU64,
    last_round_ms: AtomicU64,
    devices_online: AtomicUsize,
}

/// Polls a fixed set of Modbus devices and reports readings as
/// [`PollerEvent`]s.
///
/// Cloning is cheap; clones share the same connections and scheduler.
#[derive(Clone)]
pub struct DevicePoller {
    inner: Arc<PollerInner>,
}

impl DevicePoller {
    pub fn new(
        settings: PollerSettings,
        connector: Arc<dyn DeviceConnector>,
        events: mpsc::Sender<PollerEvent>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);

        Self {
            inner: Arc::new(PollerInner {
                settings,
                connector,
                events,
                registry: Mutex::new(Registry::default()),
                poll_task: Mutex::new(None),
                shutdown,
                closed: AtomicBool::new(false),
                rounds_completed: AtomicU64::new(0),
                last_round_ms: AtomicU64::new(0),
                devices_online: AtomicUsize::new(0),
            }),
        }
    }

    /// Register the devices and attempt to connect to each of them.
    ///
    /// Attempts run concurrently and this returns once all of them have
    /// settled. A failed attempt never aborts startup: the device stays
    /// disconnected and is handed to the reconnect supervisor.
    pub async fn configure(&self, devices: Vec<DeviceDescriptor>) {
        if self.inner.closed.load(Ordering::SeqCst) {
            warn!("Poller already disconnected, ignoring configure");
            return;
        }

        {
            let mut registry = self.inner.registry.lock();
            for device in &devices {
                registry
                    .states
                    .insert(device.id.clone(), ConnectionState::Connecting);
            }
            registry.devices = devices.clone();
        }

        let attempts = devices.iter().map(|device| self.inner.establish(device));
        let results = join_all(attempts).await;

        let mut connected = 0;
        for (device, ok) in devices.iter().zip(results) {
            if ok {
                connected += 1;
            } else {
                self.inner.schedule_reconnect(device.clone());
            }
        }

        info!(
            connected,
            total = devices.len(),
            "Device connection attempts settled"
        );
    }

    /// Start the round scheduler, replacing any previous one.
    ///
    /// The first round runs one `period` after the call. Ticks that fall
    /// due while a round is still running are skipped.
    pub fn start_polling(&self, period: Duration) {
        if self.inner.closed.load(Ordering::SeqCst) {
            warn!("Poller already disconnected, not starting");
            return;
        }
        if period.is_zero() {
            warn!("Poll interval must be greater than zero, not starting");
            return;
        }

        let inner = Arc::clone(&self.inner);
        let mut shutdown = self.inner.shutdown.subscribe();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => break,
                }

                let started = Instant::now();
                let readings = inner.read_round().await;
                inner.record_round(&readings, started.elapsed());
                inner.emit(PollerEvent::DataUpdate(readings)).await;
            }

            debug!("Poll scheduler stopped");
        });

        if let Some(previous) = self.inner.poll_task.lock().replace(handle) {
            previous.abort();
        }

        info!(interval_ms = period.as_millis() as u64, "Polling started");
    }

    /// Stop the round scheduler. Connections stay open.
    pub fn stop_polling(&self) {
        if let Some(task) = self.inner.poll_task.lock().take() {
            task.abort();
            info!("Polling stopped");
        }
    }

    pub fn is_polling(&self) -> bool {
        self.inner
            .poll_task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Run one round now without emitting an event.
    ///
    /// Returns one reading per currently connected device, in
    /// configuration order.
    pub async fn read_all_devices(&self) -> Vec<Reading> {
        self.inner.read_round().await
    }

    /// Configured devices, in configuration order.
    pub fn devices(&self) -> Vec<DeviceDescriptor> {
        self.inner.registry.lock().devices.clone()
    }

    /// Connection state of every configured device, in configuration order.
    pub fn connection_states(&self) -> Vec<(String, ConnectionState)> {
        let registry = self.inner.registry.lock();
        registry
            .devices
            .iter()
            .map(|d| {
                let state = registry.states.get(&d.id).copied().unwrap_or_default();
                (d.id.clone(), state)
            })
            .collect()
    }

    /// Ids of the devices with a live connection.
    pub fn connected_devices(&self) -> Vec<String> {
        let registry = self.inner.registry.lock();
        registry
            .devices
            .iter()
            .filter(|d| registry.links.contains_key(&d.id))
            .map(|d| d.id.clone())
            .collect()
    }

    pub fn stats(&self) -> PollStats {
        PollStats {
            rounds_completed: self.inner.rounds_completed.load(Ordering::Relaxed),
            last_round_ms: self.inner.last_round_ms.load(Ordering::Relaxed),
            devices_online: self.inner.devices_online.load(Ordering::Relaxed),
        }
    }

    /// Stop polling, cancel reconnects and drop every connection.
    ///
    /// Safe to call more than once.
    pub fn disconnect(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let _ = self.inner.shutdown.send(true);
        self.stop_polling();

        let (links, reconnecting) = {
            let mut registry = self.inner.registry.lock();
            for state in registry.states.values_mut() {
                *state = ConnectionState::Disconnected;
            }
            (
                std::mem::take(&mut registry.links),
                std::mem::take(&mut registry.reconnecting),
            )
        };

        for (_, task) in reconnecting {
            task.abort();
        }
        let count = links.len();
        drop(links);

        info!(connections = count, "Poller disconnected");
    }
}

impl PollerInner {
    /// One connection attempt bounded by the connect timeout.
    ///
    /// Returns whether the device is now connected.
    async fn establish(&self, device: &DeviceDescriptor) -> bool {
        let timeout = self.settings.connect_timeout;
        let result = match tokio::time::timeout(timeout, self.connector.connect(device)).await {
            Ok(result) => result,
            Err(_) => Err(PollerError::ConnectTimeout(timeout.as_millis() as u64)),
        };

        match result {
            Ok(reader) => {
                let link = Arc::new(tokio::sync::Mutex::new(reader));
                let event = {
                    let mut registry = self.registry.lock();
                    if self.closed.load(Ordering::SeqCst) {
                        return false;
                    }
                    registry.links.insert(device.id.clone(), link);
                    Self::transition(&mut registry, &device.id, ConnectionState::Connected)
                };
                info!(device = %device.id, endpoint = %device.endpoint(), "Connected to device");
                if let Some(event) = event {
                    self.emit(event).await;
                }
                true
            }
            Err(e) => {
                let event = {
                    let mut registry = self.registry.lock();
                    Self::transition(&mut registry, &device.id, ConnectionState::Disconnected)
                };
                if event.is_some() {
                    warn!(
                        device = %device.id,
                        endpoint = %device.endpoint(),
                        error = %e,
                        "Failed to connect to device"
                    );
                } else {
                    debug!(device = %device.id, error = %e, "Reconnect attempt failed");
                }
                if let Some(event) = event {
                    self.emit(event).await;
                }
                false
            }
        }
    }

    /// Record a state change, returning the event to emit if it is a
    /// transition into `connected` or `disconnected`.
    fn transition(
        registry: &mut Registry,
        device_id: &str,
        state: ConnectionState,
    ) -> Option<PollerEvent> {
        let previous = registry.states.insert(device_id.to_string(), state);
        if previous == Some(state) {
            return None;
        }
        match state {
            ConnectionState::Connected => Some(PollerEvent::DeviceConnected(device_id.to_string())),
            ConnectionState::Disconnected => {
                Some(PollerEvent::DeviceDisconnected(device_id.to_string()))
            }
            ConnectionState::Connecting => None,
        }
    }

    /// Start a reconnect supervisor for `device` unless one is running or
    /// reconnection is disabled.
    fn schedule_reconnect(self: &Arc<Self>, device: DeviceDescriptor) {
        let Some(period) = self.settings.reconnect_interval else {
            return;
        };
        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        let mut registry = self.registry.lock();
        if registry
            .reconnecting
            .get(&device.id)
            .is_some_and(|task| !task.is_finished())
        {
            return;
        }

        let inner = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        let device_id = device.id.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(period) => {}
                    _ = shutdown.changed() => break,
                }
                if inner.closed.load(Ordering::SeqCst) {
                    break;
                }
                if inner.establish(&device).await {
                    // The new link may already have failed again, in which
                    // case this supervisor keeps retrying
                    let mut registry = inner.registry.lock();
                    if registry.links.contains_key(&device.id) {
                        registry.reconnecting.remove(&device.id);
                        return;
                    }
                }
            }
            inner.registry.lock().reconnecting.remove(&device.id);
        });

        debug!(device = %device_id, period_ms = period.as_millis() as u64, "Reconnect scheduled");
        registry.reconnecting.insert(device_id, task);
    }

    async fn read_round(self: &Arc<Self>) -> Vec<Reading> {
        let targets: Vec<(DeviceDescriptor, Arc<Link>)> = {
            let registry = self.registry.lock();
            registry
                .devices
                .iter()
                .filter_map(|d| registry.links.get(&d.id).map(|l| (d.clone(), Arc::clone(l))))
                .collect()
        };

        let reads = targets
            .iter()
            .map(|(device, link)| self.read_device(device, link));
        let outcomes = join_all(reads).await;

        let mut readings = Vec::with_capacity(targets.len());
        for ((device, link), outcome) in targets.iter().zip(outcomes) {
            match outcome {
                Ok(reading) => readings.push(reading),
                Err(e) => {
                    warn!(device = %device.id, error = %e, "Device read failed");
                    if e.is_connection_loss() {
                        self.drop_link(device, link).await;
                    }
                    readings.push(Reading::offline(&device.id));
                }
            }
        }

        readings
    }

    /// Read every configured register of one device, power first.
    async fn read_device(
        &self,
        device: &DeviceDescriptor,
        link: &Link,
    ) -> Result<Reading, PollerError> {
        let timeout = self.settings.read_timeout;
        let mut reader = link.lock().await;
        let mut values = Vec::new();

        for (quantity, spec) in device.registers.entries() {
            let words = tokio::time::timeout(timeout, reader.read_holding_registers(spec.address, 1))
                .await
                .map_err(|_| PollerError::ReadTimeout(timeout.as_millis() as u64))??;

            let raw = words.first().copied().ok_or_else(|| {
                PollerError::Exception(format!("empty response for register {}", spec.address))
            })?;
            values.push((quantity, spec.convert(quantity, raw)));
        }

        Ok(Reading::from_values(&device.id, values))
    }

    /// Remove a lost connection and hand the device to the reconnect
    /// supervisor. A link that was already replaced is left alone.
    async fn drop_link(self: &Arc<Self>, device: &DeviceDescriptor, link: &Arc<Link>) {
        let event = {
            let mut registry = self.registry.lock();
            match registry.links.get(&device.id) {
                Some(current) if Arc::ptr_eq(current, link) => {
                    registry.links.remove(&device.id);
                    Self::transition(&mut registry, &device.id, ConnectionState::Disconnected)
                }
                _ => return,
            }
        };

        warn!(device = %device.id, "Connection to device lost");
        if let Some(event) = event {
            self.emit(event).await;
        }
        self.schedule_reconnect(device.clone());
    }

    fn record_round(&self, readings: &[Reading], elapsed: Duration) {
        let online = readings.iter().filter(|r| r.online).count();
        self.rounds_completed.fetch_add(1, Ordering::Relaxed);
        self.last_round_ms
            .store(elapsed.as_millis() as u64, Ordering::Relaxed);
        self.devices_online.store(online, Ordering::Relaxed);

        debug!(
            readings = readings.len(),
            online,
            elapsed_ms = elapsed.as_millis() as u64,
            "Poll round complete"
        );
    }

    async fn emit(&self, event: PollerEvent) {
        if self.events.send(event).await.is_err() {
            debug!("Poller event receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_emits_only_on_change() {
        let mut registry = Registry::default();

        assert_eq!(
            PollerInner::transition(&mut registry, "solar", ConnectionState::Connecting),
            None
        );
        assert_eq!(
            PollerInner::transition(&mut registry, "solar", ConnectionState::Disconnected),
            Some(PollerEvent::DeviceDisconnected("solar".to_string()))
        );
        assert_eq!(
            PollerInner::transition(&mut registry, "solar", ConnectionState::Disconnected),
            None
        );
        assert_eq!(
            PollerInner::transition(&mut registry, "solar", ConnectionState::Connected),
            Some(PollerEvent::DeviceConnected("solar".to_string()))
        );
    }
}
