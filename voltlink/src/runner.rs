//! Relay lifecycle: wiring, signal handling and teardown.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use voltlink_common::{LoggingConfig, TopicBuilder, init_tracing};
use voltlink_hub::Hub;
use voltlink_modbus::{DeviceConnector, DevicePoller, TcpConnector};
use voltlink_mqtt::BusClient;

use crate::RelayArgs;
use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::http::{self, AppState};
use crate::status;

/// Capacity of the poller and bus event channels.
const EVENT_CAPACITY: usize = 256;

/// The running relay: poller, bus client and hub, wired together.
///
/// Owns the three components and the task feeding their events into the
/// hub. [`Relay::shutdown`] tears everything down exactly once.
pub struct Relay {
    poller: DevicePoller,
    bus: Arc<BusClient>,
    hub: Arc<Hub>,
    events_task: JoinHandle<()>,
    stopped: AtomicBool,
}

impl Relay {
    /// Start the relay against real Modbus TCP devices.
    pub async fn start(config: &RelayConfig) -> Result<Self> {
        Self::start_with_connector(config, Arc::new(TcpConnector)).await
    }

    /// Start the relay, opening device connections through `connector`.
    pub async fn start_with_connector(
        config: &RelayConfig,
        connector: Arc<dyn DeviceConnector>,
    ) -> Result<Self> {
        config.validate()?;

        let devices = config.modbus.devices.clone();
        let settings = config.modbus.settings();
        let topics = TopicBuilder::new(config.mqtt.namespace.clone());

        let (poller_tx, poller_rx) = mpsc::channel(EVENT_CAPACITY);
        let (bus_tx, bus_rx) = mpsc::channel(EVENT_CAPACITY);

        let bus = Arc::new(BusClient::connect_with_presence(
            &config.mqtt,
            topics.status_topics(&devices),
            status::presence(&topics, &devices),
            bus_tx,
        )?);

        let poller = DevicePoller::new(settings, connector, poller_tx);
        let hub = Arc::new(Hub::new(devices.clone(), bus.clone()));

        let events_task = tokio::spawn({
            let hub = hub.clone();
            async move { hub.run_events(poller_rx, bus_rx).await }
        });

        poller.configure(devices).await;
        poller.start_polling(settings.poll_interval);

        info!(
            devices = poller.devices().len(),
            connected = poller.connected_devices().len(),
            poll_interval_ms = settings.poll_interval.as_millis() as u64,
            "Relay started"
        );

        Ok(Self {
            poller,
            bus,
            hub,
            events_task,
            stopped: AtomicBool::new(false),
        })
    }

    pub fn poller(&self) -> &DevicePoller {
        &self.poller
    }

    pub fn bus(&self) -> &Arc<BusClient> {
        &self.bus
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// State for the HTTP router.
    pub fn app_state(&self) -> AppState {
        AppState {
            poller: self.poller.clone(),
            sink: self.bus.clone(),
            hub: self.hub.clone(),
        }
    }

    /// Stop polling, announce offline status, leave the broker and close
    /// every viewer. Later calls do nothing.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("Shutting down relay");
        self.poller.disconnect();
        self.bus.disconnect().await;
        self.hub.close();
        self.events_task.abort();
    }
}

/// Run the relay until Ctrl+C or SIGTERM.
pub async fn run_relay(args: RelayArgs) -> anyhow::Result<()> {
    let config_found = args.config.exists();
    let mut config = RelayConfig::load(&args.config)?;
    config.apply_env()?;
    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }

    let logging = match &args.log_level {
        Some(level) => LoggingConfig {
            level: level.clone(),
            ..config.logging.clone()
        },
        None => config.logging.clone(),
    };
    init_tracing(&logging)?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting VoltLink relay");
    if !config_found {
        warn!(
            path = %args.config.display(),
            "Configuration file not found, using defaults"
        );
    }

    let listen = config.server.listen;
    let listener = TcpListener::bind(listen)
        .await
        .map_err(|source| RelayError::Bind {
            addr: listen,
            source,
        })?;

    let relay = Relay::start(&config).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let router = http::create_router(relay.app_state());
    let mut server = tokio::spawn(http::serve(listener, router, shutdown_rx));

    info!(addr = %listen, "Relay running. Press Ctrl+C to stop.");

    tokio::select! {
        _ = shutdown_signal() => {}
        result = &mut server => {
            // The server only returns on its own when it failed
            relay.shutdown().await;
            return match result {
                Ok(result) => result.map_err(Into::into),
                Err(e) => Err(anyhow::anyhow!("HTTP server task failed: {}", e)),
            };
        }
    }

    relay.shutdown().await;
    let _ = shutdown_tx.send(true);

    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "HTTP server error during shutdown"),
        Err(e) => error!(error = %e, "HTTP server task failed"),
    }

    info!("Goodbye!");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
