//! Component ownership and lifecycle.
//!
//! The supervisor builds the stack bottom-up — port bus, EC transport and
//! manager, action queue, bezel poller, dispatcher, endpoints — runs it
//! until a shutdown signal, and tears it down in reverse. Failure to bind
//! a listener is fatal; failure to open the port device is fatal only
//! when the configuration requires hardware.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use patrol_core::bezel::BezelPoller;
use patrol_core::ec::{EcManager, EcTransport, PortBus, RawPortBus};
use patrol_core::framing::Role;
use patrol_core::{ActionQueue, PatrolConfig, SecureCodec, SessionTable, SharedSecret};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::dispatch::Dispatcher;
use crate::endpoint::{self, BoundEndpoint, EndpointKind, EndpointShared};
use crate::platform::HostPlatform;

/// Cadence of the idle-session sweep.
const IDLE_SWEEP_PERIOD: Duration = Duration::from_secs(60);

/// Runs the daemon until `shutdown` flips true. The sender half is
/// driven by the signal handler in `main`.
pub async fn run(
    config: PatrolConfig,
    secret: SharedSecret,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    // EC subsystem. Without hardware the daemon still serves the IPC
    // surface; EC requests report the controller unavailable.
    let ec = match RawPortBus::open() {
        Ok(bus) => {
            info!(emi_base = config.emi_base, "port device opened");
            let transport = EcTransport::new(Arc::new(bus) as Arc<dyn PortBus>, config.emi_base);
            Some(Arc::new(EcManager::start(transport)))
        }
        Err(err) if config.require_hardware => {
            return Err(err).context("port device required but unavailable");
        }
        Err(err) => {
            warn!(%err, "running without the EC subsystem");
            None
        }
    };

    let actions = Arc::new(ActionQueue::new());

    // Bezel poller rides on the EC manager; no EC, no poller.
    let mut poller = ec.as_ref().map(|manager| {
        BezelPoller::start(
            Arc::clone(manager),
            Arc::clone(&actions),
            Duration::from_millis(config.bezel_poll_ms),
        )
    });
    let bezel_present = poller
        .as_ref()
        .map_or_else(|| Arc::new(AtomicBool::new(false)), BezelPoller::presence_flag);

    let dispatcher = Dispatcher::new(
        ec,
        Arc::clone(&actions),
        Arc::new(HostPlatform),
        Duration::from_millis(config.ec_timeout_ms),
    )
    .with_bezel_presence(bezel_present);

    let shared = Arc::new(EndpointShared {
        codec: SecureCodec::new(&secret, Role::Server),
        secret,
        dispatcher,
        sessions: SessionTable::new(),
    });

    // Both endpoints must come up; a daemon that cannot listen is not
    // running.
    let control_endpoint =
        BoundEndpoint::bind(EndpointKind::Control, config.control_socket.clone())
            .context("control endpoint failed to start")?;
    let monitor_endpoint =
        BoundEndpoint::bind(EndpointKind::Monitor, config.monitor_socket.clone())
            .context("monitor endpoint failed to start")?;

    let control = tokio::spawn(endpoint::serve(
        control_endpoint,
        Arc::clone(&shared),
        shutdown.clone(),
    ));
    let monitor = tokio::spawn(endpoint::serve(
        monitor_endpoint,
        Arc::clone(&shared),
        shutdown.clone(),
    ));

    // Idle-session sweep.
    let sweep_shared = Arc::clone(&shared);
    let idle_secs = config.session_idle_secs;
    let mut sweep_shutdown = shutdown.clone();
    let sweep = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(IDLE_SWEEP_PERIOD);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    sweep_shared.sessions.sweep_idle(idle_secs);
                }
                changed = sweep_shutdown.changed() => {
                    if changed.is_err() || *sweep_shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    });

    info!(
        control = %config.control_socket.display(),
        monitor = %config.monitor_socket.display(),
        "patrol daemon running"
    );

    // Endpoints run until the shutdown flag flips.
    let (control_result, monitor_result) = tokio::join!(control, monitor);
    control_result.context("control endpoint task panicked")?;
    monitor_result.context("monitor endpoint task panicked")?;
    let _ = sweep.await;

    // Teardown in reverse: the poller stops before the EC worker, which
    // stops when the dispatcher's handle drops with `shared`.
    if let Some(poller) = poller.as_mut() {
        poller.stop();
    }
    drop(poller);
    actions.clear();

    info!("patrol daemon stopped");
    Ok(())
}
