#![warn(missing_docs)]
//! Bettercontrol main components and helper functions used by `main`
use anyhow::{Context, Result};
use tracing::{debug, info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter};

pub mod action;
pub mod audio;
pub mod battery;
pub mod bluetooth;
pub mod brightness;
pub mod command;
pub mod config;
pub mod model;
pub mod power;
pub mod registry;
pub mod scan;
pub mod secret;
pub mod session;
pub mod settings;
pub mod shutdown;
pub mod wifi;

pub use action::{Action, ActionDispatcher, ActionError};
pub use command::{CommandResult, CommandRunner, ExternalCommand, SystemCommandRunner};
pub use config::{AppConfig, Args};
pub use model::Domain;
pub use scan::{ScanCoordinator, ScanEvent};
pub use secret::Secret;
pub use session::Session;
pub use shutdown::ShutdownSignal;

/// Setup logging to stderr
/// (Tracing is a bit more involving to set up but will provide much more feature if needed)
pub fn setup_tracing(args: &Args) -> Result<()> {
    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);
    let filter_layer =
        EnvFilter::try_new(args.verbose.get_level_filter()).context("Initializing log filter")?;

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();
    Ok(())
}

fn log_event(event: &ScanEvent) {
    match event {
        ScanEvent::Updated { domain, count, .. } => debug!("{}: {} entries", domain, count),
        ScanEvent::Failed { domain, reason, .. } => warn!("{} refresh failed: {}", domain, reason),
        ScanEvent::Discarded { .. } => {}
    }
}

/// Refresh every domain, hand the result to `on_tick`, then sleep
/// `refresh_delay` and start over.
///
/// Stops after the first round when `once` is set, or as soon as `shutdown`
/// is requested.
pub fn watch_loop<F>(
    session: &Session,
    shutdown: &ShutdownSignal,
    once: bool,
    mut on_tick: F,
) -> Result<()>
where
    F: FnMut(&Session, &[ScanEvent]) -> Result<()>,
{
    let config = session.config();
    let patience = config.scan_timeout + config.bluetooth_scan;
    info!("Refreshing every {:?}", config.refresh_delay);
    while !shutdown.is_requested() {
        session.refresh_all();
        let events = session.wait_idle(patience);
        events.iter().for_each(log_event);
        on_tick(session, &events)?;
        if once || shutdown.wait(config.refresh_delay) {
            break;
        }
    }
    info!("Watch loop stopped");
    Ok(())
}
