//! Logging initialization and telemetry forwarding.
//!
//! Telemetry is chosen once from configuration: an enabled forwarder when a
//! project token is available, otherwise a no-op. Callers hold a
//! [`Telemetry`] value and call [`Telemetry::capture`] unconditionally.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::TelemetryConfig;

/// Install the global `tracing` subscriber at `log_level`.
///
/// Unknown levels fall back to `info`. Calling this more than once is
/// harmless; later calls leave the first subscriber in place.
pub fn init_logging(log_level: &str) {
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .try_init()
        .is_ok();
    if installed {
        info!(log_level, "logging initialized");
    }
}

/// One captured telemetry event.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetryEvent {
    pub name: String,
    pub properties: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

/// Buffers events for the host to ship.
#[derive(Debug)]
pub struct TelemetryForwarder {
    token: String,
    events: Mutex<Vec<TelemetryEvent>>,
}

impl TelemetryForwarder {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    fn push(&self, event: TelemetryEvent) {
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        events.push(event);
    }

    /// Take every buffered event, oldest first.
    pub fn drain(&self) -> Vec<TelemetryEvent> {
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *events)
    }
}

#[derive(Debug, Clone, Default)]
pub enum Telemetry {
    #[default]
    Disabled,
    Enabled(Arc<TelemetryForwarder>),
}

impl Telemetry {
    /// Build telemetry from resolved configuration.
    pub fn from_config(config: &TelemetryConfig) -> Self {
        if !config.enabled {
            return Self::Disabled;
        }
        match config.token.as_deref() {
            Some(token) if !token.is_empty() => {
                info!("telemetry enabled");
                Self::Enabled(Arc::new(TelemetryForwarder::new(token)))
            }
            _ => {
                warn!("telemetry token is not set, telemetry will not be initialized");
                Self::Disabled
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, Self::Enabled(_))
    }

    /// Record an event. A no-op when disabled.
    pub fn capture(&self, name: &str, properties: Map<String, Value>) {
        let Self::Enabled(forwarder) = self else {
            return;
        };
        tracing::debug!(target: "lixmerge::telemetry", event = name, "captured");
        forwarder.push(TelemetryEvent {
            name: name.to_string(),
            properties,
            timestamp: Utc::now(),
        });
    }

    /// Buffered events; always empty when disabled.
    pub fn drain(&self) -> Vec<TelemetryEvent> {
        match self {
            Self::Enabled(forwarder) => forwarder.drain(),
            Self::Disabled => Vec::new(),
        }
    }
}
