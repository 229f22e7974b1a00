//! Event system for UI decoupling.
//!
//! The presentation collaborator (progress dialog, alerts) subscribes to
//! flash events without coupling to the protocol core. The core never
//! blocks on an observer.

use std::fmt;

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Coarse phases of a partial flash attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashPhase {
    /// Establishing the link.
    Connecting,
    /// Resolving the partial flashing service and characteristics.
    DiscoveringServices,
    /// Reading the device's region catalog.
    QueryingRegions,
    /// Comparing the image template hash against the device hash.
    CheckingEligibility,
    /// Streaming firmware records.
    Transferring,
    /// Handing off to the full-image update path.
    FallingBack,
    /// Update finished.
    Complete,
    /// Unrecoverable error.
    Error,
}

impl fmt::Display for FlashPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlashPhase::Connecting => write!(f, "Connecting"),
            FlashPhase::DiscoveringServices => write!(f, "Discovering Services"),
            FlashPhase::QueryingRegions => write!(f, "Querying Regions"),
            FlashPhase::CheckingEligibility => write!(f, "Checking Eligibility"),
            FlashPhase::Transferring => write!(f, "Transferring"),
            FlashPhase::FallingBack => write!(f, "Falling Back"),
            FlashPhase::Complete => write!(f, "Complete"),
            FlashPhase::Error => write!(f, "Error"),
        }
    }
}

/// Events emitted by a flash session.
#[derive(Debug, Clone)]
pub enum FlashEvent {
    /// Link established to the device.
    DeviceConnected { address: String },
    /// Link lost.
    DeviceDisconnected,
    /// Phase changed.
    PhaseChanged { from: FlashPhase, to: FlashPhase },
    /// A region descriptor was read from the catalog.
    RegionDiscovered {
        name: String,
        start_address: u32,
        end_address: u32,
        hash: String,
    },
    /// Transfer progress, 0-100.
    Progress { percent: u8 },
    /// Log message.
    Log { level: LogLevel, message: String },
    /// Terminal success with a short user-facing title and message.
    Completed { title: String, message: String },
    /// Terminal failure with a short user-facing title and message.
    Failed { title: String, message: String },
}

/// Observer trait for receiving flash events.
///
/// Implement this trait in your UI layer to receive updates.
pub trait FlashObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &FlashEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl FlashObserver for NullObserver {
    fn on_event(&self, _event: &FlashEvent) {
        // Do nothing
    }
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl FlashObserver for TracingObserver {
    fn on_event(&self, event: &FlashEvent) {
        match event {
            FlashEvent::DeviceConnected { address } => {
                tracing::info!(address = %address, "Device connected");
            }
            FlashEvent::DeviceDisconnected => {
                tracing::warn!("Device disconnected");
            }
            FlashEvent::PhaseChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "Phase changed");
            }
            FlashEvent::RegionDiscovered {
                name,
                start_address,
                end_address,
                hash,
            } => {
                tracing::info!(
                    name = %name,
                    start = %format!("0x{:08X}", start_address),
                    end = %format!("0x{:08X}", end_address),
                    hash = %hash,
                    "Region discovered"
                );
            }
            FlashEvent::Progress { percent } => {
                tracing::debug!(progress = %format!("{}%", percent), "Progress");
            }
            FlashEvent::Log { level, message } => match level {
                LogLevel::Trace => tracing::trace!("{}", message),
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
            FlashEvent::Completed { title, message } => {
                tracing::info!(title = %title, "{}", message);
            }
            FlashEvent::Failed { title, message } => {
                tracing::error!(title = %title, "{}", message);
            }
        }
    }
}
