//! Flash session - high-level orchestrator for one partial update attempt.
//!
//! A session owns the link, the decoder state and a cancellation token
//! for the duration of one attempt; nothing persists across attempts.
//! Running the session drives the phases in order and resolves to an
//! [`Outcome`]: success, a hand-off request for the full-image update
//! path, or a hard failure.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::catalog::{self, MemoryMapClient, RegionDescriptor};
use crate::eligibility::{self, Eligibility};
use crate::error::FlashError;
use crate::events::{FlashEvent, FlashObserver, FlashPhase, LogLevel, TracingObserver};
use crate::hex::HexReader;
use crate::link::{CharId, EventPump, GattLink, LinkError};
use crate::protocol::constants::{
    DEFAULT_RESPONSE_TIMEOUT_MS, FALLBACK_RESUME_PHASE, PACING_DELAY_MS, TARGET_REGION,
};
use crate::transfer::{CancelToken, TransferEngine, TransferStats};

/// Configuration for a flash session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Path to the firmware image (Intel HEX).
    pub image_path: String,
    /// Device address, carried into a fallback request.
    pub device_address: Option<String>,
    /// Device name, carried into a fallback request.
    pub device_name: Option<String>,
    /// Pairing code, carried into a fallback request.
    pub pair_code: Option<u32>,
    /// Per-operation response timeout in milliseconds.
    pub response_timeout_ms: u64,
    /// Delay between unacknowledged packets in milliseconds.
    pub pacing_delay_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            image_path: String::new(),
            device_address: None,
            device_name: None,
            pair_code: None,
            response_timeout_ms: DEFAULT_RESPONSE_TIMEOUT_MS,
            pacing_delay_ms: PACING_DELAY_MS,
        }
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SessionConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    fn pacing_delay(&self) -> Duration {
        Duration::from_millis(self.pacing_delay_ms)
    }
}

/// Why the session is handing off to the full-image update path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackReason {
    /// The device does not expose the partial flashing service.
    ServiceNotSupported,
    /// The catalog has no region to compare against.
    TargetRegionMissing,
    /// The image was built from a different template than the one on
    /// the device.
    NotEligible,
    /// The link failed after local recovery was exhausted.
    LinkFailure(String),
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FallbackReason::ServiceNotSupported => {
                write!(f, "partial flashing service not supported")
            }
            FallbackReason::TargetRegionMissing => write!(f, "target region not present"),
            FallbackReason::NotEligible => write!(f, "image template does not match device"),
            FallbackReason::LinkFailure(msg) => write!(f, "link failure: {msg}"),
        }
    }
}

/// Everything the full-image update path needs to resume with the same
/// device, so the caller never re-runs device selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackRequest {
    pub device_address: Option<String>,
    pub device_name: Option<String>,
    pub pair_code: Option<u32>,
    pub image_path: String,
    /// Phase index at which the full-update flow resumes.
    pub resume_phase: u8,
}

/// Terminal result of one session.
#[derive(Debug)]
pub enum Outcome {
    /// The partial update was applied.
    Succeeded(TransferStats),
    /// The attempt cannot proceed partially; hand off to the full path.
    FallingBack {
        request: FallbackRequest,
        reason: FallbackReason,
    },
    /// Hard failure; neither path should be retried automatically.
    Failed(String),
}

/// Session state, reported alongside events for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    DiscoveringServices,
    QueryingRegions,
    CheckingEligibility,
    Transferring,
    Complete,
    FallingBack,
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "IDLE"),
            SessionState::Connecting => write!(f, "CONNECTING"),
            SessionState::DiscoveringServices => write!(f, "DISCOVERING_SERVICES"),
            SessionState::QueryingRegions => write!(f, "QUERYING_REGIONS"),
            SessionState::CheckingEligibility => write!(f, "CHECKING_ELIGIBILITY"),
            SessionState::Transferring => write!(f, "TRANSFERRING"),
            SessionState::Complete => write!(f, "COMPLETE"),
            SessionState::FallingBack => write!(f, "FALLING_BACK"),
            SessionState::Failed => write!(f, "FAILED"),
        }
    }
}

/// Flash session - orchestrates one complete partial update attempt.
pub struct FlashSession<L: GattLink, O: FlashObserver> {
    config: SessionConfig,
    pump: EventPump<L>,
    observer: Arc<O>,
    state: SessionState,
    phase: FlashPhase,
    cancel: CancelToken,
}

impl<L: GattLink> FlashSession<L, TracingObserver> {
    /// Create a new session with the default tracing observer.
    pub fn new(config: SessionConfig, link: L) -> Self {
        Self::with_observer(config, link, Arc::new(TracingObserver))
    }
}

impl<L: GattLink, O: FlashObserver + 'static> FlashSession<L, O> {
    /// Create a new session with a custom observer.
    pub fn with_observer(config: SessionConfig, link: L, observer: Arc<O>) -> Self {
        Self {
            config,
            pump: EventPump::new(link),
            observer,
            state: SessionState::Idle,
            phase: FlashPhase::Connecting,
            cancel: CancelToken::new(),
        }
    }

    /// Handle for cancelling the attempt from another thread.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Run the attempt to a terminal outcome. The session is consumed;
    /// a retry starts from a fresh session.
    #[instrument(skip(self), fields(image = %self.config.image_path))]
    pub fn run(mut self) -> Result<Outcome> {
        let timeout = self.config.response_timeout();

        // Connect.
        self.enter(SessionState::Connecting, FlashPhase::Connecting);
        if let Err(e) = self.connect(timeout) {
            return Ok(self.fail(format!("connection failed: {e}")));
        }
        self.observer.on_event(&FlashEvent::DeviceConnected {
            address: self
                .config
                .device_address
                .clone()
                .unwrap_or_else(|| "unknown".to_string()),
        });

        // Discover the partial flashing service.
        self.enter(
            SessionState::DiscoveringServices,
            FlashPhase::DiscoveringServices,
        );
        if let Err(e) = self.discover(timeout) {
            warn!(error = %e, "Partial flashing service unavailable");
            return Ok(self.fall_back(FallbackReason::ServiceNotSupported));
        }

        // Region catalog.
        self.enter(SessionState::QueryingRegions, FlashPhase::QueryingRegions);
        let region = match self.query_target_region(timeout) {
            Ok(Some(region)) => region,
            Ok(None) => {
                warn!(region = TARGET_REGION, "Target region not in catalog");
                return Ok(self.fall_back(FallbackReason::TargetRegionMissing));
            }
            Err(e) => return Ok(self.resolve_error(e)),
        };

        // Eligibility: the image template hash must match the region
        // hash on the device, byte for byte.
        self.enter(
            SessionState::CheckingEligibility,
            FlashPhase::CheckingEligibility,
        );
        let (mut hex, total_lines) = match self.prepare_image(&region) {
            Ok(prepared) => prepared,
            Err(e) => return Ok(self.resolve_error(e)),
        };

        // Stream the image.
        self.enter(SessionState::Transferring, FlashPhase::Transferring);
        let mut engine = TransferEngine::new(
            &mut self.pump,
            &mut hex,
            self.observer.as_ref(),
            total_lines,
            timeout,
            self.config.pacing_delay(),
            self.cancel.clone(),
        );
        let stats = match engine.run() {
            Ok(stats) => stats,
            Err(e) => return Ok(self.resolve_error(e)),
        };

        self.enter(SessionState::Complete, FlashPhase::Complete);
        self.observer.on_event(&FlashEvent::Completed {
            title: "Flash Complete".to_string(),
            message: "Restart your device".to_string(),
        });
        self.pump.link_mut().disconnect();
        Ok(Outcome::Succeeded(stats))
    }

    fn connect(&mut self, timeout: Duration) -> Result<(), FlashError> {
        self.pump.link_mut().connect()?;
        self.pump.await_connected(timeout)?;
        Ok(())
    }

    fn discover(&mut self, timeout: Duration) -> Result<(), FlashError> {
        self.pump.link_mut().discover_services()?;
        self.pump.await_services(timeout)?;
        for id in [CharId::MemoryMap, CharId::FlashWrite, CharId::FlashControl] {
            if !self.pump.link().has_characteristic(id) {
                return Err(LinkError::CharacteristicNotFound(id).into());
            }
        }
        Ok(())
    }

    fn query_target_region(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<RegionDescriptor>, FlashError> {
        let regions = MemoryMapClient::new(&mut self.pump, timeout).read_memory_map()?;
        for region in &regions {
            self.observer.on_event(&FlashEvent::RegionDiscovered {
                name: region.name.clone(),
                start_address: region.start_address,
                end_address: region.end_address,
                hash: region.content_hash.clone(),
            });
        }
        Ok(catalog::find_region(&regions, TARGET_REGION).cloned())
    }

    /// Open the image, extract its metadata, and compare hashes. On
    /// success the reader is positioned at the bookmark preceding the
    /// metadata marker, ready for the transfer engine.
    fn prepare_image(
        &mut self,
        region: &RegionDescriptor,
    ) -> Result<(HexReader<std::io::BufReader<std::fs::File>>, usize), FlashError> {
        let mut hex = HexReader::open(&self.config.image_path)?;
        let metadata = hex.read_metadata()?;
        info!(
            template = %metadata.template_hash,
            program = %metadata.program_hash,
            device = %region.content_hash,
            "Comparing image template against device region"
        );

        match eligibility::check(&metadata.template_hash, &region.content_hash) {
            Eligibility::Eligible => {}
            Eligibility::NotEligible => return Err(FlashError::NotEligible),
        }

        let total = HexReader::count_lines(&self.config.image_path)?;
        let total_lines = total.saturating_sub(metadata.lines_to_marker);
        self.observer.on_event(&FlashEvent::Log {
            level: LogLevel::Info,
            message: format!("Image eligible, streaming {total_lines} lines"),
        });
        Ok((hex, total_lines))
    }

    /// Route a mid-attempt error to the fallback path or a hard fail.
    fn resolve_error(&mut self, error: FlashError) -> Outcome {
        if matches!(error, FlashError::Link(LinkError::Disconnected)) {
            self.observer.on_event(&FlashEvent::DeviceDisconnected);
        }
        match error {
            FlashError::NotEligible => self.fall_back(FallbackReason::NotEligible),
            e if e.is_fallback_candidate() => {
                self.fall_back(FallbackReason::LinkFailure(e.to_string()))
            }
            e => self.fail(e.to_string()),
        }
    }

    fn fall_back(&mut self, reason: FallbackReason) -> Outcome {
        self.enter(SessionState::FallingBack, FlashPhase::FallingBack);
        self.observer.on_event(&FlashEvent::Failed {
            title: "Partial Update Unavailable".to_string(),
            message: reason.to_string(),
        });
        self.pump.link_mut().disconnect();
        Outcome::FallingBack {
            request: FallbackRequest {
                device_address: self.config.device_address.clone(),
                device_name: self.config.device_name.clone(),
                pair_code: self.config.pair_code,
                image_path: self.config.image_path.clone(),
                resume_phase: FALLBACK_RESUME_PHASE,
            },
            reason,
        }
    }

    fn fail(&mut self, message: String) -> Outcome {
        self.enter(SessionState::Failed, FlashPhase::Error);
        self.observer.on_event(&FlashEvent::Failed {
            title: "Flash Error".to_string(),
            message: "Try again or flash via USB".to_string(),
        });
        self.pump.link_mut().disconnect();
        Outcome::Failed(message)
    }

    fn enter(&mut self, state: SessionState, phase: FlashPhase) {
        if self.phase != phase {
            self.observer.on_event(&FlashEvent::PhaseChanged {
                from: self.phase,
                to: phase,
            });
        }
        self.state = state;
        self.phase = phase;
        info!(state = %state, "Session state");
    }
}
