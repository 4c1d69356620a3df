//! Kernel configuration values.
//!
//! `SdkConfig` is set once at initialization. `CameraConfig` is immutable per
//! capture session (changing position or preset requires a session restart).
//! `RecordingConfig` is consumed once per recording session.
//!
//! `SdkConfig::load()` layers a JSON config file (pointed to by
//! `EFFECTS_CONFIG`) under `EFFECTS_*` environment overrides, then validates.

use anyhow::anyhow;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, ErrorCode};

const DEFAULT_LICENSE_TIMEOUT_SECS: u64 = 10;
const DEFAULT_FRAME_RATE: u32 = 30;
const DEFAULT_SESSION_PRESET: &str = "1280x720";

// -------------------- SDK configuration --------------------

#[derive(Debug, Deserialize, Default)]
struct SdkConfigFile {
    api_key: Option<String>,
    debug_logging: Option<bool>,
    face_detection: Option<bool>,
    license_check_timeout_secs: Option<u64>,
    cloud_cache_path: Option<PathBuf>,
}

/// Process-wide SDK configuration. Immutable after `Sdk::initialize`.
#[derive(Debug, Clone)]
pub struct SdkConfig {
    pub api_key: String,
    pub debug_logging: bool,
    pub face_detection_enabled: bool,
    pub license_check_timeout: Duration,
    /// Cache root for cloud filters. If unwritable, the cloud manager
    /// degrades to no-cache mode rather than failing initialization.
    pub cloud_cache_path: Option<PathBuf>,
}

impl SdkConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            debug_logging: false,
            face_detection_enabled: true,
            license_check_timeout: Duration::from_secs(DEFAULT_LICENSE_TIMEOUT_SECS),
            cloud_cache_path: None,
        }
    }

    /// Load from the `EFFECTS_CONFIG` file (if set) and apply environment
    /// overrides, then validate.
    pub fn load() -> anyhow::Result<Self> {
        let config_path = std::env::var("EFFECTS_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()
            .map_err(|e| anyhow!("invalid sdk config: {}", e))?;
        Ok(cfg)
    }

    fn from_file(file: SdkConfigFile) -> Self {
        Self {
            api_key: file.api_key.unwrap_or_default(),
            debug_logging: file.debug_logging.unwrap_or(false),
            face_detection_enabled: file.face_detection.unwrap_or(true),
            license_check_timeout: Duration::from_secs(
                file.license_check_timeout_secs
                    .unwrap_or(DEFAULT_LICENSE_TIMEOUT_SECS),
            ),
            cloud_cache_path: file.cloud_cache_path,
        }
    }

    fn apply_env(&mut self) -> anyhow::Result<()> {
        if let Ok(key) = std::env::var("EFFECTS_API_KEY") {
            if !key.trim().is_empty() {
                self.api_key = key;
            }
        }
        if let Ok(path) = std::env::var("EFFECTS_CACHE_PATH") {
            if !path.trim().is_empty() {
                self.cloud_cache_path = Some(PathBuf::from(path));
            }
        }
        if let Ok(value) = std::env::var("EFFECTS_DEBUG_LOGGING") {
            self.debug_logging = matches!(value.trim(), "1" | "true" | "on");
        }
        if let Ok(timeout) = std::env::var("EFFECTS_LICENSE_TIMEOUT_SECS") {
            let secs: u64 = timeout.parse().map_err(|_| {
                anyhow!("EFFECTS_LICENSE_TIMEOUT_SECS must be an integer number of seconds")
            })?;
            self.license_check_timeout = Duration::from_secs(secs);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.api_key.trim().is_empty() {
            return Err(Error::new(
                ErrorCode::LicenseInvalid,
                "api_key must not be empty",
            ));
        }
        if self.license_check_timeout.is_zero() {
            return Err(Error::invalid_parameter(
                "license_check_timeout must be greater than zero",
            ));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> anyhow::Result<SdkConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

// -------------------- Camera configuration --------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
pub enum CameraPosition {
    Back,
    Front,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
pub enum VideoOrientation {
    Portrait,
    PortraitUpsideDown,
    LandscapeLeft,
    LandscapeRight,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
pub enum FlashMode {
    Off,
    On,
    Auto,
}

/// Per-session capture configuration. A new config requires a session
/// restart; position and preset are never mutated live.
#[derive(Clone, Debug)]
pub struct CameraConfig {
    pub position: CameraPosition,
    pub session_preset: String,
    pub frame_rate: u32,
    pub orientation: VideoOrientation,
    pub mirroring: bool,
    pub flash_mode: FlashMode,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            position: CameraPosition::Front,
            session_preset: DEFAULT_SESSION_PRESET.to_string(),
            frame_rate: DEFAULT_FRAME_RATE,
            orientation: VideoOrientation::Portrait,
            mirroring: true,
            flash_mode: FlashMode::Off,
        }
    }
}

impl CameraConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.frame_rate == 0 || self.frame_rate > 240 {
            return Err(Error::invalid_parameter(format!(
                "frame_rate {} out of range 1..=240",
                self.frame_rate
            )));
        }
        preset_dimensions(&self.session_preset).ok_or_else(|| {
            Error::invalid_parameter(format!(
                "session_preset '{}' is not WIDTHxHEIGHT",
                self.session_preset
            ))
        })?;
        Ok(())
    }

    /// Interval between frames at the configured rate. This is the budget
    /// the synchronous effects path must stay within.
    pub fn frame_interval(&self) -> Duration {
        Duration::from_nanos(1_000_000_000 / u64::from(self.frame_rate))
    }

    pub fn preview_size(&self) -> (u32, u32) {
        preset_dimensions(&self.session_preset).unwrap_or((1280, 720))
    }
}

fn preset_dimensions(preset: &str) -> Option<(u32, u32)> {
    let (w, h) = preset.split_once('x')?;
    Some((w.parse().ok()?, h.parse().ok()?))
}

// -------------------- Recording configuration --------------------

/// Quality presets with their target dimensions and bitrates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
pub enum VideoQuality {
    /// 480p, 1 Mbps
    Low,
    /// 720p, 2.5 Mbps
    Medium,
    /// 1080p, 4 Mbps
    High,
    /// 1080p, 8 Mbps
    Ultra,
}

impl VideoQuality {
    pub fn dimensions(self) -> (u32, u32) {
        match self {
            VideoQuality::Low => (854, 480),
            VideoQuality::Medium => (1280, 720),
            VideoQuality::High | VideoQuality::Ultra => (1920, 1080),
        }
    }

    pub fn bitrate_bps(self) -> u32 {
        match self {
            VideoQuality::Low => 1_000_000,
            VideoQuality::Medium => 2_500_000,
            VideoQuality::High => 4_000_000,
            VideoQuality::Ultra => 8_000_000,
        }
    }
}

/// Per-recording configuration. Immutable for the duration of the session.
#[derive(Clone, Debug)]
pub struct RecordingConfig {
    pub video_quality: VideoQuality,
    pub include_audio: bool,
    /// Zero means unbounded.
    pub max_duration: Duration,
    /// `None` uses the process temp directory.
    pub output_directory: Option<PathBuf>,
    /// `None` inherits the preview size.
    pub video_size: Option<(u32, u32)>,
    /// `None` defaults to 30 fps.
    pub frame_rate: Option<u32>,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            video_quality: VideoQuality::High,
            include_audio: true,
            max_duration: Duration::ZERO,
            output_directory: None,
            video_size: None,
            frame_rate: None,
        }
    }
}

impl RecordingConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if let Some(rate) = self.frame_rate {
            if rate == 0 || rate > 240 {
                return Err(Error::invalid_parameter(format!(
                    "recording frame_rate {} out of range 1..=240",
                    rate
                )));
            }
        }
        if let Some((w, h)) = self.video_size {
            if w == 0 || h == 0 {
                return Err(Error::invalid_parameter("video_size must be non-zero"));
            }
        }
        Ok(())
    }

    pub fn effective_frame_rate(&self) -> u32 {
        self.frame_rate.unwrap_or(DEFAULT_FRAME_RATE)
    }
}
