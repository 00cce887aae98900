use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tracing::info;

use crate::error::NarratorError;
use crate::scene::Viewport;

/// Environment variable consulted when `remote.api_key` is not set.
pub const API_KEY_ENV: &str = "OPENAI_API_KEY";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NarratorConfig {
    pub vision: VisionConfig,
    pub remote: RemoteModelConfig,
    pub rate_limit: RateLimitConfig,
    pub sampling: SamplingConfig,
    pub heuristics: HeuristicsConfig,
    pub commentary: CommentaryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VisionConfig {
    /// Viewport width the detector's boxes are expressed in
    pub width: u32,
    /// Viewport height the detector's boxes are expressed in
    pub height: u32,
    /// Object detection confidence threshold
    pub confidence_threshold: f32,
    /// Detections kept per frame, strongest first
    pub max_detections: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteModelConfig {
    /// OpenAI-compatible API root, e.g. https://api.openai.com/v1
    pub base_url: String,
    /// Leave unset to fall back to OPENAI_API_KEY
    pub api_key: Option<String>,
    pub model_name: String,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_tokens: Option<usize>,
    pub timeout_seconds: Option<u64>,
    /// Whether frames may be attached as images
    pub supports_vision: bool,
    pub additional_headers: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Provider token budget per window
    pub tokens_per_minute: u32,
    /// Fraction of the budget after which dispatch pauses until the window resets
    pub cooldown_threshold: f64,
    pub max_retries: u32,
    pub backoff_floor_ms: u64,
    pub backoff_ceiling_ms: u64,
    /// Minimum gap between consecutive dispatches
    pub min_spacing_ms: u64,
    pub window_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Minimum gap between description requests
    pub commentary_interval_ms: u64,
    /// Minimum gap between heuristic/overlay refreshes
    pub overlay_interval_ms: u64,
    /// Pace of the replay loop
    pub frame_interval_ms: u64,
    /// Undelivered descriptions allowed before commentary slots are skipped
    pub max_pending_commentary: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeuristicsConfig {
    /// Per-axis displacement that counts as movement
    pub motion_threshold_px: f32,
    pub sudden_speed_px_per_sec: f32,
    pub proximity_threshold_px: f32,
    /// Positions older than this are forgotten
    pub history_window_ms: u64,
    pub identity_match_radius_px: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommentaryConfig {
    pub system_prompt: String,
    pub scenic_prompt: String,
    /// Describe scenery instead of people
    pub scenic_mode: bool,
    /// Attach the sampled frame to description requests
    pub attach_frames: bool,
    /// Longest edge of attached frames
    pub max_frame_dimension: u32,
    /// Previous descriptions included in the prompt
    pub history_size: usize,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            confidence_threshold: 0.5,
            max_detections: 20,
        }
    }
}

impl Default for RemoteModelConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model_name: "gpt-4o-mini".to_string(),
            temperature: Some(0.7),
            top_p: None,
            max_tokens: Some(150),
            timeout_seconds: Some(30),
            supports_vision: true,
            additional_headers: None,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            tokens_per_minute: 10_000,
            cooldown_threshold: 0.8,
            max_retries: 3,
            backoff_floor_ms: 1_000,
            backoff_ceiling_ms: 60_000,
            min_spacing_ms: 1_000,
            window_ms: 60_000,
        }
    }
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            commentary_interval_ms: 10_000,
            overlay_interval_ms: 150,
            frame_interval_ms: 33,
            max_pending_commentary: 2,
        }
    }
}

impl Default for HeuristicsConfig {
    fn default() -> Self {
        Self {
            motion_threshold_px: 10.0,
            sudden_speed_px_per_sec: 500.0,
            proximity_threshold_px: 100.0,
            history_window_ms: 2_000,
            identity_match_radius_px: 80.0,
        }
    }
}

impl Default for CommentaryConfig {
    fn default() -> Self {
        Self {
            system_prompt: include_str!("../prompts/system_prompt.txt").to_string(),
            scenic_prompt: include_str!("../prompts/scenic_prompt.txt").to_string(),
            scenic_mode: false,
            attach_frames: true,
            max_frame_dimension: 512,
            history_size: 5,
        }
    }
}

impl SamplingConfig {
    pub fn commentary_interval(&self) -> Duration {
        Duration::from_millis(self.commentary_interval_ms)
    }

    pub fn overlay_interval(&self) -> Duration {
        Duration::from_millis(self.overlay_interval_ms)
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }
}

impl VisionConfig {
    pub fn viewport(&self) -> Viewport {
        Viewport::new(self.width as f32, self.height as f32)
    }
}

impl NarratorConfig {
    /// Reads the TOML file (writing defaults first if it does not exist),
    /// then applies `NARRATOR__SECTION__KEY` environment overrides.
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            let default_config = Self::default();
            let toml_content = toml::to_string_pretty(&default_config)?;
            fs::write(path, toml_content).await?;
            info!("Wrote default configuration to {}", path.display());
        }

        let settings = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Toml))
            .add_source(
                config::Environment::with_prefix("NARRATOR")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("Failed to read configuration from {}", path.display()))?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub async fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content).await?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), NarratorError> {
        let rate = &self.rate_limit;
        if rate.tokens_per_minute == 0 {
            return Err(NarratorError::config("rate_limit.tokens_per_minute must be positive"));
        }
        if !(rate.cooldown_threshold > 0.0 && rate.cooldown_threshold <= 1.0) {
            return Err(NarratorError::config("rate_limit.cooldown_threshold must be in (0, 1]"));
        }
        if rate.backoff_floor_ms == 0 || rate.backoff_floor_ms > rate.backoff_ceiling_ms {
            return Err(NarratorError::config(
                "rate_limit.backoff_floor_ms must be positive and not above backoff_ceiling_ms",
            ));
        }
        if rate.window_ms == 0 {
            return Err(NarratorError::config("rate_limit.window_ms must be positive"));
        }
        if self.sampling.commentary_interval_ms == 0 || self.sampling.overlay_interval_ms == 0 {
            return Err(NarratorError::config("sampling intervals must be positive"));
        }
        if self.sampling.max_pending_commentary == 0 {
            return Err(NarratorError::config("sampling.max_pending_commentary must be positive"));
        }
        if self.vision.width == 0 || self.vision.height == 0 {
            return Err(NarratorError::config("vision.width and vision.height must be positive"));
        }
        Ok(())
    }

    /// The provider credential: config first, then `OPENAI_API_KEY`. A blank
    /// value counts as unset. `None` routes every description to the local fallback.
    pub fn resolve_api_key(&self) -> Option<String> {
        fn usable(key: &str) -> Option<String> {
            let key = key.trim();
            (!key.is_empty()).then(|| key.to_string())
        }

        self.remote
            .api_key
            .as_deref()
            .and_then(usable)
            .or_else(|| std::env::var(API_KEY_ENV).ok().as_deref().and_then(usable))
    }
}
