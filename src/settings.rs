use crate::analysis::{
    AnalysisPlan, DEFAULT_BASE_URL, DEFAULT_MODEL, DEFAULT_SYSTEM_PROMPT, plan_analysis,
};
use crate::coordinator::{CoordinatorConfig, DEFAULT_SETTLE_DELAY};
use crate::encode::{CropRegion, DEFAULT_JPEG_QUALITY};
use crate::review::ReviewMode;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_REDIRECT_DELAY: Duration = Duration::from_secs(3);
/// Below this the compositor has not reliably produced a frame yet.
pub const MIN_SETTLE_DELAY: Duration = Duration::from_millis(150);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub analysis: AnalysisSettings,
    #[serde(default)]
    pub capture: CaptureSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisSettings {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_prompt")]
    pub prompt: String,
    /// Vision model that transcribes captures for a text-only `model`.
    #[serde(default)]
    pub extraction_model: Option<String>,
    /// `auto` sends every capture; `confirm` waits for the user.
    #[serde(default)]
    pub review: ReviewMode,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_base_url(),
            model: default_model(),
            prompt: default_prompt(),
            extraction_model: None,
            review: ReviewMode::default(),
        }
    }
}

impl AnalysisSettings {
    pub fn api_key(&self) -> Option<&str> {
        self.api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
    }

    pub fn extraction_model(&self) -> Option<&str> {
        self.extraction_model
            .as_deref()
            .map(str::trim)
            .filter(|model| !model.is_empty())
    }

    /// Fails with a user-facing message when `model` cannot read images.
    pub fn plan(&self) -> Result<AnalysisPlan> {
        plan_analysis(self.model.trim(), self.extraction_model())
    }

    pub fn normalized_base_url(&self) -> &str {
        let trimmed = self.base_url.trim().trim_end_matches('/');
        if trimmed.is_empty() {
            DEFAULT_BASE_URL
        } else {
            trimmed
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureSettings {
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    #[serde(default = "default_redirect_delay_ms")]
    pub redirect_delay_ms: u64,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    #[serde(default)]
    pub crop: Option<CropRegion>,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            settle_delay_ms: default_settle_delay_ms(),
            redirect_delay_ms: default_redirect_delay_ms(),
            jpeg_quality: default_jpeg_quality(),
            crop: None,
        }
    }
}

impl CaptureSettings {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms).max(MIN_SETTLE_DELAY)
    }

    pub fn redirect_delay(&self) -> Duration {
        Duration::from_millis(self.redirect_delay_ms)
    }
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_prompt() -> String {
    DEFAULT_SYSTEM_PROMPT.to_string()
}

fn default_settle_delay_ms() -> u64 {
    DEFAULT_SETTLE_DELAY.as_millis() as u64
}

fn default_redirect_delay_ms() -> u64 {
    DEFAULT_REDIRECT_DELAY.as_millis() as u64
}

fn default_jpeg_quality() -> u8 {
    DEFAULT_JPEG_QUALITY
}

impl Settings {
    /// Reads `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read settings {}", path.display()))?;
        toml::from_str(&text).with_context(|| {
            format!(
                "failed to parse settings {} (expected TOML)",
                path.display()
            )
        })
    }

    /// `OPENAI_API_KEY` and `OPENAI_BASE_URL` take precedence over the file.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(
            std::env::var("OPENAI_API_KEY").ok(),
            std::env::var("OPENAI_BASE_URL").ok(),
        )
    }

    fn with_overrides(mut self, api_key: Option<String>, base_url: Option<String>) -> Self {
        if let Some(key) = api_key.filter(|key| !key.trim().is_empty()) {
            self.analysis.api_key = Some(key);
        }
        if let Some(url) = base_url.filter(|url| !url.trim().is_empty()) {
            self.analysis.base_url = url;
        }
        self
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            settle_delay: self.capture.settle_delay(),
            jpeg_quality: self.capture.jpeg_quality.clamp(1, 100),
            crop: self.capture.crop,
        }
    }
}

const SAMPLE_SETTINGS: &str = r#"# snaplens settings
#
# OPENAI_API_KEY / OPENAI_BASE_URL in the environment override [analysis].

[analysis]
# api_key = "sk-..."
base_url = "https://api.openai.com/v1"
# Vision models: gpt-4o, gpt-4o-mini, gpt-4-turbo. Text-only models such as
# o1, o1-mini and o3-mini need extraction_model to read the capture first.
model = "gpt-4o"
# extraction_model = "gpt-4o-mini"
# "confirm" holds each capture until you send, crop or discard it.
review = "auto"

[capture]
# Wait between starting the mirror and reading a frame (minimum 150).
settle_delay_ms = 300
# Delay before capturing when triggered from the tray, so you can switch apps.
redirect_delay_ms = 3000
jpeg_quality = 85
# Keep only part of the display (pixels from the top-left corner).
# crop = { x = 0, y = 0, width = 1200, height = 800 }
"#;

/// Writes a commented sample unless a settings file already exists. Returns
/// whether a file was created.
pub fn ensure_sample_settings(path: &Path) -> Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).with_context(|| {
            format!("failed to create settings directory {}", parent.display())
        })?;
    }
    std::fs::write(path, SAMPLE_SETTINGS)
        .with_context(|| format!("failed to write sample settings {}", path.display()))?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::{Settings, ensure_sample_settings};
    use crate::analysis::AnalysisPlan;
    use crate::encode::CropRegion;
    use crate::review::ReviewMode;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn missing_file_uses_defaults() {
        let temp = tempdir().expect("tempdir");
        let settings = Settings::load(&temp.path().join("settings.toml")).expect("load");
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.analysis.model, "gpt-4o");
        assert_eq!(settings.capture.redirect_delay(), Duration::from_secs(3));
        assert_eq!(
            settings.coordinator_config().settle_delay,
            Duration::from_millis(300)
        );
        assert!(settings.analysis.api_key().is_none());
    }

    #[test]
    fn sample_settings_parse_to_defaults() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("nested").join("settings.toml");
        assert!(ensure_sample_settings(&path).expect("create"));
        assert!(!ensure_sample_settings(&path).expect("keep existing"));

        let settings = Settings::load(&path).expect("load");
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn partial_file_and_clamping() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("settings.toml");
        std::fs::write(
            &path,
            "[analysis]\nbase_url = \"http://localhost:8080/v1//\"\napi_key = \"  \"\n\n[capture]\nsettle_delay_ms = 20\njpeg_quality = 0\n",
        )
        .expect("write");

        let settings = Settings::load(&path).expect("load");
        assert_eq!(
            settings.analysis.normalized_base_url(),
            "http://localhost:8080/v1"
        );
        assert!(settings.analysis.api_key().is_none());
        let config = settings.coordinator_config();
        assert_eq!(config.settle_delay, Duration::from_millis(150));
        assert_eq!(config.jpeg_quality, 1);
        assert_eq!(settings.capture.redirect_delay_ms, 3000);
    }

    #[test]
    fn overrides_replace_file_values() {
        let settings = Settings::default().with_overrides(
            Some("sk-env".to_string()),
            Some("https://proxy.example/v1/".to_string()),
        );
        assert_eq!(settings.analysis.api_key(), Some("sk-env"));
        assert_eq!(
            settings.analysis.normalized_base_url(),
            "https://proxy.example/v1"
        );

        let untouched = Settings::default().with_overrides(Some(String::new()), None);
        assert!(untouched.analysis.api_key.is_none());
    }

    #[test]
    fn malformed_settings_are_an_error() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("settings.toml");
        std::fs::write(&path, "[capture]\njpeg_quality = \"high\"\n").expect("write");
        assert!(Settings::load(&path).is_err());
    }

    #[test]
    fn review_crop_and_model_plan() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("settings.toml");
        std::fs::write(
            &path,
            "[analysis]\nmodel = \"o1\"\nextraction_model = \" gpt-4o-mini \"\nreview = \"confirm\"\n\n[capture]\ncrop = { x = 10, y = 20, width = 300, height = 200 }\n",
        )
        .expect("write");

        let settings = Settings::load(&path).expect("load");
        assert_eq!(settings.analysis.review, ReviewMode::Confirm);
        assert_eq!(
            settings.coordinator_config().crop,
            Some(CropRegion {
                x: 10,
                y: 20,
                width: 300,
                height: 200,
            })
        );
        assert_eq!(
            settings.analysis.plan().expect("reader configured"),
            AnalysisPlan::Transcribed {
                reader: "gpt-4o-mini".to_string(),
                model: "o1".to_string(),
            }
        );

        let mut text_only = settings.clone();
        text_only.analysis.extraction_model = None;
        let err = text_only.analysis.plan().expect_err("o1 cannot read images");
        assert!(err.to_string().contains("cannot read images"));
    }
}
