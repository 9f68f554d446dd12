use std::path::PathBuf;
use std::str::FromStr;

/// Whether providers hit real services or run as in-process mocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProviderMode {
    Mock,
    #[default]
    Real,
}

impl std::fmt::Display for ProviderMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderMode::Mock => write!(f, "mock"),
            ProviderMode::Real => write!(f, "real"),
        }
    }
}

impl FromStr for ProviderMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mock" => Ok(ProviderMode::Mock),
            "real" => Ok(ProviderMode::Real),
            _ => Err(format!("Unknown provider mode: {}", s)),
        }
    }
}

/// Model names used for the three LLM operations, individually overridable.
#[derive(Debug, Clone)]
pub struct LlmModels {
    pub expand: String,
    pub refine: String,
    pub combine: String,
}

impl Default for LlmModels {
    fn default() -> Self {
        Self {
            expand: "gpt-4o-mini".to_string(),
            refine: "gpt-4o-mini".to_string(),
            combine: "gpt-4o-mini".to_string(),
        }
    }
}

/// Process-wide settings resolved once at startup: CLI flags override env,
/// env overrides defaults.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub provider_mode: ProviderMode,
    /// Root for date-partitioned session directories and the index database.
    pub root: PathBuf,
    /// Directory holding per-service port files and STOP_LOCK markers.
    pub services_dir: PathBuf,
    pub ensemble_size: usize,
    pub gpu_cleanup_delay_ms: u64,
    pub health_check_timeout_ms: u64,
    pub openai_api_key: Option<String>,
    pub llm_models: LlmModels,
    pub flux_steps: u32,
    pub flux_guidance: f64,
    pub image_width: u32,
    pub image_height: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let root = default_root();
        Self {
            provider_mode: ProviderMode::Real,
            services_dir: root.join("services"),
            root,
            ensemble_size: 3,
            gpu_cleanup_delay_ms: 3_000,
            health_check_timeout_ms: 30_000,
            openai_api_key: None,
            llm_models: LlmModels::default(),
            flux_steps: 28,
            flux_guidance: 3.5,
            image_width: 1024,
            image_height: 1024,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let root = non_empty_env("BEAMGEN_ROOT")
            .map(PathBuf::from)
            .unwrap_or(defaults.root);

        Self {
            provider_mode: env_parse("PROVIDER_MODE", defaults.provider_mode),
            services_dir: non_empty_env("BEAMGEN_SERVICES_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| root.join("services")),
            root,
            ensemble_size: env_parse("ENSEMBLE_SIZE", defaults.ensemble_size),
            gpu_cleanup_delay_ms: env_parse("GPU_CLEANUP_DELAY_MS", defaults.gpu_cleanup_delay_ms)
                .clamp(2_000, 5_000),
            health_check_timeout_ms: env_parse(
                "MODEL_HEALTH_CHECK_TIMEOUT_MS",
                defaults.health_check_timeout_ms,
            ),
            openai_api_key: non_empty_env("OPENAI_API_KEY"),
            llm_models: LlmModels {
                expand: non_empty_env("OPENAI_LLM_MODEL_EXPAND")
                    .unwrap_or(defaults.llm_models.expand),
                refine: non_empty_env("OPENAI_LLM_MODEL_REFINE")
                    .unwrap_or(defaults.llm_models.refine),
                combine: non_empty_env("OPENAI_LLM_MODEL_COMBINE")
                    .unwrap_or(defaults.llm_models.combine),
            },
            flux_steps: env_parse("FLUX_STEPS", defaults.flux_steps),
            flux_guidance: env_parse("FLUX_GUIDANCE", defaults.flux_guidance),
            image_width: env_parse("IMAGE_WIDTH", defaults.image_width),
            image_height: env_parse("IMAGE_HEIGHT", defaults.image_height),
        }
    }
}

/// Default data root, mirroring the archive layout under the home directory.
fn default_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("media")
        .join("beamgen")
}

/// Read an env var, treating empty or whitespace-only values as unset.
pub fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

/// Parse an env var, falling back to the default on absence or bad input.
pub fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    non_empty_env(name)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_mode_parses() {
        assert_eq!("mock".parse::<ProviderMode>().unwrap(), ProviderMode::Mock);
        assert_eq!("REAL".parse::<ProviderMode>().unwrap(), ProviderMode::Real);
        assert!("fake".parse::<ProviderMode>().is_err());
    }

    #[test]
    fn env_parse_falls_back_on_garbage() {
        std::env::set_var("BEAMGEN_TEST_PARSE", "not-a-number");
        assert_eq!(env_parse("BEAMGEN_TEST_PARSE", 7usize), 7);
        std::env::set_var("BEAMGEN_TEST_PARSE", "12");
        assert_eq!(env_parse("BEAMGEN_TEST_PARSE", 7usize), 12);
        std::env::remove_var("BEAMGEN_TEST_PARSE");
    }

    #[test]
    fn blank_env_values_are_unset() {
        std::env::set_var("BEAMGEN_TEST_BLANK", "   ");
        assert_eq!(non_empty_env("BEAMGEN_TEST_BLANK"), None);
        std::env::remove_var("BEAMGEN_TEST_BLANK");
    }

    #[test]
    fn cleanup_delay_is_clamped_to_spec_window() {
        std::env::set_var("GPU_CLEANUP_DELAY_MS", "60000");
        let config = EngineConfig::from_env();
        assert_eq!(config.gpu_cleanup_delay_ms, 5_000);
        std::env::remove_var("GPU_CLEANUP_DELAY_MS");
    }
}
