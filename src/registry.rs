use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::config::{EngineConfig, ProviderMode};
use crate::critique::CritiqueModel;
use crate::error::EngineError;
use crate::gpu::{GpuCoordinator, ServiceKind};
use crate::providers::local::LocalProvider;
use crate::providers::mock::{MockComparator, MockImage, MockLlm, MockVision};
use crate::providers::openai::OpenAiProvider;
use crate::providers::{
    ImageProvider, LlmProvider, PairwiseComparator, PromptRewriter, VisionProvider,
};

/// Concrete backing for one capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderBackend {
    OpenAi,
    Local,
    Mock,
}

impl std::fmt::Display for ProviderBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderBackend::OpenAi => write!(f, "openai"),
            ProviderBackend::Local => write!(f, "local"),
            ProviderBackend::Mock => write!(f, "mock"),
        }
    }
}

impl std::str::FromStr for ProviderBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "openai" | "cloud" => Ok(ProviderBackend::OpenAi),
            "local" | "selfhosted" => Ok(ProviderBackend::Local),
            "mock" => Ok(ProviderBackend::Mock),
            _ => Err(format!("Unknown provider backend: {}", s)),
        }
    }
}

/// Which backend serves each capability. `ranking` is the pairwise
/// comparator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSelection {
    pub llm: ProviderBackend,
    pub image: ProviderBackend,
    pub vision: ProviderBackend,
    pub ranking: ProviderBackend,
}

impl ProviderSelection {
    pub fn all(backend: ProviderBackend) -> Self {
        Self {
            llm: backend,
            image: backend,
            vision: backend,
            ranking: backend,
        }
    }
}

/// The resolved set of live providers handed to the scheduler.
pub struct ProviderSet {
    pub llm: Arc<dyn LlmProvider>,
    pub rewriter: Arc<dyn PromptRewriter>,
    pub critic: Arc<dyn CritiqueModel>,
    pub image: Arc<dyn ImageProvider>,
    pub vision: Arc<dyn VisionProvider>,
    pub comparator: Arc<dyn PairwiseComparator>,
}

struct Active {
    selection: ProviderSelection,
    set: Arc<ProviderSet>,
}

/// Process-wide mutable provider selection. Switches go through a validity
/// gate: a local backend must answer its health probe before it is adopted,
/// so a bad switch can never strand a running session.
pub struct ProviderRegistry {
    config: EngineConfig,
    coordinator: Arc<GpuCoordinator>,
    inner: RwLock<Active>,
}

impl ProviderRegistry {
    pub fn new(
        config: EngineConfig,
        coordinator: Arc<GpuCoordinator>,
    ) -> Result<Self, EngineError> {
        let selection = default_selection(&config);
        let set = build_set(&config, &coordinator, selection)?;
        Ok(Self {
            config,
            coordinator,
            inner: RwLock::new(Active {
                selection,
                set: Arc::new(set),
            }),
        })
    }

    pub fn current(&self) -> Arc<ProviderSet> {
        self.inner
            .read()
            .expect("provider registry poisoned")
            .set
            .clone()
    }

    pub fn selection(&self) -> ProviderSelection {
        self.inner
            .read()
            .expect("provider registry poisoned")
            .selection
    }

    /// Validate and adopt a new selection, returning the one it replaced.
    pub async fn switch(
        &self,
        selection: ProviderSelection,
    ) -> Result<ProviderSelection, EngineError> {
        self.validate(selection).await?;
        let set = build_set(&self.config, &self.coordinator, selection)?;

        let mut inner = self.inner.write().expect("provider registry poisoned");
        let prior = inner.selection;
        inner.selection = selection;
        inner.set = Arc::new(set);
        tracing::info!(?prior, ?selection, "provider selection switched");
        Ok(prior)
    }

    async fn validate(&self, selection: ProviderSelection) -> Result<(), EngineError> {
        let gates = [
            (selection.llm, ServiceKind::Llm),
            (selection.image, ServiceKind::Image),
            (selection.vision, ServiceKind::Vision),
            (selection.ranking, ServiceKind::Vlm),
        ];

        for (backend, service) in gates {
            if backend == ProviderBackend::Local {
                self.coordinator.check_health(service).await.map_err(|e| {
                    EngineError::unavailable(format!(
                        "cannot switch {service} to local provider: {e}"
                    ))
                })?;
            }
        }
        Ok(())
    }
}

fn default_selection(config: &EngineConfig) -> ProviderSelection {
    match config.provider_mode {
        ProviderMode::Mock => ProviderSelection::all(ProviderBackend::Mock),
        ProviderMode::Real => ProviderSelection {
            // Prompt work goes to the cloud when a key is present; image and
            // vision models run on the local GPU.
            llm: if config.openai_api_key.is_some() {
                ProviderBackend::OpenAi
            } else {
                ProviderBackend::Local
            },
            image: ProviderBackend::Local,
            vision: ProviderBackend::Local,
            ranking: ProviderBackend::Local,
        },
    }
}

fn build_set(
    config: &EngineConfig,
    coordinator: &Arc<GpuCoordinator>,
    selection: ProviderSelection,
) -> Result<ProviderSet, EngineError> {
    let local = Arc::new(LocalProvider::new(coordinator.clone(), config));
    let openai = || OpenAiProvider::from_config(config).map(Arc::new);

    let (llm, rewriter, critic): (
        Arc<dyn LlmProvider>,
        Arc<dyn PromptRewriter>,
        Arc<dyn CritiqueModel>,
    ) = match selection.llm {
        ProviderBackend::OpenAi => {
            let provider = openai()?;
            (provider.clone(), provider.clone(), provider)
        }
        ProviderBackend::Local => (local.clone(), local.clone(), local.clone()),
        ProviderBackend::Mock => {
            let provider = Arc::new(MockLlm::new());
            (provider.clone(), provider.clone(), provider)
        }
    };

    let image: Arc<dyn ImageProvider> = match selection.image {
        ProviderBackend::OpenAi => openai()?,
        ProviderBackend::Local => local.clone(),
        ProviderBackend::Mock => Arc::new(MockImage::new()),
    };

    let vision: Arc<dyn VisionProvider> = match selection.vision {
        ProviderBackend::OpenAi => openai()?,
        ProviderBackend::Local => local.clone(),
        ProviderBackend::Mock => Arc::new(MockVision::new()),
    };

    let comparator: Arc<dyn PairwiseComparator> = match selection.ranking {
        ProviderBackend::OpenAi => openai()?,
        ProviderBackend::Local => local,
        ProviderBackend::Mock => Arc::new(MockComparator::new()),
    };

    Ok(ProviderSet {
        llm,
        rewriter,
        critic,
        image,
        vision,
        comparator,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::ServiceKind;

    fn mock_config(dir: &std::path::Path) -> EngineConfig {
        EngineConfig {
            provider_mode: ProviderMode::Mock,
            services_dir: dir.to_path_buf(),
            health_check_timeout_ms: 200,
            ..EngineConfig::default()
        }
    }

    #[test]
    fn backend_parses_aliases() {
        assert_eq!(
            "selfhosted".parse::<ProviderBackend>().unwrap(),
            ProviderBackend::Local
        );
        assert_eq!(
            "cloud".parse::<ProviderBackend>().unwrap(),
            ProviderBackend::OpenAi
        );
        assert!("none".parse::<ProviderBackend>().is_err());
    }

    #[tokio::test]
    async fn mock_mode_selects_mock_everywhere() {
        let dir = tempfile::tempdir().unwrap();
        let config = mock_config(dir.path());
        let coordinator = Arc::new(GpuCoordinator::disabled(&config));
        let registry = ProviderRegistry::new(config, coordinator).unwrap();

        assert_eq!(
            registry.selection(),
            ProviderSelection::all(ProviderBackend::Mock)
        );
    }

    #[tokio::test]
    async fn switch_to_unreachable_local_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = mock_config(dir.path());
        let coordinator = Arc::new(GpuCoordinator::disabled(&config));
        // Pin every service to port 1, which never accepts connections.
        std::fs::create_dir_all(dir.path()).unwrap();
        for kind in ServiceKind::all() {
            std::fs::write(coordinator.port_file_path(kind), "1").unwrap();
        }
        let registry = ProviderRegistry::new(config, coordinator).unwrap();
        let err = registry
            .switch(ProviderSelection::all(ProviderBackend::Local))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ServiceUnavailable(_)));
        assert_eq!(
            registry.selection(),
            ProviderSelection::all(ProviderBackend::Mock)
        );
    }

    #[tokio::test]
    async fn switch_returns_prior_selection() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = mock_config(dir.path());
        config.openai_api_key = Some("test-key".to_string());
        let coordinator = Arc::new(GpuCoordinator::disabled(&config));
        let registry = ProviderRegistry::new(config, coordinator).unwrap();

        let prior = registry
            .switch(ProviderSelection {
                llm: ProviderBackend::OpenAi,
                image: ProviderBackend::Mock,
                vision: ProviderBackend::Mock,
                ranking: ProviderBackend::Mock,
            })
            .await
            .unwrap();
        assert_eq!(prior, ProviderSelection::all(ProviderBackend::Mock));
        assert_eq!(registry.selection().llm, ProviderBackend::OpenAi);
    }
}
