use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::gpu::{GpuCoordinator, ServiceKind};
use crate::models::{Dimension, Evaluation, FactorRanks, PairWinner, TokenUsage};
use crate::moderation;
use crate::providers::{
    self, CombineOptions, CompareOptions, ExpandOptions, ImageOutput, ImageProvider, ImageRequest,
    LlmProvider, LlmText, PairVerdict, PairwiseComparator, PromptRewriter, ProviderMeta,
    RefineOptions, VisionProvider,
};

const LLM_TIMEOUT: Duration = Duration::from_secs(180);
const IMAGE_TIMEOUT: Duration = Duration::from_secs(600);
const VISION_TIMEOUT: Duration = Duration::from_secs(120);
const VLM_TIMEOUT: Duration = Duration::from_secs(300);

/// Health check response from a self-hosted model server.
#[derive(Deserialize, Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub current_model: Option<String>,
    pub cuda_available: Option<bool>,
    pub gpu_name: Option<String>,
    pub vram_allocated_gb: Option<f64>,
}

/// Check a self-hosted server's /health endpoint and return its payload.
pub async fn service_health(url: &str) -> Result<HealthResponse, EngineError> {
    let health_url = format!("{}/health", url.trim_end_matches('/'));
    let response = providers::client()
        .get(&health_url)
        .timeout(Duration::from_secs(5))
        .send()
        .await?;

    if !response.status().is_success() {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        return Err(EngineError::unavailable(format!(
            "health check failed ({status}): {text}"
        )));
    }

    Ok(response.json().await?)
}

#[derive(Deserialize, Debug)]
struct ServiceError {
    detail: String,
}

/// Extract the service's error detail from a non-success body, falling back
/// to the raw text.
fn error_detail(text: &str) -> String {
    serde_json::from_str::<ServiceError>(text)
        .map(|e| e.detail)
        .unwrap_or_else(|_| text.to_string())
}

#[derive(Serialize)]
struct LlmServiceRequest {
    prompt: String,
    system: String,
    max_tokens: u32,
    temperature: f64,
}

#[derive(Deserialize)]
struct LlmServiceResponse {
    text: String,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Serialize)]
struct ImageServiceRequest {
    prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    negative_prompt: Option<String>,
    width: u32,
    height: u32,
    steps: u32,
    guidance: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
}

#[derive(Deserialize, Debug)]
struct ImageServiceResponse {
    /// Inline base64 payload, or...
    image: Option<String>,
    /// ...a scratch path on the shared filesystem the caller must copy.
    image_path: Option<String>,
    #[serde(default)]
    base_image_path: Option<String>,
    seed: Option<u64>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Serialize)]
struct AnalyzeServiceRequest {
    image: String,
    reference_prompt: String,
}

#[derive(Deserialize)]
struct AnalyzeServiceResponse {
    alignment: f64,
    aesthetic: f64,
    analysis: String,
    #[serde(default)]
    strengths: Vec<String>,
    #[serde(default)]
    weaknesses: Vec<String>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Serialize)]
struct CompareServiceRequest {
    image_a: String,
    image_b: String,
    reference_prompt: String,
    temperature: f64,
}

#[derive(Deserialize)]
struct CompareServiceResponse {
    winner: String,
    #[serde(default)]
    reason: String,
    alignment_rank_a: f64,
    alignment_rank_b: f64,
    aesthetics_rank_a: f64,
    aesthetics_rank_b: f64,
    #[serde(default)]
    winner_strengths: Vec<String>,
    #[serde(default)]
    loser_weaknesses: Vec<String>,
    #[serde(default)]
    model: Option<String>,
}

/// Self-hosted implementation of every capability. URLs resolve through the
/// GPU coordinator on each call, so a restarted service on a fresh port is
/// picked up without reconfiguration.
pub struct LocalProvider {
    coordinator: Arc<GpuCoordinator>,
    flux_steps: u32,
    flux_guidance: f64,
}

impl LocalProvider {
    pub fn new(coordinator: Arc<GpuCoordinator>, config: &EngineConfig) -> Self {
        Self {
            coordinator,
            flux_steps: config.flux_steps,
            flux_guidance: config.flux_guidance,
        }
    }

    fn endpoint(&self, kind: ServiceKind, path: &str) -> String {
        format!(
            "{}/{path}",
            self.coordinator.resolve_url(kind).trim_end_matches('/')
        )
    }

    async fn post_json<Req: Serialize, Resp: serde::de::DeserializeOwned>(
        &self,
        kind: ServiceKind,
        path: &str,
        request: &Req,
        timeout: Duration,
    ) -> Result<Resp, EngineError> {
        let response = providers::client()
            .post(self.endpoint(kind, path))
            .json(request)
            .timeout(timeout)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let detail = error_detail(&text);
            if status.as_u16() == 400 && moderation::is_policy_violation_message(&detail) {
                return Err(EngineError::ContentPolicy(detail));
            }
            return Err(EngineError::unavailable(format!(
                "{kind} service error ({status}): {detail}"
            )));
        }

        Ok(response.json().await?)
    }

    async fn llm_call(
        &self,
        system: &str,
        prompt: String,
        max_tokens: u32,
        temperature: f64,
    ) -> Result<LlmText, EngineError> {
        let start = Instant::now();
        let response: LlmServiceResponse = self
            .post_json(
                ServiceKind::Llm,
                "generate",
                &LlmServiceRequest {
                    prompt,
                    system: system.to_string(),
                    max_tokens,
                    temperature,
                },
                LLM_TIMEOUT,
            )
            .await?;

        LlmText::checked(
            response.text,
            ProviderMeta {
                model: response.model.unwrap_or_else(|| "local-llm".to_string()),
                usage: TokenUsage {
                    prompt_tokens: response.prompt_tokens,
                    completion_tokens: response.completion_tokens,
                },
                duration_ms: start.elapsed().as_millis() as u64,
            },
        )
    }
}

#[async_trait]
impl LlmProvider for LocalProvider {
    async fn expand(&self, prompt: &str, options: ExpandOptions) -> Result<LlmText, EngineError> {
        let system = match options.dimension {
            Some(Dimension::What) => {
                "Expand the prompt's content: subjects, objects, setting. No style terms. \
                 Reply with the expanded prompt only."
            }
            Some(Dimension::How) => {
                "Expand the prompt's style: lighting, composition, palette. Keep the \
                 subject unchanged. Reply with the expanded prompt only."
            }
            None => {
                return Err(EngineError::invalid(
                    "expand requires a dimension of what or how",
                ))
            }
        };

        let mut user = format!(
            "Prompt: {prompt}\nDescriptiveness: {}",
            options.descriptiveness
        );
        if let Some(style) = &options.style {
            user.push_str(&format!("\nStyle hint: {style}"));
        }

        self.llm_call(system, user, 400, 0.9).await
    }

    async fn refine(&self, prompt: &str, options: RefineOptions) -> Result<LlmText, EngineError> {
        let critique = &options.critique;
        if critique.critique.trim().is_empty() || critique.recommendation.trim().is_empty() {
            return Err(EngineError::invalid(
                "refine requires a structured critique with a recommendation",
            ));
        }

        let system = match options.dimension {
            Dimension::What => {
                "Refine the prompt's content per the critique. Change content only; keep \
                 style untouched. Reply with the refined prompt only."
            }
            Dimension::How => {
                "Refine the prompt's style per the critique. Change style only; keep the \
                 subject untouched. Reply with the refined prompt only."
            }
        };

        let user = format!(
            "Original user intent: {}\nCurrent prompt: {prompt}\nCritique: {}\n\
             Recommendation: {}\nReason: {}",
            options.original_user_prompt, critique.critique, critique.recommendation,
            critique.reason
        );

        self.llm_call(system, user, 400, 0.7).await
    }

    async fn combine(
        &self,
        what_prompt: &str,
        how_prompt: &str,
        options: CombineOptions,
    ) -> Result<LlmText, EngineError> {
        let system = "Merge the content and style descriptions into one image-generation \
                      prompt, keeping every element of both. Reply with the merged prompt \
                      only.";
        let user = format!(
            "Content: {what_prompt}\nStyle: {how_prompt}\nDescriptiveness: {}",
            options.descriptiveness
        );

        self.llm_call(system, user, 500, 0.5).await
    }
}

#[async_trait]
impl PromptRewriter for LocalProvider {
    async fn rewrite(&self, prompt: &str, guidance: &str) -> Result<LlmText, EngineError> {
        let system = "The image provider refused this prompt on content-policy grounds. \
                      Rewrite it to pass: keep the creative intent, scene and subject; \
                      make minimal substitutions; soften graphic vocabulary. Reply with \
                      the rewritten prompt only.";
        self.llm_call(system, format!("Prompt: {prompt}\n{guidance}"), 400, 0.7)
            .await
    }
}

#[async_trait]
impl crate::critique::CritiqueModel for LocalProvider {
    async fn draft_critique(
        &self,
        request: &crate::critique::CritiqueRequest,
    ) -> Result<LlmText, EngineError> {
        let system = "You critique image candidates for an iterative search. Be specific \
                      and actionable.";
        self.llm_call(system, crate::critique::drafting_prompt(request), 600, 0.4)
            .await
    }
}

#[async_trait]
impl ImageProvider for LocalProvider {
    async fn generate(
        &self,
        prompt: &str,
        request: ImageRequest,
    ) -> Result<ImageOutput, EngineError> {
        let start = Instant::now();
        let response: ImageServiceResponse = self
            .post_json(
                ServiceKind::Image,
                "generate",
                &ImageServiceRequest {
                    prompt: prompt.to_string(),
                    negative_prompt: request.negative_prompt.clone(),
                    width: request.width,
                    height: request.height,
                    steps: if request.steps > 0 {
                        request.steps
                    } else {
                        self.flux_steps
                    },
                    guidance: if request.guidance > 0.0 {
                        request.guidance
                    } else {
                        self.flux_guidance
                    },
                    seed: request.seed,
                },
                IMAGE_TIMEOUT,
            )
            .await?;

        let meta = ProviderMeta {
            model: response.model.unwrap_or_else(|| "local-image".to_string()),
            usage: TokenUsage::default(),
            duration_ms: start.elapsed().as_millis() as u64,
        };

        if let Some(b64) = response.image {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(&b64)
                .map_err(|e| EngineError::parse(format!("invalid base64 image: {e}")))?;
            return Ok(ImageOutput {
                bytes: Some(bytes),
                temp_path: None,
                url: None,
                base_temp_path: None,
                revised_prompt: None,
                seed: response.seed,
                meta,
            });
        }

        let temp_path = response
            .image_path
            .map(PathBuf::from)
            .ok_or_else(|| EngineError::parse("image service returned neither image nor path"))?;

        Ok(ImageOutput {
            bytes: None,
            temp_path: Some(temp_path),
            url: None,
            base_temp_path: response.base_image_path.map(PathBuf::from),
            revised_prompt: None,
            seed: response.seed,
            meta,
        })
    }
}

#[async_trait]
impl VisionProvider for LocalProvider {
    async fn analyze(
        &self,
        image: &Path,
        reference_prompt: &str,
    ) -> Result<(Evaluation, ProviderMeta), EngineError> {
        let start = Instant::now();
        let response: AnalyzeServiceResponse = self
            .post_json(
                ServiceKind::Vision,
                "analyze",
                &AnalyzeServiceRequest {
                    image: providers::image_to_base64(image)?,
                    reference_prompt: reference_prompt.to_string(),
                },
                VISION_TIMEOUT,
            )
            .await?;

        Ok((
            Evaluation {
                alignment: response.alignment.clamp(0.0, 100.0),
                aesthetic: response.aesthetic.clamp(0.0, 10.0),
                analysis: response.analysis,
                strengths: response.strengths,
                weaknesses: response.weaknesses,
            },
            ProviderMeta {
                model: response.model.unwrap_or_else(|| "local-vision".to_string()),
                usage: TokenUsage::default(),
                duration_ms: start.elapsed().as_millis() as u64,
            },
        ))
    }
}

#[async_trait]
impl PairwiseComparator for LocalProvider {
    async fn compare_pair(
        &self,
        image_a: &Path,
        image_b: &Path,
        reference_prompt: &str,
        options: CompareOptions,
    ) -> Result<PairVerdict, EngineError> {
        let start = Instant::now();
        let response: CompareServiceResponse = self
            .post_json(
                ServiceKind::Vlm,
                "compare",
                &CompareServiceRequest {
                    image_a: providers::image_to_base64(image_a)?,
                    image_b: providers::image_to_base64(image_b)?,
                    reference_prompt: reference_prompt.to_string(),
                    temperature: options.temperature,
                },
                VLM_TIMEOUT,
            )
            .await
            .map_err(|e| match e {
                err @ EngineError::ServiceUnavailable(_) | err @ EngineError::Timeout(_) => err,
                other => EngineError::ComparisonFailure(other.to_string()),
            })?;

        let winner = match response.winner.trim() {
            "A" | "a" => PairWinner::A,
            "B" | "b" => PairWinner::B,
            other => {
                return Err(EngineError::ComparisonFailure(format!(
                    "verdict winner must be A or B, got {other:?}"
                )))
            }
        };

        Ok(PairVerdict {
            winner,
            reason: response.reason,
            ranks_a: FactorRanks::new(
                response.alignment_rank_a,
                response.aesthetics_rank_a,
                options.alpha,
            ),
            ranks_b: FactorRanks::new(
                response.alignment_rank_b,
                response.aesthetics_rank_b,
                options.alpha,
            ),
            winner_strengths: response.winner_strengths,
            loser_weaknesses: response.loser_weaknesses,
            meta: ProviderMeta {
                model: response.model.unwrap_or_else(|| "local-vlm".to_string()),
                usage: TokenUsage::default(),
                duration_ms: start.elapsed().as_millis() as u64,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_detail_prefers_structured_body() {
        assert_eq!(error_detail(r#"{"detail":"out of VRAM"}"#), "out of VRAM");
        assert_eq!(error_detail("plain text"), "plain text");
    }

    #[test]
    fn image_service_response_accepts_path_form() {
        let response: ImageServiceResponse = serde_json::from_str(
            r#"{"image_path":"/tmp/scratch/out.png","base_image_path":"/tmp/scratch/base.png","seed":7}"#,
        )
        .unwrap();
        assert!(response.image.is_none());
        assert_eq!(response.image_path.as_deref(), Some("/tmp/scratch/out.png"));
        assert_eq!(response.seed, Some(7));
    }
}
