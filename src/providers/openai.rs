use std::path::Path;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::config::{EngineConfig, LlmModels};
use crate::error::EngineError;
use crate::models::{Dimension, Evaluation, FactorRanks, PairWinner, TokenUsage};
use crate::moderation;
use crate::providers::{
    self, CombineOptions, CompareOptions, ExpandOptions, ImageOutput, ImageProvider, ImageRequest,
    LlmProvider, LlmText, PairVerdict, PairwiseComparator, PromptRewriter, ProviderMeta,
    RefineOptions, VisionProvider,
};

const CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";
const IMAGE_URL: &str = "https://api.openai.com/v1/images/generations";

const LLM_TIMEOUT: Duration = Duration::from_secs(120);
const IMAGE_TIMEOUT: Duration = Duration::from_secs(600);
const VLM_TIMEOUT: Duration = Duration::from_secs(300);

fn get_api_key() -> Result<String, EngineError> {
    crate::config::non_empty_env("OPENAI_API_KEY")
        .ok_or_else(|| EngineError::unavailable("OPENAI_API_KEY environment variable not set"))
}

/// Reasoning models consume part of the output budget internally; raise the
/// cap so at least one full response fits after the hidden tokens.
fn effective_max_tokens(model: &str, max_tokens: u32) -> u32 {
    let reasoning = model.starts_with("o1") || model.starts_with("o3") || model.starts_with("o4");
    if reasoning {
        max_tokens.saturating_mul(4)
    } else {
        max_tokens
    }
}

#[derive(Serialize)]
struct ChatMessage {
    role: &'static str,
    content: serde_json::Value,
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_completion_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Option<Vec<ChatChoice>>,
    usage: Option<ChatUsage>,
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize, Default, Clone, Copy)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Deserialize)]
struct ApiError {
    message: String,
}

#[derive(Serialize)]
struct ImageApiRequest {
    model: String,
    prompt: String,
    n: u32,
    size: String,
}

#[derive(Deserialize)]
struct ImageApiResponse {
    data: Option<Vec<ImageApiImage>>,
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct ImageApiImage {
    b64_json: Option<String>,
    revised_prompt: Option<String>,
}

/// Cloud implementation of every capability, talking to an OpenAI-compatible
/// API.
pub struct OpenAiProvider {
    api_key: String,
    llm_models: LlmModels,
    image_model: String,
    vlm_model: String,
}

impl OpenAiProvider {
    pub fn from_config(config: &EngineConfig) -> Result<Self, EngineError> {
        let api_key = match &config.openai_api_key {
            Some(key) => key.clone(),
            None => get_api_key()?,
        };
        Ok(Self {
            api_key,
            llm_models: config.llm_models.clone(),
            image_model: "gpt-image-1".to_string(),
            vlm_model: "gpt-4o".to_string(),
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn chat(
        &self,
        model: &str,
        system: &str,
        user_content: serde_json::Value,
        max_tokens: u32,
        temperature: Option<f64>,
        json_response: bool,
        timeout: Duration,
    ) -> Result<LlmText, EngineError> {
        let request = ChatRequest {
            model: model.to_string(),
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: serde_json::Value::String(system.to_string()),
                },
                ChatMessage {
                    role: "user",
                    content: user_content,
                },
            ],
            max_completion_tokens: effective_max_tokens(model, max_tokens),
            temperature,
            response_format: json_response
                .then(|| serde_json::json!({ "type": "json_object" })),
        };

        let start = Instant::now();
        let response = providers::client()
            .post(CHAT_URL)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .timeout(timeout)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            if status.as_u16() == 400 && moderation::is_policy_violation_message(&text) {
                return Err(EngineError::ContentPolicy(text));
            }
            return Err(EngineError::unavailable(format!(
                "chat API error {status}: {text}"
            )));
        }

        let data: ChatResponse = response.json().await?;
        if let Some(error) = data.error {
            return Err(EngineError::unavailable(format!(
                "chat API error: {}",
                error.message
            )));
        }

        let usage = data.usage.unwrap_or_default();
        let text = data
            .choices
            .and_then(|choices| choices.into_iter().next())
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| EngineError::parse("no message content in chat response"))?;

        LlmText::checked(
            text,
            ProviderMeta {
                model: model.to_string(),
                usage: TokenUsage {
                    prompt_tokens: usage.prompt_tokens,
                    completion_tokens: usage.completion_tokens,
                },
                duration_ms: start.elapsed().as_millis() as u64,
            },
        )
    }

    fn image_content(path: &Path) -> Result<serde_json::Value, EngineError> {
        Ok(serde_json::json!({
            "type": "image_url",
            "image_url": { "url": providers::image_data_uri(path)? }
        }))
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    async fn expand(&self, prompt: &str, options: ExpandOptions) -> Result<LlmText, EngineError> {
        let system = match options.dimension {
            Some(Dimension::What) => {
                "You expand short image prompts along the CONTENT dimension: subjects, \
                 objects, setting, action. Do not add style, lighting or palette terms. \
                 Reply with the expanded prompt only."
            }
            Some(Dimension::How) => {
                "You expand short image prompts along the STYLE dimension: lighting, \
                 composition, palette, artistic treatment. Do not change the subject \
                 matter. Reply with the expanded prompt only."
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

        self.chat(
            &self.llm_models.expand,
            system,
            serde_json::Value::String(user),
            400,
            Some(0.9),
            false,
            LLM_TIMEOUT,
        )
        .await
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
                "You refine the CONTENT of an image prompt using a critique. Change only \
                 content elements; keep every style element untouched. Preserve the \
                 user's original intent. Reply with the refined prompt only."
            }
            Dimension::How => {
                "You refine the STYLE of an image prompt using a critique. Change only \
                 style elements; keep the subject matter untouched. Preserve the user's \
                 original intent. Reply with the refined prompt only."
            }
        };

        let user = format!(
            "Original user intent: {}\nCurrent prompt: {prompt}\nCritique: {}\n\
             Recommendation: {}\nReason: {}",
            options.original_user_prompt, critique.critique, critique.recommendation,
            critique.reason
        );

        self.chat(
            &self.llm_models.refine,
            system,
            serde_json::Value::String(user),
            400,
            Some(0.7),
            false,
            LLM_TIMEOUT,
        )
        .await
    }

    async fn combine(
        &self,
        what_prompt: &str,
        how_prompt: &str,
        options: CombineOptions,
    ) -> Result<LlmText, EngineError> {
        let system = "You merge a content description and a style description into one \
                      coherent image-generation prompt. Keep every element of both. \
                      Reply with the merged prompt only.";

        let mut user = format!(
            "Content: {what_prompt}\nStyle: {how_prompt}\nDescriptiveness: {}",
            options.descriptiveness
        );
        if let Some(style) = &options.style {
            user.push_str(&format!("\nStyle hint: {style}"));
        }

        self.chat(
            &self.llm_models.combine,
            system,
            serde_json::Value::String(user),
            500,
            Some(0.5),
            false,
            LLM_TIMEOUT,
        )
        .await
    }
}

#[async_trait]
impl PromptRewriter for OpenAiProvider {
    async fn rewrite(&self, prompt: &str, guidance: &str) -> Result<LlmText, EngineError> {
        let system = "An image provider refused this prompt on content-policy grounds. \
                      Rewrite it so it passes: preserve the core creative intent, keep \
                      the scene and subject, make minimal substitutions, soften graphic \
                      vocabulary. Reply with the rewritten prompt only.";
        let user = format!("Prompt: {prompt}\n{guidance}");

        self.chat(
            &self.llm_models.refine,
            system,
            serde_json::Value::String(user),
            400,
            Some(0.7),
            false,
            LLM_TIMEOUT,
        )
        .await
    }
}

#[async_trait]
impl ImageProvider for OpenAiProvider {
    async fn generate(
        &self,
        prompt: &str,
        request: ImageRequest,
    ) -> Result<ImageOutput, EngineError> {
        let api_request = ImageApiRequest {
            model: self.image_model.clone(),
            prompt: prompt.to_string(),
            n: 1,
            size: format!("{}x{}", request.width, request.height),
        };

        let start = Instant::now();
        let response = providers::client()
            .post(IMAGE_URL)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&api_request)
            .timeout(IMAGE_TIMEOUT)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            if status.as_u16() == 400 && moderation::is_policy_violation_message(&text) {
                return Err(EngineError::ContentPolicy(text));
            }
            return Err(EngineError::unavailable(format!(
                "image API error {status}: {text}"
            )));
        }

        let data: ImageApiResponse = response.json().await?;
        if let Some(error) = data.error {
            if moderation::is_policy_violation_message(&error.message) {
                return Err(EngineError::ContentPolicy(error.message));
            }
            return Err(EngineError::unavailable(format!(
                "image API error: {}",
                error.message
            )));
        }

        let image = data
            .data
            .and_then(|images| images.into_iter().next())
            .ok_or_else(|| EngineError::parse("no image data in response"))?;

        let b64 = image
            .b64_json
            .ok_or_else(|| EngineError::parse("image response missing b64_json"))?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(&b64)
            .map_err(|e| EngineError::parse(format!("invalid base64 image data: {e}")))?;

        Ok(ImageOutput {
            bytes: Some(bytes),
            temp_path: None,
            url: None,
            base_temp_path: None,
            revised_prompt: image.revised_prompt,
            seed: None,
            meta: ProviderMeta {
                model: self.image_model.clone(),
                usage: TokenUsage::default(),
                duration_ms: start.elapsed().as_millis() as u64,
            },
        })
    }
}

#[async_trait]
impl crate::critique::CritiqueModel for OpenAiProvider {
    async fn draft_critique(
        &self,
        request: &crate::critique::CritiqueRequest,
    ) -> Result<LlmText, EngineError> {
        let system = "You critique image candidates for an iterative search. Be specific \
                      and actionable.";
        self.chat(
            &self.llm_models.refine,
            system,
            serde_json::Value::String(crate::critique::drafting_prompt(request)),
            600,
            Some(0.4),
            true,
            LLM_TIMEOUT,
        )
        .await
    }
}

#[derive(Deserialize)]
struct AnalysisBody {
    alignment: f64,
    aesthetic: f64,
    analysis: String,
    #[serde(default)]
    strengths: Vec<String>,
    #[serde(default)]
    weaknesses: Vec<String>,
}

#[async_trait]
impl VisionProvider for OpenAiProvider {
    async fn analyze(
        &self,
        image: &Path,
        reference_prompt: &str,
    ) -> Result<(Evaluation, ProviderMeta), EngineError> {
        let system = "Score the image against the reference prompt. Reply as JSON: \
                      {\"alignment\": 0-100, \"aesthetic\": 0-10, \"analysis\": str, \
                      \"strengths\": [str], \"weaknesses\": [str]}";
        let content = serde_json::json!([
            { "type": "text", "text": format!("Reference prompt: {reference_prompt}") },
            Self::image_content(image)?,
        ]);

        let reply = self
            .chat(
                &self.vlm_model,
                system,
                content,
                800,
                Some(0.2),
                true,
                VLM_TIMEOUT,
            )
            .await?;

        let body: AnalysisBody = serde_json::from_str(strip_fences(&reply.text))
            .map_err(|e| EngineError::parse(format!("analysis JSON: {e}")))?;

        Ok((
            Evaluation {
                alignment: body.alignment.clamp(0.0, 100.0),
                aesthetic: body.aesthetic.clamp(0.0, 10.0),
                analysis: body.analysis,
                strengths: body.strengths,
                weaknesses: body.weaknesses,
            },
            reply.meta,
        ))
    }
}

#[derive(Deserialize)]
struct VerdictBody {
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
}

#[async_trait]
impl PairwiseComparator for OpenAiProvider {
    async fn compare_pair(
        &self,
        image_a: &Path,
        image_b: &Path,
        reference_prompt: &str,
        options: CompareOptions,
    ) -> Result<PairVerdict, EngineError> {
        let system = "Compare two images against the reference prompt on prompt alignment \
                      and aesthetic quality. Rank each image 1 (better) or 2 (worse) per \
                      factor; ties may both be 1. Reply as JSON: {\"winner\": \"A\"|\"B\", \
                      \"reason\": str, \"alignment_rank_a\": 1|2, \"alignment_rank_b\": 1|2, \
                      \"aesthetics_rank_a\": 1|2, \"aesthetics_rank_b\": 1|2, \
                      \"winner_strengths\": [str], \"loser_weaknesses\": [str]}";
        let content = serde_json::json!([
            { "type": "text", "text": format!("Reference prompt: {reference_prompt}\nImage A then image B follow.") },
            Self::image_content(image_a)?,
            Self::image_content(image_b)?,
        ]);

        let start = Instant::now();
        let reply = self
            .chat(
                &self.vlm_model,
                system,
                content,
                800,
                Some(options.temperature),
                true,
                VLM_TIMEOUT,
            )
            .await
            .map_err(|e| match e {
                err @ EngineError::ServiceUnavailable(_) | err @ EngineError::Timeout(_) => err,
                other => EngineError::ComparisonFailure(other.to_string()),
            })?;

        let body: VerdictBody = serde_json::from_str(strip_fences(&reply.text))
            .map_err(|e| EngineError::ComparisonFailure(format!("verdict JSON: {e}")))?;

        let winner = match body.winner.trim() {
            "A" | "a" => PairWinner::A,
            "B" | "b" => PairWinner::B,
            other => {
                return Err(EngineError::ComparisonFailure(format!(
                    "verdict winner must be A or B, got {other:?}"
                )))
            }
        };

        let mut meta = reply.meta;
        meta.duration_ms = start.elapsed().as_millis() as u64;

        Ok(PairVerdict {
            winner,
            reason: body.reason,
            ranks_a: FactorRanks::new(body.alignment_rank_a, body.aesthetics_rank_a, options.alpha),
            ranks_b: FactorRanks::new(body.alignment_rank_b, body.aesthetics_rank_b, options.alpha),
            winner_strengths: body.winner_strengths,
            loser_weaknesses: body.loser_weaknesses,
            meta,
        })
    }
}

/// Models sometimes wrap JSON replies in markdown fences.
fn strip_fences(text: &str) -> &str {
    let trimmed = text.trim();
    trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fences_are_stripped() {
        assert_eq!(strip_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_fences("{\"a\":1}"), "{\"a\":1}");
    }

    #[test]
    fn reasoning_models_get_raised_budget() {
        assert_eq!(effective_max_tokens("o3-mini", 400), 1600);
        assert_eq!(effective_max_tokens("gpt-4o-mini", 400), 400);
    }

    #[test]
    fn verdict_body_parses() {
        let body: VerdictBody = serde_json::from_str(
            r#"{"winner":"B","reason":"sharper","alignment_rank_a":2,"alignment_rank_b":1,
                "aesthetics_rank_a":1,"aesthetics_rank_b":1,
                "winner_strengths":["composition"],"loser_weaknesses":["blur"]}"#,
        )
        .unwrap();
        assert_eq!(body.winner, "B");
        assert_eq!(body.winner_strengths, vec!["composition"]);
    }
}
