use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;

use crate::error::EngineError;
use crate::models::{Dimension, Evaluation, FactorRanks, PairWinner, TokenUsage};
use crate::providers::{
    CombineOptions, CompareOptions, ExpandOptions, ImageOutput, ImageProvider, ImageRequest,
    LlmProvider, LlmText, PairVerdict, PairwiseComparator, PromptRewriter, ProviderMeta,
    RefineOptions, VisionProvider,
};

fn hash_of(input: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    input.hash(&mut hasher);
    hasher.finish()
}

fn mock_meta(model: &str) -> ProviderMeta {
    ProviderMeta {
        model: model.to_string(),
        usage: TokenUsage {
            prompt_tokens: 20,
            completion_tokens: 40,
        },
        duration_ms: 1,
    }
}

/// Deterministic LLM: outputs vary per call via a counter so sibling
/// candidates stay distinct, but contain no randomness.
#[derive(Default)]
pub struct MockLlm {
    counter: AtomicU64,
}

impl MockLlm {
    pub fn new() -> Self {
        Self::default()
    }

    fn next(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::Relaxed)
    }
}

#[async_trait]
impl LlmProvider for MockLlm {
    async fn expand(&self, prompt: &str, options: ExpandOptions) -> Result<LlmText, EngineError> {
        let dimension = options
            .dimension
            .ok_or_else(|| EngineError::invalid("expand requires a dimension of what or how"))?;
        let n = self.next();
        let text = match dimension {
            Dimension::What => format!("{prompt}, with scene detail v{n}"),
            Dimension::How => format!("{prompt}, rendered in treatment v{n}"),
        };
        LlmText::checked(text, mock_meta("mock-llm"))
    }

    async fn refine(&self, prompt: &str, options: RefineOptions) -> Result<LlmText, EngineError> {
        if options.critique.recommendation.trim().is_empty() {
            return Err(EngineError::invalid(
                "refine requires a structured critique with a recommendation",
            ));
        }
        let n = self.next();
        LlmText::checked(
            format!(
                "{prompt}, adjusted for {} (r{n})",
                options.critique.recommendation
            ),
            mock_meta("mock-llm"),
        )
    }

    async fn combine(
        &self,
        what_prompt: &str,
        how_prompt: &str,
        _options: CombineOptions,
    ) -> Result<LlmText, EngineError> {
        LlmText::checked(format!("{what_prompt} | {how_prompt}"), mock_meta("mock-llm"))
    }
}

#[async_trait]
impl PromptRewriter for MockLlm {
    async fn rewrite(&self, prompt: &str, _guidance: &str) -> Result<LlmText, EngineError> {
        let n = self.next();
        LlmText::checked(format!("{prompt} (softened v{n})"), mock_meta("mock-llm"))
    }
}

#[async_trait]
impl crate::critique::CritiqueModel for MockLlm {
    async fn draft_critique(
        &self,
        request: &crate::critique::CritiqueRequest,
    ) -> Result<LlmText, EngineError> {
        let body = serde_json::json!({
            "critique": format!("ranked {} of {} on {}", request.rank, request.of, request.dimension),
            "recommendation": format!("tighten the {} elements", request.dimension),
            "reason": "mock drafting",
        });
        LlmText::checked(body.to_string(), mock_meta("mock-llm"))
    }
}

/// Deterministic image generator: a solid-colour PNG keyed off the prompt
/// hash, so every candidate gets a distinct, decodeable file.
#[derive(Default)]
pub struct MockImage {
    /// When set, prompts containing this marker are refused with a
    /// content-policy error. Used to exercise the moderation path.
    pub policy_trigger: Option<String>,
}

impl MockImage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy_trigger(trigger: impl Into<String>) -> Self {
        Self {
            policy_trigger: Some(trigger.into()),
        }
    }
}

pub fn png_for_prompt(prompt: &str) -> Vec<u8> {
    let h = hash_of(prompt);
    let pixel = image::Rgb([(h >> 16) as u8, (h >> 8) as u8, h as u8]);
    let img = image::RgbImage::from_pixel(32, 32, pixel);
    let mut out = Vec::new();
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut std::io::Cursor::new(&mut out), image::ImageFormat::Png)
        .expect("in-memory PNG encode cannot fail");
    out
}

#[async_trait]
impl ImageProvider for MockImage {
    async fn generate(
        &self,
        prompt: &str,
        _request: ImageRequest,
    ) -> Result<ImageOutput, EngineError> {
        if let Some(trigger) = &self.policy_trigger {
            if prompt.contains(trigger.as_str()) {
                return Err(EngineError::ContentPolicy(
                    "content policy violation: prompt rejected".to_string(),
                ));
            }
        }

        Ok(ImageOutput {
            bytes: Some(png_for_prompt(prompt)),
            temp_path: None,
            url: None,
            base_temp_path: None,
            revised_prompt: None,
            seed: Some(hash_of(prompt) & 0xffff_ffff),
            meta: mock_meta("mock-image"),
        })
    }
}

/// Deterministic absolute scorer keyed off the image path.
#[derive(Default)]
pub struct MockVision;

impl MockVision {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl VisionProvider for MockVision {
    async fn analyze(
        &self,
        image: &Path,
        _reference_prompt: &str,
    ) -> Result<(Evaluation, ProviderMeta), EngineError> {
        let h = hash_of(&image.display().to_string());
        Ok((
            Evaluation {
                alignment: 50.0 + (h % 50) as f64,
                aesthetic: 5.0 + (h % 5) as f64,
                analysis: "mock analysis".to_string(),
                strengths: vec!["clear subject".to_string()],
                weaknesses: vec!["flat lighting".to_string()],
            },
            mock_meta("mock-vision"),
        ))
    }
}

/// Deterministic comparator: the image whose path hashes lower wins, so
/// verdicts are total, consistent, and free of cycles. Tracks call count for
/// inference assertions.
#[derive(Default)]
pub struct MockComparator {
    calls: AtomicU64,
}

impl MockComparator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl PairwiseComparator for MockComparator {
    async fn compare_pair(
        &self,
        image_a: &Path,
        image_b: &Path,
        _reference_prompt: &str,
        options: CompareOptions,
    ) -> Result<PairVerdict, EngineError> {
        self.calls.fetch_add(1, Ordering::Relaxed);

        let score_a = hash_of(&image_a.display().to_string());
        let score_b = hash_of(&image_b.display().to_string());
        let a_wins = score_a <= score_b;

        let (winner, ranks_a, ranks_b) = if a_wins {
            (
                PairWinner::A,
                FactorRanks::new(1.0, 1.0, options.alpha),
                FactorRanks::new(2.0, 2.0, options.alpha),
            )
        } else {
            (
                PairWinner::B,
                FactorRanks::new(2.0, 2.0, options.alpha),
                FactorRanks::new(1.0, 1.0, options.alpha),
            )
        };

        Ok(PairVerdict {
            winner,
            reason: "mock verdict".to_string(),
            ranks_a,
            ranks_b,
            winner_strengths: vec!["stronger composition".to_string()],
            loser_weaknesses: vec!["weaker framing".to_string()],
            meta: mock_meta("mock-vlm"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Critique;

    #[tokio::test]
    async fn expand_outputs_differ_per_call() {
        let llm = MockLlm::new();
        let options = || ExpandOptions {
            dimension: Some(Dimension::What),
            ..Default::default()
        };
        let first = llm.expand("a mountain", options()).await.unwrap();
        let second = llm.expand("a mountain", options()).await.unwrap();
        assert_ne!(first.text, second.text);
    }

    #[tokio::test]
    async fn refine_requires_recommendation() {
        let llm = MockLlm::new();
        let options = RefineOptions {
            dimension: Dimension::How,
            critique: Critique {
                critique: "flat".into(),
                recommendation: "".into(),
                reason: "".into(),
                dimension: Dimension::How,
                metadata: serde_json::Value::Null,
            },
            original_user_prompt: "a mountain".into(),
            style: None,
        };
        assert!(llm.refine("prompt", options).await.is_err());
    }

    #[tokio::test]
    async fn image_bytes_decode_and_depend_on_prompt() {
        let provider = MockImage::new();
        let request = ImageRequest {
            width: 1024,
            height: 1024,
            steps: 28,
            guidance: 3.5,
            seed: None,
            negative_prompt: None,
            iteration: 0,
            candidate_id: "iter0-cand0".into(),
            session_id: "ses-000000".into(),
        };
        let a = provider.generate("a mountain", request.clone()).await.unwrap();
        let b = provider.generate("a river", request).await.unwrap();
        assert_ne!(a.bytes, b.bytes);
        assert!(image::load_from_memory(a.bytes.as_ref().unwrap()).is_ok());
    }

    #[tokio::test]
    async fn policy_trigger_refuses() {
        let provider = MockImage::with_policy_trigger("gore");
        let request = ImageRequest {
            width: 512,
            height: 512,
            steps: 1,
            guidance: 1.0,
            seed: None,
            negative_prompt: None,
            iteration: 0,
            candidate_id: "iter0-cand0".into(),
            session_id: "ses-000000".into(),
        };
        let err = provider.generate("gore scene", request).await.unwrap_err();
        assert!(err.is_content_policy());
    }

    #[tokio::test]
    async fn comparator_is_consistent_and_counts_calls() {
        let comparator = MockComparator::new();
        let a = Path::new("/tmp/iter0-cand0.png");
        let b = Path::new("/tmp/iter0-cand1.png");

        let first = comparator
            .compare_pair(a, b, "ref", CompareOptions::default())
            .await
            .unwrap();
        let second = comparator
            .compare_pair(a, b, "ref", CompareOptions::default())
            .await
            .unwrap();
        assert_eq!(first.winner, second.winner);
        assert_eq!(comparator.calls(), 2);
    }
}
