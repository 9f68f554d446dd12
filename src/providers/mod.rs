use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::models::{Critique, Dimension, Evaluation, FactorRanks, PairWinner, TokenUsage};

pub mod local;
pub mod mock;
pub mod openai;

/// Shared HTTP client; per-request timeouts are set at the call site.
pub fn client() -> &'static reqwest::Client {
    static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();
    CLIENT.get_or_init(reqwest::Client::new)
}

/// Provenance attached to every provider response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderMeta {
    pub model: String,
    #[serde(default)]
    pub usage: TokenUsage,
    pub duration_ms: u64,
}

/// Text returned by an LLM operation, trimmed and guaranteed non-empty.
#[derive(Debug, Clone)]
pub struct LlmText {
    pub text: String,
    pub meta: ProviderMeta,
}

impl LlmText {
    /// Enforce the non-empty trimmed-output contract at the boundary.
    pub fn checked(text: String, meta: ProviderMeta) -> Result<Self, EngineError> {
        let trimmed = text.trim().to_string();
        if trimmed.is_empty() {
            return Err(EngineError::parse("LLM returned an empty response"));
        }
        Ok(Self {
            text: trimmed,
            meta,
        })
    }
}

/// How verbose expanded prompts should be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Descriptiveness {
    Concise,
    #[default]
    Balanced,
    Detailed,
}

impl std::fmt::Display for Descriptiveness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Descriptiveness::Concise => write!(f, "concise"),
            Descriptiveness::Balanced => write!(f, "balanced"),
            Descriptiveness::Detailed => write!(f, "detailed"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExpandOptions {
    pub dimension: Option<Dimension>,
    pub style: Option<String>,
    pub descriptiveness: Descriptiveness,
}

#[derive(Debug, Clone)]
pub struct RefineOptions {
    pub dimension: Dimension,
    pub critique: Critique,
    /// The user's original intent; refinement must not drift away from it.
    pub original_user_prompt: String,
    pub style: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CombineOptions {
    pub style: Option<String>,
    pub descriptiveness: Descriptiveness,
}

/// Prompt expansion, refinement and combination.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn expand(&self, prompt: &str, options: ExpandOptions) -> Result<LlmText, EngineError>;

    async fn refine(&self, prompt: &str, options: RefineOptions) -> Result<LlmText, EngineError>;

    async fn combine(
        &self,
        what_prompt: &str,
        how_prompt: &str,
        options: CombineOptions,
    ) -> Result<LlmText, EngineError>;
}

/// One image-generation request. The candidate coordinates key the canonical
/// on-disk filename.
#[derive(Debug, Clone)]
pub struct ImageRequest {
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub guidance: f64,
    pub seed: Option<u64>,
    pub negative_prompt: Option<String>,
    pub iteration: usize,
    pub candidate_id: String,
    pub session_id: String,
}

/// Raw provider output before the engine materialises it into the session
/// directory. Exactly one of `bytes` or `temp_path` is set: cloud providers
/// hand back bytes, off-process services hand back a temporary path the
/// caller must copy.
#[derive(Debug)]
pub struct ImageOutput {
    pub bytes: Option<Vec<u8>>,
    pub temp_path: Option<PathBuf>,
    pub url: Option<String>,
    /// Pre-face-fix variant path, when the provider produces one.
    pub base_temp_path: Option<PathBuf>,
    pub revised_prompt: Option<String>,
    pub seed: Option<u64>,
    pub meta: ProviderMeta,
}

#[async_trait]
pub trait ImageProvider: Send + Sync {
    async fn generate(
        &self,
        prompt: &str,
        request: ImageRequest,
    ) -> Result<ImageOutput, EngineError>;
}

/// Absolute image scoring. Deprecated in favour of pairwise ranking but kept
/// for the scoring mode.
#[async_trait]
pub trait VisionProvider: Send + Sync {
    async fn analyze(
        &self,
        image: &Path,
        reference_prompt: &str,
    ) -> Result<(Evaluation, ProviderMeta), EngineError>;
}

#[derive(Debug, Clone, Copy)]
pub struct CompareOptions {
    pub temperature: f64,
    /// Alignment weight used for the combined rank.
    pub alpha: f64,
}

impl Default for CompareOptions {
    fn default() -> Self {
        Self {
            temperature: 0.2,
            alpha: 0.7,
        }
    }
}

/// Verdict on one pair as presented: ordinal ranks per factor (1 or 2, ties
/// both 1) and a combined rank, lower better.
#[derive(Debug, Clone)]
pub struct PairVerdict {
    pub winner: PairWinner,
    pub reason: String,
    pub ranks_a: FactorRanks,
    pub ranks_b: FactorRanks,
    pub winner_strengths: Vec<String>,
    pub loser_weaknesses: Vec<String>,
    pub meta: ProviderMeta,
}

impl PairVerdict {
    /// Map a verdict on a swapped presentation back to the original identity.
    pub fn unswapped(self) -> Self {
        Self {
            winner: self.winner.flipped(),
            ranks_a: self.ranks_b,
            ranks_b: self.ranks_a,
            ..self
        }
    }
}

/// Pairwise visual comparison via a vision-language model.
#[async_trait]
pub trait PairwiseComparator: Send + Sync {
    async fn compare_pair(
        &self,
        image_a: &Path,
        image_b: &Path,
        reference_prompt: &str,
        options: CompareOptions,
    ) -> Result<PairVerdict, EngineError>;
}

/// Rewrites a prompt to clear a content-policy refusal while keeping the
/// creative intent. Implemented by the same LLM backends.
#[async_trait]
pub trait PromptRewriter: Send + Sync {
    async fn rewrite(&self, prompt: &str, guidance: &str) -> Result<LlmText, EngineError>;
}

/// Load an image as base64 for API requests.
pub fn image_to_base64(path: &Path) -> Result<String, EngineError> {
    let data = std::fs::read(path)
        .map_err(|e| EngineError::invalid(format!("cannot read image {}: {e}", path.display())))?;
    Ok(base64::Engine::encode(
        &base64::engine::general_purpose::STANDARD,
        &data,
    ))
}

/// Inline a local image as a data URI for JSON payloads. Candidate images
/// are canonically PNG, but adopted provider output can be anything and its
/// extension may lie, so the media type is sniffed from the bytes.
pub fn image_data_uri(path: &Path) -> Result<String, EngineError> {
    let data = std::fs::read(path)
        .map_err(|e| EngineError::invalid(format!("cannot read image {}: {e}", path.display())))?;
    let media_type = match image::guess_format(&data) {
        Ok(image::ImageFormat::Jpeg) => "image/jpeg",
        Ok(image::ImageFormat::WebP) => "image/webp",
        _ => "image/png",
    };
    let encoded = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, &data);
    Ok(format!("data:{media_type};base64,{encoded}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FactorRanks;

    #[test]
    fn llm_text_rejects_empty_output() {
        assert!(LlmText::checked("   \n".to_string(), ProviderMeta::default()).is_err());
        let ok = LlmText::checked("  a mountain  ".to_string(), ProviderMeta::default()).unwrap();
        assert_eq!(ok.text, "a mountain");
    }

    #[test]
    fn unswapped_verdict_flips_winner_and_ranks() {
        let verdict = PairVerdict {
            winner: PairWinner::A,
            reason: "sharper".into(),
            ranks_a: FactorRanks::new(1.0, 1.0, 0.7),
            ranks_b: FactorRanks::new(2.0, 2.0, 0.7),
            winner_strengths: vec![],
            loser_weaknesses: vec![],
            meta: ProviderMeta::default(),
        };

        let mapped = verdict.unswapped();
        assert_eq!(mapped.winner, PairWinner::B);
        assert!((mapped.ranks_a.combined - 2.0).abs() < 1e-9);
        assert!((mapped.ranks_b.combined - 1.0).abs() < 1e-9);
    }

    #[test]
    fn data_uri_media_type_comes_from_bytes_not_extension() {
        let dir = tempfile::tempdir().unwrap();
        // The extension lies; the bytes are PNG.
        let path = dir.path().join("image.jpg");
        let mut bytes = Vec::new();
        image::DynamicImage::ImageRgb8(image::RgbImage::new(2, 2))
            .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        std::fs::write(&path, &bytes).unwrap();

        let uri = image_data_uri(&path).unwrap();
        assert!(uri.starts_with("data:image/png;base64,"));
    }

    #[test]
    fn data_uri_on_missing_file_is_invalid_argument() {
        let err = image_data_uri(Path::new("/nonexistent/image.png")).unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)));
    }
}
