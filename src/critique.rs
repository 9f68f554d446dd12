use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::EngineError;
use crate::models::{AggregatedFeedback, Critique, Dimension, Evaluation};
use crate::providers::LlmText;

/// Everything the generator knows about one survivor when writing its
/// forward-looking critique.
#[derive(Debug, Clone)]
pub struct CritiqueRequest {
    /// The dimension the next refine step will touch.
    pub dimension: Dimension,
    pub original_prompt: String,
    pub what_prompt: String,
    pub how_prompt: String,
    /// Iteration rank, 1 = best.
    pub rank: usize,
    /// Size of the ranked field.
    pub of: usize,
    pub feedback: AggregatedFeedback,
    /// Present in absolute-scoring mode only.
    pub evaluation: Option<Evaluation>,
}

/// LLM backend for critique drafting. A separate seam from the prompt
/// operations so the generator can fall back cleanly when it misbehaves.
#[async_trait]
pub trait CritiqueModel: Send + Sync {
    async fn draft_critique(&self, request: &CritiqueRequest) -> Result<LlmText, EngineError>;
}

#[derive(Deserialize)]
struct CritiqueBody {
    critique: String,
    recommendation: String,
    reason: String,
}

/// Converts ranking outputs (or a legacy absolute evaluation) into a
/// structured, dimension-scoped critique. Never fails: when the model is
/// unavailable or returns an unparseable body, a rule-based path grades the
/// revision by score band instead.
pub struct CritiqueGenerator {
    model: Option<Arc<dyn CritiqueModel>>,
}

impl CritiqueGenerator {
    pub fn new(model: Arc<dyn CritiqueModel>) -> Self {
        Self { model: Some(model) }
    }

    /// Rule-based only; used when no LLM is reachable at all.
    pub fn rule_based() -> Self {
        Self { model: None }
    }

    pub async fn generate(&self, request: &CritiqueRequest) -> Critique {
        if let Some(model) = &self.model {
            match model.draft_critique(request).await {
                Ok(reply) => match parse_body(&reply.text) {
                    Ok(body) => return self.from_body(request, body, "llm"),
                    Err(err) => {
                        tracing::warn!(error = %err, "critique body unparseable, using rule-based path");
                    }
                },
                Err(err) => {
                    tracing::warn!(error = %err, "critique model unavailable, using rule-based path");
                }
            }
        }

        self.rule_based_critique(request)
    }

    fn from_body(&self, request: &CritiqueRequest, body: CritiqueBody, source: &str) -> Critique {
        Critique {
            critique: body.critique,
            recommendation: body.recommendation,
            reason: body.reason,
            dimension: request.dimension,
            metadata: serde_json::json!({
                "source": source,
                "rank": request.rank,
                "of": request.of,
            }),
        }
    }

    fn rule_based_critique(&self, request: &CritiqueRequest) -> Critique {
        let score = effective_score(request);
        let severity = if score >= 80.0 {
            "minor"
        } else if score >= 60.0 {
            "moderate"
        } else {
            "major"
        };

        let keep = if request.feedback.strengths.is_empty() {
            String::new()
        } else {
            format!(
                " Keep what already works: {}.",
                request.feedback.strengths.join("; ")
            )
        };

        let weaknesses = if request.feedback.weaknesses.is_empty() {
            "no specific weaknesses were reported".to_string()
        } else {
            request.feedback.weaknesses.join("; ")
        };

        let (critique, recommendation) = match request.dimension {
            Dimension::What => (
                format!(
                    "Content alignment placed this candidate at rank {} of {}: {weaknesses}.",
                    request.rank, request.of
                ),
                format!(
                    "Make a {severity} revision of the content only: adjust subjects, \
                     objects or setting to match the request more closely.{keep}"
                ),
            ),
            Dimension::How => (
                format!(
                    "Aesthetic quality placed this candidate at rank {} of {}: {weaknesses}.",
                    request.rank, request.of
                ),
                format!(
                    "Make a {severity} revision of the style only: rework lighting, \
                     composition or palette.{keep}"
                ),
            ),
        };

        Critique {
            critique,
            recommendation,
            reason: format!(
                "Effective score {score:.0} falls in the {severity}-revision band for the \
                 {} dimension.",
                request.dimension
            ),
            dimension: request.dimension,
            metadata: serde_json::json!({
                "source": "rule-based",
                "severity": severity,
                "score": score,
                "rank": request.rank,
                "of": request.of,
            }),
        }
    }
}

fn parse_body(text: &str) -> Result<CritiqueBody, EngineError> {
    let trimmed = text.trim();
    let cleaned = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed);

    let body: CritiqueBody = serde_json::from_str(cleaned)?;
    if body.critique.trim().is_empty()
        || body.recommendation.trim().is_empty()
        || body.reason.trim().is_empty()
    {
        return Err(EngineError::parse("critique fields must be non-empty"));
    }
    Ok(body)
}

/// Project the request onto a 0-100 score: dimension-appropriate absolute
/// scores when present, otherwise the rank position.
fn effective_score(request: &CritiqueRequest) -> f64 {
    if let Some(evaluation) = &request.evaluation {
        return match request.dimension {
            Dimension::What => evaluation.alignment,
            Dimension::How => evaluation.aesthetic * 10.0,
        };
    }

    if request.of <= 1 {
        return 100.0;
    }
    100.0 * (request.of - request.rank) as f64 / (request.of - 1) as f64
}

/// Prompt shared by the LLM backends.
pub fn drafting_prompt(request: &CritiqueRequest) -> String {
    let focus = match request.dimension {
        Dimension::What => {
            "Focus on content alignment. The recommendation must only change content \
             elements (subjects, objects, setting); never touch style."
        }
        Dimension::How => {
            "Focus on aesthetics. The recommendation must only change style elements \
             (lighting, composition, palette); never touch the subject matter."
        }
    };

    let mut prompt = format!(
        "Write a critique for an image candidate ranked {} of {}.\n\
         Original request: {}\nContent prompt: {}\nStyle prompt: {}\n{focus}\n",
        request.rank, request.of, request.original_prompt, request.what_prompt, request.how_prompt,
    );

    if !request.feedback.strengths.is_empty() {
        prompt.push_str(&format!(
            "Reported strengths (preserve these, do not dilute them): {}\n",
            request.feedback.strengths.join("; ")
        ));
    }
    if !request.feedback.weaknesses.is_empty() {
        prompt.push_str(&format!(
            "Reported weaknesses: {}\n",
            request.feedback.weaknesses.join("; ")
        ));
    }
    if let Some(evaluation) = &request.evaluation {
        prompt.push_str(&format!(
            "Absolute scores: alignment {:.0}/100, aesthetic {:.1}/10\n",
            evaluation.alignment, evaluation.aesthetic
        ));
    }

    prompt.push_str(
        "Reply as JSON: {\"critique\": str, \"recommendation\": str, \"reason\": str}",
    );
    prompt
}
