use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// The two orthogonal prompt dimensions: WHAT (content) and HOW (style).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dimension {
    What,
    How,
}

impl Dimension {
    pub fn other(self) -> Dimension {
        match self {
            Dimension::What => Dimension::How,
            Dimension::How => Dimension::What,
        }
    }
}

impl std::fmt::Display for Dimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dimension::What => write!(f, "what"),
            Dimension::How => write!(f, "how"),
        }
    }
}

impl std::str::FromStr for Dimension {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "what" => Ok(Dimension::What),
            "how" => Ok(Dimension::How),
            _ => Err(format!("Unknown dimension: {}", s)),
        }
    }
}

/// How candidates are scored: pairwise VLM comparison (rank numbers, lower is
/// better) or legacy absolute vision scores (higher is better).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RankingMode {
    Pairwise,
    Absolute,
}

impl std::fmt::Display for RankingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RankingMode::Pairwise => write!(f, "pairwise"),
            RankingMode::Absolute => write!(f, "absolute"),
        }
    }
}

impl std::str::FromStr for RankingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pairwise" | "ranking" => Ok(RankingMode::Pairwise),
            "absolute" | "scoring" => Ok(RankingMode::Absolute),
            _ => Err(format!("Unknown ranking mode: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateStatus {
    Attempted,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Running => write!(f, "running"),
            SessionStatus::Completed => write!(f, "completed"),
            SessionStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Immutable per-session search parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchConfig {
    /// Candidates per iteration (N).
    pub beam_width: usize,
    /// Candidates that seed the next iteration (M).
    pub survivors: usize,
    /// Iteration budget (I).
    pub max_iterations: usize,
    /// Alignment weight in the combined rank; aesthetics gets 1 - alpha.
    pub alpha: f64,
    /// Comparator calls per pair (k).
    pub ensemble_size: usize,
    pub ranking_mode: RankingMode,
    /// Parallel candidate workers within an iteration.
    pub worker_pool: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            beam_width: 4,
            survivors: 2,
            max_iterations: 3,
            alpha: 0.7,
            ensemble_size: 3,
            ranking_mode: RankingMode::Pairwise,
            worker_pool: 4,
        }
    }
}

impl SearchConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.beam_width == 0 {
            return Err(EngineError::invalid("beamWidth must be at least 1"));
        }
        if self.survivors == 0 || self.survivors > self.beam_width {
            return Err(EngineError::invalid(format!(
                "survivors must be in 1..={}",
                self.beam_width
            )));
        }
        if !(0.0..=1.0).contains(&self.alpha) {
            return Err(EngineError::invalid("alpha must be within [0, 1]"));
        }
        if self.ensemble_size == 0 {
            return Err(EngineError::invalid("ensembleSize must be at least 1"));
        }
        if self.worker_pool == 0 {
            return Err(EngineError::invalid("workerPool must be at least 1"));
        }
        Ok(())
    }

    /// Dimension refined at the given iteration. Iteration 0 is a cold start
    /// that expands both; the recorded dimension there is WHAT.
    pub fn dimension_for(&self, iteration: usize) -> Dimension {
        if iteration % 2 == 0 {
            Dimension::What
        } else {
            Dimension::How
        }
    }
}

/// Structured feedback for one dimension, produced after survivor selection
/// and consumed by the next iteration's refine step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Critique {
    pub critique: String,
    pub recommendation: String,
    pub reason: String,
    pub dimension: Dimension,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

/// Where a candidate's generated image lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageArtifact {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub local_path: String,
    /// Pre-face-fix variant, when the provider produces one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_image_path: Option<String>,
}

/// Absolute vision scores (legacy scoring path).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Evaluation {
    /// Prompt alignment on a 0-100 scale.
    pub alignment: f64,
    /// Aesthetic quality on a 0-10 scale.
    pub aesthetic: f64,
    pub analysis: String,
    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(default)]
    pub weaknesses: Vec<String>,
}

/// Which side of a pair won.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PairWinner {
    A,
    B,
}

impl PairWinner {
    pub fn flipped(self) -> PairWinner {
        match self {
            PairWinner::A => PairWinner::B,
            PairWinner::B => PairWinner::A,
        }
    }
}

/// Per-image ordinal ranks from one comparison: 1 or 2 on each factor (ties
/// both get 1), combined = alpha * alignment + (1 - alpha) * aesthetics.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FactorRanks {
    pub alignment: f64,
    pub aesthetics: f64,
    pub combined: f64,
}

impl FactorRanks {
    pub fn new(alignment: f64, aesthetics: f64, alpha: f64) -> Self {
        Self {
            alignment,
            aesthetics,
            combined: alpha * alignment + (1.0 - alpha) * aesthetics,
        }
    }
}

/// One A-beats-B fact. Direct facts come from the comparator; inferred ones
/// are derived by transitive closure and never serialised.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparisonFact {
    pub id_a: String,
    pub id_b: String,
    pub winner: PairWinner,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ranks_a: Option<FactorRanks>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ranks_b: Option<FactorRanks>,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub inferred: bool,
}

impl ComparisonFact {
    pub fn winner_id(&self) -> &str {
        match self.winner {
            PairWinner::A => &self.id_a,
            PairWinner::B => &self.id_b,
        }
    }

    pub fn loser_id(&self) -> &str {
        match self.winner {
            PairWinner::A => &self.id_b,
            PairWinner::B => &self.id_a,
        }
    }

    pub fn involves(&self, id: &str) -> bool {
        self.id_a == id || self.id_b == id
    }
}

/// Averages of the per-factor ranks over every comparison a candidate took
/// part in.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateStats {
    pub avg_alignment_rank: f64,
    pub avg_aesthetics_rank: f64,
    pub avg_combined_rank: f64,
    pub comparisons: usize,
}

/// Deduplicated strengths and weaknesses gathered across a candidate's
/// comparisons, used to steer the critique without losing what already works.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedFeedback {
    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(default)]
    pub weaknesses: Vec<String>,
    pub wins: usize,
    pub losses: usize,
}

/// One node of the search tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub candidate_id: String,
    pub parent_id: Option<String>,
    pub what_prompt: String,
    pub how_prompt: String,
    pub combined: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub critique: Option<Critique>,
    pub image: Option<ImageArtifact>,
    pub evaluation: Option<Evaluation>,
    pub total_score: Option<f64>,
    pub status: CandidateStatus,
    pub survived: Option<bool>,
    #[serde(default)]
    pub comparisons: Vec<ComparisonFact>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregated_feedback: Option<AggregatedFeedback>,
}

impl Candidate {
    /// A fresh record in the attempted state, persisted before any risky work.
    pub fn attempted(
        candidate_id: impl Into<String>,
        parent_id: Option<String>,
        what_prompt: impl Into<String>,
        how_prompt: impl Into<String>,
    ) -> Self {
        Self {
            candidate_id: candidate_id.into(),
            parent_id,
            what_prompt: what_prompt.into(),
            how_prompt: how_prompt.into(),
            combined: None,
            negative_prompt: None,
            critique: None,
            image: None,
            evaluation: None,
            total_score: None,
            status: CandidateStatus::Attempted,
            survived: None,
            comparisons: Vec::new(),
            aggregated_feedback: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Iteration {
    pub number: usize,
    pub dimension: Dimension,
    pub candidates: Vec<Candidate>,
    pub best_candidate_id: Option<String>,
    /// Lower is better in pairwise mode, higher is better in absolute mode.
    pub best_score: Option<f64>,
}

impl Iteration {
    pub fn new(number: usize, dimension: Dimension) -> Self {
        Self {
            number,
            dimension,
            candidates: Vec::new(),
            best_candidate_id: None,
            best_score: None,
        }
    }

    pub fn candidate(&self, candidate_id: &str) -> Option<&Candidate> {
        self.candidates.iter().find(|c| c.candidate_id == candidate_id)
    }

    pub fn candidate_mut(&mut self, candidate_id: &str) -> Option<&mut Candidate> {
        self.candidates
            .iter_mut()
            .find(|c| c.candidate_id == candidate_id)
    }
}

/// One link in the root-to-winner chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineageEntry {
    pub iteration: usize,
    pub candidate_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalWinner {
    pub iteration: usize,
    pub candidate_id: String,
    pub total_score: Option<f64>,
}

/// The full session document persisted as metadata.json.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: String,
    pub original_prompt: String,
    pub config: SearchConfig,
    pub created_at: String,
    pub status: SessionStatus,
    pub iterations: Vec<Iteration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_winner: Option<FinalWinner>,
    #[serde(default)]
    pub lineage: Vec<LineageEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Session {
    pub fn new(
        session_id: impl Into<String>,
        original_prompt: impl Into<String>,
        config: SearchConfig,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            original_prompt: original_prompt.into(),
            config,
            created_at: chrono::Local::now().format("%Y-%m-%dT%H:%M:%S").to_string(),
            status: SessionStatus::Running,
            iterations: Vec::new(),
            final_winner: None,
            lineage: Vec::new(),
            error: None,
        }
    }

    pub fn iteration(&self, number: usize) -> Option<&Iteration> {
        self.iterations.iter().find(|it| it.number == number)
    }

    pub fn iteration_mut(&mut self, number: usize) -> Option<&mut Iteration> {
        self.iterations.iter_mut().find(|it| it.number == number)
    }

    /// Walk parent links backwards from the given candidate to the root.
    pub fn lineage_of(&self, iteration: usize, candidate_id: &str) -> Vec<LineageEntry> {
        let mut chain = Vec::new();
        let mut cursor = Some((iteration, candidate_id.to_string()));

        while let Some((iter_no, cand_id)) = cursor.take() {
            chain.push(LineageEntry {
                iteration: iter_no,
                candidate_id: cand_id.clone(),
            });

            let parent = self
                .iteration(iter_no)
                .and_then(|it| it.candidate(&cand_id))
                .and_then(|c| c.parent_id.clone());

            if let Some(parent_id) = parent {
                if iter_no == 0 {
                    break;
                }
                cursor = Some((iter_no - 1, parent_id));
            }
        }

        chain.reverse();
        chain
    }
}

/// One candidate's position in an iteration or global ranking.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankingEntry {
    pub candidate_id: String,
    /// 1 = best.
    pub rank: usize,
    pub wins: usize,
    pub losses: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregate_stats: Option<AggregateStats>,
}

/// The rankings.json satellite document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankingsDocument {
    pub session_id: String,
    #[serde(default)]
    pub iterations: std::collections::BTreeMap<String, Vec<RankingEntry>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_global_ranking: Option<Vec<RankingEntry>>,
}

/// Token usage reported by one provider call.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Session-level token accounting, persisted as tokens.json.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenStats {
    #[serde(default)]
    pub by_operation: std::collections::BTreeMap<String, TokenUsage>,
    pub total_prompt_tokens: u64,
    pub total_completion_tokens: u64,
    pub calls: u64,
}

impl TokenStats {
    pub fn record(&mut self, operation: &str, usage: TokenUsage) {
        let entry = self.by_operation.entry(operation.to_string()).or_default();
        entry.prompt_tokens += usage.prompt_tokens;
        entry.completion_tokens += usage.completion_tokens;
        self.total_prompt_tokens += usage.prompt_tokens;
        self.total_completion_tokens += usage.completion_tokens;
        self.calls += 1;
    }
}

/// Build the canonical candidate id. The id doubles as the image file stem,
/// so iteration and slot are both encoded.
pub fn candidate_id(iteration: usize, slot: usize) -> String {
    format!("iter{}-cand{}", iteration, slot)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dimension_round_trips_through_strings() {
        assert_eq!("what".parse::<Dimension>().unwrap(), Dimension::What);
        assert_eq!(Dimension::How.to_string(), "how");
        assert!("where".parse::<Dimension>().is_err());
    }

    #[test]
    fn config_validation_rejects_bad_shapes() {
        let mut config = SearchConfig::default();
        assert!(config.validate().is_ok());

        config.survivors = 10;
        assert!(config.validate().is_err());

        config = SearchConfig::default();
        config.alpha = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn dimension_alternates_even_what_odd_how() {
        let config = SearchConfig::default();
        assert_eq!(config.dimension_for(0), Dimension::What);
        assert_eq!(config.dimension_for(1), Dimension::How);
        assert_eq!(config.dimension_for(2), Dimension::What);
    }

    #[test]
    fn combined_rank_weights_alignment_by_alpha() {
        let ranks = FactorRanks::new(1.0, 2.0, 0.7);
        assert!((ranks.combined - 1.3).abs() < 1e-9);
    }

    #[test]
    fn lineage_walks_parent_links_to_root() {
        let mut session = Session::new("ses-000001", "a mountain", SearchConfig::default());

        let mut iter0 = Iteration::new(0, Dimension::What);
        iter0
            .candidates
            .push(Candidate::attempted(candidate_id(0, 0), None, "w", "h"));
        iter0
            .candidates
            .push(Candidate::attempted(candidate_id(0, 1), None, "w", "h"));
        session.iterations.push(iter0);

        let mut iter1 = Iteration::new(1, Dimension::How);
        iter1.candidates.push(Candidate::attempted(
            candidate_id(1, 0),
            Some(candidate_id(0, 1)),
            "w",
            "h",
        ));
        session.iterations.push(iter1);

        let lineage = session.lineage_of(1, &candidate_id(1, 0));
        assert_eq!(
            lineage,
            vec![
                LineageEntry {
                    iteration: 0,
                    candidate_id: candidate_id(0, 1)
                },
                LineageEntry {
                    iteration: 1,
                    candidate_id: candidate_id(1, 0)
                },
            ]
        );
    }

    #[test]
    fn session_document_round_trips_with_camel_case_keys() {
        let session = Session::new("ses-120000", "a mountain", SearchConfig::default());
        let json = serde_json::to_string(&session).unwrap();
        assert!(json.contains("\"sessionId\""));
        assert!(json.contains("\"originalPrompt\""));
        let back: Session = serde_json::from_str(&json).unwrap();
        assert_eq!(back.session_id, "ses-120000");
    }

    #[test]
    fn token_stats_accumulate_per_operation() {
        let mut stats = TokenStats::default();
        stats.record(
            "expand",
            TokenUsage {
                prompt_tokens: 10,
                completion_tokens: 5,
            },
        );
        stats.record(
            "expand",
            TokenUsage {
                prompt_tokens: 2,
                completion_tokens: 3,
            },
        );
        assert_eq!(stats.by_operation["expand"].prompt_tokens, 12);
        assert_eq!(stats.total_completion_tokens, 8);
        assert_eq!(stats.calls, 2);
    }
}
