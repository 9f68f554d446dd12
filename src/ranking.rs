use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;

use crate::error::EngineError;
use crate::graph::ComparisonGraph;
use crate::models::{
    AggregatedFeedback, ComparisonFact, FactorRanks, PairWinner, RankingEntry, TokenUsage,
};
use crate::providers::{CompareOptions, PairwiseComparator};
use crate::stream::{NullSink, ProgressSink, StreamRecord};

/// Strategy switchover point: at most C(8,2)=28 direct calls for all-pairs.
const ALL_PAIRS_LIMIT: usize = 8;

/// One image entering a ranking round.
#[derive(Debug, Clone)]
pub struct RankImage {
    pub candidate_id: String,
    pub path: PathBuf,
}

/// How ensemble votes orient each pair. Alternating presentation cancels
/// positional bias deterministically; the fixed variants exist for tests
/// that pin one orientation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PresentationPolicy {
    #[default]
    Alternate,
    Never,
    Always,
}

impl PresentationPolicy {
    fn swapped(self, vote: usize) -> bool {
        match self {
            PresentationPolicy::Alternate => vote % 2 == 1,
            PresentationPolicy::Never => false,
            PresentationPolicy::Always => true,
        }
    }
}

/// Aggregated result of one ensemble over a pair, mapped back to the
/// original identities (a = first argument).
#[derive(Debug, Clone)]
pub struct EnsembleVerdict {
    pub winner: PairWinner,
    pub confidence: f64,
    pub ranks_a: FactorRanks,
    pub ranks_b: FactorRanks,
    /// candidate id -> (strengths earned as winner, weaknesses earned as loser)
    pub feedback: HashMap<String, (Vec<String>, Vec<String>)>,
    pub usage: TokenUsage,
}

/// Full output of one ranking round.
#[derive(Debug)]
pub struct RankingOutcome {
    pub rankings: Vec<RankingEntry>,
    pub graph: ComparisonGraph,
    pub feedback: HashMap<String, AggregatedFeedback>,
    pub errors: Vec<String>,
    pub direct_calls: usize,
    pub inferred_count: usize,
    pub usage: TokenUsage,
}

impl RankingOutcome {
    /// Direct facts where both sides belong to the given id set; used to
    /// seed later rounds.
    pub fn facts_among(&self, ids: &[String]) -> Vec<ComparisonFact> {
        self.graph
            .direct_comparisons()
            .iter()
            .filter(|f| ids.contains(&f.id_a) && ids.contains(&f.id_b))
            .cloned()
            .collect()
    }
}

/// Ranks a set of images by pairwise comparison, without absolute scores.
/// Small sets get every pair; larger sets run a champion tournament. Both
/// consult the comparison graph before paying for a VLM call.
pub struct RankingEngine {
    comparator: Arc<dyn PairwiseComparator>,
    ensemble_size: usize,
    alpha: f64,
    temperature: f64,
    presentation: PresentationPolicy,
    graceful_degradation: bool,
    sink: Arc<dyn ProgressSink>,
}

impl RankingEngine {
    pub fn new(comparator: Arc<dyn PairwiseComparator>, ensemble_size: usize, alpha: f64) -> Self {
        Self {
            comparator,
            ensemble_size: ensemble_size.max(1),
            alpha,
            temperature: 0.2,
            presentation: PresentationPolicy::default(),
            graceful_degradation: true,
            sink: Arc::new(NullSink),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_presentation(mut self, presentation: PresentationPolicy) -> Self {
        self.presentation = presentation;
        self
    }

    pub fn with_graceful_degradation(mut self, graceful: bool) -> Self {
        self.graceful_degradation = graceful;
        self
    }

    /// Produce a complete order over `images`. `known` seeds the graph with
    /// prior facts so already-settled pairs are inferred instead of recompared.
    pub async fn rank(
        &self,
        images: &[RankImage],
        reference_prompt: &str,
        known: &[ComparisonFact],
    ) -> Result<RankingOutcome, EngineError> {
        if images.is_empty() {
            return Err(EngineError::invalid("cannot rank an empty image set"));
        }

        let mut graph = ComparisonGraph::new();
        graph.seed(known);

        let mut round = Round {
            engine: self,
            graph,
            errors: Vec::new(),
            direct_calls: 0,
            inferred_count: 0,
            usage: TokenUsage::default(),
            feedback: HashMap::new(),
        };

        let rankings = if images.len() <= ALL_PAIRS_LIMIT {
            round.all_pairs(images, reference_prompt).await?
        } else {
            round.tournament(images, reference_prompt).await?
        };

        let feedback = round.final_feedback(images);
        Ok(RankingOutcome {
            rankings,
            graph: round.graph,
            feedback,
            errors: round.errors,
            direct_calls: round.direct_calls,
            inferred_count: round.inferred_count,
            usage: round.usage,
        })
    }

    /// Run `ensemble_size` comparator calls over one pair with alternating
    /// presentation, map every vote back to the original identity, and
    /// aggregate.
    pub async fn compare_with_ensemble(
        &self,
        a: &RankImage,
        b: &RankImage,
        reference_prompt: &str,
    ) -> Result<EnsembleVerdict, EngineError> {
        let options = CompareOptions {
            temperature: self.temperature,
            alpha: self.alpha,
        };

        let votes = join_all((0..self.ensemble_size).map(|vote| {
            let swapped = self.presentation.swapped(vote);
            async move {
                let result = if swapped {
                    self.comparator
                        .compare_pair(&b.path, &a.path, reference_prompt, options)
                        .await
                        .map(|verdict| verdict.unswapped())
                } else {
                    self.comparator
                        .compare_pair(&a.path, &b.path, reference_prompt, options)
                        .await
                };
                result
            }
        }))
        .await;

        let mut verdicts = Vec::new();
        let mut failures = Vec::new();
        for vote in votes {
            match vote {
                Ok(verdict) => verdicts.push(verdict),
                Err(err) => failures.push(err.to_string()),
            }
        }

        if verdicts.is_empty() {
            return Err(EngineError::ComparisonFailure(format!(
                "all {} ensemble votes failed: {}",
                self.ensemble_size,
                failures.join("; ")
            )));
        }

        let mut votes_a = 0usize;
        let mut votes_b = 0usize;
        let mut usage = TokenUsage::default();
        let mut feedback: HashMap<String, (Vec<String>, Vec<String>)> = HashMap::new();
        let (mut align_a, mut aes_a, mut align_b, mut aes_b) = (0.0, 0.0, 0.0, 0.0);

        for verdict in &verdicts {
            match verdict.winner {
                PairWinner::A => votes_a += 1,
                PairWinner::B => votes_b += 1,
            }
            align_a += verdict.ranks_a.alignment;
            aes_a += verdict.ranks_a.aesthetics;
            align_b += verdict.ranks_b.alignment;
            aes_b += verdict.ranks_b.aesthetics;
            usage.prompt_tokens += verdict.meta.usage.prompt_tokens;
            usage.completion_tokens += verdict.meta.usage.completion_tokens;

            let (winner_id, loser_id) = match verdict.winner {
                PairWinner::A => (&a.candidate_id, &b.candidate_id),
                PairWinner::B => (&b.candidate_id, &a.candidate_id),
            };
            let winner_entry = feedback.entry(winner_id.clone()).or_default();
            extend_dedup(&mut winner_entry.0, &verdict.winner_strengths);
            let loser_entry = feedback.entry(loser_id.clone()).or_default();
            extend_dedup(&mut loser_entry.1, &verdict.loser_weaknesses);
        }

        let n = verdicts.len() as f64;
        // Average the per-factor ranks, then recompute combined from the
        // averages; averaging pre-combined values would break the alpha
        // weighting.
        let ranks_a = FactorRanks::new(align_a / n, aes_a / n, self.alpha);
        let ranks_b = FactorRanks::new(align_b / n, aes_b / n, self.alpha);

        // Majority vote; ties keep the original A.
        let winner = if votes_b > votes_a {
            PairWinner::B
        } else {
            PairWinner::A
        };
        let confidence = votes_a.max(votes_b) as f64 / self.ensemble_size as f64;

        Ok(EnsembleVerdict {
            winner,
            confidence,
            ranks_a,
            ranks_b,
            feedback,
            usage,
        })
    }
}

fn extend_dedup(into: &mut Vec<String>, items: &[String]) {
    for item in items {
        if !into.contains(item) {
            into.push(item.clone());
        }
    }
}

/// Mutable state of one ranking round.
struct Round<'a> {
    engine: &'a RankingEngine,
    graph: ComparisonGraph,
    errors: Vec<String>,
    direct_calls: usize,
    inferred_count: usize,
    usage: TokenUsage,
    feedback: HashMap<String, (Vec<String>, Vec<String>)>,
}

impl Round<'_> {
    async fn all_pairs(
        &mut self,
        images: &[RankImage],
        reference_prompt: &str,
    ) -> Result<Vec<RankingEntry>, EngineError> {
        let total_pairs = images.len() * images.len().saturating_sub(1) / 2;
        let mut resolved = 0usize;

        for i in 0..images.len() {
            for j in (i + 1)..images.len() {
                resolved += 1;
                self.settle_pair(
                    &images[i],
                    &images[j],
                    reference_prompt,
                    resolved as f64 / total_pairs.max(1) as f64,
                )
                .await?;
            }
        }

        let keys: Vec<String> = images.iter().map(|img| img.candidate_id.clone()).collect();
        Ok(self.graph.rankings(&keys))
    }

    /// Selection tournament: each round walks the remaining images to find
    /// the champion, preferring inference over fresh comparisons. The pop
    /// order is the ranking.
    async fn tournament(
        &mut self,
        images: &[RankImage],
        reference_prompt: &str,
    ) -> Result<Vec<RankingEntry>, EngineError> {
        let mut pool: Vec<RankImage> = images.to_vec();
        let mut order: Vec<String> = Vec::with_capacity(images.len());
        let total = images.len();

        while pool.len() > 1 {
            let mut champion = 0usize;
            for challenger in 1..pool.len() {
                let progress = order.len() as f64 / total as f64;
                let winner_id = self
                    .settle_pair(&pool[champion], &pool[challenger], reference_prompt, progress)
                    .await?;
                if winner_id.as_deref() == Some(pool[challenger].candidate_id.as_str()) {
                    champion = challenger;
                }
            }
            order.push(pool.remove(champion).candidate_id);
        }
        if let Some(last) = pool.pop() {
            order.push(last.candidate_id);
        }

        Ok(order
            .into_iter()
            .enumerate()
            .map(|(idx, candidate_id)| RankingEntry {
                rank: idx + 1,
                wins: self.graph.wins(&candidate_id),
                losses: self.graph.losses(&candidate_id),
                aggregate_stats: self.graph.aggregate_stats(&candidate_id),
                candidate_id,
            })
            .collect())
    }

    /// Decide one pair: inference first, comparator ensemble second. Returns
    /// the winner id, or None when the pair could not be decided (the error
    /// is logged and the ranking continues).
    async fn settle_pair(
        &mut self,
        a: &RankImage,
        b: &RankImage,
        reference_prompt: &str,
        progress: f64,
    ) -> Result<Option<String>, EngineError> {
        if let Some(inference) = self.graph.can_infer(&a.candidate_id, &b.candidate_id) {
            self.inferred_count += 1;
            self.engine.sink.emit(StreamRecord::progress(
                progress,
                format!(
                    "{} vs {}: inferred winner {}",
                    a.candidate_id, b.candidate_id, inference.winner_id
                ),
            ));
            return Ok(Some(inference.winner_id));
        }

        let started = Instant::now();
        match self
            .engine
            .compare_with_ensemble(a, b, reference_prompt)
            .await
        {
            Ok(verdict) => {
                self.direct_calls += 1;
                self.usage.prompt_tokens += verdict.usage.prompt_tokens;
                self.usage.completion_tokens += verdict.usage.completion_tokens;

                self.graph.record(
                    &a.candidate_id,
                    &b.candidate_id,
                    verdict.winner,
                    Some((verdict.ranks_a, verdict.ranks_b)),
                )?;

                for (id, (strengths, weaknesses)) in verdict.feedback {
                    let entry = self.feedback.entry(id).or_default();
                    extend_dedup(&mut entry.0, &strengths);
                    extend_dedup(&mut entry.1, &weaknesses);
                }

                let winner_id = match verdict.winner {
                    PairWinner::A => a.candidate_id.clone(),
                    PairWinner::B => b.candidate_id.clone(),
                };
                self.engine.sink.emit(StreamRecord::progress(
                    progress,
                    format!(
                        "{} vs {}: direct winner {} (confidence {:.2}) in {}ms",
                        a.candidate_id,
                        b.candidate_id,
                        winner_id,
                        verdict.confidence,
                        started.elapsed().as_millis()
                    ),
                ));
                Ok(Some(winner_id))
            }
            Err(err) => {
                if !self.engine.graceful_degradation {
                    return Err(err);
                }
                tracing::warn!(
                    a = %a.candidate_id,
                    b = %b.candidate_id,
                    error = %err,
                    "comparison failed, pair contributes no edge"
                );
                self.errors
                    .push(format!("{} vs {}: {err}", a.candidate_id, b.candidate_id));
                self.engine.sink.emit(StreamRecord::error(format!(
                    "{} vs {} failed: {err}",
                    a.candidate_id, b.candidate_id
                )));
                Ok(None)
            }
        }
    }

    fn final_feedback(&self, images: &[RankImage]) -> HashMap<String, AggregatedFeedback> {
        images
            .iter()
            .map(|img| {
                let (strengths, weaknesses) = self
                    .feedback
                    .get(&img.candidate_id)
                    .cloned()
                    .unwrap_or_default();
                (
                    img.candidate_id.clone(),
                    AggregatedFeedback {
                        strengths,
                        weaknesses,
                        wins: self.graph.wins(&img.candidate_id),
                        losses: self.graph.losses(&img.candidate_id),
                    },
                )
            })
            .collect()
    }
}
