use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures::stream::{self, StreamExt};

use crate::config::EngineConfig;
use crate::critique::{CritiqueGenerator, CritiqueRequest};
use crate::error::EngineError;
use crate::gpu::{GpuCoordinator, ServiceKind};
use crate::metadata::{CandidateResults, MetadataTracker, RankingEnrichment};
use crate::models::{
    candidate_id, Candidate, ComparisonFact, Critique, Dimension, FinalWinner, ImageArtifact,
    RankingMode, SearchConfig, Session, SessionStatus, TokenStats, TokenUsage,
};
use crate::moderation::ModerationRefiner;
use crate::providers::{
    CombineOptions, ExpandOptions, ImageRequest, LlmText, RefineOptions,
};
use crate::ranking::{RankImage, RankingEngine, RankingOutcome};
use crate::registry::{ProviderBackend, ProviderSelection, ProviderSet};
use crate::session::{self, SessionPaths};
use crate::stream::{NullSink, ProgressSink, StreamRecord};

/// Which provider calls must run under the GPU coordinator's combinators.
/// Cloud and mock backends never touch the local accelerator.
#[derive(Debug, Clone, Copy)]
struct GpuGates {
    llm: bool,
    image: bool,
    vision: bool,
    vlm: bool,
}

impl GpuGates {
    fn from_selection(selection: ProviderSelection) -> Self {
        Self {
            llm: selection.llm == ProviderBackend::Local,
            image: selection.image == ProviderBackend::Local,
            vision: selection.vision == ProviderBackend::Local,
            vlm: selection.ranking == ProviderBackend::Local,
        }
    }
}

/// A candidate planned for one iteration, before any risky work.
#[derive(Debug, Clone)]
struct PlannedCandidate {
    candidate_id: String,
    parent_id: Option<String>,
    what_prompt: String,
    how_prompt: String,
    /// The critique that drove this branch (parent's, for warm iterations).
    critique: Option<Critique>,
}

/// A candidate that finished generation.
#[derive(Debug, Clone)]
struct CompletedCandidate {
    candidate_id: String,
    image_path: PathBuf,
}

/// A survivor carried into the next iteration.
#[derive(Debug, Clone)]
struct SurvivorInfo {
    iteration: usize,
    candidate_id: String,
    what_prompt: String,
    how_prompt: String,
    critique: Critique,
    image_path: PathBuf,
    rank: usize,
    /// Absolute score, present in scoring mode only.
    score: Option<f64>,
}

/// Result of a full search session.
#[derive(Debug)]
pub struct SearchOutcome {
    pub session: Session,
    pub paths: SessionPaths,
    pub tokens: TokenStats,
    pub wall_seconds: f64,
}

impl SearchOutcome {
    pub fn winner(&self) -> Option<&FinalWinner> {
        self.session.final_winner.as_ref()
    }

    /// Path of the winning image, when there is one.
    pub fn winner_image(&self) -> Option<PathBuf> {
        let winner = self.session.final_winner.as_ref()?;
        Some(self.paths.image_path(&winner.candidate_id))
    }
}

/// Drives one search session: expand, generate, rank, select, critique,
/// repeat. Iterations are sequential; candidate work inside an iteration
/// fans out to a bounded worker pool.
pub struct BeamSearchScheduler {
    engine_config: EngineConfig,
    search: SearchConfig,
    providers: Arc<ProviderSet>,
    coordinator: Arc<GpuCoordinator>,
    moderation: ModerationRefiner,
    critiques: CritiqueGenerator,
    sink: Arc<dyn ProgressSink>,
    gates: GpuGates,
    negative_prompt: Option<String>,
    cancelled: Arc<AtomicBool>,
    tokens: Mutex<TokenStats>,
}

impl BeamSearchScheduler {
    pub fn new(
        engine_config: EngineConfig,
        search: SearchConfig,
        providers: Arc<ProviderSet>,
        selection: ProviderSelection,
        coordinator: Arc<GpuCoordinator>,
    ) -> Self {
        Self {
            moderation: ModerationRefiner::new(providers.rewriter.clone()),
            critiques: CritiqueGenerator::new(providers.critic.clone()),
            gates: GpuGates::from_selection(selection),
            engine_config,
            search,
            providers,
            coordinator,
            sink: Arc::new(NullSink),
            negative_prompt: None,
            cancelled: Arc::new(AtomicBool::new(false)),
            tokens: Mutex::new(TokenStats::default()),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_negative_prompt(mut self, negative_prompt: Option<String>) -> Self {
        self.negative_prompt = negative_prompt;
        self
    }

    /// Handle for the host to request cancellation; honoured at the next
    /// iteration boundary.
    pub fn cancellation(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    fn track(&self, operation: &str, usage: TokenUsage) {
        self.tokens
            .lock()
            .expect("token stats poisoned")
            .record(operation, usage);
    }

    fn track_llm(&self, operation: &str, reply: &LlmText) {
        self.track(operation, reply.meta.usage);
    }

    /// Run a provider call under the right GPU combinator, with one
    /// coordinator-driven restart on transient failure. Non-local backends
    /// run directly.
    async fn gated<T, F, Fut>(
        &self,
        kind: ServiceKind,
        enabled: bool,
        op: F,
    ) -> Result<T, EngineError>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, EngineError>> + Send,
    {
        if !enabled {
            return op().await;
        }

        let coordinator = &self.coordinator;
        let recovered = || coordinator.run_with_recovery(kind, &op);
        match kind {
            ServiceKind::Llm => coordinator.with_llm_operation(recovered).await,
            ServiceKind::Image => coordinator.with_image_gen_operation(recovered).await,
            ServiceKind::Vlm => coordinator.with_vlm_operation(recovered).await,
            ServiceKind::Vision => coordinator.with_gpu_lock(recovered).await,
        }
    }

    /// Execute a session end to end.
    pub async fn run(&self, user_prompt: &str) -> Result<SearchOutcome, EngineError> {
        let started = Instant::now();
        let user_prompt = user_prompt.trim();
        if user_prompt.is_empty() {
            return Err(EngineError::invalid("prompt must not be empty"));
        }
        self.search.validate()?;

        let session_id = session::new_session_id();
        let paths = SessionPaths::new(self.engine_config.root.clone(), &session_id);
        let tracker = MetadataTracker::initialize(
            paths.clone(),
            Session::new(&session_id, user_prompt, self.search.clone()),
        )
        .await?;

        self.sink.emit(StreamRecord::started(format!(
            "session {session_id}: searching for {user_prompt:?}"
        )));
        tracing::info!(%session_id, prompt = %user_prompt, "session started");

        let result = self.drive(user_prompt, &paths, &tracker).await;

        let tokens = self
            .tokens
            .lock()
            .expect("token stats poisoned")
            .clone();
        tracker.persist_tokens(tokens.clone()).await?;

        match result {
            Ok(()) => {}
            Err(err) => {
                tracing::error!(error = %err, "session failed");
                self.sink.emit(StreamRecord::error(err.to_string()));
                tracker
                    .set_status(SessionStatus::Failed, Some(err.to_string()))
                    .await?;
            }
        }

        let session = tracker.snapshot().await?;
        Ok(SearchOutcome {
            session,
            paths,
            tokens,
            wall_seconds: started.elapsed().as_secs_f64(),
        })
    }

    async fn drive(
        &self,
        user_prompt: &str,
        paths: &SessionPaths,
        tracker: &MetadataTracker,
    ) -> Result<(), EngineError> {
        let mut survivors: Vec<SurvivorInfo> = Vec::new();
        let mut all_survivors: Vec<SurvivorInfo> = Vec::new();
        let mut survivor_facts: Vec<ComparisonFact> = Vec::new();

        for iteration in 0..self.search.max_iterations {
            if self.cancelled.load(Ordering::SeqCst) {
                tracing::info!(iteration, "cancelled at iteration boundary");
                tracker
                    .set_status(SessionStatus::Failed, Some("cancelled".to_string()))
                    .await?;
                return Ok(());
            }

            let dimension = self.search.dimension_for(iteration);
            self.sink.emit(StreamRecord::info(format!(
                "iteration {iteration}: refining {dimension}"
            )));

            let plans = if iteration == 0 {
                self.plan_cold_start(user_prompt).await?
            } else {
                self.plan_branches(iteration, dimension, user_prompt, &survivors)
                    .await?
            };

            let completed = self
                .generate_candidates(iteration, dimension, paths, tracker, plans)
                .await;

            if completed.is_empty() {
                return Err(EngineError::fatal(format!(
                    "iteration {iteration}: no candidate completed generation"
                )));
            }

            let outcome = self
                .rank_iteration(iteration, user_prompt, tracker, &completed, &survivor_facts)
                .await?;
            self.track("compare", outcome.usage);
            tracker
                .record_iteration_ranking(iteration, outcome.rankings.clone())
                .await?;

            survivors = self
                .select_survivors(iteration, user_prompt, tracker, &completed, &outcome)
                .await?;

            let survivor_ids: Vec<String> =
                survivors.iter().map(|s| s.candidate_id.clone()).collect();
            survivor_facts.extend(outcome.facts_among(&survivor_ids));
            all_survivors.extend(survivors.iter().cloned());

            // A pool collapsed below the configured width cannot branch as
            // requested; stop early and settle the winner from what exists.
            if survivors.len() == 1 && self.search.survivors > 1 {
                tracing::info!(iteration, "survivor pool collapsed, stopping early");
                break;
            }
        }

        self.finish(user_prompt, tracker, &all_survivors, &survivor_facts)
            .await
    }

    /// Iteration 0: expand both dimensions independently and pair the
    /// strands up into N fresh candidates.
    async fn plan_cold_start(
        &self,
        user_prompt: &str,
    ) -> Result<Vec<PlannedCandidate>, EngineError> {
        let mut plans = Vec::with_capacity(self.search.beam_width);

        for slot in 0..self.search.beam_width {
            let what = self
                .gated(ServiceKind::Llm, self.gates.llm, || {
                    self.providers.llm.expand(
                        user_prompt,
                        ExpandOptions {
                            dimension: Some(Dimension::What),
                            ..Default::default()
                        },
                    )
                })
                .await?;
            self.track_llm("expand", &what);

            let how = self
                .gated(ServiceKind::Llm, self.gates.llm, || {
                    self.providers.llm.expand(
                        user_prompt,
                        ExpandOptions {
                            dimension: Some(Dimension::How),
                            ..Default::default()
                        },
                    )
                })
                .await?;
            self.track_llm("expand", &how);

            plans.push(PlannedCandidate {
                candidate_id: candidate_id(0, slot),
                parent_id: None,
                what_prompt: what.text,
                how_prompt: how.text,
                critique: None,
            });
        }

        Ok(plans)
    }

    /// Warm iterations: each survivor branches into N/M children by refining
    /// the targeted dimension. Parents are assigned round-robin in rank
    /// order, candidate id breaking ties, so non-integral N/M stays
    /// deterministic.
    async fn plan_branches(
        &self,
        iteration: usize,
        dimension: Dimension,
        user_prompt: &str,
        survivors: &[SurvivorInfo],
    ) -> Result<Vec<PlannedCandidate>, EngineError> {
        let mut parents: Vec<&SurvivorInfo> = survivors.iter().collect();
        parents.sort_by(|a, b| {
            a.rank
                .cmp(&b.rank)
                .then(a.candidate_id.cmp(&b.candidate_id))
        });

        let mut plans = Vec::with_capacity(self.search.beam_width);
        for slot in 0..self.search.beam_width {
            let parent = parents[slot % parents.len()];

            let target = match dimension {
                Dimension::What => &parent.what_prompt,
                Dimension::How => &parent.how_prompt,
            };

            let refined = self
                .gated(ServiceKind::Llm, self.gates.llm, || {
                    self.providers.llm.refine(
                        target,
                        RefineOptions {
                            dimension,
                            critique: parent.critique.clone(),
                            original_user_prompt: user_prompt.to_string(),
                            style: None,
                        },
                    )
                })
                .await?;
            self.track_llm("refine", &refined);

            let (what_prompt, how_prompt) = match dimension {
                Dimension::What => (refined.text, parent.how_prompt.clone()),
                Dimension::How => (parent.what_prompt.clone(), refined.text),
            };

            plans.push(PlannedCandidate {
                candidate_id: candidate_id(iteration, slot),
                parent_id: Some(parent.candidate_id.clone()),
                what_prompt,
                how_prompt,
                critique: Some(parent.critique.clone()),
            });
        }

        Ok(plans)
    }

    /// Fan candidate generation out over the worker pool. Failures mark the
    /// candidate and drop it from the iteration instead of aborting.
    async fn generate_candidates(
        &self,
        iteration: usize,
        dimension: Dimension,
        paths: &SessionPaths,
        tracker: &MetadataTracker,
        plans: Vec<PlannedCandidate>,
    ) -> Vec<CompletedCandidate> {
        let completed: Vec<Option<CompletedCandidate>> = stream::iter(plans)
            .map(|plan| async move {
                let id = plan.candidate_id.clone();
                match self
                    .process_candidate(iteration, dimension, paths, tracker, plan)
                    .await
                {
                    Ok(candidate) => Some(candidate),
                    Err(err) => {
                        self.sink
                            .emit(StreamRecord::error(format!("{id}: {err}")));
                        if let Err(mark_err) =
                            tracker.mark_candidate_failed(iteration, &id, &err.to_string()).await
                        {
                            tracing::error!(error = %mark_err, "failed to mark candidate failed");
                        }
                        None
                    }
                }
            })
            .buffer_unordered(self.search.worker_pool)
            .collect()
            .await;

        let mut completed: Vec<CompletedCandidate> = completed.into_iter().flatten().collect();
        completed.sort_by(|a, b| a.candidate_id.cmp(&b.candidate_id));
        completed
    }

    /// One candidate: record the attempt, combine prompts, generate the
    /// image (moderated), materialise it under the session directory, and
    /// persist the results.
    async fn process_candidate(
        &self,
        iteration: usize,
        dimension: Dimension,
        paths: &SessionPaths,
        tracker: &MetadataTracker,
        plan: PlannedCandidate,
    ) -> Result<CompletedCandidate, EngineError> {
        let mut record = Candidate::attempted(
            plan.candidate_id.clone(),
            plan.parent_id.clone(),
            plan.what_prompt.clone(),
            plan.how_prompt.clone(),
        );
        record.critique = plan.critique.clone();
        tracker.record_attempt(iteration, dimension, record).await?;

        let combined = self
            .gated(ServiceKind::Llm, self.gates.llm, || {
                self.providers
                    .llm
                    .combine(&plan.what_prompt, &plan.how_prompt, CombineOptions::default())
            })
            .await?;
        self.track_llm("combine", &combined);

        let request = ImageRequest {
            width: self.engine_config.image_width,
            height: self.engine_config.image_height,
            steps: self.engine_config.flux_steps,
            guidance: self.engine_config.flux_guidance,
            seed: None,
            negative_prompt: self.negative_prompt.clone(),
            iteration,
            candidate_id: plan.candidate_id.clone(),
            session_id: paths.session_id.clone(),
        };

        let moderated = self
            .moderation
            .run(&combined.text, |prompt| {
                let request = request.clone();
                async move {
                    self.gated(ServiceKind::Image, self.gates.image, || {
                        self.providers.image.generate(&prompt, request.clone())
                    })
                    .await
                }
            })
            .await?;
        let output = moderated.value;
        self.track("image", output.meta.usage);

        // Materialise into the canonical session layout. Off-process
        // services hand back scratch paths that must be copied over.
        let dest = paths.image_path(&plan.candidate_id);
        if let Some(bytes) = &output.bytes {
            session::save_image(bytes, &dest)?;
        } else if let Some(temp) = &output.temp_path {
            session::adopt_image(temp, &dest)?;
        } else {
            return Err(EngineError::parse(
                "image provider returned neither bytes nor a path",
            ));
        }

        let base_image_path = match &output.base_temp_path {
            Some(temp) => {
                let base_dest = paths.base_image_path(&plan.candidate_id);
                session::adopt_image(temp, &base_dest)?;
                Some(base_dest.display().to_string())
            }
            None => None,
        };

        // Absolute mode still runs the legacy vision scorer; pairwise mode
        // leaves evaluation null and lets ranks drive selection.
        let (evaluation, total_score) = match self.search.ranking_mode {
            RankingMode::Absolute => {
                let (evaluation, meta) = self
                    .gated(ServiceKind::Vision, self.gates.vision, || {
                        self.providers.vision.analyze(&dest, &plan.what_prompt)
                    })
                    .await?;
                self.track("analyze", meta.usage);
                let score = self.search.alpha * evaluation.alignment
                    + (1.0 - self.search.alpha) * evaluation.aesthetic * 10.0;
                (Some(evaluation), Some(score))
            }
            RankingMode::Pairwise => (None, None),
        };

        tracker
            .update_attempt_with_results(
                iteration,
                &plan.candidate_id,
                CandidateResults {
                    combined: moderated.final_prompt,
                    image: ImageArtifact {
                        url: output.url.clone(),
                        local_path: dest.display().to_string(),
                        base_image_path,
                    },
                    negative_prompt: self.negative_prompt.clone(),
                    evaluation,
                    total_score,
                },
                None,
            )
            .await?;

        Ok(CompletedCandidate {
            candidate_id: plan.candidate_id,
            image_path: dest,
        })
    }

    async fn rank_iteration(
        &self,
        iteration: usize,
        user_prompt: &str,
        tracker: &MetadataTracker,
        completed: &[CompletedCandidate],
        known: &[ComparisonFact],
    ) -> Result<RankingOutcome, EngineError> {
        match self.search.ranking_mode {
            RankingMode::Pairwise => {
                let images: Vec<RankImage> = completed
                    .iter()
                    .map(|c| RankImage {
                        candidate_id: c.candidate_id.clone(),
                        path: c.image_path.clone(),
                    })
                    .collect();

                let engine = RankingEngine::new(
                    self.providers.comparator.clone(),
                    self.search.ensemble_size,
                    self.search.alpha,
                )
                .with_sink(self.sink.clone());

                // The whole ranking runs under the VLM combinator so the
                // comparator owns the GPU for its duration.
                if self.gates.vlm {
                    self.coordinator
                        .with_vlm_operation(|| engine.rank(&images, user_prompt, known))
                        .await
                } else {
                    engine.rank(&images, user_prompt, known).await
                }
            }
            RankingMode::Absolute => self.rank_by_scores(iteration, tracker).await,
        }
    }

    /// Legacy scoring mode: order by the vision scores already attached to
    /// the candidates, higher being better. No comparator calls.
    async fn rank_by_scores(
        &self,
        iteration: usize,
        tracker: &MetadataTracker,
    ) -> Result<RankingOutcome, EngineError> {
        let session = tracker.snapshot().await?;
        let iter = session
            .iteration(iteration)
            .ok_or_else(|| EngineError::fatal(format!("iteration {iteration} missing")))?;

        let mut scored: Vec<(&Candidate, f64)> = iter
            .candidates
            .iter()
            .filter(|c| c.status == crate::models::CandidateStatus::Completed)
            .map(|c| (c, c.total_score.unwrap_or(0.0)))
            .collect();
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.candidate_id.cmp(&b.0.candidate_id))
        });

        let mut feedback = std::collections::HashMap::new();
        let rankings = scored
            .iter()
            .enumerate()
            .map(|(idx, (candidate, _))| {
                if let Some(evaluation) = &candidate.evaluation {
                    feedback.insert(
                        candidate.candidate_id.clone(),
                        crate::models::AggregatedFeedback {
                            strengths: evaluation.strengths.clone(),
                            weaknesses: evaluation.weaknesses.clone(),
                            wins: 0,
                            losses: 0,
                        },
                    );
                }
                crate::models::RankingEntry {
                    candidate_id: candidate.candidate_id.clone(),
                    rank: idx + 1,
                    wins: 0,
                    losses: 0,
                    aggregate_stats: None,
                }
            })
            .collect();

        Ok(RankingOutcome {
            rankings,
            graph: crate::graph::ComparisonGraph::new(),
            feedback,
            errors: Vec::new(),
            direct_calls: 0,
            inferred_count: 0,
            usage: TokenUsage::default(),
        })
    }

    /// Mark survival flags, attach ranking data, and write forward-looking
    /// critiques for the survivors.
    async fn select_survivors(
        &self,
        iteration: usize,
        user_prompt: &str,
        tracker: &MetadataTracker,
        completed: &[CompletedCandidate],
        outcome: &RankingOutcome,
    ) -> Result<Vec<SurvivorInfo>, EngineError> {
        let field = outcome.rankings.len();

        for entry in &outcome.rankings {
            tracker
                .enrich_candidate_with_ranking_data(
                    iteration,
                    &entry.candidate_id,
                    RankingEnrichment {
                        comparisons: outcome.graph.comparisons_for(&entry.candidate_id),
                        aggregated_feedback: outcome.feedback.get(&entry.candidate_id).cloned(),
                        critique: None,
                    },
                )
                .await?;

            let survived = entry.rank <= self.search.survivors;
            tracker
                .mark_survival(iteration, &entry.candidate_id, survived)
                .await?;
        }

        let session = tracker.snapshot().await?;
        let next_dimension = self.search.dimension_for(iteration + 1);
        let mut survivors = Vec::new();

        for entry in outcome
            .rankings
            .iter()
            .filter(|e| e.rank <= self.search.survivors)
        {
            let candidate = session
                .iteration(iteration)
                .and_then(|it| it.candidate(&entry.candidate_id))
                .ok_or_else(|| {
                    EngineError::fatal(format!("ranked candidate {} missing", entry.candidate_id))
                })?;

            let critique = self
                .critiques
                .generate(&CritiqueRequest {
                    dimension: next_dimension,
                    original_prompt: user_prompt.to_string(),
                    what_prompt: candidate.what_prompt.clone(),
                    how_prompt: candidate.how_prompt.clone(),
                    rank: entry.rank,
                    of: field,
                    feedback: candidate.aggregated_feedback.clone().unwrap_or_default(),
                    evaluation: candidate.evaluation.clone(),
                })
                .await;

            tracker
                .enrich_candidate_with_ranking_data(
                    iteration,
                    &entry.candidate_id,
                    RankingEnrichment {
                        critique: Some(critique.clone()),
                        ..Default::default()
                    },
                )
                .await?;

            let image_path = completed
                .iter()
                .find(|c| c.candidate_id == entry.candidate_id)
                .map(|c| c.image_path.clone())
                .ok_or_else(|| {
                    EngineError::fatal(format!("survivor {} has no image", entry.candidate_id))
                })?;

            survivors.push(SurvivorInfo {
                iteration,
                candidate_id: entry.candidate_id.clone(),
                what_prompt: candidate.what_prompt.clone(),
                how_prompt: candidate.how_prompt.clone(),
                critique,
                image_path,
                rank: entry.rank,
                score: candidate.total_score,
            });
        }

        self.sink.emit(StreamRecord::info(format!(
            "iteration {iteration}: {} of {field} candidates survive",
            survivors.len()
        )));

        Ok(survivors)
    }

    /// Settle the global winner across every survivor of every iteration.
    async fn finish(
        &self,
        user_prompt: &str,
        tracker: &MetadataTracker,
        all_survivors: &[SurvivorInfo],
        survivor_facts: &[ComparisonFact],
    ) -> Result<(), EngineError> {
        if all_survivors.is_empty() {
            // I = 0: the session completes immediately with no winner.
            tracker.set_status(SessionStatus::Completed, None).await?;
            self.sink
                .emit(StreamRecord::complete("session complete (no iterations)"));
            return Ok(());
        }

        let (global_rankings, winner_score) = match self.search.ranking_mode {
            RankingMode::Pairwise => {
                let images: Vec<RankImage> = all_survivors
                    .iter()
                    .map(|s| RankImage {
                        candidate_id: s.candidate_id.clone(),
                        path: s.image_path.clone(),
                    })
                    .collect();

                let engine = RankingEngine::new(
                    self.providers.comparator.clone(),
                    self.search.ensemble_size,
                    self.search.alpha,
                )
                .with_sink(self.sink.clone());

                let global = if self.gates.vlm {
                    self.coordinator
                        .with_vlm_operation(|| engine.rank(&images, user_prompt, survivor_facts))
                        .await?
                } else {
                    engine.rank(&images, user_prompt, survivor_facts).await?
                };
                self.track("compare", global.usage);

                let winner_score = global.rankings[0]
                    .aggregate_stats
                    .map(|stats| stats.avg_combined_rank);
                (global.rankings, winner_score)
            }
            RankingMode::Absolute => {
                // Highest score wins; no comparator round.
                let mut ordered: Vec<&SurvivorInfo> = all_survivors.iter().collect();
                ordered.sort_by(|a, b| {
                    b.score
                        .unwrap_or(0.0)
                        .partial_cmp(&a.score.unwrap_or(0.0))
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then(a.candidate_id.cmp(&b.candidate_id))
                });
                let rankings: Vec<crate::models::RankingEntry> = ordered
                    .iter()
                    .enumerate()
                    .map(|(idx, s)| crate::models::RankingEntry {
                        candidate_id: s.candidate_id.clone(),
                        rank: idx + 1,
                        wins: 0,
                        losses: 0,
                        aggregate_stats: None,
                    })
                    .collect();
                let winner_score = ordered[0].score;
                (rankings, winner_score)
            }
        };

        tracker
            .record_final_global_ranking(global_rankings.clone())
            .await?;

        let top = &global_rankings[0];
        let winner_info = all_survivors
            .iter()
            .find(|s| s.candidate_id == top.candidate_id)
            .ok_or_else(|| EngineError::fatal("global winner missing from survivor set"))?;

        tracker
            .mark_final_winner(FinalWinner {
                iteration: winner_info.iteration,
                candidate_id: winner_info.candidate_id.clone(),
                total_score: winner_score,
            })
            .await?;
        tracker.set_status(SessionStatus::Completed, None).await?;

        self.sink.emit(StreamRecord::complete(format!(
            "winner: {} from iteration {}",
            winner_info.candidate_id, winner_info.iteration
        )));
        tracing::info!(winner = %winner_info.candidate_id, "session complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderMode;
    use crate::registry::ProviderRegistry;

    fn scheduler_in(dir: &std::path::Path, search: SearchConfig) -> BeamSearchScheduler {
        let config = EngineConfig {
            provider_mode: ProviderMode::Mock,
            root: dir.to_path_buf(),
            services_dir: dir.join("services"),
            ..EngineConfig::default()
        };
        let coordinator = Arc::new(GpuCoordinator::disabled(&config));
        let registry = ProviderRegistry::new(config.clone(), coordinator.clone()).unwrap();
        let selection = registry.selection();
        BeamSearchScheduler::new(config, search, registry.current(), selection, coordinator)
    }

    #[tokio::test]
    async fn single_candidate_session_completes() {
        let dir = tempfile::tempdir().unwrap();
        let search = SearchConfig {
            beam_width: 1,
            survivors: 1,
            max_iterations: 1,
            ensemble_size: 1,
            ..SearchConfig::default()
        };
        let outcome = scheduler_in(dir.path(), search).run("a mountain").await.unwrap();

        assert_eq!(outcome.session.status, SessionStatus::Completed);
        let winner = outcome.winner().expect("winner set");
        assert_eq!(winner.candidate_id, "iter0-cand0");
        assert_eq!(outcome.session.lineage.len(), 1);

        // Rank 1 is trivial, but the survivor still carries a critique.
        let candidate = outcome.session.iteration(0).unwrap().candidate("iter0-cand0").unwrap();
        assert!(candidate.critique.is_some());
        assert!(outcome.winner_image().unwrap().exists());
    }

    #[tokio::test]
    async fn zero_iterations_completes_without_winner() {
        let dir = tempfile::tempdir().unwrap();
        let search = SearchConfig {
            max_iterations: 0,
            ..SearchConfig::default()
        };
        let outcome = scheduler_in(dir.path(), search).run("a mountain").await.unwrap();

        assert_eq!(outcome.session.status, SessionStatus::Completed);
        assert!(outcome.session.final_winner.is_none());
        assert!(outcome.session.iterations.is_empty());
        assert!(outcome.session.lineage.is_empty());
    }

    #[tokio::test]
    async fn empty_prompt_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = scheduler_in(dir.path(), SearchConfig::default())
            .run("   ")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn cancellation_stops_at_iteration_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = scheduler_in(dir.path(), SearchConfig::default());
        scheduler.cancellation().store(true, Ordering::SeqCst);

        let outcome = scheduler.run("a mountain").await.unwrap();
        assert_eq!(outcome.session.status, SessionStatus::Failed);
        assert_eq!(outcome.session.error.as_deref(), Some("cancelled"));
        assert!(outcome.session.iterations.is_empty());
    }
}
