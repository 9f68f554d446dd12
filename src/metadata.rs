use std::collections::BTreeMap;

use tokio::sync::{mpsc, oneshot};

use crate::error::EngineError;
use crate::models::{
    AggregatedFeedback, Candidate, CandidateStatus, ComparisonFact, Critique, Dimension,
    Evaluation, FinalWinner, ImageArtifact, Iteration, RankingEntry, RankingMode,
    RankingsDocument, Session, SessionStatus, TokenStats,
};
use crate::session::SessionPaths;

/// Everything learned about a candidate once generation finishes.
#[derive(Debug, Clone)]
pub struct CandidateResults {
    pub combined: String,
    pub image: ImageArtifact,
    pub negative_prompt: Option<String>,
    /// Null in pairwise mode, where ranks are authoritative.
    pub evaluation: Option<Evaluation>,
    pub total_score: Option<f64>,
}

/// Ranking outputs attached to a completed candidate.
#[derive(Debug, Clone, Default)]
pub struct RankingEnrichment {
    pub comparisons: Vec<ComparisonFact>,
    pub aggregated_feedback: Option<AggregatedFeedback>,
    pub critique: Option<Critique>,
}

enum Command {
    RecordAttempt {
        iteration: usize,
        dimension: Dimension,
        candidate: Candidate,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    UpdateResults {
        iteration: usize,
        candidate_id: String,
        results: CandidateResults,
        survived: Option<bool>,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    MarkCandidateFailed {
        iteration: usize,
        candidate_id: String,
        error: String,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    MarkSurvival {
        iteration: usize,
        candidate_id: String,
        survived: bool,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Enrich {
        iteration: usize,
        candidate_id: String,
        enrichment: RankingEnrichment,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    RecordIterationRanking {
        iteration: usize,
        ranking: Vec<RankingEntry>,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    RecordFinalGlobalRanking {
        ranking: Vec<RankingEntry>,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    MarkFinalWinner {
        winner: FinalWinner,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    SetStatus {
        status: SessionStatus,
        error: Option<String>,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    PersistTokens {
        stats: TokenStats,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Snapshot {
        reply: oneshot::Sender<Session>,
    },
}

/// Owns the session document and its satellite files. Every mutation flows
/// through a single-lane queue into one writer task, so concurrent candidate
/// workers can never interleave writes; each mutation rewrites the full JSON
/// before its caller resumes.
#[derive(Clone)]
pub struct MetadataTracker {
    tx: mpsc::Sender<Command>,
    paths: SessionPaths,
}

impl MetadataTracker {
    /// Create the session directory, write the skeleton document, and start
    /// the writer task.
    pub async fn initialize(paths: SessionPaths, session: Session) -> Result<Self, EngineError> {
        paths.ensure_dir()?;

        let rankings = RankingsDocument {
            session_id: session.session_id.clone(),
            iterations: BTreeMap::new(),
            final_global_ranking: None,
        };

        let mut state = WriterState {
            paths: paths.clone(),
            session,
            rankings,
        };
        state.write_session()?;

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(writer_loop(rx, state));

        Ok(Self { tx, paths })
    }

    pub fn paths(&self) -> &SessionPaths {
        &self.paths
    }

    async fn send(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<(), EngineError>>) -> Command,
    ) -> Result<(), EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| EngineError::fatal("metadata writer task is gone"))?;
        rx.await
            .map_err(|_| EngineError::fatal("metadata writer dropped a reply"))?
    }

    /// Append a candidate in the attempted state and persist immediately,
    /// before any risky work starts.
    pub async fn record_attempt(
        &self,
        iteration: usize,
        dimension: Dimension,
        candidate: Candidate,
    ) -> Result<(), EngineError> {
        self.send(|reply| Command::RecordAttempt {
            iteration,
            dimension,
            candidate,
            reply,
        })
        .await
    }

    pub async fn update_attempt_with_results(
        &self,
        iteration: usize,
        candidate_id: &str,
        results: CandidateResults,
        survived: Option<bool>,
    ) -> Result<(), EngineError> {
        let candidate_id = candidate_id.to_string();
        self.send(|reply| Command::UpdateResults {
            iteration,
            candidate_id,
            results,
            survived,
            reply,
        })
        .await
    }

    pub async fn mark_candidate_failed(
        &self,
        iteration: usize,
        candidate_id: &str,
        error: &str,
    ) -> Result<(), EngineError> {
        let candidate_id = candidate_id.to_string();
        let error = error.to_string();
        self.send(|reply| Command::MarkCandidateFailed {
            iteration,
            candidate_id,
            error,
            reply,
        })
        .await
    }

    pub async fn mark_survival(
        &self,
        iteration: usize,
        candidate_id: &str,
        survived: bool,
    ) -> Result<(), EngineError> {
        let candidate_id = candidate_id.to_string();
        self.send(|reply| Command::MarkSurvival {
            iteration,
            candidate_id,
            survived,
            reply,
        })
        .await
    }

    pub async fn enrich_candidate_with_ranking_data(
        &self,
        iteration: usize,
        candidate_id: &str,
        enrichment: RankingEnrichment,
    ) -> Result<(), EngineError> {
        let candidate_id = candidate_id.to_string();
        self.send(|reply| Command::Enrich {
            iteration,
            candidate_id,
            enrichment,
            reply,
        })
        .await
    }

    pub async fn record_iteration_ranking(
        &self,
        iteration: usize,
        ranking: Vec<RankingEntry>,
    ) -> Result<(), EngineError> {
        self.send(|reply| Command::RecordIterationRanking {
            iteration,
            ranking,
            reply,
        })
        .await
    }

    pub async fn record_final_global_ranking(
        &self,
        ranking: Vec<RankingEntry>,
    ) -> Result<(), EngineError> {
        self.send(|reply| Command::RecordFinalGlobalRanking { ranking, reply })
            .await
    }

    /// Set the final winner and compute lineage by walking parent links.
    pub async fn mark_final_winner(&self, winner: FinalWinner) -> Result<(), EngineError> {
        self.send(|reply| Command::MarkFinalWinner { winner, reply })
            .await
    }

    pub async fn set_status(
        &self,
        status: SessionStatus,
        error: Option<String>,
    ) -> Result<(), EngineError> {
        self.send(|reply| Command::SetStatus {
            status,
            error,
            reply,
        })
        .await
    }

    pub async fn persist_tokens(&self, stats: TokenStats) -> Result<(), EngineError> {
        self.send(|reply| Command::PersistTokens { stats, reply })
            .await
    }

    /// Current in-memory session document.
    pub async fn snapshot(&self) -> Result<Session, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Snapshot { reply })
            .await
            .map_err(|_| EngineError::fatal("metadata writer task is gone"))?;
        rx.await
            .map_err(|_| EngineError::fatal("metadata writer dropped a reply"))
    }
}

/// Load a session document back from disk.
pub fn read_session(paths: &SessionPaths) -> Result<Session, EngineError> {
    let contents = std::fs::read_to_string(paths.metadata_path())?;
    Ok(serde_json::from_str(&contents)?)
}

/// Load the rankings satellite document.
pub fn read_rankings(paths: &SessionPaths) -> Result<RankingsDocument, EngineError> {
    let contents = std::fs::read_to_string(paths.rankings_path())?;
    Ok(serde_json::from_str(&contents)?)
}

struct WriterState {
    paths: SessionPaths,
    session: Session,
    rankings: RankingsDocument,
}

impl WriterState {
    fn write_session(&mut self) -> Result<(), EngineError> {
        let json = serde_json::to_string_pretty(&self.session)?;
        std::fs::write(self.paths.metadata_path(), json)?;
        Ok(())
    }

    fn write_rankings(&mut self) -> Result<(), EngineError> {
        let json = serde_json::to_string_pretty(&self.rankings)?;
        std::fs::write(self.paths.rankings_path(), json)?;
        Ok(())
    }

    fn iteration_mut(
        &mut self,
        number: usize,
        dimension: Option<Dimension>,
    ) -> Result<&mut Iteration, EngineError> {
        if self.session.iteration(number).is_none() {
            let dimension = dimension.ok_or_else(|| {
                EngineError::invalid(format!("iteration {number} does not exist"))
            })?;
            self.session.iterations.push(Iteration::new(number, dimension));
            self.session.iterations.sort_by_key(|it| it.number);
        }
        Ok(self
            .session
            .iteration_mut(number)
            .expect("iteration just ensured"))
    }

    fn candidate_mut(
        &mut self,
        iteration: usize,
        candidate_id: &str,
    ) -> Result<&mut Candidate, EngineError> {
        self.session
            .iteration_mut(iteration)
            .and_then(|it| it.candidate_mut(candidate_id))
            .ok_or_else(|| {
                EngineError::invalid(format!(
                    "unknown candidate {candidate_id} in iteration {iteration}"
                ))
            })
    }

    /// Re-derive bestCandidateId for an iteration. Pairwise mode: lowest
    /// average combined rank wins. Absolute mode: highest total score wins.
    fn recompute_best(&mut self, iteration: usize) {
        let mode = self.session.config.ranking_mode;
        let Some(iter) = self.session.iteration_mut(iteration) else {
            return;
        };

        let best = match mode {
            RankingMode::Pairwise => iter
                .candidates
                .iter()
                .filter(|c| c.status == CandidateStatus::Completed)
                .filter_map(|c| {
                    avg_combined_rank(c).map(|rank| (c.candidate_id.clone(), rank))
                })
                .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal)),
            RankingMode::Absolute => iter
                .candidates
                .iter()
                .filter(|c| c.status == CandidateStatus::Completed)
                .filter_map(|c| c.total_score.map(|score| (c.candidate_id.clone(), score)))
                .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal)),
        };

        if let Some((candidate_id, score)) = best {
            iter.best_candidate_id = Some(candidate_id);
            iter.best_score = Some(score);
        }
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::RecordAttempt {
                iteration,
                dimension,
                candidate,
                reply,
            } => {
                let result = (|| {
                    let iter = self.iteration_mut(iteration, Some(dimension))?;
                    // Re-recording an attempt is a no-op, keeping the call
                    // idempotent across retries.
                    if iter.candidate(&candidate.candidate_id).is_none() {
                        iter.candidates.push(candidate);
                    }
                    self.write_session()
                })();
                let _ = reply.send(result);
            }
            Command::UpdateResults {
                iteration,
                candidate_id,
                results,
                survived,
                reply,
            } => {
                let result = (|| {
                    let candidate = self.candidate_mut(iteration, &candidate_id)?;
                    candidate.status = CandidateStatus::Completed;
                    candidate.combined = Some(results.combined);
                    candidate.image = Some(results.image);
                    candidate.negative_prompt = results.negative_prompt;
                    candidate.evaluation = results.evaluation;
                    candidate.total_score = results.total_score;
                    if survived.is_some() {
                        candidate.survived = survived;
                    }
                    self.recompute_best(iteration);
                    self.write_session()
                })();
                let _ = reply.send(result);
            }
            Command::MarkCandidateFailed {
                iteration,
                candidate_id,
                error,
                reply,
            } => {
                let result = (|| {
                    let candidate = self.candidate_mut(iteration, &candidate_id)?;
                    candidate.status = CandidateStatus::Failed;
                    candidate.survived = Some(false);
                    tracing::warn!(%candidate_id, iteration, %error, "candidate failed");
                    self.write_session()
                })();
                let _ = reply.send(result);
            }
            Command::MarkSurvival {
                iteration,
                candidate_id,
                survived,
                reply,
            } => {
                let result = (|| {
                    let candidate = self.candidate_mut(iteration, &candidate_id)?;
                    candidate.survived = Some(survived);
                    self.write_session()
                })();
                let _ = reply.send(result);
            }
            Command::Enrich {
                iteration,
                candidate_id,
                enrichment,
                reply,
            } => {
                let result = (|| {
                    let candidate = self.candidate_mut(iteration, &candidate_id)?;
                    if !enrichment.comparisons.is_empty() {
                        candidate.comparisons = enrichment.comparisons;
                    }
                    if let Some(feedback) = enrichment.aggregated_feedback {
                        candidate.aggregated_feedback = Some(feedback);
                    }
                    if let Some(critique) = enrichment.critique {
                        candidate.critique = Some(critique);
                    }
                    self.recompute_best(iteration);
                    self.write_session()
                })();
                let _ = reply.send(result);
            }
            Command::RecordIterationRanking {
                iteration,
                ranking,
                reply,
            } => {
                let result = (|| {
                    self.rankings
                        .iterations
                        .insert(iteration.to_string(), ranking);
                    self.write_rankings()
                })();
                let _ = reply.send(result);
            }
            Command::RecordFinalGlobalRanking { ranking, reply } => {
                let result = (|| {
                    self.rankings.final_global_ranking = Some(ranking);
                    self.write_rankings()
                })();
                let _ = reply.send(result);
            }
            Command::MarkFinalWinner { winner, reply } => {
                let result = (|| {
                    self.session.lineage = self
                        .session
                        .lineage_of(winner.iteration, &winner.candidate_id);
                    self.session.final_winner = Some(winner);
                    self.write_session()
                })();
                let _ = reply.send(result);
            }
            Command::SetStatus {
                status,
                error,
                reply,
            } => {
                let result = (|| {
                    self.session.status = status;
                    self.session.error = error;
                    self.write_session()
                })();
                let _ = reply.send(result);
            }
            Command::PersistTokens { stats, reply } => {
                let result = (|| {
                    let json = serde_json::to_string_pretty(&stats)?;
                    std::fs::write(self.paths.tokens_path(), json)?;
                    Ok(())
                })();
                let _ = reply.send(result);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.session.clone());
            }
        }
    }
}

/// A candidate's average combined rank over its recorded comparisons, lower
/// being better.
fn avg_combined_rank(candidate: &Candidate) -> Option<f64> {
    let mut sum = 0.0;
    let mut count = 0usize;
    for fact in &candidate.comparisons {
        let ranks = if fact.id_a == candidate.candidate_id {
            fact.ranks_a
        } else if fact.id_b == candidate.candidate_id {
            fact.ranks_b
        } else {
            None
        };
        if let Some(ranks) = ranks {
            sum += ranks.combined;
            count += 1;
        }
    }
    (count > 0).then(|| sum / count as f64)
}

async fn writer_loop(mut rx: mpsc::Receiver<Command>, mut state: WriterState) {
    while let Some(command) = rx.recv().await {
        state.handle(command);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{candidate_id, SearchConfig};

    async fn tracker_in(dir: &std::path::Path) -> (MetadataTracker, SessionPaths) {
        let paths = SessionPaths::existing(dir, "2026-08-01", "ses-120000");
        let session = Session::new("ses-120000", "a mountain", SearchConfig::default());
        let tracker = MetadataTracker::initialize(paths.clone(), session)
            .await
            .unwrap();
        (tracker, paths)
    }

    fn results_for(id: &str) -> CandidateResults {
        CandidateResults {
            combined: format!("combined prompt for {id}"),
            image: ImageArtifact {
                url: None,
                local_path: format!("/tmp/{id}.png"),
                base_image_path: None,
            },
            negative_prompt: None,
            evaluation: None,
            total_score: Some(1.3),
        }
    }

    #[tokio::test]
    async fn attempt_is_persisted_before_results() {
        let dir = tempfile::tempdir().unwrap();
        let (tracker, paths) = tracker_in(dir.path()).await;

        tracker
            .record_attempt(
                0,
                Dimension::What,
                Candidate::attempted(candidate_id(0, 0), None, "what", "how"),
            )
            .await
            .unwrap();

        // Simulates a crash between attempt and results: the document on
        // disk already carries the attempted candidate with null fields.
        let session = read_session(&paths).unwrap();
        let candidate = session.iteration(0).unwrap().candidate("iter0-cand0").unwrap();
        assert_eq!(candidate.status, CandidateStatus::Attempted);
        assert!(candidate.combined.is_none());
        assert!(candidate.image.is_none());
        assert!(candidate.evaluation.is_none());
    }

    #[tokio::test]
    async fn update_transitions_to_completed() {
        let dir = tempfile::tempdir().unwrap();
        let (tracker, paths) = tracker_in(dir.path()).await;

        tracker
            .record_attempt(
                0,
                Dimension::What,
                Candidate::attempted(candidate_id(0, 0), None, "what", "how"),
            )
            .await
            .unwrap();
        tracker
            .update_attempt_with_results(0, "iter0-cand0", results_for("iter0-cand0"), None)
            .await
            .unwrap();

        let session = read_session(&paths).unwrap();
        let candidate = session.iteration(0).unwrap().candidate("iter0-cand0").unwrap();
        assert_eq!(candidate.status, CandidateStatus::Completed);
        assert!(candidate.combined.is_some());
        assert!(candidate.image.is_some());
    }

    #[tokio::test]
    async fn repeated_update_is_idempotent_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let (tracker, paths) = tracker_in(dir.path()).await;

        tracker
            .record_attempt(
                0,
                Dimension::What,
                Candidate::attempted(candidate_id(0, 0), None, "what", "how"),
            )
            .await
            .unwrap();

        tracker
            .update_attempt_with_results(0, "iter0-cand0", results_for("iter0-cand0"), None)
            .await
            .unwrap();
        let first = std::fs::read(paths.metadata_path()).unwrap();

        tracker
            .update_attempt_with_results(0, "iter0-cand0", results_for("iter0-cand0"), None)
            .await
            .unwrap();
        let second = std::fs::read(paths.metadata_path()).unwrap();

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn sequential_updates_keep_the_last_payload() {
        let dir = tempfile::tempdir().unwrap();
        let (tracker, paths) = tracker_in(dir.path()).await;

        tracker
            .record_attempt(
                0,
                Dimension::What,
                Candidate::attempted(candidate_id(0, 0), None, "what", "how"),
            )
            .await
            .unwrap();

        let mut early = results_for("iter0-cand0");
        early.combined = "first payload".into();
        let mut late = results_for("iter0-cand0");
        late.combined = "second payload".into();

        tracker
            .update_attempt_with_results(0, "iter0-cand0", early, None)
            .await
            .unwrap();
        tracker
            .update_attempt_with_results(0, "iter0-cand0", late, None)
            .await
            .unwrap();

        let session = read_session(&paths).unwrap();
        let candidate = session.iteration(0).unwrap().candidate("iter0-cand0").unwrap();
        assert_eq!(candidate.combined.as_deref(), Some("second payload"));
    }

    #[tokio::test]
    async fn winner_marking_computes_lineage() {
        let dir = tempfile::tempdir().unwrap();
        let (tracker, paths) = tracker_in(dir.path()).await;

        tracker
            .record_attempt(
                0,
                Dimension::What,
                Candidate::attempted(candidate_id(0, 1), None, "what", "how"),
            )
            .await
            .unwrap();
        tracker
            .record_attempt(
                1,
                Dimension::How,
                Candidate::attempted(candidate_id(1, 0), Some(candidate_id(0, 1)), "what", "how"),
            )
            .await
            .unwrap();

        tracker
            .mark_final_winner(FinalWinner {
                iteration: 1,
                candidate_id: candidate_id(1, 0),
                total_score: Some(1.0),
            })
            .await
            .unwrap();

        let session = read_session(&paths).unwrap();
        assert_eq!(session.lineage.len(), 2);
        assert_eq!(session.lineage[0].candidate_id, candidate_id(0, 1));
        assert_eq!(session.lineage[1].candidate_id, candidate_id(1, 0));
    }

    #[tokio::test]
    async fn rankings_go_to_satellite_file() {
        let dir = tempfile::tempdir().unwrap();
        let (tracker, paths) = tracker_in(dir.path()).await;

        tracker
            .record_iteration_ranking(
                0,
                vec![RankingEntry {
                    candidate_id: candidate_id(0, 0),
                    rank: 1,
                    wins: 3,
                    losses: 0,
                    aggregate_stats: None,
                }],
            )
            .await
            .unwrap();

        let rankings = read_rankings(&paths).unwrap();
        assert_eq!(rankings.iterations["0"][0].rank, 1);
        assert!(rankings.final_global_ranking.is_none());
    }
}
