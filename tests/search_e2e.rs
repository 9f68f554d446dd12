use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use beamgen_lib::config::{EngineConfig, ProviderMode};
use beamgen_lib::error::EngineError;
use beamgen_lib::gpu::GpuCoordinator;
use beamgen_lib::models::{
    CandidateStatus, SearchConfig, Session, SessionStatus, TokenUsage,
};
use beamgen_lib::providers::mock::{
    png_for_prompt, MockComparator, MockLlm, MockVision,
};
use beamgen_lib::providers::{ImageOutput, ImageProvider, ImageRequest, ProviderMeta};
use beamgen_lib::registry::{
    ProviderBackend, ProviderRegistry, ProviderSelection, ProviderSet,
};
use beamgen_lib::scheduler::BeamSearchScheduler;

fn mock_config(dir: &std::path::Path) -> EngineConfig {
    EngineConfig {
        provider_mode: ProviderMode::Mock,
        root: dir.to_path_buf(),
        services_dir: dir.join("services"),
        health_check_timeout_ms: 300,
        ..EngineConfig::default()
    }
}

fn mock_scheduler(dir: &std::path::Path, search: SearchConfig) -> BeamSearchScheduler {
    let config = mock_config(dir);
    let coordinator = Arc::new(GpuCoordinator::disabled(&config));
    let registry = ProviderRegistry::new(config.clone(), coordinator.clone()).unwrap();
    let selection = registry.selection();
    BeamSearchScheduler::new(config, search, registry.current(), selection, coordinator)
}

/// Every structural invariant the session document must satisfy.
fn assert_session_invariants(session: &Session) {
    for iteration in &session.iterations {
        // Parent links point into the immediately preceding iteration.
        for candidate in &iteration.candidates {
            match &candidate.parent_id {
                None => assert_eq!(iteration.number, 0, "only iteration 0 has roots"),
                Some(parent_id) => {
                    let previous = session
                        .iteration(iteration.number - 1)
                        .expect("parent iteration exists");
                    assert!(
                        previous.candidate(parent_id).is_some(),
                        "parent {parent_id} missing from iteration {}",
                        iteration.number - 1
                    );
                }
            }
        }

        // Survivor count is bounded, and survivors require completions.
        let survivors = iteration
            .candidates
            .iter()
            .filter(|c| c.survived == Some(true))
            .count();
        assert!(survivors <= session.config.survivors);
        if survivors > 0 {
            assert!(iteration
                .candidates
                .iter()
                .any(|c| c.status == CandidateStatus::Completed));
        }
    }

    // The lineage walks forward in parent-child steps and ends at the winner.
    if let Some(winner) = &session.final_winner {
        let lineage = &session.lineage;
        assert!(!lineage.is_empty());
        assert_eq!(lineage.last().unwrap().candidate_id, winner.candidate_id);
        assert_eq!(lineage.last().unwrap().iteration, winner.iteration);

        for pair in lineage.windows(2) {
            let child = session
                .iteration(pair[1].iteration)
                .and_then(|it| it.candidate(&pair[1].candidate_id))
                .expect("lineage candidate exists");
            assert_eq!(child.parent_id.as_deref(), Some(pair[0].candidate_id.as_str()));
            assert_eq!(pair[1].iteration, pair[0].iteration + 1);
        }
    }
}

#[tokio::test]
async fn cold_start_two_iterations_full_tree() {
    let dir = tempfile::tempdir().unwrap();
    let search = SearchConfig {
        beam_width: 4,
        survivors: 2,
        max_iterations: 2,
        alpha: 0.7,
        ensemble_size: 1,
        ..SearchConfig::default()
    };

    let outcome = mock_scheduler(dir.path(), search)
        .run("a mountain")
        .await
        .unwrap();
    let session = &outcome.session;

    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.iterations.len(), 2);

    // Iteration 0: four roots, ranked 1..4, exactly two survivors.
    let iter0 = session.iteration(0).unwrap();
    assert_eq!(iter0.candidates.len(), 4);
    assert!(iter0.candidates.iter().all(|c| c.parent_id.is_none()));
    assert_eq!(
        iter0.candidates.iter().filter(|c| c.survived == Some(true)).count(),
        2
    );

    // Iteration 1: four children, each descending from a survivor.
    let iter1 = session.iteration(1).unwrap();
    assert_eq!(iter1.candidates.len(), 4);
    let survivor_ids: Vec<&str> = iter0
        .candidates
        .iter()
        .filter(|c| c.survived == Some(true))
        .map(|c| c.candidate_id.as_str())
        .collect();
    for candidate in &iter1.candidates {
        let parent = candidate.parent_id.as_deref().expect("children have parents");
        assert!(survivor_ids.contains(&parent));
    }

    let winner = session.final_winner.as_ref().expect("winner settled");
    assert_eq!(session.lineage.len(), winner.iteration + 1);
    assert_session_invariants(session);

    // All four images of each iteration landed in the session directory.
    for iteration in &session.iterations {
        for candidate in &iteration.candidates {
            let image = candidate.image.as_ref().expect("completed candidate has image");
            assert!(std::path::Path::new(&image.local_path).exists());
        }
    }

    // Pairwise mode keeps evaluation null and attaches comparisons instead.
    let ranked = iter0.candidates.iter().find(|c| !c.comparisons.is_empty());
    assert!(ranked.is_some());
    assert!(iter0.candidates.iter().all(|c| c.evaluation.is_none()));
}

#[tokio::test]
async fn non_integral_branching_assigns_parents_round_robin() {
    let dir = tempfile::tempdir().unwrap();
    let search = SearchConfig {
        beam_width: 5,
        survivors: 2,
        max_iterations: 2,
        ensemble_size: 1,
        ..SearchConfig::default()
    };

    let outcome = mock_scheduler(dir.path(), search)
        .run("a lighthouse in a storm")
        .await
        .unwrap();
    let session = &outcome.session;
    assert_eq!(session.status, SessionStatus::Completed);

    let iter1 = session.iteration(1).unwrap();
    assert_eq!(iter1.candidates.len(), 5);

    // Two survivors share five children 3/2, never 4/1.
    let mut by_parent = std::collections::HashMap::new();
    for candidate in &iter1.candidates {
        *by_parent
            .entry(candidate.parent_id.clone().unwrap())
            .or_insert(0usize) += 1;
    }
    let mut counts: Vec<usize> = by_parent.values().copied().collect();
    counts.sort();
    assert_eq!(counts, vec![2, 3]);

    assert_session_invariants(session);
}

#[tokio::test]
async fn absolute_mode_scores_every_candidate() {
    let dir = tempfile::tempdir().unwrap();
    let search = SearchConfig {
        beam_width: 3,
        survivors: 1,
        max_iterations: 1,
        ensemble_size: 1,
        ranking_mode: beamgen_lib::models::RankingMode::Absolute,
        ..SearchConfig::default()
    };

    let outcome = mock_scheduler(dir.path(), search)
        .run("a desert road")
        .await
        .unwrap();
    let session = &outcome.session;
    assert_eq!(session.status, SessionStatus::Completed);

    let iter0 = session.iteration(0).unwrap();
    for candidate in &iter0.candidates {
        assert!(candidate.evaluation.is_some());
        assert!(candidate.total_score.is_some());
    }
    assert_session_invariants(session);
}

/// Image provider that refuses on policy grounds a fixed number of times,
/// then delegates to the deterministic mock generator.
struct RefusingImage {
    refusals_left: AtomicU32,
}

#[async_trait]
impl ImageProvider for RefusingImage {
    async fn generate(
        &self,
        prompt: &str,
        _request: ImageRequest,
    ) -> Result<ImageOutput, EngineError> {
        let left = self.refusals_left.load(Ordering::SeqCst);
        if left > 0 {
            self.refusals_left.store(left - 1, Ordering::SeqCst);
            return Err(EngineError::ContentPolicy(
                "content policy violation: refused".to_string(),
            ));
        }
        Ok(ImageOutput {
            bytes: Some(png_for_prompt(prompt)),
            temp_path: None,
            url: None,
            base_temp_path: None,
            revised_prompt: None,
            seed: None,
            meta: ProviderMeta {
                model: "refusing-image".to_string(),
                usage: TokenUsage::default(),
                duration_ms: 1,
            },
        })
    }
}

#[tokio::test]
async fn moderation_rewrites_until_the_provider_accepts() {
    let dir = tempfile::tempdir().unwrap();
    let config = mock_config(dir.path());
    let coordinator = Arc::new(GpuCoordinator::disabled(&config));

    let llm = Arc::new(MockLlm::new());
    let providers = Arc::new(ProviderSet {
        llm: llm.clone(),
        rewriter: llm.clone(),
        critic: llm,
        image: Arc::new(RefusingImage {
            refusals_left: AtomicU32::new(2),
        }),
        vision: Arc::new(MockVision::new()),
        comparator: Arc::new(MockComparator::new()),
    });

    let search = SearchConfig {
        beam_width: 1,
        survivors: 1,
        max_iterations: 1,
        ensemble_size: 1,
        ..SearchConfig::default()
    };
    let scheduler = BeamSearchScheduler::new(
        config,
        search,
        providers,
        ProviderSelection::all(ProviderBackend::Mock),
        coordinator,
    );

    let outcome = scheduler.run("a battle at dusk").await.unwrap();
    let session = &outcome.session;
    assert_eq!(session.status, SessionStatus::Completed);

    // The third attempt passed, so the stored prompt carries two rewrites.
    let candidate = session.iteration(0).unwrap().candidate("iter0-cand0").unwrap();
    assert_eq!(candidate.status, CandidateStatus::Completed);
    let combined = candidate.combined.as_deref().unwrap();
    assert_eq!(combined.matches("softened").count(), 2);
}

#[tokio::test]
async fn exhausted_moderation_fails_the_candidate_not_the_process() {
    let dir = tempfile::tempdir().unwrap();
    let config = mock_config(dir.path());
    let coordinator = Arc::new(GpuCoordinator::disabled(&config));

    let llm = Arc::new(MockLlm::new());
    let providers = Arc::new(ProviderSet {
        llm: llm.clone(),
        rewriter: llm.clone(),
        critic: llm,
        image: Arc::new(RefusingImage {
            refusals_left: AtomicU32::new(u32::MAX),
        }),
        vision: Arc::new(MockVision::new()),
        comparator: Arc::new(MockComparator::new()),
    });

    let search = SearchConfig {
        beam_width: 1,
        survivors: 1,
        max_iterations: 1,
        ensemble_size: 1,
        ..SearchConfig::default()
    };
    let scheduler = BeamSearchScheduler::new(
        config,
        search,
        providers,
        ProviderSelection::all(ProviderBackend::Mock),
        coordinator,
    );

    let outcome = scheduler.run("a battle at dusk").await.unwrap();
    let session = &outcome.session;

    // Zero completions fails the session, but the record survives on disk.
    assert_eq!(session.status, SessionStatus::Failed);
    let candidate = session.iteration(0).unwrap().candidate("iter0-cand0").unwrap();
    assert_eq!(candidate.status, CandidateStatus::Failed);
    assert_eq!(candidate.survived, Some(false));
}

#[tokio::test]
async fn stop_locked_image_service_fails_the_session_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let config = mock_config(dir.path());
    // A managing coordinator with a stop-locked image service and nothing
    // listening on the local ports.
    let coordinator = Arc::new(GpuCoordinator::new(&config));
    coordinator
        .write_stop_lock(beamgen_lib::gpu::ServiceKind::Image)
        .unwrap();
    // Pin the image service to port 1 so its health probe always refuses.
    std::fs::write(
        coordinator.port_file_path(beamgen_lib::gpu::ServiceKind::Image),
        "1",
    )
    .unwrap();

    let llm = Arc::new(MockLlm::new());
    let providers = Arc::new(ProviderSet {
        llm: llm.clone(),
        rewriter: llm.clone(),
        critic: llm,
        image: Arc::new(beamgen_lib::providers::mock::MockImage::new()),
        vision: Arc::new(MockVision::new()),
        comparator: Arc::new(MockComparator::new()),
    });

    let search = SearchConfig {
        beam_width: 1,
        survivors: 1,
        max_iterations: 1,
        ensemble_size: 1,
        ..SearchConfig::default()
    };
    // Image is marked local so its calls must pass the coordinator gate.
    let selection = ProviderSelection {
        llm: ProviderBackend::Mock,
        image: ProviderBackend::Local,
        vision: ProviderBackend::Mock,
        ranking: ProviderBackend::Mock,
    };
    let scheduler = BeamSearchScheduler::new(config, search, providers, selection, coordinator);

    let outcome = scheduler.run("a mountain").await.unwrap();
    let session = &outcome.session;

    assert_eq!(session.status, SessionStatus::Failed);
    let candidate = session.iteration(0).unwrap().candidate("iter0-cand0").unwrap();
    assert_eq!(candidate.status, CandidateStatus::Failed);
}

#[tokio::test]
async fn tokens_are_accounted_per_operation() {
    let dir = tempfile::tempdir().unwrap();
    let search = SearchConfig {
        beam_width: 2,
        survivors: 1,
        max_iterations: 1,
        ensemble_size: 1,
        ..SearchConfig::default()
    };

    let outcome = mock_scheduler(dir.path(), search)
        .run("a mountain")
        .await
        .unwrap();

    assert!(outcome.tokens.by_operation.contains_key("expand"));
    assert!(outcome.tokens.by_operation.contains_key("combine"));
    assert!(outcome.tokens.by_operation.contains_key("compare"));
    assert!(outcome.tokens.calls > 0);

    // The tokens satellite file carries the same summary.
    let tokens_path = outcome.paths.tokens_path();
    let on_disk: beamgen_lib::models::TokenStats =
        serde_json::from_str(&std::fs::read_to_string(tokens_path).unwrap()).unwrap();
    assert_eq!(on_disk.calls, outcome.tokens.calls);
}

#[tokio::test]
async fn rankings_satellite_has_per_iteration_and_global_entries() {
    let dir = tempfile::tempdir().unwrap();
    let search = SearchConfig {
        beam_width: 3,
        survivors: 2,
        max_iterations: 2,
        ensemble_size: 1,
        ..SearchConfig::default()
    };

    let outcome = mock_scheduler(dir.path(), search)
        .run("a forest clearing")
        .await
        .unwrap();

    let rankings = beamgen_lib::metadata::read_rankings(&outcome.paths).unwrap();
    assert!(rankings.iterations.contains_key("0"));
    assert!(rankings.iterations.contains_key("1"));
    assert_eq!(rankings.iterations["0"].len(), 3);
    assert_eq!(rankings.iterations["0"][0].rank, 1);

    let global = rankings.final_global_ranking.expect("global ranking recorded");
    // Survivors across both iterations: 2 + 2.
    assert_eq!(global.len(), 4);
}
