use anyhow::{Context, Result};
use clap::Subcommand;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::db::{Database, SessionFilter};
use crate::gpu::{GpuCoordinator, ServiceKind};
use crate::metadata;
use crate::models::{RankingMode, SearchConfig, SessionStatus};
use crate::providers::local;
use crate::registry::{ProviderBackend, ProviderRegistry, ProviderSelection};
use crate::scheduler::BeamSearchScheduler;
use crate::session::{self, SessionPaths};
use crate::stream::StdoutSink;

#[derive(Subcommand, Clone)]
pub enum Commands {
    /// Run an iterative image search for a prompt
    #[command(long_about = "Run a full beam search: expand the prompt along content and \
        style, generate candidate images, rank them by pairwise comparison, and refine \
        the survivors over several iterations.\n\n\
        Examples:\n  \
        beamgen search -p \"a mountain lake at dawn\"\n  \
        beamgen search -p \"a mountain\" -n 6 -m 3 -i 4 --ensemble 5\n  \
        beamgen search -f prompt.txt --mode absolute --copy-to best.png\n  \
        beamgen search -p \"a lighthouse\" --providers mock    # no network")]
    Search {
        /// Prompt text
        #[arg(short, long)]
        prompt: Option<String>,

        /// Read prompt from file
        #[arg(short = 'f', long)]
        file: Option<PathBuf>,

        /// Candidates per iteration (N)
        #[arg(short = 'n', long, default_value = "4")]
        beam_width: usize,

        /// Survivors per iteration (M)
        #[arg(short = 'm', long, default_value = "2")]
        survivors: usize,

        /// Iteration budget (I)
        #[arg(short = 'i', long, default_value = "3")]
        iterations: usize,

        /// Alignment weight in the combined rank
        #[arg(long, default_value = "0.7")]
        alpha: f64,

        /// Comparator calls per pair (k)
        #[arg(short = 'k', long = "ensemble")]
        ensemble: Option<usize>,

        /// Ranking mode: pairwise or absolute
        #[arg(long, default_value = "pairwise")]
        mode: String,

        /// Parallel candidate workers
        #[arg(long, default_value = "4")]
        workers: usize,

        /// Provider mode override: mock or real
        #[arg(long)]
        providers: Option<String>,

        /// Negative prompt passed to the image model
        #[arg(long)]
        negative: Option<String>,

        /// Copy the winning image to this path
        #[arg(long)]
        copy_to: Option<PathBuf>,
    },

    /// List recent search sessions
    #[command(long_about = "List sessions from the index.\n\n\
        Output columns: SESSION, DATE, STATUS, ITERS, WINNER, PROMPT (truncated)\n\n\
        Examples:\n  \
        beamgen sessions                  # Last 20 sessions\n  \
        beamgen sessions --status failed  # Only failed sessions\n  \
        beamgen sessions --search lake    # Filter by prompt text")]
    Sessions {
        /// Number of results
        #[arg(short = 'n', long, default_value = "20")]
        limit: i64,

        /// Filter by status (running, completed, failed)
        #[arg(long)]
        status: Option<String>,

        /// Only sessions on or after this date (YYYY-MM-DD)
        #[arg(long)]
        since: Option<String>,

        /// Filter by prompt text
        #[arg(long)]
        search: Option<String>,
    },

    /// Show one session's record
    Show {
        /// Session id (ses-HHMMSS)
        session_id: String,
    },

    /// Aggregate token usage across sessions
    Costs,

    /// Show or switch the active providers
    #[command(long_about = "Show the active provider selection, or switch it at runtime.\n\n\
        A switch to a local provider is rejected unless that service answers its \
        health probe.\n\n\
        Examples:\n  \
        beamgen providers\n  \
        beamgen providers --llm openai --image local --vision local --ranking local")]
    Providers {
        /// LLM backend (openai, local, mock)
        #[arg(long)]
        llm: Option<String>,

        /// Image backend
        #[arg(long)]
        image: Option<String>,

        /// Vision backend
        #[arg(long)]
        vision: Option<String>,

        /// Pairwise comparator backend
        #[arg(long)]
        ranking: Option<String>,
    },

    /// Manage local model services
    #[command(long_about = "Inspect and control the local model services sharing the GPU.\n\n\
        'stop' writes the service's STOP_LOCK so it is never auto-restarted; \
        'quick-start' clears the lock and brings the service back.\n\n\
        Examples:\n  \
        beamgen services status\n  \
        beamgen services stop vlm\n  \
        beamgen services quick-start vlm")]
    Services {
        #[command(subcommand)]
        action: ServiceAction,
    },
}

#[derive(Subcommand, Clone)]
pub enum ServiceAction {
    /// Health and lock state of every service
    Status,

    /// Stop a service and write its STOP_LOCK
    Stop {
        /// Service name (llm, image, vision, vlm)
        service: String,
    },

    /// Clear the STOP_LOCK and start the service
    QuickStart {
        /// Service name (llm, image, vision, vlm)
        service: String,
    },
}

pub fn run(cmd: Commands) -> Result<()> {
    let mut config = EngineConfig::from_env();

    match cmd {
        Commands::Search {
            prompt,
            file,
            beam_width,
            survivors,
            iterations,
            alpha,
            ensemble,
            mode,
            workers,
            providers,
            negative,
            copy_to,
        } => {
            let prompt_text = if let Some(p) = prompt {
                p
            } else if let Some(f) = file {
                std::fs::read_to_string(&f).context("Failed to read prompt file")?
            } else {
                anyhow::bail!("Either --prompt or --file is required");
            };

            if let Some(mode_override) = providers {
                config.provider_mode = mode_override
                    .parse()
                    .map_err(|e: String| anyhow::anyhow!(e))?;
            }

            let search = SearchConfig {
                beam_width,
                survivors,
                max_iterations: iterations,
                alpha,
                ensemble_size: ensemble.unwrap_or(config.ensemble_size),
                ranking_mode: RankingMode::from_str(&mode).map_err(|e| anyhow::anyhow!(e))?,
                worker_pool: workers,
            };

            let db = Database::open(&session::db_path(&config.root))?;

            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(async {
                run_search(&config, search, &db, &prompt_text, negative, copy_to).await
            })?;
        }

        Commands::Sessions {
            limit,
            status,
            since,
            search,
        } => {
            let filter = SessionFilter {
                limit: Some(limit),
                status: status
                    .map(|s| parse_status(&s))
                    .transpose()?,
                since_date: since,
                search,
            };

            let db = Database::open(&session::db_path(&config.root))?;
            let rows = db.list_sessions(&filter)?;
            if rows.is_empty() {
                println!("No sessions found");
                return Ok(());
            }

            println!(
                "{:<12} {:<11} {:<10} {:>5}  {:<14} PROMPT",
                "SESSION", "DATE", "STATUS", "ITERS", "WINNER"
            );
            for row in rows {
                println!(
                    "{:<12} {:<11} {:<10} {:>5}  {:<14} {}",
                    row.session_id,
                    row.date,
                    row.status,
                    row.iterations,
                    row.winner_candidate.as_deref().unwrap_or("-"),
                    truncate(&row.prompt, 50),
                );
            }
        }

        Commands::Show { session_id } => {
            let db = Database::open(&session::db_path(&config.root))?;
            let row = db
                .get_session(&session_id)?
                .ok_or_else(|| anyhow::anyhow!("Session {} not found", session_id))?;

            println!("Session: {}", row.session_id);
            println!("Date: {}", row.date);
            println!("Status: {}", row.status);
            println!("Mode: {}", row.ranking_mode);
            println!("Iterations: {}", row.iterations);
            if let Some(winner) = &row.winner_candidate {
                println!("Winner: {}", winner);
            }
            if let Some(score) = row.winner_score {
                println!("Winner score: {:.3}", score);
            }
            println!(
                "Tokens: {} prompt / {} completion",
                row.prompt_tokens, row.completion_tokens
            );
            if let Some(wall) = row.wall_time_seconds {
                println!("Wall time: {:.1}s", wall);
            }

            let paths = SessionPaths::existing(&config.root, &row.date, &row.session_id);
            println!("Metadata: {}", paths.metadata_path().display());
            println!("Rankings: {}", paths.rankings_path().display());

            let images = db.image_paths(&session_id)?;
            if !images.is_empty() {
                println!("Images ({}):", images.len());
                for (candidate, path) in &images {
                    println!("  {} {}", candidate, path);
                }
            }

            println!("\nPrompt:\n{}", row.prompt);
        }

        Commands::Costs => {
            let db = Database::open(&session::db_path(&config.root))?;
            let summary = db.usage_summary()?;

            println!("Sessions: {}", summary.sessions);
            println!(
                "Tokens: {} prompt / {} completion",
                summary.prompt_tokens, summary.completion_tokens
            );
            if !summary.by_day.is_empty() {
                println!("\nBy day:");
                for (date, tokens) in &summary.by_day {
                    println!("  {:<11} {:>10}", date, tokens);
                }
            }
        }

        Commands::Providers {
            llm,
            image,
            vision,
            ranking,
        } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(async {
                let coordinator = Arc::new(GpuCoordinator::new(&config));
                let registry = ProviderRegistry::new(config.clone(), coordinator)?;

                let current = registry.selection();
                if llm.is_none() && image.is_none() && vision.is_none() && ranking.is_none() {
                    print_selection(&current);
                    return Ok(());
                }

                let target = ProviderSelection {
                    llm: parse_backend(llm.as_deref(), current.llm)?,
                    image: parse_backend(image.as_deref(), current.image)?,
                    vision: parse_backend(vision.as_deref(), current.vision)?,
                    ranking: parse_backend(ranking.as_deref(), current.ranking)?,
                };

                let prior = registry.switch(target).await?;
                println!("Switched providers (was: llm={} image={} vision={} ranking={})",
                    prior.llm, prior.image, prior.vision, prior.ranking);
                print_selection(&registry.selection());
                Ok::<_, anyhow::Error>(())
            })?;
        }

        Commands::Services { action } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(async {
                let coordinator = GpuCoordinator::new(&config);
                match action {
                    ServiceAction::Status => {
                        println!(
                            "{:<8} {:<26} {:<9} {:<7} MODEL",
                            "SERVICE", "URL", "HEALTHY", "LOCKED"
                        );
                        for status in coordinator.status().await {
                            let model = if status.healthy {
                                local::service_health(&status.url)
                                    .await
                                    .ok()
                                    .and_then(|h| h.current_model)
                                    .unwrap_or_else(|| "-".to_string())
                            } else {
                                "-".to_string()
                            };
                            println!(
                                "{:<8} {:<26} {:<9} {:<7} {}",
                                status.service,
                                status.url,
                                if status.healthy { "yes" } else { "no" },
                                if status.stop_locked { "yes" } else { "no" },
                                model,
                            );
                        }
                    }
                    ServiceAction::Stop { service } => {
                        let kind = parse_service(&service)?;
                        coordinator.write_stop_lock(kind)?;
                        coordinator.stop_service(kind).await?;
                        println!("Stopped {} and wrote its STOP_LOCK", kind);
                    }
                    ServiceAction::QuickStart { service } => {
                        let kind = parse_service(&service)?;
                        coordinator.clear_stop_lock(kind)?;
                        coordinator.ensure_running(kind).await?;
                        println!("Started {}", kind);
                    }
                }
                Ok::<_, anyhow::Error>(())
            })?;
        }
    }

    Ok(())
}

async fn run_search(
    config: &EngineConfig,
    search: SearchConfig,
    db: &Database,
    prompt: &str,
    negative: Option<String>,
    copy_to: Option<PathBuf>,
) -> Result<()> {
    let coordinator = match config.provider_mode {
        crate::config::ProviderMode::Mock => Arc::new(GpuCoordinator::disabled(config)),
        crate::config::ProviderMode::Real => Arc::new(GpuCoordinator::new(config)),
    };
    let registry = ProviderRegistry::new(config.clone(), coordinator.clone())?;

    let scheduler = BeamSearchScheduler::new(
        config.clone(),
        search.clone(),
        registry.current(),
        registry.selection(),
        coordinator,
    )
    .with_negative_prompt(negative)
    .with_sink(Arc::new(StdoutSink));

    let outcome = scheduler.run(prompt).await?;
    let paths = &outcome.paths;

    db.insert_session(
        &outcome.session.session_id,
        &paths.date,
        prompt,
        &session::slugify_prompt(prompt),
        &search.ranking_mode.to_string(),
    )?;
    db.update_progress(
        &outcome.session.session_id,
        outcome.session.iterations.len() as i64,
    )?;
    db.complete_session(
        &outcome.session.session_id,
        outcome.session.status,
        outcome.winner().map(|w| w.candidate_id.as_str()),
        outcome.winner().and_then(|w| w.total_score),
        &outcome.tokens,
        outcome.wall_seconds,
    )?;

    for iteration in &outcome.session.iterations {
        for candidate in &iteration.candidates {
            if let Some(image) = &candidate.image {
                db.insert_image(
                    &outcome.session.session_id,
                    &candidate.candidate_id,
                    iteration.number as i64,
                    &image.local_path,
                    None,
                    None,
                    None,
                )?;
            }
        }
    }

    println!("Session: {}", outcome.session.session_id);
    println!("Status: {}", outcome.session.status);
    println!("Metadata: {}", paths.metadata_path().display());

    if let Some(winner) = outcome.winner() {
        println!(
            "Winner: {} (iteration {})",
            winner.candidate_id, winner.iteration
        );
        let winner_image = outcome
            .winner_image()
            .expect("winner always has an image path");
        println!("Image: {}", winner_image.display());

        if let Some(dest) = copy_to {
            let dest = if dest.is_dir() {
                dest.join(format!("{}.png", session::slugify_prompt(prompt)))
            } else {
                dest
            };
            session::copy_to(&winner_image, &dest)?;
            println!("Copied to: {}", dest.display());
        }
    } else if let Some(error) = &outcome.session.error {
        println!("Error: {}", error);
    }

    // The JSON documents stay authoritative; surface where they live.
    let session_doc = metadata::read_session(paths)?;
    println!(
        "Candidates: {}",
        session_doc
            .iterations
            .iter()
            .map(|it| it.candidates.len())
            .sum::<usize>()
    );

    Ok(())
}

fn print_selection(selection: &ProviderSelection) {
    println!("llm: {}", selection.llm);
    println!("image: {}", selection.image);
    println!("vision: {}", selection.vision);
    println!("ranking: {}", selection.ranking);
}

fn parse_backend(value: Option<&str>, current: ProviderBackend) -> Result<ProviderBackend> {
    match value {
        Some(v) => ProviderBackend::from_str(v).map_err(|e| anyhow::anyhow!(e)),
        None => Ok(current),
    }
}

fn parse_status(value: &str) -> Result<SessionStatus> {
    match value.to_lowercase().as_str() {
        "running" => Ok(SessionStatus::Running),
        "completed" => Ok(SessionStatus::Completed),
        "failed" => Ok(SessionStatus::Failed),
        other => anyhow::bail!("Unknown status: {}", other),
    }
}

fn parse_service(value: &str) -> Result<ServiceKind> {
    match value.to_lowercase().as_str() {
        "llm" => Ok(ServiceKind::Llm),
        "image" => Ok(ServiceKind::Image),
        "vision" => Ok(ServiceKind::Vision),
        "vlm" => Ok(ServiceKind::Vlm),
        other => anyhow::bail!("Unknown service: {} (expected llm, image, vision, vlm)", other),
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        format!("{}...", &s[..max.saturating_sub(3)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_keeps_short_strings() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a longer prompt here", 10), "a longe...");
    }

    #[test]
    fn status_parsing_is_case_insensitive() {
        assert!(matches!(
            parse_status("Completed").unwrap(),
            SessionStatus::Completed
        ));
        assert!(parse_status("unknown").is_err());
    }

    #[test]
    fn service_names_parse() {
        assert!(matches!(parse_service("vlm").unwrap(), ServiceKind::Vlm));
        assert!(parse_service("gpu").is_err());
    }
}
