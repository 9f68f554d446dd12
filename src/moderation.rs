use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, OnceLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::providers::PromptRewriter;

/// Default generation attempts before giving up on a refused prompt.
const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Default cap on stored rewrite history.
const DEFAULT_HISTORY_CAP: usize = 200;

/// Does an upstream error body describe a content-policy refusal?
pub fn is_policy_violation_message(message: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)content policy violation|content_policy_violation|inappropriate")
            .expect("policy regex compiles")
    })
    .is_match(message)
}

/// One rewrite episode, successful or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RewriteRecord {
    pub original: String,
    pub rewritten: String,
    pub attempts: u32,
    pub timestamp: String,
}

/// History of policy episodes with a cosine-TF similarity index over past
/// successes, used to bias new rewrites toward known-good phrasings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViolationTracker {
    successes: Vec<RewriteRecord>,
    failures: Vec<RewriteRecord>,
    cap: usize,
}

impl Default for ViolationTracker {
    fn default() -> Self {
        Self::with_cap(DEFAULT_HISTORY_CAP)
    }
}

impl ViolationTracker {
    pub fn with_cap(cap: usize) -> Self {
        Self {
            successes: Vec::new(),
            failures: Vec::new(),
            cap: cap.max(1),
        }
    }

    pub fn record_success(&mut self, original: &str, rewritten: &str, attempts: u32) {
        push_capped(
            &mut self.successes,
            RewriteRecord {
                original: original.to_string(),
                rewritten: rewritten.to_string(),
                attempts,
                timestamp: chrono::Utc::now().to_rfc3339(),
            },
            self.cap,
        );
    }

    pub fn record_failure(&mut self, original: &str, last_attempt: &str, attempts: u32) {
        push_capped(
            &mut self.failures,
            RewriteRecord {
                original: original.to_string(),
                rewritten: last_attempt.to_string(),
                attempts,
                timestamp: chrono::Utc::now().to_rfc3339(),
            },
            self.cap,
        );
    }

    pub fn successes(&self) -> &[RewriteRecord] {
        &self.successes
    }

    pub fn failures(&self) -> &[RewriteRecord] {
        &self.failures
    }

    /// The past success most similar to the prompt, by cosine over term
    /// frequencies. Returns None when nothing clears a minimal threshold.
    pub fn most_similar_success(&self, prompt: &str) -> Option<&RewriteRecord> {
        let target = tf_vector(prompt);
        self.successes
            .iter()
            .map(|record| (cosine(&target, &tf_vector(&record.original)), record))
            .filter(|(score, _)| *score > 0.1)
            .max_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(_, record)| record)
    }
}

fn push_capped(records: &mut Vec<RewriteRecord>, record: RewriteRecord, cap: usize) {
    records.push(record);
    if records.len() > cap {
        let excess = records.len() - cap;
        records.drain(..excess);
    }
}

fn tf_vector(text: &str) -> HashMap<String, f64> {
    let mut counts = HashMap::new();
    for word in text
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        *counts.entry(word.to_string()).or_insert(0.0) += 1.0;
    }
    counts
}

fn cosine(a: &HashMap<String, f64>, b: &HashMap<String, f64>) -> f64 {
    let dot: f64 = a
        .iter()
        .filter_map(|(term, weight)| b.get(term).map(|other| weight * other))
        .sum();
    let norm_a: f64 = a.values().map(|w| w * w).sum::<f64>().sqrt();
    let norm_b: f64 = b.values().map(|w| w * w).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// Outcome of a moderated operation: the value, the prompt that finally
/// passed, and how many generation attempts it took.
#[derive(Debug)]
pub struct ModeratedOutcome<T> {
    pub value: T,
    pub final_prompt: String,
    pub attempts: u32,
}

/// Wraps an LLM or image operation in a bounded rewrite-and-retry loop that
/// survives content-policy refusals.
pub struct ModerationRefiner {
    rewriter: Arc<dyn PromptRewriter>,
    tracker: Mutex<ViolationTracker>,
    max_attempts: u32,
}

impl ModerationRefiner {
    pub fn new(rewriter: Arc<dyn PromptRewriter>) -> Self {
        Self::with_budget(rewriter, DEFAULT_MAX_ATTEMPTS)
    }

    pub fn with_budget(rewriter: Arc<dyn PromptRewriter>, max_attempts: u32) -> Self {
        Self {
            rewriter,
            tracker: Mutex::new(ViolationTracker::default()),
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn tracker_snapshot(&self) -> ViolationTracker {
        self.tracker.lock().expect("violation tracker poisoned").clone()
    }

    /// Run the operation, rewriting the prompt after each policy refusal
    /// until it passes or the attempt budget is spent.
    pub async fn run<T, F, Fut>(
        &self,
        prompt: &str,
        op: F,
    ) -> Result<ModeratedOutcome<T>, EngineError>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        let mut current = prompt.to_string();

        for attempt in 1..=self.max_attempts {
            match op(current.clone()).await {
                Ok(value) => {
                    if attempt > 1 {
                        self.tracker
                            .lock()
                            .expect("violation tracker poisoned")
                            .record_success(prompt, &current, attempt);
                        tracing::info!(attempt, "prompt accepted after rewrite");
                    }
                    return Ok(ModeratedOutcome {
                        value,
                        final_prompt: current,
                        attempts: attempt,
                    });
                }
                Err(err) if err.is_content_policy() => {
                    tracing::warn!(attempt, error = %err, "content policy refusal");
                    if attempt == self.max_attempts {
                        self.tracker
                            .lock()
                            .expect("violation tracker poisoned")
                            .record_failure(prompt, &current, attempt);
                        return Err(EngineError::ContentPolicyExhausted {
                            attempts: attempt,
                            message: err.to_string(),
                        });
                    }
                    current = self.rewrite(&current).await?;
                }
                Err(err) => return Err(err),
            }
        }

        unreachable!("attempt loop always returns");
    }

    async fn rewrite(&self, prompt: &str) -> Result<String, EngineError> {
        let guidance = {
            let tracker = self.tracker.lock().expect("violation tracker poisoned");
            tracker
                .most_similar_success(prompt)
                .map(|record| {
                    format!(
                        "A similar prompt previously passed after this rewrite: {:?}",
                        record.rewritten
                    )
                })
                .unwrap_or_default()
        };

        Ok(self.rewriter.rewrite(prompt, &guidance).await?.text)
    }
}
