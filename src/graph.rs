use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::models::{AggregateStats, ComparisonFact, FactorRanks, PairWinner, RankingEntry};

/// Result of an inference query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inference {
    pub winner_id: String,
    /// False when the pair was compared directly, true when derived by
    /// transitive closure.
    pub inferred: bool,
}

/// Directed dominance graph over candidate ids. Stores direct comparator
/// facts plus the full transitive closure, maintained eagerly on every
/// insert (candidate sets stay small, N <= 32).
#[derive(Debug, Default, Clone)]
pub struct ComparisonGraph {
    beats: HashMap<String, HashSet<String>>,
    loses_to: HashMap<String, HashSet<String>>,
    direct: Vec<ComparisonFact>,
    scores: HashMap<String, Vec<FactorRanks>>,
}

/// Serialised form: direct facts only, closure rebuilt on load.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedGraph {
    pub direct_comparisons: Vec<ComparisonFact>,
}

impl ComparisonGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a direct comparison and propagate closure: everything that
    /// beats the winner now also beats the loser and everything it beats.
    /// A fact contradicting an already-inferred ordering keeps the fact in
    /// the direct log but adds no edges, preserving the DAG.
    pub fn record(
        &mut self,
        id_a: &str,
        id_b: &str,
        winner: PairWinner,
        ranks: Option<(FactorRanks, FactorRanks)>,
    ) -> Result<(), EngineError> {
        if id_a == id_b {
            return Err(EngineError::invalid(format!(
                "reflexive comparison for {id_a}"
            )));
        }

        let fact = ComparisonFact {
            id_a: id_a.to_string(),
            id_b: id_b.to_string(),
            winner,
            ranks_a: ranks.map(|(a, _)| a),
            ranks_b: ranks.map(|(_, b)| b),
            timestamp: chrono::Utc::now().to_rfc3339(),
            inferred: false,
        };
        self.apply(fact);
        Ok(())
    }

    fn apply(&mut self, fact: ComparisonFact) {
        let winner = fact.winner_id().to_string();
        let loser = fact.loser_id().to_string();

        if let Some(ranks) = fact.ranks_a {
            self.scores.entry(fact.id_a.clone()).or_default().push(ranks);
        }
        if let Some(ranks) = fact.ranks_b {
            self.scores.entry(fact.id_b.clone()).or_default().push(ranks);
        }

        let contradicts = self
            .beats
            .get(&loser)
            .map_or(false, |set| set.contains(&winner));

        self.direct.push(fact);

        if contradicts {
            tracing::debug!(%winner, %loser, "contradictory fact recorded without edges");
            return;
        }

        // Upstream of the winner (inclusive) dominates downstream of the
        // loser (inclusive).
        let mut ups: HashSet<String> = self.loses_to.get(&winner).cloned().unwrap_or_default();
        ups.insert(winner);
        let mut downs: HashSet<String> = self.beats.get(&loser).cloned().unwrap_or_default();
        downs.insert(loser);

        for up in &ups {
            for down in &downs {
                if up == down {
                    continue;
                }
                self.beats.entry(up.clone()).or_default().insert(down.clone());
                self.loses_to
                    .entry(down.clone())
                    .or_default()
                    .insert(up.clone());
            }
        }
    }

    /// O(1) dominance lookup between two candidates.
    pub fn can_infer(&self, id_a: &str, id_b: &str) -> Option<Inference> {
        let winner_id = if self
            .beats
            .get(id_a)
            .map_or(false, |set| set.contains(id_b))
        {
            id_a
        } else if self
            .beats
            .get(id_b)
            .map_or(false, |set| set.contains(id_a))
        {
            id_b
        } else {
            return None;
        };

        let direct = self
            .direct
            .iter()
            .any(|f| f.involves(id_a) && f.involves(id_b));

        Some(Inference {
            winner_id: winner_id.to_string(),
            inferred: !direct,
        })
    }

    pub fn wins(&self, id: &str) -> usize {
        self.beats.get(id).map_or(0, |set| set.len())
    }

    pub fn losses(&self, id: &str) -> usize {
        self.loses_to.get(id).map_or(0, |set| set.len())
    }

    /// Average per-factor ranks over every direct comparison involving the
    /// candidate.
    pub fn aggregate_stats(&self, id: &str) -> Option<AggregateStats> {
        let ranks = self.scores.get(id)?;
        if ranks.is_empty() {
            return None;
        }
        let n = ranks.len() as f64;
        Some(AggregateStats {
            avg_alignment_rank: ranks.iter().map(|r| r.alignment).sum::<f64>() / n,
            avg_aesthetics_rank: ranks.iter().map(|r| r.aesthetics).sum::<f64>() / n,
            avg_combined_rank: ranks.iter().map(|r| r.combined).sum::<f64>() / n,
            comparisons: ranks.len(),
        })
    }

    /// Direct facts involving a candidate, for attachment to its record.
    pub fn comparisons_for(&self, id: &str) -> Vec<ComparisonFact> {
        self.direct
            .iter()
            .filter(|f| f.involves(id))
            .cloned()
            .collect()
    }

    /// Complete ordering of the given keys: descending wins, ascending
    /// losses, candidate id as a deterministic tie-break. Ranks run 1..N.
    pub fn rankings(&self, keys: &[String]) -> Vec<RankingEntry> {
        let mut ordered: Vec<&String> = keys.iter().collect();
        ordered.sort_by(|a, b| {
            self.wins(b)
                .cmp(&self.wins(a))
                .then(self.losses(a).cmp(&self.losses(b)))
                .then(a.cmp(b))
        });

        ordered
            .into_iter()
            .enumerate()
            .map(|(idx, id)| RankingEntry {
                candidate_id: id.clone(),
                rank: idx + 1,
                wins: self.wins(id),
                losses: self.losses(id),
                aggregate_stats: self.aggregate_stats(id),
            })
            .collect()
    }

    pub fn direct_comparisons(&self) -> &[ComparisonFact] {
        &self.direct
    }

    pub fn direct_count(&self) -> usize {
        self.direct.len()
    }

    /// Seed from prior facts (e.g. survivor-vs-survivor edges carried over
    /// from the previous iteration).
    pub fn seed(&mut self, facts: &[ComparisonFact]) {
        for fact in facts {
            self.apply(ComparisonFact {
                inferred: false,
                ..fact.clone()
            });
        }
    }

    pub fn to_serialized(&self) -> SerializedGraph {
        SerializedGraph {
            direct_comparisons: self.direct.clone(),
        }
    }

    /// Rebuild from direct facts, replaying closure insert by insert.
    pub fn from_serialized(serialized: SerializedGraph) -> Self {
        let mut graph = Self::new();
        graph.seed(&serialized.direct_comparisons);
        graph
    }

    #[cfg(test)]
    pub(crate) fn beats_set(&self, id: &str) -> HashSet<String> {
        self.beats.get(id).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranks(alignment: f64, aesthetics: f64) -> FactorRanks {
        FactorRanks::new(alignment, aesthetics, 0.7)
    }

    #[test]
    fn record_adds_direct_edge() {
        let mut g = ComparisonGraph::new();
        g.record("a", "b", PairWinner::A, None).unwrap();

        let inferred = g.can_infer("a", "b").unwrap();
        assert_eq!(inferred.winner_id, "a");
        assert!(!inferred.inferred);
        assert_eq!(g.wins("a"), 1);
        assert_eq!(g.losses("b"), 1);
    }

    #[test]
    fn transitive_closure_spans_chains() {
        let mut g = ComparisonGraph::new();
        g.record("a", "b", PairWinner::A, None).unwrap();
        g.record("b", "c", PairWinner::A, None).unwrap();

        let inferred = g.can_infer("a", "c").unwrap();
        assert_eq!(inferred.winner_id, "a");
        assert!(inferred.inferred);
    }

    #[test]
    fn closure_joins_disjoint_components() {
        // a>b and c>d exist before b>c lands; the join must still produce a>d.
        let mut g = ComparisonGraph::new();
        g.record("a", "b", PairWinner::A, None).unwrap();
        g.record("c", "d", PairWinner::A, None).unwrap();
        assert!(g.can_infer("a", "d").is_none());

        g.record("b", "c", PairWinner::A, None).unwrap();
        assert_eq!(g.can_infer("a", "d").unwrap().winner_id, "a");
        assert_eq!(g.wins("a"), 3);
    }

    #[test]
    fn reflexive_comparison_is_rejected() {
        let mut g = ComparisonGraph::new();
        assert!(matches!(
            g.record("a", "a", PairWinner::A, None),
            Err(EngineError::InvalidArgument(_))
        ));
    }

    #[test]
    fn contradictory_fact_keeps_dag() {
        let mut g = ComparisonGraph::new();
        g.record("a", "b", PairWinner::A, None).unwrap();
        g.record("b", "c", PairWinner::A, None).unwrap();
        // c>a contradicts the inferred a>c; the fact is logged, edges are not.
        g.record("c", "a", PairWinner::A, None).unwrap();

        assert_eq!(g.can_infer("a", "c").unwrap().winner_id, "a");
        assert_eq!(g.direct_count(), 3);
        assert!(!g.beats_set("c").contains("a"));
    }

    #[test]
    fn rankings_order_by_wins_then_losses() {
        let mut g = ComparisonGraph::new();
        g.record("a", "b", PairWinner::A, None).unwrap();
        g.record("a", "c", PairWinner::A, None).unwrap();
        g.record("b", "c", PairWinner::A, None).unwrap();

        let keys = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let rankings = g.rankings(&keys);
        assert_eq!(rankings[0].candidate_id, "a");
        assert_eq!(rankings[0].rank, 1);
        assert_eq!(rankings[1].candidate_id, "b");
        assert_eq!(rankings[2].candidate_id, "c");
        assert_eq!(rankings[2].losses, 2);
    }

    #[test]
    fn aggregate_stats_average_factor_ranks() {
        let mut g = ComparisonGraph::new();
        g.record("a", "b", PairWinner::A, Some((ranks(1.0, 1.0), ranks(2.0, 2.0))))
            .unwrap();
        g.record("a", "c", PairWinner::A, Some((ranks(1.0, 2.0), ranks(2.0, 1.0))))
            .unwrap();

        let stats = g.aggregate_stats("a").unwrap();
        assert_eq!(stats.comparisons, 2);
        assert!((stats.avg_alignment_rank - 1.0).abs() < 1e-9);
        assert!((stats.avg_aesthetics_rank - 1.5).abs() < 1e-9);
    }

    #[test]
    fn serialisation_round_trips_closure() {
        let mut g = ComparisonGraph::new();
        g.record("a", "b", PairWinner::A, Some((ranks(1.0, 1.0), ranks(2.0, 2.0))))
            .unwrap();
        g.record("b", "c", PairWinner::A, None).unwrap();
        g.record("d", "a", PairWinner::A, None).unwrap();

        let rebuilt = ComparisonGraph::from_serialized(g.to_serialized());

        for id in ["a", "b", "c", "d"] {
            assert_eq!(rebuilt.beats_set(id), g.beats_set(id), "beats[{id}]");
        }
        assert_eq!(rebuilt.direct_count(), g.direct_count());
        assert_eq!(rebuilt.can_infer("d", "c").unwrap().winner_id, "d");
    }
}
