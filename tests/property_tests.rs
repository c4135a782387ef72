//! Property-based tests using proptest
//!
//! These tests verify invariants of the arena and evolution bookkeeping.

use chrono::Utc;
use proptest::prelude::*;

use colosseum::core::agent::{Agent, Personality};
use colosseum::core::arena::{apply_matchup, selection_weight, MatchupRecord};
use colosseum::core::discovery;
use colosseum::core::evolution::plan_selection;
use colosseum::core::pattern::{LifecycleRules, PatternStatus};
use colosseum::core::types::Timeframe;
use colosseum::config::EvolutionConfig;
use colosseum::data::EvolutionStore;

fn rules() -> LifecycleRules {
    LifecycleRules {
        min_runs_before_retire: 20,
        retire_vote_floor: -5,
        promote_vote_threshold: 5,
    }
}

/// 0 = a wins, 1 = b wins, 2 = tie
fn matchup(a: &str, b: &str, result: u8) -> MatchupRecord {
    MatchupRecord {
        round: 0,
        symbol: "TEST".to_string(),
        timeframe: Timeframe::H1,
        segment_start: Utc::now(),
        pattern_a: a.to_string(),
        pattern_b: b.to_string(),
        score_a: 0.0,
        score_b: 0.0,
        winner: match result {
            0 => Some(a.to_string()),
            1 => Some(b.to_string()),
            _ => None,
        },
    }
}

proptest! {
    #[test]
    fn prop_weight_falls_with_runs(runs in 0i64..10_000, votes in -9i64..10_000) {
        prop_assert!(selection_weight(runs + 1, votes) < selection_weight(runs, votes));
    }

    #[test]
    fn prop_weight_rises_with_votes(runs in 0i64..10_000, votes in -10_000i64..10_000) {
        prop_assert!(selection_weight(runs, votes + 1) > selection_weight(runs, votes));
    }

    #[test]
    fn prop_votes_equal_wins_minus_losses(
        games in prop::collection::vec((0usize..4, 0usize..4, 0u8..3), 1..60)
    ) {
        let store = EvolutionStore::in_memory().unwrap();
        let ids: Vec<String> = store
            .write(|r| {
                let mut ids = Vec::new();
                for p in discovery::literature_catalogue().into_iter().take(4) {
                    r.insert_pattern_if_absent(&p)?;
                    ids.push(p.id.clone());
                }
                Ok(ids)
            })
            .unwrap();

        let rules = rules();
        let mut played = 0;
        for (a, b, result) in games {
            if a == b {
                continue;
            }
            let mut m = matchup(&ids[a], &ids[b], result);
            store.write(|r| apply_matchup(r, &rules, &mut m)).unwrap();
            played += 1;
        }

        let patterns = store.read(|r| r.all_patterns()).unwrap();
        let mut total_runs = 0;
        for p in &patterns {
            prop_assert_eq!(p.votes, p.wins - p.losses);
            prop_assert!(p.wins + p.losses <= p.runs);
            if p.status != PatternStatus::Retired {
                prop_assert_eq!(rules.next_status(p.status, p.runs, p.votes), p.status);
            }
            total_runs += p.runs;
        }
        prop_assert_eq!(total_runs, 2 * played);
        prop_assert_eq!(store.read(|r| r.counter("pattern_rounds")).unwrap(), played);
    }

    #[test]
    fn prop_selection_respects_population_floor(
        n in 0usize..40,
        floor in 0usize..12,
        eliminate in 0.0f64..0.9,
        clone in 0.0f64..0.9,
    ) {
        let ranked: Vec<Agent> = (0..n)
            .map(|i| {
                let mut a = Agent::founder(Personality::all()[i % 6], i);
                a.fitness = (n - i) as f64;
                a
            })
            .collect();
        let config = EvolutionConfig {
            eliminate_fraction: eliminate,
            clone_fraction: clone,
            min_population: floor,
            ..Default::default()
        };
        let plan = plan_selection(&ranked, &config);

        let after = n - plan.eliminate.len() + plan.parents.len();
        prop_assert!(after <= n);
        prop_assert!(after >= floor.min(n));
        for id in &plan.parents {
            prop_assert!(!plan.eliminate.contains(id));
        }
        // The worst agent goes first
        if let Some(last) = ranked.last() {
            if !plan.eliminate.is_empty() {
                prop_assert!(plan.eliminate.contains(&last.id));
            }
        }
    }
}
