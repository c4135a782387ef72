//! Pattern Discovery
//!
//! Three producers feed the library, one per origin tag:
//! - random discovery: 1-3 random predicates, random direction and horizon
//! - literature: a fixed catalogue of well-known setups
//! - technical rules: one feature against a grid of thresholds
//!
//! Names are deterministic functions of the rule, so inserting a
//! rediscovered rule is a no-op.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;

use super::indicators::Feature;
use super::pattern::{Comparator, Condition, Pattern, PatternOrigin, Predicate};
use super::types::Direction;

const HORIZONS: [usize; 5] = [3, 5, 8, 13, 21];

fn rule(predicates: Vec<Predicate>, direction: Direction, horizon: usize) -> Condition {
    Condition { predicates, direction, horizon }
}

fn direction_tag(direction: Direction) -> &'static str {
    match direction {
        Direction::Long => "long",
        Direction::Short => "short",
    }
}

/// A random conjunction of 1-3 predicates over distinct features
pub fn random_discovery(rng: &mut StdRng) -> Pattern {
    let count = rng.gen_range(1..=3);
    let mut features = Feature::all().to_vec();
    features.shuffle(rng);

    let predicates: Vec<Predicate> = features
        .into_iter()
        .take(count)
        .map(|feature| {
            let (lo, hi) = feature.threshold_range();
            // Round so names stay readable and collisions stay meaningful
            let threshold = (rng.gen_range(lo..hi) * 10_000.0).round() / 10_000.0;
            let comparator = if rng.gen_bool(0.5) { Comparator::Above } else { Comparator::Below };
            Predicate::new(feature, comparator, threshold)
        })
        .collect();

    let direction = if rng.gen_bool(0.5) { Direction::Long } else { Direction::Short };
    let horizon = *HORIZONS.choose(rng).unwrap_or(&5);
    let condition = rule(predicates, direction, horizon);
    let name = format!("rnd:{}", condition.describe());
    Pattern::new(&name, condition, PatternOrigin::RandomDiscovery)
}

/// Well-known setups
pub fn literature_catalogue() -> Vec<Pattern> {
    use Comparator::{Above, Below};
    use Feature::*;

    let entries: Vec<(&str, Condition)> = vec![
        (
            "lit:rsi-oversold-reversal",
            rule(vec![Predicate::new(Rsi14, Below, 30.0)], Direction::Long, 5),
        ),
        (
            "lit:rsi-overbought-reversal",
            rule(vec![Predicate::new(Rsi14, Above, 70.0)], Direction::Short, 5),
        ),
        (
            "lit:golden-cross-momentum",
            rule(
                vec![Predicate::new(SmaSpread, Above, 0.0), Predicate::new(Momentum5, Above, 0.0)],
                Direction::Long,
                13,
            ),
        ),
        (
            "lit:death-cross-momentum",
            rule(
                vec![Predicate::new(SmaSpread, Below, 0.0), Predicate::new(Momentum5, Below, 0.0)],
                Direction::Short,
                13,
            ),
        ),
        (
            "lit:volatility-breakout",
            rule(
                vec![Predicate::new(Volatility20, Above, 0.012), Predicate::new(Momentum5, Above, 0.01)],
                Direction::Long,
                8,
            ),
        ),
        (
            "lit:volume-climax-reversal",
            rule(
                vec![Predicate::new(VolumeRatio, Above, 2.0), Predicate::new(Momentum5, Below, -0.01)],
                Direction::Long,
                5,
            ),
        ),
        (
            "lit:mean-reversion-stretch",
            rule(vec![Predicate::new(SmaDeviation, Above, 0.02)], Direction::Short, 8),
        ),
        (
            "lit:quiet-trend-follow",
            rule(
                vec![Predicate::new(Volatility20, Below, 0.006), Predicate::new(SmaSpread, Above, 0.003)],
                Direction::Long,
                21,
            ),
        ),
    ];

    entries
        .into_iter()
        .map(|(name, condition)| Pattern::new(name, condition, PatternOrigin::LiteratureDerived))
        .collect()
}

/// Grid of single-feature rules: each feature at 5 evenly spaced thresholds,
/// both comparators, direction following the comparator
pub fn technical_rules() -> Vec<Pattern> {
    let mut patterns = Vec::new();
    for feature in Feature::all() {
        let (lo, hi) = feature.threshold_range();
        for step in 1..=5 {
            let threshold = lo + (hi - lo) * step as f64 / 6.0;
            let threshold = (threshold * 10_000.0).round() / 10_000.0;
            for (comparator, direction) in [
                (Comparator::Above, Direction::Long),
                (Comparator::Below, Direction::Short),
            ] {
                let condition = rule(vec![Predicate::new(feature, comparator, threshold)], direction, 8);
                let name = format!(
                    "tech:{}:{}:{}",
                    direction_tag(direction),
                    condition.predicates[0].describe(),
                    condition.horizon
                );
                patterns.push(Pattern::new(&name, condition, PatternOrigin::TechnicalRule));
            }
        }
    }
    patterns
}

/// Candidates to bring the library up to `needed` new patterns.
/// Literature first, then technical rules, then random discoveries;
/// the store drops any name it already has.
pub fn candidates(rng: &mut StdRng, needed: usize) -> Vec<Pattern> {
    if needed == 0 {
        return Vec::new();
    }
    let mut out = literature_catalogue();
    let mut tech = technical_rules();
    tech.shuffle(rng);
    out.extend(tech.into_iter().take(needed));
    for _ in 0..needed {
        out.push(random_discovery(rng));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use std::collections::HashSet;

    #[test]
    fn test_random_discovery_shape() {
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..100 {
            let p = random_discovery(&mut rng);
            let n = p.condition.predicates.len();
            assert!((1..=3).contains(&n));
            let features: HashSet<_> = p.condition.predicates.iter().map(|x| x.feature).collect();
            assert_eq!(features.len(), n);
            assert!(HORIZONS.contains(&p.condition.horizon));
            assert_eq!(p.origin, PatternOrigin::RandomDiscovery);
        }
    }

    #[test]
    fn test_random_discovery_replays() {
        let a = random_discovery(&mut StdRng::seed_from_u64(9));
        let b = random_discovery(&mut StdRng::seed_from_u64(9));
        assert_eq!(a.name, b.name);
        assert_eq!(a.condition, b.condition);
    }

    #[test]
    fn test_catalogue_names_unique() {
        let mut names = HashSet::new();
        for p in literature_catalogue().into_iter().chain(technical_rules()) {
            assert!(names.insert(p.name.clone()), "duplicate {}", p.name);
        }
        assert_eq!(technical_rules().len(), Feature::all().len() * 10);
    }
}
