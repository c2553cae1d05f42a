// ================================================================================================
// Deterministic PRNG Streams
// ================================================================================================
//
// One global primary seed, many independent streams. Every stochastic stage derives a
// tick-local stream `(primary_seed, tick, agent_index, stage)` so stages are independent
// and re-entrant: re-running any stage for any agent at any tick reproduces the exact
// sample sequence.

use rand::{SeedableRng, rngs::StdRng};
use strum::{Display, EnumString, IntoStaticStr};

use crate::types::{Seed, Tick};

/// Stage tags namespacing the per-tick PRNG streams.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum StageTag {
    /// Agent processing order for the tick.
    Ordering,
    /// Peer sampling during observation.
    Observe,
    /// Action sampling (softmax draws).
    Decide,
    /// Bounded-rationality Gaussian noise.
    Noise,
    /// Per-agent fault injection checks.
    Fault,
    /// Population parameter generation at run start.
    Parameters,
}

/// Derive the tick-local stream `PRNG(primary_seed, tick, agent_index, stage_tag)`.
///
/// The tuple is hashed into a 32-byte key, which seeds a `StdRng`. Hash derivation keeps
/// streams statistically independent without coordinating counters across partitions.
pub fn stream(seed: Seed, tick: Tick, agent_index: u32, stage: StageTag) -> StdRng {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&seed.0.to_le_bytes());
    hasher.update(&tick.0.to_le_bytes());
    hasher.update(&agent_index.to_le_bytes());
    hasher.update(<&'static str>::from(stage).as_bytes());
    StdRng::from_seed(*hasher.finalize().as_bytes())
}

/// Stream for population-level stages (no specific agent).
pub fn population_stream(seed: Seed, tick: Tick, stage: StageTag) -> StdRng {
    stream(seed, tick, u32::MAX, stage)
}

/// Stable processing order for a tick: a Fisher-Yates permutation of `0..n` drawn from
/// the `Ordering` stream of `(seed, tick)`.
pub fn tick_permutation(seed: Seed, tick: Tick, n: usize) -> Vec<u32> {
    use rand::Rng;

    let mut rng = population_stream(seed, tick, StageTag::Ordering);
    let mut order: Vec<u32> = (0..n as u32).collect();
    for i in (1..n).rev() {
        let j = rng.random_range(0..=i);
        order.swap(i, j);
    }
    order
}
