use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use tracing::{debug, info, warn};

use super::{Worker, WorkerContext, WorkerExit};

// Approximate footprint of one in-flight state, reported to the governor.
const STATE_BYTES: u64 = 4096;
// Cooperative yield cadence when no step delay is configured.
const YIELD_EVERY: u64 = 1024;

#[derive(Debug, Clone, Copy)]
struct Scored {
    id: u64,
    score: f64,
}

impl PartialEq for Scored {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Scored {}

impl PartialOrd for Scored {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Higher score wins; on ties the earlier state wins.
impl Ord for Scored {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.id.cmp(&self.id))
    }
}

/// Built-in deterministic stand-in for the adviser search.
///
/// Draws state scores from a `StdRng` seeded with `SEED`, scores at most
/// `LIMIT` states, keeps at most `BEAM_WIDTH` of them in flight and returns the
/// best `COUNT`. On the stop signal it publishes whatever the beam holds.
#[derive(Debug, Clone, Default)]
pub struct SeededSampler {
    step_delay: Duration,
}

impl SeededSampler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pause between scored states, to emulate an expensive scoring function.
    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }
}

impl Worker for SeededSampler {
    fn name(&self) -> &'static str {
        "seeded-sampler"
    }

    async fn run(&self, ctx: WorkerContext) -> WorkerExit {
        let params = ctx.parameters.clone();
        debug!(
            requirements = params.requirements().is_some(),
            requirements_locked = params.requirements_locked().is_some(),
            library_usage = params.library_usage().is_some(),
            format = params.requirements_format().map(|f| f.as_str()),
            recommendation_type = params.recommendation_type().map(|r| r.as_str()),
            runtime_environment = params.runtime_environment(),
            version_window = ?params.limit_latest_versions(),
            "Sampler inputs"
        );
        let mut rng = StdRng::seed_from_u64(params.seed() as u64);
        let mut beam: BinaryHeap<Reverse<Scored>> = BinaryHeap::new();
        let mut scored = 0u64;

        while scored < params.limit() {
            if ctx.stop_requested() {
                info!(scored, "Stop requested, flushing best candidates");
                break;
            }

            beam.push(Reverse(Scored {
                id: scored,
                score: rng.random_range(-1.0..1.0),
            }));
            if beam.len() as u64 > params.beam_width() {
                beam.pop();
            }
            scored += 1;
            ctx.meter().record_memory(beam.len() as u64 * STATE_BYTES);

            if !self.step_delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(self.step_delay) => {}
                    _ = ctx.stopped() => {}
                }
            } else if scored % YIELD_EVERY == 0 {
                tokio::task::yield_now().await;
            }
        }

        let mut best: Vec<Scored> = beam.into_iter().map(|Reverse(s)| s).collect();
        best.sort_by(|a, b| b.cmp(a));
        best.truncate(params.count() as usize);
        debug!(scored, returned = best.len(), "Search finished");

        let candidates = best
            .iter()
            .enumerate()
            .map(|(rank, s)| {
                json!({
                    "rank": rank + 1,
                    "state_id": s.id,
                    "score": s.score,
                    "dev": params.dev(),
                })
            })
            .collect();

        match ctx.publish(candidates).await {
            Ok(_) => WorkerExit::success(),
            Err(e) => {
                warn!(error = %e, "Failed to publish result artifact");
                WorkerExit::code(1)
            }
        }
    }
}
