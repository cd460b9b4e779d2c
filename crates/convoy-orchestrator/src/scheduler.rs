use crate::config::AssignmentStrategy;
use crate::registry::AgentRegistry;
use convoy_core::Task;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Picks an agent for a pending task.
///
/// Candidates are the registry's ready agents whose capability set contains
/// the task type (and whose agent type matches, when the task names one).
/// The configured [`AssignmentStrategy`] then chooses among them:
///
/// - `LoadBalanced`: lowest current load, ties broken by registration order.
///   Identical registry snapshots always yield the same agent.
/// - `RoundRobin`: a shared cursor rotates over the candidate list.
/// - `Random`: uniform choice from a seedable generator.
pub struct Scheduler {
    registry: Arc<AgentRegistry>,
    strategy: AssignmentStrategy,
    cursor: AtomicUsize,
    rng: Mutex<StdRng>,
}

impl Scheduler {
    pub fn new(
        registry: Arc<AgentRegistry>,
        strategy: AssignmentStrategy,
        seed: Option<u64>,
    ) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            registry,
            strategy,
            cursor: AtomicUsize::new(0),
            rng: Mutex::new(rng),
        }
    }

    pub fn strategy(&self) -> AssignmentStrategy {
        self.strategy
    }

    /// Return the chosen agent id, or `None` when nobody is eligible.
    pub fn select_agent(&self, task: &Task) -> Option<String> {
        let candidates = self
            .registry
            .eligible(&task.task_type, task.agent_type.as_deref());
        if candidates.is_empty() {
            debug!(task_id = %task.id, task_type = %task.task_type, "No eligible agent");
            return None;
        }

        let chosen = match self.strategy {
            AssignmentStrategy::LoadBalanced => candidates
                .iter()
                .min_by_key(|r| (r.load, r.registration_seq))
                .map(|r| r.agent_id.clone()),
            AssignmentStrategy::RoundRobin => {
                let i = self.cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
                Some(candidates[i].agent_id.clone())
            }
            AssignmentStrategy::Random => {
                let i = self.rng.lock().gen_range(0..candidates.len());
                Some(candidates[i].agent_id.clone())
            }
        };

        debug!(
            task_id = %task.id,
            strategy = ?self.strategy,
            candidates = candidates.len(),
            agent_id = ?chosen,
            "Agent selected"
        );
        chosen
    }
}
