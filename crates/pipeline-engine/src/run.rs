//! `Run`: owns the step sequence, seeds inputs, drives worker threads, and
//! advances the finalization frontier — spec §4.3.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::RunError;
use crate::generation::Generation;
use crate::notification::Notification;
use crate::state::State;
use crate::step::{Step, StepConfig, StepHandle, StepStatus};
use crate::util;

const WORKER_IDLE_BACKOFF: Duration = Duration::from_millis(10);
const SUPERVISOR_TICK: Duration = Duration::from_millis(500);

/// Construction parameters for a [`Run`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Worker thread count. Zero means "ask the environment" (see
    /// [`crate::util::default_parallelism`]).
    pub parallelism: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self { parallelism: 0 }
    }
}

/// A single step's status, for an external renderer (spec §6).
#[derive(Debug, Clone)]
pub struct StepStatusReport {
    pub index: usize,
    pub status: StepStatus,
    pub emoji: &'static str,
    pub cancel_reason: Option<String>,
}

/// The coordinator owning an ordered step list and a worker pool.
///
/// Steps are added with [`Run::add_step`] before [`Run::run_to_completion`]
/// is called; adding a step to a running `Run` is an error, matching the
/// donor's pattern of validating pipeline construction up front (see
/// `lex-processing::pipeline::builder`).
pub struct Run<K, V> {
    steps: Vec<Arc<StepHandle<K, V>>>,
    running: bool,
    config: RunConfig,
}

impl<K, V> Run<K, V>
where
    K: Eq + std::hash::Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(config: RunConfig) -> Self {
        Self {
            steps: Vec::new(),
            running: false,
            config,
        }
    }

    /// Registers a step, assigning it the next index. Forbidden once
    /// [`run_to_completion`](Run::run_to_completion) has been called.
    pub fn add_step(
        &mut self,
        step: impl Step<K, V> + 'static,
        config: StepConfig,
    ) -> Result<usize, RunError> {
        if self.running {
            return Err(RunError::AlreadyRunning);
        }
        let index = self.steps.len();
        self.steps
            .push(Arc::new(StepHandle::new(index, Box::new(step), config)));
        Ok(index)
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// A point-in-time status line per step, for an external renderer.
    pub fn status_snapshot(&self) -> Vec<StepStatusReport> {
        self.steps
            .iter()
            .map(|s| StepStatusReport {
                index: s.index(),
                status: s.status(),
                emoji: s.emoji(),
                cancel_reason: s.cancel_reason(),
            })
            .collect()
    }

    fn feedforward(steps: &[Arc<StepHandle<K, V>>], from_idx: usize, n: Notification<K, V>) {
        for step in &steps[from_idx..] {
            step.notify(n.clone());
        }
    }

    /// Seeds `inputs` at generation zero and drives every worker until the
    /// last step reaches `outputs_final`. Returns that step's output state.
    pub fn run_to_completion(
        &mut self,
        inputs: HashMap<K, V>,
    ) -> Result<HashMap<K, State<V>>, RunError> {
        if self.steps.is_empty() {
            return Err(RunError::NoSteps);
        }

        self.running = true;
        let n = self.steps.len();
        let parallelism = if self.config.parallelism == 0 {
            util::default_parallelism()
        } else {
            self.config.parallelism
        };

        tracing::info!(steps = n, parallelism, "run starting");

        let finalized_idx = Arc::new(AtomicI64::new(-1));
        let progressed_counter = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..parallelism)
            .map(|worker_id| {
                let steps = self.steps.clone();
                let finalized_idx = finalized_idx.clone();
                let progressed_counter = progressed_counter.clone();
                thread::spawn(move || worker_loop(worker_id, steps, finalized_idx, progressed_counter))
            })
            .collect();

        for (key, value) in inputs {
            let notification = Notification::new(key, State::present(Generation::zero(n), value));
            Self::feedforward(&self.steps, 0, notification);
        }

        loop {
            advance_finalization_frontier(&self.steps, &finalized_idx);
            if self.steps[n - 1].outputs_final() {
                break;
            }
            tracing::trace!(status = ?self.status_snapshot(), "run tick");
            thread::sleep(SUPERVISOR_TICK);
        }

        self.running = false;
        for worker in workers {
            let _ = worker.join();
        }

        tracing::info!("run complete");
        Ok(self.steps[n - 1].output_state_snapshot())
    }
}

/// Each worker repeatedly scans steps from `finalized_idx + 1` upward,
/// running whichever step can advance, restarting the scan on any success
/// and backing off briefly on a fully idle pass (spec §4.3.1).
fn worker_loop<K, V>(
    _worker_id: usize,
    steps: Vec<Arc<StepHandle<K, V>>>,
    finalized_idx: Arc<AtomicI64>,
    progressed_counter: Arc<AtomicUsize>,
) where
    K: Eq + std::hash::Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    let last = steps.len() - 1;
    loop {
        if steps[last].outputs_final() {
            return;
        }

        let start = (finalized_idx.load(Ordering::SeqCst) + 1).max(0) as usize;
        let mut progressed = false;

        for i in start..steps.len() {
            if steps[i].run_next_batch() {
                progressed = true;
                progressed_counter.fetch_add(1, Ordering::Relaxed);
                let produced = steps[i].drain_output_notifications();
                for notification in produced {
                    Run::feedforward(&steps, i + 1, notification);
                }
                break;
            }
        }

        // Sweep any output a step produced outside of this pass — e.g. an
        // unwind triggered by a `StepControl::cancel` call mid-`process`,
        // or a cancellation issued from outside the scheduler entirely —
        // so it is never left stranded once the step stops being polled.
        for step in &steps {
            let leftover = step.drain_output_notifications();
            if !leftover.is_empty() {
                let idx = step.index();
                for notification in leftover {
                    Run::feedforward(&steps, idx + 1, notification);
                }
            }
        }

        if !progressed {
            thread::sleep(WORKER_IDLE_BACKOFF);
        }
    }
}

/// Advances `finalized_idx` as far as the data allows: a step becomes final
/// once upstream is final and the step itself has drained its queue with no
/// batch in flight. Setting `inputs_final` here is what unblocks a
/// non-eager step (spec §4.3.2): "without this, non-eager steps would never
/// run."
fn advance_finalization_frontier<K, V>(steps: &[Arc<StepHandle<K, V>>], finalized_idx: &AtomicI64)
where
    K: Eq + std::hash::Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    loop {
        let current = finalized_idx.load(Ordering::SeqCst);
        let next = current + 1;
        if next as usize >= steps.len() {
            return;
        }
        let step = &steps[next as usize];

        if step.outputs_final() {
            finalized_idx.store(next, Ordering::SeqCst);
            continue;
        }

        let upstream_final = next == 0 || steps[(next - 1) as usize].outputs_final();
        if !upstream_final {
            return;
        }

        // Must be set as soon as upstream is final, not only once this step's
        // queue has drained — a non-eager step refuses to admit any batch
        // until `inputs_final` is set, so its queue can never drain on its
        // own (step.rs's admission check). Gating this on an already-empty
        // queue would deadlock every non-eager step forever.
        if !step.inputs_final() {
            step.set_inputs_final();
        }

        if step.outstanding() == 0 && !step.has_unprocessed() {
            step.finalize_outputs();
            finalized_idx.store(next, Ordering::SeqCst);
            continue;
        }

        return;
    }
}
