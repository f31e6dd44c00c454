//! `Step`: the user-overridable unit of transformation, and `StepHandle`,
//! the concrete wrapper that gives it a queue, acceptance rules, batching,
//! and cancellation/unwind — spec §4.2.
//!
//! Per the "abstract base step" re-architecture note, the split here is a
//! small trait (`Step`) for what a user implements, and a concrete type
//! (`StepHandle`) that owns the scheduling machinery and composes with any
//! `Step` implementation. User code never touches `StepHandle` directly;
//! `Run` constructs and owns it.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::StepError;
use crate::erasure::StateValue;
use crate::generation::{GenCounter, Generation};
use crate::notification::Notification;
use crate::state::State;

/// A user-defined pipeline stage.
///
/// Implementations decide which keys they care about ([`matches`]) and how
/// to transform an admitted batch ([`process`]). Everything else —
/// queueing, batching, acceptance, cancellation — is handled by
/// [`StepHandle`].
///
/// `process` returns a lazily-evaluated sequence of notifications (spec
/// §4.2's "lazy sequence"): implementations that compute results one at a
/// time (e.g. while streaming file contents) can yield them as they go
/// rather than building a `Vec` up front.
pub trait Step<K, V>: Send + Sync {
    /// Runs once, lazily, before this step's first batch. The default does
    /// nothing. A failure here cancels the step with reason
    /// `"While preparing: <error>"` and no batch is ever processed.
    fn prepare(&self) -> Result<(), StepError> {
        Ok(())
    }

    /// Whether this step is interested in `key`. Consulted both at
    /// `notify` time (to decide whether to queue at all) and again at
    /// admission time (a step's interests may change over its lifetime).
    fn matches(&self, key: &K) -> bool;

    /// Transforms an admitted batch, tagged with this step's freshly
    /// minted generation number. Must not block on `state_lock` — there is
    /// none visible to user code, but `process` must also avoid anything
    /// that serializes on another batch of the same step, since batches
    /// within a concurrency limit run concurrently.
    ///
    /// `ctl` lets an implementation cancel itself mid-batch — e.g. kill a
    /// child process on a self-imposed timeout, then call `ctl.cancel(...)`
    /// — without having to surface that as a returned error.
    fn process(
        &self,
        ctl: &StepControl<'_, K, V>,
        new_gen: u64,
        batch: Vec<Notification<K, V>>,
    ) -> Result<Box<dyn Iterator<Item = Notification<K, V>> + Send>, StepError>;
}

/// Handed to [`Step::process`] so an implementation can cancel its own step
/// from within a batch, cooperatively — there is no preemption, so this is
/// the only way to abort mid-`process` other than returning `Err`.
pub struct StepControl<'a, K, V> {
    handle: &'a StepHandle<K, V>,
}

impl<K, V> StepControl<'_, K, V>
where
    K: Eq + std::hash::Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// `true` if this step has already cancelled (e.g. a previous call in
    /// the same batch already did, or the step raced with an external
    /// caller). Cheap to poll in a loop while doing long-running work.
    pub fn cancelled(&self) -> bool {
        self.handle.cancelled()
    }

    /// Cancels the step this batch belongs to. Idempotent.
    pub fn cancel(&self, reason: impl Into<String>) {
        self.handle.cancel(reason);
    }

    /// This step's position in the run. `process` implementations that
    /// build a `Notification` by hand need this to stamp their own slot in
    /// the generation vector; [`update_generations`](Self::update_generations)
    /// and [`update_notification`](Self::update_notification) usually make
    /// that unnecessary.
    pub fn index(&self) -> usize {
        self.handle.index()
    }

    /// Returns `gens` with this step's own slot replaced by `new_gen`.
    pub fn update_generations(&self, gens: &Generation, new_gen: u64) -> Generation {
        self.handle.update_generations(gens, new_gen)
    }

    /// Builds a same-key notification out of `n`, with this step's slot
    /// bumped to `new_gen` and, optionally, a replacement value.
    pub fn update_notification(
        &self,
        n: &Notification<K, V>,
        new_gen: u64,
        new_value: Option<V>,
    ) -> Notification<K, V> {
        self.handle.update_notification(n, new_gen, new_value)
    }
}

/// Construction parameters for a [`StepHandle`].
///
/// Use [`StepConfig::builder`] for the fluent form, or `StepConfig::default()`
/// for spec defaults (`concurrency_limit: None`, `eager: true`,
/// `batch_size: 10`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepConfig {
    /// Maximum simultaneous `process` invocations. `None` means unlimited;
    /// `Some(0)` forbids the step from ever running a batch.
    pub concurrency_limit: Option<usize>,
    /// If `false`, no batch is admitted until upstream declares
    /// `inputs_final`.
    pub eager: bool,
    /// Maximum notifications drained into one batch. Zero or negative
    /// means "drain the whole queue".
    pub batch_size: i64,
}

impl Default for StepConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: None,
            eager: true,
            batch_size: 10,
        }
    }
}

impl StepConfig {
    #[must_use]
    pub fn builder() -> StepConfigBuilder {
        StepConfigBuilder::default()
    }
}

/// Builder for [`StepConfig`].
#[derive(Debug, Clone, Default)]
pub struct StepConfigBuilder {
    concurrency_limit: Option<usize>,
    eager: Option<bool>,
    batch_size: Option<i64>,
}

impl StepConfigBuilder {
    #[must_use]
    pub fn concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = Some(limit);
        self
    }

    #[must_use]
    pub fn eager(mut self, eager: bool) -> Self {
        self.eager = Some(eager);
        self
    }

    #[must_use]
    pub fn batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    #[must_use]
    pub fn build(self) -> StepConfig {
        let defaults = StepConfig::default();
        StepConfig {
            concurrency_limit: self.concurrency_limit.or(defaults.concurrency_limit),
            eager: self.eager.unwrap_or(defaults.eager),
            batch_size: self.batch_size.unwrap_or(defaults.batch_size),
        }
    }
}

/// A snapshot classification of a step, for status rendering.
///
/// Priority when more than one condition holds: `Cancelled` wins over
/// everything; `Running` wins over `Queued`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Idle,
    Queued,
    Running,
    Complete,
    Cancelled,
}

impl StepStatus {
    /// A short glyph for terminal status lines, matching the donor
    /// ecosystem's habit of pairing a status enum with a display glyph.
    pub fn emoji(self) -> &'static str {
        match self {
            StepStatus::Idle => "\u{1FA76}",
            StepStatus::Queued => "\u{1FAA3}",
            StepStatus::Running => "\u{1F3C3}",
            StepStatus::Complete => "\u{1F49A}",
            StepStatus::Cancelled => "\u{1F534}",
        }
    }
}

/// The mutable bundle guarded by a step's single mutex.
struct StepState<K, V> {
    unprocessed: VecDeque<Notification<K, V>>,
    accepted_state: HashMap<K, State<V>>,
    output_state: HashMap<K, State<V>>,
    output_notifications: VecDeque<Notification<K, V>>,
    gen_counter: GenCounter,
    cancel_reason: Option<String>,
}

impl<K, V> StepState<K, V> {
    fn new() -> Self {
        Self {
            unprocessed: VecDeque::new(),
            accepted_state: HashMap::new(),
            output_state: HashMap::new(),
            output_notifications: VecDeque::new(),
            gen_counter: GenCounter::new(),
            cancel_reason: None,
        }
    }
}

/// The concrete, schedulable wrapper around a user [`Step`].
///
/// Owns the queue, acceptance state, and the per-step mutex (spec §5's
/// "shared-resource policy"). Constructed and indexed by
/// [`Run::add_step`](crate::run::Run::add_step); user code only ever sees a
/// `Step` implementation and the [`StepControl`] handed to `process`.
pub struct StepHandle<K, V> {
    index: usize,
    inner: Box<dyn Step<K, V>>,
    config: StepConfig,

    prepared: AtomicBool,
    preparing: AtomicBool,
    cancelled: AtomicBool,
    inputs_final: AtomicBool,
    outputs_final: AtomicBool,
    outstanding: AtomicUsize,

    state: Mutex<StepState<K, V>>,
}

impl<K, V> StepHandle<K, V>
where
    K: Eq + std::hash::Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(index: usize, inner: Box<dyn Step<K, V>>, config: StepConfig) -> Self {
        Self {
            index,
            inner,
            config,
            prepared: AtomicBool::new(false),
            preparing: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            inputs_final: AtomicBool::new(false),
            outputs_final: AtomicBool::new(false),
            outstanding: AtomicUsize::new(0),
            state: Mutex::new(StepState::new()),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn inputs_final(&self) -> bool {
        self.inputs_final.load(Ordering::SeqCst)
    }

    pub fn outputs_final(&self) -> bool {
        self.outputs_final.load(Ordering::SeqCst)
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    pub fn has_unprocessed(&self) -> bool {
        !self.state.lock().unprocessed.is_empty()
    }

    pub fn cancel_reason(&self) -> Option<String> {
        self.state.lock().cancel_reason.clone()
    }

    pub fn accepted_state_snapshot(&self) -> HashMap<K, State<V>> {
        self.state.lock().accepted_state.clone()
    }

    pub fn output_state_snapshot(&self) -> HashMap<K, State<V>> {
        self.state.lock().output_state.clone()
    }

    /// Marks upstream as fully drained. Called by `Run`'s finalization
    /// frontier (spec §4.3.2); lets a non-eager step start processing.
    pub(crate) fn set_inputs_final(&self) {
        self.inputs_final.store(true, Ordering::SeqCst);
    }

    /// Marks this step itself as terminally done, once `Run` has observed
    /// an empty queue and zero outstanding batches with upstream final.
    /// No-op if the step already cancelled itself first.
    pub(crate) fn finalize_outputs(&self) {
        if !self.cancelled.load(Ordering::SeqCst) {
            self.outputs_final.store(true, Ordering::SeqCst);
        }
    }

    /// Offers a notification to this step. Returns `false` if the step is
    /// cancelled, outputs-final, or simply not interested in the key.
    pub fn notify(&self, n: Notification<K, V>) -> bool {
        if self.cancelled.load(Ordering::SeqCst) || self.outputs_final.load(Ordering::SeqCst) {
            return false;
        }
        if !self.inner.matches(&n.key) {
            return false;
        }
        self.state.lock().unprocessed.push_back(n);
        true
    }

    /// Drains everything this step has produced since the last drain, for
    /// the worker to feed forward downstream (spec §4.3.1).
    pub(crate) fn drain_output_notifications(&self) -> Vec<Notification<K, V>> {
        self.state.lock().output_notifications.drain(..).collect()
    }

    pub fn status(&self) -> StepStatus {
        if self.cancelled.load(Ordering::SeqCst) {
            return StepStatus::Cancelled;
        }
        if self.outstanding.load(Ordering::SeqCst) > 0 {
            return StepStatus::Running;
        }
        if self.has_unprocessed() {
            return StepStatus::Queued;
        }
        if self.outputs_final.load(Ordering::SeqCst) {
            return StepStatus::Complete;
        }
        StepStatus::Idle
    }

    pub fn emoji(&self) -> &'static str {
        self.status().emoji()
    }

    /// Returns `gens` with this step's own slot replaced by `new_gen`.
    pub fn update_generations(&self, gens: &Generation, new_gen: u64) -> Generation {
        gens.with_slot(self.index, new_gen)
    }

    /// Convenience for building a same-key, bumped-generation notification
    /// out of an accepted one, optionally replacing the value. Saves
    /// `process` implementations from constructing `Notification`/`State`
    /// by hand for the common pass-through-with-a-new-value case.
    pub fn update_notification(
        &self,
        n: &Notification<K, V>,
        new_gen: u64,
        new_value: Option<V>,
    ) -> Notification<K, V> {
        let gens = self.update_generations(&n.state.gens, new_gen);
        let value = match new_value {
            Some(v) => StateValue::Present(v),
            None => n.state.value.clone(),
        };
        Notification::new(n.key.clone(), State::new(gens, value))
    }

    fn ensure_prepared(&self) -> bool {
        if self.prepared.load(Ordering::Acquire) {
            return true;
        }
        if self
            .preparing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            match self.inner.prepare() {
                Ok(()) => {
                    self.prepared.store(true, Ordering::Release);
                    true
                }
                Err(e) => {
                    self.cancel(format!("While preparing: {e}"));
                    false
                }
            }
        } else {
            // Another worker is preparing this step right now; defer to a
            // later scan rather than block.
            false
        }
    }

    /// The scheduling primitive: admits and runs at most one batch. Returns
    /// `true` if a batch was picked up (regardless of whether `process`
    /// then errored), `false` if there was nothing to do right now.
    pub fn run_next_batch(&self) -> bool {
        if self.cancelled.load(Ordering::SeqCst) || self.outputs_final.load(Ordering::SeqCst) {
            return false;
        }

        if !self.ensure_prepared() {
            return false;
        }

        if !self.config.eager && !self.inputs_final.load(Ordering::SeqCst) {
            return false;
        }

        let (batch, gen) = {
            let mut state = self.state.lock();

            if let Some(limit) = self.config.concurrency_limit {
                if self.outstanding.load(Ordering::SeqCst) >= limit {
                    return false;
                }
            }

            let drain_count = if self.config.batch_size > 0 {
                self.config.batch_size as usize
            } else {
                state.unprocessed.len()
            };

            let mut admitted: HashMap<K, Notification<K, V>> = HashMap::new();
            for _ in 0..drain_count {
                let Some(n) = state.unprocessed.pop_front() else {
                    break;
                };
                if !self.inner.matches(&n.key) {
                    continue;
                }
                let should_admit = match state.accepted_state.get(&n.key) {
                    None => true,
                    Some(existing) => n.state.gens.supersedes(&existing.gens),
                };
                if !should_admit {
                    continue;
                }
                state.accepted_state.insert(n.key.clone(), n.state.clone());
                state.output_state.insert(n.key.clone(), n.state.clone());
                admitted.insert(n.key.clone(), n);
            }

            if admitted.is_empty() {
                return false;
            }

            let gen = state.gen_counter.next();
            (admitted.into_values().collect::<Vec<_>>(), gen)
        };

        tracing::debug!(step = self.index, gen, batch_len = batch.len(), "admitted batch");

        self.outstanding.fetch_add(1, Ordering::SeqCst);
        let ctl = StepControl { handle: self };
        match self.inner.process(&ctl, gen, batch) {
            Ok(produced) => {
                for notification in produced {
                    // A step that cancels itself mid-batch (via `ctl.cancel`) has
                    // already frozen `output_state`/`output_notifications` as part
                    // of its unwind; any notification the iterator still yields
                    // after that must not be published, or the unwind's erasure
                    // could be clobbered by stale post-cancel output.
                    if self.cancelled.load(Ordering::SeqCst) {
                        break;
                    }
                    debug_assert!(
                        notification.state.gens.trailing_zero_after(self.index),
                        "step {} produced a generation vector with a non-zero slot past its own index",
                        self.index
                    );
                    let mut state = self.state.lock();
                    let should_publish = match state.output_state.get(&notification.key) {
                        None => true,
                        Some(existing) => notification.state.gens.supersedes(&existing.gens),
                    };
                    if should_publish {
                        state
                            .output_state
                            .insert(notification.key.clone(), notification.state.clone());
                        state.output_notifications.push_back(notification);
                    }
                }
            }
            Err(e) => {
                let reason = e.to_string();
                self.cancel(reason);
            }
        }
        self.outstanding.fetch_sub(1, Ordering::SeqCst);

        true
    }

    /// Atomically unwinds this step's contribution: re-publishes every
    /// accepted input at a fresh generation (so the unwind dominates
    /// whatever this step already emitted), and erases every key this step
    /// introduced itself. Idempotent.
    pub fn cancel(&self, reason: impl Into<String>) {
        if self.cancelled.load(Ordering::SeqCst) || self.outputs_final.load(Ordering::SeqCst) {
            return;
        }

        let mut state = self.state.lock();
        // Double-checked: another caller may have finished cancelling
        // while we were waiting for the lock.
        if self.cancelled.load(Ordering::SeqCst) || self.outputs_final.load(Ordering::SeqCst) {
            return;
        }

        let new_gen = state.gen_counter.next();

        let republish: Vec<(K, State<V>)> = state
            .accepted_state
            .iter()
            .map(|(k, s)| (k.clone(), s.with_gens(s.gens.with_slot(self.index, new_gen))))
            .collect();

        let erase: Vec<(K, Generation)> = state
            .output_state
            .iter()
            .filter(|(k, _)| !state.accepted_state.contains_key(*k))
            .map(|(k, s)| (k.clone(), s.gens.with_slot(self.index, new_gen)))
            .collect();

        for (key, republished) in republish {
            state
                .output_notifications
                .push_back(Notification::new(key.clone(), republished.clone()));
            state.output_state.insert(key, republished);
        }
        for (key, gens) in erase {
            let erased = State::erased(gens);
            state
                .output_notifications
                .push_back(Notification::new(key.clone(), erased.clone()));
            state.output_state.insert(key, erased);
        }

        let reason = reason.into();
        tracing::warn!(step = self.index, %reason, "step cancelled");
        state.cancel_reason = Some(reason);

        self.cancelled.store(true, Ordering::SeqCst);
        self.outputs_final.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullStep;
    impl Step<String, String> for NullStep {
        fn matches(&self, _key: &String) -> bool {
            true
        }
        fn process(
            &self,
            ctl: &StepControl<'_, String, String>,
            new_gen: u64,
            batch: Vec<Notification<String, String>>,
        ) -> Result<Box<dyn Iterator<Item = Notification<String, String>> + Send>, StepError>
        {
            let out: Vec<_> = batch
                .into_iter()
                .map(|n| ctl.update_notification(&n, new_gen, None))
                .collect();
            Ok(Box::new(out.into_iter()))
        }
    }

    fn handle(config: StepConfig) -> StepHandle<String, String> {
        StepHandle::new(0, Box::new(NullStep), config)
    }

    fn notification(key: &str, gens: Vec<u64>, value: &str) -> Notification<String, String> {
        Notification::new(
            key.to_string(),
            State::present(Generation::from_slots(gens), value.to_string()),
        )
    }

    #[test]
    fn limited_step_refuses_any_batch() {
        let s = handle(StepConfig::builder().concurrency_limit(0).build());
        assert!(!s.run_next_batch());
    }

    #[test]
    fn basic_step_processes_one_batch() {
        let s = handle(StepConfig::default());
        assert!(!s.run_next_batch());
        s.notify(notification("x", vec![0], "x"));
        assert!(s.run_next_batch());
    }

    #[test]
    fn noneager_step_waits_for_inputs_final() {
        let s = handle(StepConfig::builder().eager(false).build());
        s.notify(notification("x", vec![0], "x"));
        assert!(!s.run_next_batch());
        s.set_inputs_final();
        assert!(s.run_next_batch());
    }

    #[test]
    fn batch_size_small_splits_into_two_batches() {
        let s = handle(StepConfig::builder().batch_size(2).build());
        for key in ["w", "x", "y", "z"] {
            s.notify(notification(key, vec![0], key));
        }
        assert!(s.run_next_batch());
        assert!(s.run_next_batch());
        assert!(!s.run_next_batch());
    }

    #[test]
    fn batch_size_negative_drains_everything() {
        let s = handle(StepConfig::builder().batch_size(-1).build());
        for key in "abcdefghijklmnopqrstuvwxyz".chars() {
            s.notify(notification(&key.to_string(), vec![0], &key.to_string()));
        }
        assert!(s.run_next_batch());
        assert!(!s.run_next_batch());
    }

    #[test]
    fn notify_returns_false_once_cancelled() {
        let s = handle(StepConfig::default());
        s.cancel("done");
        assert!(!s.notify(notification("x", vec![0], "x")));
    }

    #[test]
    fn cancel_is_a_no_op_once_outputs_final() {
        let s = handle(StepConfig::default());
        s.finalize_outputs();
        s.cancel("should be ignored");
        assert!(!s.cancelled());
    }

    #[test]
    fn cancel_erases_keys_this_step_invented() {
        let s = handle(StepConfig::default());
        // Simulate the step having produced output for a key it never accepted,
        // by running a batch through a step that fabricates one.
        struct Inventor;
        impl Step<String, String> for Inventor {
            fn matches(&self, _key: &String) -> bool {
                true
            }
            fn process(
                &self,
                _ctl: &StepControl<'_, String, String>,
                new_gen: u64,
                _batch: Vec<Notification<String, String>>,
            ) -> Result<Box<dyn Iterator<Item = Notification<String, String>> + Send>, StepError>
            {
                Ok(Box::new(std::iter::once(Notification::new(
                    "invented".to_string(),
                    State::present(Generation::from_slots(vec![new_gen]), "spawned".to_string()),
                ))))
            }
        }
        let s2 = StepHandle::new(0, Box::new(Inventor), StepConfig::default());
        s2.notify(notification("trigger", vec![0], "go"));
        assert!(s2.run_next_batch());
        s2.cancel("test");
        let out = s2.output_state_snapshot();
        assert!(out.get("invented").unwrap().value.is_erased());
        let _ = s; // unused placeholder handle above, keep for symmetry with other tests
    }

    #[test]
    fn cancel_republishes_accepted_inputs_at_a_dominating_generation() {
        let s = handle(StepConfig::default());
        s.notify(notification("filename", vec![0], "contents"));
        assert!(s.run_next_batch());
        s.cancel("boom");
        let out = s.output_state_snapshot();
        let published = out.get("filename").unwrap();
        // gen=1 was consumed by the successful batch; cancel always takes a
        // fresh one, so the republish lands at slot value 2.
        assert_eq!(published.gens.as_slice(), &[2]);
    }

    #[test]
    fn cancel_is_idempotent() {
        let s = handle(StepConfig::default());
        s.notify(notification("x", vec![0], "x"));
        assert!(s.run_next_batch());
        s.cancel("first");
        let after_first = s.drain_output_notifications();
        s.cancel("second");
        let after_second = s.drain_output_notifications();
        assert!(!after_first.is_empty());
        assert!(after_second.is_empty());
    }

    #[test]
    fn update_notification_replaces_value() {
        let s = handle(StepConfig::default());
        let n = notification("x", vec![0], "x");
        let updated = s.update_notification(&n, 1, Some("y".to_string()));
        assert_eq!(updated.state.value, StateValue::Present("y".to_string()));
        assert_eq!(updated.state.gens.as_slice(), &[1]);
    }

    #[test]
    fn status_transitions_cover_all_five_states() {
        let s = handle(StepConfig::default());
        assert_eq!(s.status(), StepStatus::Idle);

        s.notify(notification("x", vec![0], "x"));
        assert_eq!(s.status(), StepStatus::Queued);

        s.outstanding.store(1, Ordering::SeqCst);
        assert_eq!(s.status(), StepStatus::Running);

        s.outstanding.store(0, Ordering::SeqCst);
        s.state.lock().unprocessed.clear();
        s.finalize_outputs();
        assert_eq!(s.status(), StepStatus::Complete);

        s.cancel("late failure");
        assert_eq!(s.status(), StepStatus::Cancelled);
    }

    struct AlwaysBadStep;
    impl Step<String, Vec<u8>> for AlwaysBadStep {
        fn matches(&self, _key: &String) -> bool {
            true
        }
        fn process(
            &self,
            _ctl: &StepControl<'_, String, Vec<u8>>,
            _new_gen: u64,
            _batch: Vec<Notification<String, Vec<u8>>>,
        ) -> Result<Box<dyn Iterator<Item = Notification<String, Vec<u8>>> + Send>, StepError>
        {
            Err(StepError::msg("boom"))
        }
    }

    struct ReplacerStep;
    impl Step<String, Vec<u8>> for ReplacerStep {
        fn matches(&self, _key: &String) -> bool {
            true
        }
        fn process(
            &self,
            ctl: &StepControl<'_, String, Vec<u8>>,
            new_gen: u64,
            batch: Vec<Notification<String, Vec<u8>>>,
        ) -> Result<Box<dyn Iterator<Item = Notification<String, Vec<u8>>> + Send>, StepError>
        {
            let out: Vec<_> = batch
                .into_iter()
                .map(|n| ctl.update_notification(&n, new_gen, Some(b"REPLACED".to_vec())))
                .collect();
            Ok(Box::new(out.into_iter()))
        }
    }

    struct NullStepBytes;
    impl Step<String, Vec<u8>> for NullStepBytes {
        fn matches(&self, _key: &String) -> bool {
            true
        }
        fn process(
            &self,
            ctl: &StepControl<'_, String, Vec<u8>>,
            new_gen: u64,
            batch: Vec<Notification<String, Vec<u8>>>,
        ) -> Result<Box<dyn Iterator<Item = Notification<String, Vec<u8>>> + Send>, StepError>
        {
            let out: Vec<_> = batch
                .into_iter()
                .map(|n| ctl.update_notification(&n, new_gen, None))
                .collect();
            Ok(Box::new(out.into_iter()))
        }
    }

    /// Three steps: a step that always fails, a step that replaces the
    /// value, and a passthrough. The failing step's unwind re-stamps its
    /// input at a generation that skips the one consumed by the failed
    /// batch, so downstream acceptance still sees a strictly-greater vector.
    #[test]
    fn scenario_exception_cancels_step_but_pipeline_proceeds() {
        let n = 3;
        let s0 = StepHandle::new(0, Box::new(AlwaysBadStep), StepConfig::default());
        let s1 = StepHandle::new(1, Box::new(ReplacerStep), StepConfig::default());
        let s2 = StepHandle::new(2, Box::new(NullStepBytes), StepConfig::default());

        let seed = Notification::new(
            "filename".to_string(),
            State::present(Generation::zero(n), b"contents".to_vec()),
        );
        s0.notify(seed);
        assert!(s0.run_next_batch());
        assert!(s0.cancelled());

        for notification in s0.drain_output_notifications() {
            s1.notify(notification);
        }
        assert!(s1.run_next_batch());
        assert_eq!(
            s1.accepted_state_snapshot()
                .get("filename")
                .unwrap()
                .gens
                .as_slice(),
            &[2, 0, 0]
        );

        for notification in s1.drain_output_notifications() {
            s2.notify(notification);
        }
        assert!(s2.run_next_batch());
        assert_eq!(
            s2.accepted_state_snapshot()
                .get("filename")
                .unwrap()
                .gens
                .as_slice(),
            &[2, 1, 0]
        );

        let output = s2.output_state_snapshot();
        assert_eq!(
            output.get("filename").unwrap().value,
            StateValue::Present(b"REPLACED".to_vec())
        );
    }

    /// Two steps: a step that always fails, then a passthrough. The
    /// passthrough sees the failing step's re-emitted input, so the final
    /// value is exactly what was seeded.
    #[test]
    fn scenario_cancellation_passes_inputs_through() {
        let n = 2;
        let s0 = StepHandle::new(0, Box::new(AlwaysBadStep), StepConfig::default());
        let s1 = StepHandle::new(1, Box::new(NullStepBytes), StepConfig::default());

        let seed = Notification::new(
            "filename".to_string(),
            State::present(Generation::zero(n), b"contents".to_vec()),
        );
        s0.notify(seed);
        assert!(s0.run_next_batch());

        for notification in s0.drain_output_notifications() {
            s1.notify(notification);
        }
        assert!(s1.run_next_batch());
        assert_eq!(
            s1.accepted_state_snapshot()
                .get("filename")
                .unwrap()
                .gens
                .as_slice(),
            &[2, 0]
        );

        let output = s1.output_state_snapshot();
        assert_eq!(
            output.get("filename").unwrap().value,
            StateValue::Present(b"contents".to_vec())
        );
    }

    #[test]
    fn cancel_inner_lock_is_double_checked() {
        use std::sync::Arc;
        use std::time::Duration;

        let s = Arc::new(handle(StepConfig::default()));
        let guard = s.state.lock();
        let s2 = s.clone();
        let t = std::thread::spawn(move || {
            s2.cancel("race");
        });
        std::thread::sleep(Duration::from_millis(50));
        s.cancelled.store(true, Ordering::SeqCst);
        drop(guard);
        t.join().expect("cancel() must not deadlock or panic under a races-to-cancel");
    }
}
