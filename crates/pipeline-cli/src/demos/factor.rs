//! One step per small prime, each appending itself to a running text value
//! when the key is divisible by it. Unlike the FizzBuzz steps (replace on
//! match), this accumulates — a different shape for `process` to take.

use pipeline_engine::{Notification, Step, StepControl, StepError};

pub struct FactorStep {
    prime: u64,
}

impl FactorStep {
    pub fn new(prime: u64) -> Self {
        Self { prime }
    }
}

impl Step<u64, String> for FactorStep {
    // Every key is admitted — a key this step has no factor to contribute
    // still needs its accepted/output state carried forward to the next
    // step, and admission alone (not a yielded notification) is what does
    // that carrying.
    fn matches(&self, _key: &u64) -> bool {
        true
    }

    fn process(
        &self,
        ctl: &StepControl<'_, u64, String>,
        new_gen: u64,
        batch: Vec<Notification<u64, String>>,
    ) -> Result<Box<dyn Iterator<Item = Notification<u64, String>> + Send>, StepError> {
        let out: Vec<_> = batch
            .into_iter()
            .filter(|n| n.key % self.prime == 0)
            .map(|n| {
                let appended = match n.state.value.as_ref().into_option() {
                    Some(existing) if !existing.is_empty() => format!("{existing} {}", self.prime),
                    _ => self.prime.to_string(),
                };
                ctl.update_notification(&n, new_gen, Some(appended))
            })
            .collect();
        Ok(Box::new(out.into_iter()))
    }
}
