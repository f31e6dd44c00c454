//! FizzBuzz as four steps: replace-on-match at three different moduli, then
//! a passthrough sink. Demonstrates the "some keys are simply never
//! admitted by this step" shape (`matches` returning false for most keys).

use pipeline_engine::{Notification, Step, StepControl, StepError};

pub struct ReplaceIfDivisibleBy {
    divisor: u64,
    replacement: &'static str,
}

impl ReplaceIfDivisibleBy {
    pub fn new(divisor: u64, replacement: &'static str) -> Self {
        Self {
            divisor,
            replacement,
        }
    }
}

impl Step<u64, String> for ReplaceIfDivisibleBy {
    fn matches(&self, key: &u64) -> bool {
        key % self.divisor == 0
    }

    fn process(
        &self,
        ctl: &StepControl<'_, u64, String>,
        new_gen: u64,
        batch: Vec<Notification<u64, String>>,
    ) -> Result<Box<dyn Iterator<Item = Notification<u64, String>> + Send>, StepError> {
        let out: Vec<_> = batch
            .into_iter()
            .map(|n| ctl.update_notification(&n, new_gen, Some(self.replacement.to_string())))
            .collect();
        Ok(Box::new(out.into_iter()))
    }
}

pub struct Sink;

impl Step<u64, String> for Sink {
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
            .map(|n| ctl.update_notification(&n, new_gen, None))
            .collect();
        Ok(Box::new(out.into_iter()))
    }
}
