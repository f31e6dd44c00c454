//! Twenty-five steps, each advancing one letter of the alphabet if the
//! current value matches the letter it's watching for. Demonstrates a step
//! whose `process` passes most input through unchanged — it only acts on
//! the subset of keys whose *value* happens to match, something `matches`
//! (which only ever sees the key) can't express on its own.

use pipeline_engine::{Notification, Step, StepControl, StepError};

pub struct AlphabetStep {
    watch_for: char,
}

impl AlphabetStep {
    pub fn new(watch_for: char) -> Self {
        Self { watch_for }
    }
}

impl Step<String, String> for AlphabetStep {
    fn matches(&self, _key: &String) -> bool {
        true
    }

    fn process(
        &self,
        ctl: &StepControl<'_, String, String>,
        new_gen: u64,
        batch: Vec<Notification<String, String>>,
    ) -> Result<Box<dyn Iterator<Item = Notification<String, String>> + Send>, StepError> {
        let out: Vec<_> = batch
            .into_iter()
            .map(|n| {
                let matches_watched = n.state.value.as_ref().into_option() == Some(&self.watch_for.to_string());
                let advanced = matches_watched.then(|| {
                    let next = ((self.watch_for as u8) + 1) as char;
                    next.to_string()
                });
                ctl.update_notification(&n, new_gen, advanced)
            })
            .collect();
        Ok(Box::new(out.into_iter()))
    }
}
