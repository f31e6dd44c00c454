//! Small shared helpers.

/// The default worker count a [`Run`](crate::run::Run) uses when
/// constructed with `parallelism = 0`.
///
/// Prefers the number of CPUs actually available to this process
/// (`std::thread::available_parallelism`, Rust's portable equivalent of
/// `os.process_cpu_count()`/`os.sched_getaffinity`), falling back to 1 if
/// the platform can't report it.
pub fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_parallelism_is_at_least_one() {
        assert!(default_parallelism() >= 1);
    }
}
