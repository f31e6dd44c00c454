//! CLI entry point wiring a handful of demo step chains onto `pipeline-engine`.

mod demos;

use std::collections::HashMap;

use anyhow::{anyhow, Result};
use clap::{Parser, ValueEnum};
use pipeline_engine::{Run, RunConfig, StepConfig};
use tracing::info;

use demos::alphabet::AlphabetStep;
use demos::factor::FactorStep;
use demos::fizzbuzz::{ReplaceIfDivisibleBy, Sink};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Demo {
    /// One `ReplaceIfDivisibleBy` step per modulus, feeding a final sink.
    Fizzbuzz,
    /// One step per letter, advancing a string through the alphabet.
    Alphabet,
    /// One step per small prime, accumulating factors as text.
    Factor,
}

#[derive(Parser, Debug)]
#[command(
    author = "sshussh",
    version,
    about = "Demo runner for the generation-vector pipeline engine",
    long_about = "Wires a small chain of example steps into a Run and drives it \
                  to completion.\n\n\
                  EXAMPLES:\n  \
                  # Run FizzBuzz over 1..=100\n  \
                  pipeline-cli --demo fizzbuzz --upto 100\n\n  \
                  # Trace each worker tick\n  \
                  pipeline-cli --demo alphabet --log-level trace"
)]
struct Args {
    /// Which demo chain to run
    #[arg(short, long, value_enum, default_value = "fizzbuzz")]
    demo: Demo,

    /// Highest key to seed (fizzbuzz and factor demos only)
    #[arg(long, default_value = "30")]
    upto: u64,

    /// Worker thread count; 0 asks the environment
    #[arg(short, long, default_value = "0")]
    parallelism: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

fn init_logging(level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    match args.demo {
        Demo::Fizzbuzz => run_fizzbuzz(&args),
        Demo::Alphabet => run_alphabet(&args),
        Demo::Factor => run_factor(&args),
    }
}

fn run_fizzbuzz(args: &Args) -> Result<()> {
    let mut run: Run<u64, String> = Run::new(RunConfig {
        parallelism: args.parallelism,
    });
    run.add_step(
        ReplaceIfDivisibleBy::new(3, "Fizz"),
        StepConfig::default(),
    )?;
    run.add_step(
        ReplaceIfDivisibleBy::new(5, "Buzz"),
        StepConfig::default(),
    )?;
    run.add_step(
        ReplaceIfDivisibleBy::new(15, "FizzBuzz"),
        StepConfig::default(),
    )?;
    run.add_step(Sink, StepConfig::default())?;

    let inputs: HashMap<u64, String> = (1..=args.upto).map(|n| (n, n.to_string())).collect();
    info!(count = inputs.len(), "seeding fizzbuzz run");

    let result = run.run_to_completion(inputs)?;

    let mut keys: Vec<_> = result.keys().copied().collect();
    keys.sort_unstable();
    for key in keys {
        let state = &result[&key];
        match state.value.as_ref().into_option() {
            Some(v) => println!("{key}: {v}"),
            None => println!("{key}: <erased>"),
        }
    }
    Ok(())
}

fn run_alphabet(args: &Args) -> Result<()> {
    let mut run: Run<String, String> = Run::new(RunConfig {
        parallelism: args.parallelism,
    });
    for letter in b'a'..b'z' {
        run.add_step(AlphabetStep::new(letter as char), StepConfig::default())?;
    }

    let mut inputs = HashMap::new();
    inputs.insert("word".to_string(), "a".to_string());
    info!("seeding alphabet run");

    let result = run.run_to_completion(inputs)?;

    let state = result.get("word").ok_or_else(|| anyhow!("missing key"))?;
    match state.value.as_ref().into_option() {
        Some(v) => println!("word: {v}"),
        None => println!("word: <erased>"),
    }
    Ok(())
}

fn run_factor(args: &Args) -> Result<()> {
    let mut run: Run<u64, String> = Run::new(RunConfig {
        parallelism: args.parallelism,
    });
    for prime in [2u64, 3, 5, 7, 11, 13] {
        run.add_step(FactorStep::new(prime), StepConfig::default())?;
    }

    let inputs: HashMap<u64, String> = (1..=args.upto).map(|n| (n, String::new())).collect();
    info!(count = inputs.len(), "seeding factor run");

    let result = run.run_to_completion(inputs)?;

    let mut keys: Vec<_> = result.keys().copied().collect();
    keys.sort_unstable();
    for key in keys {
        let state = &result[&key];
        match state.value.as_ref().into_option() {
            Some(v) if !v.is_empty() => println!("{key}: {v}"),
            _ => println!("{key}: prime"),
        }
    }
    Ok(())
}
