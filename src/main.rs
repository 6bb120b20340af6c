//! tierjit CLI
//!
//! Runs the built-in tiering scenarios against a configurable engine and
//! prints the engine's tiering summary after each one.

use anyhow::{anyhow, bail, ensure, Context, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Instant;
use tierjit::jit::{Cardinality, DeoptReason};
use tierjit::{ChunkBuilder, ChunkFlags, Engine, EngineConfig, FunctionId, Value, VERSION};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tierjit")]
#[command(author, version, about = "Tiered execution engine scenarios", long_about = None)]
struct Cli {
    /// Scenario to run
    #[arg(value_enum, default_value_t = Scenario::All)]
    scenario: Scenario,

    /// Engine configuration (JSON)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose output (-v for info, -vv for debug, -vvv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Scenario {
    /// Integer overflow in optimized `add` deoptimizes to the exact result
    Overflow,
    /// A second receiver shape makes a property site polymorphic
    Polymorphic,
    /// A never-optimize function stays on baseline
    NeverOptimize,
    /// A compile failure leaves the function on baseline
    CompileFailure,
    /// Repeated deopts at one site trigger a cooldown
    Cooldown,
    All,
}

impl Scenario {
    const EACH: [Scenario; 5] = [
        Scenario::Overflow,
        Scenario::Polymorphic,
        Scenario::NeverOptimize,
        Scenario::CompileFailure,
        Scenario::Cooldown,
    ];

    fn run(self, config: &EngineConfig) -> Result<Engine> {
        let mut engine = Engine::new(config.clone()).lift()?;
        match self {
            Scenario::Overflow => overflow(&mut engine)?,
            Scenario::Polymorphic => polymorphic(&mut engine)?,
            Scenario::NeverOptimize => never_optimize(&mut engine)?,
            Scenario::CompileFailure => compile_failure(&mut engine)?,
            Scenario::Cooldown => cooldown(&mut engine)?,
            Scenario::All => bail!("`all` is not a single scenario"),
        }
        Ok(engine)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)
            .lift()
            .with_context(|| format!("loading config from '{}'", path.display()))?,
        None => EngineConfig::default(),
    };

    let scenarios: Vec<Scenario> = match cli.scenario {
        Scenario::All => Scenario::EACH.to_vec(),
        one => vec![one],
    };

    println!("tierjit {}", VERSION);
    for scenario in scenarios {
        let start = Instant::now();
        let engine = scenario
            .run(&config)
            .with_context(|| format!("scenario {:?} failed", scenario))?;
        info!(scenario = ?scenario, elapsed = ?start.elapsed(), "scenario passed");
        println!("\n[{:?}] ok", scenario);
        print!("{}", engine.stats());
    }
    Ok(())
}

fn setup_logging(verbosity: u8) {
    let default = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

/// Engine errors may hold runtime values, which are not `Send`; report them by message
trait Lift<T> {
    fn lift(self) -> Result<T>;
}

impl<T> Lift<T> for tierjit::Result<T> {
    fn lift(self) -> Result<T> {
        self.map_err(|e| anyhow!("{}", e))
    }
}

// ========== Scenarios ==========

fn define_add(engine: &mut Engine) -> Result<FunctionId> {
    let mut b = ChunkBuilder::new("add", 2);
    b.get_local(0).get_local(1).add().ret();
    engine.define(b.finish().lift()?).lift()
}

fn nums(a: f64, b: f64) -> Vec<Value> {
    vec![Value::Number(a), Value::Number(b)]
}

fn overflow(engine: &mut Engine) -> Result<()> {
    let add = define_add(engine)?;
    let threshold = engine.config().tier_up_threshold;
    for _ in 0..threshold {
        engine.call(add, nums(1.0, 2.0)).lift()?;
    }
    engine.optimize_on_next_call(add).lift()?;
    ensure!(engine.call(add, nums(1.0, 2.0)).lift()? == Value::Number(3.0));
    ensure!(engine.is_optimized(add), "add should be optimized after warm-up");

    let big = 2f64.powi(31);
    let result = engine.call(add, nums(big, big)).lift()?;
    ensure!(result == Value::Number(2f64.powi(32)), "expected 2**32, got {}", result);
    ensure!(!engine.is_optimized(add), "add should be deoptimized");
    info!(status = %engine.status(add).lift()?, "overflow");
    Ok(())
}

fn polymorphic(engine: &mut Engine) -> Result<()> {
    let mut b = ChunkBuilder::new("f", 1);
    b.get_local(0).get_named("x").ret();
    let f = engine.define(b.finish().lift()?).lift()?;

    let a = engine.new_object(&[("x", Value::Number(1.0))]);
    ensure!(engine.call(f, vec![a]).lift()? == Value::Number(1.0));
    ensure!(engine.feedback(f).lift()?.slots()[0].cardinality() == Cardinality::Monomorphic);

    let b = engine.new_object(&[("y", Value::Number(2.0)), ("x", Value::Number(1.0))]);
    ensure!(engine.call(f, vec![b]).lift()? == Value::Number(1.0));
    let cardinality = engine.feedback(f).lift()?.slots()[0].cardinality();
    ensure!(cardinality == Cardinality::Polymorphic, "expected polymorphic, got {}", cardinality);
    Ok(())
}

fn never_optimize(engine: &mut Engine) -> Result<()> {
    let mut b = ChunkBuilder::new("g", 1);
    b.get_local(0).number(2.0).mul().ret();
    let g = engine.define(b.finish().lift()?).lift()?;
    engine.never_optimize(g).lift()?;
    for i in 0..10_000 {
        engine.call(g, vec![Value::Number(i as f64)]).lift()?;
        ensure!(!engine.is_optimized(g), "g optimized after {} calls", i + 1);
    }
    Ok(())
}

fn compile_failure(engine: &mut Engine) -> Result<()> {
    let mut b = ChunkBuilder::new("h", 2);
    b.set_flags(ChunkFlags::UNSUPPORTED_CONSTRUCT);
    b.get_local(0).get_local(1).sub().ret();
    let h = engine.define(b.finish().lift()?).lift()?;
    engine.call(h, nums(9.0, 4.0)).lift()?;
    engine.optimize_on_next_call(h).lift()?;
    for i in 0..50 {
        let n = i as f64;
        ensure!(engine.call(h, nums(n, 1.0)).lift()? == Value::Number(n - 1.0));
        ensure!(!engine.is_optimized(h));
    }
    ensure!(engine.stats().compile_failures == 1);
    ensure!(engine.status(h).lift()?.compile_disabled);
    Ok(())
}

fn cooldown(engine: &mut Engine) -> Result<()> {
    let add = define_add(engine)?;
    let budget = engine.config().deopt_retry_budget;
    for round in 0..=budget {
        engine.prepare_for_optimization(add).lift()?;
        engine.call(add, nums(1.0, 2.0)).lift()?;
        engine.optimize_on_next_call(add).lift()?;
        engine.call(add, nums(1.0, 2.0)).lift()?;
        ensure!(engine.is_optimized(add), "round {}: add should be optimized", round);
        ensure!(engine.call(add, nums(1.5, 2.0)).lift()? == Value::Number(3.5));
        ensure!(!engine.is_optimized(add));
    }
    ensure!(engine.stats().deopts_for(DeoptReason::NotSmi) == budget as u64 + 1);

    engine.prepare_for_optimization(add).lift()?;
    engine.call(add, nums(1.0, 2.0)).lift()?;
    engine.optimize_on_next_call(add).lift()?;
    ensure!(engine.call(add, nums(1.0, 2.0)).lift()? == Value::Number(3.0));
    ensure!(!engine.is_optimized(add), "tier-up should be deferred during cooldown");
    let status = engine.status(add).lift()?;
    ensure!(status.cooldown_remaining > 0);
    info!(%status, "cooldown");
    Ok(())
}
