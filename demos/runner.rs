use std::{env, fs};

use anyhow::{bail, Context};
use bclua::{Engine, EngineConfig, RunOptions};
use log::{LevelFilter, Log, Metadata, Record};

/// Writes `--trace` output to stderr.
struct StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, _: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        eprintln!("[{}] {}", record.level(), record.args());
    }

    fn flush(&self) {}
}

static LOGGER: StderrLogger = StderrLogger;

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let path = match args.iter().find(|arg| !arg.starts_with("--")) {
        Some(path) => path,
        None => bail!("usage: runner <script.lua> [--dump] [--trace] [--steps=N]"),
    };
    let dump = args.iter().any(|arg| arg == "--dump");
    let trace = args.iter().any(|arg| arg == "--trace");
    let step_limit = match args.iter().find_map(|arg| arg.strip_prefix("--steps=")) {
        Some(steps) => steps.parse().context("--steps expects a number")?,
        None => 1_000_000,
    };

    if trace {
        log::set_logger(&LOGGER).map_err(|err| anyhow::anyhow!("{}", err))?;
        log::set_max_level(LevelFilter::Debug);
    }

    let source = fs::read_to_string(path).with_context(|| format!("failed to read {}", path))?;

    let mut engine = Engine::with_config(EngineConfig {
        step_limit,
        ..EngineConfig::default()
    });
    engine.load(&source)?;

    if dump {
        print!("{}", engine.dump_bytecode());
    }

    let result = engine.run(&RunOptions::new().trace(trace))?;
    println!("Process is finished with result: {}", result);
    Ok(())
}
