use anyhow::{anyhow, Context, Result};
use clap::Parser;
use emu_core::logging::{LogCategory, LogConfig, LogLevel};
use emu_dos::{DosTask, DpmiConfig};
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

mod script;

use script::{Runner, Script};

/// Run a JSON script of DPMI calls against a headless DOS task
#[derive(Parser)]
#[command(name = "dpmi-probe")]
struct Args {
    /// Script to run
    script: PathBuf,

    /// Task configuration (JSON); defaults apply when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    /// Extender log level: off, error, warn, info, debug, trace
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Per-category override, e.g. `memory=trace` (repeatable)
    #[arg(long = "log", value_name = "CATEGORY=LEVEL")]
    log_categories: Vec<String>,

    /// Write extender logs to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Dump the task state to this file as JSON after the script
    #[arg(long)]
    dump_state: Option<PathBuf>,

    /// Print one JSON object per step instead of register lines
    #[arg(long, default_value_t = false)]
    json: bool,
}

fn configure_logging(args: &Args) -> Result<()> {
    let config = LogConfig::global();
    let level = LogLevel::from_str(&args.log_level)
        .ok_or_else(|| anyhow!("unknown log level: {}", args.log_level))?;
    config.set_global_level(level);

    for entry in &args.log_categories {
        let (name, level) = entry
            .split_once('=')
            .ok_or_else(|| anyhow!("expected CATEGORY=LEVEL, got {}", entry))?;
        let category =
            LogCategory::from_name(name).ok_or_else(|| anyhow!("unknown log category: {}", name))?;
        let level = LogLevel::from_str(level).ok_or_else(|| anyhow!("unknown log level: {}", level))?;
        config.set_level(category, level);
    }

    if let Some(path) = &args.log_file {
        config
            .set_log_file(path.clone())
            .with_context(|| format!("opening log file {}", path.display()))?;
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    configure_logging(&args)?;

    let config = match &args.config {
        Some(path) => DpmiConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => DpmiConfig::default(),
    };
    let script = Script::load(&args.script)?;
    log::info!(
        "running {} step(s) from {}",
        script.steps.len(),
        args.script.display()
    );

    let mut runner = Runner::new(DosTask::new(config)?);
    let reports = runner.run(&script)?;
    for report in &reports {
        if args.json {
            println!("{}", serde_json::to_string(report)?);
        } else {
            println!("{}", report);
        }
    }

    if let Some(path) = &args.dump_state {
        let mut f = File::create(path)?;
        write!(f, "{}", runner.task.save_state()?)?;
        log::info!("task state written to {}", path.display());
    }

    Ok(())
}
