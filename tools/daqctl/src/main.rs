use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use daqctl::{ConsoleLogger, Outcome, Scenario, TraceFormatter};
use daqk::{AggregateMode, LoopConfig};
use log::LevelFilter;

#[derive(Parser, Debug)]
#[command(name = "daqctl")]
#[command(about = "Run daqk kernel scenarios and print their trace", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Print trace records and the summary as JSON lines
    #[arg(long, global = true)]
    json: bool,

    /// Load the loop configuration from a JSON file
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Only show these record kinds (loop, unit, dispatch, msg, timeout)
    #[arg(long = "filter", global = true, value_delimiter = ',')]
    filters: Vec<String>,

    /// Suppress trace records
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Log verbosity (repeat for more)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Omit timestamps from trace and log lines
    #[arg(long, global = true)]
    no_timestamps: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Strict priority between queues, FIFO inside a queue
    Priority,
    /// Synchronous execute across loops against a unit that never replies
    Timeout {
        /// Execute timeout in milliseconds
        #[arg(long, default_value_t = 1000)]
        ms: u64,
    },
    /// Aggregate of three messages R1, R2, R3
    Aggregate {
        #[arg(long, value_enum, default_value_t = Mode::Parallel)]
        mode: Mode,
        /// Entry names the receiver rejects
        #[arg(long, value_delimiter = ',')]
        reject: Vec<String>,
    },
    /// Reference counted teardown of nodes and units
    Lifecycle,
    /// Concurrent child list mutation
    Stress {
        #[arg(long, default_value_t = 10_000)]
        rounds: usize,
    },
    /// Run every scenario with its defaults
    All,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Mode {
    Parallel,
    Sequential,
}

impl From<Mode> for AggregateMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Parallel => AggregateMode::Parallel,
            Mode::Sequential => AggregateMode::Sequential,
        }
    }
}

impl Command {
    fn scenarios(&self) -> Vec<Scenario> {
        match self {
            Self::Priority => vec![Scenario::Priority],
            Self::Timeout { ms } => vec![Scenario::Timeout {
                tmout: Duration::from_millis(*ms),
            }],
            Self::Aggregate { mode, reject } => vec![Scenario::Aggregate {
                mode: (*mode).into(),
                reject: reject.clone(),
            }],
            Self::Lifecycle => vec![Scenario::Lifecycle],
            Self::Stress { rounds } => vec![Scenario::Stress { rounds: *rounds }],
            Self::All => vec![
                Scenario::Priority,
                Scenario::Timeout {
                    tmout: Duration::from_secs(1),
                },
                Scenario::Aggregate {
                    mode: AggregateMode::Parallel,
                    reject: Vec::new(),
                },
                Scenario::Aggregate {
                    mode: AggregateMode::Parallel,
                    reject: vec!["R2".to_string()],
                },
                Scenario::Lifecycle,
                Scenario::Stress { rounds: 10_000 },
            ],
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<LoopConfig> {
    let Some(path) = path else {
        return Ok(LoopConfig::builder().name("daqctl").build());
    };
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading loop config {}", path.display()))?;
    let config: LoopConfig = serde_json::from_str(&text)
        .with_context(|| format!("parsing loop config {}", path.display()))?;
    Ok(config)
}

fn print_outcome(outcome: &Outcome, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(outcome)?);
        return Ok(());
    }
    let status = if outcome.passed {
        "PASS".bright_green().bold()
    } else {
        "FAIL".bright_red().bold()
    };
    println!("{status} {}", outcome.scenario.bold());
    for detail in &outcome.details {
        println!("     {detail}");
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    ConsoleLogger::new(level, !cli.no_timestamps)
        .install()
        .context("installing logger")?;

    let config = load_config(cli.config.as_ref())?;
    let hook = if cli.quiet {
        None
    } else {
        let mut formatter = TraceFormatter::new(!cli.no_timestamps, cli.json);
        formatter.set_filters(&cli.filters);
        Some(formatter.into_hook())
    };

    let mut failed = 0;
    for scenario in cli.command.scenarios() {
        log::info!("running {}", scenario.name());
        let outcome = scenario
            .run(&config, hook.clone())
            .with_context(|| format!("scenario {}", scenario.name()))?;
        if !outcome.passed {
            failed += 1;
        }
        print_outcome(&outcome, cli.json)?;
    }

    if failed > 0 {
        anyhow::bail!("{failed} scenario(s) failed");
    }
    Ok(())
}
