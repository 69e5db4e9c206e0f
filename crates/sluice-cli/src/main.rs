//! Sluice CLI - run a skill script under a sandbox policy
//!
//! Usage:
//!   sluice -c "bot.reply('hi')"     Run a code string
//!   sluice skill.py                 Run a script file
//!   sluice                          Read the script from stdin
//!
//! Prints the run's response as JSON. Exits 0 on success, 1 when the skill
//! failed, 2 when it missed its deadline.

use std::io::{self, Read};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use sluice::mediation::OutputSink;
use sluice::{SandboxConfig, SkillRunner};

const EXIT_DEADLINE: u8 = 2;

/// Sluice - run untrusted skill scripts in a mediated sandbox
#[derive(Parser, Debug)]
#[command(name = "sluice")]
#[command(about = "Run a skill script in the Sluice sandbox")]
struct Args {
    /// Program text to run
    #[arg(short = 'c', conflicts_with = "file")]
    code: Option<String>,

    /// Script file to run; stdin is read when neither this nor -c is given
    file: Option<PathBuf>,

    /// Policy name: none, unrestricted, permissive or restrictive
    #[arg(long)]
    policy: Option<String>,

    /// JSON sandbox configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Skill arguments, as JSON or a plain string
    #[arg(long, default_value = "")]
    args: String,

    /// Deadline in milliseconds, overriding the configuration
    #[arg(long)]
    timeout_ms: Option<u64>,
}

fn main() -> Result<ExitCode> {
    // Logs go to stderr so stdout stays valid JSON
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let args = Args::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_time()
        .build()
        .context("failed to start runtime")?;
    let result = runtime.block_on(run(args));
    // A skill that missed its deadline may still be running; don't wait for it.
    runtime.shutdown_background();
    result
}

async fn run(args: Args) -> Result<ExitCode> {
    let mut config = match &args.config {
        Some(path) => SandboxConfig::from_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => SandboxConfig::default(),
    };
    if let Some(policy) = args.policy.clone() {
        config.policy = Some(policy);
    }
    if let Some(ms) = args.timeout_ms {
        config.timeout = Duration::from_millis(ms);
    }

    let code = read_script(&args)?;
    let skill_args = parse_skill_args(&args.args);
    // Program output shares stderr with the logs; stdout carries the response.
    let policy = config
        .build_policy(&tracing::Span::current())
        .with_output(OutputSink::Stderr);
    let runner = SkillRunner::new(policy);

    let task = tokio::task::spawn_blocking(move || runner.run(&code, &skill_args));
    let response = match tokio::time::timeout(config.timeout, task).await {
        Ok(joined) => joined.context("skill runner panicked")?,
        Err(_) => {
            tracing::warn!(timeout = ?config.timeout, "skill missed its deadline");
            eprintln!("sluice: skill exceeded {} ms", config.timeout.as_millis());
            return Ok(ExitCode::from(EXIT_DEADLINE));
        }
    };

    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(if response.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn read_script(args: &Args) -> Result<String> {
    if let Some(code) = &args.code {
        return Ok(code.clone());
    }
    if let Some(path) = &args.file {
        return std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()));
    }
    let mut script = String::new();
    io::stdin()
        .read_to_string(&mut script)
        .context("failed to read stdin")?;
    Ok(script)
}

/// JSON when it parses, otherwise the raw string.
fn parse_skill_args(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}
