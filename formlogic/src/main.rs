//! formlogic: evaluate form logic against submissions, or serve tasks.
//!
//! `evaluate` runs a pass inline. `dispatch` runs a task in a separate
//! `formlogic worker` process through the task runner.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;

use formlogic::core::engine::MinijinjaEngine;
use formlogic::core::orchestrator::Orchestrator;
use formlogic::exit_codes;
use formlogic::io::config::{DEFAULT_CONFIG_PATH, FormlogicConfig, load_config, write_config};
use formlogic::io::form_store::{load_form, load_scope, load_submission};
use formlogic::io::task_runner::{ProcessSpawner, TaskError, TaskRunner};
use formlogic::io::worker::{TaskRegistry, run_worker};
use formlogic::logging;

#[derive(Parser)]
#[command(
    name = "formlogic",
    version,
    about = "Evaluate form conditions, calculations and validations"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default config file.
    Init {
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
    /// Check a form definition against the schema and key invariants.
    Validate {
        #[arg(long)]
        form: PathBuf,
    },
    /// Run one evaluation pass and print `{scope, data}` as JSON.
    Evaluate {
        #[arg(long)]
        form: PathBuf,
        #[arg(long)]
        submission: PathBuf,
        /// Conditional scope produced upstream.
        #[arg(long)]
        scope: Option<PathBuf>,
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
    /// Run a named task in a worker process and print its result.
    Dispatch {
        task: String,
        /// JSON file holding the task payload.
        #[arg(long)]
        payload: PathBuf,
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
    /// Serve one task over stdin/stdout.
    Worker,
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init { config, force } => cmd_init(&config, force),
        Command::Validate { form } => cmd_validate(&form),
        Command::Evaluate {
            form,
            submission,
            scope,
            config,
        } => cmd_evaluate(&form, &submission, scope.as_deref(), &config),
        Command::Dispatch {
            task,
            payload,
            config,
        } => cmd_dispatch(&task, &payload, &config),
        Command::Worker => {
            run_worker(&TaskRegistry::with_builtin_tasks())?;
            Ok(exit_codes::OK)
        }
    }
}

fn cmd_init(config_path: &Path, force: bool) -> Result<i32> {
    if config_path.exists() && !force {
        bail!(
            "{} already exists; pass --force to overwrite",
            config_path.display()
        );
    }
    write_config(config_path, &FormlogicConfig::default())?;
    println!("wrote {}", config_path.display());
    Ok(exit_codes::OK)
}

fn cmd_validate(form_path: &Path) -> Result<i32> {
    let loaded = load_form(form_path)?;
    for warning in &loaded.warnings {
        eprintln!("warning: {warning}");
    }
    println!("ok");
    Ok(exit_codes::OK)
}

fn cmd_evaluate(
    form_path: &Path,
    submission_path: &Path,
    scope_path: Option<&Path>,
    config_path: &Path,
) -> Result<i32> {
    let cfg = load_config(config_path)?;
    let loaded = load_form(form_path)?;
    let submission = load_submission(submission_path)?;
    let seed = scope_path.map(load_scope).transpose()?;

    let orchestrator = Orchestrator::new(MinijinjaEngine).with_options(cfg.pass_options());
    let output = orchestrator.run(&loaded.form, submission, seed);
    print_json(&output)?;
    Ok(if output.scope.is_valid() {
        exit_codes::OK
    } else {
        exit_codes::REJECTED
    })
}

fn cmd_dispatch(task: &str, payload_path: &Path, config_path: &Path) -> Result<i32> {
    let cfg = load_config(config_path)?;
    let raw = fs::read_to_string(payload_path)
        .with_context(|| format!("read payload {}", payload_path.display()))?;
    let payload: Value = serde_json::from_str(&raw)
        .with_context(|| format!("parse payload {}", payload_path.display()))?;
    let spawner = ProcessSpawner::from_config(&cfg.task)?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;
    let result = runtime.block_on(TaskRunner::new(spawner).start(task, payload, cfg.task.timeout()));

    match result {
        Ok(value) => {
            print_json(&value)?;
            Ok(exit_codes::OK)
        }
        Err(TaskError::Rejected(reason)) => {
            print_json(&reason)?;
            Ok(exit_codes::REJECTED)
        }
        Err(err) => {
            eprintln!("{err}");
            Ok(exit_codes::FAILED)
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize json")?;
    println!("{payload}");
    Ok(())
}
