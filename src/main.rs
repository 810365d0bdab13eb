use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use fhir_forge::config::Config;
use fhir_forge::oracle::{LlmOracle, Model};
use fhir_forge::quality;
use fhir_forge::session::{RetrySession, SessionConfig, SessionOutcome};
use fhir_forge::writers;

#[derive(Parser, Debug)]
#[command(
    name = "fhir-forge",
    about = "Generate synthetic FHIR R4B records via LLM-written Python",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate records from a natural-language requirement
    Generate {
        /// What to generate, e.g. "20 diabetic patients with HbA1c observations".
        /// Optional when --types is given.
        requirement: Option<String>,

        /// Generate a linked set of these resource types instead of a
        /// free-form requirement (comma-separated, e.g. Patient,Condition)
        #[arg(long, value_delimiter = ',')]
        types: Vec<String>,

        /// Records per resource type for --types
        #[arg(long, default_value_t = 5)]
        per_type: usize,

        /// Output path for NDJSON (single file), or directory with --split
        #[arg(short, long, default_value = "output.ndjson")]
        out: PathBuf,

        /// Write one NDJSON file per resource type into the --out directory
        #[arg(long)]
        split: bool,

        /// Write a FHIR Bundle instead of NDJSON (collection or transaction)
        #[arg(long, value_name = "TYPE")]
        bundle: Option<String>,

        /// Oracle invocations allowed, including the initial generation
        #[arg(long)]
        max_attempts: Option<usize>,

        /// Hard wall-clock limit per candidate execution, in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Use the fast model tier instead of the smart one
        #[arg(long)]
        fast: bool,

        /// Python interpreter for candidate execution
        #[arg(long)]
        python: Option<String>,
    },
    /// Store the OpenRouter API key in the config file
    Setup,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match args.command {
        Some(Command::Setup) => setup(),
        Some(Command::Generate {
            requirement,
            types,
            per_type,
            out,
            split,
            bundle,
            max_attempts,
            timeout,
            fast,
            python,
        }) => {
            generate(
                requirement,
                types,
                per_type,
                &out,
                split,
                bundle.as_deref(),
                max_attempts,
                timeout,
                fast,
                python,
            )
            .await
        }
        None => {
            bail!("no command given; try 'fhir-forge generate \"...\"' or 'fhir-forge setup'")
        }
    }
}

fn setup() -> Result<()> {
    eprint!("OpenRouter API key: ");
    std::io::stderr().flush()?;
    let mut key = String::new();
    std::io::stdin().read_line(&mut key)?;
    let key = key.trim();
    if key.is_empty() {
        bail!("no key entered");
    }
    let mut config = Config::load();
    config.openrouter_api_key = Some(key.to_string());
    config.save()?;
    eprintln!("Saved.");
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn generate(
    requirement: Option<String>,
    types: Vec<String>,
    per_type: usize,
    out: &PathBuf,
    split: bool,
    bundle: Option<&str>,
    max_attempts: Option<usize>,
    timeout: Option<u64>,
    fast: bool,
    python: Option<String>,
) -> Result<()> {
    let config = Config::load();
    let api_key = config
        .api_key()
        .ok_or_else(|| anyhow::anyhow!("no API key; set OPENROUTER_API_KEY or run 'fhir-forge setup'"))?;

    let model = if fast { Model::Speed } else { Model::Smart };
    let (oracle, requirement) = if types.is_empty() {
        let requirement =
            requirement.ok_or_else(|| anyhow::anyhow!("give a requirement or --types"))?;
        (LlmOracle::new(api_key, model), requirement)
    } else {
        // The bundle task builds its own prompt; the requirement only labels
        // the session in output below.
        let label = requirement.unwrap_or_else(|| types.join(", "));
        (
            LlmOracle::bundled(api_key, model, types, per_type),
            label,
        )
    };

    let mut session_config = SessionConfig::fhir();
    session_config.max_attempts = max_attempts.unwrap_or(config.max_attempts);
    session_config.exec_timeout =
        Duration::from_secs(timeout.unwrap_or(config.exec_timeout_secs));
    session_config.python = PathBuf::from(python.unwrap_or(config.python));

    eprintln!("Generating: {requirement}");
    let outcome = RetrySession::new(oracle, session_config)
        .run(&requirement)
        .await;

    match outcome {
        SessionOutcome::Succeeded { records, attempts } => {
            let accepted = attempts
                .last()
                .map(|a| a.code.clone())
                .unwrap_or_default();
            let report = quality::assess(&accepted, Some(&records));

            if let Some(bundle_type) = bundle {
                writers::write_bundle(&records, out, bundle_type)?;
            } else if split {
                writers::write_ndjson_split(&records, out)?;
            } else {
                writers::write_ndjson(&records, out)?;
            }

            eprintln!(
                "Accepted after {} attempt{}: {} record{} -> {}",
                attempts.len(),
                if attempts.len() == 1 { "" } else { "s" },
                records.len(),
                if records.len() == 1 { "" } else { "s" },
                out.display()
            );
            eprint!("{}", report.render());
            Ok(())
        }
        outcome @ SessionOutcome::Exhausted { .. } => {
            let detail = outcome
                .last_error()
                .unwrap_or_else(|| "no attempt recorded".to_string());
            bail!(
                "gave up after {} attempt{}: {detail}",
                outcome.attempts().len(),
                if outcome.attempts().len() == 1 { "" } else { "s" }
            )
        }
    }
}
