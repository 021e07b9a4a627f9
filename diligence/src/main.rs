//! Due-diligence branch orchestrator.
//!
//! Keeps job and entity records under a state directory (`.diligence/` by
//! default) and drives branches through start, completion and handoff
//! admission. Every command prints JSON on stdout; `recite` prints text.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;

use diligence::core::detector::detect;
use diligence::core::entity_memory::normalize_entity_name;
use diligence::core::types::BranchType;
use diligence::error::{OrchestratorError, exit_code_for};
use diligence::io::config::{CONFIG_FILE, OrchestratorConfig, load_config, write_config};
use diligence::io::executor::{BranchRun, FixtureExecutor};
use diligence::io::store::FileStore;
use diligence::logging;
use diligence::orchestrator::{JobSpec, Orchestrator};

#[derive(Parser)]
#[command(
    name = "diligence",
    version,
    about = "Due-diligence branch orchestrator"
)]
struct Cli {
    /// Directory holding config.toml, jobs/ and entities/.
    #[arg(long, global = true, default_value = ".diligence")]
    state_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the state directory and a default config.toml if missing.
    Init {
        /// Overwrite an existing config.toml.
        #[arg(short, long)]
        force: bool,
    },
    /// Create a job's scratchpad and empty handoff queue.
    Start {
        #[command(flatten)]
        job: JobArgs,
    },
    /// Print the handoffs a branch's findings would propose.
    Detect {
        #[arg(long)]
        from: BranchType,
        /// JSON file with the branch findings.
        #[arg(long)]
        findings: PathBuf,
        /// Branches already in the job; repeatable.
        #[arg(long = "spawned", value_name = "BRANCH")]
        spawned: Vec<BranchType>,
    },
    /// Record a branch run and admit the handoffs it proposes.
    Complete {
        #[arg(long)]
        job: String,
        #[arg(long)]
        branch: BranchType,
        /// JSON file with `findings`, `sources`, `confidence` and optional `usage`.
        #[arg(long)]
        run: PathBuf,
    },
    /// Mark a branch failed and log the approach that did not work.
    Fail {
        #[arg(long)]
        job: String,
        #[arg(long)]
        branch: BranchType,
        #[arg(long, default_value = "branch run")]
        approach: String,
        #[arg(long)]
        error: String,
    },
    /// Print the goal recitation for a branch.
    Recite {
        #[arg(long)]
        job: String,
        #[arg(long)]
        branch: BranchType,
    },
    /// Print a job's handoff queue.
    Queue {
        #[arg(long)]
        job: String,
    },
    /// Run a whole job, replaying branch outputs from fixture files.
    Run {
        #[command(flatten)]
        job: JobArgs,
        /// Directory of `<branch>.json` run fixtures.
        #[arg(long)]
        fixtures: PathBuf,
        /// Finish the job with this verdict once every branch has run.
        #[arg(long)]
        finish: Option<String>,
    },
    /// Close a job and fold its findings into entity memory.
    Finish {
        #[arg(long)]
        job: String,
        #[arg(long)]
        verdict: String,
    },
    /// Print stored memory for an entity.
    Memory {
        #[arg(long)]
        entity: String,
    },
}

#[derive(clap::Args)]
struct JobArgs {
    #[arg(long)]
    entity: String,
    #[arg(long, default_value = "company")]
    entity_type: String,
    /// Defaults to a generated `job_<uuid>`.
    #[arg(long)]
    job_id: Option<String>,
    /// Initial branches; repeatable. Defaults to profile, team and market.
    #[arg(long = "branch", value_name = "BRANCH")]
    branches: Vec<BranchType>,
}

impl JobArgs {
    fn spec(&self) -> JobSpec {
        let mut spec = JobSpec::new(&self.entity, &self.entity_type);
        if let Some(job_id) = &self.job_id {
            spec.job_id = job_id.clone();
        }
        spec.initial_branches = self.branches.clone();
        spec
    }
}

fn main() {
    logging::init();
    if let Err(err) = run() {
        eprintln!("{err:#}");
        std::process::exit(exit_code_for(&err));
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let state_dir = cli.state_dir.as_path();
    match cli.command {
        Command::Init { force } => cmd_init(state_dir, force),
        Command::Start { job } => {
            let pad = orchestrator(state_dir)?.start_job(&job.spec())?;
            print_json(&pad)
        }
        Command::Detect {
            from,
            findings,
            spawned,
        } => {
            let findings: serde_json::Value = read_json(&findings)?;
            let spawned: BTreeSet<BranchType> = spawned.into_iter().collect();
            print_json(&detect(from, &findings, &spawned))
        }
        Command::Complete { job, branch, run } => {
            let run: BranchRun = read_json(&run)?;
            let outcome = orchestrator(state_dir)?.complete_branch(&job, branch, &run)?;
            print_json(&outcome)
        }
        Command::Fail {
            job,
            branch,
            approach,
            error,
        } => {
            let entry = orchestrator(state_dir)?.fail_branch(&job, branch, &approach, &error)?;
            print_json(&entry)
        }
        Command::Recite { job, branch } => {
            print!("{}", orchestrator(state_dir)?.recitation(&job, branch)?);
            Ok(())
        }
        Command::Queue { job } => print_json(&orchestrator(state_dir)?.queue_snapshot(&job)?),
        Command::Run {
            job,
            fixtures,
            finish,
        } => cmd_run(state_dir, &job.spec(), &fixtures, finish.as_deref()),
        Command::Finish { job, verdict } => {
            print_json(&orchestrator(state_dir)?.finish_job(&job, &verdict)?)
        }
        Command::Memory { entity } => {
            let memory = orchestrator(state_dir)?
                .entity_memory(&entity)?
                .ok_or_else(|| OrchestratorError::EntityMissing {
                    entity_key: normalize_entity_name(&entity),
                })?;
            print_json(&memory)
        }
    }
}

fn cmd_init(state_dir: &Path, force: bool) -> Result<()> {
    fs::create_dir_all(state_dir)
        .with_context(|| format!("create {}", state_dir.display()))?;
    let config_path = state_dir.join(CONFIG_FILE);
    if force || !config_path.exists() {
        write_config(&config_path, &OrchestratorConfig::default())?;
    }
    Ok(())
}

fn cmd_run(state_dir: &Path, spec: &JobSpec, fixtures: &Path, finish: Option<&str>) -> Result<()> {
    let orch = orchestrator(state_dir)?;
    let report = orch.run_job(&FixtureExecutor::new(fixtures), spec)?;
    match finish {
        Some(verdict) => {
            let memory = orch.finish_job(&report.job_id, verdict)?;
            print_json(&json!({ "report": report, "memory": memory }))
        }
        None => print_json(&report),
    }
}

fn orchestrator(state_dir: &Path) -> Result<Orchestrator<FileStore>> {
    let config = load_config(&state_dir.join(CONFIG_FILE))?;
    Ok(Orchestrator::new(FileStore::new(state_dir), config))
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize json")?;
    println!("{payload}");
    Ok(())
}
