use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use recovery_runner::{
    run_recovery, run_until_success, ClusterBinaries, HostPool, HostRecord, JsonMetricsReader,
    RunContext, SshExecutor, TrialParams, TrialResult,
};
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "recovery", version, about = "Master recovery benchmark driver")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single recovery trial.
    Run {
        #[command(flatten)]
        trial: TrialArgs,
        #[arg(long)]
        json: bool,
    },
    /// Keep retrying trials until one succeeds; transient failures restart
    /// with a fresh run directory.
    Insist {
        #[command(flatten)]
        trial: TrialArgs,
        /// Give up after this many attempts; unbounded when omitted.
        #[arg(long)]
        max_attempts: Option<u32>,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args)]
struct TrialArgs {
    #[arg(long, default_value_t = 1)]
    backups: usize,
    #[arg(long, default_value_t = 1)]
    partitions: usize,
    #[arg(long, default_value_t = 1024)]
    object_size: u64,
    #[arg(long, default_value_t = 626012)]
    objects: u64,
    #[arg(long, default_value_t = 1)]
    replicas: u32,
    /// Backup storage device for on-disk mode; backups run in-memory when
    /// omitted.
    #[arg(long)]
    disk: Option<String>,
    #[arg(long, default_value_t = 60)]
    timeout: u64,
    #[arg(long, default_value = "", allow_hyphen_values = true)]
    coordinator_args: String,
    #[arg(long, default_value = "", allow_hyphen_values = true)]
    backup_args: String,
    #[arg(long, default_value = "-m 2048", allow_hyphen_values = true)]
    old_master_args: String,
    #[arg(long, default_value = "-m 2048", allow_hyphen_values = true)]
    new_master_args: String,
    #[arg(long, default_value = "", allow_hyphen_values = true)]
    client_args: String,
    /// Directory holding the externally built cluster binaries.
    #[arg(long, default_value = "obj.master")]
    build_dir: PathBuf,
    /// Root directory for per-attempt run artifacts.
    #[arg(long, default_value = "recovery")]
    runs_dir: PathBuf,
    /// Number of rcXX hosts in the static pool.
    #[arg(long, default_value_t = 36)]
    num_hosts: usize,
}

impl TrialArgs {
    fn params(&self) -> TrialParams {
        TrialParams {
            num_backups: self.backups,
            num_partitions: self.partitions,
            object_size: self.object_size,
            num_objects: self.objects,
            replicas: self.replicas,
            disk: self.disk.clone(),
            timeout_secs: self.timeout,
            coordinator_args: self.coordinator_args.clone(),
            backup_args: self.backup_args.clone(),
            old_master_args: self.old_master_args.clone(),
            new_master_args: self.new_master_args.clone(),
            client_args: self.client_args.clone(),
        }
    }
}

fn default_pool(count: usize) -> Result<HostPool> {
    let hosts = (1..=count)
        .map(|i| HostRecord {
            name: format!("rc{:02}", i),
            address: format!("192.168.1.{}", 100 + i),
        })
        .collect();
    Ok(HostPool::new(hosts)?)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let cli = Cli::parse();
    let json_mode = match &cli.command {
        Commands::Run { json, .. } | Commands::Insist { json, .. } => *json,
    };
    match run_command(cli.command) {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json!({
                    "ok": false,
                    "error": { "code": "trial_failed", "message": err.to_string() }
                }));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run { trial, json } => {
            let pool = default_pool(trial.num_hosts)?;
            let binaries = ClusterBinaries::from_build_dir(&trial.build_dir);
            let ctx = RunContext::create(&trial.runs_dir)?;
            let result = run_recovery(
                &trial.params(),
                &pool,
                &binaries,
                &SshExecutor,
                &JsonMetricsReader,
                &ctx,
            )?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "result": result_to_json(&result)
                })));
            }
            print_result(&result);
        }
        Commands::Insist {
            trial,
            max_attempts,
            json,
        } => {
            let pool = default_pool(trial.num_hosts)?;
            let binaries = ClusterBinaries::from_build_dir(&trial.build_dir);
            let result = run_until_success(
                &trial.params(),
                &pool,
                &binaries,
                &SshExecutor,
                &JsonMetricsReader,
                &trial.runs_dir,
                max_attempts,
            )?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "insist",
                    "result": result_to_json(&result)
                })));
            }
            print_result(&result);
        }
    }
    Ok(None)
}

fn result_to_json(result: &TrialResult) -> Value {
    json!({
        "run_id": result.run_id,
        "run_dir": result.run_dir.display().to_string(),
        "object_count": result.object_count,
        "object_size": result.object_size,
        "recovery_ns": result.recovery_ns,
        "elapsed_ms": result.elapsed.as_millis() as u64,
        "metrics": &result.metrics,
    })
}

fn print_result(result: &TrialResult) {
    println!("run_id: {}", result.run_id);
    println!("run_dir: {}", result.run_dir.display());
    println!("object_count: {}", result.object_count);
    println!("object_size: {}", result.object_size);
    println!("recovery_ns: {}", result.recovery_ns);
    println!("elapsed_ms: {}", result.elapsed.as_millis());
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\"}}}}"
        ),
    }
}
