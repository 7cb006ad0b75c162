use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use helmcache_core::RunQuery;
use helmcache_node::{
    discover_artifact_roots, find_best_run, materialize_run, run_dirs, suite_dirs,
    MaterializeStrategy, Mode, NodeConfig,
};
use serde_json::{json, Value};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "helmcache",
    version,
    about = "Materialize benchmark runs from precomputed caches or fresh computation"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ModeArg {
    #[value(name = "reuse_only")]
    ReuseOnly,
    #[value(name = "compute_if_missing")]
    ComputeIfMissing,
    #[value(name = "force_recompute")]
    ForceRecompute,
}

impl From<ModeArg> for Mode {
    fn from(value: ModeArg) -> Self {
        match value {
            ModeArg::ReuseOnly => Mode::ReuseOnly,
            ModeArg::ComputeIfMissing => Mode::ComputeIfMissing,
            ModeArg::ForceRecompute => Mode::ForceRecompute,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum MaterializeArg {
    #[value(name = "symlink")]
    Symlink,
    #[value(name = "copy")]
    Copy,
}

impl From<MaterializeArg> for MaterializeStrategy {
    fn from(value: MaterializeArg) -> Self {
        match value {
            MaterializeArg::Symlink => MaterializeStrategy::Symlink,
            MaterializeArg::Copy => MaterializeStrategy::Copy,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Materialize one run into a node output directory.
    Run {
        #[arg(long)]
        run_entry: String,
        #[arg(long)]
        suite: String,
        #[arg(long)]
        out_dpath: PathBuf,
        #[arg(long, num_args = 0..)]
        precomputed_roots: Vec<PathBuf>,
        #[arg(long)]
        max_eval_instances: Option<usize>,
        #[arg(long, action = ArgAction::Set, default_value_t = true)]
        require_per_instance_stats: bool,
        #[arg(long, value_enum, default_value_t = ModeArg::ComputeIfMissing)]
        mode: ModeArg,
        #[arg(long, value_enum, default_value_t = MaterializeArg::Symlink)]
        materialize: MaterializeArg,
        #[arg(long, default_value_t = 1)]
        num_threads: usize,
        #[arg(long, default_value = "helm-run")]
        benchmark_bin: String,
        #[arg(long, default_value = "DONE")]
        done_fname: String,
        #[arg(long, default_value = "adapter_manifest.json")]
        manifest_fname: String,
        #[arg(long)]
        json: bool,
    },
    /// Show the best reusable match for a descriptor without materializing.
    Find {
        #[arg(long)]
        run_entry: String,
        #[arg(long, num_args = 1..)]
        roots: Vec<PathBuf>,
        #[arg(long)]
        max_eval_instances: Option<usize>,
        #[arg(long, action = ArgAction::Set, default_value_t = true)]
        require_per_instance_stats: bool,
        #[arg(long)]
        json: bool,
    },
    /// List discovered artifact roots, suites, and run names.
    Ls {
        #[arg(long, num_args = 1..)]
        roots: Vec<PathBuf>,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    match run_command(cli.command) {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", err.to_string()));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            run_entry,
            suite,
            out_dpath,
            precomputed_roots,
            max_eval_instances,
            require_per_instance_stats,
            mode,
            materialize,
            num_threads,
            benchmark_bin,
            done_fname,
            manifest_fname,
            json,
        } => {
            let config = NodeConfig {
                run_entry,
                suite,
                out_dpath,
                precomputed_roots,
                max_eval_instances,
                require_per_instance_stats,
                mode: mode.into(),
                materialize: materialize.into(),
                num_threads,
                benchmark_bin,
                done_fname,
                manifest_fname,
            };
            let manifest = materialize_run(&config)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "manifest": serde_json::to_value(&manifest)?,
                })));
            }
            println!("status: {}", status_str(&manifest));
            println!("out_dpath: {}", manifest.out_dpath);
            if let Some(reuse) = &manifest.reuse {
                println!("matched_run_name: {}", reuse.matched_run_name);
                println!("source_run_dir: {}", reuse.source_run_dir);
                println!("materialized_run_dir: {}", reuse.materialized_run_dir);
            }
            if let Some(computed) = &manifest.computed {
                println!("computed_run_name: {}", computed.computed_run_name);
                println!("computed_run_dir: {}", computed.computed_run_dir);
            }
        }
        Commands::Find {
            run_entry,
            roots,
            max_eval_instances,
            require_per_instance_stats,
            json,
        } => {
            let query = RunQuery::new(&run_entry)?;
            let found = find_best_run(
                &roots,
                &query,
                max_eval_instances,
                require_per_instance_stats,
            );
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "find",
                    "run_entry": run_entry,
                    "match": found.as_ref().map(|m| json!({
                        "run_dir": m.run_dir.display().to_string(),
                        "run_name": m.run_name,
                        "source_benchmark_output_dir": m.source_root.display().to_string(),
                    })),
                })));
            }
            match found {
                Some(m) => {
                    println!("run_name: {}", m.run_name);
                    println!("run_dir: {}", m.run_dir.display());
                    println!("source_benchmark_output_dir: {}", m.source_root.display());
                }
                None => println!("no match"),
            }
        }
        Commands::Ls { roots, json } => {
            let mut inventory = Vec::new();
            for artifact_root in discover_artifact_roots(&roots) {
                for suite_dir in suite_dirs(&artifact_root) {
                    let suite_name = suite_dir
                        .file_name()
                        .map(|s| s.to_string_lossy().to_string())
                        .unwrap_or_default();
                    for run_dir in run_dirs(&suite_dir) {
                        let run_name = run_dir
                            .file_name()
                            .map(|s| s.to_string_lossy().to_string())
                            .unwrap_or_default();
                        inventory.push((
                            artifact_root.display().to_string(),
                            suite_name.clone(),
                            run_name,
                        ));
                    }
                }
            }
            if json {
                let runs: Vec<Value> = inventory
                    .iter()
                    .map(|(root, suite, run)| {
                        json!({
                            "benchmark_output_dir": root,
                            "suite": suite,
                            "run_name": run,
                        })
                    })
                    .collect();
                return Ok(Some(json!({
                    "ok": true,
                    "command": "ls",
                    "runs": runs,
                })));
            }
            for (root, suite, run) in &inventory {
                println!("{}\t{}\t{}", root, suite, run);
            }
        }
    }
    Ok(None)
}

fn status_str(manifest: &helmcache_node::Manifest) -> &'static str {
    match manifest.status {
        helmcache_node::NodeStatus::Reused => "reused",
        helmcache_node::NodeStatus::Computed => "computed",
        helmcache_node::NodeStatus::Missing => "missing",
        helmcache_node::NodeStatus::Error => "error",
        helmcache_node::NodeStatus::Done => "done",
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\"}}}}"
        ),
    }
}

fn json_error(code: &str, message: String) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. } | Commands::Find { json, .. } | Commands::Ls { json, .. } => {
            *json
        }
    }
}
