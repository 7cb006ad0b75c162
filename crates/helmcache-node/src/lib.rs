//! Node-level materialization of benchmark runs.
//!
//! A node answers one request: "expose the run described by this descriptor
//! under my output directory." It either reuses a complete run found under
//! one or more precomputed search roots, or invokes the external benchmark
//! command and re-resolves against the tree that command produced. A JSON
//! manifest records what happened; a sentinel file written strictly after
//! the manifest is the only signal other processes may trust for "this
//! node is done."
//!
//! There is no locking around the node's own output directory: two
//! concurrent invocations against the same `out_dpath` are an unsupported,
//! racy configuration. Concurrent reads of shared precomputed roots are
//! fine since nothing here mutates them.

use anyhow::Result;
use chrono::Utc;
use helmcache_core::{
    atomic_write_bytes, ensure_dir, DescriptorError, RunQuery,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Directory name identifying an artifact root.
pub const ARTIFACT_ROOT_NAME: &str = "benchmark_output";
/// Subdirectory of an artifact root holding one directory per suite.
pub const RUNS_DIR_NAME: &str = "runs";

const REQUIRED_RUN_FILES: [&str; 3] = ["run_spec.json", "scenario_state.json", "stats.json"];
const PER_INSTANCE_STATS_FNAME: &str = "per_instance_stats.json";

#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
    #[error("no reusable run found for {run_entry:?} and mode=reuse_only")]
    NoReuseFound { run_entry: String },
    #[error("benchmark command {command:?} exited with status {status}")]
    ComputeFailed { command: String, status: i32 },
    #[error("benchmark command succeeded, but no produced run directory matches {run_entry:?}")]
    UnresolvableComputedOutput { run_entry: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    ReuseOnly,
    ComputeIfMissing,
    ForceRecompute,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::ReuseOnly => "reuse_only",
            Mode::ComputeIfMissing => "compute_if_missing",
            Mode::ForceRecompute => "force_recompute",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaterializeStrategy {
    Symlink,
    Copy,
}

impl MaterializeStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MaterializeStrategy::Symlink => "symlink",
            MaterializeStrategy::Copy => "copy",
        }
    }
}

/// Full configuration surface of one node invocation.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Run descriptor to materialize, e.g.
    /// `"mmlu:subject=philosophy,model=openai/gpt2"`.
    pub run_entry: String,
    /// Suite name used for the output layout and passed to the benchmark
    /// command.
    pub suite: String,
    /// Node working/output directory.
    pub out_dpath: PathBuf,
    /// Zero or more directories searched for existing outputs; each may be
    /// an artifact root itself or contain nested artifact roots.
    pub precomputed_roots: Vec<PathBuf>,
    /// When set, only runs whose inferred instance count matches (or could
    /// not be inferred) are reused; also forwarded to the benchmark command.
    pub max_eval_instances: Option<usize>,
    /// Whether `per_instance_stats.json` is required for a run directory to
    /// count as complete.
    pub require_per_instance_stats: bool,
    pub mode: Mode,
    pub materialize: MaterializeStrategy,
    /// Forwarded to the benchmark command's own parallelism setting; this
    /// node itself is single-threaded.
    pub num_threads: usize,
    /// Benchmark command to invoke when computation is needed.
    pub benchmark_bin: String,
    /// Sentinel file name written in `out_dpath` on completion.
    pub done_fname: String,
    /// Manifest file name written in `out_dpath`.
    pub manifest_fname: String,
}

impl NodeConfig {
    pub fn new(
        run_entry: impl Into<String>,
        suite: impl Into<String>,
        out_dpath: impl Into<PathBuf>,
    ) -> Self {
        Self {
            run_entry: run_entry.into(),
            suite: suite.into(),
            out_dpath: out_dpath.into(),
            precomputed_roots: Vec::new(),
            max_eval_instances: None,
            require_per_instance_stats: true,
            mode: Mode::ComputeIfMissing,
            materialize: MaterializeStrategy::Symlink,
            num_threads: 1,
            benchmark_bin: "helm-run".to_string(),
            done_fname: "DONE".to_string(),
            manifest_fname: "adapter_manifest.json".to_string(),
        }
    }
}

/// The single best candidate chosen for a request.
#[derive(Debug, Clone)]
pub struct RunMatch {
    pub run_dir: PathBuf,
    pub run_name: String,
    /// The artifact root the candidate was found under.
    pub source_root: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestedParams {
    pub run_entry: String,
    pub suite: String,
    pub max_eval_instances: Option<usize>,
    pub require_per_instance_stats: bool,
    pub mode: Mode,
    pub materialize: MaterializeStrategy,
}

impl RequestedParams {
    fn from_config(config: &NodeConfig) -> Self {
        Self {
            run_entry: config.run_entry.clone(),
            suite: config.suite.clone(),
            max_eval_instances: config.max_eval_instances,
            require_per_instance_stats: config.require_per_instance_stats,
            mode: config.mode,
            materialize: config.materialize,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReuseDetails {
    pub source_run_dir: String,
    pub matched_run_name: String,
    pub materialized_run_dir: String,
    pub source_benchmark_output_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputedDetails {
    pub computed_run_dir: String,
    pub computed_run_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Reused,
    Computed,
    Missing,
    Error,
    /// Synthetic status returned when the sentinel exists but the manifest
    /// file is absent or unreadable.
    Done,
}

/// Durable record of what one node invocation decided and did. Written once
/// per terminal outcome, before the sentinel; useful for debugging failures
/// as much as for recording successes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub requested: RequestedParams,
    pub status: NodeStatus,
    #[serde(default)]
    pub reuse: Option<ReuseDetails>,
    #[serde(default)]
    pub computed: Option<ComputedDetails>,
    pub out_dpath: String,
    /// Epoch seconds.
    pub timestamp: i64,
}

// -----------------------------
// Disk layout discovery
// -----------------------------

/// Yield every artifact root reachable from the given search roots.
///
/// Supports both layouts: a root that is directly an artifact root, and a
/// root containing artifact roots at arbitrary depth. Non-existent roots
/// are silently skipped. No ordering is guaranteed; later stages impose
/// determinism via scoring.
pub fn discover_artifact_roots(roots: &[PathBuf]) -> impl Iterator<Item = PathBuf> + '_ {
    roots.iter().flat_map(|root| {
        let mut found = Vec::new();
        if !root.exists() {
            debug!(root = %root.display(), "search root does not exist; skipping");
            return found.into_iter();
        }
        if root.is_dir() && root.file_name().and_then(|s| s.to_str()) == Some(ARTIFACT_ROOT_NAME) {
            found.push(root.clone());
            return found.into_iter();
        }
        for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
            if entry.file_type().is_dir()
                && entry.file_name().to_str() == Some(ARTIFACT_ROOT_NAME)
            {
                found.push(entry.into_path());
            }
        }
        found.into_iter()
    })
}

/// List suite directories under an artifact root, sorted.
///
/// The producer maintains a `latest` alias under `runs/` which is never a
/// real suite.
pub fn suite_dirs(artifact_root: &Path) -> Vec<PathBuf> {
    let runs_dir = artifact_root.join(RUNS_DIR_NAME);
    let mut out = Vec::new();
    if let Ok(entries) = fs::read_dir(&runs_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() && entry.file_name().to_str() != Some("latest") {
                out.push(path);
            }
        }
    }
    out.sort();
    out
}

/// List run directories within a suite, sorted. A directory qualifies only
/// if its basename contains the namespace separator.
pub fn run_dirs(suite_dir: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Ok(entries) = fs::read_dir(suite_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir()
                && entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| name.contains(':'))
            {
                out.push(path);
            }
        }
    }
    out.sort();
    out
}

/// Whether a run directory contains the minimum required output files,
/// plus `per_instance_stats.json` when requested.
pub fn is_complete_run_dir(run_dir: &Path, require_per_instance_stats: bool) -> bool {
    let complete = REQUIRED_RUN_FILES
        .iter()
        .all(|name| run_dir.join(name).exists());
    if !complete {
        return false;
    }
    if require_per_instance_stats && !run_dir.join(PER_INSTANCE_STATS_FNAME).exists() {
        return false;
    }
    true
}

/// Best-effort count of distinct evaluated instances in a run directory.
///
/// Counts unique `instance_id` values in `per_instance_stats.json` (one
/// instance may carry several stat records), falling back to the raw array
/// length if no records carry an id. Returns `None` when the file is
/// absent or malformed; callers must treat `None` as "unknown, assume
/// compatible", never as zero.
pub fn infer_num_instances(run_dir: &Path) -> Option<usize> {
    let path = run_dir.join(PER_INSTANCE_STATS_FNAME);
    let bytes = fs::read(&path).ok()?;
    let data: Value = serde_json::from_slice(&bytes).ok()?;
    let items = data.as_array()?;
    let ids: BTreeSet<&str> = items
        .iter()
        .filter_map(|item| item.get("instance_id").and_then(|v| v.as_str()))
        .collect();
    if ids.is_empty() {
        return Some(items.len());
    }
    Some(ids.len())
}

fn eligible_run_match(
    run_dir: PathBuf,
    source_root: &Path,
    query: &RunQuery,
    max_eval_instances: Option<usize>,
    require_per_instance_stats: bool,
) -> Option<RunMatch> {
    let run_name = run_dir.file_name().and_then(|s| s.to_str())?.to_string();
    if !is_complete_run_dir(&run_dir, require_per_instance_stats) {
        debug!(run = %run_name, "candidate incomplete; skipping");
        return None;
    }
    if !query.matches_run_name(&run_name) {
        return None;
    }
    if let Some(want) = max_eval_instances {
        if let Some(found) = infer_num_instances(&run_dir) {
            if found != want {
                debug!(run = %run_name, found, want, "instance count mismatch; skipping");
                return None;
            }
        }
    }
    Some(RunMatch {
        run_dir,
        run_name,
        source_root: source_root.to_path_buf(),
    })
}

/// Search for the best reusable run directory under one or more roots.
///
/// Every read is performed fresh per call; nothing is cached between
/// invocations, which is what makes re-resolution after compute meaningful.
pub fn find_best_run(
    roots: &[PathBuf],
    query: &RunQuery,
    max_eval_instances: Option<usize>,
    require_per_instance_stats: bool,
) -> Option<RunMatch> {
    let mut candidates = Vec::new();
    for artifact_root in discover_artifact_roots(roots) {
        for suite_dir in suite_dirs(&artifact_root) {
            for run_dir in run_dirs(&suite_dir) {
                if let Some(found) = eligible_run_match(
                    run_dir,
                    &artifact_root,
                    query,
                    max_eval_instances,
                    require_per_instance_stats,
                ) {
                    candidates.push(found);
                }
            }
        }
    }
    candidates.sort_by_key(|c| query.score(&c.run_name));
    candidates.into_iter().next()
}

/// Locate the run directory the benchmark command produced, scoped to the
/// node's own suite subtree.
fn find_computed_run(
    out_dpath: &Path,
    suite: &str,
    query: &RunQuery,
    max_eval_instances: Option<usize>,
    require_per_instance_stats: bool,
) -> Option<RunMatch> {
    let artifact_root = out_dpath.join(ARTIFACT_ROOT_NAME);
    let suite_dir = artifact_root.join(RUNS_DIR_NAME).join(suite);
    let mut candidates = Vec::new();
    for run_dir in run_dirs(&suite_dir) {
        if let Some(found) = eligible_run_match(
            run_dir,
            &artifact_root,
            query,
            max_eval_instances,
            require_per_instance_stats,
        ) {
            candidates.push(found);
        }
    }
    candidates.sort_by_key(|c| query.score(&c.run_name));
    candidates.into_iter().next()
}

// -----------------------------
// Materialization
// -----------------------------

/// Create a symlink `dst` -> `src`, replacing whatever is at `dst` if it is
/// not already a correctly-targeted link. Safe to call repeatedly.
pub fn ensure_symlink(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        ensure_dir(parent)?;
    }
    if let Ok(meta) = fs::symlink_metadata(dst) {
        if meta.file_type().is_symlink() {
            if let Ok(target) = fs::read_link(dst) {
                if target == src {
                    return Ok(());
                }
            }
            fs::remove_file(dst)?;
        } else if meta.is_dir() {
            fs::remove_dir_all(dst)?;
        } else {
            fs::remove_file(dst)?;
        }
    }
    #[cfg(unix)]
    {
        std::os::unix::fs::symlink(src, dst)?;
        Ok(())
    }
    #[cfg(not(unix))]
    {
        Err(anyhow::anyhow!(
            "symlink materialization is only supported on unix; use the copy strategy"
        ))
    }
}

/// Copy a directory tree to `dst`, removing any pre-existing `dst` in full
/// first. Never merges with stale prior content.
pub fn ensure_copytree(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        ensure_dir(parent)?;
    }
    if let Ok(meta) = fs::symlink_metadata(dst) {
        if meta.is_dir() {
            fs::remove_dir_all(dst)?;
        } else {
            fs::remove_file(dst)?;
        }
    }
    for entry in WalkDir::new(src) {
        let entry = entry?;
        let rel = entry.path().strip_prefix(src).unwrap_or(entry.path());
        if rel.as_os_str().is_empty() {
            ensure_dir(dst)?;
            continue;
        }
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            ensure_dir(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                ensure_dir(parent)?;
            }
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

// -----------------------------
// Compute invocation
// -----------------------------

/// Invoke the external benchmark command with cwd set to the node output
/// directory, so it writes under `out_dpath/benchmark_output`. stdio is
/// inherited; the command's output is not interpreted beyond exit status.
fn run_benchmark(config: &NodeConfig, query: &RunQuery) -> Result<(), NodeError> {
    let mut cmd = Command::new(&config.benchmark_bin);
    cmd.arg("--run-entries")
        .arg(query.raw())
        .arg("--suite")
        .arg(&config.suite)
        .current_dir(&config.out_dpath);
    if let Some(n) = config.max_eval_instances {
        cmd.arg("--max-eval-instances").arg(n.to_string());
    }
    cmd.arg("--num-threads").arg(config.num_threads.to_string());
    info!(
        command = %config.benchmark_bin,
        run_entry = %query.raw(),
        suite = %config.suite,
        "invoking benchmark command"
    );
    let status = cmd.status()?;
    if !status.success() {
        return Err(NodeError::ComputeFailed {
            command: config.benchmark_bin.clone(),
            status: status.code().unwrap_or(-1),
        });
    }
    Ok(())
}

// -----------------------------
// Orchestration
// -----------------------------

fn synthetic_done_manifest(config: &NodeConfig) -> Manifest {
    Manifest {
        requested: RequestedParams::from_config(config),
        status: NodeStatus::Done,
        reuse: None,
        computed: None,
        out_dpath: config.out_dpath.display().to_string(),
        timestamp: Utc::now().timestamp(),
    }
}

fn write_manifest(path: &Path, manifest: &Manifest) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(manifest)?;
    atomic_write_bytes(path, &bytes)
}

/// Materialize one run: check sentinel, attempt reuse, else compute and
/// re-resolve, then write the manifest followed by the sentinel.
///
/// Idempotent across repeated invocations: a completed node short-circuits
/// on its sentinel, and an interrupted one (manifest present, sentinel
/// absent) resolves again from scratch.
pub fn materialize_run(config: &NodeConfig) -> Result<Manifest, NodeError> {
    ensure_dir(&config.out_dpath)?;
    let done_fpath = config.out_dpath.join(&config.done_fname);
    let manifest_fpath = config.out_dpath.join(&config.manifest_fname);

    if done_fpath.exists() && config.mode != Mode::ForceRecompute {
        info!(out_dpath = %config.out_dpath.display(), "sentinel present; node already complete");
        if let Ok(bytes) = fs::read(&manifest_fpath) {
            match serde_json::from_slice::<Manifest>(&bytes) {
                Ok(manifest) => return Ok(manifest),
                Err(err) => {
                    warn!(%err, "existing manifest unreadable; returning synthetic status");
                }
            }
        }
        return Ok(synthetic_done_manifest(config));
    }

    // Stale-state cleanup: a forced recompute must never leave a sentinel
    // that predates its own outputs.
    if config.mode == Mode::ForceRecompute && done_fpath.exists() {
        fs::remove_file(&done_fpath)?;
    }

    let query = RunQuery::new(&config.run_entry)?;

    let mut manifest = Manifest {
        requested: RequestedParams::from_config(config),
        status: NodeStatus::Error,
        reuse: None,
        computed: None,
        out_dpath: config.out_dpath.display().to_string(),
        timestamp: Utc::now().timestamp(),
    };

    let reuse_match = if config.mode != Mode::ForceRecompute && !config.precomputed_roots.is_empty()
    {
        find_best_run(
            &config.precomputed_roots,
            &query,
            config.max_eval_instances,
            config.require_per_instance_stats,
        )
    } else {
        None
    };

    if let Some(found) = reuse_match {
        let target_run_dir = config
            .out_dpath
            .join(ARTIFACT_ROOT_NAME)
            .join(RUNS_DIR_NAME)
            .join(&config.suite)
            .join(&found.run_name);
        match config.materialize {
            MaterializeStrategy::Symlink => ensure_symlink(&found.run_dir, &target_run_dir)?,
            MaterializeStrategy::Copy => ensure_copytree(&found.run_dir, &target_run_dir)?,
        }
        info!(
            run = %found.run_name,
            source = %found.run_dir.display(),
            strategy = config.materialize.as_str(),
            "reusing precomputed run"
        );
        manifest.status = NodeStatus::Reused;
        manifest.reuse = Some(ReuseDetails {
            source_run_dir: found.run_dir.display().to_string(),
            matched_run_name: found.run_name.clone(),
            materialized_run_dir: target_run_dir.display().to_string(),
            source_benchmark_output_dir: found.source_root.display().to_string(),
        });
    } else {
        if config.mode == Mode::ReuseOnly {
            manifest.status = NodeStatus::Missing;
            write_manifest(&manifest_fpath, &manifest)?;
            return Err(NodeError::NoReuseFound {
                run_entry: config.run_entry.clone(),
            });
        }

        // The benchmark command creates this itself; pre-creating is fine.
        ensure_dir(&config.out_dpath.join(ARTIFACT_ROOT_NAME))?;

        if let Err(err) = run_benchmark(config, &query) {
            manifest.status = NodeStatus::Error;
            write_manifest(&manifest_fpath, &manifest)?;
            return Err(err);
        }

        // Re-resolve against the freshly written tree: the command's own
        // naming may not exactly echo the request. Scope to the suite
        // first, then fall back to scanning all of out_dpath.
        let computed = find_computed_run(
            &config.out_dpath,
            &config.suite,
            &query,
            config.max_eval_instances,
            config.require_per_instance_stats,
        )
        .or_else(|| {
            find_best_run(
                std::slice::from_ref(&config.out_dpath),
                &query,
                config.max_eval_instances,
                config.require_per_instance_stats,
            )
        });

        let Some(found) = computed else {
            manifest.status = NodeStatus::Error;
            write_manifest(&manifest_fpath, &manifest)?;
            return Err(NodeError::UnresolvableComputedOutput {
                run_entry: config.run_entry.clone(),
            });
        };
        info!(run = %found.run_name, "benchmark command produced a matching run");
        manifest.status = NodeStatus::Computed;
        manifest.computed = Some(ComputedDetails {
            computed_run_dir: found.run_dir.display().to_string(),
            computed_run_name: found.run_name,
        });
    }

    // Manifest first, sentinel last: the sentinel is the only completion
    // signal other processes may rely on, and it must never exist without a
    // trustworthy manifest behind it.
    write_manifest(&manifest_fpath, &manifest)?;
    atomic_write_bytes(&done_fpath, b"ok\n")?;

    Ok(manifest)
}
