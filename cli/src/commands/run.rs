use anyhow::Context;
use clap::{Args, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use editor_fleet_core::config::{ConfigLoader, ModeOverride};
use editor_fleet_core::coordination::types::{new_instance_id, WorkspaceScoreInputs};
use editor_fleet_core::coordination::{ModeSupervisor, WorkerStatus};
use editor_fleet_core::tools::{EchoToolExecutor, WorkspaceAdapter, WorkspaceInfo};

use crate::error::CliError;

/// Role override accepted on the command line
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ModeArg {
    /// Detect the role from the environment
    Auto,
    /// Always start as master
    Master,
    /// Always start as worker
    Worker,
    /// Always start standalone
    Standalone,
}

impl From<ModeArg> for ModeOverride {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Auto => Self::Auto,
            ModeArg::Master => Self::Master,
            ModeArg::Worker => Self::Worker,
            ModeArg::Standalone => Self::Standalone,
        }
    }
}

/// Arguments for the run command
#[derive(Args)]
pub struct RunArgs {
    /// Path to a configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Master surface port
    #[arg(long)]
    pub master_port: Option<u16>,

    /// First port of the worker range
    #[arg(long)]
    pub worker_port_start: Option<u16>,

    /// Last port of the worker range
    #[arg(long)]
    pub worker_port_end: Option<u16>,

    /// Force a role instead of detecting one
    #[arg(long, value_enum)]
    pub mode: Option<ModeArg>,

    /// Workspace name (defaults to the directory name)
    #[arg(long)]
    pub workspace_name: Option<String>,

    /// Workspace root path (defaults to the current directory)
    #[arg(long)]
    pub workspace_path: Option<PathBuf>,

    /// Disable coordination entirely and run standalone
    #[arg(long)]
    pub no_coordination: bool,
}

/// Execute the run command
pub async fn execute(args: RunArgs, verbose: bool) -> anyhow::Result<()> {
    let mut loader = ConfigLoader::new();
    if let Some(path) = &args.config {
        loader = loader.with_file(path);
    }
    let mut config = loader.load().map_err(|e| CliError::ConfigurationError {
        message: e.to_string(),
        suggestion: "check the configuration file and EDITOR_FLEET_* variables".to_string(),
        source: Some(e),
    })?;

    // CLI arguments take precedence over every other source.
    if let Some(port) = args.master_port {
        config.coordination.master_port = port;
    }
    if let Some(port) = args.worker_port_start {
        config.coordination.worker_port_start = port;
    }
    if let Some(port) = args.worker_port_end {
        config.coordination.worker_port_end = port;
    }
    if let Some(mode) = args.mode {
        config.coordination.mode = mode.into();
    }
    if args.no_coordination {
        config.coordination.enabled = false;
    }
    config
        .coordination
        .ensure_valid()
        .map_err(|message| CliError::ConfigurationError {
            message,
            suggestion: "master port must lie outside a non-empty worker range".to_string(),
            source: None,
        })?;

    let workspace_path = args
        .workspace_path
        .or_else(|| config.workspace.path.clone().map(PathBuf::from))
        .map_or_else(
            || std::env::current_dir().context("cannot determine current directory"),
            Ok,
        )?;
    let workspace_name = args
        .workspace_name
        .or_else(|| config.workspace.name.clone())
        .unwrap_or_else(|| {
            workspace_path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "workspace".to_string())
        });

    let adapter = Arc::new(FsWorkspaceAdapter::discover(
        workspace_name.clone(),
        workspace_path.clone(),
    ));
    if verbose {
        let inputs = adapter.score_inputs();
        info!(
            workspace = %workspace_name,
            path = %workspace_path.display(),
            file_count = inputs.file_count,
            git_commits = inputs.git_commits,
            "resolved workspace"
        );
    }

    let instance_id = new_instance_id();
    info!(%instance_id, workspace = %workspace_name, "starting instance");

    let supervisor = ModeSupervisor::new(
        config.coordination,
        instance_id,
        Arc::new(EchoToolExecutor),
        adapter,
    );

    let mut roles = supervisor.role_watch();
    tokio::spawn(async move {
        while roles.changed().await.is_ok() {
            info!(role = %*roles.borrow(), "role changed");
        }
    });

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            signal.cancel();
        }
    });

    supervisor.run(shutdown).await.context("instance failed")?;
    Ok(())
}

/// Workspace adapter backed by the filesystem and git history.
///
/// The editor-integration layer normally supplies richer inputs; when the
/// fleet runs headless this adapter derives the score from what the
/// filesystem can tell.
struct FsWorkspaceAdapter {
    info: WorkspaceInfo,
    score: WorkspaceScoreInputs,
}

/// Stop counting workspace files past this bound.
const FILE_COUNT_CAP: u64 = 10_000;

impl FsWorkspaceAdapter {
    fn discover(name: String, path: PathBuf) -> Self {
        let file_count = count_files(&path, FILE_COUNT_CAP);
        let git_commits = count_git_commits(&path);
        let path_display = path.to_string_lossy().into_owned();
        Self {
            info: WorkspaceInfo {
                name,
                path: path_display.clone(),
                kind: "folder".to_string(),
                folders: vec![path_display],
            },
            score: WorkspaceScoreInputs {
                file_count,
                git_commits,
                recent_activity: 0.0,
            },
        }
    }
}

impl WorkspaceAdapter for FsWorkspaceAdapter {
    fn workspace_info(&self) -> WorkspaceInfo {
        self.info.clone()
    }

    fn score_inputs(&self) -> WorkspaceScoreInputs {
        self.score
    }

    fn worker_status(&self) -> WorkerStatus {
        WorkerStatus::Idle
    }
}

fn count_files(root: &std::path::Path, cap: u64) -> u64 {
    let mut count = 0;
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name == ".git" || name == "node_modules" || name == "target" {
                continue;
            }
            if path.is_dir() {
                pending.push(path);
            } else {
                count += 1;
                if count >= cap {
                    return cap;
                }
            }
        }
    }
    count
}

fn count_git_commits(root: &std::path::Path) -> u64 {
    std::process::Command::new("git")
        .arg("-C")
        .arg(root)
        .args(["rev-list", "--count", "HEAD"])
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| {
            String::from_utf8(output.stdout)
                .ok()?
                .trim()
                .parse::<u64>()
                .ok()
        })
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_files_respects_cap() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..5 {
            std::fs::write(dir.path().join(format!("f{i}.txt")), "x").unwrap();
        }
        assert_eq!(count_files(dir.path(), 3), 3);
        assert_eq!(count_files(dir.path(), 100), 5);
    }

    #[test]
    fn test_count_files_skips_vcs_dirs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join(".git").join("HEAD"), "ref").unwrap();
        std::fs::write(dir.path().join("main.rs"), "fn main() {}").unwrap();
        assert_eq!(count_files(dir.path(), 100), 1);
    }

    #[test]
    fn test_adapter_reports_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let adapter =
            FsWorkspaceAdapter::discover("demo".to_string(), dir.path().to_path_buf());
        assert_eq!(adapter.workspace_info().name, "demo");
        assert_eq!(adapter.worker_status(), WorkerStatus::Idle);
    }
}
