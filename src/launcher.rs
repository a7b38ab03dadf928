//! Runs a whole experiment: one server and several clients as child
//! processes of this binary, for a fixed time.

use crate::config::Config;
use crate::journal::{client_log_name, SERVER_LOG};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// How long a child gets to exit after SIGTERM before it is killed.
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Remove journals left over from a previous run.
pub fn clear_logs(dir: &Path, clients: u64) -> io::Result<()> {
    let names = std::iter::once(SERVER_LOG.to_string()).chain((1..=clients).map(client_log_name));
    for name in names {
        let path = dir.join(name);
        match std::fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "Removed old log"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Arguments that make a child see the same configuration as this process.
fn shared_args(config: &Config) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(path) = &config.config_path {
        args.push("--config".to_string());
        args.push(path.display().to_string());
    }
    args.push("--log-dir".to_string());
    args.push(config.log_dir.display().to_string());
    args.push("--log-level".to_string());
    args.push(config.log_level.clone());
    args
}

fn spawn_role(exe: &PathBuf, config: &Config, role: &[String]) -> io::Result<Child> {
    Command::new(exe)
        .args(shared_args(config))
        .args(role)
        .kill_on_drop(true)
        .spawn()
}

/// Ask a child to stop, escalating to a kill after the grace period.
async fn terminate(name: &str, mut child: Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: `pid` is our own child and has not been reaped yet, since
        // `child` still owns it.
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if rc != 0 {
            debug!(name, pid, error = %io::Error::last_os_error(), "SIGTERM failed");
        }
    }

    match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
        Ok(Ok(status)) => debug!(name, %status, "Process exited"),
        Ok(Err(e)) => warn!(name, error = %e, "Failed to wait for process"),
        Err(_) => {
            warn!(name, "Process ignored SIGTERM, killing it");
            if let Err(e) = child.kill().await {
                warn!(name, error = %e, "Failed to kill process");
            }
        }
    }
}

/// Start the server, then the clients, run for the configured time (or until
/// `stop` resolves), then stop clients before the server.
pub async fn launch<F>(config: &Config, stop: F) -> io::Result<()>
where
    F: std::future::Future<Output = ()>,
{
    let settings = &config.launch;
    clear_logs(&config.log_dir, settings.clients)?;

    let exe = std::env::current_exe()?;
    let server = spawn_role(&exe, config, &["server".to_string()])?;
    info!(pid = server.id(), "Started server");
    tokio::time::sleep(settings.startup_delay).await;

    let mut clients = Vec::new();
    for client_id in 1..=settings.clients {
        tokio::time::sleep(settings.stagger).await;
        let child = spawn_role(
            &exe,
            config,
            &["client".to_string(), client_id.to_string()],
        )?;
        info!(client_id, pid = child.id(), "Started client");
        clients.push((client_id, child));
    }

    tokio::select! {
        _ = tokio::time::sleep(settings.duration) => {
            info!(duration_secs = settings.duration.as_secs(), "Run finished");
        }
        _ = stop => info!("Stopping early"),
    }

    for (client_id, child) in clients {
        terminate(&format!("client {client_id}"), child).await;
    }
    terminate("server", server).await;

    info!("All processes terminated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CliArgs;
    use clap::Parser;

    #[test]
    fn test_clear_logs_removes_only_run_files() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["server.log", "client_1.log", "client_2.log", "client_3.log", "notes.txt"] {
            std::fs::write(dir.path().join(name), "x").unwrap();
        }

        clear_logs(dir.path(), 2).unwrap();

        assert!(!dir.path().join("server.log").exists());
        assert!(!dir.path().join("client_1.log").exists());
        assert!(!dir.path().join("client_2.log").exists());
        assert!(dir.path().join("client_3.log").exists());
        assert!(dir.path().join("notes.txt").exists());

        // Missing files are fine.
        clear_logs(dir.path(), 2).unwrap();
    }

    #[test]
    fn test_children_inherit_settings() {
        let cli = CliArgs::try_parse_from([
            "lossy-pingpong",
            "--log-dir",
            "/tmp/run",
            "--log-level",
            "debug",
            "launch",
        ])
        .unwrap();
        let config = Config::from_args(cli).unwrap();

        assert_eq!(
            shared_args(&config),
            vec!["--log-dir", "/tmp/run", "--log-level", "debug"]
        );
    }
}
