use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::model::ExecCandidate;

/// Timing and negotiation settings of the sync layer.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    pub list_timeout_ms: u64,
    pub watch_open_timeout_ms: u64,
    pub session_start_timeout_ms: u64,
    pub session_stop_timeout_ms: u64,
    pub unwatch_timeout_ms: u64,
    pub cache_ttl_ms: u64,
    pub shell_debounce_ms: u64,
    pub shell_grace_ms: u64,
    /// How long a shell that printed must stay alive before it counts as connected.
    pub shell_settle_ms: u64,
    pub port_forward_refresh_ms: u64,
    pub log_tail_lines: u32,
    pub shell_candidates: Vec<ExecCandidate>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            list_timeout_ms: 15_000,
            watch_open_timeout_ms: 8_000,
            session_start_timeout_ms: 10_000,
            session_stop_timeout_ms: 5_000,
            unwatch_timeout_ms: 2_000,
            cache_ttl_ms: 60_000,
            shell_debounce_ms: 250,
            shell_grace_ms: 6_000,
            shell_settle_ms: 300,
            port_forward_refresh_ms: 3_000,
            log_tail_lines: 200,
            shell_candidates: default_shell_candidates(),
        }
    }
}

impl SyncConfig {
    /// Loads the first config file found, falling back to defaults.
    pub fn discover() -> Result<(Self, Option<PathBuf>)> {
        match discover_config_path() {
            Some(path) => Ok((Self::load(&path)?, Some(path))),
            None => Ok((Self::default(), None)),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read sync config {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("failed to parse sync config {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let mut parsed: Self = serde_yaml::from_str(raw)?;
        parsed
            .shell_candidates
            .retain(|candidate| !candidate.command.is_empty());
        if parsed.shell_candidates.is_empty() {
            anyhow::bail!("shell_candidates must contain at least one non-empty command");
        }
        Ok(parsed)
    }

    pub fn list_timeout(&self) -> Duration {
        Duration::from_millis(self.list_timeout_ms)
    }

    pub fn watch_open_timeout(&self) -> Duration {
        Duration::from_millis(self.watch_open_timeout_ms)
    }

    pub fn session_start_timeout(&self) -> Duration {
        Duration::from_millis(self.session_start_timeout_ms)
    }

    pub fn session_stop_timeout(&self) -> Duration {
        Duration::from_millis(self.session_stop_timeout_ms)
    }

    pub fn unwatch_timeout(&self) -> Duration {
        Duration::from_millis(self.unwatch_timeout_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    pub fn shell_debounce(&self) -> Duration {
        Duration::from_millis(self.shell_debounce_ms)
    }

    pub fn shell_grace(&self) -> Duration {
        Duration::from_millis(self.shell_grace_ms)
    }

    pub fn shell_settle(&self) -> Duration {
        Duration::from_millis(self.shell_settle_ms)
    }

    pub fn port_forward_refresh(&self) -> Duration {
        Duration::from_millis(self.port_forward_refresh_ms.max(250))
    }
}

/// POSIX shells first: most container images are Linux based.
fn default_shell_candidates() -> Vec<ExecCandidate> {
    vec![
        ExecCandidate::new(["sh", "-l"]),
        ExecCandidate::new(["sh"]),
        ExecCandidate::new(["bash", "-l"]),
        ExecCandidate::new(["bash"]),
        ExecCandidate::new(["ash", "-l"]),
        ExecCandidate::new(["ash"]),
        ExecCandidate::new(["pwsh", "-NoLogo"]),
        ExecCandidate::new(["powershell.exe", "-NoLogo"]),
        ExecCandidate::new(["cmd.exe"]),
    ]
}

fn discover_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("ORCA_SYNC_CONFIG")
        && !path.trim().is_empty()
    {
        return Some(PathBuf::from(path));
    }

    let cwd_candidates = [PathBuf::from("orca-sync.yaml"), PathBuf::from("orca-sync.yml")];
    for candidate in cwd_candidates {
        if candidate.exists() {
            return Some(candidate);
        }
    }

    if let Ok(home) = std::env::var("HOME") {
        let candidate = PathBuf::from(home).join(".config/orca-sync/config.yaml");
        if candidate.exists() {
            return Some(candidate);
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_yaml_keeps_defaults() {
        let config = SyncConfig::parse("cache_ttl_ms: 5000\nshell_grace_ms: 1000\n")
            .expect("config should parse");
        assert_eq!(config.cache_ttl(), Duration::from_secs(5));
        assert_eq!(config.shell_grace(), Duration::from_secs(1));
        assert_eq!(config.list_timeout_ms, 15_000);
        assert_eq!(config.shell_settle(), Duration::from_millis(300));
        assert_eq!(config.shell_candidates[0], ExecCandidate::new(["sh", "-l"]));
    }

    #[test]
    fn shell_candidates_override_in_order() {
        let config =
            SyncConfig::parse("shell_candidates:\n  - [bash, -l]\n  - []\n  - [sh]\n").expect("parse");
        assert_eq!(
            config.shell_candidates,
            vec![ExecCandidate::new(["bash", "-l"]), ExecCandidate::new(["sh"])]
        );
    }

    #[test]
    fn empty_candidate_list_is_rejected() {
        assert!(SyncConfig::parse("shell_candidates: []\n").is_err());
    }

    #[test]
    fn posix_shells_come_before_windows_shells() {
        let candidates = SyncConfig::default().shell_candidates;
        let first_windows = candidates
            .iter()
            .position(|candidate| candidate.command[0].ends_with(".exe") || candidate.command[0] == "pwsh")
            .expect("windows candidate");
        assert!(
            candidates[..first_windows]
                .iter()
                .all(|candidate| ["sh", "bash", "ash"].contains(&candidate.command[0].as_str()))
        );
    }

    #[test]
    fn blank_file_means_defaults() {
        assert_eq!(SyncConfig::parse("  \n").expect("parse"), SyncConfig::default());
    }
}
