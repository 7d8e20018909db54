use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

#[derive(Debug, Clone, Parser)]
#[command(
    name = "orca-sync",
    version,
    about = "Headless Kubernetes watches, logs, shells and port-forwards."
)]
pub struct CliArgs {
    /// YAML config file (otherwise ORCA_SYNC_CONFIG, ./orca-sync.yaml, ~/.config/orca-sync/config.yaml)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// kubeconfig context to use instead of the current one
    #[arg(long)]
    pub context: Option<String>,

    /// Namespace to use; repeat to select several
    #[arg(short, long)]
    pub namespace: Vec<String>,

    /// Select all namespaces
    #[arg(short = 'A', long)]
    pub all_namespaces: bool,

    /// tracing filter (for example: info,debug,trace)
    #[arg(long, default_value = "info")]
    pub log_filter: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Watch a resource kind and print the reconciled set on every change
    Watch {
        /// Resource kind, e.g. pods, deploy, svc
        kind: String,
    },
    /// Follow the logs of a pod
    Logs {
        pod: String,
        #[arg(short, long)]
        container: Option<String>,
        /// Lines of history to start from
        #[arg(long)]
        tail: Option<u32>,
        /// Print the current tail and exit
        #[arg(long)]
        once: bool,
    },
    /// Open an interactive shell, trying each configured shell in turn
    Shell {
        pod: String,
        #[arg(short, long)]
        container: Option<String>,
    },
    /// Run a command in a pod
    Exec {
        pod: String,
        #[arg(short, long)]
        container: Option<String>,
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
    /// Forward a local port to a pod, service or workload
    PortForward {
        /// `name` for a pod, or `kind/name` (svc/postgres, deploy/api)
        target: String,
        /// `local:remote`, or a single port used for both
        ports: String,
    },
}

/// Splits `kind/name`; a bare name is a pod.
pub fn parse_target(raw: &str) -> Result<(String, String)> {
    let (kind, name) = match raw.split_once('/') {
        Some((kind, name)) => (kind.trim(), name.trim()),
        None => ("pod", raw.trim()),
    };
    if kind.is_empty() || name.is_empty() {
        anyhow::bail!("invalid target '{raw}', expected name or kind/name");
    }
    Ok((kind.to_string(), name.to_string()))
}

pub fn parse_ports(raw: &str) -> Result<(u16, u16)> {
    let (local, remote) = raw.split_once(':').unwrap_or((raw, raw));
    let local = local
        .trim()
        .parse::<u16>()
        .with_context(|| format!("invalid local port in '{raw}'"))?;
    let remote = remote
        .trim()
        .parse::<u16>()
        .with_context(|| format!("invalid remote port in '{raw}'"))?;
    if remote == 0 {
        anyhow::bail!("remote port must be non-zero");
    }
    Ok((local, remote))
}
