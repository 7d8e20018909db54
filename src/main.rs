use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use orca_sync::backend::{ExecRequest, LogRequest, SyncContext, WatchScope};
use orca_sync::bus::EventBus;
use orca_sync::cache::CacheStore;
use orca_sync::cli::{CliArgs, Command, parse_ports, parse_target};
use orca_sync::config::SyncConfig;
use orca_sync::exec::{ExecKind, ExecSession};
use orca_sync::k8s::KubeBackend;
use orca_sync::logs::LogStreamSession;
use orca_sync::model::{ExecEvent, Keyed, LogEvent, NamespaceScope, PortForwardEvent, ResourceKind};
use orca_sync::port_forward::{PortForwardMonitor, PortForwardSession, PortForwardTarget};
use orca_sync::session::event_handler;
use orca_sync::shell::{ShellNegotiator, ShellOutcome, ShellTarget};
use orca_sync::watch::{ResourceWatchCache, WatchCallbacks};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::{Duration, MissedTickBehavior, interval};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const LIVENESS_POLL: Duration = Duration::from_millis(250);

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    init_tracing(&args.log_filter)?;

    let config = match &args.config {
        Some(path) => SyncConfig::load(path)?,
        None => {
            let (config, source) = SyncConfig::discover()?;
            if let Some(path) = source {
                debug!(path = %path.display(), "loaded sync config");
            }
            config
        }
    };

    let bus = EventBus::new();
    let backend = Arc::new(KubeBackend::new(bus.clone()));
    let cluster = args
        .context
        .clone()
        .unwrap_or_else(|| backend.current_context());
    let default_namespace = backend.default_namespace(&cluster).await?;

    if args.all_namespaces && !args.namespace.is_empty() {
        warn!("both --all-namespaces and --namespace were provided, using all namespaces");
    }
    let namespaces = resolve_namespace_scope(&args, &default_namespace);
    let namespace = primary_namespace(&args, &default_namespace);
    let ctx = SyncContext::new(backend, bus, config);

    match args.command {
        Command::Watch { kind } => run_watch(ctx, &cluster, &kind, namespaces).await,
        Command::Logs {
            pod,
            container,
            tail,
            once,
        } => {
            let request = LogRequest {
                cluster,
                namespace,
                target: pod,
                container,
                tail_lines: tail,
            };
            run_logs(ctx, request, once).await
        }
        Command::Shell { pod, container } => {
            let target = ShellTarget {
                cluster,
                namespace,
                pod,
                container,
            };
            run_shell(ctx, target).await
        }
        Command::Exec {
            pod,
            container,
            command,
        } => {
            let request = ExecRequest {
                cluster,
                namespace,
                target: pod,
                container,
                command,
                tty: false,
            };
            run_exec(ctx, request).await
        }
        Command::PortForward { target, ports } => {
            let (kind, name) = parse_target(&target)?;
            let (local_port, remote_port) = parse_ports(&ports)?;
            let target = PortForwardTarget {
                cluster,
                namespace,
                kind,
                target: name,
            };
            run_port_forward(ctx, target, local_port, remote_port).await
        }
    }
}

fn init_tracing(level_filter: &str) -> Result<()> {
    let filter = EnvFilter::try_new(level_filter)
        .or_else(|_| EnvFilter::try_new("info"))
        .context("failed to initialize tracing filter")?;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .with_writer(std::io::stderr)
        .try_init();

    Ok(())
}

fn resolve_namespace_scope(args: &CliArgs, default_namespace: &str) -> NamespaceScope {
    if args.all_namespaces {
        NamespaceScope::All
    } else if !args.namespace.is_empty() {
        NamespaceScope::named(args.namespace.iter().cloned())
    } else {
        NamespaceScope::named([default_namespace])
    }
}

/// Namespace for single-pod commands: the first `-n`, else the context default.
fn primary_namespace(args: &CliArgs, default_namespace: &str) -> String {
    args.namespace
        .first()
        .cloned()
        .unwrap_or_else(|| default_namespace.to_string())
}

async fn run_watch(
    ctx: SyncContext,
    cluster: &str,
    kind: &str,
    namespaces: NamespaceScope,
) -> Result<()> {
    let kind = ResourceKind::from_token(kind)
        .with_context(|| format!("unsupported resource kind '{kind}'"))?;
    let label = kind.token();
    let watch = ResourceWatchCache::<Value>::new(ctx, CacheStore::new());
    let callbacks = WatchCallbacks::new(
        move |items: &[Value]| {
            let mut out = std::io::stdout().lock();
            let _ = writeln!(out, "--- {} {label}", items.len());
            for key in items.iter().filter_map(|item| item.resource_key()) {
                let _ = writeln!(out, "{key}");
            }
        },
        |error| eprintln!("error: {error}"),
    );

    let subscription = watch
        .subscribe(WatchScope::new(cluster, label, namespaces), callbacks)
        .await;
    if subscription.channel_id().is_none() {
        warn!("live updates unavailable, showing the initial list only");
    }
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    subscription.dispose();
    Ok(())
}

async fn run_logs(ctx: SyncContext, request: LogRequest, once: bool) -> Result<()> {
    let logs = LogStreamSession::new(ctx, request);
    if once {
        print!("{}", logs.fetch_once().await?);
        return Ok(());
    }

    let handler = event_handler(|event: &LogEvent| {
        match event {
            LogEvent::LogLine { log } => println!("{log}"),
            LogEvent::LogError { error } => {
                eprintln!("log stream error: {}", error.as_deref().unwrap_or("unknown"))
            }
            LogEvent::LogCompleted => info!("log stream completed"),
        }
        Ok(())
    });
    logs.start_with(handler).await?;
    wait_while(|| logs.is_active()).await;
    logs.stop().await;
    match logs.last_error() {
        Some(error) => anyhow::bail!(error),
        None => Ok(()),
    }
}

fn print_exec_output(event: &ExecEvent) -> anyhow::Result<()> {
    match event {
        ExecEvent::Stdout { data } => {
            let mut out = std::io::stdout().lock();
            out.write_all(data.as_bytes())?;
            out.flush()?;
        }
        ExecEvent::Stderr { data } => {
            let mut err = std::io::stderr().lock();
            err.write_all(data.as_bytes())?;
            err.flush()?;
        }
        ExecEvent::Error { .. } | ExecEvent::Completed => {}
    }
    Ok(())
}

async fn run_shell(ctx: SyncContext, target: ShellTarget) -> Result<()> {
    let shell = ShellNegotiator::new(ctx);
    let outcome = shell
        .negotiate(&target, event_handler(print_exec_output))
        .await;
    let candidate = match outcome {
        ShellOutcome::Connected { candidate, .. } => candidate,
        ShellOutcome::Failed { reason, .. } => anyhow::bail!(reason),
    };
    info!(shell = %candidate.label(), "type commands, ctrl-d to exit");

    let session = shell.session();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut liveness = interval(LIVENESS_POLL);
    liveness.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            line = lines.next_line() => match line.context("failed to read stdin")? {
                Some(line) => session.send_line(&line).await?,
                None => break,
            },
            _ = liveness.tick() => {
                if !session.is_active() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    session.stop().await;
    Ok(())
}

async fn run_exec(ctx: SyncContext, request: ExecRequest) -> Result<()> {
    let exec = ExecSession::new(ExecKind, ctx);
    exec.start(request, event_handler(print_exec_output))
        .await?
        .context("exec session did not start")?;
    wait_while(|| exec.is_active()).await;
    let error = exec.last_error();
    exec.stop().await;
    match error {
        Some(error) => anyhow::bail!(error),
        None => Ok(()),
    }
}

async fn run_port_forward(
    ctx: SyncContext,
    target: PortForwardTarget,
    local_port: u16,
    remote_port: u16,
) -> Result<()> {
    let forward = PortForwardSession::new(ctx.clone(), target);
    let monitor = PortForwardMonitor::spawn(ctx, |forwards| {
        debug!(active = forwards.len(), "port-forwards refreshed");
    });
    let handler = event_handler(|event: &PortForwardEvent| {
        match event {
            PortForwardEvent::PfStdout { line } => println!("{line}"),
            PortForwardEvent::PfStderr { line } => eprintln!("{line}"),
            PortForwardEvent::PfError { .. } | PortForwardEvent::PfDone => {}
        }
        Ok(())
    });
    forward
        .start_with(local_port, remote_port, handler)
        .await?
        .context("port-forward did not start")?;

    wait_while(|| forward.running()).await;
    forward.stop().await;
    monitor.stop().await;
    match forward.last_error() {
        Some(error) => anyhow::bail!(error),
        None => Ok(()),
    }
}

/// Returns once `alive` turns false or ctrl-c is pressed.
async fn wait_while(alive: impl Fn() -> bool) {
    let mut ticker = interval(LIVENESS_POLL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if !alive() {
                    return;
                }
            }
            _ = tokio::signal::ctrl_c() => return,
        }
    }
}
