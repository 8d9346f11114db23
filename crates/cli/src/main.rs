// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Devtunnel Host Contributors

// Devtunnel Host - CLI Client
// Command-line interface for hosting dev tunnels through the daemon

mod config;

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use comfy_table::{Attribute, Cell, Color, ContentArrangement, Table};
use indicatif::{ProgressBar, ProgressStyle};

use devtunnel_host_common::{
    DaemonClient, EventListener, HostEvent, HostSummary, LoginPlatform, SessionState,
};

use config::{CliConfig, CliOverrides};

#[derive(Parser)]
#[command(name = "devtunnel-host")]
#[command(about = "Dev tunnel host CLI", long_about = None)]
#[command(version)]
struct Cli {
    /// Daemon host (overrides cli.toml)
    #[arg(long, global = true)]
    daemon_host: Option<String>,

    /// Daemon port (overrides cli.toml)
    #[arg(long, global = true)]
    daemon_port: Option<u16>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in through the devtunnel helper
    Login {
        /// github, github-code, aad or aad-code
        #[arg(short, long, default_value = "github")]
        provider: LoginPlatform,
    },

    /// Show the signed-in user and account limits
    Whoami,

    /// List relay clusters
    Clusters,

    /// Start hosting a tunnel
    Start {
        /// Tunnel id
        tunnel_id: String,

        /// Cluster the tunnel lives in (daemon default if omitted)
        #[arg(short, long)]
        cluster: Option<String>,

        /// Stay attached until the host stops
        #[arg(short, long)]
        wait: bool,
    },

    /// Stop hosting a tunnel
    Stop {
        tunnel_id: String,
    },

    /// Show host status
    Status {
        /// Tunnel id (optional, shows all if not specified)
        tunnel_id: Option<String>,
    },

    /// Re-read the tunnel's ports and reconcile forwarders
    Refresh {
        tunnel_id: String,
    },

    /// Stream daemon events
    Watch {
        /// Optional tunnel id to filter by
        tunnel_id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    let config = CliConfig::load()?.apply(CliOverrides {
        daemon_host: cli.daemon_host,
        daemon_port: cli.daemon_port,
    });
    if !config.is_local() {
        eprintln!(
            "{}",
            format!(
                "Warning: daemon host {} is not a loopback address; the daemon API is unauthenticated",
                config.daemon_config.daemon_host
            )
            .yellow()
        );
    }
    let client = DaemonClient::new(config.daemon_config)?;

    client.health().await.with_context(|| {
        format!(
            "Daemon is not reachable at {} (is devtunnel-hostd running?)",
            client.base_url()
        )
    })?;

    match cli.command {
        Commands::Login { provider } => login(&client, provider).await?,
        Commands::Whoami => whoami(&client).await?,
        Commands::Clusters => clusters(&client).await?,
        Commands::Start {
            tunnel_id,
            cluster,
            wait,
        } => start_host(&client, &tunnel_id, cluster, wait).await?,
        Commands::Stop { tunnel_id } => stop_host(&client, &tunnel_id).await?,
        Commands::Status { tunnel_id } => status(&client, tunnel_id).await?,
        Commands::Refresh { tunnel_id } => refresh(&client, &tunnel_id).await?,
        Commands::Watch { tunnel_id } => watch_events(client, tunnel_id).await?,
    }

    Ok(())
}

fn spinner(message: impl Into<String>) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
        pb.set_style(style);
    }
    pb.set_message(message.into());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

fn not_logged_in_hint(err: devtunnel_host_common::Error) -> anyhow::Error {
    if err.is_not_logged_in() {
        anyhow::anyhow!("{} (run 'devtunnel-host login' first)", err)
    } else {
        err.into()
    }
}

async fn login(client: &DaemonClient, provider: LoginPlatform) -> Result<()> {
    // Subscribe first so no helper output is missed
    let mut events = EventListener::new(client.clone()).connect().await?;

    let pb = spinner(format!("Waiting for {} login to complete...", provider));
    let printer = pb.clone();
    let output = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let HostEvent::LoginOutput { line, .. } = event {
                printer.println(format!("  {}", line));
            }
        }
    });

    let result = client.login(provider).await;
    output.abort();
    pb.finish_and_clear();

    let status = result?;
    println!(
        "{}",
        format!(
            "✓ Logged in with {}",
            status.provider.as_deref().unwrap_or("unknown provider")
        )
        .green()
        .bold()
    );
    Ok(())
}

async fn whoami(client: &DaemonClient) -> Result<()> {
    let user = client.user().await?;
    if !user.logged_in {
        println!("{}", "Not logged in".yellow());
        return Ok(());
    }

    println!(
        "Logged in with {}",
        user.provider.as_deref().unwrap_or("unknown provider").cyan()
    );

    let limits = client.limits().await.map_err(not_logged_in_hint)?;
    if limits.is_empty() {
        return Ok(());
    }

    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(header(&["Limit", "Used", "Max"]));
    for limit in limits {
        table.add_row(vec![
            Cell::new(limit.name),
            Cell::new(limit.current_value),
            Cell::new(limit.limit),
        ]);
    }
    println!();
    println!("{}", table);
    Ok(())
}

async fn clusters(client: &DaemonClient) -> Result<()> {
    let clusters = client.clusters().await.map_err(not_logged_in_hint)?;

    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(header(&["Cluster", "Location", "URI"]));
    for cluster in &clusters {
        table.add_row(vec![
            Cell::new(&cluster.cluster_id).fg(Color::Green),
            Cell::new(cluster.azure_location.as_deref().unwrap_or("-")),
            Cell::new(cluster.uri.as_deref().unwrap_or("-")).fg(Color::DarkGrey),
        ]);
    }
    println!();
    println!("{}", table);
    println!();
    println!("{} cluster(s) found", clusters.len().to_string().cyan());
    Ok(())
}

async fn start_host(
    client: &DaemonClient,
    tunnel_id: &str,
    cluster: Option<String>,
    wait: bool,
) -> Result<()> {
    let events = if wait {
        Some(EventListener::new(client.clone()).connect().await?)
    } else {
        None
    };

    let pb = spinner(format!("Starting host for tunnel {}", tunnel_id));
    let result = client.start_host(tunnel_id, cluster).await;
    pb.finish_and_clear();

    let summary = result.map_err(not_logged_in_hint)?;
    announce_connected(&summary);

    let Some(mut events) = events else {
        return Ok(());
    };

    println!(
        "{}",
        "Hosting. Press Ctrl+C to stop (or use 'devtunnel-host stop')".dimmed()
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!();
                stop_host(client, tunnel_id).await?;
                return Ok(());
            }
            event = events.recv() => {
                let Some(event) = event else {
                    anyhow::bail!("Lost the daemon event stream");
                };
                if event.tunnel_id() != Some(tunnel_id) {
                    continue;
                }
                print_event(&event);
                if let HostEvent::Stopped { superseded, .. } = event {
                    if superseded {
                        anyhow::bail!("Tunnel {} is now hosted by another connection", tunnel_id);
                    }
                    return Ok(());
                }
            }
        }
    }
}

fn announce_connected(summary: &HostSummary) {
    println!();
    println!(
        "{}",
        format!(
            "✓ Hosting tunnel {} on cluster {} ({})",
            summary.tunnel_id,
            summary.cluster_id,
            summary.protocol.as_deref().unwrap_or("relay")
        )
        .green()
        .bold()
    );
    for forwarded in &summary.forwarded_ports {
        println!("  port {} → {}", forwarded.port, forwarded.target);
    }
    println!();
}

async fn stop_host(client: &DaemonClient, tunnel_id: &str) -> Result<()> {
    println!("{}", format!("Stopping host for tunnel {}", tunnel_id).yellow());
    client.stop_host(tunnel_id).await?;
    println!("{}", "✓ Host stopped".green().bold());
    Ok(())
}

async fn status(client: &DaemonClient, tunnel_id: Option<String>) -> Result<()> {
    let hosts = match tunnel_id {
        Some(id) => match client.host_status(&id).await? {
            Some(summary) => vec![summary],
            None => {
                println!("{}", format!("Tunnel {} is not being hosted", id).yellow());
                return Ok(());
            }
        },
        None => client.list_hosts().await?,
    };

    if hosts.is_empty() {
        println!("{}", "No tunnels are being hosted".dimmed());
        return Ok(());
    }

    print_hosts_table(&hosts);
    Ok(())
}

async fn refresh(client: &DaemonClient, tunnel_id: &str) -> Result<()> {
    let summary = client
        .refresh_ports(tunnel_id)
        .await
        .map_err(not_logged_in_hint)?;
    println!("{}", "✓ Ports refreshed".green().bold());
    print_hosts_table(std::slice::from_ref(&summary));
    Ok(())
}

fn header(names: &[&str]) -> Vec<Cell> {
    names
        .iter()
        .map(|name| {
            Cell::new(name)
                .add_attribute(Attribute::Bold)
                .fg(Color::Cyan)
        })
        .collect()
}

fn state_color(state: SessionState) -> Color {
    match state {
        SessionState::Active => Color::Green,
        SessionState::Connecting | SessionState::Authenticating | SessionState::Reconnecting => {
            Color::Yellow
        }
        SessionState::Disconnected | SessionState::Closing | SessionState::Disposed => Color::Red,
    }
}

fn format_ports(summary: &HostSummary) -> String {
    if summary.forwarded_ports.is_empty() {
        return "-".to_string();
    }
    summary
        .forwarded_ports
        .iter()
        .map(|p| {
            if p.target.host == devtunnel_host_common::DEFAULT_TARGET_HOST && p.target.port == p.port
            {
                p.port.to_string()
            } else {
                format!("{} → {}", p.port, p.target)
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn print_hosts_table(hosts: &[HostSummary]) {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(header(&[
        "Tunnel", "Cluster", "State", "Protocol", "Ports", "Clients", "Since",
    ]));

    for host in hosts {
        let since = host.connected_at.unwrap_or(host.started_at);
        table.add_row(vec![
            Cell::new(&host.tunnel_id).fg(Color::Green),
            Cell::new(&host.cluster_id),
            Cell::new(host.state).fg(state_color(host.state)),
            Cell::new(host.protocol.as_deref().unwrap_or("-")),
            Cell::new(format_ports(host)),
            Cell::new(host.client_sessions),
            Cell::new(since.format("%Y-%m-%d %H:%M:%S")).fg(Color::DarkGrey),
        ]);
    }

    println!();
    println!("{}", table);
    println!();
}

/// One line per event; `None` for events that are not worth showing
fn describe_event(event: &HostEvent) -> Option<String> {
    let line = match event {
        HostEvent::Starting { tunnel_id, .. } => format!("Starting host for {tunnel_id}").cyan(),
        HostEvent::Connected {
            tunnel_id,
            protocol,
            ..
        } => format!("Tunnel {tunnel_id} connected ({protocol})").green(),
        HostEvent::Reconnecting {
            tunnel_id, attempt, ..
        } => format!("Tunnel {tunnel_id} reconnecting (attempt {attempt})").yellow(),
        HostEvent::PortForwarded {
            tunnel_id,
            port,
            target,
            ..
        } => format!("Tunnel {tunnel_id}: port {port} → {target}").normal(),
        HostEvent::PortRejected {
            tunnel_id, port, ..
        } => format!("Tunnel {tunnel_id}: relay rejected port {port}").yellow(),
        HostEvent::PortRemoved {
            tunnel_id, port, ..
        } => format!("Tunnel {tunnel_id}: port {port} removed").dimmed(),
        HostEvent::LoginOutput { line, .. } => line.dimmed(),
        HostEvent::Stopped {
            tunnel_id,
            reason,
            superseded: true,
            ..
        } => format!("Tunnel {tunnel_id} taken over by another host: {reason}").red(),
        HostEvent::Stopped {
            tunnel_id, reason, ..
        } => format!("Tunnel {tunnel_id} stopped: {reason}").yellow(),
        HostEvent::Error {
            tunnel_id: Some(tunnel_id),
            error,
            ..
        } => format!("Tunnel {tunnel_id} error: {error}").red(),
        HostEvent::Error { error, .. } => format!("Error: {error}").red(),
        HostEvent::Heartbeat { .. } => return None,
    };
    Some(line.to_string())
}

fn print_event(event: &HostEvent) {
    if let Some(line) = describe_event(event) {
        if matches!(event, HostEvent::Error { .. }) {
            eprintln!("{}", line);
        } else {
            println!("{}", line);
        }
    }
}

async fn watch_events(client: DaemonClient, tunnel_id: Option<String>) -> Result<()> {
    let mut events = EventListener::new(client).listen();

    println!(
        "{}",
        "Connected to event stream. Press Ctrl+C to stop.".dimmed()
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            event = events.recv() => {
                let Some(event) = event else {
                    return Ok(());
                };
                if let (Some(filter), Some(id)) = (&tunnel_id, event.tunnel_id()) {
                    if filter != id {
                        continue;
                    }
                }
                print_event(&event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use devtunnel_host_common::{ForwardTarget, ForwardedPort};

    fn summary(ports: Vec<ForwardedPort>) -> HostSummary {
        HostSummary {
            tunnel_id: "t1".to_string(),
            cluster_id: "asse".to_string(),
            state: SessionState::Active,
            protocol: None,
            forwarded_ports: ports,
            client_sessions: 0,
            started_at: Utc::now(),
            connected_at: None,
        }
    }

    #[test]
    fn test_parse_start_with_wait() {
        let cli = Cli::try_parse_from([
            "devtunnel-host",
            "start",
            "t1",
            "--cluster",
            "usw2",
            "--wait",
        ])
        .unwrap();
        match cli.command {
            Commands::Start {
                tunnel_id,
                cluster,
                wait,
            } => {
                assert_eq!(tunnel_id, "t1");
                assert_eq!(cluster.as_deref(), Some("usw2"));
                assert!(wait);
            }
            _ => panic!("expected start"),
        }
    }

    #[test]
    fn test_parse_login_provider_and_overrides() {
        let cli = Cli::try_parse_from([
            "devtunnel-host",
            "login",
            "--provider",
            "aad-code",
            "--daemon-port",
            "4000",
        ])
        .unwrap();
        assert_eq!(cli.daemon_port, Some(4000));
        assert!(matches!(
            cli.command,
            Commands::Login {
                provider: LoginPlatform::AadCode
            }
        ));
    }

    #[test]
    fn test_format_ports() {
        assert_eq!(format_ports(&summary(Vec::new())), "-");

        let ports = vec![
            ForwardedPort {
                port: 8080,
                target: ForwardTarget::new(devtunnel_host_common::DEFAULT_TARGET_HOST, 8080),
            },
            ForwardedPort {
                port: 9000,
                target: ForwardTarget::new("10.0.0.5", 22),
            },
        ];
        let formatted = format_ports(&summary(ports));
        assert!(formatted.starts_with("8080, 9000 → "));
        assert!(formatted.contains("10.0.0.5"));
    }

    #[test]
    fn test_heartbeats_are_not_described() {
        let event = HostEvent::Heartbeat {
            timestamp: Utc::now(),
        };
        assert!(describe_event(&event).is_none());

        let event = HostEvent::Stopped {
            tunnel_id: "t1".to_string(),
            reason: "too many connections".to_string(),
            superseded: true,
            timestamp: Utc::now(),
        };
        let line = describe_event(&event).unwrap();
        assert!(line.contains("another host"));
    }
}
