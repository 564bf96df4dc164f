use anyhow::{Context, Result};
use clap::Parser;
use std::fs;
use std::io;
use std::net::Ipv4Addr;
#[cfg(any(target_os = "linux", target_os = "macos"))]
use std::process::Command;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use tunrelay_stack::config::parse_cidr;
use tunrelay_stack::{Relay, RelayConfig, SystemConnector, TunDevice};

/// tunrelay - relay TUN traffic through ordinary sockets
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// Test configuration and exit
    #[arg(short, long)]
    test_config: bool,

    /// Physical interface to bind outbound sockets to
    #[arg(long)]
    bind_interface: Option<String>,

    /// Install the configured routes through the tunnel
    #[arg(long)]
    add_route: bool,

    /// Override the configured log level
    #[arg(long)]
    log_level: Option<String>,
}

struct TunRs(tun_rs::AsyncDevice);

impl TunDevice for TunRs {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.recv(buf).await
    }

    async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        self.0.send(buf).await
    }
}

fn load_config(path: Option<&str>) -> Result<RelayConfig> {
    let config = match path {
        Some(path) => {
            let content = fs::read_to_string(path).with_context(|| format!("reading {}", path))?;
            serde_yaml::from_str(&content).with_context(|| format!("parsing {}", path))?
        }
        None => RelayConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{level},tunrelay_stack={level}")));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init()
        .ok();
}

fn add_routes(config: &RelayConfig) -> Result<()> {
    for route in &config.tun.routes {
        let (addr, prefix) = parse_cidr(route)?;
        let cidr = format!("{}/{}", addr, prefix);

        #[cfg(target_os = "linux")]
        let output = Command::new("ip")
            .args(["route", "add", &cidr, "dev", &config.tun.name])
            .output();
        #[cfg(target_os = "macos")]
        let output = Command::new("route")
            .args(["-n", "add", "-net", &cidr, "-interface", &config.tun.name])
            .output();
        #[cfg(not(any(target_os = "linux", target_os = "macos")))]
        let output: io::Result<std::process::Output> =
            Err(io::Error::new(io::ErrorKind::Unsupported, "route setup not supported"));

        match output {
            Ok(out) if out.status.success() => info!("Route {} via {}", cidr, config.tun.name),
            Ok(out) => warn!(
                "Failed to add route {}: {}",
                cidr,
                String::from_utf8_lossy(&out.stderr).trim()
            ),
            Err(e) => warn!("Failed to add route {}: {}", cidr, e),
        }
    }
    Ok(())
}

/// `resolvectl` arguments pointing the tunnel link at the configured resolvers.
fn dns_command_args(config: &RelayConfig) -> Vec<String> {
    let mut args = vec!["dns".to_string(), config.tun.name.clone()];
    args.extend(config.tun.dns.iter().map(|server| server.to_string()));
    args
}

fn configure_dns(config: &RelayConfig) {
    if config.tun.dns.is_empty() {
        return;
    }

    #[cfg(target_os = "linux")]
    let output = Command::new("resolvectl").args(dns_command_args(config)).output();
    #[cfg(not(target_os = "linux"))]
    let output: io::Result<std::process::Output> = Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("set resolvers manually: {:?}", dns_command_args(config)),
    ));

    match output {
        Ok(out) if out.status.success() => {
            info!("DNS servers {:?} set on {}", config.tun.dns, config.tun.name)
        }
        Ok(out) => warn!(
            "Failed to set DNS servers: {}",
            String::from_utf8_lossy(&out.stderr).trim()
        ),
        Err(e) => warn!("Failed to set DNS servers: {}", e),
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use futures::StreamExt;
    match signal_hook_tokio::Signals::new([
        signal_hook::consts::SIGINT,
        signal_hook::consts::SIGTERM,
    ]) {
        Ok(mut signals) => {
            signals.next().await;
        }
        Err(e) => {
            warn!("Signal handler unavailable ({}), falling back to Ctrl+C", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = load_config(args.config.as_deref())?;
    if let Some(level) = args.log_level {
        config.log_level = level;
    }

    if args.test_config {
        println!("Configuration test passed!");
        return Ok(());
    }

    init_logging(&config.log_level);

    let device = tun_rs::DeviceBuilder::new()
        .name(&config.tun.name)
        .ipv4(config.tun.address, config.tun.prefix_len, None::<Ipv4Addr>)
        .mtu(config.tun.mtu)
        .build_async()
        .with_context(|| format!("creating TUN device {}", config.tun.name))?;
    info!(
        "TUN device created: {} with address {}/{}",
        config.tun.name, config.tun.address, config.tun.prefix_len
    );

    if args.add_route {
        add_routes(&config)?;
        configure_dns(&config);
    } else if !config.tun.dns.is_empty() {
        info!("Tunnel resolvers (not applied without --add-route): {:?}", config.tun.dns);
    }

    let mut connector = SystemConnector::new();
    if let Some(interface) = args.bind_interface {
        info!("Binding outbound sockets to {}", interface);
        connector = connector.with_bind_interface(interface);
    }

    let relay = Relay::start(&config, TunRs(device), Arc::new(connector))?;
    println!("tunrelay started on {}. Press Ctrl+C to stop.", config.tun.name);

    tokio::select! {
        _ = wait_for_signal() => info!("Shutdown requested"),
        _ = relay.stopped() => error!("Relay stopped unexpectedly"),
    }

    let stats = relay.stats();
    relay.stop().await;
    info!(
        "Relayed {} packets in, {} out; {} TCP connections, {} UDP sockets",
        stats.packets_from_device,
        stats.packets_to_device,
        stats.tcp_connections_total,
        stats.udp_sockets_total
    );
    println!("tunrelay stopped.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dns_command_lists_every_resolver() {
        let mut config = RelayConfig::default();
        config.tun.name = "tun9".to_string();
        config.tun.dns = vec![Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(9, 9, 9, 9)];
        assert_eq!(dns_command_args(&config), vec!["dns", "tun9", "1.1.1.1", "9.9.9.9"]);
    }

    #[test]
    fn test_dns_from_config_file() {
        let dir = std::env::temp_dir().join(format!("tunrelay-dns-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.yaml");
        fs::write(&path, "tun:\n  name: tun3\n  dns:\n    - 10.0.0.53\n").unwrap();

        let config = load_config(path.to_str()).unwrap();
        assert_eq!(dns_command_args(&config), vec!["dns", "tun3", "10.0.0.53"]);
        fs::remove_dir_all(&dir).unwrap();
    }
}
