use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use socksgate_proxy::{ProxyConfig, ProxyServer};
use socksgate_settings::{ConfigLoader, ProxySettings, SocksgateConfig};
use tracing::info;

use crate::cli::RunArgs;
use crate::error::CliError;

/// Resolve the effective config for `run`.
///
/// `--no-config` skips global/project config files but `--config <extra>` still applies.
pub fn load_config(args: &RunArgs, cwd: &Path) -> Result<SocksgateConfig, CliError> {
    let mut config = if args.no_config {
        SocksgateConfig::default()
    } else {
        ConfigLoader::load(cwd)
    };
    if let Some(ref extra) = args.extra_config {
        let extra_cfg = SocksgateConfig::load(extra)?;
        config = config.merge(extra_cfg);
    }
    Ok(config)
}

pub async fn run(args: RunArgs, config: SocksgateConfig) -> Result<(), CliError> {
    let proxy_config = build_proxy_config(&config.proxy, &args)?;
    let handle = ProxyServer::new(proxy_config).start().await?;

    eprintln!("socksgate: SOCKS5 proxy on {}", handle.socks5_addr());
    if let Some(addr) = handle.http_addr() {
        eprintln!("socksgate: HTTP tunnel on {addr}");
    }

    tokio::signal::ctrl_c().await?;
    info!("interrupt received, shutting down");
    eprintln!("socksgate: shutting down");

    handle.shutdown().await?;
    Ok(())
}

/// Settings file values first, command-line flags on top.
fn build_proxy_config(settings: &ProxySettings, args: &RunArgs) -> Result<ProxyConfig, CliError> {
    let mut config = ProxyConfig::default();

    let host = args
        .bind_host
        .as_deref()
        .or(settings.bind_host.as_deref());
    let ip = match host {
        Some(host) => host
            .parse::<IpAddr>()
            .map_err(|source| CliError::InvalidBindHost {
                host: host.to_string(),
                source,
            })?,
        None => config.socks5_bind_addr.ip(),
    };

    let socks5_port = args
        .socks5_port
        .or(settings.socks5_port)
        .unwrap_or(config.socks5_bind_addr.port());
    config.socks5_bind_addr = SocketAddr::new(ip, socks5_port);

    let http_enabled = !args.no_http && settings.http_enabled.unwrap_or(true);
    config.http_bind_addr = if http_enabled {
        let default_port = config.http_bind_addr.map_or(443, |addr| addr.port());
        let port = args.http_port.or(settings.http_port).unwrap_or(default_port);
        Some(SocketAddr::new(ip, port))
    } else {
        None
    };

    if let Some(secs) = settings.dns_cache_ttl_secs {
        config.dns_cache_ttl = Duration::from_secs(secs);
    }
    if let Some(secs) = settings.idle_timeout_secs {
        config.idle_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = settings.pool_cleanup_interval_secs {
        config.pool_cleanup_interval = Duration::from_secs(secs.max(1));
    }
    if let Some(secs) = settings.connect_timeout_secs {
        config.connect_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = settings.direct_connect_timeout_secs {
        config.direct_connect_timeout = Duration::from_secs(secs);
    }
    if let Some(grace) = settings.shutdown_grace_secs {
        config.shutdown_grace = Duration::from_secs(grace);
    }
    config.connection_pooling = !args.no_pool && settings.connection_pooling.unwrap_or(true);

    Ok(config)
}
