use std::path::PathBuf;

use socksgate_proxy::{ProxyConfig, ProxyServer};
use socksgate_settings::{ConfigLoader, SocksgateConfig};

use crate::error::CliError;

pub async fn check(cwd: PathBuf) -> Result<(), CliError> {
    let mut failed = 0;

    // 1. Platform info
    println!("Platform: {}", std::env::consts::OS);
    println!("Architecture: {}", std::env::consts::ARCH);

    // 2. Proxy smoke-test on loopback with ephemeral ports
    print!("Proxy: ");
    match ProxyServer::new(ProxyConfig::loopback()).start().await {
        Ok(handle) => {
            let socks5 = handle.socks5_addr();
            match handle.shutdown().await {
                Ok(()) => println!("OK (SOCKS5 listener bound on {socks5})"),
                Err(e) => {
                    println!("FAIL (shutdown): {e}");
                    failed += 1;
                }
            }
        }
        Err(e) => {
            println!("FAIL (start): {e}");
            failed += 1;
        }
    }

    // 3. Config
    let global_path = ConfigLoader::global_config_path();
    let project_path = ConfigLoader::project_config_path(&cwd);

    println!("\nConfig files:");
    if let Some(ref path) = global_path {
        let status = if path.exists() { "found" } else { "not found" };
        println!("  {} ({})", path.display(), status);
    } else {
        println!("  global: n/a (home directory not available)");
    }
    let status = if project_path.exists() { "found" } else { "not found" };
    println!("  {} ({})", project_path.display(), status);

    // The loader skips unparsable files, so parse each present file here to report it.
    let mut bad_files = 0;
    for path in global_path.iter().chain(std::iter::once(&project_path)) {
        if !path.exists() {
            continue;
        }
        if let Err(e) = SocksgateConfig::load(path) {
            println!("Config {}: FAIL: {e}", path.display());
            bad_files += 1;
        }
    }
    if bad_files == 0 {
        println!("Config loaded: OK");
    }

    failed += bad_files;
    if failed > 0 {
        return Err(CliError::ChecksFailed { failed });
    }

    Ok(())
}
