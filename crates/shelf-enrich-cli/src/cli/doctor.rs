//! Environment readiness check.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use shelf_enrich::identity::{IdentityControl, TorControl};
use shelf_enrich::{ControlAuth, TorConfig};
use tokio::net::TcpStream;

use crate::config::{load_config, resolve_config_path};

const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Check the config file, the SOCKS port and the control port.
pub async fn run(config_path: Option<PathBuf>) -> Result<()> {
    println!("shelf-enrich Doctor");
    println!("===================");
    println!();

    match resolve_config_path(config_path.as_deref()) {
        Some(path) => println!("Config: {}", path.display()),
        None => println!("Config: built-in defaults"),
    }
    let config = match load_config(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            println!("[!!] {e:#}");
            println!();
            print_status(false);
            return Ok(());
        }
    };
    let config_ok = match config.validate() {
        Ok(()) => {
            println!("[OK] Configuration is valid");
            true
        }
        Err(e) => {
            println!("[!!] {e}");
            false
        }
    };
    println!();

    if !config.tor.enabled {
        println!("[--] Tor disabled in configuration, requests go out directly");
        println!();
        print_status(ready(config_ok, false, false, false));
        return Ok(());
    }

    let socks_ok = port_open(&config.tor.socks_addr).await;
    if socks_ok {
        println!("[OK] SOCKS proxy reachable at {}", config.tor.socks_addr);
    } else {
        println!(
            "[!!] SOCKS proxy NOT reachable at {}. Is tor running?",
            config.tor.socks_addr
        );
    }

    println!("     Control auth: {}", describe_auth(&config.tor));
    let control = TorControl::new(&config.tor);
    let control_ok = match control.verify().await {
        Ok(()) => {
            println!(
                "[OK] Control port {} authenticated, circuit established",
                control.addr()
            );
            true
        }
        Err(e) => {
            println!("[!!] Control port {}: {e}", control.addr());
            false
        }
    };

    println!();
    let tor_ok = socks_ok && control_ok;
    print_status(ready(config_ok, true, socks_ok, control_ok));
    if !tor_ok {
        println!("  Enable `ControlPort 9051` and an auth method in torrc, or run with --no-tor.");
    }
    Ok(())
}

/// Overall verdict. The Tor checks only count when Tor is enabled.
fn ready(config_ok: bool, tor_enabled: bool, socks_ok: bool, control_ok: bool) -> bool {
    config_ok && (!tor_enabled || (socks_ok && control_ok))
}

fn print_status(ready: bool) {
    if ready {
        println!("Status: READY");
    } else {
        println!("Status: NOT READY");
    }
}

async fn port_open(addr: &str) -> bool {
    matches!(
        tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

fn describe_auth(tor: &TorConfig) -> String {
    match &tor.auth {
        ControlAuth::Auto => "discovered via PROTOCOLINFO".to_string(),
        ControlAuth::None => "none".to_string(),
        ControlAuth::Password { .. } => "password".to_string(),
        ControlAuth::Cookie { path } => format!("cookie ({})", path.display()),
    }
}
