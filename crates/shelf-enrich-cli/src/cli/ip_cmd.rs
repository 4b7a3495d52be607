//! `shelf-enrich ip`: show the address remote sites see.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use shelf_enrich::identity::IP_INFO_URL;
use shelf_enrich::{whoami, IdentityProvider};

use crate::config::{load_config, Overrides, CONTROL_PASSWORD_ENV};

#[derive(Args, Debug, Clone)]
pub struct IpArgs {
    /// Request a new identity and print the address again.
    #[arg(long)]
    pub rotate: bool,

    /// Connect directly instead of through Tor.
    #[arg(long)]
    pub no_tor: bool,

    /// Tor SOCKS address (host:port).
    #[arg(long)]
    pub socks: Option<String>,

    /// Tor control port address (host:port).
    #[arg(long)]
    pub control: Option<String>,

    /// Control port password. Also read from SHELF_ENRICH_CONTROL_PASSWORD.
    #[arg(long)]
    pub control_password: Option<String>,

    /// IP lookup endpoint returning ipinfo-style JSON.
    #[arg(long, default_value = IP_INFO_URL)]
    pub url: String,
}

impl IpArgs {
    fn overrides(&self) -> Overrides {
        Overrides {
            no_tor: self.no_tor,
            socks_addr: self.socks.clone(),
            control_addr: self.control.clone(),
            control_password: self.control_password.clone(),
            ..Default::default()
        }
        .with_password_env(std::env::var(CONTROL_PASSWORD_ENV).ok())
    }
}

pub async fn run(args: IpArgs, config_path: Option<PathBuf>) -> Result<()> {
    let mut config = load_config(config_path.as_deref())?;
    args.overrides().apply(&mut config);

    let provider = IdentityProvider::from_config(&config).context("cannot build session")?;
    if !provider.is_anonymized() {
        println!("(direct connection, not using Tor)");
    }

    let session = provider.acquire_session().await?;
    let before = whoami(&session, &args.url)
        .await
        .context("IP lookup failed")?;
    println!("{before}");

    if args.rotate {
        provider
            .rotate_identity()
            .await
            .context("identity rotation failed")?;
        let session = provider.acquire_session().await?;
        let after = whoami(&session, &args.url)
            .await
            .context("IP lookup failed after rotation")?;
        println!("{after}");
        if after.ip == before.ip {
            println!("warning: address unchanged after rotation");
        }
    }
    Ok(())
}
