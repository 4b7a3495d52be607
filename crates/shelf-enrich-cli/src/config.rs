//! Configuration file resolution and command-line layering.
//!
//! Precedence: explicit flag > environment > config file > built-in default.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use shelf_enrich::{ControlAuth, EnrichConfig};

/// Environment variable naming a config file.
pub const CONFIG_ENV: &str = "SHELF_ENRICH_CONFIG";

/// Environment variable holding the control-port password.
pub const CONTROL_PASSWORD_ENV: &str = "SHELF_ENRICH_CONTROL_PASSWORD";

/// Config file picked up from the working directory.
pub const LOCAL_CONFIG: &str = "shelf-enrich.json";

/// Resolve the config file to load, if any.
pub fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    resolve_from(
        explicit,
        std::env::var(CONFIG_ENV).ok(),
        Path::new("."),
        dirs::config_dir(),
    )
}

/// Resolution with the environment passed in.
///
/// An explicit path or the environment variable is returned even if the file
/// does not exist, so that loading reports it. The working-directory and
/// user config files are only used when present.
pub fn resolve_from(
    explicit: Option<&Path>,
    env_path: Option<String>,
    cwd: &Path,
    user_config_dir: Option<PathBuf>,
) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    if let Some(path) = env_path.filter(|p| !p.is_empty()) {
        return Some(PathBuf::from(path));
    }
    let local = cwd.join(LOCAL_CONFIG);
    if local.is_file() {
        return Some(local);
    }
    user_config_dir
        .map(|dir| dir.join("shelf-enrich").join("config.json"))
        .filter(|p| p.is_file())
}

/// Load the resolved config file, or defaults when there is none.
pub fn load_config(explicit: Option<&Path>) -> Result<EnrichConfig> {
    match resolve_config_path(explicit) {
        Some(path) => {
            tracing::debug!("loading config from {}", path.display());
            EnrichConfig::load(&path)
                .with_context(|| format!("failed to load config {}", path.display()))
        }
        None => Ok(EnrichConfig::default()),
    }
}

/// Values given on the command line. `None` leaves the file value alone.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub entity_limit: Option<i64>,
    pub rotate_every: Option<u64>,
    pub max_retries: Option<u32>,
    pub pool_width: Option<usize>,
    pub base_url: Option<String>,
    pub timeout_ms: Option<u64>,
    pub no_tor: bool,
    pub socks_addr: Option<String>,
    pub control_addr: Option<String>,
    pub control_password: Option<String>,
    pub cookie_file: Option<PathBuf>,
    pub log_ip: bool,
}

impl Overrides {
    /// Fill the password from the environment unless given as a flag.
    pub fn with_password_env(mut self, env_password: Option<String>) -> Self {
        if self.control_password.is_none() {
            self.control_password = env_password.filter(|p| !p.is_empty());
        }
        self
    }

    pub fn apply(&self, config: &mut EnrichConfig) {
        if let Some(limit) = self.entity_limit {
            config.entity_limit = limit;
        }
        if let Some(n) = self.rotate_every {
            config.rotate_every_n_requests = n;
        }
        if let Some(n) = self.max_retries {
            config.max_retries = n;
        }
        if let Some(n) = self.pool_width {
            config.pool_width = n;
        }
        if let Some(url) = &self.base_url {
            config.base_url = url.clone();
        }
        if let Some(ms) = self.timeout_ms {
            config.request_timeout_ms = ms;
        }
        if self.no_tor {
            config.tor.enabled = false;
        }
        if let Some(addr) = &self.socks_addr {
            config.tor.socks_addr = addr.clone();
        }
        if let Some(addr) = &self.control_addr {
            config.tor.control_addr = addr.clone();
        }
        if self.log_ip {
            config.tor.log_ip_after_rotation = true;
        }
        // A cookie file given on the command line beats any password.
        if let Some(path) = &self.cookie_file {
            config.tor.auth = ControlAuth::Cookie { path: path.clone() };
        } else if let Some(password) = &self.control_password {
            config.tor.auth = ControlAuth::Password {
                password: password.clone(),
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_err;

    #[test]
    fn test_explicit_path_wins() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(LOCAL_CONFIG), "{}").unwrap();
        let got = resolve_from(
            Some(Path::new("/etc/custom.json")),
            Some("/tmp/env.json".into()),
            dir.path(),
            None,
        );
        assert_eq!(got, Some(PathBuf::from("/etc/custom.json")));
    }

    #[test]
    fn test_env_beats_local_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(LOCAL_CONFIG), "{}").unwrap();
        let got = resolve_from(None, Some("/tmp/env.json".into()), dir.path(), None);
        assert_eq!(got, Some(PathBuf::from("/tmp/env.json")));
    }

    #[test]
    fn test_local_file_then_user_dir() {
        let cwd = tempfile::tempdir().unwrap();
        let home = tempfile::tempdir().unwrap();
        assert_eq!(resolve_from(None, None, cwd.path(), Some(home.path().into())), None);

        let user = home.path().join("shelf-enrich").join("config.json");
        std::fs::create_dir_all(user.parent().unwrap()).unwrap();
        std::fs::write(&user, "{}").unwrap();
        assert_eq!(
            resolve_from(None, None, cwd.path(), Some(home.path().into())),
            Some(user)
        );

        std::fs::write(cwd.path().join(LOCAL_CONFIG), "{}").unwrap();
        assert_eq!(
            resolve_from(None, Some(String::new()), cwd.path(), Some(home.path().into())),
            Some(cwd.path().join(LOCAL_CONFIG))
        );
    }

    #[test]
    fn test_flags_override_file_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.json");
        std::fs::write(
            &path,
            r#"{"rotate_every_n_requests": 20, "pool_width": 4, "tor": {"socks_addr": "10.0.0.2:9050"}}"#,
        )
        .unwrap();
        let mut config = load_config(Some(&path)).unwrap();
        assert_eq!(config.rotate_every_n_requests, 20);

        let overrides = Overrides {
            pool_width: Some(2),
            entity_limit: Some(5),
            ..Default::default()
        };
        overrides.apply(&mut config);
        assert_eq!(config.rotate_every_n_requests, 20);
        assert_eq!(config.pool_width, 2);
        assert_eq!(config.entity_limit, 5);
        assert_eq!(config.tor.socks_addr, "10.0.0.2:9050");
        assert!(config.tor.enabled);
    }

    #[test]
    fn test_password_precedence() {
        let flag = Overrides {
            control_password: Some("flag".into()),
            ..Default::default()
        }
        .with_password_env(Some("env".into()));
        assert_eq!(flag.control_password.as_deref(), Some("flag"));

        let env = Overrides::default().with_password_env(Some("env".into()));
        let mut config = EnrichConfig::default();
        env.apply(&mut config);
        assert_eq!(
            config.tor.auth,
            ControlAuth::Password {
                password: "env".into()
            }
        );
    }

    #[test]
    fn test_cookie_beats_password() {
        let overrides = Overrides {
            control_password: Some("pw".into()),
            cookie_file: Some(PathBuf::from("/run/tor/control.authcookie")),
            no_tor: true,
            ..Default::default()
        };
        let mut config = EnrichConfig::default();
        overrides.apply(&mut config);
        assert!(matches!(config.tor.auth, ControlAuth::Cookie { .. }));
        assert!(!config.tor.enabled);
    }

    #[test]
    fn test_log_ip_flag_enables_lookup() {
        let mut config = EnrichConfig::default();
        Overrides::default().apply(&mut config);
        assert!(!config.tor.log_ip_after_rotation);
        assert_eq!(config.tor.auth, ControlAuth::Auto);

        let overrides = Overrides {
            log_ip: true,
            ..Default::default()
        };
        overrides.apply(&mut config);
        assert!(config.tor.log_ip_after_rotation);
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        let err = assert_err!(load_config(Some(Path::new("/definitely/not/here.json"))));
        assert!(err.to_string().contains("failed to load config"));
    }
}
