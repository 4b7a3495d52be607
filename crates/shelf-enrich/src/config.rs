//! Job configuration.
//!
//! Every field has a default, so a config file only needs the values it
//! changes. Validation that depends on the dataset (the entity limit) is done
//! by [`crate::dataset::Dataset::apply_limit`].

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::types::{EnrichError, EnrichResult};

/// Default number of requests between identity rotations.
pub const DEFAULT_ROTATE_EVERY: u64 = 15;

/// Default number of fetch attempts per entity.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default worker pool width.
pub const DEFAULT_POOL_WIDTH: usize = 10;

/// Entity limit meaning "every row".
pub const ALL_ENTITIES: i64 = -1;

/// Top-level configuration of an enrichment job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrichConfig {
    /// Rotate identity on every Nth request. `0` disables rotation.
    pub rotate_every_n_requests: u64,
    /// Fetch attempts per entity, first attempt included.
    pub max_retries: u32,
    pub pool_width: usize,
    /// Number of leading rows to enrich, `-1` for all.
    pub entity_limit: i64,
    /// Document URLs are built as `{base_url}/show/{key}`.
    pub base_url: String,
    pub request_timeout_ms: u64,
    pub tor: TorConfig,
    pub selectors: SelectorConfig,
    pub columns: ColumnConfig,
}

impl Default for EnrichConfig {
    fn default() -> Self {
        Self {
            rotate_every_n_requests: DEFAULT_ROTATE_EVERY,
            max_retries: DEFAULT_MAX_RETRIES,
            pool_width: DEFAULT_POOL_WIDTH,
            entity_limit: ALL_ENTITIES,
            base_url: "https://www.goodreads.com/book".to_string(),
            request_timeout_ms: 30_000,
            tor: TorConfig::default(),
            selectors: SelectorConfig::default(),
            columns: ColumnConfig::default(),
        }
    }
}

impl EnrichConfig {
    /// Load a JSON config file. Missing keys fall back to defaults.
    pub fn load(path: &Path) -> EnrichResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        Ok(config)
    }

    /// Check the values that do not depend on the dataset.
    pub fn validate(&self) -> EnrichResult<()> {
        if self.pool_width == 0 {
            return Err(EnrichError::InvalidConfiguration(
                "pool width must be at least 1".into(),
            ));
        }
        if self.max_retries == 0 {
            return Err(EnrichError::InvalidConfiguration(
                "max retries must be at least 1".into(),
            ));
        }
        if self.request_timeout_ms == 0 {
            return Err(EnrichError::InvalidConfiguration(
                "request timeout must be positive".into(),
            ));
        }
        let base = url::Url::parse(&self.base_url).map_err(|e| {
            EnrichError::InvalidConfiguration(format!("base url `{}`: {e}", self.base_url))
        })?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(EnrichError::InvalidConfiguration(format!(
                "base url `{}` must be http or https",
                self.base_url
            )));
        }
        if self.tor.enabled && self.tor.circuit_checks == 0 {
            return Err(EnrichError::InvalidConfiguration(
                "circuit checks must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Anonymizing network (Tor) endpoints and credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TorConfig {
    /// Route requests through the SOCKS proxy and rotate via the control port.
    pub enabled: bool,
    pub socks_addr: String,
    pub control_addr: String,
    pub auth: ControlAuth,
    /// How many times `status/circuit-established` is queried.
    pub circuit_checks: u32,
    pub circuit_backoff_ms: u64,
    /// Ask `ip_info_url` for the apparent address after every rotation and log it.
    pub log_ip_after_rotation: bool,
    pub ip_info_url: String,
}

impl Default for TorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            socks_addr: "127.0.0.1:9050".to_string(),
            control_addr: "127.0.0.1:9051".to_string(),
            auth: ControlAuth::Auto,
            circuit_checks: 3,
            circuit_backoff_ms: 1_000,
            log_ip_after_rotation: false,
            ip_info_url: crate::identity::IP_INFO_URL.to_string(),
        }
    }
}

impl TorConfig {
    /// Proxy URL handed to reqwest. `socks5h` resolves names through Tor.
    pub fn proxy_url(&self) -> String {
        format!("socks5h://{}", self.socks_addr)
    }
}

/// How to authenticate on the control port.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum ControlAuth {
    /// Ask the control port with `PROTOCOLINFO` and use the method it offers:
    /// no credential, or the cookie file it names.
    #[default]
    Auto,
    /// `AUTHENTICATE` with no credential (no auth configured in torrc).
    None,
    Password {
        password: String,
    },
    /// Contents of the control auth cookie file, sent hex-encoded.
    Cookie {
        path: PathBuf,
    },
}

impl std::fmt::Debug for ControlAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "Auto"),
            Self::None => write!(f, "None"),
            Self::Password { .. } => write!(f, "Password(<redacted>)"),
            Self::Cookie { path } => write!(f, "Cookie({})", path.display()),
        }
    }
}

/// CSS selectors used by the field extractor. Defaults match Goodreads book pages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    /// One match per taxonomy term.
    pub taxonomy_group: String,
    /// Labels inside a group, joined into one hierarchical term.
    pub taxonomy_label: String,
    /// Metadata tag whose `content` holds the primary image.
    pub image_meta: String,
    /// Fallback image element whose `src` holds the primary image.
    pub image_element: String,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            taxonomy_group: "div.left".to_string(),
            taxonomy_label: "a.actionLinkLite.bookPageGenreLink".to_string(),
            image_meta: r#"meta[property="og:image"]"#.to_string(),
            image_element: "#coverImage".to_string(),
        }
    }
}

/// Dataset column names.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnConfig {
    pub key: String,
    pub title: String,
    pub author: String,
    pub taxonomy: String,
    pub image: String,
}

impl Default for ColumnConfig {
    fn default() -> Self {
        Self {
            key: "Book Id".to_string(),
            title: "Title".to_string(),
            author: "Author".to_string(),
            taxonomy: "Genres".to_string(),
            image: "Cover Image".to_string(),
        }
    }
}
