//! Outbound sessions with periodic identity rotation.
//!
//! The [`IdentityProvider`] owns the only state shared by all workers: the
//! request counter and the current HTTP client. Every session acquisition is
//! one counted request; when the count reaches a multiple of the rotation
//! threshold, the provider asks the control channel for a new identity and
//! replaces the client before handing out the session.

pub mod control;
pub mod user_agent;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::EnrichConfig;
use crate::fetch::transport_error;
use crate::types::{FetchError, RotationError};

pub use control::{IdentityControl, TorControl};
pub use user_agent::UserAgentPool;

/// Endpoint reporting the caller's apparent public address.
pub const IP_INFO_URL: &str = "https://ipinfo.io/json";

/// Request counter and rotation bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentityState {
    issued: u64,
    rotate_every: u64,
    rotations: u64,
}

impl IdentityState {
    /// `rotate_every == 0` disables rotation.
    pub fn new(rotate_every: u64) -> Self {
        Self {
            issued: 0,
            rotate_every,
            rotations: 0,
        }
    }

    /// Count one request and report whether it must be preceded by a rotation.
    pub fn record_request(&mut self) -> bool {
        self.issued += 1;
        self.rotate_every > 0 && self.issued % self.rotate_every == 0
    }

    fn mark_rotated(&mut self) {
        self.rotations += 1;
    }

    pub fn issued(&self) -> u64 {
        self.issued
    }

    pub fn rotations(&self) -> u64 {
        self.rotations
    }
}

/// Handle for one outbound request.
///
/// The client is shared by every session of the same identity generation and
/// is safe for concurrent use.
#[derive(Debug, Clone)]
pub struct Session {
    client: reqwest::Client,
    user_agent: Option<String>,
    generation: u64,
    request_number: u64,
}

impl Session {
    /// Start a GET with this session's headers applied.
    pub fn get(&self, url: &str) -> reqwest::RequestBuilder {
        let builder = self.client.get(url);
        match &self.user_agent {
            Some(ua) => builder.header(reqwest::header::USER_AGENT, ua),
            None => builder,
        }
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.user_agent.as_deref()
    }

    /// Number of rotations that happened before this session was issued.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// 1-based position of this request in the job.
    pub fn request_number(&self) -> u64 {
        self.request_number
    }
}

/// Connection settings for sessions.
#[derive(Debug, Clone)]
pub struct IdentitySettings {
    pub rotate_every: u64,
    /// Proxy URL, e.g. `socks5h://127.0.0.1:9050`. `None` connects directly.
    pub proxy: Option<String>,
    pub timeout: Duration,
}

impl IdentitySettings {
    pub fn from_config(config: &EnrichConfig) -> Self {
        Self {
            rotate_every: config.rotate_every_n_requests,
            proxy: config.tor.enabled.then(|| config.tor.proxy_url()),
            timeout: Duration::from_millis(config.request_timeout_ms),
        }
    }
}

struct ProviderState {
    identity: IdentityState,
    client: reqwest::Client,
}

/// Produces sessions and rotates the network identity every N requests.
pub struct IdentityProvider {
    state: Mutex<ProviderState>,
    control: Option<Arc<dyn IdentityControl>>,
    settings: IdentitySettings,
    agents: UserAgentPool,
    ip_probe: Option<String>,
}

impl IdentityProvider {
    /// Create a provider. Without a control channel, rotation only replaces
    /// the local client.
    pub fn new(
        settings: IdentitySettings,
        control: Option<Arc<dyn IdentityControl>>,
    ) -> Result<Self, RotationError> {
        let client = build_client(&settings)?;
        Ok(Self {
            state: Mutex::new(ProviderState {
                identity: IdentityState::new(settings.rotate_every),
                client,
            }),
            control,
            settings,
            agents: UserAgentPool::default(),
            ip_probe: None,
        })
    }

    /// Provider for a job: Tor proxy and control port when enabled, direct otherwise.
    pub fn from_config(config: &EnrichConfig) -> Result<Self, RotationError> {
        let control: Option<Arc<dyn IdentityControl>> = if config.tor.enabled {
            Some(Arc::new(TorControl::new(&config.tor)))
        } else {
            None
        };
        let provider = Self::new(IdentitySettings::from_config(config), control)?;
        Ok(if config.tor.log_ip_after_rotation {
            provider.with_ip_probe(config.tor.ip_info_url.clone())
        } else {
            provider
        })
    }

    pub fn with_user_agents(mut self, agents: UserAgentPool) -> Self {
        self.agents = agents;
        self
    }

    /// Log the apparent address reported by `url` after every rotation.
    pub fn with_ip_probe(mut self, url: impl Into<String>) -> Self {
        self.ip_probe = Some(url.into());
        self
    }

    pub fn is_anonymized(&self) -> bool {
        self.settings.proxy.is_some()
    }

    /// Confirm the control channel works before any request is made.
    pub async fn verify(&self) -> Result<(), RotationError> {
        match &self.control {
            Some(control) => control.verify().await,
            None => Ok(()),
        }
    }

    /// Count one request and return a session for it, rotating first when due.
    pub async fn acquire_session(&self) -> Result<Session, RotationError> {
        let (session, rotated) = {
            let mut state = self.state.lock().await;
            let rotated = state.identity.record_request();
            if rotated {
                self.rotate_locked(&mut state).await?;
            }
            (self.session_locked(&state), rotated)
        };
        if rotated {
            self.log_identity(&session).await;
        }
        Ok(session)
    }

    /// Rotate now, outside the request schedule.
    pub async fn rotate_identity(&self) -> Result<(), RotationError> {
        let session = {
            let mut state = self.state.lock().await;
            self.rotate_locked(&mut state).await?;
            self.session_locked(&state)
        };
        self.log_identity(&session).await;
        Ok(())
    }

    pub async fn requests_issued(&self) -> u64 {
        self.state.lock().await.identity.issued()
    }

    pub async fn rotations(&self) -> u64 {
        self.state.lock().await.identity.rotations()
    }

    async fn rotate_locked(&self, state: &mut ProviderState) -> Result<(), RotationError> {
        if let Some(control) = &self.control {
            control.new_identity().await?;
        }
        // Fresh client so no pooled connection keeps using the old circuit.
        state.client = build_client(&self.settings)?;
        state.identity.mark_rotated();
        info!(
            rotation = state.identity.rotations(),
            requests = state.identity.issued(),
            "identity rotated"
        );
        Ok(())
    }

    fn session_locked(&self, state: &ProviderState) -> Session {
        Session {
            client: state.client.clone(),
            user_agent: self.agents.pick(),
            generation: state.identity.rotations(),
            request_number: state.identity.issued(),
        }
    }

    /// Log the apparent address of a freshly rotated session. Runs without the
    /// state lock; the probe request is not counted.
    async fn log_identity(&self, session: &Session) {
        let Some(url) = &self.ip_probe else {
            return;
        };
        match whoami(session, url).await {
            Ok(info) => debug!(generation = session.generation(), "new identity: {info}"),
            Err(e) => warn!("identity probe failed: {e}"),
        }
    }
}

/// Apparent public address of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpInfo {
    pub ip: String,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub org: Option<String>,
}

impl std::fmt::Display for IpInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "IP: {}", self.ip)?;
        if let Some(city) = &self.city {
            write!(f, " in {city}")?;
        }
        if let Some(country) = &self.country {
            write!(f, " ({country})")?;
        }
        Ok(())
    }
}

/// Ask an IP-info endpoint which address the session appears to come from.
pub async fn whoami(session: &Session, url: &str) -> Result<IpInfo, FetchError> {
    let resp = session
        .get(url)
        .send()
        .await
        .map_err(|e| transport_error(url, e))?;
    let status = resp.status().as_u16();
    if !resp.status().is_success() {
        return Err(FetchError::Status {
            url: url.to_string(),
            status,
        });
    }
    resp.json::<IpInfo>()
        .await
        .map_err(|e| transport_error(url, e))
}

fn build_client(settings: &IdentitySettings) -> Result<reqwest::Client, RotationError> {
    let mut builder = reqwest::Client::builder()
        .timeout(settings.timeout)
        .redirect(reqwest::redirect::Policy::limited(5));
    if let Some(proxy) = &settings.proxy {
        let proxy = reqwest::Proxy::all(proxy)
            .map_err(|e| RotationError::Session(format!("invalid proxy `{proxy}`: {e}")))?;
        builder = builder.proxy(proxy);
    }
    builder
        .build()
        .map_err(|e| RotationError::Session(e.to_string()))
}
