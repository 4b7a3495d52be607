//! Control channel of the anonymizing network.
//!
//! [`TorControl`] speaks the Tor control-port protocol over TCP: one command
//! per line, replies of the form `250-key=value` / `250 OK`. A new connection
//! is opened for every operation and closed with `QUIT`.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::config::{ControlAuth, TorConfig};
use crate::types::RotationError;

/// Upper bound for connecting to the control port.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound for a single control reply.
const REPLY_TIMEOUT: Duration = Duration::from_secs(30);

const CIRCUIT_ESTABLISHED: &str = "status/circuit-established";

/// Side-effecting operations on the anonymizing network.
#[async_trait]
pub trait IdentityControl: Send + Sync {
    /// Authenticate and confirm the circuit is usable, without changing identity.
    async fn verify(&self) -> Result<(), RotationError>;

    /// Request a fresh network identity for subsequent connections.
    async fn new_identity(&self) -> Result<(), RotationError>;
}

/// Tor control-port client.
#[derive(Debug, Clone)]
pub struct TorControl {
    addr: String,
    auth: ControlAuth,
    circuit_checks: u32,
    backoff: Duration,
}

impl TorControl {
    pub fn new(config: &TorConfig) -> Self {
        Self {
            addr: config.control_addr.clone(),
            auth: config.auth.clone(),
            circuit_checks: config.circuit_checks.max(1),
            backoff: Duration::from_millis(config.circuit_backoff_ms),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Connect and authenticate.
    async fn open(&self) -> Result<ControlConnection, RotationError> {
        let mut conn = ControlConnection::connect(&self.addr).await?;
        let auth = match &self.auth {
            ControlAuth::Auto => {
                let offered = conn.protocol_info().await?;
                let auth = offered.choose()?;
                debug!(methods = ?offered.methods, chosen = ?auth, "control port auth discovered");
                auth
            }
            configured => configured.clone(),
        };
        let command = authenticate_command(&auth).await?;
        let reply = conn.command(&command).await?;
        if !reply.is_ok() {
            return Err(RotationError::Authentication(reply.message()));
        }
        debug!(addr = %self.addr, "authenticated on control port");
        Ok(conn)
    }

    /// Poll `status/circuit-established` with a fixed backoff.
    async fn wait_for_circuit(&self, conn: &mut ControlConnection) -> Result<(), RotationError> {
        for attempt in 1..=self.circuit_checks {
            let reply = conn
                .command(&format!("GETINFO {CIRCUIT_ESTABLISHED}"))
                .await?;
            if !reply.is_ok() {
                return Err(RotationError::Protocol(format!(
                    "GETINFO {CIRCUIT_ESTABLISHED} rejected: {}",
                    reply.message()
                )));
            }
            if reply.value(CIRCUIT_ESTABLISHED) == Some("1") {
                return Ok(());
            }
            if attempt < self.circuit_checks {
                warn!(
                    attempt,
                    "circuit not established yet, retrying in {}ms",
                    self.backoff.as_millis()
                );
                tokio::time::sleep(self.backoff).await;
            }
        }
        Err(RotationError::CircuitNotEstablished {
            attempts: self.circuit_checks,
        })
    }
}

#[async_trait]
impl IdentityControl for TorControl {
    async fn verify(&self) -> Result<(), RotationError> {
        let mut conn = self.open().await?;
        let result = self.wait_for_circuit(&mut conn).await;
        conn.quit().await;
        result
    }

    async fn new_identity(&self) -> Result<(), RotationError> {
        let mut conn = self.open().await?;
        if let Err(e) = self.wait_for_circuit(&mut conn).await {
            conn.quit().await;
            return Err(e);
        }
        let reply = conn.command("SIGNAL NEWNYM").await?;
        conn.quit().await;
        if !reply.is_ok() {
            return Err(RotationError::Protocol(format!(
                "SIGNAL NEWNYM rejected: {}",
                reply.message()
            )));
        }
        Ok(())
    }
}

/// A complete control-port reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlReply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl ControlReply {
    pub fn is_ok(&self) -> bool {
        self.code == 250
    }

    /// Value of a `key=value` line.
    pub fn value(&self, key: &str) -> Option<&str> {
        self.lines.iter().find_map(|line| {
            let (k, v) = line.split_once('=')?;
            (k == key).then_some(v)
        })
    }

    /// Reply text for error reports.
    pub fn message(&self) -> String {
        format!("{} {}", self.code, self.lines.join("; "))
    }
}

/// Authentication methods advertised in a `PROTOCOLINFO` reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthMethods {
    pub methods: Vec<String>,
    pub cookie_file: Option<PathBuf>,
}

impl AuthMethods {
    /// Read the `AUTH METHODS=... COOKIEFILE="..."` line of a reply.
    pub fn parse(reply: &ControlReply) -> Result<Self, RotationError> {
        let line = reply
            .lines
            .iter()
            .find_map(|l| l.strip_prefix("AUTH "))
            .ok_or_else(|| RotationError::Protocol("PROTOCOLINFO reply has no AUTH line".into()))?;

        let mut parsed = Self::default();
        let mut rest = line.trim_start();
        while !rest.is_empty() {
            let (key, after) = rest.split_once('=').ok_or_else(|| {
                RotationError::Protocol(format!("malformed AUTH line: {line:?}"))
            })?;
            let (value, tail) = match after.strip_prefix('"') {
                Some(quoted) => unquote(quoted)?,
                None => match after.split_once(' ') {
                    Some((value, tail)) => (value.to_string(), tail),
                    None => (after.to_string(), ""),
                },
            };
            match key {
                "METHODS" => {
                    parsed.methods = value
                        .split(',')
                        .filter(|m| !m.is_empty())
                        .map(|m| m.to_ascii_uppercase())
                        .collect();
                }
                "COOKIEFILE" => parsed.cookie_file = Some(PathBuf::from(value)),
                _ => {}
            }
            rest = tail.trim_start();
        }
        Ok(parsed)
    }

    pub fn supports(&self, method: &str) -> bool {
        self.methods.iter().any(|m| m == method)
    }

    /// Credential to send: no credential if allowed, else the advertised cookie.
    ///
    /// A control port that only accepts a password needs one configured.
    pub fn choose(&self) -> Result<ControlAuth, RotationError> {
        if self.supports("NULL") {
            return Ok(ControlAuth::None);
        }
        if self.supports("COOKIE") {
            if let Some(path) = &self.cookie_file {
                return Ok(ControlAuth::Cookie { path: path.clone() });
            }
        }
        if self.supports("HASHEDPASSWORD") {
            return Err(RotationError::Authentication(
                "control port requires a password".into(),
            ));
        }
        Err(RotationError::Authentication(format!(
            "no supported auth method offered (METHODS={})",
            self.methods.join(",")
        )))
    }
}

/// Read a quoted string whose opening quote is already consumed.
/// Returns the unescaped value and the text after the closing quote.
fn unquote(input: &str) -> Result<(String, &str), RotationError> {
    let mut value = String::new();
    let mut chars = input.char_indices();
    while let Some((idx, c)) = chars.next() {
        match c {
            '"' => return Ok((value, &input[idx + 1..])),
            '\\' => match chars.next() {
                Some((_, escaped)) => value.push(escaped),
                None => break,
            },
            c => value.push(c),
        }
    }
    Err(RotationError::Protocol(format!(
        "unterminated quoted string: {input:?}"
    )))
}

/// Split one reply line into status code, separator and text.
///
/// The separator is `-` for a continued reply, `+` for a data block and a
/// space for the final line.
pub fn parse_reply_line(line: &str) -> Result<(u16, char, &str), RotationError> {
    let malformed = || RotationError::Protocol(format!("malformed reply line: {line:?}"));
    let code = line
        .get(..3)
        .filter(|c| c.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|c| c.parse::<u16>().ok())
        .ok_or_else(malformed)?;
    let rest = &line[3..];
    let mut chars = rest.chars();
    let sep = chars.next().ok_or_else(malformed)?;
    if !matches!(sep, ' ' | '-' | '+') {
        return Err(malformed());
    }
    Ok((code, sep, chars.as_str()))
}

/// Quote a string argument for the control protocol.
pub fn quote_argument(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        if c == '"' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

async fn authenticate_command(auth: &ControlAuth) -> Result<String, RotationError> {
    match auth {
        ControlAuth::Auto => Err(RotationError::Protocol(
            "auth method must be discovered with PROTOCOLINFO first".into(),
        )),
        ControlAuth::None => Ok("AUTHENTICATE".to_string()),
        ControlAuth::Password { password } => {
            Ok(format!("AUTHENTICATE {}", quote_argument(password)))
        }
        ControlAuth::Cookie { path } => {
            let cookie = tokio::fs::read(path).await.map_err(|e| {
                RotationError::Authentication(format!(
                    "cannot read cookie file {}: {e}",
                    path.display()
                ))
            })?;
            let hex: String = cookie.iter().map(|b| format!("{b:02x}")).collect();
            Ok(format!("AUTHENTICATE {hex}"))
        }
    }
}

struct ControlConnection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl ControlConnection {
    async fn connect(addr: &str) -> Result<Self, RotationError> {
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| RotationError::Connect {
                addr: addr.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"),
            })?
            .map_err(|source| RotationError::Connect {
                addr: addr.to_string(),
                source,
            })?;
        let (read, write) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read),
            writer: write,
        })
    }

    async fn protocol_info(&mut self) -> Result<AuthMethods, RotationError> {
        let reply = self.command("PROTOCOLINFO 1").await?;
        if !reply.is_ok() {
            return Err(RotationError::Protocol(format!(
                "PROTOCOLINFO rejected: {}",
                reply.message()
            )));
        }
        AuthMethods::parse(&reply)
    }

    async fn command(&mut self, line: &str) -> Result<ControlReply, RotationError> {
        self.writer
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .map_err(|e| RotationError::Protocol(format!("write failed: {e}")))?;
        tokio::time::timeout(REPLY_TIMEOUT, self.read_reply())
            .await
            .map_err(|_| RotationError::Protocol("timed out waiting for reply".into()))?
    }

    async fn read_reply(&mut self) -> Result<ControlReply, RotationError> {
        let mut lines = Vec::new();
        loop {
            let line = self.read_line().await?;
            let (code, sep, text) = parse_reply_line(&line)?;
            match sep {
                ' ' => {
                    lines.push(text.to_string());
                    return Ok(ControlReply { code, lines });
                }
                '-' => lines.push(text.to_string()),
                _ => {
                    let mut data = text.to_string();
                    loop {
                        let next = self.read_line().await?;
                        if next == "." {
                            break;
                        }
                        data.push('\n');
                        data.push_str(&next);
                    }
                    lines.push(data);
                }
            }
        }
    }

    async fn read_line(&mut self) -> Result<String, RotationError> {
        let mut buf = String::new();
        let n = self
            .reader
            .read_line(&mut buf)
            .await
            .map_err(|e| RotationError::Protocol(format!("read failed: {e}")))?;
        if n == 0 {
            return Err(RotationError::Protocol(
                "control connection closed mid-reply".into(),
            ));
        }
        Ok(buf.trim_end_matches(&['\r', '\n'][..]).to_string())
    }

    async fn quit(mut self) {
        let _ = self.writer.write_all(b"QUIT\r\n").await;
        let _ = self.writer.shutdown().await;
    }
}
