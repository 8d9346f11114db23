// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Devtunnel Host Contributors

// Devtunnel Host - Token Module
// Credential cache backed by the external devtunnel helper

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use devtunnel_host_common::{HostEvent, LoginPlatform};

use crate::error::HostError;
use crate::refresh_lock::RefreshLock;

/// Substring printed by the helper once a login completed
const LOGIN_SUCCESS_MARKER: &str = "Logged in";

/// Obfuscate a token for logging (show only last 4 characters)
/// Example: "abc123def456" -> "********f456"
pub fn obfuscate_token(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() < 8 {
        "*".repeat(chars.len())
    } else {
        let visible: String = chars[chars.len() - 4..].iter().collect();
        format!("{}{}", "*".repeat(chars.len() - 4), visible)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenScheme {
    Github,
    Bearer,
}

impl TokenScheme {
    pub fn as_str(self) -> &'static str {
        match self {
            TokenScheme::Github => "github",
            TokenScheme::Bearer => "Bearer",
        }
    }

    /// Identity provider behind this scheme
    pub fn provider(self) -> &'static str {
        match self {
            TokenScheme::Github => "github",
            TokenScheme::Bearer => "microsoft",
        }
    }
}

/// Credential for the management directory
pub struct Token {
    scheme: TokenScheme,
    value: Zeroizing<String>,
}

impl Token {
    pub fn new(scheme: TokenScheme, value: impl Into<String>) -> Self {
        Self {
            scheme,
            value: Zeroizing::new(value.into()),
        }
    }

    pub fn scheme(&self) -> TokenScheme {
        self.scheme
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    /// Value of the `Authorization` header, e.g. `github <token>`
    pub fn authorization(&self) -> Zeroizing<String> {
        Zeroizing::new(format!("{} {}", self.scheme.as_str(), self.value.as_str()))
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("scheme", &self.scheme)
            .field("value", &obfuscate_token(&self.value))
            .finish()
    }
}

static GITHUB_USER: OnceLock<Option<Regex>> = OnceLock::new();
static GITHUB_ID: OnceLock<Option<Regex>> = OnceLock::new();
static MICROSOFT_USER: OnceLock<Option<Regex>> = OnceLock::new();
static MICROSOFT_ID: OnceLock<Option<Regex>> = OnceLock::new();

fn cached_regex(cell: &'static OnceLock<Option<Regex>>, pattern: &str) -> Option<&'static Regex> {
    cell.get_or_init(|| Regex::new(pattern).ok()).as_ref()
}

/// Derive a token from the helper's verbose `user show` output
pub fn parse_whoami(output: &str) -> Result<Token, HostError> {
    let output = output.replace("\r\n", "\n");

    if !output.contains("Logged in as") {
        return Err(HostError::NotLoggedIn);
    }

    let candidates = [
        (
            cached_regex(&GITHUB_USER, r"Logged in as (.*) using GitHub\."),
            cached_regex(&GITHUB_ID, r"UserId:[^\n]+\n([^\n]+)\n"),
            TokenScheme::Github,
        ),
        (
            cached_regex(&MICROSOFT_USER, r"Logged in as (.*) using Microsoft\."),
            cached_regex(&MICROSOFT_ID, r"PUID:[^\n]+\n([^\n]+)\n"),
            TokenScheme::Bearer,
        ),
    ];

    for (user_re, value_re, scheme) in candidates {
        let (Some(user_re), Some(value_re)) = (user_re, value_re) else {
            continue;
        };
        if !user_re.is_match(&output) {
            continue;
        }
        let value = value_re
            .captures(&output)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().trim())
            .filter(|v| !v.is_empty());

        if let Some(value) = value {
            return Ok(Token::new(scheme, value));
        }
    }

    Err(HostError::NotLoggedIn)
}

/// External authentication helper
#[async_trait]
pub trait AuthHelper: Send + Sync {
    /// Verbose status query; returns the helper's standard output
    async fn whoami(&self) -> Result<String, HostError>;

    /// Interactive login. Output lines are sent as they arrive; resolves once
    /// the success marker has been printed.
    async fn login(
        &self,
        platform: LoginPlatform,
        output: mpsc::UnboundedSender<String>,
    ) -> Result<(), HostError>;
}

/// `devtunnel` command-line helper
#[derive(Debug, Clone)]
pub struct DevTunnelCli {
    path: PathBuf,
}

impl DevTunnelCli {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.path);
        cmd.kill_on_drop(true).stdin(Stdio::null());
        cmd
    }
}

#[async_trait]
impl AuthHelper for DevTunnelCli {
    async fn whoami(&self) -> Result<String, HostError> {
        debug!("Running {} user show -v", self.path.display());
        let output = self
            .command()
            .args(["user", "show", "-v"])
            .output()
            .await
            .map_err(|e| HostError::Helper(format!("failed to run {}: {}", self.path.display(), e)))?;

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn login(
        &self,
        platform: LoginPlatform,
        output: mpsc::UnboundedSender<String>,
    ) -> Result<(), HostError> {
        info!("Starting {} login via {}", platform, self.path.display());

        let mut child = self
            .command()
            .args(["user", "login"])
            .args(platform.helper_args())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| HostError::Helper(format!("failed to run {}: {}", self.path.display(), e)))?;

        let (line_tx, mut line_rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            spawn_line_reader(stdout, line_tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_line_reader(stderr, line_tx.clone());
        }
        drop(line_tx);

        let mut last_line = String::new();
        while let Some(line) = line_rx.recv().await {
            let _ = output.send(line.clone());

            if line.contains(LOGIN_SUCCESS_MARKER) {
                // Reap the helper in the background; the login already succeeded
                tokio::spawn(async move {
                    while let Some(line) = line_rx.recv().await {
                        let _ = output.send(line);
                    }
                    if let Err(e) = child.wait().await {
                        debug!("Failed to reap login helper: {}", e);
                    }
                });
                return Ok(());
            }

            if !line.trim().is_empty() {
                last_line = line;
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| HostError::Helper(format!("failed to wait for login helper: {}", e)))?;

        let reason = if last_line.is_empty() {
            format!("helper exited with {}", status)
        } else {
            last_line
        };
        Err(HostError::LoginFailed(reason))
    }
}

fn spawn_line_reader<R>(reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!("Login helper output error: {}", e);
                    break;
                }
            }
        }
    });
}

struct TokenStoreInner {
    helper: Arc<dyn AuthHelper>,
    token: RwLock<Option<Arc<Token>>>,
    refresh_lock: RefreshLock,
    event_tx: broadcast::Sender<HostEvent>,
}

/// Process-wide credential cache
#[derive(Clone)]
pub struct TokenStore {
    inner: Arc<TokenStoreInner>,
}

impl TokenStore {
    pub fn new(
        helper: Arc<dyn AuthHelper>,
        lock_timeout: Duration,
        event_tx: broadcast::Sender<HostEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(TokenStoreInner {
                helper,
                token: RwLock::new(None),
                refresh_lock: RefreshLock::new(lock_timeout),
                event_tx,
            }),
        }
    }

    fn cached(&self) -> Option<Arc<Token>> {
        self.inner
            .token
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn store(&self, token: Option<Arc<Token>>) {
        *self
            .inner
            .token
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = token;
    }

    pub fn is_logged_in(&self) -> bool {
        self.cached().is_some()
    }

    /// Drop the cached credential; the next `get_token` asks the helper again
    pub fn invalidate(&self) {
        if self.cached().is_some() {
            info!("Invalidating cached credential");
        }
        self.store(None);
    }

    /// Return the cached token, querying the helper at most once across concurrent callers
    pub async fn get_token(&self) -> Result<Arc<Token>, HostError> {
        if let Some(token) = self.cached() {
            return Ok(token);
        }

        let guard = self.inner.refresh_lock.acquire().await;

        if let Some(token) = self.cached() {
            return Ok(token);
        }

        let output = self.inner.helper.whoami().await?;
        let token = Arc::new(parse_whoami(&output)?);
        debug!("Derived {} credential {:?}", token.scheme().provider(), token);
        if !guard.is_current() {
            warn!("Credential lookup outlived the refresh lock; another lookup may have run");
        }

        self.store(Some(token.clone()));
        Ok(token)
    }

    /// Run the interactive login, streaming helper output as `LoginOutput` events
    pub async fn login(&self, platform: LoginPlatform) -> Result<Arc<Token>, HostError> {
        self.invalidate();

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let event_tx = self.inner.event_tx.clone();
        tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                info!("devtunnel: {}", line);
                let _ = event_tx.send(HostEvent::LoginOutput {
                    line,
                    timestamp: Utc::now(),
                });
            }
        });

        let result = self.inner.helper.login(platform, tx).await;
        if let Err(e) = &result {
            warn!("Login failed: {}", e);
        }
        result?;

        self.get_token().await
    }
}
