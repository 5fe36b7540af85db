//! Process-wide pool of established SSH sessions, keyed by `user@host:port`.
//!
//! One authenticated session is reused by every tunnel dialed to the same
//! remote, the same way the teacher keeps one socket client per agent
//! endpoint in a global registry rather than reconnecting per call.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use russh::client::{self, Handle};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config::DockerConfig;
use crate::error::CoreError;

struct ClientHandler {
    strict_host_key: bool,
}

#[async_trait::async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        // Host key pinning storage is out of scope for the core; a strict
        // setting only documents operator intent today. Accept unconditionally
        // either way until a known-hosts store exists.
        let _ = self.strict_host_key;
        Ok(true)
    }
}

pub type SshHandle = Handle<ClientHandler>;

fn pool_key(user: &str, host: &str, port: u16) -> String {
    format!("{user}@{host}:{port}")
}

type SessionRegistry = Arc<RwLock<HashMap<String, Arc<SshHandle>>>>;

static SESSIONS: Lazy<SessionRegistry> = Lazy::new(|| Arc::new(RwLock::new(HashMap::new())));

/// Timeout for the throwaway liveness-probe session opened against a
/// cached handle before it is trusted and handed back to a caller.
const LIVENESS_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Get or establish an authenticated session to `user@host:port`. A cached
/// handle is liveness-checked with a throwaway session before being
/// returned; a dead one is evicted and a fresh connection is established in
/// its place.
pub async fn get_or_connect(
    host: &str,
    port: u16,
    user: &str,
    docker_cfg: &DockerConfig,
) -> Result<Arc<SshHandle>, CoreError> {
    let key = pool_key(user, host, port);

    let cached = {
        let sessions = SESSIONS.read().await;
        sessions.get(&key).cloned()
    };

    if let Some(handle) = cached {
        if is_alive(&handle).await {
            return Ok(handle);
        }
        debug!(host, port, user, "cached ssh session is stale, evicting and reconnecting");
        evict(host, port, user).await;
    }

    debug!(host, port, user, "opening new ssh session");

    let config = Arc::new(client::Config {
        inactivity_timeout: Some(Duration::from_secs(600)),
        ..Default::default()
    });

    let handler = ClientHandler { strict_host_key: docker_cfg.ssh_strict_host_key };
    let mut handle = client::connect(config, (host, port), handler)
        .await
        .map_err(|e| CoreError::host_unreachable(format!("ssh connect to {host}:{port}: {e}")))?;

    authenticate(&mut handle, user, docker_cfg).await?;

    let handle = Arc::new(handle);
    {
        let mut sessions = SESSIONS.write().await;
        sessions.insert(key.clone(), handle.clone());
    }
    info!(host, port, user, "ssh session established");
    Ok(handle)
}

async fn authenticate(
    handle: &mut SshHandle,
    user: &str,
    docker_cfg: &DockerConfig,
) -> Result<(), CoreError> {
    if let Some(key_path) = &docker_cfg.ssh_key_file {
        let key_data = std::fs::read_to_string(key_path).map_err(|e| {
            CoreError::config_invalid(format!("reading ssh key {}: {e}", key_path.display()))
        })?;
        let key_pair = ssh_key::PrivateKey::from_openssh(&key_data)
            .map_err(|e| CoreError::config_invalid(format!("parsing ssh key: {e}")))?;
        let authenticated = handle
            .authenticate_publickey(user, Arc::new(key_pair))
            .await
            .map_err(|e| CoreError::host_unreachable(format!("ssh auth failed: {e}")))?;
        if !authenticated {
            return Err(CoreError::host_unreachable("ssh publickey authentication rejected"));
        }
        return Ok(());
    }

    Err(CoreError::config_invalid(
        "no ssh key configured (SSH_KEY_FILE unset) for ssh-based docker transport",
    ))
}

/// Drop a cached session, e.g. after a tunnel reports a broken pipe.
pub async fn evict(host: &str, port: u16, user: &str) {
    let key = pool_key(user, host, port);
    let mut sessions = SESSIONS.write().await;
    sessions.remove(&key);
}

/// Probe a cached handle with a throwaway session, closing it immediately.
/// A timeout or any error is treated as dead.
async fn is_alive(handle: &SshHandle) -> bool {
    match tokio::time::timeout(LIVENESS_PROBE_TIMEOUT, handle.channel_open_session()).await {
        Ok(Ok(channel)) => {
            let _ = channel.close().await;
            true
        }
        Ok(Err(_)) | Err(_) => false,
    }
}

/// Snapshot of the pool's current occupancy, for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SshPoolStats {
    pub active_connections: usize,
}

/// Number of distinct `user@host:port` sessions currently cached.
pub async fn stats() -> SshPoolStats {
    let sessions = SESSIONS.read().await;
    SshPoolStats { active_connections: sessions.len() }
}
