//! Builds a [`bollard::Docker`] client for a resolved connection descriptor.
//!
//! Information-gathering stays on the Engine API via bollard; Compose
//! orchestration is CLI-based (see [`crate::orchestrator`]) since Compose
//! has no daemon API of its own.

use std::time::Duration;

use bollard::Docker;

use crate::config::DockerConfig;
use crate::error::CoreError;
use crate::host_directory::ConnectionDescriptor;
use crate::ssh::tunnel::SshTunnel;

const CLIENT_TIMEOUT_SECS: u64 = 30;

/// A live Docker client plus, for SSH-backed hosts, the tunnel that must
/// stay alive for as long as the client is in use.
pub struct DockerHandle {
    pub client: Docker,
    _tunnel: Option<SshTunnel>,
}

impl DockerHandle {
    fn direct(client: Docker) -> Self {
        Self { client, _tunnel: None }
    }

    fn tunneled(client: Docker, tunnel: SshTunnel) -> Self {
        Self { client, _tunnel: Some(tunnel) }
    }
}

/// Build a client for one host's resolved connection descriptor.
pub async fn connect(
    descriptor: &ConnectionDescriptor,
    docker_cfg: &DockerConfig,
) -> Result<DockerHandle, CoreError> {
    let timeout = CLIENT_TIMEOUT_SECS;

    match descriptor {
        ConnectionDescriptor::Local { sock_path } => {
            let client = Docker::connect_with_socket(sock_path, timeout, bollard::API_DEFAULT_VERSION)
                .map_err(|e| {
                    CoreError::with_cause(
                        crate::error::ErrorKind::DockerUnavailable,
                        format!("connecting to local socket {sock_path}"),
                        e,
                    )
                })?;
            Ok(DockerHandle::direct(client))
        }
        ConnectionDescriptor::Tcp { host, port } => {
            let addr = format!("tcp://{host}:{port}");
            let client = Docker::connect_with_http(&addr, timeout, bollard::API_DEFAULT_VERSION)
                .map_err(|e| {
                    CoreError::with_cause(
                        crate::error::ErrorKind::DockerUnavailable,
                        format!("connecting to {addr}"),
                        e,
                    )
                })?;
            Ok(DockerHandle::direct(client))
        }
        ConnectionDescriptor::Ssh { ssh_host, ssh_port, ssh_user, remote_sock_path } => {
            let tunnel = SshTunnel::open(ssh_host, *ssh_port, ssh_user, remote_sock_path, docker_cfg)
                .await
                .map_err(|e| {
                    CoreError::with_cause(
                        crate::error::ErrorKind::HostUnreachable,
                        format!("opening ssh tunnel to {ssh_user}@{ssh_host}:{ssh_port}"),
                        e,
                    )
                })?;
            let client = Docker::connect_with_socket(
                tunnel.local_socket_path(),
                timeout,
                bollard::API_DEFAULT_VERSION,
            )
            .map_err(|e| {
                CoreError::with_cause(
                    crate::error::ErrorKind::DockerUnavailable,
                    "connecting through ssh tunnel socket".to_string(),
                    e,
                )
            })?;
            Ok(DockerHandle::tunneled(client, tunnel))
        }
    }
}

/// Confirms a client can actually talk to its daemon; used by the Fleet
/// Scanner before attempting a full inventory pass, and bounded by the
/// configured per-host timeout.
pub async fn ping(client: &Docker, timeout: Duration) -> Result<(), CoreError> {
    tokio::time::timeout(timeout, client.ping())
        .await
        .map_err(|_| CoreError::host_unreachable("docker ping timed out"))?
        .map_err(|e| CoreError::with_cause(crate::error::ErrorKind::DockerUnavailable, "docker ping failed", e))?;
    Ok(())
}
