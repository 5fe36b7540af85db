//! Local Unix socket fronting a remote Unix socket, reached over an
//! authenticated SSH session via the `direct-streamlocal@openssh.com`
//! channel type — the same mechanism `ssh -L` uses for Unix sockets.

use std::path::PathBuf;
use std::sync::Arc;

use russh::ChannelMsg;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::DockerConfig;
use crate::error::CoreError;
use crate::ssh::pool::{self, SshHandle};

pub struct SshTunnel {
    local_path: PathBuf,
    cancel: CancellationToken,
}

impl SshTunnel {
    pub async fn open(
        ssh_host: &str,
        ssh_port: u16,
        ssh_user: &str,
        remote_sock_path: &str,
        docker_cfg: &DockerConfig,
    ) -> Result<Self, CoreError> {
        let session = pool::get_or_connect(ssh_host, ssh_port, ssh_user, docker_cfg).await?;

        let dir = tempfile::tempdir()
            .map_err(|e| CoreError::stage_failed(format!("creating tunnel socket dir: {e}")))?;
        let local_path = dir.path().join("docker.sock");

        let listener = UnixListener::bind(&local_path)
            .map_err(|e| CoreError::stage_failed(format!("binding local tunnel socket: {e}")))?;

        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let remote_path = remote_sock_path.to_string();

        tokio::spawn(accept_loop(listener, session, remote_path, task_cancel, dir));

        Ok(Self { local_path, cancel })
    }

    pub fn local_socket_path(&self) -> &std::path::Path {
        &self.local_path
    }
}

impl Drop for SshTunnel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn accept_loop(
    listener: UnixListener,
    session: Arc<SshHandle>,
    remote_path: String,
    cancel: CancellationToken,
    // Held for the tunnel's lifetime so the temp directory isn't removed
    // out from under the bound socket.
    _dir: tempfile::TempDir,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(remote_path, "tunnel cancelled, stopping accept loop");
                return;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => {
                        let session = session.clone();
                        let remote_path = remote_path.clone();
                        let cancel = cancel.clone();
                        tokio::spawn(async move {
                            if let Err(e) = pump(stream, &session, &remote_path, cancel).await {
                                warn!(remote_path, error = %e, "tunnel connection ended with error");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "tunnel accept failed");
                        return;
                    }
                }
            }
        }
    }
}

async fn pump(
    mut local: UnixStream,
    session: &SshHandle,
    remote_path: &str,
    cancel: CancellationToken,
) -> Result<(), CoreError> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let mut channel = session
        .channel_open_direct_streamlocal(remote_path, "localhost", 0)
        .await
        .map_err(|e| CoreError::host_unreachable(format!("opening streamlocal channel: {e}")))?;

    let mut buf = [0u8; 16 * 1024];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            read = local.read(&mut buf) => {
                match read {
                    Ok(0) => {
                        channel.eof().await.ok();
                        return Ok(());
                    }
                    Ok(n) => {
                        channel.data(&buf[..n]).await
                            .map_err(|e| CoreError::host_unreachable(format!("writing to ssh channel: {e}")))?;
                    }
                    Err(e) => return Err(CoreError::stage_failed(format!("reading local socket: {e}"))),
                }
            }
            msg = channel.wait() => {
                match msg {
                    Some(ChannelMsg::Data { data }) => {
                        local.write_all(&data).await
                            .map_err(|e| CoreError::stage_failed(format!("writing local socket: {e}")))?;
                    }
                    Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => return Ok(()),
                    _ => {}
                }
            }
        }
    }
}
