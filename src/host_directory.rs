//! Resolves a stored [`Host`] plus the process-wide Docker transport
//! defaults into a concrete connection descriptor the Docker Client
//! Factory can dial.

use url::Url;

use crate::config::{DockerConfig, DockerTransportKind};
use crate::db::models::host::Host;
use crate::error::CoreError;

/// What to connect to and how, for one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionDescriptor {
    /// Talk to the local Docker daemon over its Unix socket.
    Local { sock_path: String },
    /// Talk to a remote daemon exposed over plain TCP.
    Tcp { host: String, port: u16 },
    /// Tunnel to the remote daemon's Unix socket over SSH.
    Ssh {
        ssh_host: String,
        ssh_port: u16,
        ssh_user: String,
        remote_sock_path: String,
    },
}

/// Parses a `docker_host`-style override (`unix://…`, `tcp://host:port`,
/// `ssh://user@host:port`) the way a Docker Engine API client would.
fn parse_override(raw: &str, docker_cfg: &DockerConfig) -> Result<ConnectionDescriptor, CoreError> {
    let url = Url::parse(raw)
        .map_err(|e| CoreError::config_invalid(format!("invalid docker_host override {raw:?}: {e}")))?;

    match url.scheme() {
        "unix" => Ok(ConnectionDescriptor::Local {
            sock_path: url.path().to_string(),
        }),
        "tcp" | "http" => {
            let host = url
                .host_str()
                .ok_or_else(|| CoreError::config_invalid(format!("{raw:?}: missing host")))?
                .to_string();
            let port = url.port().unwrap_or(docker_cfg.tcp_port);
            Ok(ConnectionDescriptor::Tcp { host, port })
        }
        "ssh" => {
            let ssh_host = url
                .host_str()
                .ok_or_else(|| CoreError::config_invalid(format!("{raw:?}: missing host")))?
                .to_string();
            let ssh_user = if url.username().is_empty() {
                docker_cfg.ssh_user.clone()
            } else {
                url.username().to_string()
            };
            let ssh_port = url.port().unwrap_or(docker_cfg.ssh_port);
            Ok(ConnectionDescriptor::Ssh {
                ssh_host,
                ssh_port,
                ssh_user,
                remote_sock_path: docker_cfg.sock_path.display().to_string(),
            })
        }
        other => Err(CoreError::config_invalid(format!(
            "{raw:?}: unsupported scheme {other:?}"
        ))),
    }
}

/// Resolve the connection descriptor for a host: a per-host
/// `vars.docker_host` override wins outright; otherwise a local host always
/// dials the local socket regardless of the global transport; otherwise the
/// global `DOCKER_CONNECTION_METHOD` default applies, addressed at the
/// host's inventory address.
pub fn resolve(host: &Host, docker_cfg: &DockerConfig) -> Result<ConnectionDescriptor, CoreError> {
    if let Some(override_raw) = host.docker_host_override() {
        return parse_override(override_raw, docker_cfg);
    }

    if host.is_local() {
        return Ok(ConnectionDescriptor::Local {
            sock_path: docker_cfg.sock_path.display().to_string(),
        });
    }

    match docker_cfg.connection_method {
        DockerTransportKind::Local => Ok(ConnectionDescriptor::Local {
            sock_path: docker_cfg.sock_path.display().to_string(),
        }),
        DockerTransportKind::Tcp => Ok(ConnectionDescriptor::Tcp {
            host: host.address.clone(),
            port: docker_cfg.tcp_port,
        }),
        DockerTransportKind::Ssh => Ok(ConnectionDescriptor::Ssh {
            ssh_host: host.address.clone(),
            ssh_port: docker_cfg.ssh_port,
            ssh_user: docker_cfg.ssh_user.clone(),
            remote_sock_path: docker_cfg.sock_path.display().to_string(),
        }),
    }
}

/// Whether resolving this host's transport would land on the local Docker
/// socket despite the host not actually being local — the case the Fleet
/// Scanner must skip rather than scan, so one local socket never silently
/// stands in for an entire remote fleet. An explicit per-host override is
/// trusted and never skipped.
pub fn should_skip_local(host: &Host, docker_cfg: &DockerConfig) -> bool {
    host.docker_host_override().is_none()
        && !host.is_local()
        && docker_cfg.connection_method == DockerTransportKind::Local
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::types::Json;
    use std::collections::HashMap;
    use std::path::PathBuf;

    fn docker_cfg(method: DockerTransportKind) -> DockerConfig {
        DockerConfig {
            connection_method: method,
            sock_path: PathBuf::from("/var/run/docker.sock"),
            tcp_port: 2375,
            ssh_user: "root".to_string(),
            ssh_port: 22,
            ssh_key_file: None,
            ssh_strict_host_key: true,
        }
    }

    fn host(address: &str, vars: HashMap<String, String>) -> Host {
        Host {
            id: 1,
            name: "h1".into(),
            address: address.into(),
            vars: Json(vars),
            groups: vec![],
            owner: None,
            updated_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn local_host_always_dials_local_socket() {
        let h = host("local", HashMap::new());
        let d = resolve(&h, &docker_cfg(DockerTransportKind::Ssh)).unwrap();
        assert_eq!(
            d,
            ConnectionDescriptor::Local { sock_path: "/var/run/docker.sock".to_string() }
        );
    }

    #[test]
    fn remote_host_uses_global_tcp_default() {
        let h = host("10.0.0.9", HashMap::new());
        let d = resolve(&h, &docker_cfg(DockerTransportKind::Tcp)).unwrap();
        assert_eq!(d, ConnectionDescriptor::Tcp { host: "10.0.0.9".to_string(), port: 2375 });
    }

    #[test]
    fn remote_host_uses_global_ssh_default() {
        let h = host("10.0.0.9", HashMap::new());
        let d = resolve(&h, &docker_cfg(DockerTransportKind::Ssh)).unwrap();
        assert_eq!(
            d,
            ConnectionDescriptor::Ssh {
                ssh_host: "10.0.0.9".to_string(),
                ssh_port: 22,
                ssh_user: "root".to_string(),
                remote_sock_path: "/var/run/docker.sock".to_string(),
            }
        );
    }

    #[test]
    fn per_host_override_wins_over_global_default() {
        let mut vars = HashMap::new();
        vars.insert("docker_host".to_string(), "tcp://10.0.0.9:2376".to_string());
        let h = host("10.0.0.9", vars);
        let d = resolve(&h, &docker_cfg(DockerTransportKind::Ssh)).unwrap();
        assert_eq!(d, ConnectionDescriptor::Tcp { host: "10.0.0.9".to_string(), port: 2376 });
    }

    #[test]
    fn should_skip_local_true_for_remote_host_under_global_local_method() {
        let h = host("10.0.0.9", HashMap::new());
        assert!(should_skip_local(&h, &docker_cfg(DockerTransportKind::Local)));
    }

    #[test]
    fn should_skip_local_false_for_actually_local_host() {
        let h = host("127.0.0.1", HashMap::new());
        assert!(!should_skip_local(&h, &docker_cfg(DockerTransportKind::Local)));
    }

    #[test]
    fn should_skip_local_false_when_override_present() {
        let mut vars = HashMap::new();
        vars.insert("docker_host".to_string(), "unix:///var/run/docker.sock".to_string());
        let h = host("10.0.0.9", vars);
        assert!(!should_skip_local(&h, &docker_cfg(DockerTransportKind::Local)));
    }

    #[test]
    fn should_skip_local_false_under_non_local_global_method() {
        let h = host("10.0.0.9", HashMap::new());
        assert!(!should_skip_local(&h, &docker_cfg(DockerTransportKind::Ssh)));
    }

    #[test]
    fn ssh_override_with_explicit_user() {
        let mut vars = HashMap::new();
        vars.insert("docker_host".to_string(), "ssh://deploy@10.0.0.9:2222".to_string());
        let h = host("10.0.0.9", vars);
        let d = resolve(&h, &docker_cfg(DockerTransportKind::Local)).unwrap();
        assert_eq!(
            d,
            ConnectionDescriptor::Ssh {
                ssh_host: "10.0.0.9".to_string(),
                ssh_port: 2222,
                ssh_user: "deploy".to_string(),
                remote_sock_path: "/var/run/docker.sock".to_string(),
            }
        );
    }
}
