pub mod factory;

use std::collections::HashMap;

use bollard::container::ListContainersOptions;
use bollard::errors::Error as BollardError;
use bollard::models::ContainerSummary;
use bollard::Docker;

use crate::db::models::container::{MountInfo, PortMapping, ScannedContainer};
use crate::error::CoreError;

pub use factory::{connect, ping, DockerHandle};

/// Converts a bollard transport/API error into the core's error shape.
fn docker_err(context: &str, e: BollardError) -> CoreError {
    CoreError::with_cause(crate::error::ErrorKind::DockerUnavailable, context.to_string(), e)
}

/// Every container visible on this host, running or not — the Fleet
/// Scanner needs stopped containers too so it can still attribute drift.
pub async fn list_all_containers(docker: &Docker) -> Result<Vec<ScannedContainer>, CoreError> {
    let summaries = docker
        .list_containers(Some(ListContainersOptions::<String> {
            all: true,
            ..Default::default()
        }))
        .await
        .map_err(|e| docker_err("listing containers", e))?;

    Ok(summaries.into_iter().map(to_scanned_container).collect())
}

/// Containers belonging to one Compose project, used by the Orchestrator's
/// post-apply reconciliation to get the association query fresh rows to
/// match before the Fleet Scanner's next tick.
pub async fn list_containers_by_project(
    docker: &Docker,
    project: &str,
) -> Result<Vec<ScannedContainer>, CoreError> {
    let mut filters = HashMap::new();
    filters.insert(
        "label".to_string(),
        vec![format!("com.docker.compose.project={project}")],
    );

    let summaries = docker
        .list_containers(Some(ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        }))
        .await
        .map_err(|e| docker_err(&format!("listing containers for project {project}"), e))?;

    Ok(summaries.into_iter().map(to_scanned_container).collect())
}

/// Environment variables for one container, fetched via `inspect` since the
/// list endpoint doesn't carry them. Used to fill in [`ScannedContainer::env`]
/// for containers the Drift Engine needs to hash.
pub async fn inspect_container_env(
    docker: &Docker,
    container_id: &str,
) -> Result<Vec<String>, CoreError> {
    let details = docker
        .inspect_container(container_id, None)
        .await
        .map_err(|e| docker_err(&format!("inspecting container {container_id}"), e))?;
    Ok(details
        .config
        .and_then(|c| c.env)
        .unwrap_or_default())
}

fn to_scanned_container(c: ContainerSummary) -> ScannedContainer {
    let id = c.id.unwrap_or_default();
    let names = c.names.unwrap_or_default();
    let name = names.into_iter().next().unwrap_or_else(|| id.clone());

    let ports = c
        .ports
        .unwrap_or_default()
        .into_iter()
        .map(|p| PortMapping {
            ip: p.ip,
            public_port: p.public_port,
            private_port: p.private_port,
            typ: format!("{:?}", p.typ.unwrap_or(bollard::models::PortTypeEnum::EMPTY)).to_lowercase(),
        })
        .collect();

    let labels: HashMap<String, String> = c.labels.unwrap_or_default();

    let mounts = c
        .mounts
        .unwrap_or_default()
        .into_iter()
        .map(|m| MountInfo {
            source: m.source.unwrap_or_default(),
            destination: m.destination.unwrap_or_default(),
            mode: m.mode.unwrap_or_default(),
            typ: m
                .typ
                .map(|t| format!("{t:?}").to_lowercase())
                .unwrap_or_default(),
        })
        .collect();

    let created_ts = c
        .created
        .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0));

    let ip_addr = c.network_settings.as_ref().and_then(|ns| {
        ns.networks
            .as_ref()
            .and_then(|nets| nets.values().next())
            .and_then(|n| n.ip_address.clone())
            .filter(|s| !s.is_empty())
    });

    ScannedContainer {
        container_id: id,
        name,
        image: c.image.unwrap_or_default(),
        state: c.state.unwrap_or_default(),
        status: c.status.unwrap_or_default(),
        ports,
        labels,
        env: Vec::new(),
        networks: serde_json::to_value(c.network_settings).unwrap_or(serde_json::Value::Null),
        mounts,
        created_ts,
        ip_addr,
    }
}
