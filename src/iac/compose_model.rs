//! Typed compose-file model.
//!
//! Compose lets `environment`, `labels`, `env_file`, `ports` and `volumes`
//! each be written in more than one YAML shape (a mapping vs. a list of
//! strings, or a bare string vs. a list). Everything below normalizes at
//! parse time so the rest of the catalog scanner only ever sees one shape
//! per field; the original YAML shape never leaks past this module.

use std::collections::HashMap;

use serde::Deserialize;

use crate::db::models::iac_service::{EnvFileRef, ScannedService};
use crate::error::CoreError;

/// `environment`/`labels`: either `{K: V}` or `["K=V", ...]`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum MapOrList {
    List(Vec<String>),
    Map(HashMap<String, serde_yaml::Value>),
}

fn scalar_to_string(v: &serde_yaml::Value) -> String {
    match v {
        serde_yaml::Value::Null => String::new(),
        serde_yaml::Value::String(s) => s.clone(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        serde_yaml::Value::Number(n) => n.to_string(),
        other => serde_yaml::to_string(other).unwrap_or_default().trim().to_string(),
    }
}

fn normalize_map_or_list(v: Option<MapOrList>) -> HashMap<String, String> {
    match v {
        None => HashMap::new(),
        Some(MapOrList::List(items)) => items
            .into_iter()
            .filter_map(|item| {
                let mut parts = item.splitn(2, '=');
                let key = parts.next()?.trim().to_string();
                if key.is_empty() {
                    return None;
                }
                let value = parts.next().unwrap_or("").to_string();
                Some((key, value))
            })
            .collect(),
        Some(MapOrList::Map(map)) => map.into_iter().map(|(k, v)| (k, scalar_to_string(&v))).collect(),
    }
}

/// `env_file`: a bare string, a list of strings, or (compose long syntax) a
/// list of `{path, required}` mappings.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum EnvFileField {
    Single(String),
    List(Vec<EnvFileEntry>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum EnvFileEntry {
    Path(String),
    Long { path: String },
}

fn normalize_env_file(v: Option<EnvFileField>) -> Vec<String> {
    match v {
        None => Vec::new(),
        Some(EnvFileField::Single(path)) => vec![path],
        Some(EnvFileField::List(items)) => items
            .into_iter()
            .map(|e| match e {
                EnvFileEntry::Path(p) => p,
                EnvFileEntry::Long { path } => path,
            })
            .collect(),
    }
}

/// `ports`: a list whose items are either the short string form
/// (`"8080:80/tcp"`) or the compose long-syntax mapping.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum PortEntry {
    Short(String),
    Long {
        #[serde(default)]
        published: Option<serde_yaml::Value>,
        target: serde_yaml::Value,
        #[serde(default)]
        protocol: Option<String>,
    },
}

fn normalize_ports(items: Vec<PortEntry>) -> Vec<String> {
    items
        .into_iter()
        .map(|p| match p {
            PortEntry::Short(s) => s,
            PortEntry::Long { published, target, protocol } => {
                let target = scalar_to_string(&target);
                let proto = protocol.unwrap_or_else(|| "tcp".to_string());
                match published {
                    Some(p) => format!("{}:{}/{}", scalar_to_string(&p), target, proto),
                    None => format!("{target}/{proto}"),
                }
            }
        })
        .collect()
}

/// `volumes`: a list whose items are either the short string form
/// (`"src:dst:ro"`) or the compose long-syntax mapping.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum VolumeEntry {
    Short(String),
    Long {
        #[serde(rename = "type")]
        typ: String,
        source: Option<String>,
        target: String,
        #[serde(default)]
        read_only: bool,
    },
}

fn normalize_volumes(items: Vec<VolumeEntry>) -> Vec<String> {
    items
        .into_iter()
        .map(|v| match v {
            VolumeEntry::Short(s) => s,
            VolumeEntry::Long { typ, source, target, read_only } => {
                let mode = if read_only { "ro" } else { "rw" };
                match source {
                    Some(src) => format!("{src}:{target}:{mode}[{typ}]"),
                    None => format!("{target}:{mode}[{typ}]"),
                }
            }
        })
        .collect()
}

#[derive(Debug, Clone, Deserialize, Default)]
struct RawService {
    image: Option<String>,
    container_name: Option<String>,
    #[serde(default)]
    labels: Option<MapOrList>,
    #[serde(default)]
    environment: Option<MapOrList>,
    #[serde(default)]
    env_file: Option<EnvFileField>,
    #[serde(default)]
    ports: Vec<PortEntry>,
    #[serde(default)]
    volumes: Vec<VolumeEntry>,
    #[serde(default)]
    deploy: Option<serde_yaml::Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawComposeFile {
    #[serde(default)]
    services: HashMap<String, RawService>,
}

/// A fully-normalized compose file, ready to hand to the catalog scanner.
/// `env_file_sops` on each service's `ScannedService.env_files` is left
/// `false` here — only the scanner, which can read the file's bytes, can
/// tell whether a given reference is SOPS-encrypted.
pub fn parse_compose(yaml_text: &str) -> Result<Vec<ScannedService>, CoreError> {
    let raw: RawComposeFile = serde_yaml::from_str(yaml_text)
        .map_err(|e| CoreError::stage_failed(format!("parsing compose YAML: {e}")))?;

    let mut services: Vec<ScannedService> = raw
        .services
        .into_iter()
        .map(|(service_name, svc)| {
            let labels = normalize_map_or_list(svc.labels);
            let environment = normalize_map_or_list(svc.environment);
            let env_keys: Vec<String> = {
                let mut keys: Vec<String> = environment.keys().cloned().collect();
                keys.sort();
                keys
            };
            let env_files = normalize_env_file(svc.env_file)
                .into_iter()
                .map(|path| EnvFileRef { path, sops: false })
                .collect();
            let ports = normalize_ports(svc.ports);
            let volumes = normalize_volumes(svc.volumes);
            let deploy = svc
                .deploy
                .map(|v| yaml_value_to_json(&v))
                .unwrap_or(serde_json::Value::Null);

            ScannedService {
                service_name,
                container_name: svc.container_name,
                image: svc.image,
                labels,
                env_keys,
                env_files,
                ports,
                volumes,
                deploy,
            }
        })
        .collect();

    services.sort_by(|a, b| a.service_name.cmp(&b.service_name));
    Ok(services)
}

/// Round-trips a YAML value through text so the `deploy` block can be
/// stored as plain JSON without pulling in a direct `serde_yaml` <->
/// `serde_json` value conversion.
fn yaml_value_to_json(v: &serde_yaml::Value) -> serde_json::Value {
    let text = serde_yaml::to_string(v).unwrap_or_default();
    serde_yaml::from_str::<serde_json::Value>(&text).unwrap_or(serde_json::Value::Null)
}
