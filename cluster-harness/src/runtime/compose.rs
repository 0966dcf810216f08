//! Compose file rendering.
//!
//! Compose accepts JSON as well as YAML, so the file is rendered with
//! `serde_json` from the visible service definitions.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::service::{HealthCheck, ServiceDefinition};

/// Top-level compose document.
#[derive(Debug, Serialize)]
pub struct ComposeFile {
    services: BTreeMap<String, ComposeService>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    volumes: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct ComposeService {
    image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    entrypoint: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    command: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    ports: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    environment: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    volumes: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    depends_on: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    healthcheck: Option<ComposeHealthcheck>,
    init: bool,
}

#[derive(Debug, Serialize)]
struct ComposeHealthcheck {
    test: Vec<String>,
    interval: String,
    start_period: String,
    retries: u32,
}

impl From<&HealthCheck> for ComposeHealthcheck {
    fn from(check: &HealthCheck) -> Self {
        Self {
            test: check.test.clone(),
            interval: format!("{}ms", check.interval.as_millis()),
            start_period: format!("{}ms", check.start_period.as_millis()),
            retries: check.retries,
        }
    }
}

impl From<&ServiceDefinition> for ComposeService {
    fn from(def: &ServiceDefinition) -> Self {
        Self {
            image: def.image.clone(),
            entrypoint: def.entrypoint.clone(),
            command: def.command.clone(),
            // Bare container port: compose picks a free host port.
            ports: def.ports.iter().map(|p| p.to_string()).collect(),
            environment: def.environment.clone(),
            volumes: def.volumes.clone(),
            depends_on: def.depends_on.iter().cloned().collect(),
            healthcheck: def.healthcheck.as_ref().map(Into::into),
            init: true,
        }
    }
}

impl ComposeFile {
    /// Build a compose document from service definitions.
    pub fn from_definitions(defs: &[ServiceDefinition]) -> Self {
        let mut services = BTreeMap::new();
        let mut volumes = BTreeMap::new();

        for def in defs {
            for volume in def.named_volumes() {
                volumes.insert(volume.to_string(), serde_json::json!({}));
            }
            services.insert(def.name.clone(), ComposeService::from(def));
        }

        Self { services, volumes }
    }

    /// Render as pretty JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
