use serde::{Deserialize, Serialize};

use crate::{Meta, ModelError, ServiceId, TaskSpec, Version};

/// Desired state of a replicated workload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    pub name: String,
    pub replicas: u64,
    pub task: TaskSpec,
}

impl ServiceSpec {
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.name.trim().is_empty() {
            return Err(ModelError::EmptyName);
        }
        self.task.restart.validate()
    }
}

/// A declared workload.
///
/// Owned by the API layer; the orchestrator only reads it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub id: ServiceId,
    pub spec: ServiceSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec_version: Option<Version>,
    #[serde(default)]
    pub meta: Meta,
}

impl Service {
    pub fn new(id: impl Into<ServiceId>, spec: ServiceSpec) -> Self {
        Self {
            id: id.into(),
            spec,
            spec_version: None,
            meta: Meta::default(),
        }
    }

    pub fn with_spec_version(mut self, version: Version) -> Self {
        self.spec_version = Some(version);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{RestartPolicy, RuntimeSpec};

    #[test]
    fn validate_requires_name() {
        let spec = ServiceSpec {
            name: " ".into(),
            replicas: 1,
            task: TaskSpec::default(),
        };
        assert_eq!(spec.validate(), Err(ModelError::EmptyName));
    }

    #[test]
    fn service_serde_roundtrip() {
        let svc = Service::new(
            "id1",
            ServiceSpec {
                name: "web".into(),
                replicas: 3,
                task: TaskSpec::new(RuntimeSpec::container("nginx"), RestartPolicy::default()),
            },
        )
        .with_spec_version(Version(4));

        let json = serde_json::to_string(&svc).unwrap();
        let back: Service = serde_json::from_str(&json).unwrap();
        assert_eq!(back, svc);
    }
}
