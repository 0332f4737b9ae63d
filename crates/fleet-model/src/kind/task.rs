use serde::{Deserialize, Serialize};

use crate::RestartPolicy;

/// Runtime backend of a task together with the parameters it is launched with.
///
/// Opaque to the orchestrator: it is copied into every task and compared for staleness only.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RuntimeSpec {
    /// Run inside an OCI-compatible container.
    Container {
        image: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        command: Option<Vec<String>>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        args: Vec<String>,
        /// `KEY=VALUE` pairs.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        env: Vec<String>,
    },
    /// Run a native process on the host.
    Exec {
        command: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        args: Vec<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        env: Vec<String>,
    },
}

impl RuntimeSpec {
    pub fn container(image: impl Into<String>) -> Self {
        RuntimeSpec::Container {
            image: image.into(),
            command: None,
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    /// Short symbolic identifier for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            RuntimeSpec::Container { .. } => "container",
            RuntimeSpec::Exec { .. } => "exec",
        }
    }
}

impl Default for RuntimeSpec {
    fn default() -> Self {
        RuntimeSpec::container("")
    }
}

/// Template every task of a service is created from.
///
/// Any difference between a task's snapshot and the service's current template marks the
/// task stale, `force_update` included: bumping it recreates tasks without other changes.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSpec {
    pub runtime: RuntimeSpec,
    #[serde(default)]
    pub restart: RestartPolicy,
    #[serde(default)]
    pub force_update: u64,
}

impl TaskSpec {
    pub fn new(runtime: RuntimeSpec, restart: RestartPolicy) -> Self {
        Self {
            runtime,
            restart,
            force_update: 0,
        }
    }
}
