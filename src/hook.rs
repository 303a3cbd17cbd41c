//! The hook callback service.
//!
//! The droplet executor runs a curl command at each OCI lifecycle stage;
//! the command POSTs the runtime's state JSON to the hook endpoint with
//! the stage name in the `X-Hook-Event` header. This service interprets
//! those callbacks: it keeps a per-container state machine so the control
//! plane knows how far each container has progressed.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;
use tracing::info;

// =============================================================================
// Hook Events
// =============================================================================

/// OCI lifecycle stages the droplet executor calls back at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookEvent {
    /// After runtime state exists, before the container environment.
    CreateRuntime,
    /// After the container environment, before the process starts.
    CreateContainer,
    /// After the container process has started.
    Poststart,
    /// Before the container process is stopped.
    StopContainer,
    /// After the container has been deleted.
    Poststop,
}

impl HookEvent {
    /// Stage name as carried in the `X-Hook-Event` header.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CreateRuntime => "createRuntime",
            Self::CreateContainer => "createContainer",
            Self::Poststart => "poststart",
            Self::StopContainer => "stopContainer",
            Self::Poststop => "poststop",
        }
    }
}

impl FromStr for HookEvent {
    type Err = Error;

    fn from_str(event: &str) -> Result<Self> {
        match event {
            "createRuntime" => Ok(Self::CreateRuntime),
            "createContainer" => Ok(Self::CreateContainer),
            "poststart" => Ok(Self::Poststart),
            "stopContainer" => Ok(Self::StopContainer),
            "poststop" => Ok(Self::Poststop),
            _ => Err(Error::UnknownHookEvent {
                event: event.to_string(),
            }),
        }
    }
}

impl fmt::Display for HookEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Droplet State Document
// =============================================================================

/// The OCI state document the executor pipes into each hook's curl.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DropletState {
    /// OCI spec version of the state schema.
    #[serde(default)]
    pub oci_version: String,
    /// Container id.
    #[serde(default)]
    pub id: String,
    /// Executor-reported status string.
    #[serde(default)]
    pub status: String,
    /// Container process id, when one exists.
    #[serde(default)]
    pub pid: Option<i64>,
    /// Bundle directory.
    #[serde(default)]
    pub bundle: String,
    /// Free-form annotations.
    #[serde(default)]
    pub annotations: HashMap<String, String>,
}

// =============================================================================
// Container State Machine
// =============================================================================

/// Progress of one container through the OCI lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// Runtime state exists; environment not yet assembled.
    Creating,
    /// Container fully constructed but not started.
    Created,
    /// Container process is running.
    Running,
    /// Container process has stopped.
    Stopped,
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Creating => f.write_str("creating"),
            Self::Created => f.write_str("created"),
            Self::Running => f.write_str("running"),
            Self::Stopped => f.write_str("stopped"),
        }
    }
}

/// Applies hook callbacks to the per-container state machine.
///
/// Out-of-order events overwrite the recorded status; the executor
/// linearizes stages within one container, so overwrites only happen
/// across delete/recreate races, where last-writer-wins is correct.
#[derive(Default)]
pub struct HookService {
    csm: Mutex<HashMap<String, ContainerStatus>>,
}

impl HookService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dispatches one callback. Returns the status now recorded for the
    /// container, or `None` after poststop removed the entry.
    pub fn apply(&self, event: HookEvent, state: &DropletState) -> Result<Option<ContainerStatus>> {
        if state.id.is_empty() {
            return Err(Error::InvalidHookState {
                reason: "state document carries no container id".to_string(),
            });
        }

        let mut csm = self.csm.lock().unwrap_or_else(|poison| poison.into_inner());
        let recorded = match event {
            HookEvent::CreateRuntime => {
                csm.insert(state.id.clone(), ContainerStatus::Creating);
                Some(ContainerStatus::Creating)
            }
            HookEvent::CreateContainer => {
                csm.insert(state.id.clone(), ContainerStatus::Created);
                Some(ContainerStatus::Created)
            }
            HookEvent::Poststart => {
                csm.insert(state.id.clone(), ContainerStatus::Running);
                Some(ContainerStatus::Running)
            }
            HookEvent::StopContainer => {
                csm.insert(state.id.clone(), ContainerStatus::Stopped);
                Some(ContainerStatus::Stopped)
            }
            HookEvent::Poststop => {
                csm.remove(&state.id);
                None
            }
        };

        info!(
            container_id = %state.id,
            event = %event,
            status = recorded.map(|s| s.to_string()).unwrap_or_else(|| "gone".to_string()),
            "hook applied"
        );
        Ok(recorded)
    }

    /// Currently recorded status of a container, if any.
    pub fn status(&self, container_id: &str) -> Option<ContainerStatus> {
        let csm = self.csm.lock().unwrap_or_else(|poison| poison.into_inner());
        csm.get(container_id).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_for(id: &str) -> DropletState {
        DropletState {
            id: id.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_event_parsing() {
        assert_eq!(
            "createRuntime".parse::<HookEvent>().unwrap(),
            HookEvent::CreateRuntime
        );
        assert_eq!(
            "poststop".parse::<HookEvent>().unwrap(),
            HookEvent::Poststop
        );
        assert!(matches!(
            "CreateRuntime".parse::<HookEvent>(),
            Err(Error::UnknownHookEvent { .. })
        ));
    }

    #[test]
    fn test_lifecycle_transitions() {
        let service = HookService::new();
        let state = state_for("c1");

        service.apply(HookEvent::CreateRuntime, &state).unwrap();
        assert_eq!(service.status("c1"), Some(ContainerStatus::Creating));

        service.apply(HookEvent::CreateContainer, &state).unwrap();
        assert_eq!(service.status("c1"), Some(ContainerStatus::Created));

        service.apply(HookEvent::Poststart, &state).unwrap();
        assert_eq!(service.status("c1"), Some(ContainerStatus::Running));

        service.apply(HookEvent::StopContainer, &state).unwrap();
        assert_eq!(service.status("c1"), Some(ContainerStatus::Stopped));

        service.apply(HookEvent::Poststop, &state).unwrap();
        assert_eq!(service.status("c1"), None);
    }

    #[test]
    fn test_missing_id_rejected() {
        let service = HookService::new();
        let err = service
            .apply(HookEvent::Poststart, &DropletState::default())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidHookState { .. }));
    }

    #[test]
    fn test_state_document_camel_case() {
        let raw = r#"{"ociVersion": "1.0.2", "id": "c1", "status": "created",
                      "pid": 4242, "bundle": "/var/lib/condenser/containers/c1"}"#;
        let state: DropletState = serde_json::from_str(raw).unwrap();
        assert_eq!(state.id, "c1");
        assert_eq!(state.pid, Some(4242));
        assert_eq!(state.oci_version, "1.0.2");
    }
}
