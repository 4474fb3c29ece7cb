//! Lifecycle events reported by the orchestration backend

use crate::error::IngestError;
use serde::Deserialize;
use std::collections::HashMap;

/// Container actions that mean the endpoint can take traffic
const REACHABLE_ACTIONS: &[&str] = &["start"];

/// Container actions that mean the endpoint is gone
const UNREACHABLE_ACTIONS: &[&str] = &["die", "stop", "destroy"];

/// What an event means for routing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reachability {
    Reachable,
    Unreachable,
    /// Not a container event, or an action routing does not care about
    Ignored,
}

/// A single lifecycle event, independent of how it was delivered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleEvent {
    /// Object type, e.g. `container`, `network`, `image`
    pub kind: String,
    /// Action, e.g. `start`, `die`
    pub action: String,
    /// Id of the object the event is about
    pub id: String,
    /// Actor attributes (Docker puts the container `name` here)
    pub attributes: HashMap<String, String>,
}

/// Docker's `/events` JSON shape. `id` is the legacy top-level field,
/// `Actor.ID` the current one; either may be missing.
#[derive(Debug, Deserialize)]
struct WireEvent {
    #[serde(rename = "Type")]
    kind: Option<String>,
    #[serde(rename = "Action")]
    action: Option<String>,
    #[serde(rename = "status")]
    status: Option<String>,
    id: Option<String>,
    #[serde(rename = "Actor")]
    actor: Option<WireActor>,
}

#[derive(Debug, Deserialize)]
struct WireActor {
    #[serde(rename = "ID")]
    id: Option<String>,
    #[serde(rename = "Attributes", default)]
    attributes: HashMap<String, String>,
}

impl LifecycleEvent {
    pub fn new(kind: impl Into<String>, action: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            action: action.into(),
            id: id.into(),
            attributes: HashMap::new(),
        }
    }

    /// Attach an actor attribute (builder pattern)
    pub fn with_attribute(mut self, key: &str, value: &str) -> Self {
        self.attributes.insert(key.to_string(), value.to_string());
        self
    }

    /// Decode one event in Docker's events JSON format
    pub fn from_json(bytes: &[u8]) -> Result<Self, IngestError> {
        let wire: WireEvent = serde_json::from_slice(bytes)
            .map_err(|e| IngestError::MalformedEvent(e.to_string()))?;

        let (actor_id, attributes) = match wire.actor {
            Some(actor) => (actor.id, actor.attributes),
            None => (None, HashMap::new()),
        };

        let kind = wire
            .kind
            .ok_or_else(|| IngestError::MalformedEvent("missing Type".to_string()))?;
        let action = wire
            .action
            .or(wire.status)
            .ok_or_else(|| IngestError::MalformedEvent("missing Action".to_string()))?;
        let id = actor_id
            .or(wire.id)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| IngestError::MalformedEvent("missing id".to_string()))?;

        Ok(Self {
            kind,
            action,
            id,
            attributes,
        })
    }

    /// Classify the event for the ingestor
    pub fn reachability(&self) -> Reachability {
        if self.kind != "container" {
            return Reachability::Ignored;
        }
        // Docker reports exec events as e.g. "exec_start: bash"
        let action = self.action.split(':').next().unwrap_or("").trim();
        if REACHABLE_ACTIONS.contains(&action) {
            Reachability::Reachable
        } else if UNREACHABLE_ACTIONS.contains(&action) {
            Reachability::Unreachable
        } else {
            Reachability::Ignored
        }
    }

    /// Container name from the actor attributes, if the backend sent one
    pub fn name(&self) -> Option<&str> {
        self.attributes
            .get("name")
            .map(String::as_str)
            .filter(|n| !n.is_empty())
    }
}

/// Actions the ingestor subscribes to, for server-side filtering
pub fn subscribed_actions() -> Vec<String> {
    REACHABLE_ACTIONS
        .iter()
        .chain(UNREACHABLE_ACTIONS.iter())
        .map(|a| a.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_docker_event() {
        let json = br#"{"status":"start","id":"abc123","from":"nginx","Type":"container","Action":"start","Actor":{"ID":"abc123","Attributes":{"image":"nginx","name":"app1"}},"scope":"local","time":1700000000,"timeNano":1700000000000000000}"#;
        let event = LifecycleEvent::from_json(json).unwrap();
        assert_eq!(event.kind, "container");
        assert_eq!(event.action, "start");
        assert_eq!(event.id, "abc123");
        assert_eq!(event.name(), Some("app1"));
        assert_eq!(event.reachability(), Reachability::Reachable);
    }

    #[test]
    fn test_parse_legacy_id() {
        let json = br#"{"Type":"container","Action":"die","id":"def456"}"#;
        let event = LifecycleEvent::from_json(json).unwrap();
        assert_eq!(event.id, "def456");
        assert_eq!(event.name(), None);
        assert_eq!(event.reachability(), Reachability::Unreachable);
    }

    #[test]
    fn test_invalid_json_is_malformed() {
        let err = LifecycleEvent::from_json(b"{not json").unwrap_err();
        assert!(matches!(err, IngestError::MalformedEvent(_)));
    }

    #[test]
    fn test_missing_fields_are_malformed() {
        let err = LifecycleEvent::from_json(br#"{"Action":"start","id":"x"}"#).unwrap_err();
        assert!(matches!(err, IngestError::MalformedEvent(_)));

        let err = LifecycleEvent::from_json(br#"{"Type":"container","Action":"start"}"#).unwrap_err();
        assert!(matches!(err, IngestError::MalformedEvent(_)));
    }

    #[test]
    fn test_reachability() {
        assert_eq!(
            LifecycleEvent::new("container", "destroy", "x").reachability(),
            Reachability::Unreachable
        );
        assert_eq!(
            LifecycleEvent::new("container", "create", "x").reachability(),
            Reachability::Ignored
        );
        assert_eq!(
            LifecycleEvent::new("network", "start", "x").reachability(),
            Reachability::Ignored
        );
        assert_eq!(
            LifecycleEvent::new("container", "exec_start: bash", "x").reachability(),
            Reachability::Ignored
        );
    }

    #[test]
    fn test_subscribed_actions() {
        let actions = subscribed_actions();
        assert!(actions.contains(&"start".to_string()));
        assert!(actions.contains(&"die".to_string()));
        assert_eq!(actions.len(), 4);
    }
}
