//! Component descriptors: the declarative identity of every user component.

use crate::routing::{is_reserved_subject, validate_pattern, validate_subject};
use crate::runtime::nim::AgentSpec;
use crate::runtime::webhook::SignatureVerifier;
use crate::status::{ErrorKind, ForestError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fmt::{Display, Formatter};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    Tree,
    #[serde(rename = "treehouse")]
    TreeHouse,
    Nim,
    Source,
    Songbird,
}

impl ComponentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentKind::Tree => "tree",
            ComponentKind::TreeHouse => "treehouse",
            ComponentKind::Nim => "nim",
            ComponentKind::Source => "source",
            ComponentKind::Songbird => "songbird",
        }
    }

    /// Management-API collection name (`trees`, `treehouses`, ...).
    pub fn collection(&self) -> &'static str {
        match self {
            ComponentKind::Tree => "trees",
            ComponentKind::TreeHouse => "treehouses",
            ComponentKind::Nim => "nims",
            ComponentKind::Source => "sources",
            ComponentKind::Songbird => "songbirds",
        }
    }

    /// The kinds addressable through the management API.
    pub fn from_collection(collection: &str) -> Option<Self> {
        match collection {
            "trees" => Some(ComponentKind::Tree),
            "treehouses" => Some(ComponentKind::TreeHouse),
            "nims" => Some(ComponentKind::Nim),
            "sources" => Some(ComponentKind::Source),
            _ => None,
        }
    }
}

impl Display for ComponentKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TreeSpec {
    pub watches: String,
    pub publishes: String,
    pub script: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TreeHouseSpec {
    pub subscribes: String,
    pub publishes: String,
    pub script: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NimSpec {
    pub subscribes: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publishes: Option<String>,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub agents: BTreeMap<String, AgentSpec>,
}

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceSpec {
    HttpWebhook {
        path: String,
        publishes: String,
        #[serde(default)]
        verifier: SignatureVerifier,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        secret: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        include_headers: Vec<String>,
    },
    HttpPoll {
        url: String,
        publishes: String,
        /// Seconds between cycles.
        interval: f64,
        #[serde(default = "default_method")]
        method: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        headers: BTreeMap<String, String>,
        /// Dotted JSON path into the response selecting the next cursor.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cursor: Option<String>,
    },
    Ceremony {
        /// Seconds between triggers, realized as a beat count.
        interval: f64,
        publishes: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        script: Option<String>,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SongbirdSpec {
    /// Development bird: logs instead of delivering.
    Tracing,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ComponentSpec {
    Tree(TreeSpec),
    TreeHouse(TreeHouseSpec),
    Nim(NimSpec),
    Source(SourceSpec),
    Songbird(SongbirdSpec),
}

impl ComponentSpec {
    pub fn to_value(&self) -> serde_json::Value {
        match self {
            ComponentSpec::Tree(spec) => serde_json::to_value(spec),
            ComponentSpec::TreeHouse(spec) => serde_json::to_value(spec),
            ComponentSpec::Nim(spec) => serde_json::to_value(spec),
            ComponentSpec::Source(spec) => serde_json::to_value(spec),
            ComponentSpec::Songbird(spec) => serde_json::to_value(spec),
        }
        .unwrap_or(serde_json::Value::Null)
    }
}

/// Declarative identity of one component, unique per `(kind, name)` within
/// a running supervisor.
#[derive(Clone, Debug, PartialEq)]
pub struct ComponentDescriptor {
    pub name: String,
    pub spec: ComponentSpec,
}

impl ComponentDescriptor {
    pub fn kind(&self) -> ComponentKind {
        match &self.spec {
            ComponentSpec::Tree(_) => ComponentKind::Tree,
            ComponentSpec::TreeHouse(_) => ComponentKind::TreeHouse,
            ComponentSpec::Nim(_) => ComponentKind::Nim,
            ComponentSpec::Source(_) => ComponentKind::Source,
            ComponentSpec::Songbird(_) => ComponentKind::Songbird,
        }
    }

    /// Builds a descriptor from a management-API body: the spec fields plus
    /// a `name`.
    pub fn from_api(kind: ComponentKind, body: serde_json::Value) -> Result<Self, ForestError> {
        let invalid = |message: String| ForestError::fail_with_kind(ErrorKind::ConfigInvalid, message);
        let mut body = body;
        let name = body
            .as_object_mut()
            .and_then(|object| object.remove("name"))
            .and_then(|name| name.as_str().map(str::to_string))
            .ok_or_else(|| invalid("descriptor body requires a string name".to_string()))?;

        let spec = match kind {
            ComponentKind::Tree => ComponentSpec::Tree(
                serde_json::from_value(body).map_err(|err| invalid(err.to_string()))?,
            ),
            ComponentKind::TreeHouse => ComponentSpec::TreeHouse(
                serde_json::from_value(body).map_err(|err| invalid(err.to_string()))?,
            ),
            ComponentKind::Nim => ComponentSpec::Nim(
                serde_json::from_value(body).map_err(|err| invalid(err.to_string()))?,
            ),
            ComponentKind::Source => ComponentSpec::Source(
                serde_json::from_value(body).map_err(|err| invalid(err.to_string()))?,
            ),
            ComponentKind::Songbird => ComponentSpec::Songbird(
                serde_json::from_value(body).map_err(|err| invalid(err.to_string()))?,
            ),
        };
        let descriptor = Self { name, spec };
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Validates the descriptor shape: name, subject grammar, and the
    /// reserved-prefix policy on output subjects.
    pub fn validate(&self) -> Result<(), ForestError> {
        let invalid = |message: String| ForestError::fail_with_kind(ErrorKind::ConfigInvalid, message);
        if self.name.is_empty()
            || self
                .name
                .contains(|c: char| c.is_whitespace() || c == '/' || c == '.')
        {
            return Err(invalid(format!("invalid component name {:?}", self.name)));
        }

        let check_output = |subject: &str| -> Result<(), ForestError> {
            validate_subject(subject)?;
            if is_reserved_subject(subject) {
                return Err(invalid(format!(
                    "output subject {subject:?} is reserved for the substrate"
                )));
            }
            Ok(())
        };
        let check_flow_target = |subject: &str| -> Result<(), ForestError> {
            validate_subject(subject)?;
            if !subject.starts_with("river.") {
                return Err(invalid(format!(
                    "sources flow into the river; {subject:?} does not live under river."
                )));
            }
            Ok(())
        };

        match &self.spec {
            ComponentSpec::Tree(spec) => {
                validate_pattern(&spec.watches)?;
                if !spec.watches.starts_with("river.") {
                    return Err(invalid(format!(
                        "trees watch the river; {:?} does not live under river.",
                        spec.watches
                    )));
                }
                check_output(&spec.publishes)?;
            }
            ComponentSpec::TreeHouse(spec) => {
                validate_pattern(&spec.subscribes)?;
                check_output(&spec.publishes)?;
            }
            ComponentSpec::Nim(spec) => {
                validate_pattern(&spec.subscribes)?;
                if let Some(publishes) = &spec.publishes {
                    check_output(publishes)?;
                }
            }
            ComponentSpec::Source(spec) => match spec {
                SourceSpec::HttpWebhook { path, publishes, .. } => {
                    if !path.starts_with('/') || path.len() < 2 {
                        return Err(invalid(format!("webhook path {path:?} must start with /")));
                    }
                    check_flow_target(publishes)?;
                }
                SourceSpec::HttpPoll {
                    publishes, interval, ..
                } => {
                    if *interval <= 0.0 {
                        return Err(invalid("poll interval must be positive".to_string()));
                    }
                    check_flow_target(publishes)?;
                }
                SourceSpec::Ceremony {
                    interval,
                    publishes,
                    payload,
                    script,
                } => {
                    if *interval <= 0.0 {
                        return Err(invalid("ceremony interval must be positive".to_string()));
                    }
                    if payload.is_some() == script.is_some() {
                        return Err(invalid(
                            "ceremony requires exactly one of payload or script".to_string(),
                        ));
                    }
                    check_flow_target(publishes)?;
                }
            },
            ComponentSpec::Songbird(_) => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{
        ComponentDescriptor, ComponentKind, ComponentSpec, SourceSpec, TreeHouseSpec, TreeSpec,
    };
    use crate::status::ErrorKind;
    use serde_json::json;

    fn tree(watches: &str, publishes: &str) -> ComponentDescriptor {
        ComponentDescriptor {
            name: "payment".to_string(),
            spec: ComponentSpec::Tree(TreeSpec {
                watches: watches.to_string(),
                publishes: publishes.to_string(),
                script: "payment.rhai".to_string(),
            }),
        }
    }

    #[test]
    fn trees_must_watch_the_river() {
        assert!(tree("river.stripe.>", "payment.completed").validate().is_ok());
        let err = tree("payments.>", "payment.completed").validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigInvalid);
    }

    #[test]
    fn reserved_output_subjects_are_rejected() {
        let descriptor = ComponentDescriptor {
            name: "sneaky".to_string(),
            spec: ComponentSpec::TreeHouse(TreeHouseSpec {
                subscribes: "a.b".to_string(),
                publishes: "humus.tasks.x".to_string(),
                script: "x.rhai".to_string(),
            }),
        };
        assert_eq!(
            descriptor.validate().unwrap_err().kind(),
            ErrorKind::ConfigInvalid
        );
    }

    #[test]
    fn ceremony_needs_exactly_one_payload_source() {
        let neither = ComponentDescriptor {
            name: "tick".to_string(),
            spec: ComponentSpec::Source(SourceSpec::Ceremony {
                interval: 1.0,
                publishes: "river.ticks.daily".to_string(),
                payload: None,
                script: None,
            }),
        };
        assert!(neither.validate().is_err());
        let both = ComponentDescriptor {
            name: "tick".to_string(),
            spec: ComponentSpec::Source(SourceSpec::Ceremony {
                interval: 1.0,
                publishes: "river.ticks.daily".to_string(),
                payload: Some(json!({})),
                script: Some("gen.rhai".to_string()),
            }),
        };
        assert!(both.validate().is_err());
    }

    #[test]
    fn from_api_splits_name_from_spec_fields() {
        let descriptor = ComponentDescriptor::from_api(
            ComponentKind::TreeHouse,
            json!({
                "name": "rescore",
                "subscribes": "scores.raw",
                "publishes": "scores.final",
                "script": "rescore.rhai",
            }),
        )
        .unwrap();
        assert_eq!(descriptor.name, "rescore");
        assert_eq!(descriptor.kind(), ComponentKind::TreeHouse);

        let missing_name = ComponentDescriptor::from_api(
            ComponentKind::TreeHouse,
            json!({"subscribes": "a.b", "publishes": "c.d", "script": "s.rhai"}),
        );
        assert!(missing_name.is_err());
    }

    #[test]
    fn collections_round_trip_for_api_kinds() {
        for kind in [
            ComponentKind::Tree,
            ComponentKind::TreeHouse,
            ComponentKind::Nim,
            ComponentKind::Source,
        ] {
            assert_eq!(
                ComponentKind::from_collection(kind.collection()),
                Some(kind)
            );
        }
        assert_eq!(ComponentKind::from_collection("songbirds"), None);
        assert_eq!(ComponentKind::from_collection("weeds"), None);
    }
}
