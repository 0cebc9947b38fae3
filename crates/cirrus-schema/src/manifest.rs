use crate::model::{
    Capability, Config, DesiredSpec, Grant, HttpMethod, Resource, ResourceKind, Route, Trigger,
};
use crate::schedule::{Schedule, ScheduleError};
use crate::types::ResourceId;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Supported desired-spec format version.
pub const SPEC_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read desired spec: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse desired spec: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("unsupported spec_version: {0}, expected 1")]
    UnsupportedVersion(u32),
    #[error("resource id must not be empty")]
    EmptyId,
    #[error("{field} of {kind} declaration must not be empty")]
    EmptyReference { kind: &'static str, field: &'static str },
    #[error("invalid schedule for trigger on '{target}': {source}")]
    InvalidSchedule {
        target: String,
        #[source]
        source: ScheduleError,
    },
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DesiredSpecV1 {
    pub spec_version: u32,
    #[serde(default, rename = "resource")]
    pub resources: Vec<ResourceDecl>,
    #[serde(default, rename = "grant")]
    pub grants: Vec<GrantDecl>,
    #[serde(default, rename = "route")]
    pub routes: Vec<RouteDecl>,
    #[serde(default, rename = "trigger")]
    pub triggers: Vec<TriggerDecl>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ResourceDecl {
    pub id: String,
    pub kind: ResourceKind,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub config: Config,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct GrantDecl {
    pub subject: String,
    pub target: String,
    pub capability: Capability,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RouteDecl {
    pub path: String,
    pub method: HttpMethod,
    pub target: String,
    #[serde(default)]
    pub auth_required: bool,
    #[serde(default)]
    pub gateway: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TriggerDecl {
    pub target: String,
    pub schedule: String,
    #[serde(default)]
    pub rule: Option<String>,
}

impl DesiredSpecV1 {
    /// Normalize the declarations: trim ids, parse schedules, collapse
    /// repeated `depends_on` entries. Declaration order of resources is kept;
    /// duplicate and dangling ids are left for graph validation.
    pub fn normalize(&self) -> Result<DesiredSpec, ManifestError> {
        if self.spec_version != SPEC_VERSION {
            return Err(ManifestError::UnsupportedVersion(self.spec_version));
        }

        let mut resources = Vec::with_capacity(self.resources.len());
        for decl in &self.resources {
            let id = decl.id.trim();
            if id.is_empty() {
                return Err(ManifestError::EmptyId);
            }
            let mut depends_on = std::collections::BTreeSet::new();
            for dep in &decl.depends_on {
                depends_on.insert(required_id(dep, "resource", "depends_on")?);
            }
            resources.push(Resource {
                id: ResourceId::new(id),
                kind: decl.kind,
                config: decl.config.clone(),
                depends_on,
            });
        }

        let grants = self
            .grants
            .iter()
            .map(|g| {
                Ok(Grant {
                    subject: required_id(&g.subject, "grant", "subject")?,
                    target: required_id(&g.target, "grant", "target")?,
                    capability: g.capability,
                })
            })
            .collect::<Result<Vec<_>, ManifestError>>()?;

        let routes = self
            .routes
            .iter()
            .map(|r| {
                Ok(Route {
                    path: r.path.trim().to_owned(),
                    method: r.method,
                    target: required_id(&r.target, "route", "target")?,
                    auth_required: r.auth_required,
                    gateway: r
                        .gateway
                        .as_deref()
                        .map(|g| required_id(g, "route", "gateway"))
                        .transpose()?,
                })
            })
            .collect::<Result<Vec<_>, ManifestError>>()?;

        let triggers = self
            .triggers
            .iter()
            .map(|t| {
                let target = required_id(&t.target, "trigger", "target")?;
                let schedule =
                    Schedule::parse(&t.schedule).map_err(|source| ManifestError::InvalidSchedule {
                        target: target.to_string(),
                        source,
                    })?;
                Ok(Trigger {
                    target,
                    schedule,
                    rule: t
                        .rule
                        .as_deref()
                        .map(|r| required_id(r, "trigger", "rule"))
                        .transpose()?,
                })
            })
            .collect::<Result<Vec<_>, ManifestError>>()?;

        Ok(DesiredSpec {
            resources,
            grants,
            routes,
            triggers,
        })
    }
}

fn required_id(
    raw: &str,
    kind: &'static str,
    field: &'static str,
) -> Result<ResourceId, ManifestError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ManifestError::EmptyReference { kind, field });
    }
    Ok(ResourceId::new(trimmed))
}

pub fn parse_spec_str(input: &str) -> Result<DesiredSpecV1, ManifestError> {
    Ok(toml::from_str(input)?)
}

pub fn parse_spec_file(path: impl AsRef<Path>) -> Result<DesiredSpecV1, ManifestError> {
    let content = fs::read_to_string(path)?;
    parse_spec_str(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
spec_version = 1

[[resource]]
id = "lambda-role"
kind = "role"
[resource.config]
assumed_by = "lambda.amazonaws.com"

[[resource]]
id = "read-people"
kind = "compute_function"
depends_on = ["lambda-role", "lambda-role"]
[resource.config]
memory_mb = 128
role_arn = "${lambda-role.arn}"
[resource.config.environment]
FILE_NAME = "people_in_space.json"

[[resource]]
id = "data"
kind = "bucket"

[[grant]]
subject = "read-people"
target = "data"
capability = "read"

[[route]]
path = "/people"
method = "GET"
target = "read-people"
auth_required = true

[[trigger]]
target = "read-people"
schedule = "rate(2 hours)"
"#;

    #[test]
    fn parses_full_spec() {
        let spec = parse_spec_str(FULL).expect("should parse");
        assert_eq!(spec.spec_version, 1);
        assert_eq!(spec.resources.len(), 3);
        assert_eq!(spec.grants.len(), 1);
        assert_eq!(spec.routes[0].method, HttpMethod::Get);
        assert_eq!(spec.resources[1].config["memory_mb"], serde_json::json!(128));
        assert_eq!(
            spec.resources[1].config["environment"]["FILE_NAME"],
            serde_json::json!("people_in_space.json")
        );
    }

    #[test]
    fn normalize_dedupes_dependencies_and_parses_schedule() {
        let spec = parse_spec_str(FULL).unwrap().normalize().unwrap();
        assert_eq!(spec.resources[1].depends_on.len(), 1);
        assert_eq!(spec.triggers[0].schedule.to_string(), "rate(2 hours)");
        assert!(spec.routes[0].auth_required);
        assert_eq!(spec.resources[0].kind, ResourceKind::Role);
    }

    #[test]
    fn parses_minimal_spec() {
        let spec = parse_spec_str("spec_version = 1\n").unwrap().normalize().unwrap();
        assert!(spec.resources.is_empty());
    }

    #[test]
    fn rejects_unknown_fields() {
        let input = r#"
spec_version = 1
[[resource]]
id = "a"
kind = "bucket"
colour = "blue"
"#;
        assert!(parse_spec_str(input).is_err());
    }

    #[test]
    fn rejects_unknown_kind_and_capability() {
        let kind = "spec_version = 1\n[[resource]]\nid = \"a\"\nkind = \"queue\"\n";
        assert!(parse_spec_str(kind).is_err());
        let cap = "spec_version = 1\n[[grant]]\nsubject = \"a\"\ntarget = \"b\"\ncapability = \"admin\"\n";
        assert!(parse_spec_str(cap).is_err());
    }

    #[test]
    fn rejects_unsupported_version() {
        let spec = parse_spec_str("spec_version = 2\n").unwrap();
        assert!(matches!(
            spec.normalize(),
            Err(ManifestError::UnsupportedVersion(2))
        ));
    }

    #[test]
    fn rejects_empty_ids() {
        let input = "spec_version = 1\n[[resource]]\nid = \"  \"\nkind = \"bucket\"\n";
        assert!(matches!(
            parse_spec_str(input).unwrap().normalize(),
            Err(ManifestError::EmptyId)
        ));
    }

    #[test]
    fn invalid_schedule_names_target() {
        let input = "spec_version = 1\n[[trigger]]\ntarget = \"job\"\nschedule = \"hourly\"\n";
        let err = parse_spec_str(input).unwrap().normalize().unwrap_err();
        assert!(err.to_string().contains("job"));
    }

    #[test]
    fn parse_spec_file_reads_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cirrus.toml");
        std::fs::write(&path, FULL).unwrap();
        let spec = parse_spec_file(&path).unwrap();
        assert_eq!(spec.resources[0].id, "lambda-role");
    }
}
