use crate::schedule::Schedule;
use crate::types::ResourceId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Resource configuration: option name to value. Keys iterate in sorted order.
pub type Config = BTreeMap<String, serde_json::Value>;

/// Values a provider reports after applying a resource (generated ids, ARNs, endpoints).
pub type Outputs = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    ComputeFunction,
    Bucket,
    ApiGateway,
    Role,
    ScheduleRule,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 5] = [
        ResourceKind::ComputeFunction,
        ResourceKind::Bucket,
        ResourceKind::ApiGateway,
        ResourceKind::Role,
        ResourceKind::ScheduleRule,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::ComputeFunction => "compute_function",
            ResourceKind::Bucket => "bucket",
            ResourceKind::ApiGateway => "api_gateway",
            ResourceKind::Role => "role",
            ResourceKind::ScheduleRule => "schedule_rule",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Access a grant subject is permitted on the grant target.
///
/// `ReadWrite` subsumes `Read`. `Invoke` is incomparable with both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Read,
    ReadWrite,
    Invoke,
}

impl Capability {
    pub fn subsumes(self, other: Capability) -> bool {
        self == other || (self == Capability::ReadWrite && other == Capability::Read)
    }

    /// Least upper bound, if the two capabilities are comparable.
    pub fn join(self, other: Capability) -> Option<Capability> {
        if self.subsumes(other) {
            Some(self)
        } else if other.subsumes(self) {
            Some(other)
        } else {
            None
        }
    }

    /// Data capabilities (`Read`, `ReadWrite`) share one statement per pair.
    pub fn is_data(self) -> bool {
        matches!(self, Capability::Read | Capability::ReadWrite)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Read => write!(f, "read"),
            Capability::ReadWrite => write!(f, "read_write"),
            Capability::Invoke => write!(f, "invoke"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
    Any,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
            HttpMethod::Any => "ANY",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: ResourceId,
    pub kind: ResourceKind,
    #[serde(default)]
    pub config: Config,
    #[serde(default)]
    pub depends_on: BTreeSet<ResourceId>,
}

impl Resource {
    pub fn new(id: impl Into<ResourceId>, kind: ResourceKind) -> Self {
        Self {
            id: id.into(),
            kind,
            config: Config::new(),
            depends_on: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn with_config(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.config.insert(key.to_owned(), value.into());
        self
    }

    #[must_use]
    pub fn depends_on(mut self, id: impl Into<ResourceId>) -> Self {
        self.depends_on.insert(id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Grant {
    pub subject: ResourceId,
    pub target: ResourceId,
    pub capability: Capability,
}

impl Grant {
    pub fn new(
        subject: impl Into<ResourceId>,
        target: impl Into<ResourceId>,
        capability: Capability,
    ) -> Self {
        Self {
            subject: subject.into(),
            target: target.into(),
            capability,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Route {
    pub path: String,
    pub method: HttpMethod,
    pub target: ResourceId,
    #[serde(default)]
    pub auth_required: bool,
    /// ApiGateway resource hosting the route, if declared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<ResourceId>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Trigger {
    pub target: ResourceId,
    pub schedule: Schedule,
    /// ScheduleRule resource owning the trigger, if declared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<ResourceId>,
}

/// A relationship applied through an adapter bind operation once both of
/// its endpoints exist.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Binding {
    Grant(Grant),
    Route(Route),
    Trigger(Trigger),
}

impl Binding {
    /// Stable identity across config changes.
    ///
    /// Data grants on the same pair share a key so that widening Read to
    /// ReadWrite is an update of one statement, not a second statement.
    pub fn key(&self) -> String {
        match self {
            Binding::Grant(g) if g.capability.is_data() => {
                format!("grant:{}->{}", g.subject, g.target)
            }
            Binding::Grant(g) => format!("grant:{}->{}:{}", g.subject, g.target, g.capability),
            Binding::Route(r) => format!("route:{} {}", r.method, r.path),
            Binding::Trigger(t) => match &t.rule {
                Some(rule) => format!("trigger:{}@{}#{rule}", t.target, t.schedule),
                None => format!("trigger:{}@{}", t.target, t.schedule),
            },
        }
    }

    /// Resources that must exist before the binding can be applied.
    pub fn endpoints(&self) -> Vec<&ResourceId> {
        match self {
            Binding::Grant(g) => vec![&g.subject, &g.target],
            Binding::Route(r) => std::iter::once(&r.target).chain(r.gateway.as_ref()).collect(),
            Binding::Trigger(t) => std::iter::once(&t.target).chain(t.rule.as_ref()).collect(),
        }
    }

    /// The resource whose adapter applies the binding.
    pub fn owner(&self) -> &ResourceId {
        match self {
            Binding::Grant(g) => &g.subject,
            Binding::Route(r) => r.gateway.as_ref().unwrap_or(&r.target),
            Binding::Trigger(t) => t.rule.as_ref().unwrap_or(&t.target),
        }
    }
}

impl fmt::Display for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Binding::Grant(g) => write!(f, "grant {} {} on {}", g.subject, g.capability, g.target),
            Binding::Route(r) => write!(f, "route {} {} -> {}", r.method, r.path, r.target),
            Binding::Trigger(t) => write!(f, "trigger {} -> {}", t.schedule, t.target),
        }
    }
}

/// Normalized desired state: resources plus relationship declarations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredSpec {
    pub resources: Vec<Resource>,
    pub grants: Vec<Grant>,
    pub routes: Vec<Route>,
    pub triggers: Vec<Trigger>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::RateUnit;

    #[test]
    fn read_write_subsumes_read() {
        assert!(Capability::ReadWrite.subsumes(Capability::Read));
        assert!(!Capability::Read.subsumes(Capability::ReadWrite));
        assert_eq!(
            Capability::Read.join(Capability::ReadWrite),
            Some(Capability::ReadWrite)
        );
        assert_eq!(
            Capability::ReadWrite.join(Capability::Read),
            Some(Capability::ReadWrite)
        );
    }

    #[test]
    fn invoke_is_incomparable_with_data() {
        assert_eq!(Capability::Invoke.join(Capability::Read), None);
        assert_eq!(Capability::Invoke.join(Capability::Invoke), Some(Capability::Invoke));
    }

    #[test]
    fn kind_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&ResourceKind::ComputeFunction).unwrap(),
            "\"compute_function\""
        );
        for kind in ResourceKind::ALL {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{kind}\""));
        }
    }

    #[test]
    fn data_grant_key_ignores_capability() {
        let read = Binding::Grant(Grant::new("fn", "bucket", Capability::Read));
        let rw = Binding::Grant(Grant::new("fn", "bucket", Capability::ReadWrite));
        let invoke = Binding::Grant(Grant::new("fn", "bucket", Capability::Invoke));
        assert_eq!(read.key(), rw.key());
        assert_ne!(read.key(), invoke.key());
    }

    #[test]
    fn route_owner_prefers_gateway() {
        let mut route = Route {
            path: "/people".to_owned(),
            method: HttpMethod::Get,
            target: ResourceId::from("fn"),
            auth_required: true,
            gateway: None,
        };
        assert_eq!(Binding::Route(route.clone()).owner(), "fn");
        route.gateway = Some(ResourceId::from("api"));
        let binding = Binding::Route(route);
        assert_eq!(binding.owner(), "api");
        assert_eq!(binding.endpoints().len(), 2);
        assert_eq!(binding.key(), "route:GET /people");
    }

    #[test]
    fn trigger_key_includes_schedule() {
        let t = Binding::Trigger(Trigger {
            target: ResourceId::from("fn"),
            schedule: Schedule::rate(2, RateUnit::Hours),
            rule: None,
        });
        assert_eq!(t.key(), "trigger:fn@rate(2 hours)");
    }

    #[test]
    fn trigger_key_distinguishes_owning_rules() {
        let ruled = |rule: &str| {
            Binding::Trigger(Trigger {
                target: ResourceId::from("fn"),
                schedule: Schedule::rate(2, RateUnit::Hours),
                rule: Some(ResourceId::from(rule)),
            })
        };
        assert_eq!(ruled("nightly").key(), "trigger:fn@rate(2 hours)#nightly");
        assert_ne!(ruled("nightly").key(), ruled("backup").key());
    }
}
