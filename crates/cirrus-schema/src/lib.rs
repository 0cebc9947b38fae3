//! Desired-spec parsing, resource model, and config identity for Cirrus.
//!
//! This crate defines the schema layer: TOML desired-spec parsing
//! (`DesiredSpecV1`), the normalized resource model (`DesiredSpec`,
//! `Resource`, `Grant`, `Route`, `Trigger`, `Binding`), schedule expressions,
//! output references inside resource config, and deterministic config
//! hashing (`config_hash`, `binding_hash`).

pub mod identity;
pub mod manifest;
pub mod model;
pub mod refs;
pub mod schedule;
pub mod types;

pub use identity::{binding_hash, canonical_json, config_hash};
pub use manifest::{
    parse_spec_file, parse_spec_str, DesiredSpecV1, GrantDecl, ManifestError, ResourceDecl,
    RouteDecl, TriggerDecl, SPEC_VERSION,
};
pub use model::{
    Binding, Capability, Config, DesiredSpec, Grant, HttpMethod, Outputs, Resource, ResourceKind,
    Route, Trigger,
};
pub use refs::{references, substitute, OutputRef, RefError};
pub use schedule::{RateUnit, Schedule, ScheduleError};
pub use types::{ConfigHash, ResourceId};
