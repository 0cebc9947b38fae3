use crate::model::{Binding, Config, ResourceKind};
use crate::types::ConfigHash;
use serde::Serialize;

/// Serialize a value to JSON with object keys in sorted order.
///
/// `serde_json::Value` maps are `BTreeMap`-backed, so round-tripping through
/// `Value` fixes key order regardless of how the input was declared.
pub fn canonical_json(value: &impl Serialize) -> Result<String, serde_json::Error> {
    let v = serde_json::to_value(value)?;
    serde_json::to_string(&v)
}

/// Deterministic hash of a resource's kind and configuration.
pub fn config_hash(kind: ResourceKind, config: &Config) -> Result<ConfigHash, serde_json::Error> {
    let mut hasher = blake3::Hasher::new();
    hasher.update(format!("kind:{kind}\n").as_bytes());
    hasher.update(canonical_json(config)?.as_bytes());
    Ok(ConfigHash::new(hasher.finalize().to_hex().to_string()))
}

/// Deterministic hash of a binding's full declaration.
pub fn binding_hash(binding: &Binding) -> Result<ConfigHash, serde_json::Error> {
    let json = canonical_json(binding)?;
    Ok(ConfigHash::new(blake3::hash(json.as_bytes()).to_hex().to_string()))
}
