//! `${<resource>.<output>}` references inside resource config.
//!
//! A reference makes the referencing resource depend on the referenced one;
//! the placeholder is substituted with the referenced resource's applied
//! output at execution time.

use crate::model::Config;
use crate::types::ResourceId;
use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OutputRef {
    pub resource: ResourceId,
    pub output: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RefError {
    #[error("malformed output reference '{0}': expected '${{<resource>.<output>}}'")]
    Malformed(String),
    #[error("output '{output}' of '{resource}' is not available")]
    Unresolved { resource: String, output: String },
}

/// All output references in a config, in sorted order.
pub fn references(config: &Config) -> Result<BTreeSet<OutputRef>, RefError> {
    let mut out = BTreeSet::new();
    for value in config.values() {
        collect(value, &mut out)?;
    }
    Ok(out)
}

fn collect(value: &serde_json::Value, out: &mut BTreeSet<OutputRef>) -> Result<(), RefError> {
    match value {
        serde_json::Value::String(s) => {
            for token in scan(s)? {
                out.insert(token.reference);
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                collect(item, out)?;
            }
        }
        serde_json::Value::Object(map) => {
            for item in map.values() {
                collect(item, out)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Replace every reference using `lookup`.
///
/// A string that is exactly one placeholder takes the output's value as-is
/// (numbers stay numbers); otherwise the output is interpolated as text.
pub fn substitute<F>(config: &Config, lookup: F) -> Result<Config, RefError>
where
    F: Fn(&OutputRef) -> Option<serde_json::Value>,
{
    config
        .iter()
        .map(|(k, v)| Ok((k.clone(), substitute_value(v, &lookup)?)))
        .collect()
}

fn substitute_value<F>(value: &serde_json::Value, lookup: &F) -> Result<serde_json::Value, RefError>
where
    F: Fn(&OutputRef) -> Option<serde_json::Value>,
{
    match value {
        serde_json::Value::String(s) => substitute_str(s, lookup),
        serde_json::Value::Array(items) => items
            .iter()
            .map(|item| substitute_value(item, lookup))
            .collect::<Result<Vec<_>, _>>()
            .map(serde_json::Value::Array),
        serde_json::Value::Object(map) => map
            .iter()
            .map(|(k, v)| Ok((k.clone(), substitute_value(v, lookup)?)))
            .collect::<Result<serde_json::Map<_, _>, _>>()
            .map(serde_json::Value::Object),
        other => Ok(other.clone()),
    }
}

fn substitute_str<F>(s: &str, lookup: &F) -> Result<serde_json::Value, RefError>
where
    F: Fn(&OutputRef) -> Option<serde_json::Value>,
{
    let tokens = scan(s)?;
    if tokens.is_empty() {
        return Ok(serde_json::Value::String(s.to_owned()));
    }
    let resolve = |r: &OutputRef| {
        lookup(r).ok_or_else(|| RefError::Unresolved {
            resource: r.resource.to_string(),
            output: r.output.clone(),
        })
    };
    if tokens.len() == 1 && tokens[0].start == 0 && tokens[0].end == s.len() {
        return resolve(&tokens[0].reference);
    }
    let mut out = String::with_capacity(s.len());
    let mut cursor = 0;
    for token in &tokens {
        out.push_str(&s[cursor..token.start]);
        match resolve(&token.reference)? {
            serde_json::Value::String(text) => out.push_str(&text),
            other => out.push_str(&other.to_string()),
        }
        cursor = token.end;
    }
    out.push_str(&s[cursor..]);
    Ok(serde_json::Value::String(out))
}

struct Token {
    start: usize,
    end: usize,
    reference: OutputRef,
}

fn scan(s: &str) -> Result<Vec<Token>, RefError> {
    let mut tokens = Vec::new();
    let mut offset = 0;
    while let Some(pos) = s[offset..].find("${") {
        let start = offset + pos;
        let Some(len) = s[start..].find('}') else {
            return Err(RefError::Malformed(s[start..].to_owned()));
        };
        let end = start + len + 1;
        let inner = &s[start + 2..end - 1];
        let Some((resource, output)) = inner.split_once('.') else {
            return Err(RefError::Malformed(s[start..end].to_owned()));
        };
        let (resource, output) = (resource.trim(), output.trim());
        if resource.is_empty() || output.is_empty() {
            return Err(RefError::Malformed(s[start..end].to_owned()));
        }
        tokens.push(Token {
            start,
            end,
            reference: OutputRef {
                resource: ResourceId::new(resource),
                output: output.to_owned(),
            },
        });
        offset = end;
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cfg(value: serde_json::Value) -> Config {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn finds_nested_references() {
        let c = cfg(json!({
            "role_arn": "${lambda-role.arn}",
            "env": {"BUCKET": "${data.name}", "STATIC": "x"},
            "list": ["${data.arn}/*"]
        }));
        let refs: Vec<String> = references(&c)
            .unwrap()
            .into_iter()
            .map(|r| format!("{}.{}", r.resource, r.output))
            .collect();
        assert_eq!(refs, vec!["data.arn", "data.name", "lambda-role.arn"]);
    }

    #[test]
    fn whole_placeholder_keeps_value_type() {
        let c = cfg(json!({"port": "${api.port}"}));
        let out = substitute(&c, |_| Some(json!(8080))).unwrap();
        assert_eq!(out["port"], json!(8080));
    }

    #[test]
    fn embedded_placeholder_interpolates_text() {
        let c = cfg(json!({"resource": "${data.arn}/*"}));
        let out = substitute(&c, |_| Some(json!("arn:bucket:data"))).unwrap();
        assert_eq!(out["resource"], json!("arn:bucket:data/*"));
    }

    #[test]
    fn missing_output_is_reported() {
        let c = cfg(json!({"role": "${r.arn}"}));
        let err = substitute(&c, |_| None).unwrap_err();
        assert_eq!(
            err,
            RefError::Unresolved {
                resource: "r".to_owned(),
                output: "arn".to_owned()
            }
        );
    }

    #[test]
    fn malformed_references_are_rejected() {
        assert!(references(&cfg(json!({"a": "${nodot}"}))).is_err());
        assert!(references(&cfg(json!({"a": "${open.x"}))).is_err());
        assert!(references(&cfg(json!({"a": "${.x}"}))).is_err());
    }

    #[test]
    fn plain_strings_pass_through() {
        let c = cfg(json!({"a": "no refs here", "n": 3}));
        assert!(references(&c).unwrap().is_empty());
        assert_eq!(substitute(&c, |_| None).unwrap(), c);
    }
}
