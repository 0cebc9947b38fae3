use cirrus_schema::{Capability, Grant, ResourceId};
use std::collections::BTreeMap;

#[derive(Default)]
struct PairStatements {
    data: Option<Capability>,
    invoke: bool,
}

/// Collapse declared grants to the least upper bound per `(subject, target)`.
///
/// `ReadWrite` absorbs `Read`. `Invoke` is incomparable with both, so a pair
/// yields at most one data statement and at most one `Invoke` statement.
/// The result is sorted by subject, target, capability.
pub fn resolve_grants(grants: &[Grant]) -> Vec<Grant> {
    let mut pairs: BTreeMap<(&ResourceId, &ResourceId), PairStatements> = BTreeMap::new();
    for grant in grants {
        let entry = pairs.entry((&grant.subject, &grant.target)).or_default();
        if grant.capability.is_data() {
            entry.data = Some(match entry.data {
                Some(current) => current.join(grant.capability).unwrap_or(current),
                None => grant.capability,
            });
        } else {
            entry.invoke = true;
        }
    }

    let mut resolved = Vec::with_capacity(pairs.len());
    for ((subject, target), statements) in pairs {
        if let Some(capability) = statements.data {
            resolved.push(Grant::new(subject.clone(), target.clone(), capability));
        }
        if statements.invoke {
            resolved.push(Grant::new(subject.clone(), target.clone(), Capability::Invoke));
        }
    }
    resolved
}
