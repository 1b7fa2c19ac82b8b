use std::collections::{BTreeMap, BTreeSet};

use ulid::Ulid;

use crate::model::*;

use super::conflict::live_allocations_for_resource;
use super::store::Store;
use super::EngineError;

/// Every pair of allocations on the same resource whose spans intersect.
///
/// Per resource: sort by start, then sweep keeping the set of allocations
/// still open at the current start. Each newcomer pairs with exactly the open
/// ones, so a chain `[9,11) [10,12) [11,13)` yields (1,2) and (2,3) but not
/// (1,3), while a true cluster yields all its pairs. Output is ordered by
/// resource, then lower id, then higher id.
pub fn detect_conflicts(allocations: &[Allocation], scope: Scope) -> Vec<ConflictPair> {
    let mut groups: BTreeMap<Ulid, Vec<&Allocation>> = BTreeMap::new();
    for a in allocations {
        if let Scope::SingleResource(rid) = scope
            && a.resource_id != rid
        {
            continue;
        }
        groups.entry(a.resource_id).or_default().push(a);
    }

    let mut pairs = BTreeSet::new();
    for (resource_id, mut group) in groups {
        group.sort_by_key(|a| (a.span.start(), a.id));

        let mut open: Vec<&Allocation> = Vec::new();
        for current in group {
            // Half-open: anything ending at or before this start is done.
            open.retain(|a| a.span.end() > current.span.start());
            for a in &open {
                pairs.insert(ConflictPair::new(resource_id, a.id, current.id));
            }
            open.push(current);
        }
    }

    pairs.into_iter().collect()
}

/// Gather allocations through the store and run the sweep. A named resource
/// that does not exist is `NotFound`; allocations whose event is gone are
/// skipped.
pub fn detect_in_store<S: Store + ?Sized>(store: &S, scope: Scope) -> Result<Vec<ConflictPair>, EngineError> {
    let allocations = match scope {
        Scope::SingleResource(rid) => {
            store.get_resource(rid).ok_or(EngineError::NotFound(rid))?;
            live_allocations_for_resource(store, rid)
        }
        Scope::AllResources => store
            .list_resources()
            .into_iter()
            .flat_map(|r| live_allocations_for_resource(store, r.id))
            .collect(),
    };
    Ok(detect_conflicts(&allocations, scope))
}
