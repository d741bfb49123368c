//! Per-instance relation storage initialization
//!
//! Before any relation operation touches an entity, every relation of its
//! class gets a type-appropriate zero value: `None` for toOne storage, an
//! empty keyed collection for toMany storage, plus an empty junction
//! collection where a mid entity is configured. Each `(entity, relation)`
//! pair initializes exactly once, tracked by a per-instance flag; existing
//! values (e.g. written by hydration) are left untouched.

use std::collections::BTreeMap;

use crate::entity::{EntityId, RelationSlot};
use crate::error::OrmResult;
use crate::relations::collection::RelatedCollection;
use crate::relations::metadata::RelationConfig;
use crate::session::Session;

/// The zero value for a relation's backing storage
pub(crate) fn zero_slot(config: &RelationConfig) -> RelationSlot {
    if config.kind.is_collection() {
        RelationSlot::Many(RelatedCollection::new())
    } else {
        RelationSlot::Single(None)
    }
}

/// Initialize every uninitialized relation of an entity. Returns true when
/// at least one relation was newly initialized, so the caller knows whether
/// a sync pass is due. Idempotent.
pub(crate) fn initialize_entity(
    configs: &BTreeMap<String, RelationConfig>,
    session: &mut Session,
    entity: EntityId,
) -> OrmResult<bool> {
    let mut initialized_any = false;

    for (name, config) in configs {
        let record = session.entity_mut(entity)?;
        if record.relation_initialized(name) {
            continue;
        }
        if record.slot(name).is_none() {
            record.set_slot(name, zero_slot(config));
        }
        if config.mid.is_some() && record.mid_collection(name).is_none() {
            record.set_mid_collection(name, RelatedCollection::new());
        }
        record.mark_relation_initialized(name);
        initialized_any = true;
    }

    Ok(initialized_any)
}
