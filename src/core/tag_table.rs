//! Layer 4: TagTable
//!
//! Append-only ordered sequence of optional entity slots. The tag IS the
//! slot index; deletion nulls the slot and the tag is never reused.
//!
//! INVARIANT: for every occupied slot, `slots[i].tag.index() == i`.
//!
//! Concurrency: the table itself is plain data guarded by the store's
//! write lock. Readers capture `snapshot()` (a clone of the `Arc` slots)
//! under a short read lock and iterate without any lock; the single
//! writer edits through `Arc::make_mut`, which leaves previously captured
//! revisions untouched while any reader still holds them.

use std::sync::Arc;

use super::entity::Entity;
use super::error::ConsistencyError;
use super::identity::Tag;

#[derive(Debug, Default)]
pub struct TagTable {
    slots: Vec<Option<Arc<Entity>>>,
}

impl TagTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign the next tag and publish the entity under it.
    ///
    /// The entity's own `tag` field is stamped here.
    pub fn append(&mut self, mut entity: Entity) -> Tag {
        let tag = Tag::from_index(self.slots.len());
        entity.tag = tag;
        self.slots.push(Some(Arc::new(entity)));
        tag
    }

    pub fn get(&self, tag: Tag) -> Option<&Arc<Entity>> {
        self.slots.get(tag.index()).and_then(Option::as_ref)
    }

    /// Mutable access for the single writer; clones the record only if a
    /// reader still holds the previous revision.
    pub fn get_mut(&mut self, tag: Tag) -> Option<&mut Entity> {
        self.slots
            .get_mut(tag.index())
            .and_then(Option::as_mut)
            .map(Arc::make_mut)
    }

    /// Replace the slot with a fully built entity.
    pub fn replace(&mut self, tag: Tag, entity: Entity) -> Result<(), ConsistencyError> {
        if entity.tag != tag {
            return Err(ConsistencyError {
                reason: format!("replace at {tag} with entity tagged {}", entity.tag),
            });
        }
        let len = self.slots.len();
        let slot = self.slots.get_mut(tag.index()).ok_or_else(|| ConsistencyError {
            reason: format!("replace at {tag} beyond table length {len}"),
        })?;
        *slot = Some(Arc::new(entity));
        Ok(())
    }

    /// Mark the slot deleted; the tag is retired, not recycled.
    pub fn null_out(&mut self, tag: Tag) -> Option<Arc<Entity>> {
        self.slots.get_mut(tag.index()).and_then(Option::take)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Clone the slot pointers for lock-free iteration by a reader.
    pub fn snapshot(&self) -> Vec<Option<Arc<Entity>>> {
        self.slots.clone()
    }

    pub fn iter_live(&self) -> impl Iterator<Item = &Arc<Entity>> {
        self.slots.iter().filter_map(Option::as_ref)
    }

    pub fn live_tags(&self) -> Vec<Tag> {
        self.iter_live().map(|entity| entity.tag).collect()
    }

    /// Rebuild the table from snapshot slots, preserving tag positions.
    pub(crate) fn restore(slots: Vec<Option<Entity>>) -> Result<Self, ConsistencyError> {
        let mut table = TagTable {
            slots: Vec::with_capacity(slots.len()),
        };
        for (index, slot) in slots.into_iter().enumerate() {
            if let Some(entity) = &slot {
                if entity.tag.index() != index {
                    return Err(ConsistencyError {
                        reason: format!(
                            "snapshot slot {index} holds entity tagged {}",
                            entity.tag
                        ),
                    });
                }
            }
            table.slots.push(slot.map(Arc::new));
        }
        Ok(table)
    }
}
