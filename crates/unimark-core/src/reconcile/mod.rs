//! Reconciliation handlers: the per-entity map functions.
//!
//! Both handlers are idempotent against current store state — they
//! re-derive and re-compare on every invocation, never assuming a fresh
//! view — so at-least-once task delivery is safe. Data-consistency
//! anomalies are recorded as discrepancy logs or silently corrected
//! depending on mode; they are never errors.


use std::sync::Arc;

use tracing::info;

use crate::action::{LogKind, append_log};
use crate::derive::MarkerKeyDeriver;
use crate::marker::{BackRef, MarkerRecord};
use crate::queue::ShardTask;
use crate::scan::EntityHandler;
use crate::store::{Entity, EntityStore, StoreError};

/// Verifies one primary instance against its expected markers.
///
/// In repair mode, missing markers are created, absent back-references
/// are set, and legacy-encoded back-references are rewritten in the
/// structured form; all writes for one instance are batched into a
/// single put at the end. In check mode every finding becomes a log
/// entry instead. A marker owned by a *different* instance is logged in
/// both modes — repairing it would corrupt the other owner.
pub struct CheckRepairHandler {
    deriver: Arc<dyn MarkerKeyDeriver>,
    repair: bool,
}

impl CheckRepairHandler {
    /// Build a handler; `repair` selects correct-vs-log behavior.
    #[must_use]
    pub fn new(deriver: Arc<dyn MarkerKeyDeriver>, repair: bool) -> Self {
        Self { deriver, repair }
    }
}

impl EntityHandler for CheckRepairHandler {
    fn handle(
        &self,
        store: &dyn EntityStore,
        task: &ShardTask,
        entity: &Entity,
    ) -> Result<(), StoreError> {
        let expected = self.deriver.derive(&task.model, entity);
        if expected.is_empty() {
            return Ok(());
        }

        let marker_keys: Vec<_> = expected.iter().map(|n| MarkerRecord::key(n)).collect();
        let found = store.get_many(&marker_keys)?;

        let instance_key = entity.key.clone();
        let instance_encoded = instance_key.encode();
        let mut to_save: Vec<Entity> = Vec::new();

        for (name, marker_entity) in expected.iter().zip(found) {
            let marker_encoded = MarkerRecord::key(name).encode();

            let Some(marker_entity) = marker_entity else {
                // Missing marker
                if self.repair {
                    to_save.push(MarkerRecord::new(name, instance_key.clone()).to_entity()?);
                } else {
                    append_log(
                        store,
                        task.action_id,
                        LogKind::MissingMarker,
                        &instance_encoded,
                        &marker_encoded,
                    )?;
                }
                continue;
            };

            let mut marker = MarkerRecord::from_entity(&marker_entity)?;
            match marker.instance.clone() {
                None => {
                    // Marker with missing back-reference
                    if self.repair {
                        marker.instance = Some(BackRef::Key(instance_key.clone()));
                        to_save.push(marker.to_entity()?);
                    } else {
                        append_log(
                            store,
                            task.action_id,
                            LogKind::MissingInstance,
                            &instance_encoded,
                            &marker_encoded,
                        )?;
                    }
                }
                Some(BackRef::Key(owner)) if owner == instance_key => {
                    // Correctly assigned; nothing to do.
                }
                Some(back_ref) => {
                    let owner = back_ref.normalized();
                    if back_ref.is_legacy() {
                        // Legacy string encoding: normalize before the
                        // ownership comparison.
                        if self.repair {
                            if let Some(normalized) = owner.clone() {
                                marker.instance = Some(BackRef::Key(normalized));
                                to_save.push(marker.to_entity()?);
                            }
                        } else {
                            append_log(
                                store,
                                task.action_id,
                                LogKind::OldInstanceKey,
                                &instance_encoded,
                                &marker_encoded,
                            )?;
                        }
                    }
                    if owner.as_ref() != Some(&instance_key) {
                        // Assigned to a different instance. Logged in
                        // repair mode too: reassigning would break the
                        // other instance.
                        append_log(
                            store,
                            task.action_id,
                            LogKind::AlreadyAssigned,
                            &instance_encoded,
                            &marker_encoded,
                        )?;
                    }
                }
            }
        }

        if !to_save.is_empty() {
            store.put_many(&to_save)?;
        }
        Ok(())
    }
}

/// Deletes markers that no longer correspond to a live, matching
/// instance. Maps over the marker store directly.
pub struct CleanHandler {
    deriver: Arc<dyn MarkerKeyDeriver>,
}

impl CleanHandler {
    /// Build a clean handler.
    #[must_use]
    pub fn new(deriver: Arc<dyn MarkerKeyDeriver>) -> Self {
        Self { deriver }
    }
}

impl EntityHandler for CleanHandler {
    fn handle(
        &self,
        store: &dyn EntityStore,
        task: &ShardTask,
        entity: &Entity,
    ) -> Result<(), StoreError> {
        let marker = MarkerRecord::from_entity(entity)?;
        if !marker.belongs_to_model(&task.model) {
            // Only markers for the target model.
            return Ok(());
        }

        let Some(owner_key) = marker.instance.as_ref().and_then(BackRef::normalized) else {
            // No resolvable back-reference; check/repair owns that
            // anomaly, clean leaves it alone.
            return Ok(());
        };

        let owner = store.get_many(std::slice::from_ref(&owner_key))?;
        let Some(owner_entity) = owner.into_iter().next().flatten() else {
            info!(
                marker = %marker.name,
                "deleting marker: associated instance no longer exists"
            );
            return store.delete(&entity.key);
        };

        let expected = self.deriver.derive(&task.model, &owner_entity);
        if !expected.iter().any(|name| *name == marker.name) {
            info!(
                marker = %marker.name,
                "deleting marker: no longer represents the instance state"
            );
            return store.delete(&entity.key);
        }
        Ok(())
    }
}
