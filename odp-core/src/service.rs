//! Service layer for versioned items
//!
//! Every write goes through validation first and then a single
//! compare-and-swap on the store; the store's version token is the only
//! serialization point between concurrent writers.

use std::sync::Arc;
use uuid::Uuid;

use crate::db::{CasOutcome, VersionedStore};
use crate::error::{ServiceError, ValidationResult};
use crate::models::{EntityKind, Item, ItemVersion, Payload};
use crate::patch;
use crate::rules::rules_for;
use crate::validation::Validator;

pub struct ItemService {
    store: Arc<dyn VersionedStore>,
    /// Recorded as the author of every version written through this service
    actor: String,
}

impl ItemService {
    pub fn new(store: Arc<dyn VersionedStore>, actor: impl Into<String>) -> Self {
        Self {
            store,
            actor: actor.into(),
        }
    }

    pub fn store(&self) -> &dyn VersionedStore {
        self.store.as_ref()
    }

    pub fn actor(&self) -> &str {
        &self.actor
    }

    fn validator(&self) -> Validator<'_> {
        Validator::new(self.store.as_ref())
    }

    /// Gets the current view of an item
    pub fn get(&self, item_id: &Uuid) -> Result<Item, ServiceError> {
        self.store
            .find_by_id(item_id)?
            .ok_or(ServiceError::NotFound(*item_id))
    }

    /// Lists current items, optionally restricted to one kind
    pub fn list(&self, kind: Option<EntityKind>) -> Result<Vec<Item>, ServiceError> {
        Ok(self.store.list(kind)?)
    }

    /// All versions of an item, oldest first
    pub fn history(&self, item_id: &Uuid) -> Result<Vec<ItemVersion>, ServiceError> {
        let versions = self.store.version_history(item_id)?;
        if versions.is_empty() {
            return Err(ServiceError::NotFound(*item_id));
        }
        Ok(versions)
    }

    /// Checks a create payload without writing anything
    pub fn validate_create(
        &self,
        kind: EntityKind,
        payload: &Payload,
    ) -> Result<ValidationResult, ServiceError> {
        Ok(self.validator().validate_create(kind, payload)?)
    }

    /// Checks an update payload, merged onto the current version, without writing anything
    pub fn validate_update(
        &self,
        item_id: &Uuid,
        payload: Payload,
    ) -> Result<ValidationResult, ServiceError> {
        let current = self.get(item_id)?;
        let merged = patch::merge(rules_for(current.kind), &current.content, payload);
        Ok(self
            .validator()
            .validate_update(*item_id, current.kind, &merged)?)
    }

    /// Validates and stores a new item at version 1
    pub fn create(&self, kind: EntityKind, payload: Payload) -> Result<Item, ServiceError> {
        let result = self.validator().validate_create(kind, &payload)?;
        if !result.is_valid() {
            return Err(ServiceError::Validation(result.errors));
        }

        let content = patch::normalize(rules_for(kind), payload);
        let item = self.store.create(kind, content, &self.actor)?;
        log::info!(
            "Created {} {} (version {})",
            kind,
            item.item_id,
            item.version_id
        );
        Ok(item)
    }

    /// Applies `payload` as the next version of an item.
    ///
    /// Fails with [`ServiceError::VersionConflict`] when `expected_version_id`
    /// is not the current token, either up front or at commit time.
    pub fn update(
        &self,
        item_id: &Uuid,
        payload: Payload,
        expected_version_id: &Uuid,
    ) -> Result<Item, ServiceError> {
        let current = self.get(item_id)?;
        if &current.version_id != expected_version_id {
            return Err(self.conflict(item_id, expected_version_id, current.version_id));
        }

        let rules = rules_for(current.kind);
        let merged = patch::merge(rules, &current.content, payload);
        let result = self
            .validator()
            .validate_update(*item_id, current.kind, &merged)?;
        if !result.is_valid() {
            return Err(ServiceError::Validation(result.errors));
        }

        let content = patch::normalize(rules, merged);
        match self
            .store
            .compare_and_swap_update(item_id, expected_version_id, content, &self.actor)?
        {
            CasOutcome::Committed(item) => {
                log::info!(
                    "Updated {} {} to version {} ({})",
                    item.kind,
                    item.item_id,
                    item.version_number,
                    item.version_id
                );
                Ok(item)
            }
            CasOutcome::Conflict { actual } => {
                Err(self.conflict(item_id, expected_version_id, actual))
            }
            CasOutcome::NotFound => Err(ServiceError::NotFound(*item_id)),
        }
    }

    fn conflict(&self, item_id: &Uuid, expected: &Uuid, actual: Uuid) -> ServiceError {
        log::warn!(
            "Version conflict on {}: expected {}, current {}",
            item_id,
            expected,
            actual
        );
        ServiceError::VersionConflict {
            item_id: *item_id,
            expected: *expected,
            actual,
        }
    }
}
