//! Entity validation
//!
//! Validation runs in two phases. Structural checks look only at the payload
//! and report every problem they find. Relational checks read the store
//! inside a read transaction and only run when the payload is well-formed.

use anyhow::Result;
use serde_json::Value;
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::db::{ReadTxn, VersionedStore};
use crate::error::{ValidationError, ValidationResult};
use crate::models::{read_references, value_to_plain, EntityKind, Payload, RawReference, RequirementType};
use crate::rules::{enum_value_allowed, rules_for, EntityRules, RefCheck, RelationshipRule};

/// Whether a payload creates a new item or becomes the next version of one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Create,
    Update(Uuid),
}

/// Validates payloads against the per-kind rules and the current store contents
pub struct Validator<'a> {
    store: &'a dyn VersionedStore,
}

impl<'a> Validator<'a> {
    pub fn new(store: &'a dyn VersionedStore) -> Self {
        Self { store }
    }

    pub fn validate_create(&self, kind: EntityKind, payload: &Payload) -> Result<ValidationResult> {
        self.validate(kind, payload, Mode::Create)
    }

    pub fn validate_update(
        &self,
        item_id: Uuid,
        kind: EntityKind,
        payload: &Payload,
    ) -> Result<ValidationResult> {
        self.validate(kind, payload, Mode::Update(item_id))
    }

    /// Runs all checks. `Err` means the store could not be read, not that the
    /// payload is invalid.
    pub fn validate(&self, kind: EntityKind, payload: &Payload, mode: Mode) -> Result<ValidationResult> {
        let rules = rules_for(kind);

        let errors = check_structure(rules, payload);
        if !errors.is_empty() {
            log::debug!("{} payload rejected by {} structural checks", kind, errors.len());
            return Ok(ValidationResult::from_errors(errors));
        }

        let txn = self.store.begin_read()?;
        match check_relations(rules, payload, mode, txn.as_ref()) {
            Ok(errors) => {
                txn.commit()?;
                if !errors.is_empty() {
                    log::debug!("{} payload rejected by {} relational checks", kind, errors.len());
                }
                Ok(ValidationResult::from_errors(errors))
            }
            Err(e) => {
                if let Err(rollback_err) = txn.rollback() {
                    log::warn!("Failed to roll back validation read: {}", rollback_err);
                }
                Err(e)
            }
        }
    }
}

fn is_missing(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(_) => false,
    }
}

/// Required fields, closed value sets and array shapes
pub fn check_structure(rules: &dyn EntityRules, payload: &Payload) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    for field in rules.required_fields() {
        if is_missing(payload.get(*field)) {
            errors.push(ValidationError::missing(*field));
        }
    }

    for rule in rules.enum_fields() {
        match payload.get(rule.field) {
            None | Some(Value::Null) => {}
            Some(value) if enum_value_allowed(value, rule.allowed) => {}
            Some(value) => errors.push(ValidationError::invalid_enum(
                rule.field,
                value_to_plain(value),
                rule.allowed,
            )),
        }
    }

    for field in rules.string_array_fields() {
        match payload.get(*field) {
            None | Some(Value::Null) => {}
            Some(Value::Array(values)) if values.iter().all(Value::is_string) => {}
            Some(_) => errors.push(ValidationError::shape(*field, "an array of strings")),
        }
    }

    for rule in rules.relationships() {
        match payload.get(rule.field) {
            None | Some(Value::Null) => {}
            Some(Value::Array(values))
                if values.iter().all(|v| RawReference::from_value(v).is_some()) => {}
            Some(_) => errors.push(ValidationError::shape(rule.field, "an array of item references")),
        }
    }

    rules.check_structure(payload, &mut errors);
    errors
}

/// Store-backed checks over a structurally valid payload
fn check_relations(
    rules: &dyn EntityRules,
    payload: &Payload,
    mode: Mode,
    txn: &dyn ReadTxn,
) -> Result<Vec<ValidationError>> {
    let mut errors = Vec::new();

    for rule in rules.relationships() {
        let references = read_references(payload, rule.field);
        if references.is_empty() {
            continue;
        }
        match rule.check {
            RefCheck::Refines => check_refines(rule, payload, mode, &references, txn, &mut errors)?,
            RefCheck::Implements => check_implements(rule, payload, &references, txn, &mut errors)?,
            RefCheck::Exists => check_exists(rule, &references, txn, &mut errors)?,
        }
    }

    rules.check_relations(payload, txn, &mut errors)?;
    Ok(errors)
}

fn dangling(rule: &RelationshipRule, id: &str) -> ValidationError {
    ValidationError::DanglingReference {
        field: rule.field.to_string(),
        id: id.to_string(),
    }
}

/// Every parent must exist, and an OR may not refine an ON
fn check_refines(
    rule: &RelationshipRule,
    payload: &Payload,
    mode: Mode,
    references: &[RawReference],
    txn: &dyn ReadTxn,
    errors: &mut Vec<ValidationError>,
) -> Result<()> {
    let own_type = RequirementType::of(payload);

    for reference in references {
        let Ok(parent_id) = Uuid::parse_str(&reference.id) else {
            errors.push(dangling(rule, &reference.id));
            continue;
        };

        if mode == Mode::Update(parent_id) {
            errors.push(ValidationError::IllegalRefinement { parent: parent_id });
            continue;
        }

        let parent = txn.find_by_id(&parent_id)?.filter(|p| p.kind == rule.target);
        let Some(parent) = parent else {
            errors.push(dangling(rule, &reference.id));
            continue;
        };

        if own_type == Some(RequirementType::Implementation)
            && parent.requirement_type() == Some(RequirementType::Need)
        {
            errors.push(ValidationError::IllegalRefinement { parent: parent_id });
        }
    }
    Ok(())
}

/// Only an OR may implement, and only ONs may be implemented
fn check_implements(
    rule: &RelationshipRule,
    payload: &Payload,
    references: &[RawReference],
    txn: &dyn ReadTxn,
    errors: &mut Vec<ValidationError>,
) -> Result<()> {
    let own_type = RequirementType::of(payload);
    if own_type != Some(RequirementType::Implementation) {
        errors.push(ValidationError::IllegalRelationshipForType {
            field: rule.field.to_string(),
            item_type: own_type.map(|t| t.code().to_string()).unwrap_or_default(),
        });
        return Ok(());
    }

    for reference in references {
        let Ok(target_id) = Uuid::parse_str(&reference.id) else {
            errors.push(dangling(rule, &reference.id));
            continue;
        };

        let Some(target) = txn.find_by_id(&target_id)? else {
            errors.push(dangling(rule, &reference.id));
            continue;
        };

        if target.requirement_type() != Some(RequirementType::Need) {
            let actual = target
                .requirement_type()
                .map(|t| t.code().to_string())
                .unwrap_or_else(|| target.kind.to_string());
            errors.push(ValidationError::WrongReferencedType {
                field: rule.field.to_string(),
                id: target_id,
                expected: RequirementType::Need.code().to_string(),
                actual,
            });
        }
    }
    Ok(())
}

/// Collects every unknown id of one field into a single error
fn check_exists(
    rule: &RelationshipRule,
    references: &[RawReference],
    txn: &dyn ReadTxn,
    errors: &mut Vec<ValidationError>,
) -> Result<()> {
    let mut seen = BTreeSet::new();
    let mut invalid = Vec::new();

    for reference in references {
        if !seen.insert(reference.id.as_str()) {
            continue;
        }
        let exists = match Uuid::parse_str(&reference.id) {
            Ok(id) => txn.exists(rule.target, &id)?,
            Err(_) => false,
        };
        if !exists {
            invalid.push(reference.id.clone());
        }
    }

    if !invalid.is_empty() {
        errors.push(ValidationError::InvalidReferenceIds {
            field: rule.field.to_string(),
            target: rule.target,
            ids: invalid,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteBackend;
    use crate::models::Item;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn payload(value: Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    fn requirement(store: &SqliteBackend, req_type: &str) -> Item {
        store
            .create(
                EntityKind::Requirement,
                payload(json!({
                    "type": req_type,
                    "title": format!("{} item", req_type),
                    "statement": "S",
                    "rationale": "R"
                })),
                "test",
            )
            .unwrap()
    }

    fn base(req_type: &str) -> Payload {
        payload(json!({"type": req_type, "title": "T", "statement": "S", "rationale": "R"}))
    }

    #[test]
    fn test_valid_minimal_requirement() {
        let store = SqliteBackend::in_memory().unwrap();
        let result = Validator::new(&store)
            .validate_create(EntityKind::Requirement, &base("OR"))
            .unwrap();
        assert!(result.is_valid(), "{:?}", result.errors);
    }

    #[test]
    fn test_structural_errors_reported_together() {
        let store = SqliteBackend::in_memory().unwrap();
        let result = Validator::new(&store)
            .validate_create(
                EntityKind::Requirement,
                &payload(json!({
                    "type": "XX",
                    "title": "",
                    "statement": null,
                    "path": "A/B",
                    "impactsServices": "not-an-array"
                })),
            )
            .unwrap();

        assert_eq!(
            result.errors,
            vec![
                ValidationError::missing("title"),
                ValidationError::missing("statement"),
                ValidationError::missing("rationale"),
                ValidationError::invalid_enum("type", "XX", RequirementType::VALUES),
                ValidationError::shape("path", "an array of strings"),
                ValidationError::shape("impactsServices", "an array of item references"),
            ]
        );
    }

    #[test]
    fn test_or_refining_on_is_rejected() {
        let store = SqliteBackend::in_memory().unwrap();
        let on = requirement(&store, "ON");

        let mut p = base("OR");
        p.insert("refinesParents".to_string(), json!([on.item_id.to_string()]));
        let result = Validator::new(&store)
            .validate_create(EntityKind::Requirement, &p)
            .unwrap();

        assert_eq!(
            result.errors,
            vec![ValidationError::IllegalRefinement { parent: on.item_id }]
        );
    }

    #[test]
    fn test_on_refining_or_is_accepted() {
        let store = SqliteBackend::in_memory().unwrap();
        let or = requirement(&store, "OR");

        let mut p = base("ON");
        p.insert("refinesParents".to_string(), json!([or.item_id.to_string()]));
        let result = Validator::new(&store)
            .validate_create(EntityKind::Requirement, &p)
            .unwrap();
        assert!(result.is_valid(), "{:?}", result.errors);
    }

    #[test]
    fn test_refines_missing_parent_and_self() {
        let store = SqliteBackend::in_memory().unwrap();
        let item = requirement(&store, "ON");
        let missing = Uuid::new_v4();

        let mut p = base("ON");
        p.insert(
            "refinesParents".to_string(),
            json!([missing.to_string(), item.item_id.to_string()]),
        );
        let result = Validator::new(&store)
            .validate_update(item.item_id, EntityKind::Requirement, &p)
            .unwrap();

        assert_eq!(
            result.errors,
            vec![
                ValidationError::DanglingReference {
                    field: "refinesParents".to_string(),
                    id: missing.to_string(),
                },
                ValidationError::IllegalRefinement {
                    parent: item.item_id
                },
            ]
        );
    }

    #[test]
    fn test_implements_only_from_or() {
        let store = SqliteBackend::in_memory().unwrap();
        let on = requirement(&store, "ON");

        let mut p = base("ON");
        p.insert("implementedONs".to_string(), json!([on.item_id.to_string()]));
        let result = Validator::new(&store)
            .validate_create(EntityKind::Requirement, &p)
            .unwrap();

        assert_eq!(
            result.errors,
            vec![ValidationError::IllegalRelationshipForType {
                field: "implementedONs".to_string(),
                item_type: "ON".to_string(),
            }]
        );
    }

    #[test]
    fn test_implements_must_target_on() {
        let store = SqliteBackend::in_memory().unwrap();
        let on = requirement(&store, "ON");
        let or = requirement(&store, "OR");

        let mut p = base("OR");
        p.insert(
            "implementedONs".to_string(),
            json!([on.item_id.to_string(), {"id": or.item_id.to_string(), "note": "wrong"}]),
        );
        let result = Validator::new(&store)
            .validate_create(EntityKind::Requirement, &p)
            .unwrap();

        assert_eq!(
            result.errors,
            vec![ValidationError::WrongReferencedType {
                field: "implementedONs".to_string(),
                id: or.item_id,
                expected: "ON".to_string(),
                actual: "OR".to_string(),
            }]
        );
    }

    #[test]
    fn test_invalid_reference_ids_are_batched() {
        let store = SqliteBackend::in_memory().unwrap();
        let known = store
            .create(
                EntityKind::StakeholderCategory,
                payload(json!({"name": "ANSPs"})),
                "test",
            )
            .unwrap();
        let bad: Vec<String> = (0..3).map(|_| Uuid::new_v4().to_string()).collect();

        let mut p = base("ON");
        p.insert(
            "impactsStakeholderCategories".to_string(),
            json!([bad[0], known.item_id.to_string(), bad[1], bad[2], bad[0]]),
        );
        let result = Validator::new(&store)
            .validate_create(EntityKind::Requirement, &p)
            .unwrap();

        assert_eq!(
            result.errors,
            vec![ValidationError::InvalidReferenceIds {
                field: "impactsStakeholderCategories".to_string(),
                target: EntityKind::StakeholderCategory,
                ids: bad,
            }]
        );
    }

    #[test]
    fn test_reference_to_wrong_collection_is_invalid() {
        let store = SqliteBackend::in_memory().unwrap();
        let service = store
            .create(EntityKind::Service, payload(json!({"name": "Flow"})), "test")
            .unwrap();

        let mut p = base("ON");
        p.insert("impactsData".to_string(), json!([service.item_id.to_string(), "x"]));
        let result = Validator::new(&store)
            .validate_create(EntityKind::Requirement, &p)
            .unwrap();

        assert_eq!(
            result.errors,
            vec![ValidationError::InvalidReferenceIds {
                field: "impactsData".to_string(),
                target: EntityKind::DataCategory,
                ids: vec![service.item_id.to_string(), "x".to_string()],
            }]
        );
    }

    #[test]
    fn test_change_milestone_waves_batched() {
        let store = SqliteBackend::in_memory().unwrap();
        let wave = store
            .create(
                EntityKind::Wave,
                payload(json!({"year": 2027, "quarter": 1, "date": "2027-03-31"})),
                "test",
            )
            .unwrap();
        let missing = Uuid::new_v4().to_string();

        let change = payload(json!({
            "title": "C",
            "purpose": "P",
            "visibility": "NETWORK",
            "milestones": [
                {"title": "M1", "eventTypes": ["API_PUBLICATION"], "wave": wave.item_id.to_string()},
                {"title": "M2", "wave": missing},
                {"title": "M3", "wave": "nope"}
            ]
        }));
        let result = Validator::new(&store)
            .validate_create(EntityKind::Change, &change)
            .unwrap();

        assert_eq!(
            result.errors,
            vec![ValidationError::InvalidReferenceIds {
                field: "milestones.wave".to_string(),
                target: EntityKind::Wave,
                ids: vec![missing, "nope".to_string()],
            }]
        );
    }

    #[test]
    fn test_setup_parent_must_exist() {
        let store = SqliteBackend::in_memory().unwrap();
        let parent = store
            .create(EntityKind::Service, payload(json!({"name": "Root"})), "test")
            .unwrap();
        let validator = Validator::new(&store);

        let ok = payload(json!({"name": "Child", "parentId": parent.item_id.to_string()}));
        assert!(validator.validate_create(EntityKind::Service, &ok).unwrap().is_valid());

        // Same id, different collection
        let wrong = payload(json!({"name": "Child", "parentId": parent.item_id.to_string()}));
        let result = validator
            .validate_create(EntityKind::DataCategory, &wrong)
            .unwrap();
        assert_eq!(result.errors.len(), 1);
    }

    #[test]
    fn test_validation_releases_read_transaction() {
        let store = SqliteBackend::in_memory().unwrap();
        let validator = Validator::new(&store);
        validator
            .validate_create(EntityKind::Requirement, &base("ON"))
            .unwrap();

        // A write after validation must not block on a leftover transaction
        store
            .create(EntityKind::Requirement, base("ON"), "test")
            .unwrap();
    }

    /// Store whose read transactions count how they end and can fail every read
    struct TrackingStore {
        inner: SqliteBackend,
        fail_reads: bool,
        commits: AtomicUsize,
        rollbacks: AtomicUsize,
    }

    impl TrackingStore {
        fn new(fail_reads: bool) -> Self {
            Self {
                inner: SqliteBackend::in_memory().unwrap(),
                fail_reads,
                commits: AtomicUsize::new(0),
                rollbacks: AtomicUsize::new(0),
            }
        }

        fn counts(&self) -> (usize, usize) {
            (
                self.commits.load(Ordering::SeqCst),
                self.rollbacks.load(Ordering::SeqCst),
            )
        }
    }

    struct TrackingTxn<'a> {
        store: &'a TrackingStore,
    }

    impl ReadTxn for TrackingTxn<'_> {
        fn find_by_id(&self, id: &Uuid) -> Result<Option<Item>> {
            if self.store.fail_reads {
                anyhow::bail!("disk read failed");
            }
            self.store.inner.find_by_id(id)
        }

        fn exists(&self, kind: EntityKind, id: &Uuid) -> Result<bool> {
            Ok(self.find_by_id(id)?.map(|i| i.kind == kind).unwrap_or(false))
        }

        fn commit(self: Box<Self>) -> Result<()> {
            self.store.commits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn rollback(self: Box<Self>) -> Result<()> {
            self.store.rollbacks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    impl VersionedStore for TrackingStore {
        fn backend_type(&self) -> crate::db::BackendType {
            self.inner.backend_type()
        }

        fn path(&self) -> &std::path::Path {
            self.inner.path()
        }

        fn find_by_id(&self, id: &Uuid) -> Result<Option<Item>> {
            self.inner.find_by_id(id)
        }

        fn begin_read(&self) -> Result<Box<dyn ReadTxn + '_>> {
            Ok(Box::new(TrackingTxn { store: self }))
        }

        fn list(&self, kind: Option<EntityKind>) -> Result<Vec<Item>> {
            self.inner.list(kind)
        }

        fn version_history(&self, id: &Uuid) -> Result<Vec<crate::models::ItemVersion>> {
            self.inner.version_history(id)
        }

        fn create(&self, kind: EntityKind, content: Payload, actor: &str) -> Result<Item> {
            self.inner.create(kind, content, actor)
        }

        fn compare_and_swap_update(
            &self,
            id: &Uuid,
            expected: &Uuid,
            content: Payload,
            actor: &str,
        ) -> Result<crate::db::CasOutcome> {
            self.inner.compare_and_swap_update(id, expected, content, actor)
        }

        fn snapshot(&self) -> Result<crate::models::StoreSnapshot> {
            self.inner.snapshot()
        }

        fn restore(&self, snapshot: &crate::models::StoreSnapshot) -> Result<()> {
            self.inner.restore(snapshot)
        }
    }

    #[test]
    fn test_relational_checks_commit_read_transaction() {
        let store = TrackingStore::new(false);
        let validator = Validator::new(&store);

        let mut invalid = base("ON");
        invalid.insert("impactsServices".to_string(), json!([Uuid::new_v4().to_string()]));
        let result = validator
            .validate_create(EntityKind::Requirement, &invalid)
            .unwrap();
        assert!(!result.is_valid());
        assert_eq!(store.counts(), (1, 0));
    }

    #[test]
    fn test_failed_store_read_rolls_back_read_transaction() {
        let store = TrackingStore::new(true);
        let validator = Validator::new(&store);

        let mut impacts = base("ON");
        impacts.insert("impactsServices".to_string(), json!([Uuid::new_v4().to_string()]));
        let err = validator
            .validate_create(EntityKind::Requirement, &impacts)
            .unwrap_err();
        assert!(err.to_string().contains("disk read failed"));
        assert_eq!(store.counts(), (0, 1));

        let mut refines = base("OR");
        refines.insert("refinesParents".to_string(), json!([Uuid::new_v4().to_string()]));
        assert!(validator
            .validate_create(EntityKind::Requirement, &refines)
            .is_err());
        assert_eq!(store.counts(), (0, 2));
    }

    #[test]
    fn test_structural_errors_open_no_read_transaction() {
        let store = TrackingStore::new(true);
        let result = Validator::new(&store)
            .validate_create(EntityKind::Requirement, &payload(json!({"type": "ON"})))
            .unwrap();
        assert_eq!(result.errors.len(), 3);
        assert_eq!(store.counts(), (0, 0));
    }
}
