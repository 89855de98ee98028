//! Per-kind field rules
//!
//! Each entity kind is described by an [`EntityRules`] strategy object: which
//! fields are required, which have closed value sets, which hold relationship
//! arrays and how those are checked. The validator, the patch merge and the
//! tree builder all work from these tables instead of per-kind code paths.

use anyhow::Result;
use serde_json::Value;
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::db::ReadTxn;
use crate::error::ValidationError;
use crate::models::{
    EntityKind, Payload, RequirementType, DRAFTING_GROUPS, MILESTONE_EVENT_TYPES,
    VISIBILITY_VALUES, WAVE_QUARTERS,
};

/// How the targets of a relationship array are checked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefCheck {
    /// Parent links between requirements
    Refines,
    /// OR → ON implementation links
    Implements,
    /// Targets must exist; missing ids are reported together
    Exists,
}

/// A relationship array and the collection its ids point into
#[derive(Debug, Clone, Copy)]
pub struct RelationshipRule {
    pub field: &'static str,
    pub target: EntityKind,
    pub check: RefCheck,
}

/// A field restricted to a closed value set
#[derive(Debug, Clone, Copy)]
pub struct EnumRule {
    pub field: &'static str,
    pub allowed: &'static [&'static str],
}

/// Capability set describing one entity kind
pub trait EntityRules: Send + Sync {
    fn kind(&self) -> EntityKind;

    /// Fields that must be present and non-null
    fn required_fields(&self) -> &'static [&'static str];

    fn enum_fields(&self) -> &'static [EnumRule] {
        &[]
    }

    /// Fields that must be arrays of strings
    fn string_array_fields(&self) -> &'static [&'static str] {
        &[]
    }

    fn relationships(&self) -> &'static [RelationshipRule] {
        &[]
    }

    /// Structural checks the tables cannot express
    fn check_structure(&self, _payload: &Payload, _errors: &mut Vec<ValidationError>) {}

    /// Relational checks the relationship table cannot express
    fn check_relations(
        &self,
        _payload: &Payload,
        _txn: &dyn ReadTxn,
        _errors: &mut Vec<ValidationError>,
    ) -> Result<()> {
        Ok(())
    }

    /// Field used for the top-level grouping segment in tree views
    fn group_field(&self) -> Option<&'static str> {
        None
    }

    /// Relationship field whose first target is the parent in tree views
    fn parent_field(&self) -> Option<&'static str> {
        None
    }

    /// Field holding an explicit folder path in tree views
    fn path_field(&self) -> Option<&'static str> {
        None
    }
}

/// Returns the rules for a kind
pub fn rules_for(kind: EntityKind) -> &'static dyn EntityRules {
    match kind {
        EntityKind::Requirement => &RequirementRules,
        EntityKind::Change => &ChangeRules,
        EntityKind::Wave => &WaveRules,
        EntityKind::StakeholderCategory => &SetupRules(EntityKind::StakeholderCategory),
        EntityKind::DataCategory => &SetupRules(EntityKind::DataCategory),
        EntityKind::Service => &SetupRules(EntityKind::Service),
        EntityKind::RegulatoryAspect => &SetupRules(EntityKind::RegulatoryAspect),
    }
}

/// Checks a value against a closed set; numbers compare by their decimal form
pub fn enum_value_allowed(value: &Value, allowed: &[&str]) -> bool {
    match value {
        Value::String(s) => allowed.contains(&s.as_str()),
        Value::Number(n) => allowed.contains(&n.to_string().as_str()),
        _ => false,
    }
}

// =============================================================================
// Requirements
// =============================================================================

pub struct RequirementRules;

impl EntityRules for RequirementRules {
    fn kind(&self) -> EntityKind {
        EntityKind::Requirement
    }

    fn required_fields(&self) -> &'static [&'static str] {
        &["title", "type", "statement", "rationale"]
    }

    fn enum_fields(&self) -> &'static [EnumRule] {
        &[
            EnumRule {
                field: "type",
                allowed: RequirementType::VALUES,
            },
            EnumRule {
                field: "draftingGroup",
                allowed: DRAFTING_GROUPS,
            },
        ]
    }

    fn string_array_fields(&self) -> &'static [&'static str] {
        &["path"]
    }

    fn relationships(&self) -> &'static [RelationshipRule] {
        &[
            RelationshipRule {
                field: "refinesParents",
                target: EntityKind::Requirement,
                check: RefCheck::Refines,
            },
            RelationshipRule {
                field: "implementedONs",
                target: EntityKind::Requirement,
                check: RefCheck::Implements,
            },
            RelationshipRule {
                field: "dependsOnRequirements",
                target: EntityKind::Requirement,
                check: RefCheck::Exists,
            },
            RelationshipRule {
                field: "impactsStakeholderCategories",
                target: EntityKind::StakeholderCategory,
                check: RefCheck::Exists,
            },
            RelationshipRule {
                field: "impactsData",
                target: EntityKind::DataCategory,
                check: RefCheck::Exists,
            },
            RelationshipRule {
                field: "impactsServices",
                target: EntityKind::Service,
                check: RefCheck::Exists,
            },
            RelationshipRule {
                field: "impactsRegulatoryAspects",
                target: EntityKind::RegulatoryAspect,
                check: RefCheck::Exists,
            },
        ]
    }

    fn group_field(&self) -> Option<&'static str> {
        Some("draftingGroup")
    }

    fn parent_field(&self) -> Option<&'static str> {
        Some("refinesParents")
    }

    fn path_field(&self) -> Option<&'static str> {
        Some("path")
    }
}

// =============================================================================
// Operational changes
// =============================================================================

pub struct ChangeRules;

impl EntityRules for ChangeRules {
    fn kind(&self) -> EntityKind {
        EntityKind::Change
    }

    fn required_fields(&self) -> &'static [&'static str] {
        &["title", "purpose", "visibility"]
    }

    fn enum_fields(&self) -> &'static [EnumRule] {
        &[
            EnumRule {
                field: "visibility",
                allowed: VISIBILITY_VALUES,
            },
            EnumRule {
                field: "draftingGroup",
                allowed: DRAFTING_GROUPS,
            },
        ]
    }

    fn string_array_fields(&self) -> &'static [&'static str] {
        &["path"]
    }

    fn relationships(&self) -> &'static [RelationshipRule] {
        &[
            RelationshipRule {
                field: "satisfiesRequirements",
                target: EntityKind::Requirement,
                check: RefCheck::Exists,
            },
            RelationshipRule {
                field: "supersedsRequirements",
                target: EntityKind::Requirement,
                check: RefCheck::Exists,
            },
            RelationshipRule {
                field: "dependsOnChanges",
                target: EntityKind::Change,
                check: RefCheck::Exists,
            },
        ]
    }

    /// Milestones are embedded objects: `{title, eventTypes, wave}`
    fn check_structure(&self, payload: &Payload, errors: &mut Vec<ValidationError>) {
        let milestones = match payload.get("milestones") {
            None | Some(Value::Null) => return,
            Some(Value::Array(milestones)) => milestones,
            Some(_) => {
                errors.push(ValidationError::shape("milestones", "an array of milestones"));
                return;
            }
        };

        for (index, milestone) in milestones.iter().enumerate() {
            let Some(milestone) = milestone.as_object() else {
                errors.push(ValidationError::shape(
                    format!("milestones[{}]", index),
                    "an object",
                ));
                continue;
            };

            let has_title = milestone
                .get("title")
                .and_then(Value::as_str)
                .map_or(false, |t| !t.trim().is_empty());
            if !has_title {
                errors.push(ValidationError::missing(format!("milestones[{}].title", index)));
            }

            match milestone.get("eventTypes") {
                None | Some(Value::Null) => {}
                Some(Value::Array(event_types)) => {
                    for event_type in event_types {
                        if !enum_value_allowed(event_type, MILESTONE_EVENT_TYPES) {
                            errors.push(ValidationError::invalid_enum(
                                format!("milestones[{}].eventTypes", index),
                                crate::models::value_to_plain(event_type),
                                MILESTONE_EVENT_TYPES,
                            ));
                        }
                    }
                }
                Some(_) => errors.push(ValidationError::shape(
                    format!("milestones[{}].eventTypes", index),
                    "an array of event types",
                )),
            }

            match milestone.get("wave") {
                None | Some(Value::Null) | Some(Value::String(_)) => {}
                Some(_) => errors.push(ValidationError::shape(
                    format!("milestones[{}].wave", index),
                    "a wave id",
                )),
            }
        }
    }

    /// All unknown wave ids across milestones are reported together
    fn check_relations(
        &self,
        payload: &Payload,
        txn: &dyn ReadTxn,
        errors: &mut Vec<ValidationError>,
    ) -> Result<()> {
        let Some(Value::Array(milestones)) = payload.get("milestones") else {
            return Ok(());
        };

        let mut seen = BTreeSet::new();
        let mut invalid = Vec::new();
        for wave in milestones
            .iter()
            .filter_map(|m| m.get("wave").and_then(Value::as_str))
        {
            if !seen.insert(wave.to_string()) {
                continue;
            }
            let exists = match Uuid::parse_str(wave) {
                Ok(id) => txn.exists(EntityKind::Wave, &id)?,
                Err(_) => false,
            };
            if !exists {
                invalid.push(wave.to_string());
            }
        }

        if !invalid.is_empty() {
            errors.push(ValidationError::InvalidReferenceIds {
                field: "milestones.wave".to_string(),
                target: EntityKind::Wave,
                ids: invalid,
            });
        }
        Ok(())
    }

    fn group_field(&self) -> Option<&'static str> {
        Some("draftingGroup")
    }

    fn path_field(&self) -> Option<&'static str> {
        Some("path")
    }
}

// =============================================================================
// Waves
// =============================================================================

pub struct WaveRules;

impl EntityRules for WaveRules {
    fn kind(&self) -> EntityKind {
        EntityKind::Wave
    }

    fn required_fields(&self) -> &'static [&'static str] {
        &["year", "quarter", "date"]
    }

    fn enum_fields(&self) -> &'static [EnumRule] {
        &[EnumRule {
            field: "quarter",
            allowed: WAVE_QUARTERS,
        }]
    }

    fn check_structure(&self, payload: &Payload, errors: &mut Vec<ValidationError>) {
        if let Some(year) = payload.get("year") {
            if !year.is_null() && !year.is_u64() {
                errors.push(ValidationError::shape("year", "an integer"));
            }
        }
        if let Some(date) = payload.get("date") {
            if !date.is_null() && !date.is_string() {
                errors.push(ValidationError::shape("date", "a date string"));
            }
        }
    }
}

// =============================================================================
// Setup collections
// =============================================================================

/// Flat lookup collections with an optional parent of the same kind
pub struct SetupRules(pub EntityKind);

impl EntityRules for SetupRules {
    fn kind(&self) -> EntityKind {
        self.0
    }

    fn required_fields(&self) -> &'static [&'static str] {
        &["name"]
    }

    fn check_structure(&self, payload: &Payload, errors: &mut Vec<ValidationError>) {
        if let Some(parent) = payload.get("parentId") {
            if !parent.is_null() && !parent.is_string() {
                errors.push(ValidationError::shape("parentId", "an id string"));
            }
        }
    }

    fn check_relations(
        &self,
        payload: &Payload,
        txn: &dyn ReadTxn,
        errors: &mut Vec<ValidationError>,
    ) -> Result<()> {
        let Some(parent) = payload.get("parentId").and_then(Value::as_str) else {
            return Ok(());
        };

        let exists = match Uuid::parse_str(parent) {
            Ok(id) => txn.exists(self.0, &id)?,
            Err(_) => false,
        };
        if !exists {
            errors.push(ValidationError::InvalidReferenceIds {
                field: "parentId".to_string(),
                target: self.0,
                ids: vec![parent.to_string()],
            });
        }
        Ok(())
    }

    fn parent_field(&self) -> Option<&'static str> {
        Some("parentId")
    }
}
