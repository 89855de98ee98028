//! Error types returned across the core boundary
//!
//! Validation and update-protocol failures are typed so callers can map them
//! to user-facing messages; unexpected persistence failures collapse into
//! [`ServiceError::Storage`].

use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::models::EntityKind;

/// A single reason a payload was rejected
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid value '{value}' for {field}, expected one of: {}", .allowed.join(", "))]
    InvalidEnum {
        field: String,
        value: String,
        allowed: Vec<String>,
    },

    #[error("Field {field} must be {expected}")]
    WrongShape {
        field: String,
        expected: &'static str,
    },

    #[error("Referenced item {id} in {field} does not exist")]
    DanglingReference { field: String, id: String },

    #[error("Illegal refinement of {parent}: an OR cannot refine an ON and an item cannot refine itself")]
    IllegalRefinement { parent: Uuid },

    #[error("Field {field} is not allowed for items of type {item_type}")]
    IllegalRelationshipForType { field: String, item_type: String },

    #[error("Item {id} in {field} must be of type {expected}, found {actual}")]
    WrongReferencedType {
        field: String,
        id: Uuid,
        expected: String,
        actual: String,
    },

    #[error("Invalid {target} ids in {field}: {}", .ids.join(", "))]
    InvalidReferenceIds {
        field: String,
        target: EntityKind,
        ids: Vec<String>,
    },
}

impl ValidationError {
    pub fn missing(field: impl Into<String>) -> Self {
        ValidationError::MissingField {
            field: field.into(),
        }
    }

    pub fn shape(field: impl Into<String>, expected: &'static str) -> Self {
        ValidationError::WrongShape {
            field: field.into(),
            expected,
        }
    }

    pub fn invalid_enum(field: impl Into<String>, value: impl Into<String>, allowed: &[&str]) -> Self {
        ValidationError::InvalidEnum {
            field: field.into(),
            value: value.into(),
            allowed: allowed.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Outcome of validating a payload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<ValidationError>,
}

impl ValidationResult {
    pub fn from_errors(errors: Vec<ValidationError>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Errors returned by the item service
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Item not found: {0}")]
    NotFound(Uuid),

    #[error("Version conflict on {item_id}: expected version {expected}, current version is {actual}")]
    VersionConflict {
        item_id: Uuid,
        expected: Uuid,
        actual: Uuid,
    },

    #[error("Validation failed: {}", format_errors(.0))]
    Validation(Vec<ValidationError>),

    #[error("Storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl ServiceError {
    /// The caller may re-fetch and resubmit
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ServiceError::NotFound(_) | ServiceError::VersionConflict { .. }
        )
    }

    /// Validation errors, if this is a validation failure
    pub fn validation_errors(&self) -> &[ValidationError] {
        match self {
            ServiceError::Validation(errors) => errors,
            _ => &[],
        }
    }
}

fn format_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
