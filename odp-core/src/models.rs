use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

/// Untyped field bag carried by create/update payloads and stored versions
pub type Payload = Map<String, Value>;

/// The kinds of entities managed by the deployment plan
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// Operational need (ON) or operational requirement (OR)
    Requirement,
    /// Operational change, owns milestones
    Change,
    /// Deployment wave
    Wave,
    StakeholderCategory,
    DataCategory,
    Service,
    RegulatoryAspect,
}

impl EntityKind {
    /// All kinds, in display order
    pub const ALL: [EntityKind; 7] = [
        EntityKind::Requirement,
        EntityKind::Change,
        EntityKind::Wave,
        EntityKind::StakeholderCategory,
        EntityKind::DataCategory,
        EntityKind::Service,
        EntityKind::RegulatoryAspect,
    ];

    /// Stable identifier used in storage and on the command line
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Requirement => "requirement",
            EntityKind::Change => "change",
            EntityKind::Wave => "wave",
            EntityKind::StakeholderCategory => "stakeholder_category",
            EntityKind::DataCategory => "data_category",
            EntityKind::Service => "service",
            EntityKind::RegulatoryAspect => "regulatory_aspect",
        }
    }

    /// Parse a kind from a string, accepting dashes in place of underscores
    pub fn parse(s: &str) -> Option<Self> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        EntityKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == normalized)
    }

    /// Setup kinds are the flat lookup collections referenced by requirements
    pub fn is_setup(&self) -> bool {
        matches!(
            self,
            EntityKind::StakeholderCategory
                | EntityKind::DataCategory
                | EntityKind::Service
                | EntityKind::RegulatoryAspect
        )
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Requirement type: an operational need or the requirement implementing it
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RequirementType {
    /// Operational Need - the need type
    #[serde(rename = "ON")]
    Need,
    /// Operational Requirement - the implementation type
    #[serde(rename = "OR")]
    Implementation,
}

impl RequirementType {
    pub const VALUES: &'static [&'static str] = &["ON", "OR"];

    pub fn from_code(s: &str) -> Option<Self> {
        match s {
            "ON" => Some(RequirementType::Need),
            "OR" => Some(RequirementType::Implementation),
            _ => None,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            RequirementType::Need => "ON",
            RequirementType::Implementation => "OR",
        }
    }

    /// Reads the `type` field of a requirement payload
    pub fn of(content: &Payload) -> Option<Self> {
        content
            .get("type")
            .and_then(Value::as_str)
            .and_then(Self::from_code)
    }
}

impl fmt::Display for RequirementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Closed set of drafting groups used for top-level grouping
pub const DRAFTING_GROUPS: &[&str] = &[
    "4DT",
    "AIRPORT",
    "ASM_ATFCM",
    "CRISIS_FAAS",
    "FLOW",
    "IAM",
    "NM_B2B",
    "NM_FOR_PILOTS",
    "RRT",
    "TCF",
];

/// Visibility of an operational change
pub const VISIBILITY_VALUES: &[&str] = &["NM", "NETWORK"];

/// Event types a milestone may carry
pub const MILESTONE_EVENT_TYPES: &[&str] = &[
    "API_PUBLICATION",
    "API_TEST_DEPLOYMENT",
    "UI_TEST_DEPLOYMENT",
    "OPS_DEPLOYMENT",
    "API_DECOMMISSIONING",
];

/// Allowed wave quarters
pub const WAVE_QUARTERS: &[&str] = &["1", "2", "3", "4"];

/// A reference from one item to another, with an optional annotation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Reference {
    /// Target item ID
    pub id: Uuid,
    /// Free-text note attached to the link
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl Reference {
    pub fn new(id: Uuid) -> Self {
        Self { id, note: None }
    }

    /// Stored form: always an object
    pub fn to_stored(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("id".to_string(), Value::String(self.id.to_string()));
        if let Some(note) = &self.note {
            obj.insert("note".to_string(), Value::String(note.clone()));
        }
        Value::Object(obj)
    }

    /// Input form: a bare id when there is no note, otherwise `{id, note}`
    pub fn to_input(&self) -> Value {
        match &self.note {
            None => Value::String(self.id.to_string()),
            Some(_) => self.to_stored(),
        }
    }
}

/// A raw element of a relationship array, before ids are resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawReference {
    pub id: String,
    pub note: Option<String>,
}

impl RawReference {
    /// Accepts `"id"` or `{"id": "...", "note": "..."}`
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(Self {
                id: s.clone(),
                note: None,
            }),
            Value::Object(obj) => {
                let id = obj.get("id")?.as_str()?.to_string();
                let note = obj
                    .get("note")
                    .and_then(Value::as_str)
                    .filter(|n| !n.is_empty())
                    .map(str::to_string);
                Some(Self { id, note })
            }
            _ => None,
        }
    }

    pub fn resolve(&self) -> Option<Reference> {
        Uuid::parse_str(&self.id).ok().map(|id| Reference {
            id,
            note: self.note.clone(),
        })
    }
}

/// Reads the relationship array stored under `field`.
///
/// Elements that are not well-formed references are skipped; the validator
/// is responsible for rejecting them before they are stored.
pub fn read_references(content: &Payload, field: &str) -> Vec<RawReference> {
    match content.get(field) {
        Some(Value::Array(values)) => values.iter().filter_map(RawReference::from_value).collect(),
        _ => Vec::new(),
    }
}

/// An immutable snapshot of an item's content
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ItemVersion {
    pub item_id: Uuid,
    /// Opaque token identifying this version
    pub version_id: Uuid,
    /// Sequential number, starting at 1
    pub version_number: u32,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub content: Payload,
}

/// A logical entity with a stable identity, as seen through its current version
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Item {
    /// Stable identifier assigned at creation
    pub item_id: Uuid,

    pub kind: EntityKind,

    /// Token of the current version, used for optimistic locking
    pub version_id: Uuid,

    /// Number of the current version
    pub version_number: u32,

    /// When the first version was created
    pub created_at: DateTime<Utc>,
    pub created_by: String,

    /// When the current version was created
    pub modified_at: DateTime<Utc>,
    pub modified_by: String,

    /// Content of the current version
    pub content: Payload,
}

impl Item {
    /// Builds the item view of a version, given when and by whom the item was first created
    pub fn from_version(
        kind: EntityKind,
        version: &ItemVersion,
        created_at: DateTime<Utc>,
        created_by: String,
    ) -> Self {
        Self {
            item_id: version.item_id,
            kind,
            version_id: version.version_id,
            version_number: version.version_number,
            created_at,
            created_by,
            modified_at: version.created_at,
            modified_by: version.created_by.clone(),
            content: version.content.clone(),
        }
    }

    /// Reads a string field from the content
    pub fn text(&self, field: &str) -> Option<&str> {
        self.content.get(field).and_then(Value::as_str)
    }

    /// Human-readable label for listings
    pub fn label(&self) -> String {
        match self.kind {
            EntityKind::Requirement | EntityKind::Change => {
                self.text("title").unwrap_or_default().to_string()
            }
            EntityKind::Wave => {
                let year = self
                    .content
                    .get("year")
                    .map(value_to_plain)
                    .unwrap_or_default();
                let quarter = self
                    .content
                    .get("quarter")
                    .map(value_to_plain)
                    .unwrap_or_default();
                format!("{} Q{}", year, quarter)
            }
            _ => self.text("name").unwrap_or_default().to_string(),
        }
    }

    /// Requirement type, when this item is a requirement
    pub fn requirement_type(&self) -> Option<RequirementType> {
        if self.kind == EntityKind::Requirement {
            RequirementType::of(&self.content)
        } else {
            None
        }
    }
}

/// Renders a scalar JSON value without quotes
pub fn value_to_plain(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Everything a backend holds, used for export and migration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StoreSnapshot {
    pub items: Vec<Item>,
    pub versions: Vec<ItemVersion>,
}

impl StoreSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find_item(&self, id: &Uuid) -> Option<&Item> {
        self.items.iter().find(|i| &i.item_id == id)
    }

    /// Versions of one item, ascending by number
    pub fn history(&self, id: &Uuid) -> Vec<ItemVersion> {
        let mut versions: Vec<ItemVersion> = self
            .versions
            .iter()
            .filter(|v| &v.item_id == id)
            .cloned()
            .collect();
        versions.sort_by_key(|v| v.version_number);
        versions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entity_kind_parse() {
        assert_eq!(EntityKind::parse("requirement"), Some(EntityKind::Requirement));
        assert_eq!(
            EntityKind::parse("Stakeholder-Category"),
            Some(EntityKind::StakeholderCategory)
        );
        assert_eq!(EntityKind::parse("milestone"), None);
    }

    #[test]
    fn test_raw_reference_forms() {
        let id = Uuid::new_v4();
        let bare = RawReference::from_value(&json!(id.to_string())).unwrap();
        assert_eq!(bare.resolve(), Some(Reference::new(id)));

        let annotated =
            RawReference::from_value(&json!({"id": id.to_string(), "note": "primary"})).unwrap();
        assert_eq!(annotated.note.as_deref(), Some("primary"));

        assert!(RawReference::from_value(&json!(42)).is_none());
        assert!(RawReference::from_value(&json!({"note": "no id"})).is_none());
    }

    #[test]
    fn test_reference_projection() {
        let id = Uuid::new_v4();
        let plain = Reference::new(id);
        assert_eq!(plain.to_input(), json!(id.to_string()));
        assert_eq!(plain.to_stored(), json!({"id": id.to_string()}));

        let noted = Reference {
            id,
            note: Some("why".to_string()),
        };
        assert_eq!(noted.to_input(), json!({"id": id.to_string(), "note": "why"}));
    }

    #[test]
    fn test_requirement_type_of() {
        let mut content = Payload::new();
        content.insert("type".to_string(), json!("OR"));
        assert_eq!(
            RequirementType::of(&content),
            Some(RequirementType::Implementation)
        );
        content.insert("type".to_string(), json!("XX"));
        assert_eq!(RequirementType::of(&content), None);
    }
}
