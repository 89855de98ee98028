//! Virtual hierarchies for display
//!
//! Items are stored flat. A tree view is derived on demand: each entity gets
//! a path of segments from a synthetic root (group, folders or parent chain)
//! down to its own leaf, and the paths of all entities are merged into a
//! forest. Nothing here touches the store.

use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;
use uuid::Uuid;

use crate::models::{read_references, Item};
use crate::rules::rules_for;

/// What a tree view needs to know about an entity
pub trait TreeEntity {
    type Key: Clone + Eq + Hash + fmt::Display;

    fn key(&self) -> &Self::Key;

    fn label(&self) -> String;

    /// Top-level grouping (e.g. drafting group)
    fn group(&self) -> Option<String>;

    /// Explicit organizational folders, outermost first
    fn folder_path(&self) -> Vec<String>;

    /// Parent links; only the first one places the entity in the tree
    fn parent_keys(&self) -> Vec<Self::Key>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentKind {
    Group,
    Folder,
    Entity,
}

/// One step of a path from the root to an entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PathSegment<K> {
    pub kind: SegmentKind,
    pub label: String,
    /// Stable id; equal ids in different paths merge into one tree node
    pub id: String,
    pub entity: Option<K>,
}

impl<K> PathSegment<K> {
    fn group(name: &str) -> Self {
        Self {
            kind: SegmentKind::Group,
            label: name.to_string(),
            id: name.to_string(),
            entity: None,
        }
    }

    fn folder(label: &str, id: String) -> Self {
        Self {
            kind: SegmentKind::Folder,
            label: label.to_string(),
            id,
            entity: None,
        }
    }
}

/// Computes the path of `entity`, resolving parents through `entities`.
///
/// A parent that is missing from the map, or that is already on the current
/// parent chain (a cycle), is ignored and the entity is placed directly under
/// its group.
pub fn build_path<E: TreeEntity>(
    entity: &E,
    entities: &HashMap<E::Key, E>,
) -> Vec<PathSegment<E::Key>> {
    let mut visiting = HashSet::new();
    build_path_inner(entity, entities, &mut visiting)
}

fn build_path_inner<E: TreeEntity>(
    entity: &E,
    entities: &HashMap<E::Key, E>,
    visiting: &mut HashSet<E::Key>,
) -> Vec<PathSegment<E::Key>> {
    visiting.insert(entity.key().clone());

    let mut segments = Vec::new();
    let group = entity.group();
    if let Some(group) = &group {
        segments.push(PathSegment::group(group));
    }

    let folders = entity.folder_path();
    if !folders.is_empty() {
        let prefix = match &group {
            Some(group) => format!("{}:path:", group),
            None => "path:".to_string(),
        };
        let mut joined = String::new();
        for folder in &folders {
            if !joined.is_empty() {
                joined.push('/');
            }
            joined.push_str(&escape_folder(folder));
            segments.push(PathSegment::folder(folder, format!("{}{}", prefix, joined)));
        }
    } else if let Some(parent) = resolve_parent(entity, entities, visiting) {
        let parent_path = build_path_inner(parent, entities, visiting);
        // The parent's group was already added, or belongs to another group
        segments.extend(
            parent_path
                .into_iter()
                .skip_while(|s| s.kind == SegmentKind::Group),
        );
    }

    segments.push(PathSegment {
        kind: SegmentKind::Entity,
        label: entity.label(),
        id: entity.key().to_string(),
        entity: Some(entity.key().clone()),
    });

    visiting.remove(entity.key());
    segments
}

/// Escapes the id separator so `["A/B"]` and `["A", "B"]` get distinct ids
fn escape_folder(name: &str) -> String {
    name.replace('\\', "\\\\").replace('/', "\\/")
}

fn resolve_parent<'a, E: TreeEntity>(
    entity: &E,
    entities: &'a HashMap<E::Key, E>,
    visiting: &HashSet<E::Key>,
) -> Option<&'a E> {
    let parent_key = entity.parent_keys().into_iter().next()?;

    if visiting.contains(&parent_key) {
        log::warn!(
            "Cycle in parent chain: {} -> {}; placing {} under its group",
            entity.key(),
            parent_key,
            entity.key()
        );
        return None;
    }

    let parent = entities.get(&parent_key);
    if parent.is_none() {
        log::debug!("Parent {} of {} is not loaded", parent_key, entity.key());
    }
    parent
}

/// A node of a derived tree view
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TreeNode<K> {
    pub id: String,
    pub kind: SegmentKind,
    pub label: String,
    pub entity: Option<K>,
    pub children: Vec<TreeNode<K>>,
}

impl<K: Clone> TreeNode<K> {
    fn from_segment(segment: &PathSegment<K>) -> Self {
        Self {
            id: segment.id.clone(),
            kind: segment.kind,
            label: segment.label.clone(),
            entity: segment.entity.clone(),
            children: Vec::new(),
        }
    }
}

/// Builds a forest from the paths of all entities, in first-seen order
pub fn build_tree<E: TreeEntity + Clone>(entities: &[E]) -> Vec<TreeNode<E::Key>> {
    let map: HashMap<E::Key, E> = entities
        .iter()
        .map(|e| (e.key().clone(), e.clone()))
        .collect();

    let mut roots = Vec::new();
    for entity in entities {
        insert_path(&mut roots, &build_path(entity, &map));
    }
    roots
}

fn insert_path<K: Clone>(nodes: &mut Vec<TreeNode<K>>, segments: &[PathSegment<K>]) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };

    let pos = match nodes.iter().position(|n| n.id == first.id) {
        Some(pos) => pos,
        None => {
            nodes.push(TreeNode::from_segment(first));
            nodes.len() - 1
        }
    };
    insert_path(&mut nodes[pos].children, rest);
}

impl TreeEntity for Item {
    type Key = Uuid;

    fn key(&self) -> &Uuid {
        &self.item_id
    }

    fn label(&self) -> String {
        Item::label(self)
    }

    fn group(&self) -> Option<String> {
        let field = rules_for(self.kind).group_field()?;
        self.text(field)
            .filter(|g| !g.is_empty())
            .map(str::to_string)
    }

    fn folder_path(&self) -> Vec<String> {
        let Some(field) = rules_for(self.kind).path_field() else {
            return Vec::new();
        };
        match self.content.get(field) {
            Some(Value::Array(values)) => values
                .iter()
                .filter_map(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        }
    }

    fn parent_keys(&self) -> Vec<Uuid> {
        let Some(field) = rules_for(self.kind).parent_field() else {
            return Vec::new();
        };
        match self.content.get(field) {
            Some(Value::String(id)) => Uuid::parse_str(id).into_iter().collect(),
            _ => read_references(&self.content, field)
                .iter()
                .filter_map(|r| r.resolve())
                .map(|r| r.id)
                .collect(),
        }
    }
}
