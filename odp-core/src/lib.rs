pub mod config;
pub mod db;
pub mod error;
pub mod export;
pub mod models;
pub mod patch;
pub mod rules;
pub mod service;
pub mod tree;
pub mod validation;

// Re-export commonly used types
pub use config::Config;
pub use db::{
    create_backend, BackendType, CasOutcome, DatabaseConfig, ReadTxn, SqliteBackend,
    VersionedStore, YamlBackend,
};
pub use error::{ServiceError, ValidationError, ValidationResult};
pub use models::{
    EntityKind, Item, ItemVersion, Payload, Reference, RequirementType, StoreSnapshot,
};
pub use rules::{rules_for, EntityRules};
pub use service::ItemService;
pub use tree::{build_path, build_tree, PathSegment, SegmentKind, TreeEntity, TreeNode};
pub use validation::Validator;
