mod cli;

use anyhow::{bail, Context, Result};
use clap::Parser;
use colored::Colorize;
use serde_json::Value;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

use odp_core::db::{self, export_to_json, migrate};
use odp_core::export::export_markdown;
use odp_core::models::value_to_plain;
use odp_core::{
    build_tree, config, create_backend, BackendType, EntityKind, Item, ItemService, Payload,
    SegmentKind, ServiceError, TreeNode,
};

use crate::cli::{BackendArg, Cli, Command, ExportFormat, PayloadArgs};

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(err) = run(&cli) {
        report_error(&err);
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp(None)
        .init();
}

fn run(cli: &Cli) -> Result<()> {
    let config = config::resolve(cli.db.clone())?;
    let db_config = config.database_config();
    log::debug!(
        "Using {} store at {:?}",
        db_config.backend_type,
        db_config.path
    );

    let store = db::open(&db_config)?;
    let service = ItemService::new(Arc::from(store), config.actor());

    match &cli.command {
        Command::Create { kind, payload } => {
            let kind = parse_kind(kind)?;
            let item = service.create(kind, read_payload(payload)?)?;
            println!(
                "{} {} {}",
                "Created".green(),
                item.kind,
                item.item_id.to_string().bold()
            );
            println!("{}: {}", "Version".blue(), item.version_id);
        }
        Command::Update {
            id,
            expected,
            payload,
        } => {
            let id = parse_id(id)?;
            let expected = parse_id(expected)?;
            let item = service.update(&id, read_payload(payload)?, &expected)?;
            println!(
                "{} {} to version {}",
                "Updated".green(),
                item.item_id.to_string().bold(),
                item.version_number
            );
            println!("{}: {}", "Version".blue(), item.version_id);
        }
        Command::Show { id } => {
            let item = service.get(&parse_id(id)?)?;
            show_item(&item);
        }
        Command::History { id } => {
            let versions = service.history(&parse_id(id)?)?;
            for version in versions {
                println!(
                    "{} {}  {}  {}",
                    format!("v{}", version.version_number).bold(),
                    version.version_id,
                    version.created_at.format("%Y-%m-%d %H:%M:%S"),
                    version.created_by.dimmed()
                );
            }
        }
        Command::List { kind } => {
            let kind = kind.as_deref().map(parse_kind).transpose()?;
            let items = service.list(kind)?;
            if items.is_empty() {
                println!("No items found.");
            }
            for item in &items {
                println!(
                    "{:<22} {}  v{:<3} {}",
                    item.kind.to_string().cyan(),
                    item.item_id,
                    item.version_number,
                    item.label()
                );
            }
        }
        Command::Tree { kind } => {
            let kind = kind.as_deref().map(parse_kind).transpose()?;
            let items = service.list(kind)?;
            for node in build_tree(&items) {
                print_node(&node, 0);
            }
        }
        Command::Validate { kind, id, payload } => {
            let kind = parse_kind(kind)?;
            let payload = read_payload(payload)?;
            let result = match id {
                Some(id) => {
                    let id = parse_id(id)?;
                    let current = service.get(&id)?;
                    if current.kind != kind {
                        bail!("Item {} is a {}, not a {}", id, current.kind, kind);
                    }
                    service.validate_update(&id, payload)?
                }
                None => service.validate_create(kind, &payload)?,
            };

            if result.is_valid() {
                println!("{}", "Valid".green());
            } else {
                for error in &result.errors {
                    println!("  {} {}", "-".red(), error);
                }
                bail!("{} validation error(s)", result.errors.len());
            }
        }
        Command::Export { output, format } => match format {
            ExportFormat::Json => {
                let snapshot = service.store().snapshot()?;
                export_to_json(&snapshot, output)?;
                println!("Exported to JSON: {}", output.display());
                println!("  Total items: {}", snapshot.items.len());
                println!("  Total versions: {}", snapshot.versions.len());
            }
            ExportFormat::Markdown => {
                let items = service.list(None)?;
                export_markdown("Operational Deployment Plan", &items, output)?;
                println!("Exported to markdown: {}", output.display());
                println!("  Total items: {}", items.len());
            }
        },
        Command::Info => {
            let stats = service.store().stats()?;
            println!("{}: {}", "Store".blue(), service.store().path().display());
            println!("{}: {}", "Backend".blue(), stats.backend_type);
            println!("{}: {}", "Items".blue(), stats.item_count);
            println!("{}: {}", "Versions".blue(), stats.version_count);
        }
        Command::Migrate { to, backend } => {
            let backend = backend.map(|b| match b {
                BackendArg::Yaml => BackendType::Yaml,
                BackendArg::Sqlite => BackendType::Sqlite,
            });
            let target = create_backend(to, backend)?;
            let count = migrate(service.store(), target.as_ref())?;
            println!(
                "{} {} items to {} ({})",
                "Migrated".green(),
                count,
                to.display(),
                target.backend_type()
            );
        }
    }

    Ok(())
}

fn report_error(err: &anyhow::Error) {
    match err.downcast_ref::<ServiceError>() {
        Some(ServiceError::VersionConflict {
            item_id,
            expected,
            actual,
        }) => {
            eprintln!("{} item {} was modified", "Conflict:".red().bold(), item_id);
            eprintln!("  {}: {}", "Your version".yellow(), expected);
            eprintln!("  {}: {}", "Current version".yellow(), actual);
            eprintln!("Reload the item and reapply your changes.");
        }
        Some(ServiceError::Validation(errors)) => {
            eprintln!("{}", "Validation failed:".red().bold());
            for error in errors {
                eprintln!("  {} {}", "-".red(), error);
            }
        }
        _ => eprintln!("{} {:#}", "Error:".red().bold(), err),
    }
}

fn parse_kind(s: &str) -> Result<EntityKind> {
    EntityKind::parse(s).with_context(|| {
        let kinds: Vec<&str> = EntityKind::ALL.iter().map(|k| k.as_str()).collect();
        format!("Unknown kind '{}' (expected one of: {})", s, kinds.join(", "))
    })
}

fn parse_id(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s.trim()).with_context(|| format!("Invalid ID: {}", s))
}

/// Builds a payload from an optional JSON file and `--set` assignments
fn read_payload(args: &PayloadArgs) -> Result<Payload> {
    let mut payload = match &args.file {
        Some(path) => read_payload_file(path)?,
        None => Payload::new(),
    };

    for assignment in &args.set {
        let (key, value) = parse_assignment(assignment)?;
        payload.insert(key, value);
    }
    Ok(payload)
}

fn read_payload_file(path: &Path) -> Result<Payload> {
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
    let value: Value =
        serde_json::from_str(&content).with_context(|| format!("Failed to parse {:?}", path))?;
    match value {
        Value::Object(map) => Ok(map),
        _ => bail!("{:?} must contain a JSON object", path),
    }
}

fn parse_assignment(assignment: &str) -> Result<(String, Value)> {
    let Some((key, raw)) = assignment.split_once('=') else {
        bail!("Expected KEY=VALUE, got '{}'", assignment);
    };
    let key = key.trim();
    if key.is_empty() {
        bail!("Empty field name in '{}'", assignment);
    }
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((key.to_string(), value))
}

fn show_item(item: &Item) {
    println!("{}: {}", "ID".blue(), item.item_id);
    println!("{}: {}", "Kind".blue(), item.kind);
    println!("{}: {}", "Label".blue(), item.label().bold());
    println!(
        "{}: {} ({})",
        "Version".blue(),
        item.version_number,
        item.version_id
    );
    println!(
        "{}: {} by {}",
        "Created".blue(),
        item.created_at.format("%Y-%m-%d %H:%M:%S"),
        item.created_by
    );
    println!(
        "{}: {} by {}",
        "Modified".blue(),
        item.modified_at.format("%Y-%m-%d %H:%M:%S"),
        item.modified_by
    );

    for (field, value) in &item.content {
        match value {
            Value::Array(values) => {
                println!("{}:", field.blue());
                for value in values {
                    println!("  - {}", render_value(value));
                }
            }
            _ => println!("{}: {}", field.blue(), render_value(value)),
        }
    }
}

fn render_value(value: &Value) -> String {
    match value {
        Value::Object(map) if map.contains_key("id") => {
            let id = map.get("id").map(value_to_plain).unwrap_or_default();
            match map.get("note").and_then(Value::as_str) {
                Some(note) => format!("{} ({})", id, note),
                None => id,
            }
        }
        Value::Object(_) | Value::Array(_) => value.to_string(),
        _ => value_to_plain(value),
    }
}

fn print_node(node: &TreeNode<Uuid>, depth: usize) {
    let indent = "  ".repeat(depth);
    let label = match node.kind {
        SegmentKind::Group => node.label.blue().bold(),
        SegmentKind::Folder => format!("{}/", node.label).yellow(),
        SegmentKind::Entity => node.label.normal(),
    };
    match node.entity {
        Some(id) => println!("{}{} {}", indent, label, id.to_string().dimmed()),
        None => println!("{}{}", indent, label),
    }
    for child in &node.children {
        print_node(child, depth + 1);
    }
}
