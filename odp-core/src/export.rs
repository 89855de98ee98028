//! Human-readable exports of the current plan

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::models::{read_references, EntityKind, Item, RequirementType};

/// Renders current items as a markdown document.
///
/// Requirements are grouped by type and drafting group, changes list the
/// requirements they satisfy, and setup data is listed per kind.
pub fn render_markdown(title: &str, items: &[Item]) -> String {
    let mut output = format!("# {}\n\n", title);

    let titles: BTreeMap<_, _> = items.iter().map(|i| (i.item_id, i.label())).collect();

    for req_type in [RequirementType::Need, RequirementType::Implementation] {
        let mut by_group: BTreeMap<String, Vec<&Item>> = BTreeMap::new();
        for item in items
            .iter()
            .filter(|i| i.requirement_type() == Some(req_type))
        {
            let group = item.text("draftingGroup").unwrap_or("Ungrouped").to_string();
            by_group.entry(group).or_default().push(item);
        }
        if by_group.is_empty() {
            continue;
        }

        output.push_str(&format!("## {} Requirements\n\n", req_type.code()));
        for (group, mut reqs) in by_group {
            output.push_str(&format!("### {}\n\n", group));
            reqs.sort_by_key(|r| r.label());
            for req in reqs {
                output.push_str(&format!("#### {}\n\n", req.label()));
                output.push_str(&format!(
                    "**Version:** {} | **Modified by:** {}\n\n",
                    req.version_number, req.modified_by
                ));
                for field in ["statement", "rationale"] {
                    if let Some(text) = req.text(field).filter(|t| !t.is_empty()) {
                        output.push_str(&format!("{}\n\n", text));
                    }
                }
                for parent in read_references(&req.content, "refinesParents") {
                    if let Some(label) = parent.resolve().and_then(|r| titles.get(&r.id)) {
                        output.push_str(&format!("**Refines:** {}\n\n", label));
                    }
                }
            }
        }
    }

    let mut changes: Vec<&Item> = items
        .iter()
        .filter(|i| i.kind == EntityKind::Change)
        .collect();
    if !changes.is_empty() {
        changes.sort_by_key(|c| c.label());
        output.push_str("## Changes\n\n");
        for change in changes {
            output.push_str(&format!("### {}\n\n", change.label()));
            if let Some(purpose) = change.text("purpose") {
                output.push_str(&format!("{}\n\n", purpose));
            }
            let satisfied: Vec<&str> = read_references(&change.content, "satisfiesRequirements")
                .iter()
                .filter_map(|r| r.resolve())
                .filter_map(|r| titles.get(&r.id).map(String::as_str))
                .collect();
            if !satisfied.is_empty() {
                output.push_str(&format!("**Satisfies:** {}\n\n", satisfied.join(", ")));
            }
        }
    }

    for kind in EntityKind::ALL
        .iter()
        .copied()
        .filter(|k| *k == EntityKind::Wave || k.is_setup())
    {
        let mut labels: Vec<String> = items
            .iter()
            .filter(|i| i.kind == kind)
            .map(Item::label)
            .collect();
        if labels.is_empty() {
            continue;
        }
        labels.sort();
        output.push_str(&format!("## {}\n\n", kind));
        for label in labels {
            output.push_str(&format!("- {}\n", label));
        }
        output.push('\n');
    }

    output
}

/// Writes the markdown rendering of `items` to `output_path`
pub fn export_markdown(title: &str, items: &[Item], output_path: &Path) -> Result<()> {
    fs::write(output_path, render_markdown(title, items))
        .with_context(|| format!("Failed to write export to {:?}", output_path))?;
    Ok(())
}
