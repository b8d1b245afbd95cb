//! Flatten an analysis result into display text.
//!
//! Pure functions, no async. The same input always produces the same bytes:
//! JSON objects are sorted maps and every walk below has a fixed order.

use serde_json::{Map, Value};
use std::fmt::Write as _;
use tracing::{debug, warn};

use crate::analysis::{AnalysisResult, Table};

/// Nesting deeper than this is not searched for selection marks.
const MAX_SCAN_DEPTH: usize = 64;

/// Upper bound on rendered grid cells per table.
const MAX_TABLE_CELLS: usize = 10_000;

/// A detected checkbox or radio button.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionMark {
    pub label: String,
    pub selected: bool,
}

/// Body text, then a table section, then a selection-mark section.
/// Missing parts are skipped.
pub fn extract(result: &AnalysisResult) -> String {
    let mut out = body_text(result);

    let tables: Vec<String> = result
        .all_tables()
        .map(render_table)
        .filter(|t| !t.is_empty())
        .collect();
    if !tables.is_empty() {
        start_section(&mut out, "Tables");
        for (i, table) in tables.iter().enumerate() {
            if i > 0 {
                out.push('\n');
            }
            let _ = writeln!(out, "Table {}:", i + 1);
            out.push_str(table);
        }
    }

    let marks = selection_marks(&result.tree);
    if !marks.is_empty() {
        start_section(&mut out, "Selection marks");
        for mark in &marks {
            let state = if mark.selected { "selected" } else { "unselected" };
            let _ = writeln!(out, "{}: {}", mark.label, state);
        }
    }

    out
}

/// Full `content` when present, else paragraphs, else v2.1 read lines.
fn body_text(result: &AnalysisResult) -> String {
    if let Some(content) = result.content.as_deref().filter(|c| !c.is_empty()) {
        return content.to_string();
    }

    if !result.paragraphs.is_empty() {
        return result
            .paragraphs
            .iter()
            .map(|p| p.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
    }

    result
        .read_results
        .iter()
        .flat_map(|page| page.lines.iter())
        .map(|line| line.text.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

fn start_section(out: &mut String, title: &str) {
    if !out.is_empty() {
        if !out.ends_with('\n') {
            out.push('\n');
        }
        out.push('\n');
    }
    let _ = writeln!(out, "--- {} ---", title);
}

/// Render a table as pipe-joined rows over a dense grid.
///
/// The grid is sized from the declared `rowCount`/`columnCount`, else from
/// the largest indices present. Cells the service did not return stay empty;
/// cells outside the declared size are dropped. Tables whose grid would
/// exceed [`MAX_TABLE_CELLS`] render as nothing.
pub fn render_table(table: &Table) -> String {
    let Some((rows, cols)) = grid_size(table) else {
        return String::new();
    };

    let mut grid = vec![vec![""; cols]; rows];
    for cell in &table.cells {
        if cell.row_index < rows && cell.column_index < cols {
            grid[cell.row_index][cell.column_index] = cell.content.as_str();
        }
    }

    let mut out = String::new();
    for row in grid {
        out.push_str(&row.join(" | "));
        out.push('\n');
    }
    out
}

fn grid_size(table: &Table) -> Option<(usize, usize)> {
    if table.cells.is_empty() {
        return None;
    }

    let rows = match table.row_count {
        Some(n) => n,
        None => table.cells.iter().map(|c| c.row_index).max()?.checked_add(1)?,
    };
    let cols = match table.column_count {
        Some(n) => n,
        None => table.cells.iter().map(|c| c.column_index).max()?.checked_add(1)?,
    };

    match rows.checked_mul(cols) {
        Some(0) => None,
        Some(n) if n <= MAX_TABLE_CELLS => Some((rows, cols)),
        _ => {
            warn!("Skipping {}x{} table: too many cells", rows, cols);
            None
        }
    }
}

struct Pending<'a> {
    label: String,
    node: &'a Value,
    depth: usize,
}

/// Collect selection marks from anywhere in the result tree.
///
/// Two encodings are recognized: extracted fields typed `selectionMark`
/// (labelled by their field name) and members of a page's `selectionMarks`
/// array (labelled by page and position). Uses an explicit stack, pre-order.
pub fn selection_marks(tree: &Value) -> Vec<SelectionMark> {
    let mut marks = Vec::new();
    let mut stack = vec![Pending {
        label: String::new(),
        node: tree,
        depth: 0,
    }];

    while let Some(Pending { label, node, depth }) = stack.pop() {
        if depth > MAX_SCAN_DEPTH {
            debug!("Selection mark scan skipped a node nested {} levels deep", depth);
            continue;
        }

        match node {
            Value::Object(map) => {
                if map.get("type").and_then(Value::as_str) == Some("selectionMark") {
                    if let Some(selected) = mark_state(map) {
                        marks.push(SelectionMark { label, selected });
                    }
                    continue;
                }

                let context = page_label(map).unwrap_or_else(|| label.clone());
                let mut children = Vec::new();

                for (key, child) in map {
                    if key == "selectionMarks" {
                        if let Value::Array(items) = child {
                            for (i, item) in items.iter().enumerate() {
                                let Value::Object(item) = item else { continue };
                                if let Some(selected) = mark_state(item) {
                                    marks.push(SelectionMark {
                                        label: numbered(&context, "mark", i),
                                        selected,
                                    });
                                }
                            }
                        }
                        continue;
                    }

                    if child.is_object() || child.is_array() {
                        // `fields` and `value*` wrappers keep the enclosing name.
                        let child_label = if key == "fields" || key.starts_with("value") {
                            label.clone()
                        } else {
                            key.clone()
                        };
                        children.push(Pending {
                            label: child_label,
                            node: child,
                            depth: depth + 1,
                        });
                    }
                }

                stack.extend(children.into_iter().rev());
            }
            Value::Array(items) => {
                stack.extend(
                    items
                        .iter()
                        .enumerate()
                        .filter(|(_, item)| item.is_object() || item.is_array())
                        .map(|(i, item)| Pending {
                            label: format!("{} #{}", label, i + 1),
                            node: item,
                            depth: depth + 1,
                        })
                        .rev(),
                );
            }
            _ => {}
        }
    }

    marks
}

fn page_label(map: &Map<String, Value>) -> Option<String> {
    map.get("pageNumber")
        .or_else(|| map.get("page"))
        .and_then(Value::as_u64)
        .map(|n| format!("page {}", n))
}

fn numbered(context: &str, noun: &str, index: usize) -> String {
    if context.is_empty() {
        format!("{} {}", noun, index + 1)
    } else {
        format!("{} {} {}", context, noun, index + 1)
    }
}

/// `Some(true)` for selected, `Some(false)` for unselected, `None` if unknown.
fn mark_state(map: &Map<String, Value>) -> Option<bool> {
    ["valueSelectionMark", "state", "text", "content"]
        .iter()
        .filter_map(|key| map.get(*key).and_then(Value::as_str))
        .find_map(|raw| match raw.trim() {
            "selected" | ":selected:" => Some(true),
            "unselected" | ":unselected:" => Some(false),
            _ => None,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn result(tree: Value) -> AnalysisResult {
        AnalysisResult::from_value(tree).unwrap()
    }

    #[test]
    fn test_sparse_table_fills_missing_cells() {
        let r = result(json!({
            "tables": [{"cells": [
                {"rowIndex": 0, "columnIndex": 0, "content": "A"},
                {"rowIndex": 1, "columnIndex": 1, "content": "B"}
            ]}]
        }));
        assert_eq!(render_table(&r.tables[0]), "A | \n | B\n");
    }

    #[test]
    fn test_declared_size_bounds_the_grid() {
        let r = result(json!({
            "tables": [{"rowCount": 1, "columnCount": 2, "cells": [
                {"rowIndex": 0, "columnIndex": 1, "content": "B"},
                {"rowIndex": 7, "columnIndex": 0, "content": "stray"}
            ]}]
        }));
        assert_eq!(render_table(&r.tables[0]), " | B\n");
    }

    #[test]
    fn test_out_of_range_indices_skip_the_table() {
        let r = result(json!({
            "content": "Name: Jane",
            "tables": [
                {"cells": [{"rowIndex": 18446744073709551615u64, "columnIndex": 0, "content": "x"}]},
                {"cells": [{"rowIndex": 100000, "columnIndex": 100000, "content": "y"}]},
                {"cells": [{"rowIndex": 0, "columnIndex": 0, "content": "ok"}]}
            ]
        }));
        assert_eq!(render_table(&r.tables[0]), "");
        assert_eq!(render_table(&r.tables[1]), "");
        assert_eq!(
            extract(&r),
            "Name: Jane\n\n--- Tables ---\nTable 1:\nok\n"
        );
    }

    #[test]
    fn test_empty_table_renders_nothing() {
        let r = result(json!({"content": "x", "tables": [{"cells": []}]}));
        assert_eq!(render_table(&r.tables[0]), "");
        assert_eq!(extract(&r), "x");
    }

    #[test]
    fn test_content_preferred_over_paragraphs() {
        let r = result(json!({
            "content": "Full text",
            "paragraphs": [{"content": "ignored"}]
        }));
        assert_eq!(extract(&r), "Full text");
    }

    #[test]
    fn test_paragraphs_joined_with_blank_line() {
        let r = result(json!({
            "paragraphs": [{"content": "First"}, {"content": "Second"}]
        }));
        assert_eq!(extract(&r), "First\n\nSecond");
    }

    #[test]
    fn test_legacy_read_lines_used_as_last_resort() {
        let r = result(json!({
            "readResults": [
                {"page": 1, "lines": [{"text": "Name"}, {"text": "Jane"}]},
                {"page": 2, "lines": [{"text": "DOB"}]}
            ]
        }));
        assert_eq!(extract(&r), "Name\nJane\nDOB");
    }

    #[test]
    fn test_missing_sections_produce_empty_output() {
        assert_eq!(extract(&result(json!({}))), "");
    }

    #[test]
    fn test_full_layout_rendering() {
        let r = result(json!({
            "content": "Patient intake",
            "tables": [{"cells": [
                {"rowIndex": 0, "columnIndex": 0, "content": "Name"},
                {"rowIndex": 0, "columnIndex": 1, "content": "Jane"}
            ]}],
            "pages": [{
                "pageNumber": 1,
                "selectionMarks": [
                    {"state": "selected", "confidence": 0.9},
                    {"state": "unselected", "confidence": 0.8}
                ]
            }],
            "documents": [{
                "docType": "intake",
                "fields": {
                    "Smoker": {"type": "selectionMark", "valueSelectionMark": "selected"},
                    "Name": {"type": "string", "valueString": "Jane"}
                }
            }]
        }));

        assert_eq!(
            extract(&r),
            "Patient intake\n\n\
             --- Tables ---\n\
             Table 1:\n\
             Name | Jane\n\
             \n\
             --- Selection marks ---\n\
             Smoker: selected\n\
             page 1 mark 1: selected\n\
             page 1 mark 2: unselected\n"
        );
    }

    #[test]
    fn test_selection_marks_inside_arrays_and_legacy_pages() {
        let tree = json!({
            "documents": [{"fields": {
                "Symptoms": {"type": "array", "valueArray": [
                    {"type": "selectionMark", "content": ":unselected:"},
                    {"type": "selectionMark", "content": ":selected:"}
                ]}
            }}],
            "readResults": [{"page": 2, "selectionMarks": [{"state": "selected"}]}]
        });

        let marks = selection_marks(&tree);
        assert_eq!(
            marks,
            vec![
                SelectionMark { label: "Symptoms #1".to_string(), selected: false },
                SelectionMark { label: "Symptoms #2".to_string(), selected: true },
                SelectionMark { label: "page 2 mark 1".to_string(), selected: true },
            ]
        );
    }

    #[test]
    fn test_unknown_mark_state_is_skipped() {
        let tree = json!({"pages": [{"selectionMarks": [{"state": "maybe"}]}]});
        assert!(selection_marks(&tree).is_empty());
    }

    #[test]
    fn test_marks_beyond_depth_limit_are_ignored() {
        let mut tree = json!({"type": "selectionMark", "state": "selected"});
        for _ in 0..200 {
            tree = json!({ "nested": tree });
        }
        assert!(selection_marks(&tree).is_empty());
    }

    #[test]
    fn test_extract_is_deterministic() {
        let r = result(json!({
            "paragraphs": [{"content": "p"}],
            "tables": [{"cells": [
                {"rowIndex": 2, "columnIndex": 0, "content": "z"},
                {"rowIndex": 0, "columnIndex": 2, "content": "y"}
            ]}],
            "pages": [{"pageNumber": 1, "selectionMarks": [{"state": "selected"}]}]
        }));
        let first = extract(&r);
        let second = extract(&r);
        assert_eq!(first, second);
        assert_eq!(first, extract(&r.clone()));
    }
}
