//! Compact output rendering helpers for CLI surfaces.
//!
//! Keeps status and report output bounded and readable while preserving signal.

use colored::Colorize;

/// Collapse newlines/extra whitespace and bound length for terminal display.
pub fn compact_line(input: &str, max_chars: usize) -> String {
    let collapsed = input.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut chars = collapsed.chars();
    let preview: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{}...", preview)
    } else {
        preview
    }
}

/// Render up to `max_items` items joined with ` | `, noting how many were cut.
pub fn preview_items(items: &[String], max_items: usize, max_chars: usize) -> String {
    if items.is_empty() {
        return String::new();
    }
    let shown = items
        .iter()
        .take(max_items)
        .map(|m| compact_line(m, max_chars))
        .collect::<Vec<_>>()
        .join(" | ");
    if items.len() > max_items {
        format!("{} (+{} more)", shown, items.len() - max_items)
    } else {
        shown
    }
}

/// `[####......] 4/10` style progress for workflow and card counts.
pub fn progress_bar(done: usize, total: usize, width: usize) -> String {
    if total == 0 {
        return format!("[{}] 0/0", ".".repeat(width));
    }
    let filled = (done.min(total) * width) / total;
    format!(
        "[{}{}] {}/{}",
        "#".repeat(filled),
        ".".repeat(width - filled),
        done,
        total
    )
}

/// Colored label for a card, workflow, guard or phase state.
pub fn state_label(state: &str) -> String {
    let upper = state.to_ascii_uppercase();
    match state {
        "done" | "pass" | "go" => upper.green().bold().to_string(),
        "failed" | "fail" | "no-go" => upper.red().bold().to_string(),
        "blocked" | "overdue" => upper.yellow().bold().to_string(),
        "in_progress" | "running" => upper.cyan().to_string(),
        _ => upper.dimmed().to_string(),
    }
}
