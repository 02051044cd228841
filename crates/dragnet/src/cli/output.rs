//! Table rendering helpers shared by CLI commands.

use comfy_table::{presets::UTF8_FULL_CONDENSED, Cell, Color, ContentArrangement, Table};
use dragnet_protocol::JobStatus;

/// Build a table with the standard preset and header.
pub fn table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(headers.iter().map(|h| Cell::new(h)).collect::<Vec<_>>());
    table
}

/// Status cell with the conventional colors.
pub fn status_cell(status: JobStatus) -> Cell {
    Cell::new(status.as_str()).fg(status_color(status))
}

fn status_color(status: JobStatus) -> Color {
    match status {
        JobStatus::Pending => Color::Grey,
        JobStatus::Queued => Color::Yellow,
        JobStatus::Running => Color::Cyan,
        JobStatus::Completed => Color::Green,
        JobStatus::Failed => Color::Red,
        JobStatus::Cancelled => Color::DarkGrey,
        JobStatus::Retrying => Color::Magenta,
    }
}

/// Shorten a UUID for table display.
pub fn short_uuid(uuid: &str) -> String {
    uuid.chars().take(8).collect()
}

/// Render an optional timestamp column.
pub fn opt(value: &Option<String>) -> String {
    value.clone().unwrap_or_else(|| "-".to_string())
}
