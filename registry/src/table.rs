//! Chart table rendering.

use chrono::{DateTime, Utc};
use comfy_table::{ContentArrangement, Table};

use crate::digest::Digest;

/// Column headers of the chart table.
pub const CHART_TABLE_HEADERS: &[&str] = &["REF", "NAME", "VERSION", "DIGEST", "SIZE", "UPDATED"];

/// Hex characters shown for a digest.
const SHORT_DIGEST_LEN: usize = 7;

/// One cached chart, as listed in the table.
#[derive(Debug, Clone, PartialEq)]
pub struct ChartRow {
    pub reference: String,
    pub name: String,
    pub version: String,
    pub digest: Digest,
    /// Total size of config and layers
    pub size: u64,
    pub updated: DateTime<Utc>,
}

/// Create a borderless table with the given headers.
pub fn new_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.load_preset(comfy_table::presets::NOTHING);
    table.set_header(headers);
    table
}

pub fn chart_table(rows: &[ChartRow]) -> Table {
    let mut table = new_table(CHART_TABLE_HEADERS);
    let now = Utc::now();
    for row in rows {
        table.add_row(vec![
            row.reference.clone(),
            row.name.clone(),
            row.version.clone(),
            short_digest(&row.digest),
            format_bytes(row.size),
            format_ago(&row.updated, &now),
        ]);
    }
    table
}

pub fn short_digest(digest: &Digest) -> String {
    digest.hex()[..SHORT_DIGEST_LEN].to_string()
}

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;

    if bytes >= GB {
        format!("{:.1} GiB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MiB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KiB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Format `dt` relative to `now` ("3 minutes ago").
pub fn format_ago(dt: &DateTime<Utc>, now: &DateTime<Utc>) -> String {
    let duration = now.signed_duration_since(*dt);

    let secs = duration.num_seconds();
    if secs < 1 {
        return "just now".to_string();
    }
    if secs < 60 {
        return format!("{secs} seconds ago");
    }

    let mins = duration.num_minutes();
    if mins < 60 {
        return format!("{mins} minutes ago");
    }

    let hours = duration.num_hours();
    if hours < 24 {
        return format!("{hours} hours ago");
    }

    let days = duration.num_days();
    if days < 30 {
        return format!("{days} days ago");
    }
    if days < 365 {
        return format!("{} months ago", days / 30);
    }
    format!("{} years ago", days / 365)
}
