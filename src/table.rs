use chrono::{DateTime, Utc};
use dialoguer::console::{measure_text_width, style};
use std::io::{self, Write};

const MIN_CELL_WIDTH: usize = 6;
const CELL_PADDING: usize = 1;

/// Lays out `rows` in aligned columns. Widths ignore ANSI styling.
pub(crate) fn render_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let columns = headers.len();
    let mut widths: Vec<usize> = headers
        .iter()
        .map(|header| measure_text_width(header).max(MIN_CELL_WIDTH))
        .collect();
    for row in rows {
        for (idx, cell) in row.iter().take(columns).enumerate() {
            widths[idx] = widths[idx].max(measure_text_width(cell));
        }
    }

    let mut out = String::new();
    let header_cells: Vec<String> = headers.iter().map(|h| h.to_string()).collect();
    for row in std::iter::once(&header_cells).chain(rows.iter()) {
        let mut line = String::new();
        for (idx, cell) in row.iter().take(columns).enumerate() {
            line.push_str(cell);
            if idx + 1 < columns {
                let pad = widths[idx] - measure_text_width(cell) + CELL_PADDING;
                line.push_str(&" ".repeat(pad));
            }
        }
        out.push_str(line.trim_end());
        out.push('\n');
    }
    out
}

pub(crate) fn print_table(headers: &[&str], rows: &[Vec<String>]) -> Result<(), io::Error> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    out.write_all(render_table(headers, rows).as_bytes())?;
    out.flush()
}

/// Key/value listing used by the `inspect` commands.
pub(crate) fn print_fields(fields: &[(&str, String)]) -> Result<(), io::Error> {
    let width = fields
        .iter()
        .map(|(key, _)| measure_text_width(key) + 1)
        .max()
        .unwrap_or(0);
    let stdout = io::stdout();
    let mut out = stdout.lock();
    for (key, value) in fields {
        writeln!(out, "{:<width$} {}", format!("{key}:"), value, width = width)?;
    }
    out.flush()
}

pub(crate) fn colorize_status(status: &str) -> String {
    let styled = style(status);
    match status {
        "scheduled" | "waiting" | "pending" => styled.yellow().bright().to_string(),
        "building" | "releasing" | "binding" | "running" => styled.yellow().to_string(),
        "done" | "succeeded" | "enabled" => styled.green().to_string(),
        "failed" | "disabled" => styled.red().to_string(),
        _ => status.to_string(),
    }
}

/// Exit code for `build status`: zero only for a finished build.
pub(crate) fn status_exit_code(status: &str) -> i32 {
    if status == "done" {
        0
    } else {
        1
    }
}

fn plural(count: i64, unit: &str) -> String {
    if count == 1 {
        format!("1 {unit}")
    } else {
        format!("{count} {unit}s")
    }
}

/// Relative age such as `3 minutes ago`. Unset timestamps render as `-`.
pub(crate) fn humanize_time(then: DateTime<Utc>, now: DateTime<Utc>) -> String {
    if then.timestamp() <= 0 {
        return "-".to_string();
    }
    let delta = now.signed_duration_since(then);
    let (seconds, suffix) = if delta.num_seconds() >= 0 {
        (delta.num_seconds(), "ago")
    } else {
        (-delta.num_seconds(), "from now")
    };
    let amount = match seconds {
        0 => return "now".to_string(),
        s if s < 60 => plural(s, "second"),
        s if s < 3_600 => plural(s / 60, "minute"),
        s if s < 86_400 => plural(s / 3_600, "hour"),
        s if s < 7 * 86_400 => plural(s / 86_400, "day"),
        s if s < 30 * 86_400 => plural(s / (7 * 86_400), "week"),
        s if s < 365 * 86_400 => plural(s / (30 * 86_400), "month"),
        s => plural(s / (365 * 86_400), "year"),
    };
    format!("{amount} {suffix}")
}

pub(crate) fn humanize(then: DateTime<Utc>) -> String {
    humanize_time(then, Utc::now())
}
