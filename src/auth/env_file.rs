// Flat KEY=value credential file: parsing and in-place upserts

use regex::Regex;
use std::collections::HashMap;

/// Parse `KEY=value` lines. Blank lines and `#` comments are skipped,
/// an optional `export ` prefix and surrounding quotes are removed.
pub fn parse(content: &str) -> HashMap<String, String> {
    let mut values = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        values.insert(key.to_string(), unquote(value.trim()));
    }
    values
}

fn unquote(value: &str) -> String {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            let inner = &value[1..value.len() - 1];
            return if quote == '"' {
                inner.replace("\\\"", "\"")
            } else {
                inner.to_string()
            };
        }
    }
    // Unquoted values may carry a trailing comment
    match value.find(" #") {
        Some(idx) => value[..idx].trim_end().to_string(),
        None => value.to_string(),
    }
}

/// Render a value, quoting it when it would not survive an unquoted round trip.
pub fn format_value(value: &str) -> String {
    let needs_quotes = value.is_empty()
        || value
            .chars()
            .any(|c| c.is_whitespace() || c == '#' || c == '"' || c == '\'');
    if needs_quotes {
        format!("\"{}\"", value.replace('"', "\\\""))
    } else {
        value.to_string()
    }
}

/// Replace the line defining `key`, or append one if the key is not present.
/// Later duplicate definitions are dropped so the new value is the only one.
pub fn upsert(content: &str, key: &str, value: &str) -> String {
    let line = format!("{}={}", key, format_value(value));
    let pattern = format!(r"^[ \t]*(?:export[ \t]+)?{}[ \t]*=", regex::escape(key));
    let re = match Regex::new(&pattern) {
        Ok(re) => re,
        Err(_) => return append_line(content, &line),
    };

    let mut found = false;
    let mut out = String::with_capacity(content.len() + line.len());
    for raw in content.split_inclusive('\n') {
        let body = raw.trim_end_matches(|c: char| c == '\n' || c == '\r');
        if !re.is_match(body) {
            out.push_str(raw);
            continue;
        }
        if !found {
            found = true;
            out.push_str(&line);
            out.push_str(&raw[body.len()..]);
        }
    }

    if found {
        out
    } else {
        append_line(content, &line)
    }
}

fn append_line(content: &str, line: &str) -> String {
    let mut out = content.to_string();
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(line);
    out.push('\n');
    out
}
