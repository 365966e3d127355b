//! Prometheus exposition-format rendering: name/label sanitization and line writers.
//!
//! Adapted from `metrics-exporter-prometheus`'s formatter of the same name; the sanitization
//! rules and escaping are unchanged, only the call sites differ (vectors/children instead of
//! a global key/label registry).

use std::fmt::Write;

/// Writes a `# HELP` line. No-op if `help` is empty.
pub fn write_help_line(buf: &mut String, name: &str, help: &str) {
    if help.is_empty() {
        return;
    }
    buf.push_str("# HELP ");
    buf.push_str(name);
    buf.push(' ');
    buf.push_str(&sanitize_label_value_or_description(help, true));
    buf.push('\n');
}

/// Writes a `# TYPE` line.
pub fn write_type_line(buf: &mut String, name: &str, metric_type: &str) {
    buf.push_str("# TYPE ");
    buf.push_str(name);
    buf.push(' ');
    buf.push_str(metric_type);
    buf.push('\n');
}

/// Writes one `name{labels} value` line. `labels` must already be sanitized keys; values are
/// escaped here.
pub fn write_metric_line(buf: &mut String, name: &str, suffix: Option<&str>, labels: &[(&str, &str)], value: f64) {
    buf.push_str(name);
    if let Some(suffix) = suffix {
        buf.push_str(suffix);
    }
    if !labels.is_empty() {
        buf.push('{');
        for (i, (k, v)) in labels.iter().enumerate() {
            if i > 0 {
                buf.push(',');
            }
            buf.push_str(k);
            buf.push_str("=\"");
            buf.push_str(&sanitize_label_value(v));
            buf.push('"');
        }
        buf.push('}');
    }
    buf.push(' ');
    let _ = write!(buf, "{}", format_value(value));
    buf.push('\n');
}

/// Formats a float the way Prometheus's text exposition format expects: `+Inf`/`-Inf`/`NaN`
/// for non-finite values, otherwise the shortest round-tripping decimal.
pub fn format_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value.is_infinite() {
        if value > 0.0 { "+Inf".to_string() } else { "-Inf".to_string() }
    } else {
        format!("{value}")
    }
}

/// Validates and rewrites a metric name into the character set Prometheus accepts:
/// `[a-zA-Z_:][a-zA-Z0-9_:]*`. Invalid characters become `_`.
pub fn sanitize_metric_name(name: &str) -> String {
    sanitize(name, invalid_metric_name_start_character, invalid_metric_name_character)
}

/// Same rule set as [`sanitize_metric_name`] minus the leading `:`, which Prometheus reserves
/// for recording rules and disallows in label keys.
pub fn sanitize_label_key(key: &str) -> String {
    sanitize(key, invalid_label_key_start_character, invalid_label_key_character)
}

fn sanitize(input: &str, invalid_start: fn(char) -> bool, invalid_rest: fn(char) -> bool) -> String {
    if input.is_empty() {
        return String::new();
    }
    let mut out = String::with_capacity(input.len());
    for (i, c) in input.chars().enumerate() {
        let bad = if i == 0 { invalid_start(c) } else { invalid_rest(c) };
        out.push(if bad { '_' } else { c });
    }
    out
}

fn invalid_metric_name_start_character(c: char) -> bool {
    !(c.is_ascii_alphabetic() || c == '_' || c == ':')
}

fn invalid_metric_name_character(c: char) -> bool {
    !(c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

fn invalid_label_key_start_character(c: char) -> bool {
    !(c.is_ascii_alphabetic() || c == '_')
}

fn invalid_label_key_character(c: char) -> bool {
    !(c.is_ascii_alphanumeric() || c == '_')
}

/// Escapes a label value: backslash, double quote, and newline are backslash-escaped.
pub fn sanitize_label_value(value: &str) -> String {
    sanitize_label_value_or_description(value, false)
}

/// Escapes a HELP string the same way: backslash and newline, but not quotes (HELP lines are
/// not quoted).
pub fn sanitize_label_value_or_description(value: &str, is_desc: bool) -> String {
    // All Unicode is valid; only backslashes, double quotes, and line feeds need escaping. A
    // single pass with a `previous_backslash` flag avoids re-escaping a backslash that's already
    // part of an escaped pair, which a naive `.replace('\\', "\\\\")` run over the whole string
    // first would do.
    let mut sanitized = String::with_capacity(value.len());
    let mut previous_backslash = false;
    for c in value.chars() {
        match c {
            '\n' => sanitized.push_str("\\n"),
            '"' if !is_desc => {
                previous_backslash = false;
                sanitized.push_str("\\\"");
            }
            '\\' => {
                if previous_backslash {
                    sanitized.push_str("\\\\");
                }
                previous_backslash = !previous_backslash;
            }
            c => {
                if previous_backslash {
                    previous_backslash = false;
                    sanitized.push_str("\\\\");
                }
                sanitized.push(c);
            }
        }
    }
    if previous_backslash {
        sanitized.push_str("\\\\");
    }
    sanitized
}
