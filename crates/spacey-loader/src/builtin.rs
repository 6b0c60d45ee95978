// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Built-in handlers
//!
//! `json` backs the default native capability table. `csv`, `text` and
//! `lines` are ordinary handlers meant to be installed with
//! [`HandlerRegistry::define`](crate::registry::HandlerRegistry::define) or
//! passed inline.

use crate::handler::{Handler, HandlerContext};
use serde_json::{json, Number, Value};

/// Parses JSON into `{ default: <value> }`
pub fn json_handler() -> Handler {
    Handler::from_fn("json", |bytes: &[u8], ctx: &HandlerContext| {
        let text = ctx.decode_text(bytes)?;
        let value: Value = serde_json::from_str(&text)?;
        Ok(json!({ "default": value }))
    })
    .with_types(["json"])
}

/// Parses comma-separated rows into `{ default: [[..], ..], rows, columns }`
pub fn csv_handler() -> Handler {
    Handler::from_fn("csv", |bytes: &[u8], ctx: &HandlerContext| {
        let text = ctx.decode_text(bytes)?;
        let rows = parse_csv(&text);
        let columns = rows.iter().map(Vec::len).max().unwrap_or(0);
        Ok(json!({
            "default": rows,
            "rows": rows.len(),
            "columns": columns,
        }))
    })
    .with_types(["csv"])
}

/// Exposes the whole asset as a string default export
pub fn text_handler() -> Handler {
    Handler::from_fn("text", |bytes: &[u8], ctx: &HandlerContext| {
        let text = ctx.decode_text(bytes)?;
        Ok(json!({ "default": text, "length": text.chars().count() }))
    })
}

/// Splits the asset into lines
pub fn lines_handler() -> Handler {
    Handler::from_fn("lines", |bytes: &[u8], ctx: &HandlerContext| {
        let text = ctx.decode_text(bytes)?;
        let lines: Vec<&str> = text.lines().collect();
        Ok(json!({ "default": lines, "count": lines.len() }))
    })
}

/// Parse CSV text into rows of numbers and strings.
///
/// Blank lines are skipped. Fields that parse as integers or finite floats
/// become numbers, everything else stays a trimmed string. Quoting is not
/// supported.
pub fn parse_csv(text: &str) -> Vec<Vec<Value>> {
    text.lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.split(',').map(parse_field).collect())
        .collect()
}

fn parse_field(field: &str) -> Value {
    let field = field.trim();
    if let Ok(n) = field.parse::<i64>() {
        return Value::Number(Number::from(n));
    }
    if let Ok(f) = field.parse::<f64>() {
        if let Some(n) = Number::from_f64(f) {
            return Value::Number(n);
        }
    }
    Value::String(field.to_string())
}
