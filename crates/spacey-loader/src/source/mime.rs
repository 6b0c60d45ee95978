// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Mime type inference

use url::Url;

/// Mime type used when nothing better is known
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Guess a mime type from the extension of the url path
pub fn mime_from_extension(url: &Url) -> &'static str {
    let path = url.path();
    let file = path.rsplit('/').next().unwrap_or(path);
    let ext = match file.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => ext.to_ascii_lowercase(),
        _ => return OCTET_STREAM,
    };

    match ext.as_str() {
        "json" => "application/json",
        "webmanifest" => "application/manifest+json",
        "csv" => "text/csv",
        "tsv" => "text/tab-separated-values",
        "txt" | "text" => "text/plain",
        "md" | "markdown" => "text/markdown",
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "scss" => "text/x-scss",
        "sass" => "text/x-sass",
        "less" => "text/x-less",
        "js" | "mjs" | "cjs" => "text/javascript",
        "ts" | "mts" | "cts" => "application/typescript",
        "xml" => "application/xml",
        "svg" => "image/svg+xml",
        "yaml" | "yml" => "application/yaml",
        "toml" => "application/toml",
        "wasm" => "application/wasm",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        _ => OCTET_STREAM,
    }
}

/// Split a `Content-Type` value into (mime, charset)
pub fn parse_content_type(value: &str) -> (String, Option<String>) {
    let mut parts = value.split(';');
    let mime = parts
        .next()
        .map(|m| m.trim().to_ascii_lowercase())
        .unwrap_or_default();

    let charset = parts.find_map(|param| {
        let (name, value) = param.split_once('=')?;
        if name.trim().eq_ignore_ascii_case("charset") {
            Some(value.trim().trim_matches('"').to_ascii_lowercase())
        } else {
            None
        }
    });

    (mime, charset)
}

/// Whether a mime type is text that should be decoded as UTF-8 by default
pub fn is_textual(mime: &str) -> bool {
    mime.starts_with("text/")
        || mime.ends_with("+json")
        || mime.ends_with("+xml")
        || matches!(
            mime,
            "application/json"
                | "application/xml"
                | "application/javascript"
                | "application/typescript"
                | "application/yaml"
                | "application/toml"
        )
}
