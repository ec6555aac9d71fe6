//! Userscript metadata block parser
//!
//! ```text
//! // ==UserScript==
//! // @name        Example
//! // @match       *://example.com/*
//! // ==/UserScript==
//! ```
//!
//! Keys are case-sensitive. List keys (`@match`, `@grant`, ...) accumulate;
//! for scalar keys the first occurrence wins. Localized variants such as
//! `@name:fr` are ignored.

use std::ops::Range;
use std::sync::OnceLock;

use regex::Regex;

use crate::types::Meta;

/// Errors from [`parse_meta`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MetaError {
    #[error("Invalid script: no metadata block")]
    MissingBlock,

    #[error("Invalid script: @name is required")]
    MissingName,
}

fn metablock_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:^|\n)\s*//\x20==UserScript==([\s\S]*?\n)\s*//\x20==/UserScript==").ok()
    })
    .as_ref()
}

/// Byte range of the metadata block from `// ==UserScript==` through
/// `// ==/UserScript==`, excluding leading whitespace.
pub fn metablock_range(code: &str) -> Option<Range<usize>> {
    let m = metablock_re()?.find(code)?;
    let text = m.as_str();
    let lead = text.len() - text.trim_start().len();
    Some(m.start() + lead..m.end())
}

/// Body of the metadata block, between the two markers.
fn metablock_body(code: &str) -> Option<&str> {
    metablock_re()?
        .captures(code)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// Parse the metadata block of a userscript.
///
/// Fails when there is no block or no `@name`, since such code cannot be
/// installed.
pub fn parse_meta(code: &str) -> Result<Meta, MetaError> {
    let body = metablock_body(code).ok_or(MetaError::MissingBlock)?;
    let mut meta = Meta::default();

    for line in body.lines() {
        let Some(rest) = line.trim().strip_prefix("//") else {
            continue;
        };
        let Some(rest) = rest.trim_start().strip_prefix('@') else {
            continue;
        };
        let (key, value) = match rest.find(char::is_whitespace) {
            Some(pos) => (&rest[..pos], rest[pos..].trim()),
            None => (rest, ""),
        };
        apply_key(&mut meta, key, value);
    }

    meta.dedup_grants();
    if meta.name.as_deref().map_or(true, str::is_empty) {
        return Err(MetaError::MissingName);
    }
    Ok(meta)
}

fn apply_key(meta: &mut Meta, key: &str, value: &str) {
    fn set_once(slot: &mut Option<String>, value: &str) {
        if slot.is_none() && !value.is_empty() {
            *slot = Some(value.to_string());
        }
    }

    match key {
        "name" => set_once(&mut meta.name, value),
        "namespace" => set_once(&mut meta.namespace, value),
        "version" => set_once(&mut meta.version, value),
        "description" => set_once(&mut meta.description, value),
        "homepage" => set_once(&mut meta.homepage, value),
        "homepageURL" => set_once(&mut meta.homepage_url, value),
        "icon" | "iconURL" => set_once(&mut meta.icon, value),
        "run-at" => set_once(&mut meta.run_at, value),
        "inject-into" => set_once(&mut meta.inject_into, value),
        "downloadURL" => set_once(&mut meta.download_url, value),
        "updateURL" => set_once(&mut meta.update_url, value),
        "noframes" => meta.noframes = true,
        "unwrap" => meta.unwrap = true,
        "resource" => {
            let mut parts = value.split_whitespace();
            if let (Some(name), Some(url)) = (parts.next(), parts.next()) {
                meta.resources
                    .entry(name.to_string())
                    .or_insert_with(|| url.to_string());
            }
        }
        _ => {
            let list = match key {
                "grant" => &mut meta.grant,
                "match" => &mut meta.matches,
                "include" => &mut meta.include,
                "exclude" => &mut meta.exclude,
                "exclude-match" => &mut meta.exclude_match,
                "require" => &mut meta.require,
                _ => return,
            };
            if !value.is_empty() {
                list.push(value.to_string());
            }
        }
    }
}
