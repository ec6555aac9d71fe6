//! Core type definitions for Scriptward
//!
//! A script record is stored as one JSON object with four groups:
//! `props` (identity and ordering), `config` (user toggles), `meta` (parsed
//! from the metadata block) and `custom` (user overrides of `meta`).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// =============================================================================
// Timing phase
// =============================================================================

/// Document lifecycle phase at which a script runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunAt {
    Start,
    Body,
    #[default]
    End,
    Idle,
}

impl RunAt {
    /// Parse a `@run-at` value such as `document-start`.
    pub fn from_meta(value: &str) -> Option<Self> {
        match value.strip_prefix("document-")? {
            "start" => Some(Self::Start),
            "body" => Some(Self::Body),
            "end" => Some(Self::End),
            "idle" => Some(Self::Idle),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Body => "body",
            Self::End => "end",
            Self::Idle => "idle",
        }
    }

    /// Start and body scripts are resolved eagerly; end and idle are delayed.
    #[inline]
    pub fn is_early(self) -> bool {
        matches!(self, Self::Start | Self::Body)
    }
}

// =============================================================================
// Execution realms
// =============================================================================

/// Script execution context inside a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Realm {
    /// The page's own JavaScript context
    Page,
    /// The isolated content-script context
    Content,
}

/// Desired realm as declared by `@inject-into`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InjectInto {
    #[default]
    Auto,
    Page,
    Content,
}

impl InjectInto {
    /// Parse a known `@inject-into` value.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "auto" => Some(Self::Auto),
            "page" => Some(Self::Page),
            "content" => Some(Self::Content),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Page => "page",
            Self::Content => "content",
        }
    }

    /// Realms to try, in order of preference.
    pub fn realms(self) -> &'static [Realm] {
        match self {
            Self::Auto => &[Realm::Page, Realm::Content],
            Self::Page => &[Realm::Page],
            Self::Content => &[Realm::Content],
        }
    }

    /// Pick the first realm available in the current frame.
    ///
    /// The content realm always exists; the page realm only after a
    /// successful page handshake.
    pub fn resolve(self, page_available: bool) -> Option<Realm> {
        self.realms()
            .iter()
            .copied()
            .find(|realm| *realm == Realm::Content || page_available)
    }
}

// =============================================================================
// Record groups
// =============================================================================

/// Identity and ordering of a stored script.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Props {
    pub id: u64,
    pub uri: String,
    pub position: i32,
    pub uuid: String,
    /// Milliseconds since the Unix epoch
    pub last_modified: u64,
    pub last_updated: u64,
}

/// User toggles. Stored as 0/1 integers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    #[serde(with = "flag")]
    pub enabled: bool,
    #[serde(with = "flag")]
    pub removed: bool,
    #[serde(with = "flag")]
    pub should_update: bool,
    /// Treat `@include` rules shaped like `scheme://host/path` as `@match` rules
    #[serde(with = "flag")]
    pub safe_include: bool,
}

/// Values parsed from the script's metadata block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Meta {
    pub name: Option<String>,
    pub namespace: Option<String>,
    pub version: Option<String>,
    pub description: Option<String>,
    pub homepage: Option<String>,
    #[serde(rename = "homepageURL")]
    pub homepage_url: Option<String>,
    pub icon: Option<String>,
    pub run_at: Option<String>,
    pub inject_into: Option<String>,
    pub grant: Vec<String>,
    #[serde(rename = "match")]
    pub matches: Vec<String>,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub exclude_match: Vec<String>,
    pub require: Vec<String>,
    pub resources: BTreeMap<String, String>,
    #[serde(rename = "downloadURL")]
    pub download_url: Option<String>,
    #[serde(rename = "updateURL")]
    pub update_url: Option<String>,
    pub noframes: bool,
    pub unwrap: bool,
}

impl Meta {
    /// Drop repeated `@grant` values, keeping the first occurrence.
    pub fn dedup_grants(&mut self) {
        let mut seen = std::collections::HashSet::new();
        self.grant.retain(|grant| seen.insert(grant.clone()));
    }

    /// True when the script declared no grants or only `@grant none`.
    pub fn is_grant_none(&self) -> bool {
        self.grant.is_empty() || (self.grant.len() == 1 && self.grant[0] == "none")
    }

    /// True when the script uses the value storage API.
    pub fn uses_values(&self) -> bool {
        self.grant.iter().any(|grant| {
            let name = grant
                .strip_prefix("GM_")
                .or_else(|| grant.strip_prefix("GM."));
            matches!(name, Some("getValue" | "setValue" | "deleteValue" | "listValues"))
        })
    }
}

fn default_true() -> bool {
    true
}

/// User overrides of [`Meta`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Custom {
    pub name: Option<String>,
    pub run_at: Option<String>,
    pub inject_into: Option<String>,
    pub noframes: Option<bool>,
    #[serde(rename = "downloadURL")]
    pub download_url: Option<String>,
    #[serde(rename = "updateURL")]
    pub update_url: Option<String>,
    #[serde(rename = "homepageURL")]
    pub homepage_url: Option<String>,
    #[serde(rename = "lastInstallURL")]
    pub last_install_url: Option<String>,
    #[serde(rename = "match")]
    pub matches: Vec<String>,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub exclude_match: Vec<String>,
    /// Whether `meta.match` is consulted in addition to `custom.match`
    #[serde(default = "default_true")]
    pub orig_match: bool,
    #[serde(default = "default_true")]
    pub orig_include: bool,
    #[serde(default = "default_true")]
    pub orig_exclude: bool,
    #[serde(default = "default_true")]
    pub orig_exclude_match: bool,
    /// Declared dependency URL -> absolute URL
    pub path_map: BTreeMap<String, String>,
}

impl Default for Custom {
    fn default() -> Self {
        Self {
            name: None,
            run_at: None,
            inject_into: None,
            noframes: None,
            download_url: None,
            update_url: None,
            homepage_url: None,
            last_install_url: None,
            matches: Vec::new(),
            include: Vec::new(),
            exclude: Vec::new(),
            exclude_match: Vec::new(),
            orig_match: true,
            orig_include: true,
            orig_exclude: true,
            orig_exclude_match: true,
            path_map: BTreeMap::new(),
        }
    }
}

// =============================================================================
// Script Record
// =============================================================================

/// A stored userscript.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptRecord {
    pub props: Props,
    pub config: Config,
    pub meta: Meta,
    pub custom: Custom,
}

impl ScriptRecord {
    /// Create an enabled, update-checked record for freshly parsed metadata.
    pub fn new(meta: Meta) -> Self {
        Self {
            props: Props::default(),
            config: Config {
                enabled: true,
                should_update: true,
                ..Config::default()
            },
            meta,
            custom: Custom::default(),
        }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.props.id
    }

    /// Display name: custom name, then `@name`, then `#<id>`.
    pub fn name(&self) -> String {
        non_empty(&self.custom.name)
            .or_else(|| non_empty(&self.meta.name))
            .map(str::to_string)
            .unwrap_or_else(|| format!("#{}", self.props.id))
    }

    /// Unique identity derived from namespace and name.
    pub fn name_uri(&self) -> String {
        let namespace = self.meta.namespace.as_deref().unwrap_or("");
        let name = self.meta.name.as_deref().unwrap_or("");
        let mut uri = format!("{}:{}:", js_escape(namespace), js_escape(name));
        if namespace.is_empty() && name.is_empty() && self.props.id != 0 {
            uri.push_str(&self.props.id.to_string());
        }
        uri
    }

    /// Effective timing phase; unknown values fall back to `end`.
    pub fn run_at(&self) -> RunAt {
        non_empty(&self.custom.run_at)
            .or_else(|| non_empty(&self.meta.run_at))
            .and_then(RunAt::from_meta)
            .unwrap_or_default()
    }

    /// Effective desired realm; unknown values fall back to `default`.
    pub fn inject_into(&self, default: InjectInto) -> InjectInto {
        non_empty(&self.custom.inject_into)
            .or_else(|| non_empty(&self.meta.inject_into))
            .and_then(InjectInto::parse)
            .unwrap_or(default)
    }

    /// True when the script must not run in subframes.
    pub fn noframes(&self) -> bool {
        self.custom.noframes.unwrap_or(self.meta.noframes)
    }

    /// Resolve a declared dependency URL through the path map.
    pub fn resolve_url<'a>(&'a self, url: &'a str) -> &'a str {
        self.custom.path_map.get(url).map(String::as_str).unwrap_or(url)
    }

    /// Homepage shown for the script, if any.
    pub fn home_url(&self) -> Option<&str> {
        non_empty(&self.custom.homepage_url)
            .or_else(|| non_empty(&self.meta.homepage_url))
            .or_else(|| non_empty(&self.meta.homepage))
    }

    /// URLs used for update checks; the first one downloads the code.
    ///
    /// Empty when updates are disabled for this script.
    pub fn update_urls(&self) -> Vec<String> {
        if !self.config.should_update {
            return Vec::new();
        }
        let download = non_empty(&self.custom.download_url)
            .or_else(|| non_empty(&self.meta.download_url))
            .or_else(|| non_empty(&self.custom.last_install_url));
        let update = non_empty(&self.custom.update_url)
            .or_else(|| non_empty(&self.meta.update_url))
            .or(download);
        let mut urls: Vec<String> = Vec::with_capacity(2);
        for url in [download, update].into_iter().flatten() {
            if crate::url::is_remote(url) && !urls.iter().any(|u| u == url) {
                urls.push(url.to_string());
            }
        }
        urls
    }

    /// Stable URL naming the script in stack traces.
    pub fn pretty_url(&self) -> String {
        format!("scriptward:///{}.user.js#{}", js_escape(&self.name()), self.props.id)
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.is_empty())
}

/// Percent-escape like the legacy `escape()` used for stored uris.
///
/// ASCII letters, digits and `@*_+-./` pass through; other ASCII becomes
/// `%XX` and everything else `%uXXXX` per UTF-16 unit.
pub fn js_escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut units = [0u16; 2];
    for ch in input.chars() {
        if ch.is_ascii_alphanumeric() || "@*_+-./".contains(ch) {
            out.push(ch);
        } else if ch.is_ascii() {
            out.push_str(&format!("%{:02X}", ch as u32));
        } else {
            for unit in ch.encode_utf16(&mut units).iter() {
                out.push_str(&format!("%u{:04X}", unit));
            }
        }
    }
    out
}

// =============================================================================
// 0/1 flag encoding
// =============================================================================

mod flag {
    use serde::{Deserialize, Deserializer, Serializer};
    use serde_json::Value;

    pub fn serialize<S: Serializer>(value: &bool, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(u8::from(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
        Ok(match Value::deserialize(deserializer)? {
            Value::Bool(b) => b,
            Value::Number(n) => n.as_f64().map_or(false, |f| f != 0.0),
            Value::String(s) => !s.is_empty() && s != "0",
            _ => false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_at_fallback() {
        let mut script = ScriptRecord::default();
        assert_eq!(script.run_at(), RunAt::End);
        script.meta.run_at = Some("document-start".into());
        assert_eq!(script.run_at(), RunAt::Start);
        script.custom.run_at = Some("document-idle".into());
        assert_eq!(script.run_at(), RunAt::Idle);
        script.custom.run_at = Some("bogus".into());
        assert_eq!(script.run_at(), RunAt::End);
    }

    #[test]
    fn test_inject_into_resolve() {
        assert_eq!(InjectInto::Auto.resolve(true), Some(Realm::Page));
        assert_eq!(InjectInto::Auto.resolve(false), Some(Realm::Content));
        assert_eq!(InjectInto::Page.resolve(false), None);
        assert_eq!(InjectInto::Content.resolve(true), Some(Realm::Content));
    }

    #[test]
    fn test_name_uri() {
        let mut script = ScriptRecord::default();
        script.meta.name = Some("My Script".into());
        script.meta.namespace = Some("https://example.com".into());
        assert_eq!(script.name_uri(), "https%3A//example.com:My%20Script:");

        let mut anon = ScriptRecord::default();
        anon.props.id = 7;
        assert_eq!(anon.name_uri(), "::7");
    }

    #[test]
    fn test_config_flags_from_ints() {
        let config: Config =
            serde_json::from_str(r#"{"enabled":1,"removed":0,"shouldUpdate":true}"#).unwrap();
        assert!(config.enabled);
        assert!(!config.removed);
        assert!(config.should_update);
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["enabled"], 1);
    }

    #[test]
    fn test_custom_defaults_backfilled() {
        let custom: Custom = serde_json::from_str(r#"{"match":["*://a.com/*"]}"#).unwrap();
        assert!(custom.orig_match);
        assert!(custom.orig_exclude_match);
        assert_eq!(custom.matches, vec!["*://a.com/*".to_string()]);
    }

    #[test]
    fn test_update_urls() {
        let mut script = ScriptRecord::new(Meta::default());
        assert!(script.update_urls().is_empty());
        script.custom.last_install_url = Some("https://x.org/a.user.js".into());
        script.meta.update_url = Some("https://x.org/a.meta.js".into());
        assert_eq!(
            script.update_urls(),
            vec!["https://x.org/a.user.js".to_string(), "https://x.org/a.meta.js".to_string()]
        );
        script.config.should_update = false;
        assert!(script.update_urls().is_empty());
    }

    #[test]
    fn test_grants() {
        let mut meta = Meta::default();
        assert!(meta.is_grant_none());
        meta.grant = vec!["GM_getValue".into(), "GM.xmlHttpRequest".into(), "GM_getValue".into()];
        meta.dedup_grants();
        assert_eq!(meta.grant.len(), 2);
        assert!(meta.uses_values());
        assert!(!meta.is_grant_none());
    }
}
