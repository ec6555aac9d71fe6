//! Script preparation
//!
//! Turns a script record plus its environment into the code and metadata a
//! frame receives. Libraries come first, each terminated so that a trailing
//! line comment cannot swallow what follows, then the script body. Unless the
//! script is `@unwrap`, everything sits in a function assigned to a random
//! window property, which the frame calls with the GM API it granted.

use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};

use sw_core::meta::metablock_range;
use sw_core::{InjectInto, RunAt, ScriptRecord};

use crate::env::ScriptEnv;

/// Globals a `@grant none` script receives as parameters.
const GRANT_NONE_VARS: &str = "{GM,GM_info,unsafeWindow,cloneInto,createObjectIn,exportFunction}";

/// Metadata keys renamed to their plural form in the frame.
const PLURAL_KEYS: &[(&str, &str)] = &[
    ("match", "matches"),
    ("include", "includes"),
    ("exclude", "excludes"),
    ("excludeMatch", "excludeMatches"),
];

/// Metadata keys that are always strings in the frame.
const ENSURED_KEYS: &[&str] = &["description", "name", "namespace", "runAt", "version"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GmInfo {
    pub script_will_update: bool,
    pub uuid: String,
}

/// Per-frame random identifiers of a script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScriptKeys {
    /// Name of the wrapper function
    pub data: String,
    /// Window property holding the wrapper
    pub win: String,
}

/// A script ready for delivery.
///
/// `code` and `meta_str` are filled in by realm triage: page-realm scripts
/// carry their code in the payload, content-realm scripts carry the text of
/// their metadata block instead.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreparedScript {
    pub id: u64,
    pub display_name: String,
    pub gmi: GmInfo,
    pub key: ScriptKeys,
    pub meta: Map<String, Value>,
    pub path_map: BTreeMap<String, String>,
    pub run_at: RunAt,
    pub inject_into: InjectInto,
    pub code: String,
    pub meta_str: String,
    pub val: Option<Value>,
    pub unwrap: bool,
    #[serde(skip)]
    pub(crate) wrapped: Arc<str>,
    #[serde(skip)]
    pub(crate) meta_range: Option<Range<usize>>,
}

impl PreparedScript {
    /// Full executable text.
    pub fn wrapped(&self) -> &str {
        &self.wrapped
    }

    /// Text of the metadata block inside the executable text.
    pub fn metablock(&self) -> &str {
        self.meta_range
            .clone()
            .and_then(|range| self.wrapped.get(range))
            .unwrap_or("")
    }
}

/// Random identifier usable as a JavaScript name.
pub fn unique_key() -> String {
    format!("SW{}", uuid::Uuid::new_v4().simple())
}

/// True when `text` ends with a newline followed only by other whitespace.
fn ends_with_newline(text: &str) -> bool {
    text.trim_end_matches(|c: char| c.is_whitespace() && c != '\n')
        .ends_with('\n')
}

/// Build the executable text of a script.
///
/// Returns the text and the byte offset of the script body inside it.
pub fn wrap_code(
    script: &ScriptRecord,
    code: &str,
    require: &BTreeMap<&str, &str>,
    data_key: &str,
    win_key: &str,
) -> (String, usize) {
    let wrap = !script.meta.unwrap;
    let grant_none = script.meta.is_grant_none();
    let mut out = String::with_capacity(code.len() + 256);

    if wrap {
        out.push_str(&format!("window.{win_key}=function {data_key}("));
        out.push_str(if grant_none { GRANT_NONE_VARS } else { "GM" });
        out.push_str("){");
        if !grant_none {
            out.push_str("with(this)with(c)delete c,");
        }
        out.push_str("((define,module,exports)=>{");
    }

    let mut has_reqs = false;
    for url in &script.meta.require {
        let full = script.resolve_url(url);
        let Some(text) = require.get(full) else {
            continue;
        };
        if text.trim().is_empty() {
            continue;
        }
        out.push_str(text);
        out.push_str(if ends_with_newline(text) { ";" } else { "\n;" });
        has_reqs = true;
    }

    if has_reqs && wrap {
        out.push_str("(()=>{");
    }
    let code_index = out.len();
    out.push_str(code);
    if !ends_with_newline(code) {
        out.push('\n');
    }
    if has_reqs && wrap {
        out.push_str("})()");
    }
    if wrap {
        out.push_str("})()}");
    }
    out.push_str("\n//# sourceURL=");
    out.push_str(&script.pretty_url());
    (out, code_index)
}

/// Metadata as exposed through `GM_info.script`.
pub fn meta_copy(script: &ScriptRecord) -> Map<String, Value> {
    let mut map = match serde_json::to_value(&script.meta) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    };
    for (from, to) in PLURAL_KEYS {
        if let Some(value) = map.remove(*from) {
            map.insert(to.to_string(), value);
        }
    }
    for key in ENSURED_KEYS {
        if !matches!(map.get(*key), Some(Value::String(_))) {
            map.insert(key.to_string(), Value::String(String::new()));
        }
    }
    if matches!(map.get("homepageURL"), None | Some(Value::Null)) {
        let homepage = map.get("homepage").cloned().unwrap_or(Value::Null);
        map.insert("homepageURL".to_string(), homepage);
    }
    map
}

/// Prepare one runnable script of `env`.
///
/// Returns `None` when the environment holds no code for it.
pub fn prepare_script(
    script: &ScriptRecord,
    env: &ScriptEnv,
    default_inject_into: InjectInto,
) -> Option<PreparedScript> {
    let id = script.id();
    let code = env.code.get(&id)?;
    let data_key = unique_key();
    let win_key = unique_key();
    let require: BTreeMap<&str, &str> = env
        .require
        .iter()
        .map(|(url, text)| (url.as_str(), text.as_str()))
        .collect();
    let (wrapped, code_index) = wrap_code(script, code, &require, &data_key, &win_key);
    let meta_range = metablock_range(code)
        .map(|range| range.start + code_index..range.end + code_index);

    Some(PreparedScript {
        id,
        display_name: script.name(),
        gmi: GmInfo {
            script_will_update: script.config.should_update,
            uuid: script.props.uuid.clone(),
        },
        key: ScriptKeys {
            data: data_key,
            win: win_key,
        },
        meta: meta_copy(script),
        path_map: script.custom.path_map.clone(),
        run_at: script.run_at(),
        inject_into: script.inject_into(default_inject_into),
        code: String::new(),
        meta_str: String::new(),
        val: env.values.get(&id).cloned(),
        unwrap: script.meta.unwrap,
        wrapped: wrapped.into(),
        meta_range,
    })
}

/// Prepare every runnable script of `env`, in store order.
pub fn prepare_scripts(env: &ScriptEnv, default_inject_into: InjectInto) -> Vec<PreparedScript> {
    env.scripts
        .iter()
        .filter_map(|script| prepare_script(script, env, default_inject_into))
        .collect()
}

#[cfg(test)]
mod tests {
    use sw_core::{parse_meta, Meta};

    use super::*;

    fn record(code: &str, id: u64) -> ScriptRecord {
        let mut script = ScriptRecord::new(parse_meta(code).unwrap());
        script.props.id = id;
        script
    }

    #[test]
    fn test_grant_none_wrapper() {
        let script = record("// ==UserScript==\n// @name A\n// ==/UserScript==\n", 1);
        let (text, index) = wrap_code(&script, "go()", &BTreeMap::new(), "d1", "w1");
        assert_eq!(
            text,
            format!(
                "window.w1=function d1({GRANT_NONE_VARS}){{((define,module,exports)=>{{go()\n}})()}}\n//# sourceURL=scriptward:///A.user.js#1"
            )
        );
        assert_eq!(&text[index..index + 4], "go()");
    }

    #[test]
    fn test_granted_wrapper_with_requires() {
        let mut script = record(
            "// ==UserScript==\n// @name B\n// @grant GM_setValue\n// @require lib.js\n// @require https://x.test/b.js\n// ==/UserScript==\n",
            2,
        );
        script
            .custom
            .path_map
            .insert("lib.js".into(), "https://x.test/lib.js".into());
        let require = BTreeMap::from([
            ("https://x.test/lib.js", "var a=1 // trailing"),
            ("https://x.test/b.js", "var b=2\n"),
        ]);
        let (text, _) = wrap_code(&script, "main()\n", &require, "d", "w");
        assert!(text.starts_with("window.w=function d(GM){with(this)with(c)delete c,((define,module,exports)=>{"));
        assert!(text.contains("var a=1 // trailing\n;var b=2\n;(()=>{main()\n})()})()}"));
    }

    #[test]
    fn test_unwrap_has_no_wrapper() {
        let script = record("// ==UserScript==\n// @name C\n// @unwrap\n// ==/UserScript==\n", 3);
        let require = BTreeMap::from([("https://x.test/blank.js", "  \n")]);
        let (text, index) = wrap_code(&script, "c()", &require, "d", "w");
        assert_eq!(index, 0);
        assert_eq!(text, "c()\n\n//# sourceURL=scriptward:///C.user.js#3");
    }

    #[test]
    fn test_meta_copy_shape() {
        let script = ScriptRecord::new(Meta {
            name: Some("D".into()),
            homepage: Some("https://home.test".into()),
            matches: vec!["*://*/*".into()],
            exclude_match: vec!["*://a.test/*".into()],
            ..Meta::default()
        });
        let copy = meta_copy(&script);
        assert_eq!(copy.get("matches"), Some(&serde_json::json!(["*://*/*"])));
        assert_eq!(copy.get("excludeMatches"), Some(&serde_json::json!(["*://a.test/*"])));
        assert!(copy.get("match").is_none());
        assert_eq!(copy.get("version"), Some(&serde_json::json!("")));
        assert_eq!(copy.get("runAt"), Some(&serde_json::json!("")));
        assert_eq!(copy.get("homepageURL"), Some(&serde_json::json!("https://home.test")));
    }

    #[test]
    fn test_prepare_script_locates_metablock() {
        let code = "// ==UserScript==\n// @name E\n// @grant none\n// ==/UserScript==\nrun()";
        let mut script = record(code, 5);
        script.props.uuid = "u-5".into();
        let mut env = ScriptEnv::default();
        env.code.insert(5, code.to_string());

        let prepared = prepare_script(&script, &env, InjectInto::Content).unwrap();
        assert_eq!(prepared.display_name, "E");
        assert_eq!(prepared.inject_into, InjectInto::Content);
        assert_eq!(prepared.gmi.uuid, "u-5");
        assert!(prepared.metablock().starts_with("// ==UserScript=="));
        assert!(prepared.metablock().ends_with("// ==/UserScript=="));
        assert!(prepared.wrapped().contains(&format!("function {}(", prepared.key.data)));
        assert_ne!(prepared.key.data, prepared.key.win);
        assert!(prepared.val.is_none());
        assert!(prepared.gmi.script_will_update);

        script.config.should_update = false;
        let pinned = prepare_script(&script, &env, InjectInto::Content).unwrap();
        assert!(!pinned.gmi.script_will_update);

        let missing = record(code, 6);
        assert!(prepare_script(&missing, &env, InjectInto::Auto).is_none());
    }
}
