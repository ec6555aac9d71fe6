//! WebAssembly bindings for Scriptward
//!
//! Exposes URL matching and the global blacklist to the extension's
//! JavaScript side.

use std::sync::RwLock;

use wasm_bindgen::prelude::*;

use sw_core::{matcher, psl, Blacklist, ScriptRecord};

static BLACKLIST: RwLock<Option<Blacklist>> = RwLock::new(None);

/// Load the Public Suffix List. Until then `.tld` rules match literally.
#[wasm_bindgen]
pub fn init_psl(list_text: &str) -> Result<(), JsValue> {
    psl::init_psl_from_text(list_text)
        .map_err(|e| JsValue::from_str(&format!("Failed to load public suffix list: {}", e)))
}

#[wasm_bindgen]
pub fn is_psl_initialized() -> bool {
    psl::is_psl_initialized()
}

/// Replace the global blacklist. Returns the number of rules.
#[wasm_bindgen]
pub fn set_blacklist(text: &str) -> u32 {
    let blacklist = Blacklist::new(text);
    let count = blacklist.rule_count() as u32;
    *BLACKLIST.write().unwrap_or_else(|e| e.into_inner()) = Some(blacklist);
    count
}

/// Text of the blacklist rule rejecting `url`, if any.
#[wasm_bindgen]
pub fn test_blacklist(url: &str) -> Option<String> {
    BLACKLIST
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .as_ref()
        .and_then(|blacklist| blacklist.test(url))
}

#[wasm_bindgen]
pub fn get_blacklist_info() -> JsValue {
    let result = js_sys::Object::new();
    let guard = BLACKLIST.read().unwrap_or_else(|e| e.into_inner());
    match guard.as_ref() {
        Some(blacklist) => {
            let _ = js_sys::Reflect::set(&result, &"rules".into(), &JsValue::from(blacklist.rule_count() as u32));
            let _ = js_sys::Reflect::set(&result, &"cacheSize".into(), &JsValue::from(blacklist.cache_size() as u32));
            let _ = js_sys::Reflect::set(&result, &"initialized".into(), &JsValue::from(true));
        }
        None => {
            let _ = js_sys::Reflect::set(&result, &"initialized".into(), &JsValue::from(false));
        }
    }
    result.into()
}

/// Whether a stored script record (as JSON) applies to `url`.
#[wasm_bindgen]
pub fn test_script(url: &str, script_json: &str) -> Result<bool, JsValue> {
    let script: ScriptRecord = serde_json::from_str(script_json)
        .map_err(|e| JsValue::from_str(&format!("Invalid script record: {}", e)))?;
    Ok(matcher::test_script(url, &script))
}

/// Test a single `@match` rule.
#[wasm_bindgen]
pub fn matches_rule(url: &str, rule: &str) -> bool {
    matcher::matches_rule(url, rule)
}

/// Test a single `@include`/`@exclude` rule.
#[wasm_bindgen]
pub fn matches_glob(url: &str, rule: &str) -> bool {
    matcher::matches_glob(url, rule)
}

/// Parse a userscript's metadata block into a plain object.
#[wasm_bindgen]
pub fn parse_meta(code: &str) -> Result<JsValue, JsValue> {
    let meta = sw_core::parse_meta(code).map_err(|e| JsValue::from_str(&e.to_string()))?;
    let json = serde_json::to_string(&meta)
        .map_err(|e| JsValue::from_str(&format!("Failed to serialize metadata: {}", e)))?;
    js_sys::JSON::parse(&json)
}

/// Drop compiled rules, e.g. after bulk script updates.
#[wasm_bindgen]
pub fn clear_caches() {
    matcher::clear_matcher_cache();
    web_sys::console::debug_1(&"scriptward: matcher cache cleared".into());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blacklist_roundtrip() {
        assert_eq!(set_blacklist("# header\nbad.test\n@match *://good.test/*"), 2);
        assert_eq!(test_blacklist("https://bad.test/x").as_deref(), Some("bad.test"));
        assert_eq!(test_blacklist("https://good.test/x"), None);
    }

    #[test]
    fn test_script_record_json() {
        let json = r#"{"meta":{"name":"x","match":["*://*.site.test/*"]},"custom":{},"config":{"enabled":1}}"#;
        assert!(test_script("https://www.site.test/", json).unwrap());
        assert!(!test_script("https://other.test/", json).unwrap());
        assert!(matches_rule("https://site.test/a", "*://site.test/*"));
        assert!(matches_glob("https://site.test/a", "*site.test*"));
    }
}
