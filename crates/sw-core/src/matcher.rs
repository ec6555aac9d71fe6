//! Script applicability matching
//!
//! Two rule dialects exist:
//!
//! - `@match` / `@exclude-match`: `scheme://host/path` patterns and `<all_urls>`
//! - `@include` / `@exclude`: whole-URL globs or `/regex/` literals
//!
//! Every rule string is compiled once into a [`RuleMatcher`] and shared
//! through a process-wide LRU cache. Recompiling a rule yields an equivalent
//! matcher, so concurrent misses only cost time.

use std::sync::{Arc, Mutex};

use regex::{Regex, RegexBuilder};

use crate::cache::LruCache;
use crate::psl::{is_psl_initialized, is_public_suffix};
use crate::types::ScriptRecord;
use crate::url::split_match_parts;

const MATCHER_CACHE_CAPACITY: usize = 4096;

/// Any run of dot-separated labels standing in for `.tld`.
const RE_STR_TLD: &str = r"((?:\.[-\w]+)+)";
/// Optional subdomain prefix for `*.` hosts.
const RE_STR_ANY: &str = r"(?:.*?\.)?";

static MATCHER_CACHE: Mutex<Option<LruCache<Arc<RuleMatcher>>>> = Mutex::new(None);

// =============================================================================
// Compiled rules
// =============================================================================

/// A compiled rule.
#[derive(Debug)]
pub enum RuleMatcher {
    /// `<all_urls>`
    Always,
    /// Invalid rule; fails closed
    Never,
    /// `scheme://host/path`
    Match(MatchPattern),
    /// Anchored, case-insensitive whole-URL glob or regex literal
    Regex(Regex),
    /// Glob containing `.tld/`, validated against the suffix list
    TldGlob(Regex),
}

/// The three parts of a compiled `@match` rule.
#[derive(Debug)]
pub struct MatchPattern {
    scheme: String,
    host: HostPattern,
    path: Regex,
}

#[derive(Debug)]
enum HostPattern {
    Any,
    Pattern {
        /// Lowercased rule for the exact-match fast path
        exact: String,
        re: Regex,
        /// Last capture group holds the `.tld` expansion
        has_tld: bool,
    },
}

impl RuleMatcher {
    /// Compile a `@match` rule.
    pub fn compile_match(rule: &str) -> Self {
        if rule == "<all_urls>" {
            return Self::Always;
        }
        let Some((scheme, host, path)) = split_match_parts(rule) else {
            return Self::Never;
        };
        match (compile_host(host), compile_path(path)) {
            (Some(host), Some(path)) => Self::Match(MatchPattern {
                scheme: scheme.to_string(),
                host,
                path,
            }),
            _ => Self::Never,
        }
    }

    /// Compile an `@include`/`@exclude` rule.
    ///
    /// `/.../` is a case-insensitive regex. A bare host such as `example.com`
    /// (no slash, no wildcard) means `*://example.com/*`. Anything else is a
    /// case-insensitive glob over the whole URL.
    pub fn compile_glob(rule: &str) -> Self {
        if rule.len() > 1 && rule.starts_with('/') && rule.ends_with('/') {
            return RegexBuilder::new(&rule[1..rule.len() - 1])
                .case_insensitive(true)
                .build()
                .map_or(Self::Never, Self::Regex);
        }
        if is_bare_host(rule) {
            return Self::compile_match(&format!("*://{rule}/*"));
        }
        let re_str = glob_to_regex(&rule.to_lowercase());
        if is_psl_initialized() && rule.contains(".tld/") {
            let re_tld = re_str.replacen(r"\.tld/", &format!("{RE_STR_TLD}/"), 1);
            return Regex::new(&re_tld).map_or(Self::Never, Self::TldGlob);
        }
        RegexBuilder::new(&format!("^{re_str}$"))
            .case_insensitive(true)
            .build()
            .map_or(Self::Never, Self::Regex)
    }

    /// Test a URL against this rule.
    pub fn test(&self, url: &str) -> bool {
        match self {
            Self::Always => true,
            Self::Never => false,
            Self::Regex(re) => re.is_match(url),
            Self::TldGlob(re) => {
                let lower = url.to_lowercase();
                re.captures(&lower)
                    .and_then(|caps| caps.get(1))
                    .map_or(false, |m| is_public_suffix(&m.as_str()[1..]))
            }
            Self::Match(pattern) => pattern.test(url),
        }
    }

    /// True for rules that can never match anything.
    pub fn is_never(&self) -> bool {
        matches!(self, Self::Never)
    }
}

impl MatchPattern {
    fn test(&self, url: &str) -> bool {
        let Some((scheme, host, path)) = split_match_parts(url) else {
            return false;
        };
        match_scheme(&self.scheme, scheme) && self.host.test(host) && self.path.is_match(path)
    }
}

impl HostPattern {
    fn test(&self, host: &str) -> bool {
        let Self::Pattern { exact, re, has_tld } = self else {
            return true;
        };
        let host = host.to_lowercase();
        if *exact == host {
            return true;
        }
        let Some(caps) = re.captures(&host) else {
            return false;
        };
        if !*has_tld {
            return true;
        }
        caps.get(1)
            .map_or(true, |m| is_public_suffix(&m.as_str()[1..]))
    }
}

/// `*` and `http*` accept http and https; anything else must be equal.
fn match_scheme(rule: &str, scheme: &str) -> bool {
    if rule == scheme {
        return true;
    }
    (rule == "*" || rule == "http*")
        && (scheme.eq_ignore_ascii_case("http") || scheme.eq_ignore_ascii_case("https"))
}

fn compile_host(rule: &str) -> Option<HostPattern> {
    if rule == "*" {
        return Some(HostPattern::Any);
    }
    let exact = rule.to_lowercase();
    let mut base = exact.as_str();
    let mut prefix = "";
    let mut suffix = "";
    if rule.starts_with("*.") {
        base = &base[2..];
        prefix = RE_STR_ANY;
    }
    let has_tld = is_psl_initialized() && rule.ends_with(".tld") && base.len() >= 4;
    if has_tld {
        base = &base[..base.len() - 4];
        suffix = RE_STR_TLD;
    }
    let re = Regex::new(&format!("^{prefix}{}{suffix}$", glob_to_regex(base))).ok()?;
    Some(HostPattern::Pattern { exact, re, has_tld })
}

/// Paths end at `?`, `#` or the end of the URL. A rule with its own query
/// runs up to `#` only, and a rule containing `#` is searched anywhere in
/// the path.
fn compile_path(rule: &str) -> Option<Regex> {
    let re_str = glob_to_regex(rule);
    let anchored = if rule.contains('#') {
        re_str
    } else if rule.contains('?') {
        format!("^{re_str}(?:#|$)")
    } else {
        format!("^{re_str}(?:[?#]|$)")
    };
    Regex::new(&anchored).ok()
}

/// Escape regex syntax and turn `*` into a lazy wildcard.
fn glob_to_regex(glob: &str) -> String {
    let mut out = String::with_capacity(glob.len() * 2);
    let mut buf = [0u8; 4];
    for ch in glob.chars() {
        if ch == '*' {
            out.push_str(".*?");
        } else {
            out.push_str(&regex::escape(ch.encode_utf8(&mut buf)));
        }
    }
    out
}

fn is_bare_host(rule: &str) -> bool {
    !rule.is_empty() && !rule.contains('/') && !rule.contains('*') && !rule.contains(':')
}

// =============================================================================
// Matcher cache
// =============================================================================

#[derive(Clone, Copy, PartialEq, Eq)]
enum RuleKind {
    Match,
    Glob,
}

fn cached_matcher(rule: &str, kind: RuleKind) -> Arc<RuleMatcher> {
    let key = match kind {
        RuleKind::Match => format!("match:{rule}"),
        RuleKind::Glob => format!("re:{rule}"),
    };
    {
        let mut guard = MATCHER_CACHE.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(hit) = guard.as_mut().and_then(|cache| cache.get(&key)) {
            return hit;
        }
    }
    let matcher = Arc::new(match kind {
        RuleKind::Match => RuleMatcher::compile_match(rule),
        RuleKind::Glob => RuleMatcher::compile_glob(rule),
    });
    let mut guard = MATCHER_CACHE.lock().unwrap_or_else(|e| e.into_inner());
    guard
        .get_or_insert_with(|| LruCache::new(MATCHER_CACHE_CAPACITY))
        .insert(key, Arc::clone(&matcher));
    matcher
}

/// Drop all compiled matchers.
pub fn clear_matcher_cache() {
    if let Some(cache) = MATCHER_CACHE.lock().unwrap_or_else(|e| e.into_inner()).as_mut() {
        cache.clear();
    }
}

/// Compile (or fetch) the matcher for a `@match` rule.
pub fn match_rule_matcher(rule: &str) -> Arc<RuleMatcher> {
    cached_matcher(rule, RuleKind::Match)
}

/// Compile (or fetch) the matcher for an `@include`/`@exclude` rule.
pub fn glob_rule_matcher(rule: &str) -> Arc<RuleMatcher> {
    cached_matcher(rule, RuleKind::Glob)
}

// =============================================================================
// Script testing
// =============================================================================

/// Test a URL against one `@match` rule.
pub fn matches_rule(url: &str, rule: &str) -> bool {
    match_rule_matcher(rule).test(url)
}

/// Test a URL against one `@include` rule.
pub fn matches_glob(url: &str, rule: &str) -> bool {
    glob_rule_matcher(rule).test(url)
}

fn test_match_rules(url: &str, rules: &[String]) -> bool {
    rules.iter().any(|rule| matches_rule(url, rule))
}

fn test_glob_rules(url: &str, rules: &[String], safe_include: bool) -> bool {
    rules.iter().any(|rule| {
        if safe_include && split_match_parts(rule).is_some() {
            matches_rule(url, rule)
        } else {
            matches_glob(url, rule)
        }
    })
}

/// Decide whether a script applies to a URL.
///
/// A script without any `@match`/`@include` applies everywhere. Otherwise one
/// of them must match. Any `@exclude-match`/`@exclude` hit vetoes.
pub fn test_script(url: &str, script: &ScriptRecord) -> bool {
    let custom = &script.custom;
    let meta = &script.meta;
    let safe = script.config.safe_include;

    let mut ok = custom.matches.is_empty()
        && !(custom.orig_match && !meta.matches.is_empty())
        && custom.include.is_empty()
        && !(custom.orig_include && !meta.include.is_empty());

    ok = ok
        || test_match_rules(url, &custom.matches)
        || (custom.orig_match && test_match_rules(url, &meta.matches));

    ok = ok
        || test_glob_rules(url, &custom.include, safe)
        || (custom.orig_include && test_glob_rules(url, &meta.include, safe));

    ok = ok
        && !test_match_rules(url, &custom.exclude_match)
        && !(custom.orig_exclude_match && test_match_rules(url, &meta.exclude_match));

    ok && !test_glob_rules(url, &custom.exclude, false)
        && !(custom.orig_exclude && test_glob_rules(url, &meta.exclude, false))
}

/// Describe rules of a script that can never match.
pub fn rule_errors(script: &ScriptRecord) -> Vec<String> {
    let mut errors = Vec::new();
    let meta = &script.meta;
    for (key, rules) in [("@match", &meta.matches), ("@exclude-match", &meta.exclude_match)] {
        for rule in rules.iter() {
            if match_rule_matcher(rule).is_never() {
                errors.push(format!("Invalid {key} rule: {rule}"));
            }
        }
    }
    for (key, rules) in [("@include", &meta.include), ("@exclude", &meta.exclude)] {
        for rule in rules.iter() {
            if glob_rule_matcher(rule).is_never() {
                errors.push(format!("Invalid {key} rule: {rule}"));
            }
        }
    }
    errors
}
