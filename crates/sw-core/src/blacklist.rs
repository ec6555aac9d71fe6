//! Global blacklist
//!
//! One rule per line:
//!
//! - `# comment` and blank lines are ignored
//! - `@exclude <glob>` / `@include <glob>` use `@include` syntax
//! - `@exclude-match <pattern>` / `@match <pattern>` use `@match` syntax
//! - `example.com` (no slash) is shorthand for `*://example.com/*`
//! - anything else is a `@match` pattern
//!
//! The first rule that matches decides. `@include` and `@match` lines allow,
//! every other line rejects.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use crate::matcher::{glob_rule_matcher, match_rule_matcher, RuleMatcher};

/// Total key length the decision cache may hold.
pub const MAX_BL_CACHE_LENGTH: usize = 100_000;

// =============================================================================
// Decision cache
// =============================================================================

/// FIFO url -> decision map bounded by the summed length of its keys.
///
/// When the budget is exceeded the oldest entries are dropped until the
/// total is below 75% of the budget, so eviction runs rarely.
pub struct BlacklistCache {
    budget: usize,
    size: usize,
    entries: HashMap<String, Option<String>>,
    order: VecDeque<String>,
}

impl BlacklistCache {
    pub fn new(budget: usize) -> Self {
        Self {
            budget,
            size: 0,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Cached decision: `Some(None)` means allowed, `Some(Some(rule))` rejected.
    pub fn get(&self, url: &str) -> Option<Option<String>> {
        self.entries.get(url).cloned()
    }

    pub fn insert(&mut self, url: String, decision: Option<String>) {
        if let Some(slot) = self.entries.get_mut(&url) {
            *slot = decision;
            return;
        }
        self.size += url.chars().count();
        self.order.push_back(url.clone());
        self.entries.insert(url, decision);
        if self.size > self.budget {
            let target = self.budget * 3 / 4;
            while self.size >= target {
                let Some(oldest) = self.order.pop_front() else {
                    break;
                };
                self.size -= oldest.chars().count();
                self.entries.remove(&oldest);
            }
        }
    }

    /// Summed length of cached keys, in characters.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.size = 0;
        self.entries.clear();
        self.order.clear();
    }
}

impl Default for BlacklistCache {
    fn default() -> Self {
        Self::new(MAX_BL_CACHE_LENGTH)
    }
}

// =============================================================================
// Blacklist
// =============================================================================

struct BlacklistRule {
    reject: bool,
    matcher: Arc<RuleMatcher>,
    text: String,
}

/// Parsed blacklist with its decision cache.
#[derive(Default)]
pub struct Blacklist {
    rules: Vec<BlacklistRule>,
    cache: Mutex<BlacklistCache>,
}

impl Blacklist {
    pub fn new(text: &str) -> Self {
        let mut blacklist = Self::default();
        blacklist.reset(text);
        blacklist
    }

    /// Replace all rules and clear cached decisions.
    pub fn reset(&mut self, text: &str) {
        self.rules = text.lines().filter_map(parse_line).collect();
        self.cache.get_mut().unwrap_or_else(|e| e.into_inner()).clear();
        log::debug!("blacklist reset: {} rules", self.rules.len());
    }

    /// Text of the rule rejecting `url`, or `None` when allowed.
    pub fn test(&self, url: &str) -> Option<String> {
        if let Some(hit) = self.cache.lock().unwrap_or_else(|e| e.into_inner()).get(url) {
            return hit;
        }
        let decision = self
            .rules
            .iter()
            .find(|rule| rule.matcher.test(url))
            .filter(|rule| rule.reject)
            .map(|rule| rule.text.clone());
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(url.to_string(), decision.clone());
        decision
    }

    #[inline]
    pub fn is_blacklisted(&self, url: &str) -> bool {
        self.test(url).is_some()
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Summed key length currently held by the decision cache.
    pub fn cache_size(&self) -> usize {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).size()
    }
}

fn parse_line(line: &str) -> Option<BlacklistRule> {
    let text = line.trim();
    if text.is_empty() || text.starts_with('#') {
        return None;
    }
    let mode = text
        .starts_with('@')
        .then(|| text.split_whitespace().next().unwrap_or(text));
    let rule = match mode {
        Some(mode) => text[mode.len()..].trim(),
        None => text,
    };
    let reject = !matches!(mode, Some("@include" | "@match"));
    let matcher = match mode {
        Some("@include" | "@exclude") => glob_rule_matcher(rule),
        None if !rule.contains('/') => match_rule_matcher(&format!("*://{rule}/*")),
        _ => match_rule_matcher(rule),
    };
    Some(BlacklistRule {
        reject,
        matcher,
        text: text.to_string(),
    })
}
