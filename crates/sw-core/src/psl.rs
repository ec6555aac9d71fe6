//! Public Suffix List (PSL) state for `.tld` rule expansion
//!
//! Rules such as `*://www.google.tld/*` match any public suffix in place of
//! `tld`. That needs the Mozilla suffix list, which is loaded at runtime.
//! Until [`init_psl`] runs, `.tld` is matched as a literal label; scripts may
//! depend on that startup behavior so it is kept as is.
//!
//! # Examples
//!
//! ```
//! use sw_core::psl::{init_psl_from_text, get_public_suffix};
//!
//! init_psl_from_text("// ===BEGIN ICANN DOMAINS===\ncom\nuk\nco.uk\n").unwrap();
//! assert_eq!(get_public_suffix("co.uk").as_deref(), Some("co.uk"));
//! ```

use std::sync::RwLock;

use publicsuffix::{List, Psl};

use crate::cache::LruCache;

// =============================================================================
// Global PSL State
// =============================================================================

static PSL_LIST: RwLock<Option<List>> = RwLock::new(None);

static SUFFIX_CACHE: RwLock<Option<LruCache<Option<String>>>> = RwLock::new(None);

const SUFFIX_CACHE_CAPACITY: usize = 4096;

/// Error returned when the suffix list text cannot be parsed.
#[derive(Debug, thiserror::Error)]
#[error("Invalid public suffix list: {0}")]
pub struct PslError(String);

/// Install a parsed suffix list.
///
/// Compiled rule matchers are dropped because `.tld` rules compile
/// differently once the list is available.
pub fn init_psl(list: List) {
    *PSL_LIST.write().unwrap_or_else(|e| e.into_inner()) = Some(list);
    *SUFFIX_CACHE.write().unwrap_or_else(|e| e.into_inner()) =
        Some(LruCache::new(SUFFIX_CACHE_CAPACITY));
    crate::matcher::clear_matcher_cache();
    log::debug!("public suffix list loaded");
}

/// Parse `public_suffix_list.dat` text and install it.
pub fn init_psl_from_text(text: &str) -> Result<(), PslError> {
    let list: List = text.parse().map_err(|e| PslError(format!("{e}")))?;
    init_psl(list);
    Ok(())
}

/// Check if PSL is initialized.
pub fn is_psl_initialized() -> bool {
    PSL_LIST.read().unwrap_or_else(|e| e.into_inner()).is_some()
}

// =============================================================================
// Suffix lookup
// =============================================================================

/// Get the public suffix of a hostname.
///
/// Returns `None` when the list is not loaded or the name has no suffix.
pub fn get_public_suffix(host: &str) -> Option<String> {
    let host = host.trim_end_matches('.').to_ascii_lowercase();

    if let Some(ref mut cache) = *SUFFIX_CACHE.write().unwrap_or_else(|e| e.into_inner()) {
        if let Some(cached) = cache.get(&host) {
            return cached;
        }
    }

    let result = {
        let guard = PSL_LIST.read().unwrap_or_else(|e| e.into_inner());
        let list = guard.as_ref()?;
        list.suffix(host.as_bytes())
            .and_then(|suffix| std::str::from_utf8(suffix.as_bytes()).ok())
            .map(str::to_string)
    };

    if let Some(ref mut cache) = *SUFFIX_CACHE.write().unwrap_or_else(|e| e.into_inner()) {
        cache.insert(host, result.clone());
    }

    result
}

/// True when `candidate` is itself exactly a public suffix.
pub fn is_public_suffix(candidate: &str) -> bool {
    get_public_suffix(candidate).map_or(false, |suffix| suffix == candidate)
}

#[cfg(test)]
pub(crate) fn init_test_psl() {
    const LIST: &str = "// ===BEGIN ICANN DOMAINS===\n\
        com\n\
        org\n\
        net\n\
        uk\n\
        co.uk\n\
        jp\n\
        co.jp\n\
        // ===END ICANN DOMAINS===\n";
    if !is_psl_initialized() {
        init_psl_from_text(LIST).unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_suffix_lookup() {
        init_test_psl();
        assert_eq!(get_public_suffix("example.co.uk").as_deref(), Some("co.uk"));
        assert_eq!(get_public_suffix("www.example.com").as_deref(), Some("com"));
        assert!(is_public_suffix("co.uk"));
        assert!(is_public_suffix("com"));
        assert!(!is_public_suffix("example.com"));
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        init_test_psl();
        assert_eq!(get_public_suffix("Example.CO.UK.").as_deref(), Some("co.uk"));
    }
}
