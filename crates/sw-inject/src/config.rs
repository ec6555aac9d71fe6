//! Assembler options

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};

use sw_core::InjectInto;

/// How long an assembled bag stays cached.
pub const DEFAULT_CACHE_LIFETIME: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AssemblerConfig {
    /// Global switch; when off every frame gets an empty bag
    pub enabled: bool,
    /// Realm for scripts without `@inject-into`
    #[serde(deserialize_with = "lenient_realm")]
    pub default_inject_into: InjectInto,
    #[serde(with = "millis")]
    pub cache_lifetime: Duration,
    /// Hosts whose https top frames get `expose: true`
    pub exposed_hosts: BTreeSet<String>,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_inject_into: InjectInto::Auto,
            cache_lifetime: DEFAULT_CACHE_LIFETIME,
            exposed_hosts: BTreeSet::new(),
        }
    }
}

impl AssemblerConfig {
    /// Set the default realm from a stored option value.
    ///
    /// Unknown values fall back to `auto`.
    pub fn set_default_inject_into(&mut self, value: &str) {
        self.default_inject_into = InjectInto::parse(value).unwrap_or_default();
    }

    /// True when switching to `other` invalidates assembled bags.
    pub fn invalidates(&self, other: &Self) -> bool {
        self.enabled != other.enabled || self.default_inject_into != other.default_inject_into
    }

    /// Whether a bag for `url` should carry `expose: true`.
    pub fn should_expose(&self, url: &str, is_top: bool) -> bool {
        is_top
            && url.starts_with("https://")
            && sw_core::url::extract_host(url).map_or(false, |host| self.exposed_hosts.contains(host))
    }
}

fn lenient_realm<'de, D: Deserializer<'de>>(deserializer: D) -> Result<InjectInto, D::Error> {
    let value = String::deserialize(deserializer)?;
    Ok(InjectInto::parse(&value).unwrap_or_default())
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_default_realm_is_auto() {
        let config: AssemblerConfig =
            serde_json::from_str(r#"{"defaultInjectInto":"nowhere"}"#).unwrap();
        assert_eq!(config.default_inject_into, InjectInto::Auto);
        assert!(config.enabled);
        assert_eq!(config.cache_lifetime, DEFAULT_CACHE_LIFETIME);

        let mut config = AssemblerConfig::default();
        config.set_default_inject_into("content");
        assert_eq!(config.default_inject_into, InjectInto::Content);
    }

    #[test]
    fn test_expose_requires_https_top_frame() {
        let config = AssemblerConfig {
            exposed_hosts: BTreeSet::from(["greasyfork.org".to_string()]),
            ..AssemblerConfig::default()
        };
        assert!(config.should_expose("https://greasyfork.org/scripts", true));
        assert!(!config.should_expose("https://greasyfork.org/scripts", false));
        assert!(!config.should_expose("http://greasyfork.org/scripts", true));
        assert!(!config.should_expose("https://example.com/", true));
    }

    #[test]
    fn test_invalidates() {
        let base = AssemblerConfig::default();
        let mut other = base.clone();
        other.cache_lifetime = Duration::from_secs(1);
        assert!(!base.invalidates(&other));
        other.enabled = false;
        assert!(base.invalidates(&other));
    }
}
