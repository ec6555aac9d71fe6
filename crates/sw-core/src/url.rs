//! URL helpers for rule matching and dependency resolution
//!
//! Matching works on raw string slices; relative dependency URLs are
//! resolved with the `url` crate.

use base64::prelude::{Engine as _, BASE64_STANDARD};
use percent_encoding::percent_decode_str;
use url::Url;

// =============================================================================
// Match parts
// =============================================================================

/// Split `scheme://host/path` into its three parts.
///
/// The host keeps any port or userinfo and the path excludes the leading
/// slash. Returns `None` when the string is not shaped like that, e.g. when
/// there is no slash after the host.
#[inline]
pub fn split_match_parts(s: &str) -> Option<(&str, &str, &str)> {
    let colon = s.find(':')?;
    let scheme = &s[..colon];
    if scheme.contains('/') {
        return None;
    }
    let rest = s[colon..].strip_prefix("://")?;
    let slash = rest.find('/')?;
    let path = &rest[slash + 1..];
    if path.contains('\n') {
        return None;
    }
    Some((scheme, &rest[..slash], path))
}

/// Extract the host (with port) of a `scheme://host/...` URL.
#[inline]
pub fn extract_host(url: &str) -> Option<&str> {
    let start = url.find("://")? + 3;
    let rest = &url[start..];
    let end = rest
        .find(|c| c == '/' || c == '?' || c == '#')
        .unwrap_or(rest.len());
    Some(&rest[..end])
}

// =============================================================================
// Data URIs and remote URLs
// =============================================================================

#[inline]
pub fn is_data_uri(url: &str) -> bool {
    url.len() >= 5 && url.as_bytes()[..5].eq_ignore_ascii_case(b"data:")
}

/// True for URLs that can be fetched over the network.
#[inline]
pub fn is_remote(url: &str) -> bool {
    !url.is_empty() && !url.starts_with("file:") && !url.starts_with("data:")
}

/// Decode the payload of a `data:` URI as text.
///
/// Base64 payloads are decoded as such, everything else is percent-decoded.
/// Invalid UTF-8 is replaced rather than rejected.
pub fn decode_data_uri(uri: &str) -> Option<String> {
    if !is_data_uri(uri) {
        return None;
    }
    let comma = uri.find(',')?;
    let header = &uri[5..comma];
    let payload = &uri[comma + 1..];
    let bytes = if header
        .rsplit(';')
        .next()
        .map_or(false, |part| part.eq_ignore_ascii_case("base64"))
    {
        BASE64_STANDARD.decode(percent_decode(payload)).ok()?
    } else {
        percent_decode(payload)
    };
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

fn percent_decode(input: &str) -> Vec<u8> {
    percent_decode_str(input).collect()
}

// =============================================================================
// Relative URL resolution
// =============================================================================

const ALLOWED_SCHEMES: &[&str] = &["http", "https", "ftp", "data", "blob"];

/// Resolve `url` against `base`.
///
/// Schemes outside http/https/ftp/data/blob are rewritten to `http`.
/// Returns `None` when neither string forms a valid absolute URL.
pub fn get_full_url(url: &str, base: &str) -> Option<String> {
    let joined = match Url::parse(base) {
        Ok(base) => base.join(url).ok()?,
        Err(_) => Url::parse(url).ok()?,
    };
    if ALLOWED_SCHEMES.contains(&joined.scheme()) {
        return Some(joined.into());
    }
    let mut forced = joined.clone();
    if forced.set_scheme("http").is_ok() {
        return Some(forced.into());
    }
    let href: String = joined.into();
    let after_scheme = &href[href.find(':')? + 1..];
    let rebuilt = format!("http:{}", after_scheme);
    Url::parse(&rebuilt).ok().map(Into::into)
}
