//! Cache-key derivation and request URL normalization.
//!
//! A manifest entry `("/static/core.js", HASH)` served by a worker at
//! `https://host/service_worker.js` becomes the table row
//!
//! ```text
//! https://host/static/core.js  ->  https://host/static/core.js?_sw-precache=HASH
//! ```
//!
//! The left side is what requests are matched against, the right side is the
//! key the response is stored under.

use hashbrown::{HashMap, HashSet};
use precache_net::UrlPattern;
use url::Url;

use crate::error::PrecacheResult;
use crate::manifest::Manifest;

/// Append `param=hash` to `url`'s query unless `pre_versioned` already matches it.
pub fn derive_cache_key(
    url: &Url,
    param_name: &str,
    content_hash: &str,
    pre_versioned: Option<&UrlPattern>,
) -> Url {
    let mut key = url.clone();
    if pre_versioned.is_some_and(|p| p.matches(url.as_str())) {
        return key;
    }

    let pair = format!(
        "{}={}",
        urlencoding::encode(param_name),
        urlencoding::encode(content_hash)
    );
    let query = match url.query() {
        Some(existing) if !existing.is_empty() => format!("{}&{}", existing, pair),
        _ => pair,
    };
    key.set_query(Some(&query));
    key
}

/// Drop query parameters whose name matches any ignore pattern.
///
/// Remaining parameters keep their order and their original encoding.
pub fn strip_ignored_url_parameters(url: &Url, ignore: &[UrlPattern]) -> Url {
    let mut stripped = url.clone();
    let Some(query) = url.query() else {
        return stripped;
    };

    let kept: Vec<&str> = query
        .split('&')
        .filter(|pair| {
            let name = pair.split('=').next().unwrap_or_default();
            !UrlPattern::any_match(ignore, name)
        })
        .collect();

    if kept.is_empty() || kept == [""] {
        stripped.set_query(None);
    } else {
        stripped.set_query(Some(&kept.join("&")));
    }
    stripped
}

/// Append the directory index file to a URL whose path ends in `/`.
pub fn add_directory_index(url: &Url, index: &str) -> Url {
    let mut with_index = url.clone();
    if url.path().ends_with('/') {
        with_index.set_path(&format!("{}{}", url.path(), index));
    }
    with_index
}

/// An empty whitelist allows everything; otherwise the path must match one pattern.
pub fn is_path_whitelisted(whitelist: &[UrlPattern], url: &Url) -> bool {
    whitelist.is_empty() || UrlPattern::any_match(whitelist, url.path())
}

/// Absolute logical URL -> versioned cache key, one row per manifest entry.
#[derive(Debug, Clone, Default)]
pub struct CacheKeyTable {
    keys: HashMap<String, String>,
    /// Logical URLs in manifest order.
    order: Vec<String>,
}

impl CacheKeyTable {
    /// Resolve every manifest path against `location` and derive its key.
    pub fn build(
        manifest: &Manifest,
        location: &Url,
        param_name: &str,
        pre_versioned: Option<&UrlPattern>,
    ) -> PrecacheResult<Self> {
        let mut keys = HashMap::with_capacity(manifest.len());
        let mut order = Vec::with_capacity(manifest.len());

        for entry in manifest.iter() {
            let url = location.join(&entry.logical_path)?;
            let key = derive_cache_key(&url, param_name, &entry.content_hash, pre_versioned);
            let url = url.to_string();
            // two spellings can resolve to the same URL; the first one wins
            if !keys.contains_key(&url) {
                keys.insert(url.clone(), key.to_string());
                order.push(url);
            }
        }

        Ok(Self { keys, order })
    }

    /// Cache key for a normalized request URL.
    pub fn get(&self, url: &Url) -> Option<&str> {
        self.keys.get(url.as_str()).map(String::as_str)
    }

    pub fn contains(&self, url: &Url) -> bool {
        self.keys.contains_key(url.as_str())
    }

    /// `(logical URL, cache key)` rows in manifest order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.order
            .iter()
            .map(move |url| (url.as_str(), self.keys[url].as_str()))
    }

    /// The set of keys the bucket must hold once activated.
    pub fn cache_keys(&self) -> HashSet<&str> {
        self.keys.values().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HASH1: &str = "0a642be9e1b7fb02b86a2e52fc88a8a7";
    const HASH2: &str = "6977c253b5b4da588d50b0aaa50b21f4";

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn location() -> Url {
        url("https://home.example/service_worker.js")
    }

    #[test]
    fn test_derive_appends_hash_param() {
        let key = derive_cache_key(&url("https://home.example/"), "_sw-precache", HASH1, None);
        assert_eq!(key.as_str(), format!("https://home.example/?_sw-precache={HASH1}"));
    }

    #[test]
    fn test_derive_extends_existing_query() {
        let key = derive_cache_key(&url("https://home.example/a?v=1"), "_sw-precache", HASH1, None);
        assert_eq!(key.as_str(), format!("https://home.example/a?v=1&_sw-precache={HASH1}"));
    }

    #[test]
    fn test_derive_is_stable() {
        let a = derive_cache_key(&url("https://home.example/x.js"), "h", HASH1, None);
        let b = derive_cache_key(&url("https://home.example/x.js"), "h", HASH1, None);
        let c = derive_cache_key(&url("https://home.example/x.js"), "h", HASH2, None);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_derive_encodes_param() {
        let key = derive_cache_key(&url("https://home.example/"), "a b", HASH1, None);
        assert_eq!(key.query(), Some(format!("a%20b={HASH1}").as_str()));
    }

    #[test]
    fn test_pre_versioned_url_is_left_alone() {
        let pattern = UrlPattern::new(r"-[0-9a-f]{32}\.html$").unwrap();
        let versioned = url("https://home.example/frontend/map-49ab2d6f180f8bdea7cffaa66b8a5d3e.html");
        let key = derive_cache_key(&versioned, "_sw-precache", HASH1, Some(&pattern));
        assert_eq!(key, versioned);

        let plain = url("https://home.example/frontend/map.html");
        let key = derive_cache_key(&plain, "_sw-precache", HASH1, Some(&pattern));
        assert_ne!(key, plain);
    }

    #[test]
    fn test_strip_ignored_parameters() {
        let ignore = vec![UrlPattern::new("^utm_").unwrap()];
        let stripped = strip_ignored_url_parameters(
            &url("https://home.example/?a=1&utm_source=x&b=2&utm_medium=y"),
            &ignore,
        );
        assert_eq!(stripped.as_str(), "https://home.example/?a=1&b=2");
    }

    #[test]
    fn test_strip_all_parameters_drops_question_mark() {
        let ignore = vec![UrlPattern::new("^utm_").unwrap()];
        let stripped = strip_ignored_url_parameters(&url("https://home.example/?utm_source=x"), &ignore);
        assert_eq!(stripped.as_str(), "https://home.example/");
    }

    #[test]
    fn test_strip_without_query_is_identity() {
        let ignore = vec![UrlPattern::new("^utm_").unwrap()];
        let original = url("https://home.example/static/core.js");
        assert_eq!(strip_ignored_url_parameters(&original, &ignore), original);
    }

    #[test]
    fn test_add_directory_index() {
        let with_index = add_directory_index(&url("https://home.example/frontend/panels/map/"), "index.html");
        assert_eq!(with_index.as_str(), "https://home.example/frontend/panels/map/index.html");

        let file = url("https://home.example/static/core.js");
        assert_eq!(add_directory_index(&file, "index.html"), file);
    }

    #[test]
    fn test_whitelist() {
        let whitelist = vec![UrlPattern::new("^((?!(static|api)).)*$").unwrap()];
        assert!(is_path_whitelisted(&whitelist, &url("https://home.example/some/unknown/route")));
        assert!(!is_path_whitelisted(&whitelist, &url("https://home.example/api/states")));
        assert!(is_path_whitelisted(&[], &url("https://home.example/api/states")));
    }

    #[test]
    fn test_table_resolves_relative_paths() {
        let manifest = Manifest::from_pairs([
            ("/", HASH1),
            ("static/fonts/roboto/Roboto-Bold.ttf", HASH2),
        ])
        .unwrap();
        let table = CacheKeyTable::build(&manifest, &location(), "_sw-precache", None).unwrap();

        assert_eq!(table.len(), 2);
        assert_eq!(
            table.get(&url("https://home.example/static/fonts/roboto/Roboto-Bold.ttf")),
            Some(format!("https://home.example/static/fonts/roboto/Roboto-Bold.ttf?_sw-precache={HASH2}").as_str())
        );

        let rows: Vec<_> = table.iter().map(|(u, _)| u).collect();
        assert_eq!(rows, vec!["https://home.example/", "https://home.example/static/fonts/roboto/Roboto-Bold.ttf"]);
    }

    #[test]
    fn test_table_key_set_matches_manifest() {
        let manifest = Manifest::from_pairs([("/", HASH1), ("/a.js", HASH2)]).unwrap();
        let table = CacheKeyTable::build(&manifest, &location(), "_sw-precache", None).unwrap();
        let keys = table.cache_keys();
        assert_eq!(keys.len(), 2);
        assert!(keys.contains(format!("https://home.example/a.js?_sw-precache={HASH2}").as_str()));
    }
}
