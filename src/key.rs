//! Canonical keys for cacheable artwork.
//!
//! The metadata API hands out raw image paths like `/abc.jpg` plus a size tier like `w92`.  A [KeyBuilder] composes
//! them with the configured origin into a size-qualified URL, which is the identity of the image everywhere else in
//! this crate: the memory tier, the pending table, the durable store and the prefetch bookkeeping all key on it.
//!
//! Thumbnail and full-resolution variants of the same path produce different keys and are cached independently.
use std::fmt;
use std::sync::Arc;

/// A size-qualified URL identifying one image at one size tier.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ResourceKey(Arc<str>);

impl ResourceKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for ResourceKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::borrow::Borrow<str> for ResourceKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Width breakpoints of the tier ladder, smallest first.
const TIER_LADDER: &[(u32, &str)] = &[
    (92, "w92"),
    (154, "w154"),
    (185, "w185"),
    (342, "w342"),
    (500, "w500"),
];

const WIDEST_TIER: &str = "w780";

/// Pick the smallest tier at least as wide as a container of `width` pixels.
pub fn optimal_tier(width: u32) -> &'static str {
    TIER_LADDER
        .iter()
        .find(|(max, _)| width <= *max)
        .map(|(_, tier)| *tier)
        .unwrap_or(WIDEST_TIER)
}

/// Builds [ResourceKey]s for one origin.
#[derive(Clone, Debug)]
pub struct KeyBuilder {
    origin: Arc<str>,
}

impl KeyBuilder {
    pub fn new(origin: &str) -> KeyBuilder {
        KeyBuilder {
            origin: origin.trim_end_matches('/').into(),
        }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Compose `origin/tier/path`.
    ///
    /// Returns `None` when the path or tier can't be part of a canonical key.  Callers treat that as "uncacheable" and
    /// use the raw source directly.
    pub fn build_key(&self, path: &str, tier: &str) -> Option<ResourceKey> {
        if !is_valid_path(path) || !is_valid_tier(tier) {
            return None;
        }

        Some(ResourceKey(
            format!("{}/{}{}", self.origin, tier, path).into(),
        ))
    }

    /// Is this URL something we are willing to persist?
    pub fn is_cacheable_url(&self, url: &str) -> bool {
        self.strip_origin(url).is_some()
    }

    /// Recover the raw path from either a raw path or a full URL under our origin.
    ///
    /// `/abc.jpg` comes back unchanged, `{origin}/w500/abc.jpg` yields `/abc.jpg`, and anything else yields `None`.
    pub fn path_from_source<'a>(&self, source: &'a str) -> Option<&'a str> {
        if source.starts_with('/') {
            return is_valid_path(source).then_some(source);
        }

        let rest = self.strip_origin(source)?;
        let slash = rest.find('/')?;
        let (tier, path) = rest.split_at(slash);
        (is_valid_tier(tier) && is_valid_path(path)).then_some(path)
    }

    /// Everything after `origin/`, if the URL is under the origin.
    fn strip_origin<'a>(&self, url: &'a str) -> Option<&'a str> {
        url.strip_prefix(&*self.origin)?
            .strip_prefix('/')
            .filter(|x| !x.is_empty())
    }
}

fn is_valid_tier(tier: &str) -> bool {
    !tier.is_empty() && tier.bytes().all(|b| b.is_ascii_alphanumeric())
}

fn is_valid_path(path: &str) -> bool {
    let Some(rest) = path.strip_prefix('/') else {
        return false;
    };

    if rest.is_empty()
        || path
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '?' | '#' | '\\'))
    {
        return false;
    }

    rest.split('/')
        .all(|segment| !segment.is_empty() && segment != "." && segment != "..")
}

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;

    const ORIGIN: &str = "https://image.tmdb.org/t/p";

    #[test]
    fn test_build_key() {
        let keys = KeyBuilder::new("https://image.tmdb.org/t/p/");
        assert_eq!(
            keys.build_key("/abc.jpg", "w92").unwrap().as_str(),
            "https://image.tmdb.org/t/p/w92/abc.jpg"
        );
        assert_eq!(
            keys.build_key("/abc.jpg", "original").unwrap().as_str(),
            "https://image.tmdb.org/t/p/original/abc.jpg"
        );
    }

    #[test]
    fn test_uncacheable_inputs() {
        let keys = KeyBuilder::new(ORIGIN);
        for path in &[
            "",
            "/",
            "abc.jpg",
            "/a b.jpg",
            "/abc.jpg?x=1",
            "/abc.jpg#frag",
            "//abc.jpg",
            "/../abc.jpg",
            "/./abc.jpg",
            "/a\\b.jpg",
        ] {
            assert!(keys.build_key(path, "w92").is_none(), "{:?}", path);
        }

        assert!(keys.build_key("/abc.jpg", "").is_none());
        assert!(keys.build_key("/abc.jpg", "w/92").is_none());
    }

    #[test]
    fn test_path_from_source() {
        let keys = KeyBuilder::new(ORIGIN);
        assert_eq!(keys.path_from_source("/abc.jpg"), Some("/abc.jpg"));
        assert_eq!(
            keys.path_from_source("https://image.tmdb.org/t/p/w500/abc.jpg"),
            Some("/abc.jpg")
        );
        assert_eq!(keys.path_from_source("https://example.com/abc.jpg"), None);
        assert_eq!(keys.path_from_source("https://image.tmdb.org/t/p/w500"), None);
        assert_eq!(keys.path_from_source(""), None);
    }

    #[test]
    fn test_cacheable_urls() {
        let keys = KeyBuilder::new(ORIGIN);
        assert!(keys.is_cacheable_url("https://image.tmdb.org/t/p/w92/abc.jpg"));
        assert!(!keys.is_cacheable_url("https://image.tmdb.org/t/pw92/abc.jpg"));
        assert!(!keys.is_cacheable_url("https://cdn.example.com/abc.jpg"));
    }

    #[test]
    fn test_optimal_tier() {
        assert_eq!(optimal_tier(0), "w92");
        assert_eq!(optimal_tier(92), "w92");
        assert_eq!(optimal_tier(93), "w154");
        assert_eq!(optimal_tier(342), "w342");
        assert_eq!(optimal_tier(500), "w500");
        assert_eq!(optimal_tier(1920), "w780");
    }

    proptest! {
        #[test]
        fn test_key_stability(
            path in "(/[a-zA-Z0-9_-]{1,12}){1,3}\\.jpg",
            t1 in "w[0-9]{2,4}",
            t2 in "w[0-9]{2,4}",
        ) {
            let keys = KeyBuilder::new(ORIGIN);
            let a = keys.build_key(&path, &t1).expect("valid path");
            let again = keys.build_key(&path, &t1);
            let other = keys.build_key(&path, &t2);
            prop_assert_eq!(Some(&a), again.as_ref());
            prop_assert_eq!(t1 == t2, Some(&a) == other.as_ref());
            prop_assert_eq!(keys.path_from_source(a.as_str()), Some(path.as_str()));
        }
    }
}
