use crate::Method;

/// Derives the cache key for a request, or `None` if the method is not cacheable.
///
/// Only `GET` is cached. The key is the BLAKE3 digest, hex encoded, of
/// `METHOD:path:query`, where an absent query contributes an empty string.
///
/// # Examples
///
/// ```
/// use visara_gateway::Method;
/// use visara_gateway::cache::cache_key;
///
/// let a = cache_key(&Method::Get, "/x", Some("a=1")).unwrap();
/// let b = cache_key(&Method::Get, "/x", Some("a=2")).unwrap();
/// assert_ne!(a, b);
/// assert!(cache_key(&Method::Post, "/x", None).is_none());
/// ```
pub fn cache_key(method: &Method, path: &str, query: Option<&str>) -> Option<String> {
    if !is_cacheable(method) {
        return None;
    }

    let material = format!("{}:{}:{}", method.as_str(), path, query.unwrap_or(""));
    Some(blake3::hash(material.as_bytes()).to_hex().to_string())
}

/// Returns `true` for methods whose responses may be served from cache.
pub fn is_cacheable(method: &Method) -> bool {
    matches!(method, Method::Get)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_inputs_same_key() {
        let a = cache_key(&Method::Get, "/reports", Some("region=eu"));
        let b = cache_key(&Method::Get, "/reports", Some("region=eu"));
        assert_eq!(a, b);
        assert_eq!(a.unwrap().len(), 64);
    }

    #[test]
    fn query_and_path_both_matter() {
        let base = cache_key(&Method::Get, "/x", Some("a=1"));
        assert_ne!(base, cache_key(&Method::Get, "/x", Some("a=2")));
        assert_ne!(base, cache_key(&Method::Get, "/y", Some("a=1")));
        assert_ne!(base, cache_key(&Method::Get, "/x", None));
    }

    #[test]
    fn missing_and_empty_query_coincide() {
        assert_eq!(
            cache_key(&Method::Get, "/x", None),
            cache_key(&Method::Get, "/x", Some(""))
        );
    }

    #[test]
    fn non_get_methods_have_no_key() {
        for method in [
            Method::Post,
            Method::Put,
            Method::Delete,
            Method::Patch,
            Method::Head,
            Method::Options,
            Method::Custom("PURGE".into()),
        ] {
            assert!(cache_key(&method, "/x", None).is_none(), "{method} should not be cacheable");
        }
    }
}
