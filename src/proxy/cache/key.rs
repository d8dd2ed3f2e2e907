use http::Method;

/// Builds the store key for a cacheable request: `"GET host:port path"`.
///
/// Host and path are used byte-for-byte, so `Example.com` and `example.com` are distinct keys.
pub fn build_key(host: &str, port: u16, target: &str) -> String {
    format!("GET {host}:{port} {}", origin_path(target))
}

/// Strips an absolute-form `http://authority` prefix, leaving the origin-form path.
pub fn origin_path(target: &str) -> &str {
    if target.starts_with('/') {
        return target;
    }
    let rest = match target.get(..7) {
        Some(scheme) if scheme.eq_ignore_ascii_case("http://") => &target[7..],
        _ => target,
    };
    match rest.find('/') {
        Some(idx) => &rest[idx..],
        None => "/",
    }
}

/// Only bodiless GET requests share an origin fetch.
pub fn is_cacheable(method: &Method, has_body: bool) -> bool {
    method == Method::GET && !has_body
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_uses_origin_form_path() {
        assert_eq!(
            build_key("example.com", 80, "http://example.com/a/b?x=1"),
            "GET example.com:80 /a/b?x=1"
        );
        assert_eq!(
            build_key("example.com", 8080, "/index.html"),
            "GET example.com:8080 /index.html"
        );
    }

    #[test]
    fn origin_path_defaults_to_root() {
        assert_eq!(origin_path("http://example.com"), "/");
        assert_eq!(origin_path("HTTP://example.com:81/x"), "/x");
    }

    #[test]
    fn key_is_not_normalized() {
        assert_ne!(
            build_key("Example.com", 80, "/"),
            build_key("example.com", 80, "/")
        );
    }

    #[test]
    fn only_bodiless_get_is_cacheable() {
        assert!(is_cacheable(&Method::GET, false));
        assert!(!is_cacheable(&Method::GET, true));
        assert!(!is_cacheable(&Method::HEAD, false));
        assert!(!is_cacheable(&Method::POST, false));
    }
}
