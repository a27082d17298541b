//! Helpers for joining the configured API base with endpoint paths.

/// Strips trailing slashes from a base URL.
///
/// ```
/// use arena_chat::utils::url::normalize_base_url;
///
/// assert_eq!(normalize_base_url("http://localhost:8000/api/"), "http://localhost:8000/api");
/// ```
pub fn normalize_base_url(base_url: &str) -> String {
    base_url.trim().trim_end_matches('/').to_string()
}

/// Joins a base URL and an endpoint path with exactly one slash between
/// them. Trailing slashes on the endpoint are kept; the service routes on
/// them.
///
/// ```
/// use arena_chat::utils::url::construct_api_url;
///
/// assert_eq!(
///     construct_api_url("http://localhost:8000/api/", "/auth/refresh/"),
///     "http://localhost:8000/api/auth/refresh/"
/// );
/// ```
pub fn construct_api_url(base_url: &str, endpoint: &str) -> String {
    format!(
        "{}/{}",
        normalize_base_url(base_url),
        endpoint.trim_start_matches('/')
    )
}

/// Canonical form of an endpoint path: a single leading slash and no query.
pub fn endpoint_path(endpoint: &str) -> String {
    let path = endpoint.split(['?', '#']).next().unwrap_or_default();
    format!("/{}", path.trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn construct_api_url_handles_slashes_on_both_sides() {
        let expected = "http://host/api/messages/stream";
        for (base, endpoint) in [
            ("http://host/api", "messages/stream"),
            ("http://host/api/", "messages/stream"),
            ("http://host/api", "/messages/stream"),
            ("http://host/api///", "//messages/stream"),
        ] {
            assert_eq!(construct_api_url(base, endpoint), expected);
        }
    }

    #[test]
    fn construct_api_url_keeps_trailing_endpoint_slash() {
        assert_eq!(
            construct_api_url("http://host/api", "sessions/s1/generate_title/"),
            "http://host/api/sessions/s1/generate_title/"
        );
    }

    #[test]
    fn endpoint_path_is_rooted_and_query_free() {
        assert_eq!(endpoint_path("auth/refresh/"), "/auth/refresh/");
        assert_eq!(endpoint_path("/public/models?x=1"), "/public/models");
        assert_eq!(endpoint_path(""), "/");
    }
}
