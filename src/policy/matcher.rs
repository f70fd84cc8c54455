use crate::error::ConfigError;
use http::Method;
use matchit::Router as MatchitRouter;

/// Path pattern plus an optional method list.
///
/// Patterns use `:param` for one segment and `*rest` for the remainder,
/// e.g. `/api/items/:id` or `/files/*path`.
#[derive(Clone)]
pub struct RouteMatcher {
    pattern: String,
    methods: Vec<Method>,
    matcher: MatchitRouter<()>,
}

impl std::fmt::Debug for RouteMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteMatcher")
            .field("pattern", &self.pattern)
            .field("methods", &self.methods)
            .finish()
    }
}

impl RouteMatcher {
    pub fn new(pattern: &str, methods: &[String]) -> Result<Self, ConfigError> {
        if !pattern.starts_with('/') {
            return Err(ConfigError::InvalidPolicy(format!(
                "route pattern must start with '/': {}",
                pattern
            )));
        }

        let methods = methods
            .iter()
            .map(|m| {
                Method::from_bytes(m.to_uppercase().as_bytes())
                    .map_err(|_| ConfigError::InvalidPolicy(format!("invalid HTTP method: {}", m)))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut matcher = MatchitRouter::new();
        matcher
            .insert(convert_path_syntax(pattern), ())
            .map_err(|e| {
                ConfigError::InvalidPolicy(format!("invalid route pattern {}: {}", pattern, e))
            })?;

        Ok(Self {
            pattern: pattern.to_string(),
            methods,
            matcher,
        })
    }

    /// Whether `method` and `path` fall under this matcher. An empty method
    /// list accepts every method.
    pub fn matches(&self, method: &Method, path: &str) -> bool {
        if !self.methods.is_empty() && !self.methods.contains(method) {
            return false;
        }
        self.matcher.at(path).is_ok()
    }
}

/// Convert `:param` / `*rest` segments to matchit's `{param}` / `{*rest}`.
/// Patterns already written in matchit syntax pass through unchanged.
pub fn convert_path_syntax(path: &str) -> String {
    let mut result = String::with_capacity(path.len() + 4);
    let mut chars = path.chars().peekable();

    while let Some(ch) = chars.next() {
        let prefix = match ch {
            ':' => "{",
            '*' => "{*",
            _ => {
                result.push(ch);
                continue;
            }
        };

        result.push_str(prefix);
        while let Some(next) = chars.next_if(|c| c.is_alphanumeric() || *c == '_') {
            result.push(next);
        }
        result.push('}');
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convert_path_syntax() {
        assert_eq!(convert_path_syntax("/api/users"), "/api/users");
        assert_eq!(convert_path_syntax("/api/users/:id"), "/api/users/{id}");
        assert_eq!(
            convert_path_syntax("/api/users/:user_id/posts/:post_id"),
            "/api/users/{user_id}/posts/{post_id}"
        );
        assert_eq!(convert_path_syntax("/files/*path"), "/files/{*path}");
        assert_eq!(convert_path_syntax("/api/items/{id}"), "/api/items/{id}");
    }

    #[test]
    fn test_matches_path_params() {
        let matcher = RouteMatcher::new("/api/items/:id", &[]).unwrap();
        assert!(matcher.matches(&Method::GET, "/api/items/42"));
        assert!(matcher.matches(&Method::DELETE, "/api/items/abc"));
        assert!(!matcher.matches(&Method::GET, "/api/items"));
        assert!(!matcher.matches(&Method::GET, "/api/items/42/extra"));
    }

    #[test]
    fn test_matches_wildcard() {
        let matcher = RouteMatcher::new("/files/*path", &[]).unwrap();
        assert!(matcher.matches(&Method::GET, "/files/a/b/c.txt"));
        assert!(!matcher.matches(&Method::GET, "/other"));
    }

    #[test]
    fn test_method_filter() {
        let matcher =
            RouteMatcher::new("/api/auth/otp/send", &["post".to_string()]).unwrap();
        assert!(matcher.matches(&Method::POST, "/api/auth/otp/send"));
        assert!(!matcher.matches(&Method::GET, "/api/auth/otp/send"));
    }

    #[test]
    fn test_invalid_patterns() {
        assert!(RouteMatcher::new("api/no-slash", &[]).is_err());
        assert!(RouteMatcher::new("/ok", &["NOT A METHOD".to_string()]).is_err());
    }
}
