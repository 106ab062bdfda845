//! Static registry of downstream consumers.
//!
//! The consumer set is fixed for the process lifetime; each entry is built
//! from `<NAME>_URL` / `<NAME>_TOKEN` environment variables at boot. A
//! consumer without a configured URL is silently absent from the registry.

use std::env;

use crate::config::ConfigError;

/// How a consumer authenticates forwarded events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthKind {
    /// `Authorization: Bearer <token>`
    Bearer,
    /// `X-Auth: <token>`
    XAuth,
}

impl AuthKind {
    /// Parse a configured auth kind. Unknown values log a warning and fall
    /// back to bearer.
    pub fn parse_or_bearer(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "bearer" => Self::Bearer,
            "x-auth" => Self::XAuth,
            other => {
                tracing::warn!(auth_kind = %other, "Unknown auth kind, defaulting to bearer");
                Self::Bearer
            }
        }
    }
}

/// One downstream consumer, immutable for the process lifetime
#[derive(Debug, Clone)]
pub struct ConsumerDescriptor {
    pub key: String,
    pub label: String,
    pub url: String,
    pub token: Option<String>,
    pub auth_kind: AuthKind,
}

impl ConsumerDescriptor {
    /// Authentication header for this consumer, if a token is configured.
    pub fn auth_header(&self) -> Option<(&'static str, String)> {
        let token = self.token.as_deref()?;
        match self.auth_kind {
            AuthKind::Bearer => Some(("Authorization", format!("Bearer {token}"))),
            AuthKind::XAuth => Some(("X-Auth", token.to_string())),
        }
    }
}

struct ConsumerSpec {
    key: &'static str,
    label: &'static str,
    env_prefix: &'static str,
    token_fallback: Option<&'static str>,
    default_auth: AuthKind,
}

const CONSUMER_SPECS: &[ConsumerSpec] = &[
    ConsumerSpec {
        key: "heimgeist",
        label: "Heimgeist",
        env_prefix: "HEIMGEIST",
        token_fallback: None,
        default_auth: AuthKind::Bearer,
    },
    ConsumerSpec {
        key: "hauski",
        label: "hausKI",
        env_prefix: "HAUSKI",
        token_fallback: Some("HAUSKI_EVENTS_TOKEN"),
        default_auth: AuthKind::Bearer,
    },
    ConsumerSpec {
        key: "semantah",
        label: "semantAH",
        env_prefix: "SEMANTAH",
        token_fallback: None,
        default_auth: AuthKind::XAuth,
    },
    ConsumerSpec {
        key: "wgx",
        label: "WGX",
        env_prefix: "WGX",
        token_fallback: Some("WGX_EVENTS_TOKEN"),
        default_auth: AuthKind::XAuth,
    },
];

/// The set of configured consumers
#[derive(Debug, Clone, Default)]
pub struct ConsumerRegistry {
    consumers: Vec<ConsumerDescriptor>,
}

impl ConsumerRegistry {
    pub fn new(consumers: Vec<ConsumerDescriptor>) -> Self {
        Self { consumers }
    }

    /// Build the registry from the environment.
    ///
    /// Consumers without a URL are skipped; a URL that is not an absolute
    /// http(s) URL is a boot-time configuration error.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut consumers = Vec::new();

        for spec in CONSUMER_SPECS {
            let url_var = format!("{}_URL", spec.env_prefix);
            let raw_url = match env::var(&url_var) {
                Ok(value) if !value.trim().is_empty() => value,
                _ => {
                    tracing::debug!(consumer = spec.key, "No URL configured, consumer skipped");
                    continue;
                }
            };

            let url = normalize_consumer_url(raw_url.trim()).map_err(|reason| {
                ConfigError::Invalid {
                    name: url_var.clone(),
                    reason,
                }
            })?;

            let token_var = format!("{}_TOKEN", spec.env_prefix);
            let token = read_token(&token_var)
                .or_else(|| spec.token_fallback.and_then(read_token));

            let auth_var = format!("{}_AUTH_KIND", spec.env_prefix);
            let auth_kind = match env::var(&auth_var) {
                Ok(raw) => AuthKind::parse_or_bearer(&raw),
                Err(_) => spec.default_auth,
            };

            tracing::info!(
                consumer = spec.key,
                url = %url,
                has_token = token.is_some(),
                "Consumer registered"
            );

            consumers.push(ConsumerDescriptor {
                key: spec.key.to_string(),
                label: spec.label.to_string(),
                url,
                token,
                auth_kind,
            });
        }

        Ok(Self { consumers })
    }

    pub fn get(&self, key: &str) -> Option<&ConsumerDescriptor> {
        self.consumers.iter().find(|c| c.key == key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConsumerDescriptor> {
        self.consumers.iter()
    }

    pub fn len(&self) -> usize {
        self.consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }
}

fn read_token(var: &str) -> Option<String> {
    let value = env::var(var).ok()?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.to_string())
}

/// Validate an absolute http(s) URL and strip trailing path slashes,
/// preserving `/` for the root and any query or fragment.
pub fn normalize_consumer_url(raw: &str) -> Result<String, String> {
    let mut url = reqwest::Url::parse(raw).map_err(|e| format!("not an absolute URL: {e}"))?;

    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(format!("unsupported scheme '{}'", url.scheme()));
    }

    let trimmed = url.path().trim_end_matches('/').to_string();
    if trimmed.is_empty() {
        url.set_path("/");
    } else {
        url.set_path(&trimmed);
    }

    Ok(url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_strips_trailing_path_slashes() {
        assert_eq!(
            normalize_consumer_url("https://example.org/events/").unwrap(),
            "https://example.org/events"
        );
        assert_eq!(
            normalize_consumer_url("https://example.org/a/b///").unwrap(),
            "https://example.org/a/b"
        );
    }

    #[test]
    fn test_normalize_preserves_root_slash() {
        assert_eq!(
            normalize_consumer_url("https://example.org/").unwrap(),
            "https://example.org/"
        );
        assert_eq!(
            normalize_consumer_url("https://example.org").unwrap(),
            "https://example.org/"
        );
    }

    #[test]
    fn test_normalize_preserves_query_and_fragment() {
        assert_eq!(
            normalize_consumer_url("https://example.org/hook/?key=1#frag").unwrap(),
            "https://example.org/hook?key=1#frag"
        );
    }

    #[test]
    fn test_relative_and_non_http_urls_are_rejected() {
        assert!(normalize_consumer_url("/events").is_err());
        assert!(normalize_consumer_url("not a url").is_err());
        assert!(normalize_consumer_url("ftp://example.org/events").is_err());
    }

    #[test]
    fn test_bearer_auth_header() {
        let consumer = ConsumerDescriptor {
            key: "heimgeist".to_string(),
            label: "Heimgeist".to_string(),
            url: "https://example.org/events".to_string(),
            token: Some("secret".to_string()),
            auth_kind: AuthKind::Bearer,
        };
        assert_eq!(
            consumer.auth_header(),
            Some(("Authorization", "Bearer secret".to_string()))
        );
    }

    #[test]
    fn test_x_auth_header() {
        let consumer = ConsumerDescriptor {
            key: "semantah".to_string(),
            label: "semantAH".to_string(),
            url: "https://example.org/events".to_string(),
            token: Some("secret".to_string()),
            auth_kind: AuthKind::XAuth,
        };
        assert_eq!(consumer.auth_header(), Some(("X-Auth", "secret".to_string())));
    }

    #[test]
    fn test_no_header_without_token() {
        let consumer = ConsumerDescriptor {
            key: "heimgeist".to_string(),
            label: "Heimgeist".to_string(),
            url: "https://example.org/events".to_string(),
            token: None,
            auth_kind: AuthKind::Bearer,
        };
        assert_eq!(consumer.auth_header(), None);
    }

    #[test]
    fn test_unknown_auth_kind_defaults_to_bearer() {
        assert_eq!(AuthKind::parse_or_bearer("basic"), AuthKind::Bearer);
        assert_eq!(AuthKind::parse_or_bearer("x-auth"), AuthKind::XAuth);
        assert_eq!(AuthKind::parse_or_bearer("Bearer"), AuthKind::Bearer);
    }

    fn clear_consumer_env() {
        for prefix in ["HEIMGEIST", "HAUSKI", "SEMANTAH", "WGX"] {
            env::remove_var(format!("{prefix}_URL"));
            env::remove_var(format!("{prefix}_TOKEN"));
            env::remove_var(format!("{prefix}_AUTH_KIND"));
        }
        env::remove_var("HAUSKI_EVENTS_TOKEN");
        env::remove_var("WGX_EVENTS_TOKEN");
    }

    #[test]
    #[serial_test::serial]
    fn test_from_env_skips_consumers_without_url() {
        clear_consumer_env();
        env::set_var("HEIMGEIST_URL", "https://heimgeist.example.org/events/");

        let registry = ConsumerRegistry::from_env().unwrap();
        assert_eq!(registry.len(), 1);

        let heimgeist = registry.get("heimgeist").unwrap();
        assert_eq!(heimgeist.url, "https://heimgeist.example.org/events");
        assert_eq!(heimgeist.token, None);
        assert_eq!(heimgeist.auth_kind, AuthKind::Bearer);
        clear_consumer_env();
    }

    #[test]
    #[serial_test::serial]
    fn test_from_env_uses_events_token_fallback() {
        clear_consumer_env();
        env::set_var("HAUSKI_URL", "https://hauski.example.org/events");
        env::set_var("HAUSKI_EVENTS_TOKEN", "fallback-token");

        let registry = ConsumerRegistry::from_env().unwrap();
        let hauski = registry.get("hauski").unwrap();
        assert_eq!(hauski.token.as_deref(), Some("fallback-token"));

        // A direct token wins over the fallback
        env::set_var("HAUSKI_TOKEN", "direct-token");
        let registry = ConsumerRegistry::from_env().unwrap();
        let hauski = registry.get("hauski").unwrap();
        assert_eq!(hauski.token.as_deref(), Some("direct-token"));
        clear_consumer_env();
    }

    #[test]
    #[serial_test::serial]
    fn test_from_env_rejects_invalid_url() {
        clear_consumer_env();
        env::set_var("SEMANTAH_URL", "not a url");
        assert!(ConsumerRegistry::from_env().is_err());
        clear_consumer_env();
    }

    #[test]
    #[serial_test::serial]
    fn test_from_env_honours_auth_kind_override() {
        clear_consumer_env();
        env::set_var("HEIMGEIST_URL", "https://heimgeist.example.org/events");
        env::set_var("HEIMGEIST_AUTH_KIND", "x-auth");

        let registry = ConsumerRegistry::from_env().unwrap();
        assert_eq!(registry.get("heimgeist").unwrap().auth_kind, AuthKind::XAuth);
        clear_consumer_env();
    }

    #[test]
    #[serial_test::serial]
    fn test_from_env_ignores_blank_tokens() {
        clear_consumer_env();
        env::set_var("SEMANTAH_URL", "https://semantah.example.org/events");
        env::set_var("SEMANTAH_TOKEN", "   ");

        let registry = ConsumerRegistry::from_env().unwrap();
        assert_eq!(registry.get("semantah").unwrap().token, None);
        clear_consumer_env();
    }

    #[test]
    fn test_registry_lookup() {
        let registry = ConsumerRegistry::new(vec![ConsumerDescriptor {
            key: "heimgeist".to_string(),
            label: "Heimgeist".to_string(),
            url: "https://example.org/events".to_string(),
            token: None,
            auth_kind: AuthKind::Bearer,
        }]);

        assert!(registry.get("heimgeist").is_some());
        assert!(registry.get("hauski").is_none());
        assert_eq!(registry.len(), 1);
    }
}
