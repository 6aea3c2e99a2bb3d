use anyhow::{bail, Context, Result};
use secrecy::{ExposeSecret, SecretString};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tracing::warn;
use url::Url;

const MIN_SESSION_SECRET_LEN: usize = 32;
const MAX_PENDING_TTL_SECS: i64 = 24 * 3600;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: IpAddr,
    pub port: u16,
    pub session_secret: SecretString,
    pub client_id: String,
    pub client_secret: SecretString,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    pub authorize_url: String,
    pub token_url: String,
    pub api_base_url: String,
    pub whoami_path: String,
    pub api_revision: Option<String>,
    pub pending_ttl: chrono::Duration,
    pub http_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        // Local overrides win over the shared file; dotenvy never clobbers real env vars.
        dotenvy::from_filename(".env.local").ok();
        dotenvy::dotenv().ok();

        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build and validate a config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str, default: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        let client_id = lookup("CLIENT_ID").unwrap_or_default();
        let client_secret = lookup("CLIENT_SECRET").unwrap_or_default();

        let session_secret = match lookup("SESSION_SECRET").filter(|s| !s.is_empty()) {
            Some(secret) => secret,
            None => {
                warn!("SESSION_SECRET not set, generating an ephemeral one; sessions will not survive a restart");
                use rand::Rng;
                let secret: Vec<u8> = (0..32).map(|_| rand::thread_rng().gen()).collect();
                base64::Engine::encode(&base64::engine::general_purpose::STANDARD, secret)
            }
        };

        let api_revision = var("API_REVISION", "2025-07-15");

        let config = Self {
            host: var("HOST", "127.0.0.1").parse().context("Invalid HOST")?,
            port: var("PORT", "5000").parse().context("Invalid PORT")?,
            session_secret: SecretString::new(session_secret),
            client_id,
            client_secret: SecretString::new(client_secret),
            redirect_uri: var("REDIRECT_URI", "http://localhost:5000/auth/callback"),
            scopes: parse_scopes(&var("SCOPES", "accounts:read profiles:read")),
            authorize_url: var("AUTHORIZE_URL", "https://www.klaviyo.com/oauth/authorize"),
            token_url: var("TOKEN_URL", "https://a.klaviyo.com/oauth/token"),
            api_base_url: var("API_BASE_URL", "https://a.klaviyo.com/api")
                .trim_end_matches('/')
                .to_string(),
            whoami_path: var("WHOAMI_PATH", "accounts/"),
            api_revision: (api_revision != "none").then_some(api_revision),
            pending_ttl: var("PENDING_TTL_SECS", "600")
                .parse()
                .ok()
                .and_then(chrono::Duration::try_seconds)
                .context("Invalid PENDING_TTL_SECS")?,
            http_timeout: Duration::from_secs(
                var("HTTP_TIMEOUT_SECS", "30")
                    .parse()
                    .context("Invalid HTTP_TIMEOUT_SECS")?,
            ),
        };

        config.validate()?;
        Ok(config)
    }

    /// Config pointing every remote endpoint at a single base URL, for tests.
    pub fn for_testing(base_url: &str) -> Self {
        Self {
            host: IpAddr::from([127, 0, 0, 1]),
            port: 0,
            session_secret: SecretString::new("test-session-secret-that-is-long-enough".into()),
            client_id: "test-client".to_string(),
            client_secret: SecretString::new("test-secret".into()),
            redirect_uri: "http://localhost:5000/auth/callback".to_string(),
            scopes: vec!["accounts:read".to_string(), "profiles:read".to_string()],
            authorize_url: format!("{}/oauth/authorize", base_url),
            token_url: format!("{}/oauth/token", base_url),
            api_base_url: format!("{}/api", base_url),
            whoami_path: "accounts/".to_string(),
            api_revision: Some("2025-07-15".to_string()),
            pending_ttl: chrono::Duration::minutes(10),
            http_timeout: Duration::from_secs(5),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.client_id.trim().is_empty() {
            bail!("CLIENT_ID is required");
        }
        if self.client_secret.expose_secret().trim().is_empty() {
            bail!("CLIENT_SECRET is required");
        }
        if self.session_secret.expose_secret().len() < MIN_SESSION_SECRET_LEN {
            bail!(
                "SESSION_SECRET must be at least {} bytes",
                MIN_SESSION_SECRET_LEN
            );
        }
        if self.scopes.is_empty() {
            bail!("SCOPES must name at least one scope");
        }
        if self.pending_ttl <= chrono::Duration::zero()
            || self.pending_ttl.num_seconds() > MAX_PENDING_TTL_SECS
        {
            bail!(
                "PENDING_TTL_SECS must be between 1 and {}",
                MAX_PENDING_TTL_SECS
            );
        }
        for (name, value) in [
            ("REDIRECT_URI", &self.redirect_uri),
            ("AUTHORIZE_URL", &self.authorize_url),
            ("TOKEN_URL", &self.token_url),
            ("API_BASE_URL", &self.api_base_url),
        ] {
            Url::parse(value).with_context(|| format!("Invalid {}: {}", name, value))?;
        }
        Ok(())
    }

    pub fn scope_string(&self) -> String {
        self.scopes.join(" ")
    }

    pub fn server_address(&self) -> SocketAddr {
        (self.host, self.port).into()
    }
}

fn parse_scopes(raw: &str) -> Vec<String> {
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    #[test]
    fn applies_defaults() {
        let config = Config::from_lookup(lookup_from(&[
            ("CLIENT_ID", "abc"),
            ("CLIENT_SECRET", "xyz"),
            ("SESSION_SECRET", SECRET),
        ]))
        .unwrap();

        assert_eq!(config.port, 5000);
        assert_eq!(config.redirect_uri, "http://localhost:5000/auth/callback");
        assert_eq!(config.scopes, vec!["accounts:read", "profiles:read"]);
        assert_eq!(config.pending_ttl, chrono::Duration::minutes(10));
        assert_eq!(config.http_timeout, Duration::from_secs(30));
        assert_eq!(config.api_revision.as_deref(), Some("2025-07-15"));
    }

    #[test]
    fn requires_client_credentials() {
        let err = Config::from_lookup(lookup_from(&[("SESSION_SECRET", SECRET)])).unwrap_err();
        assert!(err.to_string().contains("CLIENT_ID"));

        let err = Config::from_lookup(lookup_from(&[
            ("CLIENT_ID", "abc"),
            ("SESSION_SECRET", SECRET),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("CLIENT_SECRET"));
    }

    #[test]
    fn rejects_short_session_secret() {
        let err = Config::from_lookup(lookup_from(&[
            ("CLIENT_ID", "abc"),
            ("CLIENT_SECRET", "xyz"),
            ("SESSION_SECRET", "short"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("SESSION_SECRET"));
    }

    #[test]
    fn generates_session_secret_when_missing() {
        let config = Config::from_lookup(lookup_from(&[
            ("CLIENT_ID", "abc"),
            ("CLIENT_SECRET", "xyz"),
        ]))
        .unwrap();
        assert!(config.session_secret.expose_secret().len() >= MIN_SESSION_SECRET_LEN);
    }

    #[test]
    fn rejects_malformed_urls() {
        let err = Config::from_lookup(lookup_from(&[
            ("CLIENT_ID", "abc"),
            ("CLIENT_SECRET", "xyz"),
            ("SESSION_SECRET", SECRET),
            ("TOKEN_URL", "not a url"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("TOKEN_URL"));
    }

    #[test]
    fn bounds_pending_ttl() {
        for ttl in ["0", "86401", "99999999999999999", "soon"] {
            let err = Config::from_lookup(lookup_from(&[
                ("CLIENT_ID", "abc"),
                ("CLIENT_SECRET", "xyz"),
                ("SESSION_SECRET", SECRET),
                ("PENDING_TTL_SECS", ttl),
            ]))
            .unwrap_err();
            assert!(err.to_string().contains("PENDING_TTL_SECS"), "{}", ttl);
        }
    }

    #[test]
    fn parses_comma_and_space_separated_scopes() {
        assert_eq!(
            parse_scopes("accounts:read, lists:read  events:write"),
            vec!["accounts:read", "lists:read", "events:write"]
        );
    }
}
