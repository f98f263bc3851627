//! Server configuration from environment variables.
//!
//! | Variable        | Meaning                                   | Default        |
//! |-----------------|-------------------------------------------|----------------|
//! | `BIND_ADDR`     | Listen address                            | `0.0.0.0:4000` |
//! | `LOG_LEVEL`     | Tracing filter                            | `info`         |
//! | `FABRIC_URL`    | Redis URL enabling cross-instance relay   | unset = local  |
//! | `AUTH_ENABLED`  | `true`/`1` requires tokens on join        | disabled       |
//! | `AUTH_SECRET`   | HS256 secret (required when auth enabled) | —              |
//! | `AUTH_ISSUER`   | Expected `iss` claim                      | unchecked      |
//! | `AUTH_AUDIENCE` | Expected `aud` claim                      | unchecked      |

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub fabric_url: Option<String>,
    pub auth: Option<AuthSettings>,
}

#[derive(Debug, Clone)]
pub struct AuthSettings {
    pub secret: String,
    pub issuer: Option<String>,
    pub audience: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingVar(&'static str),
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bind_addr = lookup("BIND_ADDR").unwrap_or_else(|| "0.0.0.0:4000".to_owned());
        let fabric_url = lookup("FABRIC_URL").filter(|url| !url.is_empty());

        let auth_enabled = lookup("AUTH_ENABLED")
            .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
            .unwrap_or(false);
        let auth = if auth_enabled {
            let secret = lookup("AUTH_SECRET")
                .filter(|s| !s.is_empty())
                .ok_or(ConfigError::MissingVar("AUTH_SECRET"))?;
            Some(AuthSettings {
                secret,
                issuer: lookup("AUTH_ISSUER").filter(|s| !s.is_empty()),
                audience: lookup("AUTH_AUDIENCE").filter(|s| !s.is_empty()),
            })
        } else {
            None
        };

        Ok(ServerConfig {
            bind_addr,
            fabric_url,
            auth,
        })
    }
}
