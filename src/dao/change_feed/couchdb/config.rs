use std::{env, time::Duration};

use super::error::{CouchDaoError, CouchResult};

/// Server-side wait for a `_changes` long-poll before it returns empty.
const DEFAULT_FEED_TIMEOUT: Duration = Duration::from_secs(25);

/// Where the change-feed database lives and how feeds poll it.
#[derive(Debug, Clone)]
pub struct CouchConfig {
    /// Server root, e.g. `http://localhost:5984`.
    pub base_url: String,
    /// Database holding every collection.
    pub database: String,
    /// Basic auth user, sent together with [`Self::password`].
    pub username: Option<String>,
    /// Basic auth password.
    pub password: Option<String>,
    /// How long a single `_changes` long-poll may block on the server.
    pub feed_timeout: Duration,
}

impl CouchConfig {
    /// Anonymous access with the default feed timeout.
    pub fn new(base_url: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            database: database.into(),
            username: None,
            password: None,
            feed_timeout: DEFAULT_FEED_TIMEOUT,
        }
    }

    /// Use basic auth for every request.
    pub fn with_credentials(
        self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
            ..self
        }
    }

    /// Override how long a `_changes` long-poll may block.
    pub fn with_feed_timeout(self, feed_timeout: Duration) -> Self {
        Self {
            feed_timeout,
            ..self
        }
    }

    /// Read `COUCH_BASE_URL` and `COUCH_DB`, plus optional `COUCH_USERNAME` /
    /// `COUCH_PASSWORD` and `COUCH_FEED_TIMEOUT_MS`.
    pub fn from_env() -> CouchResult<Self> {
        let mut config = Self::new(required("COUCH_BASE_URL")?, required("COUCH_DB")?);

        if let (Ok(username), Ok(password)) = (env::var("COUCH_USERNAME"), env::var("COUCH_PASSWORD"))
        {
            config = config.with_credentials(username, password);
        }
        if let Ok(raw) = env::var("COUCH_FEED_TIMEOUT_MS") {
            config = config.with_feed_timeout(parse_millis("COUCH_FEED_TIMEOUT_MS", raw)?);
        }
        Ok(config)
    }
}

fn required(var: &'static str) -> CouchResult<String> {
    env::var(var).map_err(|_| CouchDaoError::MissingEnvVar { var })
}

fn parse_millis(var: &'static str, raw: String) -> CouchResult<Duration> {
    match raw.trim().parse::<u64>() {
        Ok(millis) => Ok(Duration::from_millis(millis)),
        Err(_) => Err(CouchDaoError::InvalidEnvVar { var, value: raw }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_keeps_connection_fields() {
        let config = CouchConfig::new("http://localhost:5984", "chess")
            .with_credentials("admin", "secret")
            .with_feed_timeout(Duration::from_secs(5));
        assert_eq!(config.database, "chess");
        assert_eq!(config.username.as_deref(), Some("admin"));
        assert_eq!(config.feed_timeout, Duration::from_secs(5));
    }

    #[test]
    fn feed_timeout_must_be_numeric() {
        assert_eq!(
            parse_millis("COUCH_FEED_TIMEOUT_MS", " 1500 ".into()).unwrap(),
            Duration::from_millis(1500)
        );
        assert!(matches!(
            parse_millis("COUCH_FEED_TIMEOUT_MS", "soon".into()),
            Err(CouchDaoError::InvalidEnvVar { value, .. }) if value == "soon"
        ));
    }
}
