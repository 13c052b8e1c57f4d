//! Environment-style session settings.
//!
//! These knobs are consulted each time a request or session starts rather
//! than once at boot. Production reads the process environment; tests hand
//! the server an in-memory map so they never touch global state.

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use tracing::warn;

/// Boolean-ish switch for hostname announcements.
pub const SEND_SERVER_HOSTNAME: &str = "SEND_SERVER_HOSTNAME";

/// Per-request override of [`SEND_SERVER_HOSTNAME`].
pub const SEND_SERVER_HOSTNAME_HEADER: &str = "x-send-server-hostname";

/// Log request headers when set to any non-empty value.
pub const LOG_HTTP_HEADERS: &str = "LOG_HTTP_HEADERS";

/// Hex dump request bodies when set to any non-empty value.
pub const LOG_HTTP_BODY: &str = "LOG_HTTP_BODY";

/// Prefix of variables that become extra response headers.
pub const SEND_HEADER_PREFIX: &str = "SEND_HEADER_";

/// Source of environment-style key/value settings.
pub trait EnvSource: Send + Sync {
    /// Look up a single key.
    fn var(&self, key: &str) -> Option<String>;

    /// All key/value pairs, in no particular order.
    fn vars(&self) -> Vec<(String, String)>;
}

/// The process environment.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }

    fn vars(&self) -> Vec<(String, String)> {
        // Non-unicode entries can't name a header or a knob; skip them.
        std::env::vars_os()
            .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
            .collect()
    }
}

/// Fixed key/value settings for tests.
#[cfg(test)]
#[derive(Debug, Default, Clone)]
pub struct MapEnv(std::collections::HashMap<String, String>);

#[cfg(test)]
impl MapEnv {
    pub fn from_pairs<const N: usize>(pairs: [(&str, &str); N]) -> Self {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }
}

#[cfg(test)]
impl EnvSource for MapEnv {
    fn var(&self, key: &str) -> Option<String> {
        self.0.get(key).cloned()
    }

    fn vars(&self) -> Vec<(String, String)> {
        self.0
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// True when `key` is present with a non-empty value.
pub fn flag_set(env: &dyn EnvSource, key: &str) -> bool {
    env.var(key).is_some_and(|v| !v.is_empty())
}

/// Decide whether this request gets a hostname announcement.
///
/// A non-empty `X-Send-Server-Hostname` header replaces the environment
/// value. Only a value equal to `false` (any case) disables the
/// announcement; absence and every other value enable it.
pub fn hostname_enabled(env: &dyn EnvSource, headers: &HeaderMap) -> bool {
    let header = headers
        .get(SEND_SERVER_HOSTNAME_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty());

    let value = match header {
        Some(v) => v.to_string(),
        None => env.var(SEND_SERVER_HOSTNAME).unwrap_or_default(),
    };

    !value.eq_ignore_ascii_case("false")
}

/// Extra response headers from `SEND_HEADER_<NAME>` variables.
///
/// `SEND_HEADER_X_CUSTOM_THING=1` becomes `X-Custom-Thing: 1`. Entries are
/// sorted by variable name so repeated requests see a stable order.
pub fn extra_headers(env: &dyn EnvSource) -> Vec<(HeaderName, HeaderValue)> {
    let mut vars: Vec<(String, String)> = env
        .vars()
        .into_iter()
        .filter(|(k, _)| k.starts_with(SEND_HEADER_PREFIX))
        .collect();
    vars.sort();

    let mut headers = Vec::with_capacity(vars.len());
    for (key, value) in vars {
        let name = key[SEND_HEADER_PREFIX.len()..].replace('_', "-");
        match (
            HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) {
            (Ok(name), Ok(value)) => headers.push((name, value)),
            _ => warn!(variable = %key, "Skipping invalid response header"),
        }
    }
    headers
}
