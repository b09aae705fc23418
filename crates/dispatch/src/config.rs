use std::str::FromStr;
use std::time::Duration;

use scanfleet_node::capability::ProtocolVersion;

use crate::error::DispatchError;

/// Dispatcher configuration.
///
/// Built from environment variables via [`DispatchConfig::from_env`] or
/// from a node list via [`DispatchConfig::new`], which applies the same
/// defaults.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Node base URLs, trailing slashes removed.
    pub node_urls: Vec<String>,
    /// Sent as the `apikey` header on every request when set.
    pub api_key: Option<String>,
    /// Peer protocol version of the nodes.
    pub protocol: ProtocolVersion,
    /// Timeout applied to each individual HTTP request.
    pub request_timeout: Duration,
    /// Delay between two polls of a running job.
    pub poll_interval: Duration,
    /// Upper bound on the polling phase of a single job.
    pub scan_deadline: Duration,
    /// Dwell time after which an advisory rebalance is considered.
    pub min_node_time: Duration,
    /// Dwell time after which a rotation is forced.
    pub max_node_time: Duration,
    /// Pause taken instead of rotating when only one node is configured.
    pub single_node_pause: Duration,
    /// Extra capability fetch attempts per node at startup.
    pub startup_fetch_retries: u32,
    /// Delay between those attempts.
    pub startup_retry_delay: Duration,
    /// Bound on "find a node with active engines" loops. Defaults to
    /// twice the node count.
    pub max_selection_attempts: Option<usize>,
}

impl DispatchConfig {
    /// Configuration for the given nodes with default settings.
    pub fn new<I, S>(node_urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            node_urls: node_urls
                .into_iter()
                .map(|u| u.into().trim().trim_end_matches('/').to_string())
                .collect(),
            api_key: None,
            protocol: ProtocolVersion::V4,
            request_timeout: Duration::from_secs(40),
            poll_interval: Duration::from_millis(500),
            scan_deadline: Duration::from_secs(300),
            min_node_time: Duration::from_secs(60),
            max_node_time: Duration::from_secs(300),
            single_node_pause: Duration::from_secs(5),
            startup_fetch_retries: 5,
            startup_retry_delay: Duration::from_secs(10),
            max_selection_attempts: None,
        }
    }

    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                       | Default            |
    /// |-------------------------------|--------------------|
    /// | `SCAN_NODE_URLS`              | required           |
    /// | `SCAN_NODE_API_KEY`           | unset              |
    /// | `SCAN_NODE_PROTOCOL`          | `4`                |
    /// | `SCAN_NODE_TIMEOUT_SECS`      | `40`               |
    /// | `SCAN_POLL_INTERVAL_MS`       | `500`              |
    /// | `SCAN_DEADLINE_SECS`          | `300`              |
    /// | `SCAN_MIN_NODE_TIME_SECS`     | `60`               |
    /// | `SCAN_MAX_NODE_TIME_SECS`     | `300`              |
    /// | `SCAN_SINGLE_NODE_PAUSE_MS`   | `5000`             |
    /// | `SCAN_STARTUP_FETCH_RETRIES`  | `5`                |
    /// | `SCAN_STARTUP_RETRY_DELAY_MS` | `10000`            |
    /// | `SCAN_MAX_SELECTION_ATTEMPTS` | twice the node count |
    pub fn from_env() -> Result<Self, DispatchError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, DispatchError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let urls = lookup("SCAN_NODE_URLS").ok_or_else(|| {
            DispatchError::StartupConfiguration("SCAN_NODE_URLS must be set".into())
        })?;
        let mut config = Self::new(urls.split(',').filter(|u| !u.trim().is_empty()));

        config.api_key = lookup("SCAN_NODE_API_KEY").filter(|k| !k.is_empty());
        config.protocol = parse_var(&lookup, "SCAN_NODE_PROTOCOL", config.protocol)?;
        config.request_timeout = Duration::from_secs(parse_var(
            &lookup,
            "SCAN_NODE_TIMEOUT_SECS",
            config.request_timeout.as_secs(),
        )?);
        config.poll_interval = Duration::from_millis(parse_var(
            &lookup,
            "SCAN_POLL_INTERVAL_MS",
            config.poll_interval.as_millis() as u64,
        )?);
        config.scan_deadline = Duration::from_secs(parse_var(
            &lookup,
            "SCAN_DEADLINE_SECS",
            config.scan_deadline.as_secs(),
        )?);
        config.min_node_time = Duration::from_secs(parse_var(
            &lookup,
            "SCAN_MIN_NODE_TIME_SECS",
            config.min_node_time.as_secs(),
        )?);
        config.max_node_time = Duration::from_secs(parse_var(
            &lookup,
            "SCAN_MAX_NODE_TIME_SECS",
            config.max_node_time.as_secs(),
        )?);
        config.single_node_pause = Duration::from_millis(parse_var(
            &lookup,
            "SCAN_SINGLE_NODE_PAUSE_MS",
            config.single_node_pause.as_millis() as u64,
        )?);
        config.startup_fetch_retries = parse_var(
            &lookup,
            "SCAN_STARTUP_FETCH_RETRIES",
            config.startup_fetch_retries,
        )?;
        config.startup_retry_delay = Duration::from_millis(parse_var(
            &lookup,
            "SCAN_STARTUP_RETRY_DELAY_MS",
            config.startup_retry_delay.as_millis() as u64,
        )?);
        config.max_selection_attempts = lookup("SCAN_MAX_SELECTION_ATTEMPTS")
            .map(|v| parse_value("SCAN_MAX_SELECTION_ATTEMPTS", &v))
            .transpose()?;

        config.validate()?;
        Ok(config)
    }

    /// Check the node list and timing settings.
    pub fn validate(&self) -> Result<(), DispatchError> {
        if self.node_urls.is_empty() {
            return Err(DispatchError::StartupConfiguration(
                "at least one scan node URL is required".into(),
            ));
        }

        for url in &self.node_urls {
            let parsed = reqwest::Url::parse(url).map_err(|e| {
                DispatchError::StartupConfiguration(format!("invalid node URL {url:?}: {e}"))
            })?;
            if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
                return Err(DispatchError::StartupConfiguration(format!(
                    "node URL {url:?} must be an http(s) URL with a host"
                )));
            }
        }

        if self.poll_interval.is_zero() {
            return Err(DispatchError::StartupConfiguration(
                "poll interval must be non-zero".into(),
            ));
        }
        if self.min_node_time > self.max_node_time {
            return Err(DispatchError::StartupConfiguration(format!(
                "min node time ({:?}) exceeds max node time ({:?})",
                self.min_node_time, self.max_node_time
            )));
        }
        if self.max_selection_attempts == Some(0) {
            return Err(DispatchError::StartupConfiguration(
                "max selection attempts must be at least 1".into(),
            ));
        }

        Ok(())
    }

    /// Effective bound on node selection loops.
    pub fn selection_attempts(&self) -> usize {
        self.max_selection_attempts
            .unwrap_or(self.node_urls.len() * 2)
            .max(1)
    }
}

fn parse_var<F, T>(lookup: &F, key: &str, default: T) -> Result<T, DispatchError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(value) => parse_value(key, &value),
        None => Ok(default),
    }
}

fn parse_value<T>(key: &str, value: &str) -> Result<T, DispatchError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| DispatchError::StartupConfiguration(format!("{key} is invalid: {e}")))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply() {
        let config =
            DispatchConfig::from_lookup(lookup(&[("SCAN_NODE_URLS", "http://a:8008/, http://b:8008")]))
                .unwrap();
        assert_eq!(config.node_urls, ["http://a:8008", "http://b:8008"]);
        assert_eq!(config.protocol, ProtocolVersion::V4);
        assert_eq!(config.request_timeout, Duration::from_secs(40));
        assert_eq!(config.poll_interval, Duration::from_millis(500));
        assert_eq!(config.selection_attempts(), 4);
        assert!(config.api_key.is_none());
    }

    #[test]
    fn overrides_apply() {
        let config = DispatchConfig::from_lookup(lookup(&[
            ("SCAN_NODE_URLS", "http://a:8008"),
            ("SCAN_NODE_API_KEY", "secret"),
            ("SCAN_NODE_PROTOCOL", "3"),
            ("SCAN_MIN_NODE_TIME_SECS", "10"),
            ("SCAN_MAX_NODE_TIME_SECS", "20"),
            ("SCAN_MAX_SELECTION_ATTEMPTS", "7"),
        ]))
        .unwrap();
        assert_eq!(config.api_key.as_deref(), Some("secret"));
        assert_eq!(config.protocol, ProtocolVersion::V3);
        assert_eq!(config.min_node_time, Duration::from_secs(10));
        assert_eq!(config.selection_attempts(), 7);
    }

    #[test]
    fn missing_node_list_is_fatal() {
        let err = DispatchConfig::from_lookup(lookup(&[])).unwrap_err();
        assert_matches!(err, DispatchError::StartupConfiguration(_));
    }

    #[test]
    fn empty_node_list_is_fatal() {
        let err = DispatchConfig::from_lookup(lookup(&[("SCAN_NODE_URLS", " , ")])).unwrap_err();
        assert_matches!(err, DispatchError::StartupConfiguration(_));
    }

    #[test]
    fn malformed_node_url_is_fatal() {
        let err = DispatchConfig::new(["node-a:8008"]).validate().unwrap_err();
        assert_matches!(err, DispatchError::StartupConfiguration(_));
    }

    #[test]
    fn unparseable_number_is_fatal() {
        let err = DispatchConfig::from_lookup(lookup(&[
            ("SCAN_NODE_URLS", "http://a"),
            ("SCAN_POLL_INTERVAL_MS", "fast"),
        ]))
        .unwrap_err();
        assert_matches!(err, DispatchError::StartupConfiguration(msg) if msg.contains("SCAN_POLL_INTERVAL_MS"));
    }

    #[test]
    fn inverted_dwell_bounds_are_fatal() {
        let mut config = DispatchConfig::new(["http://a"]);
        config.min_node_time = Duration::from_secs(600);
        assert_matches!(config.validate(), Err(DispatchError::StartupConfiguration(_)));
    }
}
