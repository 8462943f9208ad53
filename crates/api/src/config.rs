use std::str::FromStr;
use std::time::Duration;

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Server configuration loaded from environment variables.
///
/// All fields have defaults suitable for running next to a local ComfyUI.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (default: `0.0.0.0`).
    pub host: String,
    /// Bind port (default: `8189`).
    pub port: u16,
    /// Backend HTTP base URL, no trailing slash.
    pub comfy_base_url: String,
    /// Backend WebSocket base URL, no trailing slash.
    pub comfy_ws_url: String,
    /// Shared secret callers present as `X-API-Key`. `None` disables auth.
    pub api_key: Option<String>,
    /// Allowed CORS origins, parsed from comma-separated `CORS_ORIGINS`.
    pub cors_origins: Vec<String>,
    /// Upper bound on how long a request waits for its job.
    pub job_timeout_secs: u64,
    /// How long shutdown waits for the backend queue to drain.
    pub shutdown_grace_secs: u64,
    pub log_format: LogFormat,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} must be {expected}, got {value:?}")]
    Invalid {
        var: &'static str,
        expected: &'static str,
        value: String,
    },
}

impl ServerConfig {
    /// Load configuration from the process environment.
    ///
    /// | Env Var               | Default                            |
    /// |-----------------------|------------------------------------|
    /// | `HOST`                | `0.0.0.0`                          |
    /// | `PORT`                | `8189`                             |
    /// | `COMFY_HOST`          | `127.0.0.1`                        |
    /// | `COMFY_PORT`          | `7337`                             |
    /// | `COMFY_BASE_URL`      | `http://{COMFY_HOST}:{COMFY_PORT}` |
    /// | `COMFY_WS_URL`        | `ws://{COMFY_HOST}:{COMFY_PORT}`   |
    /// | `COMFY_API_KEY`       | unset (auth disabled)              |
    /// | `CORS_ORIGINS`        | `http://localhost:5173`            |
    /// | `JOB_TIMEOUT_SECS`    | `600`                              |
    /// | `SHUTDOWN_GRACE_SECS` | `5`                                |
    /// | `LOG_FORMAT`          | `text` (`text` or `json`)          |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) over an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let host = var("HOST", "0.0.0.0");
        let port: u16 = parse(&lookup, "PORT", 8189, "a valid u16")?;

        let comfy_host = var("COMFY_HOST", "127.0.0.1");
        let comfy_port: u16 = parse(&lookup, "COMFY_PORT", 7337, "a valid u16")?;
        let comfy_base_url = lookup("COMFY_BASE_URL")
            .unwrap_or_else(|| format!("http://{comfy_host}:{comfy_port}"))
            .trim_end_matches('/')
            .to_string();
        let comfy_ws_url = lookup("COMFY_WS_URL")
            .unwrap_or_else(|| format!("ws://{comfy_host}:{comfy_port}"))
            .trim_end_matches('/')
            .to_string();

        let api_key = lookup("COMFY_API_KEY").filter(|key| !key.is_empty());

        let cors_origins: Vec<String> = var("CORS_ORIGINS", "http://localhost:5173")
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let job_timeout_secs: u64 = parse(&lookup, "JOB_TIMEOUT_SECS", 600, "a valid u64")?;
        let shutdown_grace_secs: u64 = parse(&lookup, "SHUTDOWN_GRACE_SECS", 5, "a valid u64")?;

        let log_format = match lookup("LOG_FORMAT").as_deref().map(str::trim) {
            None | Some("") | Some("text") => LogFormat::Text,
            Some("json") => LogFormat::Json,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    var: "LOG_FORMAT",
                    expected: "`text` or `json`",
                    value: other.to_string(),
                })
            }
        };

        Ok(Self {
            host,
            port,
            comfy_base_url,
            comfy_ws_url,
            api_key,
            cors_origins,
            job_timeout_secs,
            shutdown_grace_secs,
            log_format,
        })
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
    expected: &'static str,
) -> Result<T, ConfigError> {
    match lookup(var) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid {
                var,
                expected,
                value,
            }),
    }
}
