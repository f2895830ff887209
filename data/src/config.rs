use crate::{InternalError, data_path, history, util::ok_or_default};

use serde::{Deserialize, Serialize};
use url::Url;

use std::time::Duration;

pub const CONFIG_FILE: &str = "config.json";

const DEFAULT_API_URL: &str = "http://127.0.0.1:8000";
const RECONNECT_DELAY: Duration = Duration::from_secs(3);
const FORECAST_INTERVAL: Duration = Duration::from_secs(30);
const FORECAST_MIN_POINTS: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_url: Url,
    /// Streaming endpoint; derived from `api_url` when unset.
    #[serde(deserialize_with = "ok_or_default")]
    pub stream_url: Option<Url>,
    pub history_capacity: usize,
    pub reconnect_delay: Duration,
    pub forecast_interval: Duration,
    /// Minimum buffered points before forecasts are requested.
    pub forecast_min_points: usize,
    pub show_forecast: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            api_url: default_api_url(),
            stream_url: None,
            history_capacity: history::DEFAULT_CAPACITY,
            reconnect_delay: RECONNECT_DELAY,
            forecast_interval: FORECAST_INTERVAL,
            forecast_min_points: FORECAST_MIN_POINTS,
            show_forecast: true,
        }
    }
}

fn default_api_url() -> Url {
    Url::parse(DEFAULT_API_URL).expect("Default API URL is valid")
}

impl Config {
    /// Reads `config.json` from the data folder, then applies environment overrides.
    ///
    /// A missing file yields defaults; a corrupted one is backed up and replaced by
    /// defaults so a bad edit never keeps the dashboard from starting.
    pub fn load() -> Result<Self, InternalError> {
        let config = match crate::read_from_file::<Config>(CONFIG_FILE) {
            Ok(config) => config,
            Err(e) if e.is_not_found() => {
                log::info!("No {CONFIG_FILE} found, using defaults");
                Config::default()
            }
            Err(e) => {
                log::warn!("Failed to read {CONFIG_FILE}: {e}; using defaults");
                Config::default()
            }
        };

        config.with_env_overrides()
    }

    fn with_env_overrides(mut self) -> Result<Self, InternalError> {
        if let Ok(api) = std::env::var("INSIGHT_API_URL") {
            self.api_url = Url::parse(&api)
                .map_err(|e| InternalError::Config(format!("INSIGHT_API_URL {api:?}: {e}")))?;
        }
        if let Ok(stream) = std::env::var("INSIGHT_STREAM_URL") {
            self.stream_url = Some(Url::parse(&stream).map_err(|e| {
                InternalError::Config(format!("INSIGHT_STREAM_URL {stream:?}: {e}"))
            })?);
        }
        Ok(self)
    }

    /// `ws(s)://<api host>/ws` unless an explicit stream URL is configured.
    pub fn stream_url(&self) -> Result<Url, InternalError> {
        if let Some(url) = &self.stream_url {
            return Ok(url.clone());
        }

        let scheme = match self.api_url.scheme() {
            "https" => "wss",
            "http" => "ws",
            other => {
                return Err(InternalError::Config(format!(
                    "Cannot derive stream URL from {other:?} API URL"
                )));
            }
        };

        let mut url = self.api_url.clone();
        url.set_scheme(scheme)
            .map_err(|_| InternalError::Config(format!("Invalid stream scheme: {scheme}")))?;
        url.set_path("/ws");
        url.set_query(None);
        url.set_fragment(None);
        Ok(url)
    }

    pub fn save(&self) -> Result<(), InternalError> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| InternalError::Config(e.to_string()))?;
        crate::write_json_to_file(&json, CONFIG_FILE)
            .map_err(|e| InternalError::Config(format!("{:?}: {e}", data_path(Some(CONFIG_FILE)))))
    }
}
