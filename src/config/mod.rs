use serde::Deserialize;

/// Complete feedgate configuration
#[derive(Debug, Clone, Deserialize)]
pub struct FeedgateConfig {
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub services: ServicesConfig,
    #[serde(default)]
    pub request: RequestConfig,
}

/// Channel sizing for the distribution core
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Capacity of the inbound feed channel
    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,
    /// Capacity of the update/notice broadcast channels
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
}

fn default_event_queue_capacity() -> usize {
    1024
}

fn default_broadcast_capacity() -> usize {
    1000
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            event_queue_capacity: default_event_queue_capacity(),
            broadcast_capacity: default_broadcast_capacity(),
        }
    }
}

/// Provider service names
#[derive(Debug, Clone, Deserialize)]
pub struct ServicesConfig {
    #[serde(default = "default_auth_service")]
    pub auth_service: String,
    #[serde(default = "default_data_service")]
    pub data_service: String,
}

fn default_auth_service() -> String {
    "//provider/apiauth".to_string()
}

fn default_data_service() -> String {
    "//provider/refdata".to_string()
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            auth_service: default_auth_service(),
            data_service: default_data_service(),
        }
    }
}

/// Data request defaults
#[derive(Debug, Clone, Deserialize)]
pub struct RequestConfig {
    /// Fields requested when the caller does not name any
    #[serde(default = "default_fields")]
    pub default_fields: Vec<String>,
}

fn default_fields() -> Vec<String> {
    vec!["LAST_PRICE".to_string(), "BID".to_string(), "ASK".to_string()]
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            default_fields: default_fields(),
        }
    }
}

impl Default for FeedgateConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            services: ServicesConfig::default(),
            request: RequestConfig::default(),
        }
    }
}

impl FeedgateConfig {
    /// Apply FEEDGATE_* environment overrides on top of the loaded values.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("FEEDGATE_AUTH_SERVICE") {
            if !v.is_empty() {
                self.services.auth_service = v;
            }
        }
        if let Ok(v) = std::env::var("FEEDGATE_DATA_SERVICE") {
            if !v.is_empty() {
                self.services.data_service = v;
            }
        }
        if let Ok(v) = std::env::var("FEEDGATE_BROADCAST_CAPACITY") {
            if let Ok(n) = v.parse::<usize>() {
                self.session.broadcast_capacity = n;
            }
        }
        if let Ok(v) = std::env::var("FEEDGATE_EVENT_QUEUE_CAPACITY") {
            if let Ok(n) = v.parse::<usize>() {
                self.session.event_queue_capacity = n;
            }
        }
    }
}

/// Load configuration from TOML file
pub fn load_config(path: &str) -> Result<FeedgateConfig, Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(path)?;
    let config: FeedgateConfig = toml::from_str(&contents)?;
    Ok(config)
}
