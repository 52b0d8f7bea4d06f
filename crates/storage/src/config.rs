use std::str::FromStr;
use std::time::Duration;

use strata_watch::BroadcasterConfig;

/// Where watch events come from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EventSource {
    /// The engine's own write path broadcasts each committed write.
    #[default]
    Local,
    /// A relay task consumes the backend's change stream.
    Remote,
}

impl FromStr for EventSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "local" => Ok(EventSource::Local),
            "remote" => Ok(EventSource::Remote),
            other => Err(format!("unknown event source: {} (expected local or remote)", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub watch: BroadcasterConfig,
    pub event_source: EventSource,
    /// Backend page size for unlimited lists and counts.
    pub list_page_size: i64,
    /// Pause before the relay re-establishes a failed backend watch.
    pub relay_backoff: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            watch: BroadcasterConfig::default(),
            event_source: EventSource::Local,
            list_page_size: 500,
            relay_backoff: Duration::from_millis(500),
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `STRATA_*` environment variables. Unparsable
    /// values fall back to the default.
    pub fn from_env() -> Self {
        let d = Self::default();
        let input_capacity = std::env::var("STRATA_WATCH_INPUT_CAP").ok().and_then(|s| s.parse().ok()).unwrap_or(d.watch.input_capacity);
        let output_capacity = std::env::var("STRATA_WATCH_OUTPUT_CAP").ok().and_then(|s| s.parse().ok()).unwrap_or(d.watch.output_capacity);
        let buffer_capacity = std::env::var("STRATA_WATCH_BUFFER").ok().and_then(|s| s.parse().ok()).unwrap_or(d.watch.buffer_capacity);
        let event_source = std::env::var("STRATA_EVENT_SOURCE").ok().and_then(|s| s.parse().ok()).unwrap_or(d.event_source);
        let list_page_size = std::env::var("STRATA_LIST_PAGE_SIZE")
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(d.list_page_size);
        let relay_backoff = std::env::var("STRATA_RELAY_BACKOFF_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(d.relay_backoff);
        Self {
            watch: BroadcasterConfig { input_capacity, output_capacity, buffer_capacity },
            event_source,
            list_page_size,
            relay_backoff,
        }
    }

    pub fn with_event_source(mut self, source: EventSource) -> Self {
        self.event_source = source;
        self
    }

    pub fn with_watch(mut self, watch: BroadcasterConfig) -> Self {
        self.watch = watch;
        self
    }

    pub fn with_list_page_size(mut self, size: i64) -> Self {
        self.list_page_size = size.max(1);
        self
    }

    pub fn with_relay_backoff(mut self, backoff: Duration) -> Self {
        self.relay_backoff = backoff;
        self
    }
}
