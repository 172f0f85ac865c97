//! Client configuration.
//!
//! The engine consumes these values but does not persist them; host integrations
//! load them from wherever they keep settings.

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_CLIENT_PORT: u16 = 55055;
pub const DEFAULT_SERVER_PORT: u16 = 55056;
pub const DEFAULT_NUM_OF_BUFFERS: usize = 8;
pub const DEFAULT_NUM_RECENTS: usize = 10;
pub const DEFAULT_LOAD_PLUGIN_TIMEOUT_SECS: u64 = 15;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server_port: u16,
    /// Reported to the server in the channel hello, for its logs.
    pub client_port: u16,
    /// Audio frames buffered ahead of the real-time callback.
    pub buffer_depth: usize,
    pub num_recents: usize,
    pub load_plugin_timeout_secs: u64,
    pub request_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub audio_lock_retries: u32,
    pub audio_lock_retry_interval_ms: u64,
    pub screen_join_timeout_ms: u64,
    pub max_frame_size: usize,
    /// EMA factor applied to each new load sample (1.0 = no smoothing).
    pub load_smoothing: f32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_port: DEFAULT_SERVER_PORT,
            client_port: DEFAULT_CLIENT_PORT,
            buffer_depth: DEFAULT_NUM_OF_BUFFERS,
            num_recents: DEFAULT_NUM_RECENTS,
            load_plugin_timeout_secs: DEFAULT_LOAD_PLUGIN_TIMEOUT_SECS,
            request_timeout_ms: 5000,
            connect_timeout_ms: 3000,
            audio_lock_retries: 10,
            audio_lock_retry_interval_ms: 1,
            screen_join_timeout_ms: 1000,
            max_frame_size: 64 * 1024 * 1024,
            load_smoothing: 0.5,
        }
    }
}

impl ClientConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn screen_join_timeout(&self) -> Duration {
        Duration::from_millis(self.screen_join_timeout_ms)
    }

    pub fn audio_lock_retry_interval(&self) -> Duration {
        Duration::from_millis(self.audio_lock_retry_interval_ms)
    }
}
