//! Remote host endpoint.

use crate::config::DEFAULT_SERVER_PORT;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    /// Stable server identity; several servers may share one host.
    pub id: u32,
    /// Smoothed server load, 0.0..1.0 (can exceed 1.0 when overloaded).
    #[serde(default)]
    pub load: f32,
}

impl Default for Endpoint {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: DEFAULT_SERVER_PORT,
            id: 0,
            load: 0.0,
        }
    }
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    pub fn id(mut self, id: u32) -> Self {
        self.id = id;
        self
    }

    /// `host:id`, or just the host for server id 0.
    pub fn host_and_id(&self) -> String {
        if self.id > 0 {
            format!("{}:{}", self.host, self.id)
        } else {
            self.host.clone()
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Folds a new load sample into the smoothed metric.
    pub fn record_load(&mut self, sample: f32, smoothing: f32) {
        let alpha = smoothing.clamp(0.0, 1.0);
        self.load = if self.load == 0.0 {
            sample
        } else {
            self.load + alpha * (sample - self.load)
        };
    }
}
