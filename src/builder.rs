//! Builder for configuring and connecting a [`Session`].

use crate::client::{ClientConfig, Endpoint, InitParams, Result, ScreenImage, Session};
use std::sync::Arc;

type Callback = Box<dyn Fn() + Send + Sync>;
type ScreenFn = Box<dyn Fn(Arc<ScreenImage>, u32, u32) + Send + Sync>;

/// Callbacks are installed before the first connection attempt, so `on_connect`
/// sees the initial transition to ready.
///
/// # Example
///
/// ```ignore
/// use remotefx::prelude::*;
///
/// let session = SessionBuilder::new(Endpoint::new("studio-box", 55056))
///     .channels(2, 2)
///     .sample_rate(48000.0)
///     .block_size(256)
///     .on_close(|| eprintln!("remote host went away"))
///     .connect()?;
/// ```
pub struct SessionBuilder {
    endpoint: Endpoint,
    config: ClientConfig,
    params: InitParams,
    on_connect: Option<Callback>,
    on_close: Option<Callback>,
    on_screen: Option<ScreenFn>,
}

impl SessionBuilder {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            config: ClientConfig::default(),
            params: InitParams {
                channels_in: 2,
                channels_out: 2,
                sample_rate: 48000.0,
                block_size: 512,
                double_precision: false,
            },
            on_connect: None,
            on_close: None,
            on_screen: None,
        }
    }

    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Default: 2 in, 2 out
    pub fn channels(mut self, inputs: usize, outputs: usize) -> Self {
        self.params.channels_in = inputs;
        self.params.channels_out = outputs;
        self
    }

    /// Default: 48000
    pub fn sample_rate(mut self, rate: f64) -> Self {
        self.params.sample_rate = rate;
        self
    }

    /// Default: 512
    pub fn block_size(mut self, frames: usize) -> Self {
        self.params.block_size = frames;
        self
    }

    pub fn double_precision(mut self, enabled: bool) -> Self {
        self.params.double_precision = enabled;
        self
    }

    /// Overrides [`ClientConfig::buffer_depth`].
    pub fn buffer_depth(mut self, depth: usize) -> Self {
        self.config.buffer_depth = depth;
        self
    }

    pub fn on_connect<F: Fn() + Send + Sync + 'static>(mut self, callback: F) -> Self {
        self.on_connect = Some(Box::new(callback));
        self
    }

    pub fn on_close<F: Fn() + Send + Sync + 'static>(mut self, callback: F) -> Self {
        self.on_close = Some(Box::new(callback));
        self
    }

    pub fn on_screen<F>(mut self, callback: F) -> Self
    where
        F: Fn(Arc<ScreenImage>, u32, u32) + Send + Sync + 'static,
    {
        self.on_screen = Some(Box::new(callback));
        self
    }

    /// Creates the session without connecting.
    pub fn build(self) -> Result<(Session, InitParams)> {
        let session = Session::new(self.config)?;
        session.set_server(self.endpoint);
        if let Some(callback) = self.on_connect {
            session.set_on_connect(callback);
        }
        if let Some(callback) = self.on_close {
            session.set_on_close(callback);
        }
        if let Some(callback) = self.on_screen {
            session.set_screen_callback(callback);
        }
        Ok((session, self.params))
    }

    /// Creates the session and runs the initial handshake.
    pub fn connect(self) -> Result<Session> {
        let (session, params) = self.build()?;
        tracing::debug!(
            "connecting to {} ({} in, {} out, {} Hz, block {})",
            session.endpoint().address(),
            params.channels_in,
            params.channels_out,
            params.sample_rate,
            params.block_size
        );
        session.init_with(params)?;
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ErrorKind, SessionState};

    #[test]
    fn test_build_does_not_connect() {
        let (session, params) = SessionBuilder::new(Endpoint::new("127.0.0.1", 1))
            .channels(1, 4)
            .block_size(128)
            .buffer_depth(3)
            .build()
            .unwrap();
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(session.buffer_depth(), 3);
        assert_eq!(params.channels_in, 1);
        assert_eq!(params.channels_out, 4);
        assert_eq!(params.block_size, 128);
        assert!(!params.double_precision);
    }

    #[test]
    fn test_connect_to_nothing_fails() {
        let config = ClientConfig {
            connect_timeout_ms: 200,
            ..Default::default()
        };
        // Port 1 on loopback is not listening.
        let err = SessionBuilder::new(Endpoint::new("127.0.0.1", 1))
            .config(config)
            .connect()
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::Connection);
    }
}
