//! In-process mock of the remote processing host.
//!
//! Speaks the real wire protocol over loopback TCP: it negotiates sessions,
//! keeps a plugin chain with parameter values, echoes audio frames back and
//! sends one editor image when the screen channel opens.

#![allow(dead_code)]

use parking_lot::Mutex;
use remotefx_client::codec::{self, FrameReader};
use remotefx_client::protocol::{
    ChannelKind, Hello, HelloReply, Request, RequestEnvelope, Response, ResponseEnvelope,
    ScreenFrameHeader,
};
use remotefx_client::{ClientConfig, Endpoint, Parameter, ServerPlugin, Session};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};

pub const TEST_SAMPLE_RATE: f64 = 48000.0;
pub const TEST_BLOCK_SIZE: usize = 512;
pub const SERVER_ID: u32 = 3;
pub const PARAMS_PER_PLUGIN: i32 = 3;

/// Latency the mock reports for an empty chain, plus this much per plugin.
pub const BASE_LATENCY: u32 = 128;
pub const PLUGIN_LATENCY: u32 = 64;

/// Editor image sent when the screen channel opens.
pub const SCREEN_WIDTH: u32 = 4;
pub const SCREEN_HEIGHT: u32 = 3;
pub const SCREEN_FILL: u8 = 0x7f;

#[derive(Debug, Clone)]
pub struct MockPlugin {
    pub id: String,
    pub params: Vec<f32>,
    pub bypassed: bool,
    pub settings: String,
}

#[derive(Debug, Default)]
pub struct ServerState {
    pub chain: Vec<MockPlugin>,
    pub inits: usize,
    pub quits: usize,
    /// Requests in arrival order (serde tag only).
    pub log: Vec<String>,
    /// Held back before the next reply is written.
    pub delay_next_reply: Option<Duration>,
    pub max_channels: u32,
}

pub struct MockServer {
    pub port: u16,
    pub state: Arc<Mutex<ServerState>>,
    sessions: Arc<AtomicU64>,
    runtime: tokio::runtime::Runtime,
}

impl MockServer {
    pub fn start() -> Self {
        Self::with_max_channels(8)
    }

    pub fn with_max_channels(max_channels: u32) -> Self {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .expect("mock server runtime");
        let listener = runtime
            .block_on(TcpListener::bind("127.0.0.1:0"))
            .expect("bind mock server");
        let port = listener.local_addr().expect("local addr").port();

        let state = Arc::new(Mutex::new(ServerState {
            max_channels,
            ..Default::default()
        }));
        let sessions = Arc::new(AtomicU64::new(0));
        {
            let state = Arc::clone(&state);
            let sessions = Arc::clone(&sessions);
            runtime.spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    tokio::spawn(serve(stream, Arc::clone(&state), Arc::clone(&sessions)));
                }
            });
        }

        Self {
            port,
            state,
            sessions,
            runtime,
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new("127.0.0.1", self.port)
    }

    pub fn inits(&self) -> usize {
        self.state.lock().inits
    }

    pub fn delay_next_reply(&self, delay: Duration) {
        self.state.lock().delay_next_reply = Some(delay);
    }

    pub fn requests(&self) -> Vec<String> {
        self.state.lock().log.clone()
    }
}

pub fn test_config() -> ClientConfig {
    ClientConfig {
        request_timeout_ms: 1000,
        connect_timeout_ms: 1000,
        ..Default::default()
    }
}

/// Session connected to `server` with a stereo single-precision stream.
pub fn connected_session(server: &MockServer, config: ClientConfig) -> Session {
    let session = Session::new(config).expect("session");
    session.set_server(server.endpoint());
    session
        .init(2, 2, TEST_SAMPLE_RATE, TEST_BLOCK_SIZE, false)
        .expect("init");
    session
}

/// Polls `cond` for up to two seconds.
pub fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}

async fn serve(stream: TcpStream, state: Arc<Mutex<ServerState>>, sessions: Arc<AtomicU64>) {
    let _ = stream.set_nodelay(true);
    let (rx, mut tx) = stream.into_split();
    let mut reader = FrameReader::new(rx, 64 << 20);
    let Ok(hello) = reader.next_json::<Hello>().await else {
        return;
    };

    let session = match hello.channel {
        ChannelKind::Command => sessions.fetch_add(1, Ordering::SeqCst) + 1,
        _ => hello.session,
    };
    let welcome = HelloReply::Welcome {
        session,
        server_id: SERVER_ID,
    };
    if codec::write_json(&mut tx, &welcome).await.is_err() {
        return;
    }

    match hello.channel {
        ChannelKind::Command => serve_commands(reader, tx, state).await,
        ChannelKind::Audio => {
            while let Ok(frame) = reader.next_frame().await {
                if codec::write_frame(&mut tx, &frame).await.is_err() {
                    break;
                }
            }
        }
        ChannelKind::Screen => {
            let header = ScreenFrameHeader::full(SCREEN_WIDTH, SCREEN_HEIGHT);
            let pixels = vec![SCREEN_FILL; header.payload_len()];
            let Ok(payload) = codec::encode_screen(&header, &pixels) else {
                return;
            };
            if codec::write_frame(&mut tx, &payload).await.is_err() {
                return;
            }
            // Hold the connection until the client goes away.
            while reader.next_frame().await.is_ok() {}
        }
    }
}

async fn serve_commands(
    mut reader: FrameReader<tokio::net::tcp::OwnedReadHalf>,
    mut tx: OwnedWriteHalf,
    state: Arc<Mutex<ServerState>>,
) {
    while let Ok(envelope) = reader.next_json::<RequestEnvelope>().await {
        let quit = envelope.request == Request::Quit;
        let (response, delay) = {
            let mut state = state.lock();
            let response = handle(&mut state, envelope.request);
            (response, state.delay_next_reply.take())
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let reply = ResponseEnvelope {
            seq: envelope.seq,
            response,
        };
        if codec::write_json(&mut tx, &reply).await.is_err() || quit {
            break;
        }
    }
    let _ = tx.shutdown().await;
}

fn latency(state: &ServerState) -> u32 {
    BASE_LATENCY + PLUGIN_LATENCY * state.chain.len() as u32
}

fn slot(state: &mut ServerState, idx: usize) -> Result<&mut MockPlugin, Response> {
    state.chain.get_mut(idx).ok_or(Response::Error {
        message: format!("no plugin at {}", idx),
    })
}

fn handle(state: &mut ServerState, request: Request) -> Response {
    let tag = serde_json::to_value(&request)
        .ok()
        .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(str::to_string))
        .unwrap_or_default();
    state.log.push(tag);

    match handle_inner(state, request) {
        Ok(response) | Err(response) => response,
    }
}

fn handle_inner(state: &mut ServerState, request: Request) -> Result<Response, Response> {
    let response = match request {
        Request::Init {
            channels_in,
            channels_out,
            ..
        } => {
            if channels_in > state.max_channels || channels_out > state.max_channels {
                return Ok(Response::Rejected {
                    reason: format!("at most {} channels", state.max_channels),
                });
            }
            state.inits += 1;
            // A fresh session starts with an empty chain.
            state.chain.clear();
            Response::Accepted {
                latency_samples: latency(state),
            }
        }
        Request::AddPlugin { id, settings } => {
            if id.starts_with("missing") {
                return Err(Response::Error {
                    message: format!("{} not found", id),
                });
            }
            let k = state.chain.len() as f32 + 1.0;
            let params: Vec<f32> = (0..PARAMS_PER_PLUGIN).map(|i| (k + i as f32) / 10.0).collect();
            let parameters = params
                .iter()
                .enumerate()
                .map(|(i, value)| {
                    let mut p = Parameter::new(i as i32, format!("{} param {}", id, i));
                    p.current_value = *value;
                    p.to_wire()
                })
                .collect();
            state.chain.push(MockPlugin {
                id: id.clone(),
                params,
                bypassed: false,
                settings: settings.unwrap_or_default(),
            });
            Response::PluginAdded {
                name: id.to_uppercase(),
                presets: vec!["Init".to_string(), "Warm".to_string()],
                parameters,
                latency_samples: latency(state),
            }
        }
        Request::DelPlugin { idx } => {
            slot(state, idx)?;
            state.chain.remove(idx);
            Response::Done {
                latency_samples: Some(latency(state)),
            }
        }
        Request::EditPlugin { idx } | Request::Preset { idx, .. } => {
            slot(state, idx)?;
            Response::done()
        }
        Request::GetPluginSettings { idx } => Response::Settings {
            settings: slot(state, idx)?.settings.clone(),
        },
        Request::SetPluginSettings { idx, settings } => {
            slot(state, idx)?.settings = settings;
            Response::done()
        }
        Request::BypassPlugin { idx } => {
            slot(state, idx)?.bypassed = true;
            Response::done()
        }
        Request::UnbypassPlugin { idx } => {
            slot(state, idx)?.bypassed = false;
            Response::done()
        }
        Request::ExchangePlugins { idx_a, idx_b } => {
            slot(state, idx_a)?;
            slot(state, idx_b)?;
            state.chain.swap(idx_a, idx_b);
            Response::done()
        }
        Request::RecentsList { max } => Response::Recents {
            plugins: vec![
                ServerPlugin::new("VST3:Reverb", "Reverb").plugin_type("VST3"),
                ServerPlugin::new("VST3:Delay", "Delay").plugin_type("VST3"),
                ServerPlugin::new("AU:Comp", "Comp").plugin_type("AU"),
            ]
            .into_iter()
            .take(max)
            .collect(),
        },
        Request::GetParameterValue { idx, param_idx } => {
            let plugin = slot(state, idx)?;
            match plugin.params.get(param_idx as usize) {
                Some(value) => Response::ParameterValue { value: *value },
                None => Response::Error {
                    message: format!("no parameter {}", param_idx),
                },
            }
        }
        Request::SetParameterValue {
            idx,
            param_idx,
            value,
        } => {
            let plugin = slot(state, idx)?;
            match plugin.params.get_mut(param_idx as usize) {
                Some(current) => {
                    *current = value;
                    Response::done()
                }
                None => Response::Error {
                    message: format!("no parameter {}", param_idx),
                },
            }
        }
        Request::GetAllParameterValues { idx, count } => {
            let plugin = slot(state, idx)?;
            Response::ParameterValues {
                values: plugin
                    .params
                    .iter()
                    .take(count)
                    .enumerate()
                    .map(|(i, value)| remotefx_client::ParameterResult {
                        idx: i as i32,
                        value: *value,
                    })
                    .collect(),
            }
        }
        Request::HidePlugin
        | Request::Mouse { .. }
        | Request::Key { .. }
        | Request::ScreenCaptureArea { .. }
        | Request::Rescan { .. } => Response::done(),
        Request::CpuLoad => Response::Load { load: 0.4 },
        Request::Quit => {
            state.quits += 1;
            Response::done()
        }
    };
    Ok(response)
}
