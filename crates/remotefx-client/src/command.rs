//! Command channel: one request/response pair at a time.
//!
//! Also hosts the connection handshake shared by all three channels.

use crate::codec::{self, FrameReader};
use crate::error::{ClientError, Result};
use crate::protocol::{Hello, HelloReply, Request, RequestEnvelope, Response, ResponseEnvelope};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};

/// An established, negotiated connection.
pub struct Connection {
    pub reader: FrameReader<OwnedReadHalf>,
    pub writer: OwnedWriteHalf,
    pub session: u64,
    pub server_id: u32,
}

/// Connects to `address` and exchanges the hello frames.
///
/// `Refused` from the server is a negotiation error; everything that goes
/// wrong before a reply arrives is a connection error.
pub async fn connect(
    address: &str,
    hello: &Hello,
    connect_timeout: Duration,
    max_frame_size: usize,
) -> Result<Connection> {
    let stream = match timeout(connect_timeout, TcpStream::connect(address)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            return Err(ClientError::ConnectionFailed(format!("{}: {}", address, e)));
        }
        Err(_) => {
            return Err(ClientError::ConnectionFailed(format!(
                "{}: no connection after {:?}",
                address, connect_timeout
            )));
        }
    };
    stream.set_nodelay(true)?;

    let (read_half, mut writer) = stream.into_split();
    let mut reader = FrameReader::new(read_half, max_frame_size);

    let reply = timeout(connect_timeout, async {
        codec::write_json(&mut writer, hello).await?;
        reader.next_json::<HelloReply>().await
    })
    .await
    .map_err(|_| {
        ClientError::ConnectionFailed(format!("{}: no {:?} handshake reply", address, hello.channel))
    })??;

    match reply {
        HelloReply::Welcome { session, server_id } => {
            tracing::debug!("{:?} channel open to {} (session {})", hello.channel, address, session);
            Ok(Connection {
                reader,
                writer,
                session,
                server_id,
            })
        }
        HelloReply::Refused { reason } => Err(ClientError::Negotiation(reason)),
    }
}

/// Serializes requests on the command connection.
///
/// Every request carries a sequence number. A reply that arrives after its
/// request already timed out is recognized by its stale number and skipped.
pub struct CommandChannel<R, W> {
    reader: FrameReader<R>,
    writer: W,
    seq: u64,
    failed: bool,
}

impl CommandChannel<OwnedReadHalf, OwnedWriteHalf> {
    pub fn from_connection(conn: Connection) -> Self {
        Self::new(conn.reader, conn.writer)
    }
}

impl<R: AsyncRead + Unpin, W: AsyncWrite + Unpin> CommandChannel<R, W> {
    pub fn new(reader: FrameReader<R>, writer: W) -> Self {
        Self {
            reader,
            writer,
            seq: 0,
            failed: false,
        }
    }

    /// False once the connection broke; a new channel is needed after that.
    pub fn is_ok(&self) -> bool {
        !self.failed
    }

    /// Sends `request` and waits up to `wait` for its reply.
    ///
    /// A missing reply fails this request only. Write failures, broken
    /// connections and protocol violations fail the channel.
    pub async fn request(&mut self, request: Request, wait: Duration) -> Result<Response> {
        if self.failed {
            return Err(ClientError::ConnectionFailed("command channel is down".to_string()));
        }
        let operation = operation_name(&request);
        let result = self.exchange(request, wait).await;
        match &result {
            Err(e) if e.is_fatal() => {
                tracing::error!("{} failed, command channel down: {}", operation, e);
                self.failed = true;
            }
            Err(ClientError::TransportStall { .. }) => {
                tracing::warn!("{} got no reply within {:?}", operation, wait);
            }
            _ => {}
        }
        result
    }

    async fn exchange(&mut self, request: Request, wait: Duration) -> Result<Response> {
        let operation = operation_name(&request);
        self.seq += 1;
        let seq = self.seq;
        let deadline = Instant::now() + wait;

        tracing::debug!("-> #{} {}", seq, operation);
        let envelope = RequestEnvelope { seq, request };
        match tokio::time::timeout_at(deadline, codec::write_json(&mut self.writer, &envelope)).await {
            Ok(written) => written?,
            // A half-written frame leaves the stream unusable.
            Err(_) => {
                return Err(ClientError::ConnectionFailed(format!(
                    "{} could not be sent within {:?}",
                    operation, wait
                )));
            }
        }

        loop {
            let reply = tokio::time::timeout_at(deadline, self.reader.next_json::<ResponseEnvelope>())
                .await
                .map_err(|_| ClientError::stall(operation, wait))??;

            if reply.seq < seq {
                tracing::debug!("discarding stale reply #{} while waiting for #{}", reply.seq, seq);
                continue;
            }
            if reply.seq > seq {
                return Err(ClientError::Protocol(format!(
                    "reply #{} for request #{} not yet sent",
                    reply.seq, seq
                )));
            }

            tracing::debug!("<- #{} {}", seq, operation);
            return match reply.response {
                Response::Error { message } => {
                    tracing::warn!("{} rejected by server: {}", operation, message);
                    Err(ClientError::Remote(message))
                }
                response => Ok(response),
            };
        }
    }
}

/// Unexpected reply to `operation`.
pub(crate) fn unexpected(operation: &str, response: Response) -> ClientError {
    ClientError::Protocol(format!("unexpected reply to {}: {:?}", operation, response))
}

pub(crate) fn operation_name(request: &Request) -> &'static str {
    match request {
        Request::Init { .. } => "init",
        Request::AddPlugin { .. } => "add plugin",
        Request::DelPlugin { .. } => "delete plugin",
        Request::EditPlugin { .. } => "edit plugin",
        Request::HidePlugin => "hide plugin",
        Request::GetPluginSettings { .. } => "get plugin settings",
        Request::SetPluginSettings { .. } => "set plugin settings",
        Request::BypassPlugin { .. } => "bypass plugin",
        Request::UnbypassPlugin { .. } => "unbypass plugin",
        Request::ExchangePlugins { .. } => "exchange plugins",
        Request::RecentsList { .. } => "recents list",
        Request::Preset { .. } => "preset",
        Request::GetParameterValue { .. } => "get parameter value",
        Request::SetParameterValue { .. } => "set parameter value",
        Request::GetAllParameterValues { .. } => "get all parameter values",
        Request::Mouse { .. } => "mouse event",
        Request::Key { .. } => "key event",
        Request::ScreenCaptureArea { .. } => "screen capture area",
        Request::Rescan { .. } => "rescan",
        Request::CpuLoad => "cpu load",
        Request::Quit => "quit",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{split, DuplexStream, ReadHalf, WriteHalf};

    type Channel = CommandChannel<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

    fn pair() -> (Channel, FrameReader<ReadHalf<DuplexStream>>, WriteHalf<DuplexStream>) {
        let (client, server) = tokio::io::duplex(1 << 16);
        let (rx, tx) = split(client);
        let (srx, stx) = split(server);
        (
            CommandChannel::new(FrameReader::new(rx, 1 << 20), tx),
            FrameReader::new(srx, 1 << 20),
            stx,
        )
    }

    async fn reply(tx: &mut WriteHalf<DuplexStream>, seq: u64, response: Response) {
        codec::write_json(tx, &ResponseEnvelope { seq, response }).await.unwrap();
    }

    #[tokio::test]
    async fn test_request_roundtrip() {
        let (mut channel, mut server_rx, mut server_tx) = pair();
        let server = tokio::spawn(async move {
            let req: RequestEnvelope = server_rx.next_json().await.unwrap();
            assert_eq!(req.request, Request::CpuLoad);
            reply(&mut server_tx, req.seq, Response::Load { load: 0.25 }).await;
            (server_rx, server_tx)
        });

        let response = channel.request(Request::CpuLoad, Duration::from_secs(1)).await.unwrap();
        assert_eq!(response, Response::Load { load: 0.25 });
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_stall_fails_only_that_request() {
        let (mut channel, mut server_rx, mut server_tx) = pair();

        let err = channel
            .request(Request::Rescan { wipe: false }, Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::TransportStall { .. }));
        assert!(channel.is_ok());

        // The late reply to #1 arrives before the reply to #2.
        let server = tokio::spawn(async move {
            let first: RequestEnvelope = server_rx.next_json().await.unwrap();
            let second: RequestEnvelope = server_rx.next_json().await.unwrap();
            reply(&mut server_tx, first.seq, Response::done()).await;
            reply(&mut server_tx, second.seq, Response::ParameterValue { value: 0.5 }).await;
            (server_rx, server_tx)
        });

        let response = channel
            .request(
                Request::GetParameterValue { idx: 0, param_idx: 3 },
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert_eq!(response, Response::ParameterValue { value: 0.5 });
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_server_error_is_remote() {
        let (mut channel, mut server_rx, mut server_tx) = pair();
        let server = tokio::spawn(async move {
            let req: RequestEnvelope = server_rx.next_json().await.unwrap();
            reply(&mut server_tx, req.seq, Response::Error { message: "no such plugin".into() }).await;
            (server_rx, server_tx)
        });

        let err = channel
            .request(Request::DelPlugin { idx: 4 }, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Remote(ref m) if m == "no such plugin"));
        assert!(channel.is_ok());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_connection_fails_channel() {
        let (mut channel, server_rx, server_tx) = pair();
        drop(server_rx);
        drop(server_tx);

        let err = channel.request(Request::CpuLoad, Duration::from_secs(1)).await.unwrap_err();
        assert!(err.is_fatal());
        assert!(!channel.is_ok());
        let err = channel.request(Request::CpuLoad, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ClientError::ConnectionFailed(_)));
    }

    #[tokio::test]
    async fn test_connect_refused_is_negotiation_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (rx, mut tx) = stream.into_split();
            let mut rx = FrameReader::new(rx, 1 << 20);
            let _hello: Hello = rx.next_json().await.unwrap();
            let refused = HelloReply::Refused { reason: "unsupported precision".into() };
            codec::write_json(&mut tx, &refused).await.unwrap();
        });

        let hello = Hello {
            channel: crate::protocol::ChannelKind::Command,
            version: crate::protocol::PROTOCOL_VERSION,
            session: 0,
            client_port: 0,
            precision: None,
        };
        let err = connect(&address, &hello, Duration::from_secs(1), 1 << 20)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ClientError::Negotiation(ref r) if r == "unsupported precision"));
    }
}
