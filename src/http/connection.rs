use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Weak;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use crate::http::creator::ResponseCreator;
use crate::http::parser::{ParseError, ParseStatus, RequestParser};
use crate::http::request::Request;
use crate::http::response::StatusCode;
use crate::http::timeout::{PhaseTimer, Timeouts};
use crate::http::writer::ResponseWriter;
use crate::server::registry::{ConnectionId, ConnectionRegistry};

/// Size of a single socket read.
pub const READ_BUFFER_SIZE: usize = 4096;

/// One accepted socket driven from request to response until it closes.
///
/// The connection exclusively owns its stream, parser and both timers. The
/// listener only knows it by id, through a weak back-reference that the
/// connection uses to deregister itself when it reaches `Closed`.
pub struct Connection<S> {
    id: ConnectionId,
    peer: SocketAddr,
    stream: S,
    read_buf: Box<[u8]>,
    // Bytes of read_buf received while idle, not yet fed to the parser
    carried: usize,
    parser: RequestParser,
    creator: Box<dyn ResponseCreator>,
    timeouts: Timeouts,
    request_timer: PhaseTimer,
    // Bounds SendingResponse by the request timeout
    write_timer: PhaseTimer,
    idle_timer: PhaseTimer,
    keep_open: bool,
    state: ConnectionState,
    registry: Weak<ConnectionRegistry>,
    shutdown: watch::Receiver<bool>,
}

pub enum ConnectionState {
    ReceivingRequest,
    ParsingComplete(Request),
    SendingResponse(ResponseWriter),
    Idle,
    Closed,
}

impl ConnectionState {
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionState::ReceivingRequest => "receiving-request",
            ConnectionState::ParsingComplete(_) => "parsing-complete",
            ConnectionState::SendingResponse(_) => "sending-response",
            ConnectionState::Idle => "idle",
            ConnectionState::Closed => "closed",
        }
    }
}

/// Why a transition happened.
enum Cause {
    Accepted,
    RequestComplete,
    Malformed(ParseError),
    RequestTimeout,
    Responded { status: u16, path: String },
    Written { bytes: usize, discarded: usize },
    WriteTimeout,
    NextRequest { bytes: usize },
    IdleTimeout,
    PeerClosed,
    ReadFailed(io::Error),
    WriteFailed(anyhow::Error),
    Shutdown,
}

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cause::Accepted => write!(f, "accepted"),
            Cause::RequestComplete => write!(f, "request complete"),
            Cause::Malformed(e) => write!(f, "malformed request: {e}"),
            Cause::RequestTimeout => write!(f, "request timeout"),
            Cause::Responded { status, path } => write!(f, "{status} for {path}"),
            Cause::Written { bytes, discarded: 0 } => write!(f, "wrote {bytes} bytes"),
            Cause::Written { bytes, discarded } => {
                write!(f, "wrote {bytes} bytes, dropped {discarded} pipelined bytes")
            }
            Cause::WriteTimeout => write!(f, "write timeout"),
            Cause::NextRequest { bytes } => write!(f, "received {bytes} bytes"),
            Cause::IdleTimeout => write!(f, "idle timeout"),
            Cause::PeerClosed => write!(f, "peer closed"),
            Cause::ReadFailed(e) => write!(f, "read failed: {e}"),
            Cause::WriteFailed(e) => write!(f, "write failed: {e}"),
            Cause::Shutdown => write!(f, "listener shutdown"),
        }
    }
}

type Step = (ConnectionState, Cause);

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(
        id: ConnectionId,
        peer: SocketAddr,
        stream: S,
        creator: Box<dyn ResponseCreator>,
        timeouts: Timeouts,
        registry: Weak<ConnectionRegistry>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            id,
            peer,
            stream,
            read_buf: vec![0u8; READ_BUFFER_SIZE].into_boxed_slice(),
            carried: 0,
            parser: RequestParser::new(),
            creator,
            timeouts,
            request_timer: PhaseTimer::new(),
            write_timer: PhaseTimer::new(),
            idle_timer: PhaseTimer::new(),
            keep_open: false,
            state: ConnectionState::Closed,
            registry,
            shutdown,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Drives the connection until it is closed.
    pub async fn run(mut self) {
        let stopping = *self.shutdown.borrow();
        if stopping {
            self.transition("accepted", ConnectionState::Closed, Cause::Shutdown);
        } else {
            self.transition("accepted", ConnectionState::ReceivingRequest, Cause::Accepted);
        }

        loop {
            let current = std::mem::replace(&mut self.state, ConnectionState::Closed);
            let from = current.name();

            let (next, cause) = match current {
                ConnectionState::ReceivingRequest => self.receive().await,
                ConnectionState::ParsingComplete(request) => self.respond(request),
                ConnectionState::SendingResponse(writer) => self.send(writer).await,
                ConnectionState::Idle => self.wait_for_request().await,
                ConnectionState::Closed => break,
            };

            self.transition(from, next, cause);
        }

        self.close().await;
    }

    async fn receive(&mut self) -> Step {
        if self.carried > 0 {
            let n = std::mem::take(&mut self.carried);
            if let Some(step) = self.consume(n) {
                return step;
            }
        }

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.changed() => {
                    return (ConnectionState::Closed, Cause::Shutdown);
                }
                read = self.stream.read(&mut self.read_buf[..]) => match read {
                    Ok(0) => return (ConnectionState::Closed, Cause::PeerClosed),
                    Ok(n) => {
                        trace!(connection = %self.id, bytes = n, "Read request bytes");
                        if let Some(step) = self.consume(n) {
                            return step;
                        }
                    }
                    Err(e) => return (ConnectionState::Closed, Cause::ReadFailed(e)),
                },
                _ = self.request_timer.expired() => {
                    return self.stock(StatusCode::RequestTimeout, Cause::RequestTimeout);
                }
            }
        }
    }

    /// Feeds `n` freshly read bytes to the parser.
    fn consume(&mut self, n: usize) -> Option<Step> {
        match self.parser.feed(&self.read_buf[..n]) {
            ParseStatus::NeedMore => None,
            ParseStatus::Complete(request) => Some(match self.creator.check_request(&request) {
                Ok(()) => (ConnectionState::ParsingComplete(request), Cause::RequestComplete),
                Err(e) => self.stock(StatusCode::BadRequest, Cause::Malformed(e)),
            }),
            ParseStatus::Failed(e) => Some(self.stock(StatusCode::BadRequest, Cause::Malformed(e))),
        }
    }

    /// Answers with a stock response and gives up on persistence.
    fn stock(&mut self, status: StatusCode, cause: Cause) -> Step {
        self.keep_open = false;
        let version = self.parser.http_version().unwrap_or_default();
        let response = self.creator.create_stock_response(version, status);
        (ConnectionState::SendingResponse(ResponseWriter::new(&response)), cause)
    }

    fn respond(&mut self, request: Request) -> Step {
        self.keep_open = request.keep_alive();
        let response = self.creator.create_dynamic_response(&request);

        let cause = Cause::Responded {
            status: response.status.as_u16(),
            path: request.path,
        };
        (ConnectionState::SendingResponse(ResponseWriter::new(&response)), cause)
    }

    async fn send(&mut self, mut writer: ResponseWriter) -> Step {
        let written = tokio::select! {
            biased;
            _ = self.shutdown.changed() => {
                return (ConnectionState::Closed, Cause::Shutdown);
            }
            written = writer.write_to_stream(&mut self.stream) => written,
            _ = self.write_timer.expired() => {
                return (ConnectionState::Closed, Cause::WriteTimeout);
            }
        };

        match written {
            Ok(()) => {
                let bytes = writer.written();
                if self.keep_open {
                    let discarded = self.parser.buffered();
                    (ConnectionState::Idle, Cause::Written { bytes, discarded })
                } else {
                    (ConnectionState::Closed, Cause::Written { bytes, discarded: 0 })
                }
            }
            Err(e) => (ConnectionState::Closed, Cause::WriteFailed(e)),
        }
    }

    async fn wait_for_request(&mut self) -> Step {
        tokio::select! {
            biased;
            _ = self.shutdown.changed() => (ConnectionState::Closed, Cause::Shutdown),
            read = self.stream.read(&mut self.read_buf[..]) => match read {
                Ok(0) => (ConnectionState::Closed, Cause::PeerClosed),
                Ok(n) => {
                    self.carried = n;
                    (ConnectionState::ReceivingRequest, Cause::NextRequest { bytes: n })
                }
                Err(e) => (ConnectionState::Closed, Cause::ReadFailed(e)),
            },
            _ = self.idle_timer.expired() => (ConnectionState::Closed, Cause::IdleTimeout),
        }
    }

    /// Runs the entry action of `next` and makes it current.
    fn transition(&mut self, from: &'static str, next: ConnectionState, cause: Cause) {
        match &next {
            ConnectionState::ReceivingRequest => {
                self.idle_timer.cancel();
                self.request_timer.arm(self.timeouts.request.as_duration());
            }
            ConnectionState::ParsingComplete(_) => {
                self.request_timer.cancel();
            }
            ConnectionState::SendingResponse(_) => {
                self.request_timer.cancel();
                self.write_timer.arm(self.timeouts.request.as_duration());
            }
            ConnectionState::Idle => {
                self.write_timer.cancel();
                self.parser.reset();
                self.keep_open = false;
                self.idle_timer.arm(self.timeouts.idle.as_duration());
            }
            ConnectionState::Closed => {
                self.request_timer.cancel();
                self.write_timer.cancel();
                self.idle_timer.cancel();
            }
        }

        self.log_transition(from, &next, &cause);
        self.state = next;
    }

    fn log_transition(&self, from: &'static str, next: &ConnectionState, cause: &Cause) {
        let to = next.name();
        match cause {
            Cause::Malformed(_) | Cause::RequestTimeout => warn!(
                connection = %self.id,
                peer = %self.peer,
                from,
                to,
                cause = %cause,
                "Rejecting request"
            ),
            Cause::ReadFailed(_) | Cause::WriteFailed(_) => warn!(
                connection = %self.id,
                peer = %self.peer,
                from,
                to,
                cause = %cause,
                "Connection transport error"
            ),
            Cause::WriteTimeout => warn!(
                connection = %self.id,
                peer = %self.peer,
                from,
                to,
                cause = %cause,
                "Response write stalled"
            ),
            Cause::Written { discarded, .. } if *discarded > 0 => warn!(
                connection = %self.id,
                peer = %self.peer,
                from,
                to,
                cause = %cause,
                "Dropping pipelined request bytes"
            ),
            _ => debug!(
                connection = %self.id,
                peer = %self.peer,
                from,
                to,
                cause = %cause,
                "Connection state changed"
            ),
        }
    }

    async fn close(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
        // Peer may already be gone
        let _ = self.stream.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::io::DuplexStream;
    use tokio::time::Instant;

    use crate::http::json;
    use crate::http::request::HttpVersion;
    use crate::http::response::{Response, ResponseBuilder};
    use crate::http::timeout::{IdleTimeout, RequestTimeout};

    struct EmptyOk;

    impl ResponseCreator for EmptyOk {
        fn check_request(&self, request: &Request) -> Result<(), ParseError> {
            json::check_json_post(request)
        }

        fn create_stock_response(&self, version: HttpVersion, status: StatusCode) -> Response {
            json::stock_response(version, status)
        }

        fn create_dynamic_response(&mut self, request: &Request) -> Response {
            ResponseBuilder::new(StatusCode::Ok)
                .version(request.version)
                .header("Content-Type", "application/json")
                .build()
        }
    }

    struct Harness {
        id: ConnectionId,
        client: DuplexStream,
        registry: Arc<ConnectionRegistry>,
        shutdown: watch::Sender<bool>,
    }

    fn start(request_ms: i64, idle_ms: i64) -> Harness {
        start_with_buffer(64 * 1024, request_ms, idle_ms)
    }

    fn start_with_buffer(buffer: usize, request_ms: i64, idle_ms: i64) -> Harness {
        let (client, server) = tokio::io::duplex(buffer);
        let registry = Arc::new(ConnectionRegistry::new());
        let (shutdown, shutdown_rx) = watch::channel(false);
        let timeouts = Timeouts {
            request: RequestTimeout::from_millis(request_ms).unwrap(),
            idle: IdleTimeout::from_millis(idle_ms).unwrap(),
        };

        let id = registry.allocate_id();
        let connection = Connection::new(
            id,
            "127.0.0.1:40000".parse().unwrap(),
            server,
            Box::new(EmptyOk),
            timeouts,
            Arc::downgrade(&registry),
            shutdown_rx,
        );
        registry.spawn(id, connection.run());

        Harness {
            id,
            client,
            registry,
            shutdown,
        }
    }

    async fn read_response(client: &mut DuplexStream) -> String {
        let mut received = Vec::new();
        let mut chunk = [0u8; 1024];

        loop {
            if let Some(end) = received.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&received[..end]).to_string();
                let length: usize = head
                    .lines()
                    .find_map(|l| l.strip_prefix("Content-Length: "))
                    .map(|v| v.parse().unwrap())
                    .unwrap_or(0);
                if received.len() >= end + 4 + length {
                    return String::from_utf8(received).unwrap();
                }
            }

            let n = client.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed mid-response");
            received.extend_from_slice(&chunk[..n]);
        }
    }

    async fn read_until_closed(client: &mut DuplexStream) -> Vec<u8> {
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        rest
    }

    async fn wait_deregistered(registry: &ConnectionRegistry) {
        for _ in 0..100 {
            if registry.is_empty() {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("connection still registered");
    }

    // Answered with a 400 stock response larger than a 64 byte pipe
    const GET_11: &[u8] = b"GET / HTTP/1.1\r\n\r\n";
    const BAD_REQUEST_BODY: &str = r#"{"result":400,"text":"Bad Request"}"#;

    const JSON_11: &[u8] =
        b"POST /foo/bar HTTP/1.1\r\nContent-Type: application/json\r\nContent-Length: 3\r\n\r\n{ }";

    #[tokio::test]
    async fn persistent_connection_serves_second_request() {
        let mut h = start(10_000, 10_000);

        h.client.write_all(JSON_11).await.unwrap();
        let first = read_response(&mut h.client).await;
        assert!(first.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(h.registry.contains(h.id));

        h.client
            .write_all(
                b"POST /foo/bar HTTP/1.1\r\nContent-Type: application/json\r\n\
                  Content-Length: 3\r\nConnection: close\r\n\r\n{ }",
            )
            .await
            .unwrap();
        let second = read_response(&mut h.client).await;
        assert!(second.starts_with("HTTP/1.1 200 OK\r\n"));

        assert!(read_until_closed(&mut h.client).await.is_empty());
        wait_deregistered(&h.registry).await;
    }

    #[tokio::test]
    async fn request_split_across_reads_is_reassembled() {
        let mut h = start(10_000, 10_000);

        for piece in JSON_11.chunks(7) {
            h.client.write_all(piece).await.unwrap();
            tokio::task::yield_now().await;
        }

        let response = read_response(&mut h.client).await;
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    }

    #[tokio::test(start_paused = true)]
    async fn incomplete_request_gets_408_then_close() {
        let mut h = start(1_000, 10_000);
        let started = Instant::now();

        h.client
            .write_all(b"POST /foo/bar HTTP/1.1\r\nContent-Type: application/json\r\nContent-Length:")
            .await
            .unwrap();

        let received = String::from_utf8(read_until_closed(&mut h.client).await).unwrap();
        let body = r#"{"result":408,"text":"Request Timeout"}"#;

        assert!(received.starts_with("HTTP/1.1 408 Request Timeout\r\n"));
        assert!(received.contains(&format!("Content-Length: {}\r\n", body.len())));
        assert!(received.ends_with(body));
        assert_eq!(received.matches("HTTP/1.1").count(), 1);
        assert!(started.elapsed() >= Duration::from_millis(1_000));
        wait_deregistered(&h.registry).await;
    }

    #[tokio::test(start_paused = true)]
    async fn idle_connection_closes_without_response() {
        let mut h = start(10_000, 500);

        h.client.write_all(JSON_11).await.unwrap();
        read_response(&mut h.client).await;

        let idle_since = Instant::now();
        assert!(read_until_closed(&mut h.client).await.is_empty());
        assert!(idle_since.elapsed() >= Duration::from_millis(500));
        wait_deregistered(&h.registry).await;
    }

    #[tokio::test]
    async fn malformed_body_forces_close_on_http11() {
        let mut h = start(10_000, 10_000);

        h.client
            .write_all(
                b"POST /foo/bar HTTP/1.1\r\nContent-Type: application/json\r\n\
                  Content-Length: 12\r\n\r\n{ \"a\": abc }",
            )
            .await
            .unwrap();

        let received = String::from_utf8(read_until_closed(&mut h.client).await).unwrap();
        assert!(received.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(received.ends_with(r#"{"result":400,"text":"Bad Request"}"#));
    }

    #[tokio::test]
    async fn unparsable_version_gets_http10_stock_response() {
        let mut h = start(10_000, 10_000);

        h.client.write_all(b"POST /foo HTTP/9.9\r\n\r\n").await.unwrap();

        let received = String::from_utf8(read_until_closed(&mut h.client).await).unwrap();
        assert!(received.starts_with("HTTP/1.0 400 Bad Request\r\n"));
    }

    #[tokio::test]
    async fn peer_close_mid_request_writes_nothing() {
        let mut h = start(10_000, 10_000);

        h.client.write_all(b"POST /foo/bar HTTP/1.1\r\n").await.unwrap();
        h.client.shutdown().await.unwrap();

        assert!(read_until_closed(&mut h.client).await.is_empty());
        wait_deregistered(&h.registry).await;
    }

    #[tokio::test]
    async fn shutdown_interrupts_pending_read() {
        let mut h = start(10_000, 10_000);

        h.client.write_all(b"POST /foo/bar HTTP/1.1\r\n").await.unwrap();
        tokio::task::yield_now().await;
        h.shutdown.send(true).unwrap();

        assert!(read_until_closed(&mut h.client).await.is_empty());
        wait_deregistered(&h.registry).await;
    }

    #[tokio::test]
    async fn already_stopped_listener_closes_new_connection() {
        let mut h = start(10_000, 10_000);
        h.shutdown.send(true).unwrap();

        assert!(read_until_closed(&mut h.client).await.is_empty());
        wait_deregistered(&h.registry).await;
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_write_closes_after_request_timeout() {
        let mut h = start_with_buffer(64, 1_000, 1_000);
        let started = Instant::now();

        h.client.write_all(GET_11).await.unwrap();
        tokio::time::sleep(Duration::from_secs(3600)).await;

        assert!(!h.registry.contains(h.id));
        assert!(started.elapsed() >= Duration::from_millis(1_000));

        let received = read_until_closed(&mut h.client).await;
        assert!(received.len() <= 64);
        assert!(!received.ends_with(BAD_REQUEST_BODY.as_bytes()));
    }

    #[tokio::test]
    async fn shutdown_interrupts_pending_write() {
        let mut h = start_with_buffer(64, 10_000, 10_000);

        h.client.write_all(GET_11).await.unwrap();
        let mut first = [0u8; 64];
        let n = h.client.read(&mut first).await.unwrap();
        assert!(n > 0);
        assert!(first.starts_with(b"HTTP/1.1 400 Bad Request\r\n"));

        h.shutdown.send(true).unwrap();

        let rest = read_until_closed(&mut h.client).await;
        let mut received = first[..n].to_vec();
        received.extend_from_slice(&rest);
        assert!(!received.ends_with(BAD_REQUEST_BODY.as_bytes()));
        wait_deregistered(&h.registry).await;
    }

    #[tokio::test(start_paused = true)]
    async fn pipelined_request_is_dropped_on_idle() {
        let mut h = start(10_000, 500);

        let mut twice = JSON_11.to_vec();
        twice.extend_from_slice(JSON_11);
        h.client.write_all(&twice).await.unwrap();

        let first = read_response(&mut h.client).await;
        assert!(first.starts_with("HTTP/1.1 200 OK\r\n"));

        assert!(read_until_closed(&mut h.client).await.is_empty());
        wait_deregistered(&h.registry).await;
    }
}
