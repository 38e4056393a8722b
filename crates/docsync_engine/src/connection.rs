//! Transport abstraction for the listen and write streams.
//!
//! A [`Connection`] opens bidirectional streams. Outbound requests go through
//! the returned [`OutboundStream`]; inbound events arrive through a
//! [`StreamSink`] callback, which the client turns into operations on its
//! serial queue. The wire encoding is entirely the connection's business.
//!
//! [`loopback`] pairs an in-process [`LoopbackConnection`] with a
//! [`LoopbackServer`] handle for tests and embedding.

use docsync_protocol::{Code, ListenRequest, Status, WatchChange, WriteRequest, WriteResponse};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Which of the two streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    /// Target watches and their changes.
    Listen,
    /// Mutation commits and their acknowledgements.
    Write,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Listen => f.write_str("listen"),
            StreamKind::Write => f.write_str("write"),
        }
    }
}

/// An opaque credential attached to every stream open.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken(String);

impl AuthToken {
    /// Wraps a token string.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The token string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthToken(***)")
    }
}

/// Supplies credentials before every stream (re)open.
pub trait CredentialsProvider: Send {
    /// Returns the current token, or `None` for unauthenticated access.
    fn get_token(&mut self) -> Result<Option<AuthToken>, Status>;

    /// Marks the current token as rejected so the next call fetches a new
    /// one.
    fn invalidate_token(&mut self);
}

/// Credentials for unauthenticated access.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyCredentials;

impl CredentialsProvider for EmptyCredentials {
    fn get_token(&mut self) -> Result<Option<AuthToken>, Status> {
        Ok(None)
    }

    fn invalidate_token(&mut self) {}
}

/// A fixed token.
#[derive(Debug, Clone)]
pub struct StaticCredentials {
    token: AuthToken,
}

impl StaticCredentials {
    /// Always hands out `token`.
    pub fn new(token: AuthToken) -> Self {
        Self { token }
    }
}

impl CredentialsProvider for StaticCredentials {
    fn get_token(&mut self) -> Result<Option<AuthToken>, Status> {
        Ok(Some(self.token.clone()))
    }

    fn invalidate_token(&mut self) {
        debug!("static token invalidated; it will be sent again");
    }
}

/// Something that happened on an open stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent<T> {
    /// The stream is ready for requests.
    Open,
    /// An inbound message.
    Message(T),
    /// The stream ended; `Code::Ok` for a clean close.
    Close(Status),
}

/// Callback receiving a stream's inbound events.
pub struct StreamSink<T> {
    deliver: Arc<dyn Fn(StreamEvent<T>) + Send + Sync>,
}

impl<T> Clone for StreamSink<T> {
    fn clone(&self) -> Self {
        Self {
            deliver: Arc::clone(&self.deliver),
        }
    }
}

impl<T> fmt::Debug for StreamSink<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StreamSink")
    }
}

impl<T> StreamSink<T> {
    /// Wraps a callback.
    pub fn new(deliver: impl Fn(StreamEvent<T>) + Send + Sync + 'static) -> Self {
        Self {
            deliver: Arc::new(deliver),
        }
    }

    /// Delivers one event.
    pub fn deliver(&self, event: StreamEvent<T>) {
        (self.deliver)(event);
    }
}

/// An inbound event tagged with its stream.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    /// Listen stream event.
    Listen(StreamEvent<WatchChange>),
    /// Write stream event.
    Write(StreamEvent<WriteResponse>),
}

/// Routes inbound events, tagged with the generation of the stream that
/// produced them, back to the engine.
pub type Dispatcher = Arc<dyn Fn(u64, InboundEvent) + Send + Sync>;

/// The outbound half of an open stream.
pub trait OutboundStream<T>: Send {
    /// Sends a request. Requests on a closed stream are dropped.
    fn send(&mut self, request: T);

    /// Closes the stream from the client side. No further events are
    /// delivered for it.
    fn close(&mut self);
}

/// Opens streams to the backend.
pub trait Connection: Send {
    /// Opens a listen stream. `Open` must be delivered through `sink` before
    /// any message.
    fn open_listen_stream(
        &mut self,
        auth: Option<AuthToken>,
        sink: StreamSink<WatchChange>,
    ) -> Box<dyn OutboundStream<ListenRequest>>;

    /// Opens a write stream. `Open` must be delivered through `sink` before
    /// any message.
    fn open_write_stream(
        &mut self,
        auth: Option<AuthToken>,
        sink: StreamSink<WriteResponse>,
    ) -> Box<dyn OutboundStream<WriteRequest>>;
}

#[derive(Default)]
struct LoopbackState {
    next_stream_id: u64,
    listen: Option<(u64, StreamSink<WatchChange>)>,
    write: Option<(u64, StreamSink<WriteResponse>)>,
    listen_opens: usize,
    write_opens: usize,
    required_token: Option<AuthToken>,
    auth_tokens: Vec<Option<AuthToken>>,
}

impl LoopbackState {
    fn accepts(&self, auth: &Option<AuthToken>) -> bool {
        match &self.required_token {
            Some(required) => auth.as_ref() == Some(required),
            None => true,
        }
    }
}

/// Creates a connected loopback pair.
pub fn loopback() -> (LoopbackConnection, LoopbackServer) {
    let state = Arc::new(Mutex::new(LoopbackState::default()));
    let (listen_tx, listen_rx) = mpsc::unbounded_channel();
    let (write_tx, write_rx) = mpsc::unbounded_channel();
    (
        LoopbackConnection {
            state: Arc::clone(&state),
            listen_tx,
            write_tx,
        },
        LoopbackServer {
            state,
            listen_rx,
            write_rx,
        },
    )
}

/// Client half of an in-process connection.
pub struct LoopbackConnection {
    state: Arc<Mutex<LoopbackState>>,
    listen_tx: mpsc::UnboundedSender<ListenRequest>,
    write_tx: mpsc::UnboundedSender<WriteRequest>,
}

impl fmt::Debug for LoopbackConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackConnection").finish_non_exhaustive()
    }
}

impl Connection for LoopbackConnection {
    fn open_listen_stream(
        &mut self,
        auth: Option<AuthToken>,
        sink: StreamSink<WatchChange>,
    ) -> Box<dyn OutboundStream<ListenRequest>> {
        let (id, accepted) = {
            let mut state = self.state.lock();
            state.next_stream_id += 1;
            let id = state.next_stream_id;
            state.listen_opens += 1;
            let accepted = state.accepts(&auth);
            state.auth_tokens.push(auth);
            if accepted {
                state.listen = Some((id, sink.clone()));
            }
            (id, accepted)
        };
        deliver_open(StreamKind::Listen, accepted, &sink);
        Box::new(LoopbackStream {
            id,
            kind: StreamKind::Listen,
            state: Arc::clone(&self.state),
            tx: self.listen_tx.clone(),
            closed: !accepted,
        })
    }

    fn open_write_stream(
        &mut self,
        auth: Option<AuthToken>,
        sink: StreamSink<WriteResponse>,
    ) -> Box<dyn OutboundStream<WriteRequest>> {
        let (id, accepted) = {
            let mut state = self.state.lock();
            state.next_stream_id += 1;
            let id = state.next_stream_id;
            state.write_opens += 1;
            let accepted = state.accepts(&auth);
            state.auth_tokens.push(auth);
            if accepted {
                state.write = Some((id, sink.clone()));
            }
            (id, accepted)
        };
        deliver_open(StreamKind::Write, accepted, &sink);
        Box::new(LoopbackStream {
            id,
            kind: StreamKind::Write,
            state: Arc::clone(&self.state),
            tx: self.write_tx.clone(),
            closed: !accepted,
        })
    }
}

fn deliver_open<T>(kind: StreamKind, accepted: bool, sink: &StreamSink<T>) {
    if accepted {
        sink.deliver(StreamEvent::Open);
    } else {
        warn!(stream = %kind, "loopback rejected credentials");
        sink.deliver(StreamEvent::Close(Status::new(
            Code::Unauthenticated,
            "invalid token",
        )));
    }
}

struct LoopbackStream<T> {
    id: u64,
    kind: StreamKind,
    state: Arc<Mutex<LoopbackState>>,
    tx: mpsc::UnboundedSender<T>,
    closed: bool,
}

impl<T: Send> OutboundStream<T> for LoopbackStream<T> {
    fn send(&mut self, request: T) {
        if !self.closed {
            let _ = self.tx.send(request);
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let mut state = self.state.lock();
        match self.kind {
            StreamKind::Listen => {
                if state.listen.as_ref().is_some_and(|(id, _)| *id == self.id) {
                    state.listen = None;
                }
            }
            StreamKind::Write => {
                if state.write.as_ref().is_some_and(|(id, _)| *id == self.id) {
                    state.write = None;
                }
            }
        }
    }
}

/// Server half of an in-process connection.
///
/// Requests from every stream the client opened arrive in order on one
/// channel per stream kind.
pub struct LoopbackServer {
    state: Arc<Mutex<LoopbackState>>,
    listen_rx: mpsc::UnboundedReceiver<ListenRequest>,
    write_rx: mpsc::UnboundedReceiver<WriteRequest>,
}

impl fmt::Debug for LoopbackServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackServer")
            .field("listen_open", &self.is_listen_stream_open())
            .field("write_open", &self.is_write_stream_open())
            .finish()
    }
}

impl LoopbackServer {
    /// Waits for the next listen request.
    pub async fn next_listen_request(&mut self) -> Option<ListenRequest> {
        self.listen_rx.recv().await
    }

    /// Waits for the next write request.
    pub async fn next_write_request(&mut self) -> Option<WriteRequest> {
        self.write_rx.recv().await
    }

    /// Takes every listen request received so far.
    pub fn drain_listen_requests(&mut self) -> Vec<ListenRequest> {
        let mut requests = Vec::new();
        while let Ok(request) = self.listen_rx.try_recv() {
            requests.push(request);
        }
        requests
    }

    /// Takes every write request received so far.
    pub fn drain_write_requests(&mut self) -> Vec<WriteRequest> {
        let mut requests = Vec::new();
        while let Ok(request) = self.write_rx.try_recv() {
            requests.push(request);
        }
        requests
    }

    /// Sends a watch change on the open listen stream.
    ///
    /// Returns false if no listen stream is open.
    pub fn send_watch_change(&self, change: WatchChange) -> bool {
        let sink = self.state.lock().listen.as_ref().map(|(_, sink)| sink.clone());
        match sink {
            Some(sink) => {
                sink.deliver(StreamEvent::Message(change));
                true
            }
            None => false,
        }
    }

    /// Sends a response on the open write stream.
    ///
    /// Returns false if no write stream is open.
    pub fn send_write_response(&self, response: WriteResponse) -> bool {
        let sink = self.state.lock().write.as_ref().map(|(_, sink)| sink.clone());
        match sink {
            Some(sink) => {
                sink.deliver(StreamEvent::Message(response));
                true
            }
            None => false,
        }
    }

    /// Fails the open listen stream with `status`.
    pub fn close_listen_stream(&self, status: Status) -> bool {
        let slot = self.state.lock().listen.take();
        match slot {
            Some((_, sink)) => {
                sink.deliver(StreamEvent::Close(status));
                true
            }
            None => false,
        }
    }

    /// Fails the open write stream with `status`.
    pub fn close_write_stream(&self, status: Status) -> bool {
        let slot = self.state.lock().write.take();
        match slot {
            Some((_, sink)) => {
                sink.deliver(StreamEvent::Close(status));
                true
            }
            None => false,
        }
    }

    /// Returns true while the client holds an open listen stream.
    pub fn is_listen_stream_open(&self) -> bool {
        self.state.lock().listen.is_some()
    }

    /// Returns true while the client holds an open write stream.
    pub fn is_write_stream_open(&self) -> bool {
        self.state.lock().write.is_some()
    }

    /// How many times the client opened a listen stream.
    pub fn listen_stream_opens(&self) -> usize {
        self.state.lock().listen_opens
    }

    /// How many times the client opened a write stream.
    pub fn write_stream_opens(&self) -> usize {
        self.state.lock().write_opens
    }

    /// Rejects stream opens whose token differs from `token`.
    pub fn require_token(&self, token: Option<AuthToken>) {
        self.state.lock().required_token = token;
    }

    /// Tokens presented on every open so far.
    pub fn auth_tokens(&self) -> Vec<Option<AuthToken>> {
        self.state.lock().auth_tokens.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_model::SnapshotVersion;
    use docsync_protocol::WatchTargetChange;

    fn recording_sink<T: Send + 'static>() -> (StreamSink<T>, Arc<Mutex<Vec<StreamEvent<T>>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::clone(&events);
        (
            StreamSink::new(move |event| captured.lock().push(event)),
            events,
        )
    }

    #[test]
    fn loopback_delivers_in_both_directions() {
        let (mut connection, mut server) = loopback();
        let (sink, events) = recording_sink();
        let mut stream = connection.open_listen_stream(None, sink);
        assert_eq!(events.lock().as_slice(), &[StreamEvent::Open]);

        stream.send(ListenRequest::RemoveTarget { target_id: 2 });
        assert_eq!(
            server.drain_listen_requests(),
            vec![ListenRequest::RemoveTarget { target_id: 2 }]
        );

        let change = WatchChange::TargetChange(WatchTargetChange::snapshot(
            SnapshotVersion::from_millis(5),
            b"t".to_vec(),
        ));
        assert!(server.send_watch_change(change.clone()));
        assert_eq!(events.lock()[1], StreamEvent::Message(change));
    }

    #[test]
    fn closed_streams_receive_nothing() {
        let (mut connection, mut server) = loopback();
        let (sink, events) = recording_sink::<WriteResponse>();
        let mut stream = connection.open_write_stream(None, sink);
        stream.close();

        assert!(!server.is_write_stream_open());
        stream.send(WriteRequest::Handshake);
        assert!(server.drain_write_requests().is_empty());
        assert!(!server.close_write_stream(Status::new(Code::Unavailable, "gone")));
        assert_eq!(events.lock().len(), 1);
    }

    #[test]
    fn wrong_token_is_rejected() {
        let (mut connection, server) = loopback();
        server.require_token(Some(AuthToken::new("good")));
        let (sink, events) = recording_sink::<WatchChange>();
        connection.open_listen_stream(Some(AuthToken::new("bad")), sink);

        assert!(matches!(
            events.lock().as_slice(),
            [StreamEvent::Close(status)] if status.code == Code::Unauthenticated
        ));
        assert!(!server.is_listen_stream_open());
        assert_eq!(server.auth_tokens(), vec![Some(AuthToken::new("bad"))]);
    }

    #[test]
    fn server_close_reports_status() {
        let (mut connection, server) = loopback();
        let (sink, events) = recording_sink::<WatchChange>();
        let _stream = connection.open_listen_stream(None, sink);
        assert!(server.close_listen_stream(Status::new(Code::Unavailable, "restart")));
        assert_eq!(
            events.lock()[1],
            StreamEvent::Close(Status::new(Code::Unavailable, "restart"))
        );
        assert_eq!(server.listen_stream_opens(), 1);
    }
}
