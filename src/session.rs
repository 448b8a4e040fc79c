//! One live WebSocket connection with an id and a monitor loop.
//!
//! A [`Session`] owns the reader and writer tasks for a single socket and
//! exposes the primitives the handshakes and the relay are built from:
//! ordered sends, installable received-frame sinks, an intercept-next
//! future per frame kind, and an idempotent dispose carrying a close code.

use std::collections::VecDeque;
use std::fmt::Display;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow, bail};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

/// Graceful disconnect / server shutdown.
pub const NORMAL_CLOSURE: u16 = 1000;
/// Unknown server at connect time.
pub const ENDPOINT_UNAVAILABLE: u16 = 1001;
/// Mal-formed or mis-identified handshake.
pub const PROTOCOL_ERROR: u16 = 1002;
/// Invalid payload framing.
pub const INVALID_PAYLOAD: u16 = 1007;

/// What a socket message means to the session, independent of the
/// WebSocket library that produced it.
pub(crate) enum WireEvent {
    Text(String),
    Binary(Vec<u8>),
    Closed,
    /// Ping/pong and other plumbing the session does not care about.
    Ignore,
}

/// Adapter between a WebSocket library's message type and the session.
pub(crate) trait WireMessage: Sized + Send + 'static {
    fn text(text: String) -> Self;
    fn binary(bytes: Vec<u8>) -> Self;
    fn close(code: u16, reason: String) -> Self;
    fn event(self) -> WireEvent;
}

impl WireMessage for axum::extract::ws::Message {
    fn text(text: String) -> Self {
        axum::extract::ws::Message::Text(text.into())
    }

    fn binary(bytes: Vec<u8>) -> Self {
        axum::extract::ws::Message::Binary(bytes.into())
    }

    fn close(code: u16, reason: String) -> Self {
        axum::extract::ws::Message::Close(Some(axum::extract::ws::CloseFrame {
            code,
            reason: reason.into(),
        }))
    }

    fn event(self) -> WireEvent {
        match self {
            axum::extract::ws::Message::Text(text) => WireEvent::Text(text.to_string()),
            axum::extract::ws::Message::Binary(bytes) => WireEvent::Binary(bytes.to_vec()),
            axum::extract::ws::Message::Close(_) => WireEvent::Closed,
            _ => WireEvent::Ignore,
        }
    }
}

impl WireMessage for tokio_tungstenite::tungstenite::Message {
    fn text(text: String) -> Self {
        tokio_tungstenite::tungstenite::Message::Text(text.into())
    }

    fn binary(bytes: Vec<u8>) -> Self {
        tokio_tungstenite::tungstenite::Message::Binary(bytes.into())
    }

    fn close(code: u16, reason: String) -> Self {
        use tokio_tungstenite::tungstenite::protocol::CloseFrame;
        use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
        tokio_tungstenite::tungstenite::Message::Close(Some(CloseFrame {
            code: CloseCode::from(code),
            reason: reason.into(),
        }))
    }

    fn event(self) -> WireEvent {
        use tokio_tungstenite::tungstenite::Message;
        match self {
            Message::Text(text) => WireEvent::Text(text.to_string()),
            Message::Binary(bytes) => WireEvent::Binary(bytes.to_vec()),
            Message::Close(_) => WireEvent::Closed,
            _ => WireEvent::Ignore,
        }
    }
}

enum Outbound {
    Text(String),
    Binary(Vec<u8>),
    Close(u16, String),
}

/// Per-kind receive path: an optional single-slot intercept that bypasses
/// the installed sink for exactly the next frame, plus a backlog holding
/// frames that arrive before either consumer exists (the handshake gap).
struct Receive<T> {
    /// Serialises intercept callers; a second intercept waits here.
    gate: tokio::sync::Mutex<()>,
    slot: Mutex<Option<oneshot::Sender<T>>>,
    sink: Mutex<Option<flume::Sender<T>>>,
    backlog: Mutex<VecDeque<T>>,
}

impl<T> Receive<T> {
    fn new() -> Self {
        Self {
            gate: tokio::sync::Mutex::new(()),
            slot: Mutex::new(None),
            sink: Mutex::new(None),
            backlog: Mutex::new(VecDeque::new()),
        }
    }

    fn dispatch(&self, value: T) {
        if let Some(waiter) = self.slot.lock().unwrap().take() {
            let _ = waiter.send(value);
            return;
        }
        // The backlog lock also serialises against set_sink, so a frame
        // cannot slip past a sink being installed right now
        let mut backlog = self.backlog.lock().unwrap();
        let sink = self.sink.lock().unwrap().clone();
        match sink {
            // A closed sink means the consumer is gone; drop the frame
            Some(sink) => {
                let _ = sink.send(value);
            }
            // Nobody is listening yet; hold the frame for the consumer
            // the handshake is about to install
            None => backlog.push_back(value),
        }
    }

    /// Install the sink, first flushing any frames that beat it here.
    fn set_sink(&self, sink: flume::Sender<T>) {
        let mut backlog = self.backlog.lock().unwrap();
        for value in backlog.drain(..) {
            let _ = sink.send(value);
        }
        *self.sink.lock().unwrap() = Some(sink);
    }

    /// Drop the armed intercept so its future faults with "session closed".
    fn abandon(&self) {
        self.slot.lock().unwrap().take();
    }
}

pub struct Session {
    id: Uuid,
    outbound: flume::Sender<Outbound>,
    text: Receive<String>,
    binary: Receive<Vec<u8>>,
    cancel: CancellationToken,
}

impl Session {
    /// Wrap a socket, spawning its reader and writer tasks.
    pub(crate) fn spawn<S, M, RE, WE>(socket: S) -> Arc<Session>
    where
        M: WireMessage,
        RE: Display + Send + 'static,
        WE: Send + 'static,
        S: Stream<Item = Result<M, RE>> + Sink<M, Error = WE> + Send + 'static,
    {
        let (outbound_tx, outbound_rx) = flume::unbounded();
        let session = Arc::new(Session {
            id: Uuid::new_v4(),
            outbound: outbound_tx,
            text: Receive::new(),
            binary: Receive::new(),
            cancel: CancellationToken::new(),
        });

        let (mut sink, mut stream) = socket.split();

        let writer = {
            let cancel = session.cancel.clone();
            async move {
                loop {
                    tokio::select! {
                        biased;
                        frame = outbound_rx.recv_async() => match frame {
                            Ok(Outbound::Text(text)) => {
                                if sink.send(M::text(text)).await.is_err() {
                                    break;
                                }
                            }
                            Ok(Outbound::Binary(bytes)) => {
                                if sink.send(M::binary(bytes)).await.is_err() {
                                    break;
                                }
                            }
                            Ok(Outbound::Close(code, reason)) => {
                                let _ = sink.send(M::close(code, reason)).await;
                                break;
                            }
                            Err(_) => break,
                        },
                        _ = cancel.cancelled() => {
                            // Flush a queued close frame before giving up
                            while let Ok(frame) = outbound_rx.try_recv() {
                                if let Outbound::Close(code, reason) = frame {
                                    let _ = sink.send(M::close(code, reason)).await;
                                    break;
                                }
                            }
                            break;
                        }
                    }
                }
                let _ = sink.close().await;
            }
        };

        let reader = {
            let session = session.clone();
            async move {
                loop {
                    tokio::select! {
                        message = stream.next() => match message {
                            Some(Ok(message)) => match message.event() {
                                WireEvent::Text(text) => session.text.dispatch(text),
                                WireEvent::Binary(bytes) => session.binary.dispatch(bytes),
                                WireEvent::Closed => break,
                                WireEvent::Ignore => {}
                            },
                            Some(Err(error)) => {
                                debug!(session = %session.id, %error, "Socket read failed");
                                break;
                            }
                            None => break,
                        },
                        _ = session.cancel.cancelled() => break,
                    }
                }
                session.cancel.cancel();
                session.text.abandon();
                session.binary.abandon();
            }
        };

        tokio::spawn(writer);
        tokio::spawn(reader);
        session
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Queue one text frame. Fails fast once the session is disposed.
    pub fn send_text(&self, text: impl Into<String>) -> Result<()> {
        if self.cancel.is_cancelled() {
            bail!("session {} is closed", self.id);
        }
        self.outbound
            .send(Outbound::Text(text.into()))
            .map_err(|_| anyhow!("session {} is closed", self.id))
    }

    /// Queue one binary frame. Fails fast once the session is disposed.
    pub fn send_binary(&self, bytes: Vec<u8>) -> Result<()> {
        if self.cancel.is_cancelled() {
            bail!("session {} is closed", self.id);
        }
        self.outbound
            .send(Outbound::Binary(bytes))
            .map_err(|_| anyhow!("session {} is closed", self.id))
    }

    /// Install the sink receiving every text frame not claimed by an
    /// intercept. Frames that arrived before any consumer existed are
    /// delivered first. A session has at most one text consumer.
    pub fn set_text_sink(&self, sink: flume::Sender<String>) {
        self.text.set_sink(sink);
    }

    /// Binary counterpart of [`Session::set_text_sink`].
    pub fn set_binary_sink(&self, sink: flume::Sender<Vec<u8>>) {
        self.binary.set_sink(sink);
    }

    /// Resolve with the next text frame, bypassing the installed sink.
    ///
    /// Only one text intercept is outstanding at a time; a concurrent call
    /// waits until the first resolves. The handshakes depend on this
    /// strict next-message behaviour.
    pub async fn intercept_next_text(&self) -> Result<String> {
        Self::intercept(&self.text, &self.cancel)
            .await
            .with_context(|| format!("session {}", self.id))
    }

    /// Resolve with the next binary frame, bypassing the installed sink.
    pub async fn intercept_next_binary(&self) -> Result<Vec<u8>> {
        Self::intercept(&self.binary, &self.cancel)
            .await
            .with_context(|| format!("session {}", self.id))
    }

    async fn intercept<T>(receive: &Receive<T>, cancel: &CancellationToken) -> Result<T> {
        let _gate = receive.gate.lock().await;
        // A frame that raced ahead of this intercept is the next frame
        if let Some(value) = receive.backlog.lock().unwrap().pop_front() {
            return Ok(value);
        }
        if cancel.is_cancelled() {
            bail!("connection closed");
        }
        let (waiter_tx, waiter_rx) = oneshot::channel();
        *receive.slot.lock().unwrap() = Some(waiter_tx);

        tokio::select! {
            frame = waiter_rx => frame.map_err(|_| anyhow!("connection closed")),
            _ = cancel.cancelled() => {
                receive.abandon();
                bail!("connection closed");
            }
        }
    }

    /// Close the socket with `code`, idempotently. Subsequent sends and
    /// intercepts fail fast.
    pub fn dispose(&self, code: u16, reason: &str) {
        if self.cancel.is_cancelled() {
            return;
        }
        let _ = self.outbound.send(Outbound::Close(code, reason.to_string()));
        self.cancel.cancel();
    }

    /// Resolves when the session ends, whichever side initiated it.
    pub async fn closed(&self) {
        self.cancel.cancelled().await;
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    /// In-memory socket speaking axum's message type, for exercising the
    /// session without a network.
    struct FakeSocket {
        incoming: flume::r#async::RecvStream<'static, axum::extract::ws::Message>,
        sent: flume::Sender<axum::extract::ws::Message>,
    }

    fn fake_socket() -> (
        FakeSocket,
        flume::Sender<axum::extract::ws::Message>,
        flume::Receiver<axum::extract::ws::Message>,
    ) {
        let (incoming_tx, incoming_rx) = flume::unbounded();
        let (sent_tx, sent_rx) = flume::unbounded();
        (
            FakeSocket {
                incoming: incoming_rx.into_stream(),
                sent: sent_tx,
            },
            incoming_tx,
            sent_rx,
        )
    }

    impl Stream for FakeSocket {
        type Item = Result<axum::extract::ws::Message, Infallible>;

        fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            Pin::new(&mut self.incoming).poll_next(cx).map(|m| m.map(Ok))
        }
    }

    impl Sink<axum::extract::ws::Message> for FakeSocket {
        type Error = Infallible;

        fn poll_ready(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
            Poll::Ready(Ok(()))
        }

        fn start_send(
            self: Pin<&mut Self>,
            item: axum::extract::ws::Message,
        ) -> Result<(), Infallible> {
            let _ = self.sent.send(item);
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
            Poll::Ready(Ok(()))
        }
    }

    fn text(s: &str) -> axum::extract::ws::Message {
        axum::extract::ws::Message::Text(s.to_string().into())
    }

    #[tokio::test]
    async fn intercept_bypasses_sink() {
        let (socket, incoming, _sent) = fake_socket();
        let session = Session::spawn(socket);

        let (sink_tx, sink_rx) = flume::unbounded();
        session.set_text_sink(sink_tx);

        let intercept = {
            let session = session.clone();
            tokio::spawn(async move { session.intercept_next_text().await })
        };
        tokio::task::yield_now().await;

        incoming.send(text("first")).unwrap();
        incoming.send(text("second")).unwrap();

        assert_eq!(intercept.await.unwrap().unwrap(), "first");
        assert_eq!(sink_rx.recv_async().await.unwrap(), "second");
    }

    #[tokio::test]
    async fn early_frames_wait_for_a_consumer() {
        let (socket, incoming, _sent) = fake_socket();
        let session = Session::spawn(socket);

        // Nobody is listening yet; neither frame may be lost
        incoming.send(text("early")).unwrap();
        incoming.send(text("also early")).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert_eq!(session.intercept_next_text().await.unwrap(), "early");

        let (sink_tx, sink_rx) = flume::unbounded();
        session.set_text_sink(sink_tx);
        assert_eq!(sink_rx.recv_async().await.unwrap(), "also early");
    }

    #[tokio::test]
    async fn sends_are_framed_in_order() {
        let (socket, _incoming, sent) = fake_socket();
        let session = Session::spawn(socket);

        session.send_text("one").unwrap();
        session.send_text("two").unwrap();

        let first = sent.recv_async().await.unwrap();
        let second = sent.recv_async().await.unwrap();
        assert!(matches!(first, axum::extract::ws::Message::Text(t) if t.as_str() == "one"));
        assert!(matches!(second, axum::extract::ws::Message::Text(t) if t.as_str() == "two"));
    }

    #[tokio::test]
    async fn dispose_sends_close_code_and_fails_later_sends() {
        let (socket, _incoming, sent) = fake_socket();
        let session = Session::spawn(socket);

        session.dispose(PROTOCOL_ERROR, "bad handshake");
        session.dispose(NORMAL_CLOSURE, "ignored");

        let frame = sent.recv_async().await.unwrap();
        match frame {
            axum::extract::ws::Message::Close(Some(frame)) => {
                assert_eq!(frame.code, PROTOCOL_ERROR);
            }
            other => panic!("expected close frame, got {other:?}"),
        }
        assert!(session.send_text("late").is_err());
    }

    #[tokio::test]
    async fn peer_close_resolves_monitor_and_faults_intercepts() {
        let (socket, incoming, _sent) = fake_socket();
        let session = Session::spawn(socket);

        let intercept = {
            let session = session.clone();
            tokio::spawn(async move { session.intercept_next_text().await })
        };
        tokio::task::yield_now().await;

        drop(incoming);
        session.closed().await;
        assert!(intercept.await.unwrap().is_err());
    }
}
