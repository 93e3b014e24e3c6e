//! Multiplexed channel transport.
//!
//! Carries N independent logical byte streams over a single websocket
//! connection. Every binary message starts with a one-byte channel index
//! followed by the payload; a zero-length payload announces that the sender
//! is done with that channel.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{bail, Result};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;

/// Duplex capability of a single logical channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// Inbound frames are dropped, writes are discarded.
    Ignore,
    Read,
    Write,
    ReadWrite,
}

impl ChannelKind {
    pub fn readable(self) -> bool {
        matches!(self, ChannelKind::Read | ChannelKind::ReadWrite)
    }

    pub fn writable(self) -> bool {
        matches!(self, ChannelKind::Write | ChannelKind::ReadWrite)
    }
}

type WireSink = Pin<Box<dyn Sink<Message, Error = tungstenite::Error> + Send>>;
type WireStream = Pin<Box<dyn Stream<Item = Result<Message, tungstenite::Error>> + Send>>;

/// State shared between the read loop and every channel writer. Sends are a
/// single critical section so frames from different channels never interleave.
struct Shared {
    sink: Mutex<WireSink>,
    idle_timeout: Option<Duration>,
    last_activity: StdMutex<Instant>,
    /// Indices of the write-capable channels, for the closing frames.
    writable: Vec<u8>,
    closed: AtomicBool,
}

impl Shared {
    fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    fn deadline(&self, idle: Duration) -> Instant {
        *self.last_activity.lock().unwrap() + idle
    }

    async fn send_frame(&self, index: u8, payload: &[u8]) -> Result<()> {
        let mut frame = Vec::with_capacity(payload.len() + 1);
        frame.push(index);
        frame.extend_from_slice(payload);
        let mut sink = self.sink.lock().await;
        sink.send(Message::Binary(frame)).await?;
        self.touch();
        Ok(())
    }

    /// Announces end-of-stream on every write-capable channel, best effort,
    /// then closes the transport. Idempotent.
    async fn close(&self) {
        let mut sink = self.sink.lock().await;
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for &index in &self.writable {
            let _ = sink.send(Message::Binary(vec![index])).await;
        }
        let _ = sink.close().await;
    }
}

/// Write half of a logical channel.
///
/// Writing to a channel without write capability silently succeeds without
/// touching the wire, so callers can treat all channels uniformly.
pub struct MuxSender {
    index: u8,
    writable: bool,
    closed: bool,
    shared: Arc<Shared>,
}

impl MuxSender {
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        if !self.writable {
            return Ok(());
        }
        self.shared.send_frame(self.index, data).await
    }

    /// Announce end-of-stream to the peer with a zero-length frame.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if self.writable {
            tracing::debug!("closing channel {}", self.index);
            self.shared.send_frame(self.index, &[]).await?;
        }
        Ok(())
    }
}

/// Read half of a logical channel. Payloads arrive in wire order; `None`
/// means the channel (or the whole connection) reached end-of-stream.
pub struct MuxReceiver {
    inbound: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl MuxReceiver {
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.inbound.recv().await
    }

    /// Read until end-of-stream, returning everything received.
    pub async fn drain(&mut self) -> Vec<u8> {
        let mut data = Vec::new();
        while let Some(chunk) = self.recv().await {
            data.extend_from_slice(&chunk);
        }
        data
    }
}

/// One logical duplex byte stream of a [`MuxConnection`].
pub struct MuxChannel {
    sender: MuxSender,
    receiver: MuxReceiver,
}

impl MuxChannel {
    pub fn split(self) -> (MuxSender, MuxReceiver) {
        (self.sender, self.receiver)
    }

    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.sender.write(data).await
    }

    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.receiver.recv().await
    }

    pub async fn close(&mut self) -> Result<()> {
        self.sender.close().await
    }
}

/// Closes the underlying connection from outside the read loop.
#[derive(Clone)]
pub struct MuxCloser {
    shared: Arc<Shared>,
}

impl MuxCloser {
    pub async fn close(&self) {
        self.shared.close().await;
    }
}

/// Demultiplexes inbound frames onto the per-channel receivers.
pub struct MuxConnection {
    stream: WireStream,
    senders: Vec<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    shared: Arc<Shared>,
}

impl MuxConnection {
    /// Bind to an established websocket and allocate one channel per entry
    /// in `kinds`, returned in channel-index order. The connection itself
    /// must be driven by awaiting [`MuxConnection::run`].
    pub fn open<S>(
        ws: WebSocketStream<S>,
        kinds: &[ChannelKind],
        idle_timeout: Option<Duration>,
    ) -> (Self, Vec<MuxChannel>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = ws.split();
        let shared = Arc::new(Shared {
            sink: Mutex::new(Box::pin(sink)),
            idle_timeout,
            last_activity: StdMutex::new(Instant::now()),
            writable: kinds
                .iter()
                .enumerate()
                .filter(|(_, kind)| kind.writable())
                .map(|(index, _)| index as u8)
                .collect(),
            closed: AtomicBool::new(false),
        });

        let mut senders = Vec::with_capacity(kinds.len());
        let mut channels = Vec::with_capacity(kinds.len());
        for (index, kind) in kinds.iter().enumerate() {
            let (tx, rx) = mpsc::unbounded_channel();
            // Dropping the sender up front makes reads on a non-readable
            // channel report end-of-stream immediately.
            senders.push(kind.readable().then_some(tx));
            channels.push(MuxChannel {
                sender: MuxSender {
                    index: index as u8,
                    writable: kind.writable(),
                    closed: false,
                    shared: shared.clone(),
                },
                receiver: MuxReceiver { inbound: rx },
            });
        }

        let conn = Self {
            stream: Box::pin(stream),
            senders,
            shared,
        };
        (conn, channels)
    }

    pub fn closer(&self) -> MuxCloser {
        MuxCloser {
            shared: self.shared.clone(),
        }
    }

    /// Inbound demultiplex loop. Resolves with `Ok(())` on a clean close and
    /// with the transport error otherwise; either way every channel reader
    /// sees end-of-stream and the underlying connection is closed.
    pub async fn run(mut self) -> Result<()> {
        let result = self.read_loop().await;
        self.senders.clear();
        self.shared.close().await;
        if let Err(err) = &result {
            tracing::debug!("mux connection terminated: {err:#}");
        }
        result
    }

    async fn read_loop(&mut self) -> Result<()> {
        loop {
            let msg = match self.shared.idle_timeout {
                Some(idle) => {
                    match tokio::time::timeout_at(self.shared.deadline(idle), self.stream.next())
                        .await
                    {
                        Ok(msg) => msg,
                        Err(_) => {
                            // A concurrent send may have re-armed the deadline
                            // while we were parked on the stream.
                            if self.shared.deadline(idle) > Instant::now() {
                                continue;
                            }
                            bail!("idle timeout: no frame activity for {:?}", idle);
                        }
                    }
                }
                None => self.stream.next().await,
            };

            self.shared.touch();
            match msg {
                Some(Ok(Message::Binary(data))) => self.dispatch(data),
                Some(Ok(Message::Close(_))) | None => break,
                // Text, ping and pong frames count as activity but carry no
                // channel data.
                Some(Ok(_)) => {}
                Some(Err(err)) => return Err(err.into()),
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, data: Vec<u8>) {
        if data.is_empty() {
            return;
        }
        let index = data[0] as usize;
        let payload = &data[1..];
        if index >= self.senders.len() {
            // The peer may speak a newer channel layout; ignore rather than
            // fail the whole connection.
            tracing::debug!("dropping frame for unknown channel {index}");
            return;
        }
        if payload.is_empty() {
            // Peer closed its end of this channel.
            self.senders[index] = None;
            return;
        }
        if let Some(tx) = &self.senders[index] {
            // A reader that already went away must not stall the connection.
            let _ = tx.send(payload.to_vec());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;
    use tokio_tungstenite::tungstenite::protocol::Role;

    async fn ws_pair() -> (
        WebSocketStream<DuplexStream>,
        WebSocketStream<DuplexStream>,
    ) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let client = WebSocketStream::from_raw_socket(a, Role::Client, None).await;
        let server = WebSocketStream::from_raw_socket(b, Role::Server, None).await;
        (client, server)
    }

    #[tokio::test]
    async fn roundtrip_on_read_write_channel() {
        let (client, mut server) = ws_pair().await;
        let (conn, mut channels) = MuxConnection::open(client, &[ChannelKind::ReadWrite], None);
        tokio::spawn(conn.run());
        let mut channel = channels.remove(0);

        channel.write(b"hello").await.unwrap();
        let frame = server.next().await.unwrap().unwrap();
        assert_eq!(frame, Message::Binary(b"\x00hello".to_vec()));

        server
            .send(Message::Binary(b"\x00world".to_vec()))
            .await
            .unwrap();
        assert_eq!(channel.recv().await.unwrap(), b"world");

        // Zero-length payload ends the channel.
        server.send(Message::Binary(vec![0])).await.unwrap();
        assert!(channel.recv().await.is_none());
    }

    #[tokio::test]
    async fn write_disabled_channel_discards_silently() {
        let (client, mut server) = ws_pair().await;
        let (conn, mut channels) = MuxConnection::open(client, &[ChannelKind::Read], None);
        tokio::spawn(conn.run());
        let mut channel = channels.remove(0);

        channel.write(b"dropped").await.unwrap();
        channel.close().await.unwrap();

        // Nothing may have reached the wire, not even the closing frame.
        let got = tokio::time::timeout(Duration::from_millis(100), server.next()).await;
        assert!(got.is_err(), "unexpected frame on the wire: {got:?}");
    }

    #[tokio::test]
    async fn out_of_range_frames_are_dropped() {
        let (client, mut server) = ws_pair().await;
        let (conn, mut channels) = MuxConnection::open(client, &[ChannelKind::Read], None);
        tokio::spawn(conn.run());
        let mut channel = channels.remove(0);

        server.send(Message::Binary(vec![7, b'x'])).await.unwrap();
        server.send(Message::Binary(vec![0, b'y'])).await.unwrap();

        // The unknown index is skipped and the loop keeps delivering.
        assert_eq!(channel.recv().await.unwrap(), b"y");
    }

    #[tokio::test]
    async fn non_readable_channel_reports_eof() {
        let (client, mut server) = ws_pair().await;
        let (conn, mut channels) =
            MuxConnection::open(client, &[ChannelKind::Write, ChannelKind::Read], None);
        tokio::spawn(conn.run());
        let mut stdin = channels.remove(0);
        let mut stdout = channels.remove(0);

        assert!(stdin.recv().await.is_none());

        server.send(Message::Binary(vec![1, b'a'])).await.unwrap();
        assert_eq!(stdout.recv().await.unwrap(), b"a");
    }

    #[tokio::test]
    async fn closing_a_channel_emits_empty_frame() {
        let (client, mut server) = ws_pair().await;
        let (conn, mut channels) = MuxConnection::open(client, &[ChannelKind::Write], None);
        tokio::spawn(conn.run());
        let mut channel = channels.remove(0);

        channel.write(b"data").await.unwrap();
        channel.close().await.unwrap();
        // Close is idempotent.
        channel.close().await.unwrap();

        assert_eq!(
            server.next().await.unwrap().unwrap(),
            Message::Binary(b"\x00data".to_vec())
        );
        assert_eq!(
            server.next().await.unwrap().unwrap(),
            Message::Binary(vec![0])
        );
        let got = tokio::time::timeout(Duration::from_millis(100), server.next()).await;
        assert!(got.is_err(), "close frame sent twice: {got:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timeout_terminates_the_connection() {
        let (client, _server) = ws_pair().await;
        let (conn, mut channels) = MuxConnection::open(
            client,
            &[ChannelKind::ReadWrite],
            Some(Duration::from_secs(1)),
        );
        let mut channel = channels.remove(0);

        let err = conn.run().await.unwrap_err();
        assert!(err.to_string().contains("idle timeout"), "{err}");

        // Every reader sees end-of-stream after the connection dies.
        assert!(channel.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn write_activity_resets_the_idle_deadline() {
        let (client, mut server) = ws_pair().await;
        let (conn, mut channels) = MuxConnection::open(
            client,
            &[ChannelKind::ReadWrite],
            Some(Duration::from_secs(1)),
        );
        let mut channel = channels.remove(0);
        let handle = tokio::spawn(conn.run());

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(600)).await;
            channel.write(&[0x1]).await.unwrap();
            let frame = server.next().await.unwrap().unwrap();
            assert_eq!(frame, Message::Binary(vec![0, 0x1]));
        }
        assert!(!handle.is_finished());

        tokio::time::sleep(Duration::from_secs(2)).await;
        let err = handle.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("idle timeout"), "{err}");
    }

    #[tokio::test]
    async fn connection_close_announces_writable_channels() {
        let (client, mut server) = ws_pair().await;
        let (conn, _channels) = MuxConnection::open(
            client,
            &[ChannelKind::Write, ChannelKind::Read, ChannelKind::ReadWrite],
            None,
        );
        let closer = conn.closer();
        tokio::spawn(conn.run());

        closer.close().await;
        // A second close must not repeat the closing frames.
        closer.close().await;

        assert_eq!(
            server.next().await.unwrap().unwrap(),
            Message::Binary(vec![0])
        );
        assert_eq!(
            server.next().await.unwrap().unwrap(),
            Message::Binary(vec![2])
        );
        match server.next().await {
            Some(Ok(Message::Close(_))) | None => {}
            other => panic!("expected transport close, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn clean_close_is_not_an_error() {
        let (client, mut server) = ws_pair().await;
        let (conn, mut channels) = MuxConnection::open(client, &[ChannelKind::Read], None);
        let mut channel = channels.remove(0);
        let handle = tokio::spawn(conn.run());

        server.close(None).await.unwrap();
        // Peer closing without data is a clean end of session.
        assert!(channel.recv().await.is_none());
        assert!(handle.await.unwrap().is_ok());
    }
}
