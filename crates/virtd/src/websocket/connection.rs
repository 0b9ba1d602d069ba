//! One upgraded socket.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::debug;

use crate::transport::{ConnectionError, ConnectionId, ConnectionObserver};

use super::{WEBSOCKET_TARGET, WebSocketError};

/// Send handle for one upgraded socket.
///
/// Frames are queued on an unbounded channel drained by the session's writer
/// task, so a send never waits on the peer. Identity is the allocation: the
/// pool compares handles with [`Arc::ptr_eq`].
pub struct WebSocketConnection {
    id: ConnectionId,
    user: String,
    outbound: Mutex<Option<UnboundedSender<Message>>>,
    observer: Arc<dyn ConnectionObserver>,
}

impl WebSocketConnection {
    /// Creates a handle and the receiver its writer task drains.
    pub fn new(
        id: ConnectionId,
        user: impl Into<String>,
        observer: Arc<dyn ConnectionObserver>,
    ) -> (Self, UnboundedReceiver<Message>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let connection = Self {
            id,
            user: user.into(),
            outbound: Mutex::new(Some(sender)),
            observer,
        };
        (connection, receiver)
    }

    /// Connection identifier assigned at accept time.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// User the socket subscribed for.
    #[must_use]
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Queues a frame.
    ///
    /// # Errors
    ///
    /// Returns [`WebSocketError::Closed`] once the session has ended.
    pub fn send(&self, message: Message) -> Result<(), WebSocketError> {
        let closed = || WebSocketError::Closed {
            connection: self.id,
        };
        match self.outbound().as_ref() {
            Some(sender) => sender.send(message).map_err(|_| closed()),
            None => Err(closed()),
        }
    }

    /// Queues a text frame.
    ///
    /// # Errors
    ///
    /// See [`WebSocketConnection::send`].
    pub fn send_text(&self, text: &str) -> Result<(), WebSocketError> {
        self.send(Message::Text(text.to_owned()))
    }

    /// Stops accepting frames. The writer flushes what is queued, sends a
    /// close frame and ends.
    pub fn close(&self) {
        self.outbound().take();
    }

    /// True until [`WebSocketConnection::close`] runs.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.outbound()
            .as_ref()
            .is_some_and(|sender| !sender.is_closed())
    }

    /// Hands `error` to this connection's observer.
    pub fn report(&self, error: WebSocketError) {
        self.observer
            .on_error(self.id, &ConnectionError::WebSocket { source: error });
    }

    fn outbound(&self) -> MutexGuard<'_, Option<UnboundedSender<Message>>> {
        self.outbound.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for WebSocketConnection {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("WebSocketConnection")
            .field("id", &self.id)
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

/// Drives an upgraded socket until either side closes it.
///
/// A writer task owns the sink and drains `outbound`. The calling task reads:
/// pings are answered, a close frame ends the session, and client text is
/// ignored. On return the handle is closed and the writer has finished.
///
/// # Errors
///
/// Returns the first protocol error from either direction.
pub async fn serve_session<S>(
    stream: WebSocketStream<S>,
    connection: &WebSocketConnection,
    mut outbound: UnboundedReceiver<Message>,
) -> Result<(), WebSocketError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut frames) = stream.split();
    let writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            if let Err(error) = sink.send(message).await {
                return if is_closed(&error) { Ok(()) } else { Err(error) };
            }
        }
        match sink.close().await {
            Err(error) if !is_closed(&error) => Err(error),
            _ => Ok::<(), tungstenite::Error>(()),
        }
    });

    let read = async {
        while let Some(frame) = frames.next().await {
            match frame {
                Ok(Message::Ping(payload)) => {
                    if connection.send(Message::Pong(payload)).is_err() {
                        break;
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(error) if is_closed(&error) => break,
                Err(error) => return Err(WebSocketError::from(error)),
            }
        }
        Ok(())
    }
    .await;
    debug!(
        target: WEBSOCKET_TARGET,
        connection = connection.id(),
        user = connection.user(),
        "websocket session ending"
    );

    connection.close();
    let written = writer
        .await
        .map_err(|source| WebSocketError::Writer { source })?;
    read?;
    written.map_err(WebSocketError::from)
}

fn is_closed(error: &tungstenite::Error) -> bool {
    matches!(
        error,
        tungstenite::Error::ConnectionClosed
            | tungstenite::Error::AlreadyClosed
            | tungstenite::Error::Protocol(ProtocolError::SendAfterClosing)
    )
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{DuplexStream, duplex};
    use tokio_tungstenite::tungstenite::protocol::Role;

    use crate::tests::support::RecordingObserver;

    use super::*;

    async fn pair() -> (WebSocketStream<DuplexStream>, WebSocketStream<DuplexStream>) {
        let (client, server) = duplex(16 * 1024);
        let client = WebSocketStream::from_raw_socket(client, Role::Client, None).await;
        let server = WebSocketStream::from_raw_socket(server, Role::Server, None).await;
        (client, server)
    }

    fn handle() -> (Arc<WebSocketConnection>, UnboundedReceiver<Message>) {
        let (connection, outbound) =
            WebSocketConnection::new(3, "bob", Arc::new(RecordingObserver::default()));
        (Arc::new(connection), outbound)
    }

    #[tokio::test]
    async fn queued_text_reaches_the_client() {
        let (mut client, server) = pair().await;
        let (connection, outbound) = handle();
        let session = {
            let connection = Arc::clone(&connection);
            tokio::spawn(async move { serve_session(server, &connection, outbound).await })
        };

        connection.send_text(r#"{"event":"started"}"#).expect("send");
        let frame = client.next().await.expect("frame").expect("valid frame");
        assert_eq!(frame, Message::Text(r#"{"event":"started"}"#.to_owned()));

        client.close(None).await.expect("client close");
        session.await.expect("session task").expect("clean session");
        assert!(!connection.is_open());
    }

    #[tokio::test]
    async fn pings_are_answered() {
        let (mut client, server) = pair().await;
        let (connection, outbound) = handle();
        let session = {
            let connection = Arc::clone(&connection);
            tokio::spawn(async move { serve_session(server, &connection, outbound).await })
        };

        client
            .send(Message::Ping(b"heartbeat".to_vec()))
            .await
            .expect("ping");
        let reply = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("reply in time")
            .expect("frame")
            .expect("valid frame");
        assert_eq!(reply, Message::Pong(b"heartbeat".to_vec()));

        client.close(None).await.expect("client close");
        session.await.expect("session task").expect("clean session");
    }

    #[tokio::test]
    async fn server_close_ends_the_session() {
        let (mut client, server) = pair().await;
        let (connection, outbound) = handle();
        let session = {
            let connection = Arc::clone(&connection);
            tokio::spawn(async move { serve_session(server, &connection, outbound).await })
        };

        connection.close();
        let mut saw_close = false;
        while let Some(Ok(frame)) = client.next().await {
            saw_close |= frame.is_close();
        }

        assert!(saw_close, "server sends a close frame");

        session.await.expect("session task").expect("clean session");
    }

    #[test]
    fn sends_after_close_are_refused() {
        let (connection, _outbound) = handle();
        connection.close();

        let error = connection.send_text("late").expect_err("closed");

        assert!(matches!(error, WebSocketError::Closed { connection: 3 }));
    }
}
