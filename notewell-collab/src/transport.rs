//! WebSocket transport to the collaboration relay.
//!
//! One [`Transport`] per connection attempt. [`Transport::open`] dials the
//! relay, runs the authenticated `Hello`/`HelloAck` handshake, then splits
//! the socket into a writer task (draining an outgoing byte channel) and a
//! reader task (decoding frames into an incoming channel). When the relay
//! closes the socket the incoming channel simply ends; the session manager
//! decides what to do with that.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{MessageKind, ProtocolError, RelayMessage};

/// Frames buffered in each direction before backpressure kicks in.
const CHANNEL_CAPACITY: usize = 256;

/// A live, authenticated relay connection.
pub struct Transport {
    outgoing: mpsc::Sender<Vec<u8>>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl Transport {
    /// Dial the relay and run the handshake.
    ///
    /// Sends `hello` (which carries the auth token) and waits for the
    /// relay's `HelloAck`; a relay that rejects the credential closes the
    /// socket instead, which surfaces as [`ProtocolError::ConnectionClosed`].
    /// The whole sequence is bounded by `deadline`.
    ///
    /// On success returns the transport plus the stream of incoming frames.
    pub async fn open(
        url: &str,
        hello: RelayMessage,
        deadline: std::time::Duration,
    ) -> Result<(Self, mpsc::Receiver<RelayMessage>), ProtocolError> {
        match tokio::time::timeout(deadline, Self::open_inner(url, hello)).await {
            Ok(result) => result,
            Err(_) => Err(ProtocolError::Timeout),
        }
    }

    async fn open_inner(
        url: &str,
        hello: RelayMessage,
    ) -> Result<(Self, mpsc::Receiver<RelayMessage>), ProtocolError> {
        let (mut ws_stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| {
                log::debug!("relay dial failed: {e}");
                ProtocolError::ConnectionClosed
            })?;

        let encoded = hello.encode()?;
        ws_stream
            .send(Message::Binary(encoded.into()))
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;

        // Wait for the relay's verdict on the credential.
        loop {
            match ws_stream.next().await {
                Some(Ok(Message::Binary(data))) => {
                    let bytes: Vec<u8> = data.into();
                    let msg = RelayMessage::decode(&bytes)?;
                    if msg.kind == MessageKind::HelloAck {
                        break;
                    }
                    // Nothing else is expected pre-ack; tolerate and move on.
                }
                Some(Ok(Message::Close(_))) | None => {
                    return Err(ProtocolError::ConnectionClosed);
                }
                Some(Ok(_)) => {}
                Some(Err(_)) => return Err(ProtocolError::ConnectionClosed),
            }
        }

        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(CHANNEL_CAPACITY);
        let writer = tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
        });

        let (in_tx, in_rx) = mpsc::channel::<RelayMessage>(CHANNEL_CAPACITY);
        let reader = tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                match frame {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        match RelayMessage::decode(&bytes) {
                            Ok(msg) => {
                                if in_tx.send(msg).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                log::warn!("dropping undecodable relay frame: {e}");
                            }
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            // in_tx drops here; the session sees the stream end.
        });

        Ok((
            Self {
                outgoing: out_tx,
                writer,
                reader,
            },
            in_rx,
        ))
    }

    /// Queue a frame for sending. Best-effort: a full or closed channel
    /// drops the frame, which only ever matters for traffic the sync-step
    /// exchange will recover anyway.
    pub fn send(&self, msg: &RelayMessage) {
        match msg.encode() {
            Ok(bytes) => {
                if self.outgoing.try_send(bytes).is_err() {
                    log::debug!("outgoing channel unavailable, frame dropped");
                }
            }
            Err(e) => log::warn!("failed to encode outgoing frame: {e}"),
        }
    }

    /// Tear the connection down. Safe to call more than once.
    pub fn close(&self) {
        self.writer.abort();
        self.reader.abort();
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.close();
    }
}
