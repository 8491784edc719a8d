//! Bidirectional message channel between a client connection and an agent.
//!
//! Both ends speak [`Message`]s. In process the two ends are wired
//! directly; across the network [`bridge_websocket`] carries one end over
//! a WebSocket as JSON text frames.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as Frame;
use tokio_tungstenite::WebSocketStream;

use crate::error::SyncError;
use crate::protocol::Message;

#[derive(Debug)]
pub struct Transport {
    pub tx: mpsc::UnboundedSender<Message>,
    pub rx: mpsc::UnboundedReceiver<Message>,
}

impl Transport {
    /// Two connected ends: what one sends, the other receives.
    pub fn pair() -> (Transport, Transport) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (
            Transport { tx: a_tx, rx: a_rx },
            Transport { tx: b_tx, rx: b_rx },
        )
    }

    pub fn send(&self, message: Message) -> Result<(), SyncError> {
        self.tx.send(message).map_err(|_| SyncError::Closed)
    }

    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }
}

/// Pumps frames between `ws` and `end` until either side closes.
///
/// Text frames are decoded into messages for `end`; messages sent into
/// `end` go out as text frames. With `ping_interval` set, WebSocket pings
/// keep idle connections alive.
pub(crate) async fn bridge_websocket<S>(
    ws: WebSocketStream<S>,
    mut end: Transport,
    ping_interval: Option<Duration>,
) -> Result<(), SyncError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = ws.split();
    let mut ping = tokio::time::interval(ping_interval.unwrap_or(Duration::from_secs(3600)));
    ping.tick().await;

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Frame::Text(text))) => match Message::decode(text.as_str()) {
                    Ok(message) => {
                        if end.send(message).is_err() {
                            break;
                        }
                    }
                    Err(e) => log::warn!("Dropping undecodable frame: {e}"),
                },
                Some(Ok(Frame::Ping(data))) => {
                    sink.send(Frame::Pong(data)).await.map_err(transport_error)?;
                }
                Some(Ok(Frame::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(transport_error(e)),
            },
            outgoing = end.recv() => match outgoing {
                Some(message) => {
                    let text = message.encode()?;
                    sink.send(Frame::Text(text.into())).await.map_err(transport_error)?;
                }
                None => {
                    let _ = sink.send(Frame::Close(None)).await;
                    break;
                }
            },
            _ = ping.tick(), if ping_interval.is_some() => {
                sink.send(Frame::Ping(Vec::new().into())).await.map_err(transport_error)?;
            }
        }
    }
    Ok(())
}

fn transport_error(e: tokio_tungstenite::tungstenite::Error) -> SyncError {
    SyncError::Transport(e.to_string())
}
