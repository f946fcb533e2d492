//! WebSocket transport to the inference service.

use framelink_core::channel::{Transport, TransportMessage};
use framelink_core::error::{CoreError, CoreResult};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Default)]
pub struct WsTransport {
    stream: Option<WsStream>,
}

impl WsTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn stream(&mut self) -> CoreResult<&mut WsStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| CoreError::ConnectionError("not connected".into()))
    }
}

#[async_trait::async_trait]
impl Transport for WsTransport {
    async fn connect(&mut self, endpoint: &str) -> CoreResult<()> {
        self.close().await;
        let (stream, response) = tokio_tungstenite::connect_async(endpoint)
            .await
            .map_err(|err| CoreError::ConnectionError(err.to_string()))?;
        tracing::debug!(status = %response.status(), endpoint, "websocket handshake complete");
        self.stream = Some(stream);
        Ok(())
    }

    async fn send_binary(&mut self, payload: Vec<u8>) -> CoreResult<()> {
        self.stream()?
            .send(Message::Binary(payload))
            .await
            .map_err(|err| CoreError::SendFailed(err.to_string()))
    }

    async fn send_text(&mut self, payload: String) -> CoreResult<()> {
        self.stream()?
            .send(Message::Text(payload))
            .await
            .map_err(|err| CoreError::SendFailed(err.to_string()))
    }

    async fn recv(&mut self) -> CoreResult<TransportMessage> {
        let stream = self.stream()?;
        let message = loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => break TransportMessage::Text(text),
                Some(Ok(Message::Binary(bytes))) => break TransportMessage::Binary(bytes),
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame
                        .map(|frame| format!("{} {}", u16::from(frame.code), frame.reason))
                        .unwrap_or_else(|| "closed by peer".to_string());
                    break TransportMessage::Closed { reason };
                }
                // Pings are answered by tungstenite on the next write.
                Some(Ok(_)) => continue,
                Some(Err(err)) => {
                    self.stream = None;
                    return Err(CoreError::ConnectionError(err.to_string()));
                }
                None => {
                    break TransportMessage::Closed {
                        reason: "stream ended".to_string(),
                    };
                }
            }
        };
        if matches!(message, TransportMessage::Closed { .. }) {
            self.stream = None;
        }
        Ok(message)
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(err) = stream.close(None).await {
                tracing::debug!(error = %err, "websocket close failed");
            }
        }
    }
}
