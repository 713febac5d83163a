/*!
Simulated terminal socket

Thin tokio-tungstenite client speaking the terminal side of the protocol,
used to drive a running coordinator from tests.
*/

use anyhow::{anyhow, Context, Result};
use campus_protocol::Message;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// What the peer did next
#[derive(Debug, Clone, PartialEq)]
pub enum Received {
    Frame(Message),
    Closed(Option<u16>),
}

pub struct SimulatedSocket {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl SimulatedSocket {
    /// Connect to `{base}/ws/terminals/{terminal_id}/`
    pub async fn connect(base: &str, terminal_id: &str) -> Result<Self> {
        let url = format!("{}/ws/terminals/{}/", base.trim_end_matches('/'), terminal_id);
        let (stream, _) = connect_async(url.as_str())
            .await
            .with_context(|| format!("Failed to connect to {url}"))?;
        log::debug!("[SIM] connected to {}", url);
        Ok(Self { stream })
    }

    pub async fn send(&mut self, message: &Message) -> Result<()> {
        let text = message.to_json()?;
        self.send_raw(&text).await
    }

    pub async fn send_raw(&mut self, text: &str) -> Result<()> {
        self.stream
            .send(WsMessage::Text(text.to_string().into()))
            .await
            .context("Socket send failed")
    }

    /// Next frame or close, waiting at most `within`
    pub async fn recv(&mut self, within: Duration) -> Result<Received> {
        let deadline = Instant::now() + within;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let next = timeout(remaining, self.stream.next())
                .await
                .map_err(|_| anyhow!("nothing received within {:?}", within))?;
            match next {
                Some(Ok(WsMessage::Text(text))) => return Ok(Received::Frame(Message::parse(text.as_str())?)),
                Some(Ok(WsMessage::Close(frame))) => return Ok(Received::Closed(frame.map(|f| u16::from(f.code)))),
                Some(Ok(_)) => continue,
                Some(Err(_)) | None => return Ok(Received::Closed(None)),
            }
        }
    }

    /// Skip frames until one of `kind` arrives
    pub async fn recv_kind(&mut self, kind: &str, within: Duration) -> Result<Message> {
        let deadline = Instant::now() + within;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.recv(remaining).await? {
                Received::Frame(message) if message.kind() == kind => return Ok(message),
                Received::Frame(_) => continue,
                Received::Closed(code) => return Err(anyhow!("closed ({code:?}) while waiting for {kind}")),
            }
        }
    }

    /// Skip frames until the peer closes; returns the close code
    pub async fn closed(&mut self, within: Duration) -> Result<Option<u16>> {
        let deadline = Instant::now() + within;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if let Received::Closed(code) = self.recv(remaining).await? {
                return Ok(code);
            }
        }
    }

    pub async fn close(mut self) -> Result<()> {
        self.stream.close(None).await.context("Socket close failed")
    }
}
