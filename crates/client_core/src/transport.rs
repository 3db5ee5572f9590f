use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use pubsub::{ChannelSubscriber, Subscription, SubscriptionGuard, TransportError, TransportSignal};
use shared::{
    domain::UserId,
    protocol::{ChannelStatus, TransportFrame},
};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Reaches the server's channel bridge over one WebSocket per subscription.
///
/// `subscribe` returns at once; connection progress is reported through the
/// status signals exactly like the in-process broker does. A failed or slow
/// handshake surfaces as `TimedOut`, a broken socket as `ChannelError` and a
/// server-side close as `Closed`.
#[derive(Debug, Clone)]
pub struct WsTransport {
    server_url: String,
    user_id: UserId,
    connect_timeout: Duration,
}

impl WsTransport {
    pub fn new(server_url: impl Into<String>, user_id: UserId) -> Self {
        Self {
            server_url: server_url.into(),
            user_id,
            connect_timeout: CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn channel_url(&self, channel: &str) -> Result<Url, TransportError> {
        let mut url = Url::parse(&self.server_url).map_err(|e| TransportError::Connect {
            url: self.server_url.clone(),
            reason: e.to_string(),
        })?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme).map_err(|_| TransportError::Connect {
            url: self.server_url.clone(),
            reason: "cannot derive websocket scheme".into(),
        })?;
        url.set_path("/ws");
        url.query_pairs_mut()
            .clear()
            .append_pair("user_id", &self.user_id.0.to_string())
            .append_pair("channel", channel);
        Ok(url)
    }
}

#[async_trait]
impl ChannelSubscriber for WsTransport {
    async fn subscribe(&self, channel: &str) -> Result<Subscription, TransportError> {
        if channel.trim().is_empty() {
            return Err(TransportError::InvalidChannel(channel.to_string()));
        }
        let url = self.channel_url(channel)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let timeout = self.connect_timeout;
        let channel = channel.to_string();

        let task = tokio::spawn(async move {
            let socket = match tokio::time::timeout(timeout, connect_async(url.as_str())).await {
                Ok(Ok((socket, _))) => socket,
                Ok(Err(error)) => {
                    warn!(%channel, %error, "ws transport: connect failed");
                    let _ = tx.send(TransportSignal::Status(ChannelStatus::TimedOut));
                    return;
                }
                Err(_) => {
                    warn!(%channel, "ws transport: connect timed out");
                    let _ = tx.send(TransportSignal::Status(ChannelStatus::TimedOut));
                    return;
                }
            };
            info!(%channel, "ws transport: connected");

            let (_, mut incoming) = socket.split();
            while let Some(frame) = incoming.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<TransportFrame>(&text) {
                        Ok(TransportFrame::Status { status, .. }) => {
                            let _ = tx.send(TransportSignal::Status(status));
                        }
                        Ok(TransportFrame::Event(event)) => {
                            let _ = tx.send(TransportSignal::Event(event));
                        }
                        Err(error) => debug!(%channel, %error, "ws transport: ignoring frame"),
                    },
                    Ok(Message::Close(_)) => {
                        let _ = tx.send(TransportSignal::Status(ChannelStatus::Closed));
                        return;
                    }
                    Ok(_) => {}
                    Err(error) => {
                        warn!(%channel, %error, "ws transport: read failed");
                        let _ = tx.send(TransportSignal::Status(ChannelStatus::ChannelError));
                        return;
                    }
                }
            }
            let _ = tx.send(TransportSignal::Status(ChannelStatus::Closed));
        });

        Ok(Subscription {
            guard: SubscriptionGuard::new(move || task.abort()),
            signals: rx,
        })
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
