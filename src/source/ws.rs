use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::export::health::HealthMetrics;
use crate::observation::now_micros;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One JSON-RPC style stream subscription.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub endpoint: String,
    /// Authentication header name and value.
    pub auth_header: &'static str,
    pub auth_value: String,
    pub stream: &'static str,
    pub include: &'static [&'static str],
}

/// Notification envelope: `{"params": {"result": <payload>}}`.
#[derive(Debug, Deserialize)]
struct Notification<T> {
    params: NotificationParams<T>,
}

#[derive(Debug, Deserialize)]
struct NotificationParams<T> {
    result: T,
}

/// Decodes the payload of a notification frame.
pub fn decode_notification<T: DeserializeOwned>(text: &str) -> Result<T> {
    let notification: Notification<T> =
        serde_json::from_str(text).context("decoding notification")?;
    Ok(notification.params.result)
}

/// Builds the subscribe request for a stream.
pub fn subscribe_request(stream: &str, include: &[&str]) -> String {
    serde_json::json!({
        "id": 1,
        "method": "subscribe",
        "params": [stream, { "include": include }],
    })
    .to_string()
}

/// Connects, subscribes, and consumes the confirmation frame, all within
/// `timeout`.
pub async fn subscribe(sub: &Subscription, timeout: Duration) -> Result<WsStream> {
    match tokio::time::timeout(timeout, connect_and_subscribe(sub)).await {
        Ok(result) => result,
        Err(_) => bail!(
            "subscribing to {} on {} timed out after {timeout:?}",
            sub.stream,
            sub.endpoint
        ),
    }
}

async fn connect_and_subscribe(sub: &Subscription) -> Result<WsStream> {
    let mut request = sub
        .endpoint
        .as_str()
        .into_client_request()
        .with_context(|| format!("building websocket request for {}", sub.endpoint))?;

    let value = HeaderValue::from_str(&sub.auth_value).context("invalid auth header value")?;
    request.headers_mut().insert(sub.auth_header, value);

    let (mut ws, response) = connect_async(request)
        .await
        .with_context(|| format!("connecting to {}", sub.endpoint))?;

    debug!(endpoint = %sub.endpoint, status = %response.status(), "websocket connected");

    ws.send(Message::Text(subscribe_request(sub.stream, sub.include)))
        .await
        .context("sending subscribe request")?;

    // The first frame confirms the subscription.
    match ws.next().await {
        Some(Ok(_)) => {}
        Some(Err(e)) => return Err(e).context("reading subscription confirmation"),
        None => bail!("connection closed before subscription confirmation"),
    }

    info!(endpoint = %sub.endpoint, stream = sub.stream, "subscribed");

    Ok(ws)
}

/// Reads frames until cancellation or a transport error, timestamping each
/// frame on receipt and forwarding what `decode` produces.
///
/// Frames that fail to decode are logged, counted, and dropped.
pub async fn read_frames<T, F>(
    mut ws: WsStream,
    source: String,
    tx: mpsc::Sender<T>,
    cancel: CancellationToken,
    health: Option<Arc<HealthMetrics>>,
    mut decode: F,
) where
    F: FnMut(&str, i64) -> Result<Vec<T>>,
{
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = ws.close(None).await;
                debug!(source = %source, "reader cancelled");
                return;
            }
            message = ws.next() => message,
        };

        let timestamp = now_micros();

        let text = match message {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(e) => {
                    record_decode_error(&health, &source);
                    warn!(source = %source, error = %e, "dropping non-utf8 frame");
                    continue;
                }
            },
            Some(Ok(Message::Close(frame))) => {
                warn!(source = %source, ?frame, "server closed connection");
                return;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                warn!(source = %source, error = %e, "websocket read failed, stopping reader");
                return;
            }
            None => {
                warn!(source = %source, "websocket stream ended");
                return;
            }
        };

        let items = match decode(&text, timestamp) {
            Ok(items) => items,
            Err(e) => {
                record_decode_error(&health, &source);
                warn!(source = %source, error = %format!("{e:#}"), "dropping malformed message");
                continue;
            }
        };

        for item in items {
            if !forward(&tx, item, &source, &health).await {
                debug!(source = %source, "channel closed, stopping reader");
                return;
            }
        }
    }
}

/// Sends without blocking when there is room; otherwise records saturation
/// and waits. Returns false once the receiver is gone.
pub async fn forward<T>(
    tx: &mpsc::Sender<T>,
    item: T,
    source: &str,
    health: &Option<Arc<HealthMetrics>>,
) -> bool {
    let item = match tx.try_send(item) {
        Ok(()) => {
            record_received(health, source);
            return true;
        }
        Err(TrySendError::Closed(_)) => return false,
        Err(TrySendError::Full(item)) => item,
    };

    warn!(source, capacity = tx.max_capacity(), "observation channel full");
    if let Some(health) = health {
        health.channel_saturated.with_label_values(&[source]).inc();
    }

    if tx.send(item).await.is_err() {
        return false;
    }
    record_received(health, source);
    true
}

fn record_received(health: &Option<Arc<HealthMetrics>>, source: &str) {
    if let Some(health) = health {
        health
            .observations_received
            .with_label_values(&[source])
            .inc();
    }
}

fn record_decode_error(health: &Option<Arc<HealthMetrics>>, source: &str) {
    if let Some(health) = health {
        health.decode_errors.with_label_values(&[source]).inc();
    }
}
