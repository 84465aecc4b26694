//! Client side of the realtime websocket.
//!
//! A [`RealtimeChannel`] owns one connection and one topic. Inserted rows
//! arrive through [`RealtimeChannel::recv`]; dropping the channel closes it.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::errors::AppError;
use crate::realtime::{ClientFrame, ServerFrame};

const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct RealtimeChannel {
    topic: String,
    events: mpsc::UnboundedReceiver<Value>,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl RealtimeChannel {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next inserted record, or `None` once the connection is gone.
    pub async fn recv(&mut self) -> Option<Value> {
        self.events.recv().await
    }

    /// Leave the topic and close the socket.
    pub async fn unsubscribe(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::debug!("Realtime reader for {} ended abnormally: {}", self.topic, e);
            }
        }
    }
}

impl Drop for RealtimeChannel {
    fn drop(&mut self) {
        // Dropping the stop sender ends the reader loop
        self.stop.take();
    }
}

/// Connect, subscribe and wait for the server's acknowledgement.
pub(crate) async fn connect(
    url: Url,
    topic: &str,
    table: &str,
    filter: Option<String>,
) -> Result<RealtimeChannel, AppError> {
    let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
    let (mut ws_tx, mut ws_rx) = StreamExt::split(ws_stream);

    let subscribe = ClientFrame::Subscribe {
        topic: topic.to_string(),
        table: table.to_string(),
        filter,
    };
    ws_tx
        .send(Message::Text(serde_json::to_string(&subscribe)?))
        .await?;

    let ack = tokio::time::timeout(SUBSCRIBE_TIMEOUT, async {
        while let Some(message) = ws_rx.next().await {
            let Message::Text(text) = message? else {
                continue;
            };
            match serde_json::from_str::<ServerFrame>(&text) {
                Ok(ServerFrame::Subscribed { topic: acked }) if acked == topic => return Ok(()),
                Ok(ServerFrame::Error { message }) => return Err(AppError::Realtime(message)),
                Ok(_) => {}
                Err(e) => tracing::debug!("Ignoring realtime frame: {}", e),
            }
        }
        Err(AppError::Realtime("Connection closed before subscribing".to_string()))
    })
    .await;
    match ack {
        Ok(result) => result?,
        Err(_) => {
            return Err(AppError::Realtime(format!(
                "Timed out subscribing to {}",
                topic
            )))
        }
    }

    let (events_tx, events) = mpsc::unbounded_channel();
    let (stop, mut stop_rx) = oneshot::channel::<()>();
    let owned_topic = topic.to_string();

    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut stop_rx => {
                    let leave = ClientFrame::Unsubscribe { topic: owned_topic.clone() };
                    if let Ok(text) = serde_json::to_string(&leave) {
                        let _ = ws_tx.send(Message::Text(text)).await;
                    }
                    let _ = ws_tx.close().await;
                    break;
                }
                incoming = ws_rx.next() => {
                    let text = match incoming {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            tracing::warn!("Realtime connection for {} failed: {}", owned_topic, e);
                            break;
                        }
                    };
                    match serde_json::from_str::<ServerFrame>(&text) {
                        Ok(ServerFrame::Insert { topic, record, .. }) if topic == owned_topic => {
                            if events_tx.send(record).is_err() {
                                break;
                            }
                        }
                        Ok(ServerFrame::Error { message }) => {
                            tracing::warn!("Realtime error on {}: {}", owned_topic, message);
                        }
                        Ok(_) => {}
                        Err(e) => tracing::debug!("Ignoring realtime frame: {}", e),
                    }
                }
            }
        }
        tracing::debug!("Realtime reader for {} stopped", owned_topic);
    });

    tracing::info!("Subscribed to {} on {}", topic, table);
    Ok(RealtimeChannel {
        topic: topic.to_string(),
        events,
        stop: Some(stop),
        task: Some(task),
    })
}
