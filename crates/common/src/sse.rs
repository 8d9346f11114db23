// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Devtunnel Host Contributors

//! Server-Sent Events listener for real-time host status updates

use futures_util::StreamExt;
use reqwest::Response;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};

use crate::{DaemonClient, HostEvent, Result};

/// Event listener for daemon SSE stream
pub struct EventListener {
    client: DaemonClient,
}

impl EventListener {
    pub fn new(client: DaemonClient) -> Self {
        Self { client }
    }

    /// Subscribe once; returns after the daemon accepted the stream so that
    /// requests sent afterwards cannot race ahead of the subscription.
    pub async fn connect(&self) -> Result<mpsc::Receiver<HostEvent>> {
        let response = self.client.open_event_stream().await?;
        let (tx, rx) = mpsc::channel(100);

        tokio::spawn(async move {
            forward_events(response, &tx).await;
        });

        Ok(rx)
    }

    /// Start listening to daemon events.
    /// Automatically reconnects with exponential backoff if the stream drops.
    pub fn listen(&self) -> mpsc::Receiver<HostEvent> {
        let (tx, rx) = mpsc::channel(100);

        let client = self.client.clone();
        tokio::spawn(async move {
            let mut backoff = Duration::from_secs(1);
            let max_backoff = Duration::from_secs(30);

            loop {
                match client.open_event_stream().await {
                    Ok(response) => {
                        backoff = Duration::from_secs(1);
                        forward_events(response, &tx).await;
                    }
                    Err(e) => tracing::warn!("Event stream error: {}", e),
                }

                // If receiver is dropped, stop trying
                if tx.is_closed() {
                    break;
                }

                sleep(backoff).await;
                backoff = (backoff * 2).min(max_backoff);
            }
        });

        rx
    }
}

async fn forward_events(response: Response, tx: &mpsc::Sender<HostEvent>) {
    let mut stream = response.bytes_stream();
    let mut buffer = String::new();

    while let Some(chunk) = stream.next().await {
        let bytes = match chunk {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!("Error reading event stream: {}", e);
                return;
            }
        };

        buffer.push_str(&String::from_utf8_lossy(&bytes));
        // axum may emit CRLF separators
        if buffer.contains('\r') {
            buffer = buffer.replace("\r\n", "\n");
        }

        while let Some(pos) = buffer.find("\n\n") {
            let message: String = buffer.drain(..pos + 2).collect();

            if let Some(event) = parse_sse_message(&message) {
                if tx.send(event).await.is_err() {
                    tracing::debug!("Receiver dropped, stopping event listener");
                    return;
                }
            }
        }
    }
}

/// Parse an SSE message into a HostEvent
fn parse_sse_message(message: &str) -> Option<HostEvent> {
    let data: Vec<&str> = message
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(str::trim_start)
        .collect();

    if data.is_empty() {
        return None;
    }

    let payload = data.join("\n");
    match serde_json::from_str::<HostEvent>(&payload) {
        Ok(event) => Some(event),
        Err(e) => {
            tracing::warn!("Failed to parse SSE event: {} (error: {})", payload, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sse_message() {
        let message = "event: host\ndata: {\"type\":\"heartbeat\",\"timestamp\":\"2025-01-01T00:00:00Z\"}\n\n";
        let event = parse_sse_message(message).unwrap();
        assert!(matches!(event, HostEvent::Heartbeat { .. }));
    }

    #[test]
    fn test_parse_ignores_comments_and_garbage() {
        assert!(parse_sse_message(": keep-alive\n\n").is_none());
        assert!(parse_sse_message("data: not json\n\n").is_none());
    }
}
