//! Cloud session: a single reconnecting, mTLS-authenticated WebSocket.
//!
//! The wire carries JSON text frames `{"topic": ..., "payload": {...}}` in
//! both directions. Inbound frames dispatch in arrival order; outbound
//! traffic (handler replies, heartbeats) goes through a bounded channel and
//! is dropped while the session is down. Reconnects back off exponentially
//! between one and five seconds, jittered.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::Connector;
use tracing::{debug, info, warn};

use crate::dispatch::Dispatcher;

/// One message on the cloud channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub topic: String,
    pub payload: Value,
}

/// Handle for emitting messages toward the cloud. Sends never block: when
/// the session is down or the channel is full the message is dropped and the
/// next emission carries fresh state.
#[derive(Clone)]
pub struct Outbound {
    tx: mpsc::Sender<Envelope>,
}

impl Outbound {
    pub fn new(tx: mpsc::Sender<Envelope>) -> Self {
        Self { tx }
    }

    pub fn emit(&self, topic: &str, payload: Value) -> bool {
        self.tx
            .try_send(Envelope {
                topic: topic.to_string(),
                payload,
            })
            .is_ok()
    }
}

/// Reconnect backoff bounded to the configured window, with jitter so a
/// fleet of agents does not stampede the controller after an outage.
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: f64,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter: 0.25,
            attempt: 0,
        }
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn next_delay(&mut self) -> Duration {
        let exp = self.base.as_millis() as f64 * 2.0_f64.powi(self.attempt.min(16) as i32);
        let capped = exp.min(self.max.as_millis() as f64);
        let jittered = capped + time_jitter(capped * self.jitter);
        self.attempt = self.attempt.saturating_add(1);
        Duration::from_millis(jittered.clamp(self.base.as_millis() as f64, self.max.as_millis() as f64) as u64)
    }
}

/// Cheap jitter from the system clock; cryptographic quality is not needed
/// for reconnect spreading.
fn time_jitter(range: f64) -> f64 {
    let seed = std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    let mixed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    let normalized = (mixed >> 11) as f64 / (1u64 << 53) as f64;
    (normalized * 2.0 - 1.0) * range
}

pub struct Session {
    url: String,
    tls: Arc<rustls::ClientConfig>,
    dispatcher: Arc<Dispatcher>,
    outbound_rx: mpsc::Receiver<Envelope>,
}

impl Session {
    pub fn new(
        url: String,
        tls: Arc<rustls::ClientConfig>,
        dispatcher: Arc<Dispatcher>,
        outbound_rx: mpsc::Receiver<Envelope>,
    ) -> Self {
        Self {
            url,
            tls,
            dispatcher,
            outbound_rx,
        }
    }

    /// Connect-dispatch-reconnect loop. Survives arbitrarily long outages;
    /// returns only on shutdown.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(5));

        loop {
            if *shutdown.borrow() {
                break;
            }

            info!(url = %self.url, "Connecting to cloud controller");
            let connector = Connector::Rustls(Arc::clone(&self.tls));

            match tokio_tungstenite::connect_async_tls_with_config(
                self.url.as_str(),
                None,
                false,
                Some(connector),
            )
            .await
            {
                Ok((stream, _response)) => {
                    info!("Cloud session established");
                    backoff.reset();

                    // Anything queued during the outage is stale by contract.
                    while self.outbound_rx.try_recv().is_ok() {}

                    self.dispatcher.on_connect();
                    self.run_connection(stream, &mut shutdown).await;
                    self.dispatcher.on_disconnect();

                    if *shutdown.borrow() {
                        break;
                    }
                    warn!("Cloud session closed");
                }
                Err(err) => {
                    warn!(error = %err, "Cloud connection failed");
                }
            }

            let delay = backoff.next_delay();
            debug!(delay_ms = delay.as_millis() as u64, "Reconnecting after backoff");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Cloud session loop stopped");
    }

    async fn run_connection<S>(
        &mut self,
        stream: tokio_tungstenite::WebSocketStream<S>,
        shutdown: &mut watch::Receiver<bool>,
    ) where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let (mut sink, mut source) = stream.split();
        let dispatcher = Arc::clone(&self.dispatcher);
        let outbound_rx = &mut self.outbound_rx;

        loop {
            tokio::select! {
                // Shutdown first: stop accepting new commands immediately.
                biased;

                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        let _ = sink.send(Message::Close(None)).await;
                        return;
                    }
                }

                outbound = outbound_rx.recv() => {
                    let Some(envelope) = outbound else { return };
                    if !send_envelope(&mut sink, &envelope).await {
                        return;
                    }
                }

                inbound = source.next() => {
                    match inbound {
                        Some(Ok(Message::Text(text))) => {
                            let Some(envelope) = decode_envelope(&text) else { continue };
                            debug!(topic = %envelope.topic, "Inbound message");
                            if let Some(reply) = dispatcher
                                .dispatch(&envelope.topic, envelope.payload)
                                .await
                            {
                                let reply = Envelope {
                                    topic: envelope.topic,
                                    payload: reply,
                                };
                                if !send_envelope(&mut sink, &reply).await {
                                    return;
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if sink.send(Message::Pong(data)).await.is_err() {
                                return;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => return,
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            warn!(error = %err, "Cloud session read error");
                            return;
                        }
                    }
                }
            }
        }
    }
}

fn decode_envelope(text: &str) -> Option<Envelope> {
    match serde_json::from_str(text) {
        Ok(envelope) => Some(envelope),
        Err(err) => {
            warn!(error = %err, "Malformed frame from cloud, skipping");
            None
        }
    }
}

async fn send_envelope<S>(
    sink: &mut futures_util::stream::SplitSink<
        tokio_tungstenite::WebSocketStream<S>,
        Message,
    >,
    envelope: &Envelope,
) -> bool
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let text = match serde_json::to_string(envelope) {
        Ok(text) => text,
        Err(err) => {
            warn!(error = %err, "Could not encode outbound envelope");
            return true;
        }
    };
    sink.send(Message::Text(text)).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_stays_within_bounds() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(5));
        for _ in 0..20 {
            let delay = backoff.next_delay();
            assert!(delay >= Duration::from_secs(1), "delay too small: {delay:?}");
            assert!(delay <= Duration::from_secs(5), "delay too large: {delay:?}");
        }
    }

    #[test]
    fn test_backoff_reset_restarts_growth() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(5));
        for _ in 0..10 {
            backoff.next_delay();
        }
        backoff.reset();
        assert_eq!(backoff.attempt, 0);
    }

    #[test]
    fn test_envelope_roundtrip() {
        let envelope = Envelope {
            topic: "heartbeat".to_string(),
            payload: serde_json::json!({"agent_id": "edge-01", "cpu_usage": 12.5}),
        };
        let text = serde_json::to_string(&envelope).unwrap();
        let decoded = decode_envelope(&text).unwrap();
        assert_eq!(decoded.topic, "heartbeat");
        assert_eq!(decoded.payload["agent_id"], "edge-01");
    }

    #[test]
    fn test_malformed_frame_is_skipped() {
        assert!(decode_envelope("{\"nope\": ").is_none());
        assert!(decode_envelope("[1,2,3]").is_none());
    }

    #[tokio::test]
    async fn test_outbound_drops_when_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let outbound = Outbound::new(tx);

        assert!(outbound.emit("heartbeat", serde_json::json!({})));
        // Channel full: dropped, not blocked.
        assert!(!outbound.emit("heartbeat", serde_json::json!({})));

        rx.recv().await.unwrap();
        assert!(outbound.emit("heartbeat", serde_json::json!({})));
    }
}
