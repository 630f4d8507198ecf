//! Broker client (§4.A): durable consumer bind/create, pull fetch, ack/nak, publish.
//!
//! Control flow follows `original_source/.../main.py`'s JetStream setup; the transient-vs-
//! permanent error classification and retry loop follow this codebase's `worker.rs` log-dedup
//! retry pattern.

use crate::error::BrokerError;
use async_nats::jetstream::consumer::pull::Config as PullConfig;
use async_nats::jetstream::consumer::{AckPolicy, Consumer};
use async_nats::jetstream::AckKind;
use async_nats::jetstream::Context as JetStreamContext;
use async_nats::{Client, HeaderMap};
use futures::StreamExt;
use std::time::Duration;

pub const CONSUMER_ACK_WAIT: Duration = Duration::from_secs(1800);
pub const CONSUMER_MAX_DELIVER: i64 = 3;
pub const CONSUMER_MAX_ACK_PENDING: i64 = 10;
const BIND_RETRY_DELAY: Duration = Duration::from_secs(2);
const BIND_RETRY_ATTEMPTS: u32 = 30;

/// One pulled message: raw payload, trace headers, and the JetStream handle needed to ack it.
pub struct BrokerMessage {
    pub payload: Vec<u8>,
    pub headers: Option<HeaderMap>,
    inner: async_nats::jetstream::Message,
}

impl BrokerMessage {
    pub fn traceparent(&self) -> Option<String> {
        self.headers
            .as_ref()
            .and_then(|h| h.get("traceparent"))
            .map(|v| v.to_string())
    }

    pub fn tracestate(&self) -> Option<String> {
        self.headers
            .as_ref()
            .and_then(|h| h.get("tracestate"))
            .map(|v| v.to_string())
    }

    pub async fn ack(&self) -> Result<(), BrokerError> {
        self.inner
            .ack()
            .await
            .map_err(|e| BrokerError::Publish(format!("ack failed: {e}")))
    }

    pub async fn nak(&self) -> Result<(), BrokerError> {
        self.inner
            .ack_with(AckKind::Nak(None))
            .await
            .map_err(|e| BrokerError::Publish(format!("nak failed: {e}")))
    }
}

pub struct BrokerClient {
    client: Client,
    jetstream: JetStreamContext,
    consumer: Consumer<PullConfig>,
    consecutive_errors: u32,
}

fn is_transient(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("no responders")
        || lower.contains("service unavailable")
        || lower.contains("timed out")
        || lower.contains("stream not found")
}

impl BrokerClient {
    /// Connect, then run the bind/create consumer protocol (§4.A).
    pub async fn connect(
        broker_url: &str,
        stream_name: &str,
        consumer_name: &str,
    ) -> Result<Self, BrokerError> {
        let client = async_nats::connect(broker_url)
            .await
            .map_err(|e| BrokerError::ConsumerSetup(format!("connect failed: {e}")))?;
        let jetstream = async_nats::jetstream::new(client.clone());

        let mut last_err = None;
        for attempt in 0..BIND_RETRY_ATTEMPTS {
            match Self::bind_or_create(&jetstream, stream_name, consumer_name).await {
                Ok(consumer) => {
                    return Ok(Self {
                        client,
                        jetstream,
                        consumer,
                        consecutive_errors: 0,
                    });
                }
                Err(err) => {
                    let retryable = is_transient(&err.to_string());
                    tracing::warn!(attempt, retryable, error = %err, "consumer bind/create failed");
                    if !retryable {
                        return Err(err);
                    }
                    last_err = Some(err);
                    tokio::time::sleep(BIND_RETRY_DELAY).await;
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            BrokerError::ConsumerSetup("exhausted bind/create retries".to_string())
        }))
    }

    async fn bind_or_create(
        jetstream: &JetStreamContext,
        stream_name: &str,
        consumer_name: &str,
    ) -> Result<Consumer<PullConfig>, BrokerError> {
        let stream = jetstream
            .get_stream(stream_name)
            .await
            .map_err(|e| BrokerError::ConsumerSetup(format!("get_stream: {e}")))?;

        match stream.get_consumer::<PullConfig>(consumer_name).await {
            Ok(consumer) => Ok(consumer),
            Err(_) => stream
                .create_consumer(PullConfig {
                    durable_name: Some(consumer_name.to_string()),
                    ack_policy: AckPolicy::Explicit,
                    ack_wait: CONSUMER_ACK_WAIT,
                    max_deliver: CONSUMER_MAX_DELIVER,
                    max_ack_pending: CONSUMER_MAX_ACK_PENDING,
                    ..Default::default()
                })
                .await
                .map_err(|e| BrokerError::ConsumerSetup(format!("create_consumer: {e}"))),
        }
    }

    /// Pull up to `batch` messages, waiting up to `timeout`. An empty result on timeout is
    /// normal. Transient cluster-unavailable errors are retried with backoff capped at 30s;
    /// the consecutive-error counter resets on any successful fetch.
    pub async fn fetch(
        &mut self,
        batch: u32,
        timeout: Duration,
    ) -> Result<Vec<BrokerMessage>, BrokerError> {
        loop {
            let result = self
                .consumer
                .fetch()
                .max_messages(batch as usize)
                .expires(timeout)
                .messages()
                .await;

            let mut stream = match result {
                Ok(stream) => stream,
                Err(e) => return self.handle_fetch_error(e.to_string()).await,
            };

            let mut out = Vec::new();
            while let Some(next) = stream.next().await {
                match next {
                    Ok(msg) => {
                        let headers = msg.headers.clone();
                        let payload = msg.payload.to_vec();
                        out.push(BrokerMessage {
                            payload,
                            headers,
                            inner: msg,
                        });
                    }
                    Err(e) => return self.handle_fetch_error(e.to_string()).await,
                }
            }
            self.consecutive_errors = 0;
            return Ok(out);
        }
    }

    async fn handle_fetch_error(&mut self, message: String) -> Result<Vec<BrokerMessage>, BrokerError> {
        if !is_transient(&message) {
            return Err(BrokerError::Fetch(message));
        }
        self.consecutive_errors += 1;
        let backoff = Duration::from_secs(2u64.saturating_pow(self.consecutive_errors).min(30));
        tracing::warn!(consecutive_errors = self.consecutive_errors, %message, backoff_secs = backoff.as_secs(), "transient broker error during fetch");
        tokio::time::sleep(backoff).await;
        Ok(Vec::new())
    }

    pub async fn publish(&self, subject: String, payload: Vec<u8>) -> Result<(), BrokerError> {
        self.client
            .publish(subject, payload.into())
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))
    }

    /// A cheap, cloneable publish-only handle. Status publishing only ever needs `publish`, not
    /// the consumer bound to this client's fetch loop.
    pub fn publish_handle(&self) -> PublishHandle {
        PublishHandle { client: self.client.clone() }
    }
}

/// Cloneable publish-only handle to the broker connection (§9 "progress callback").
#[derive(Clone)]
pub struct PublishHandle {
    client: Client,
}

impl PublishHandle {
    pub async fn publish(&self, subject: String, payload: Vec<u8>) -> Result<(), BrokerError> {
        self.client
            .publish(subject, payload.into())
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_transient_errors() {
        assert!(is_transient("no responders available for request"));
        assert!(is_transient("503 Service Unavailable"));
        assert!(!is_transient("permission denied"));
    }

    #[test]
    fn backoff_schedule_caps_at_30() {
        for n in 1..10u32 {
            let backoff = 2u64.saturating_pow(n).min(30);
            assert!(backoff <= 30);
        }
    }
}
