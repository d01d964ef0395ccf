//! In-process gateway that records mail instead of sending it.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

use super::{EmailGateway, GatewayReceipt, OutboundEmail};
use crate::error::{NotificationError, NotificationResult};

#[derive(Default)]
struct Script {
    failing_recipients: HashSet<String>,
    failing_calls: HashSet<usize>,
    delays: HashMap<String, Duration>,
    default_delay: Option<Duration>,
}

/// Captures sent mail and fails on demand. Clones share state.
#[derive(Clone, Default)]
pub struct MockGateway {
    sent: Arc<Mutex<Vec<OutboundEmail>>>,
    script: Arc<Mutex<Script>>,
    calls: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every send to `email`.
    pub async fn fail_for(&self, email: &str) {
        self.script
            .lock()
            .await
            .failing_recipients
            .insert(email.to_ascii_lowercase());
    }

    /// Reject the n-th send (1-based) regardless of recipient.
    pub async fn fail_on_call(&self, call: usize) {
        self.script.lock().await.failing_calls.insert(call);
    }

    /// Hold sends to `email` for `delay` before answering.
    pub async fn delay_for(&self, email: &str, delay: Duration) {
        self.script
            .lock()
            .await
            .delays
            .insert(email.to_ascii_lowercase(), delay);
    }

    /// Hold every send for `delay`.
    pub async fn delay_all(&self, delay: Duration) {
        self.script.lock().await.default_delay = Some(delay);
    }

    pub async fn sent(&self) -> Vec<OutboundEmail> {
        self.sent.lock().await.clone()
    }

    pub async fn sent_count(&self) -> usize {
        self.sent.lock().await.len()
    }

    pub async fn was_sent_to(&self, email: &str) -> bool {
        self.sent
            .lock()
            .await
            .iter()
            .any(|e| e.to.eq_ignore_ascii_case(email))
    }

    /// Number of `send` calls, successful or not.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of sends observed in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl EmailGateway for MockGateway {
    async fn send(&self, email: &OutboundEmail) -> NotificationResult<GatewayReceipt> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        let recipient = email.to.to_ascii_lowercase();
        let (fails, delay) = {
            let script = self.script.lock().await;
            (
                script.failing_recipients.contains(&recipient) || script.failing_calls.contains(&call),
                script.delays.get(&recipient).copied().or(script.default_delay),
            )
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if fails {
            return Err(NotificationError::RecipientSend {
                recipient: email.to.clone(),
                reason: "mailbox unavailable".to_string(),
            });
        }

        self.sent.lock().await.push(email.clone());
        Ok(GatewayReceipt {
            gateway_message_id: Some(format!("mock-{}", email.correlation_id)),
        })
    }

    fn name(&self) -> &'static str {
        "mock"
    }

    async fn health_check(&self) -> NotificationResult<bool> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn email(to: &str) -> OutboundEmail {
        OutboundEmail {
            to: to.into(),
            subject: "Test".into(),
            correlation_id: "c1".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_mock_gateway_records_sent_mail() {
        let gateway = MockGateway::new();
        let receipt = gateway.send(&email("a@example.com")).await.unwrap();

        assert_eq!(receipt.gateway_message_id.as_deref(), Some("mock-c1"));
        assert!(gateway.was_sent_to("A@example.com").await);
        assert_eq!(gateway.sent_count().await, 1);
    }

    #[tokio::test]
    async fn test_mock_gateway_scripted_failures() {
        let gateway = MockGateway::new();
        gateway.fail_for("bad@example.com").await;
        gateway.fail_on_call(3).await;

        assert!(gateway.send(&email("bad@example.com")).await.is_err());
        assert!(gateway.send(&email("ok@example.com")).await.is_ok());
        assert!(gateway.send(&email("ok@example.com")).await.is_err());
        assert_eq!(gateway.calls(), 3);
        assert_eq!(gateway.sent_count().await, 1);
    }
}
