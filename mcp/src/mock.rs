//! Scripted in-memory [`Transport`] for tests.
//!
//! Responses are keyed by [`RemoteCall::label`]. Queued responses
//! ([`push_ok`](MockTransport::push_ok), [`push_err`](MockTransport::push_err))
//! are consumed first, in order; after that the sticky response set with
//! [`respond`](MockTransport::respond) is returned. A call with nothing
//! scripted fails with HTTP 501. Every call is recorded and counted.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::GatewayError;
use crate::transport::{Connector, RemoteCall, Transport, TransportError};

type Scripted = Result<Value, (u16, String)>;

#[derive(Default)]
pub struct MockTransport {
    queued: Mutex<HashMap<&'static str, VecDeque<Scripted>>>,
    sticky: Mutex<HashMap<&'static str, Scripted>>,
    calls: Mutex<Vec<RemoteCall>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Always answer `label` with `value` once the queue is drained.
    pub fn respond(&self, label: &'static str, value: Value) -> &Self {
        lock(&self.sticky).insert(label, Ok(value));
        self
    }

    /// Always fail `label` with the given HTTP status once the queue is drained.
    pub fn fail(&self, label: &'static str, status: u16, message: &str) -> &Self {
        lock(&self.sticky).insert(label, Err((status, message.to_string())));
        self
    }

    /// Answer the next `label` call with `value`.
    pub fn push_ok(&self, label: &'static str, value: Value) -> &Self {
        lock(&self.queued)
            .entry(label)
            .or_default()
            .push_back(Ok(value));
        self
    }

    /// Fail the next `label` call.
    pub fn push_err(&self, label: &'static str, status: u16, message: &str) -> &Self {
        lock(&self.queued)
            .entry(label)
            .or_default()
            .push_back(Err((status, message.to_string())));
        self
    }

    /// Number of calls seen for `label`.
    pub fn calls(&self, label: &str) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|c| c.label() == label)
            .count()
    }

    pub fn total_calls(&self) -> usize {
        lock(&self.calls).len()
    }

    /// All calls seen so far, in order.
    pub fn recorded(&self) -> Vec<RemoteCall> {
        lock(&self.calls).clone()
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl Transport for MockTransport {
    async fn execute(&self, call: &RemoteCall) -> Result<Value, TransportError> {
        lock(&self.calls).push(call.clone());
        let label = call.label();

        let queued = lock(&self.queued)
            .get_mut(label)
            .and_then(VecDeque::pop_front);
        let scripted = queued.or_else(|| lock(&self.sticky).get(label).cloned());

        match scripted {
            Some(Ok(value)) => Ok(value),
            Some(Err((status, message))) => Err(TransportError::Status { status, message }),
            None => Err(TransportError::Status {
                status: 501,
                message: format!("no scripted response for {label}"),
            }),
        }
    }
}

impl Connector for Arc<MockTransport> {
    fn endpoint(&self) -> String {
        "mock://pve".to_string()
    }

    fn open(&self) -> Result<Arc<dyn Transport>, GatewayError> {
        Ok(Arc::clone(self) as Arc<dyn Transport>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn queue_drains_before_sticky_response() {
        let mock = MockTransport::new();
        mock.push_err("version", 500, "boom")
            .respond("version", json!({"version": "8.2"}));

        let first = mock.execute(&RemoteCall::Version).await;
        assert!(matches!(
            first,
            Err(TransportError::Status { status: 500, .. })
        ));
        let second = mock.execute(&RemoteCall::Version).await.unwrap();
        assert_eq!(second["version"], "8.2");
        let third = mock.execute(&RemoteCall::Version).await.unwrap();
        assert_eq!(third["version"], "8.2");

        assert_eq!(mock.calls("version"), 3);
        assert_eq!(mock.calls("list_nodes"), 0);
    }

    #[tokio::test]
    async fn unscripted_call_fails() {
        let mock = MockTransport::new();
        let err = mock.execute(&RemoteCall::ListNodes).await.unwrap_err();
        assert!(err.to_string().contains("list_nodes"));
        assert_eq!(mock.total_calls(), 1);
    }
}
