//! Matching responses to in-flight calls.
//!
//! Each call gets a fresh `echo` id and a table entry holding the sender half of a oneshot
//! channel. Whoever removes the entry from the table (a matching response, the call's timer, a
//! local failure, or a disconnect sweep) is the only one to complete the call.
use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex, PoisonError},
    task::{Context, Poll},
    time::{Duration, Instant},
};

use serde_json::Value;
use tokio::{sync::oneshot, task::AbortHandle};
use tracing::{debug, trace};

use crate::{
    error::{Result, RpcError},
    message::{Request, Response},
};

/// A call waiting for its response.
#[derive(Debug)]
struct PendingCall {
    action: String,
    created_at: Instant,
    sender: oneshot::Sender<Result<Value>>,
    timer: Option<AbortHandle>,
}

#[derive(Debug, Default)]
struct PendingTable {
    next_id: u64,
    calls: HashMap<String, PendingCall>,
}

/// The table of pending calls. Clones share the same table.
#[derive(Debug, Clone, Default)]
pub struct Correlator {
    table: Arc<Mutex<PendingTable>>,
}

/// Resolves to the outcome of one call.
#[derive(Debug)]
pub struct CallHandle {
    echo: String,
    receiver: oneshot::Receiver<Result<Value>>,
}

impl CallHandle {
    /// The correlation id sent with the request.
    pub fn echo(&self) -> &str {
        &self.echo
    }
}

impl Future for CallHandle {
    type Output = Result<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|outcome| outcome.unwrap_or(Err(RpcError::ConnectionLost)))
    }
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PendingTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a new call and starts its timer. Must be called within a Tokio runtime.
    pub fn begin(&self, action: &str, params: Value, timeout: Duration) -> (Request, CallHandle) {
        let (sender, receiver) = oneshot::channel();
        let echo = {
            let mut table = self.lock();
            table.next_id += 1;
            let echo = table.next_id.to_string();
            table.calls.insert(
                echo.clone(),
                PendingCall {
                    action: action.to_string(),
                    created_at: Instant::now(),
                    sender,
                    timer: None,
                },
            );
            echo
        };

        // The entry exists before the timer can fire.
        let correlator = self.clone();
        let timer_echo = echo.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            correlator.expire(&timer_echo, timeout);
        });
        match self.lock().calls.get_mut(&echo) {
            Some(call) => call.timer = Some(timer.abort_handle()),
            None => timer.abort(),
        }

        trace!("registered call {} ({})", echo, action);
        let request = Request {
            action: action.to_string(),
            params,
            echo: echo.clone(),
        };
        (request, CallHandle { echo, receiver })
    }

    /// Removes the entry for `echo` if it is still pending.
    fn take(&self, echo: &str) -> Option<PendingCall> {
        let call = self.lock().calls.remove(echo)?;
        if let Some(timer) = &call.timer {
            timer.abort();
        }
        Some(call)
    }

    fn complete(call: PendingCall, outcome: Result<Value>) {
        // The caller may have dropped its handle; nothing to do then.
        drop(call.sender.send(outcome));
    }

    /// Completes the call matching `response.echo`. Returns `false` if no such call is pending.
    pub fn resolve(&self, response: &Response) -> bool {
        match self.take(&response.echo) {
            Some(call) => {
                trace!(
                    "call {} ({}) answered after {:?}",
                    response.echo,
                    call.action,
                    call.created_at.elapsed()
                );
                Self::complete(call, response.clone().into_result());
                true
            }
            None => false,
        }
    }

    /// Fails one call with a local error. Returns `false` if it was already resolved.
    pub fn reject(&self, echo: &str, error: RpcError) -> bool {
        match self.take(echo) {
            Some(call) => {
                Self::complete(call, Err(error));
                true
            }
            None => false,
        }
    }

    fn expire(&self, echo: &str, after: Duration) {
        if let Some(call) = self.take(echo) {
            debug!("call {} ({}) timed out after {:?}", echo, call.action, after);
            let action = call.action.clone();
            Self::complete(call, Err(RpcError::Timeout { action, after }));
        }
    }

    /// Fails every pending call with [`RpcError::ConnectionLost`]. Returns how many there were.
    pub fn cancel_all(&self) -> usize {
        let calls: Vec<PendingCall> = {
            let mut table = self.lock();
            table.calls.drain().map(|(_, call)| call).collect()
        };
        let count = calls.len();
        for call in calls {
            if let Some(timer) = &call.timer {
                timer.abort();
            }
            Self::complete(call, Err(RpcError::ConnectionLost));
        }
        if count > 0 {
            debug!("cancelled {} pending calls", count);
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.lock().calls.len()
    }

    pub fn is_pending(&self, echo: &str) -> bool {
        self.lock().calls.contains_key(echo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    fn ok_response(echo: &str, data: Value) -> Response {
        Response {
            status: "ok".into(),
            retcode: 0,
            data,
            echo: echo.into(),
            msg: None,
            wording: None,
        }
    }

    #[tokio::test]
    async fn response_fulfils_matching_call() {
        let correlator = Correlator::new();
        let (request, handle) = correlator.begin("get_login_info", json!({}), Duration::from_secs(5));
        assert_eq!(request.echo, handle.echo());
        assert!(correlator.is_pending(handle.echo()));

        assert!(correlator.resolve(&ok_response(&request.echo, json!({"user_id": 1}))));
        assert_eq!(handle.await.unwrap(), json!({"user_id": 1}));
        assert_eq!(correlator.pending_count(), 0);

        // A second response for the same id finds nothing.
        assert!(!correlator.resolve(&ok_response(&request.echo, Value::Null)));
    }

    #[tokio::test]
    async fn echo_42_fulfils_only_its_call() {
        let correlator = Correlator::new();
        let mut handles: Vec<_> = (0..42)
            .map(|_| correlator.begin("get_status", Value::Null, Duration::from_secs(60)).1)
            .collect();
        let answered = handles.pop().unwrap();
        assert_eq!(answered.echo(), "42");

        assert!(correlator.resolve(&ok_response("42", json!({"online": true}))));
        assert_eq!(answered.await.unwrap(), json!({"online": true}));
        assert_eq!(correlator.pending_count(), 41);
        assert!(!correlator.resolve(&ok_response("42", Value::Null)));
        correlator.cancel_all();
    }

    #[tokio::test]
    async fn failure_status_rejects_with_api_error() {
        let correlator = Correlator::new();
        let (request, handle) = correlator.begin("delete_msg", json!({}), Duration::from_secs(5));
        let mut response = ok_response(&request.echo, Value::Null);
        response.status = "failed".into();
        response.retcode = 102;
        correlator.resolve(&response);
        match handle.await {
            Err(RpcError::Api(err)) => assert_eq!(err.retcode, 102),
            other => panic!("expected API error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn ids_are_unique_among_pending() {
        let correlator = Correlator::new();
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let correlator = correlator.clone();
            tasks.push(tokio::spawn(async move {
                (0..50)
                    .map(|_| correlator.begin("x", Value::Null, Duration::from_secs(60)).1)
                    .collect::<Vec<_>>()
            }));
        }
        let mut echoes = HashSet::new();
        for task in tasks {
            for handle in task.await.unwrap() {
                assert!(echoes.insert(handle.echo().to_string()));
            }
        }
        assert_eq!(correlator.pending_count(), 800);
        assert_eq!(correlator.cancel_all(), 800);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_rejects_and_removes() {
        let correlator = Correlator::new();
        let (_, handle) = correlator.begin("slow", Value::Null, Duration::from_secs(2));
        let echo = handle.echo().to_string();
        let started = tokio::time::Instant::now();
        match handle.await {
            Err(RpcError::Timeout { action, after }) => {
                assert_eq!(action, "slow");
                assert_eq!(after, Duration::from_secs(2));
            }
            other => panic!("expected timeout, got {:?}", other),
        }
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert!(!correlator.is_pending(&echo));
    }

    #[tokio::test(start_paused = true)]
    async fn late_response_after_timeout_is_ignored() {
        let correlator = Correlator::new();
        let (request, handle) = correlator.begin("slow", Value::Null, Duration::from_millis(10));
        assert!(matches!(handle.await, Err(RpcError::Timeout { .. })));
        assert!(!correlator.resolve(&ok_response(&request.echo, Value::Null)));
    }

    #[tokio::test(start_paused = true)]
    async fn response_before_timer_wins() {
        let correlator = Correlator::new();
        let (request, handle) = correlator.begin("fast", Value::Null, Duration::from_millis(10));
        assert!(correlator.resolve(&ok_response(&request.echo, json!(1))));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.await.unwrap(), json!(1));
    }

    #[tokio::test]
    async fn cancel_all_sweeps_everything() {
        let correlator = Correlator::new();
        let handles: Vec<_> = (0..3)
            .map(|_| correlator.begin("x", Value::Null, Duration::from_secs(60)).1)
            .collect();
        assert_eq!(correlator.cancel_all(), 3);
        for handle in handles {
            assert!(matches!(handle.await, Err(RpcError::ConnectionLost)));
        }
        assert_eq!(correlator.cancel_all(), 0);
    }

    #[tokio::test]
    async fn reject_is_resolve_once() {
        let correlator = Correlator::new();
        let (request, handle) = correlator.begin("x", Value::Null, Duration::from_secs(60));
        assert!(correlator.reject(&request.echo, RpcError::NotConnected));
        assert!(!correlator.reject(&request.echo, RpcError::ConnectionLost));
        assert!(matches!(handle.await, Err(RpcError::NotConnected)));
    }
}
