//! In-process stand-ins for the network, for tests and embedding.
//!
//! [`ScriptedTransport`] answers outbound requests from a script instead of a
//! socket and records everything it was asked to send. [`DispatchHarness`]
//! runs a full server (registry, dispatcher, request loop) on top of it so a
//! test can push device requests in and read the responses back.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use shepherd_protocol::{
    CoapRequest, CoapResponse, InboundRequest, Method, OutboundResponse, ResponseCode,
};

use crate::config::ShepherdConfig;
use crate::registry::{spawn_registry, AcceptAll, AdmissionPolicy, RegistryHandle};
use crate::server::ShepherdServer;
use crate::storage::{MemoryStorage, Storage};
use crate::transport::{InboundExchange, Observation, Responder, Transport, TransportError};

/// Notifications queued per scripted observation
const NOTIFICATION_BUFFER: usize = 16;

/// Inbound requests queued by the harness
const INBOUND_BUFFER: usize = 16;

#[derive(Default)]
struct Script {
    /// (method, path) → queued answers; the last one repeats
    answers: HashMap<(Method, String), VecDeque<CoapResponse>>,
    failure: Option<TransportError>,
    requests: Vec<CoapRequest>,
    /// path → notification streams handed out by `observe`
    observers: HashMap<String, Vec<mpsc::Sender<CoapResponse>>>,
}

/// A transport that answers from a script.
///
/// Unscripted requests get the answer a cooperative device would give:
/// `2.05` for GET and `POST /ping`, `2.04` for PUT and other POSTs, `2.02`
/// for DELETE.
#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<Script>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues an answer for `method path`. Answers are used in order and
    /// the last one keeps answering.
    pub fn respond(&self, method: Method, path: &str, response: CoapResponse) {
        self.script()
            .answers
            .entry((method, path.to_string()))
            .or_default()
            .push_back(response);
    }

    /// Makes every following call fail with `error`.
    pub fn fail_with(&self, error: TransportError) {
        self.script().failure = Some(error);
    }

    pub fn clear_failure(&self) {
        self.script().failure = None;
    }

    /// Every request seen so far, in order.
    pub fn requests(&self) -> Vec<CoapRequest> {
        self.script().requests.clone()
    }

    pub fn request_count(&self) -> usize {
        self.script().requests.len()
    }

    /// Requests seen for one path.
    pub fn requests_to(&self, path: &str) -> Vec<CoapRequest> {
        self.script()
            .requests
            .iter()
            .filter(|request| request.path == path)
            .cloned()
            .collect()
    }

    /// Pushes a notification to every open observation of `path`.
    ///
    /// Returns whether any observation took it.
    pub async fn notify(&self, path: &str, response: CoapResponse) -> bool {
        let senders = self.script().observers.get(path).cloned().unwrap_or_default();

        let mut delivered = false;
        for sender in senders {
            delivered |= sender.send(response.clone()).await.is_ok();
        }
        delivered
    }

    /// Records the request and picks its answer.
    fn answer(&self, request: &CoapRequest) -> Result<CoapResponse, TransportError> {
        let mut script = self.script();
        script.requests.push(request.clone());
        if let Some(error) = &script.failure {
            return Err(error.clone());
        }

        let key = (request.method, request.path.clone());
        if let Some(queue) = script.answers.get_mut(&key) {
            let next = if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().cloned()
            };
            if let Some(response) = next {
                return Ok(response);
            }
        }

        let code = match request.method {
            Method::Get => ResponseCode::Content,
            Method::Post if request.path == "/ping" => ResponseCode::Content,
            Method::Post | Method::Put => ResponseCode::Changed,
            Method::Delete => ResponseCode::Deleted,
        };
        Ok(CoapResponse::new(code))
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn request(&self, request: CoapRequest) -> Result<CoapResponse, TransportError> {
        self.answer(&request)
    }

    async fn observe(&self, request: CoapRequest) -> Result<Observation, TransportError> {
        let response = self.answer(&request)?;
        if response.code != ResponseCode::Content {
            return Ok(Observation::refused(response));
        }

        let (tx, rx) = mpsc::channel(NOTIFICATION_BUFFER);
        let mut script = self.script();
        let senders = script.observers.entry(request.path.clone()).or_default();
        senders.retain(|sender| !sender.is_closed());
        senders.push(tx);

        Ok(Observation {
            response,
            notifications: Some(rx),
        })
    }

    async fn send(&self, request: CoapRequest) -> Result<(), TransportError> {
        self.answer(&request).map(|_| ())
    }
}

// ============================================================================
// Dispatch Harness
// ============================================================================

/// A running server whose network is a [`ScriptedTransport`].
///
/// Must be created inside a tokio runtime. Dropping the harness stops the
/// server.
pub struct DispatchHarness {
    registry: RegistryHandle,
    transport: Arc<ScriptedTransport>,
    inbound: mpsc::Sender<InboundExchange>,
    cancel_token: CancellationToken,
}

impl DispatchHarness {
    /// Memory storage and an accept-all admission policy.
    pub fn new(config: ShepherdConfig) -> Self {
        Self::with_parts(config, Arc::new(MemoryStorage::new()), Arc::new(AcceptAll))
    }

    pub fn with_parts(
        config: ShepherdConfig,
        storage: Arc<dyn Storage>,
        policy: Arc<dyn AdmissionPolicy>,
    ) -> Self {
        let transport = ScriptedTransport::new();
        let registry = spawn_registry(Arc::new(config), storage, transport.clone(), policy);

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
        let cancel_token = CancellationToken::new();
        let server = ShepherdServer::with_transport(
            registry.clone(),
            transport.clone(),
            inbound_rx,
            cancel_token.clone(),
        );
        tokio::spawn(server.run());

        Self {
            registry,
            transport,
            inbound: inbound_tx,
            cancel_token,
        }
    }

    pub fn registry(&self) -> &RegistryHandle {
        &self.registry
    }

    pub fn transport(&self) -> &Arc<ScriptedTransport> {
        &self.transport
    }

    /// Delivers one device request and waits for the server's answer.
    pub async fn send(&self, request: InboundRequest) -> Result<OutboundResponse, TransportError> {
        let (responder, answer) = Responder::channel();
        self.inbound
            .send(InboundExchange { request, responder })
            .await
            .map_err(|_| TransportError::Closed)?;
        answer.await.map_err(|_| TransportError::Closed)
    }
}

impl Drop for DispatchHarness {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get(path: &str) -> CoapRequest {
        CoapRequest::new(Method::Get, "127.0.0.1", 5683, path)
    }

    #[tokio::test]
    async fn test_default_answers() {
        let transport = ScriptedTransport::new();
        let ping = CoapRequest::new(Method::Post, "127.0.0.1", 5683, "/ping");
        let exec = CoapRequest::new(Method::Post, "127.0.0.1", 5683, "/3/0/4");

        assert_eq!(transport.request(get("/3/0")).await.unwrap().code, ResponseCode::Content);
        assert_eq!(transport.request(ping).await.unwrap().code, ResponseCode::Content);
        assert_eq!(transport.request(exec).await.unwrap().code, ResponseCode::Changed);
        assert_eq!(transport.request_count(), 3);
    }

    #[tokio::test]
    async fn test_scripted_answers_keep_last() {
        let transport = ScriptedTransport::new();
        transport.respond(Method::Get, "/3/0", CoapResponse::timeout());
        transport.respond(Method::Get, "/3/0", CoapResponse::new(ResponseCode::NotFound));

        assert!(transport.request(get("/3/0")).await.unwrap().is_timeout());
        assert_eq!(transport.request(get("/3/0")).await.unwrap().code, ResponseCode::NotFound);
        assert_eq!(transport.request(get("/3/0")).await.unwrap().code, ResponseCode::NotFound);
        assert_eq!(transport.requests_to("/3/0").len(), 3);
    }

    #[tokio::test]
    async fn test_failure_is_recorded_and_returned() {
        let transport = ScriptedTransport::new();
        transport.fail_with(TransportError::Closed);
        assert_eq!(transport.request(get("/3/0")).await, Err(TransportError::Closed));
        assert_eq!(transport.request_count(), 1);

        transport.clear_failure();
        assert!(transport.request(get("/3/0")).await.is_ok());
    }

    #[tokio::test]
    async fn test_notify_reaches_open_observation() {
        let transport = ScriptedTransport::new();
        let observation = transport.observe(get("/3303/0/5700")).await.unwrap();
        let mut stream = observation.notifications.unwrap();

        let chunk = CoapResponse::new(ResponseCode::Content).with_payload(serde_json::json!(21.5));
        assert!(transport.notify("/3303/0/5700", chunk.clone()).await);
        assert_eq!(stream.recv().await, Some(chunk.clone()));

        drop(stream);
        assert!(!transport.notify("/3303/0/5700", chunk).await);
    }

    #[tokio::test]
    async fn test_refused_observation_has_no_stream() {
        let transport = ScriptedTransport::new();
        transport.respond(Method::Get, "/3/0/1", CoapResponse::new(ResponseCode::NotAllowed));
        let observation = transport.observe(get("/3/0/1")).await.unwrap();
        assert!(observation.notifications.is_none());
    }

    #[tokio::test]
    async fn test_harness_answers_diagnostic() {
        let harness = DispatchHarness::new(ShepherdConfig::default());
        let source = "127.0.0.1:40000".parse().unwrap();
        let response = harness
            .send(InboundRequest::new(Method::Get, "/test", source))
            .await
            .unwrap();
        assert_eq!(response.code, ResponseCode::Content);
        assert_eq!(response.payload_text(), "_test");
    }
}
