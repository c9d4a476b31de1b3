//! Scripted broker transport for tests.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tether_transport::{
    BrokerEvent, BrokerLink, BrokerTransport, ConnectRequest, Opened, Quality, TransportError,
};
use tokio::sync::mpsc;

/// How the next `open` behaves.
#[derive(Debug, Clone)]
pub(crate) enum ConnectScript {
    /// Report connected immediately.
    Accept,
    /// Report a failure before connected.
    Fail(String),
    /// Report nothing; tests drive it with [`ScriptedTransport::emit`].
    Hang,
}

/// A recorded transport call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Open(String),
    Publish {
        topic: String,
        payload: String,
        retain: bool,
    },
    Subscribe(String),
    Close,
}

#[derive(Default)]
struct Shared {
    calls: Mutex<Vec<Call>>,
    requests: Mutex<Vec<ConnectRequest>>,
    events: Mutex<Option<mpsc::UnboundedSender<BrokerEvent>>>,
    refused: Mutex<Vec<String>>,
    fail_publishes: AtomicBool,
}

impl Shared {
    fn record(&self, call: Call) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }
}

pub(crate) struct ScriptedTransport {
    script: Mutex<ConnectScript>,
    shared: Arc<Shared>,
}

impl ScriptedTransport {
    pub fn new(script: ConnectScript) -> Self {
        Self {
            script: Mutex::new(script),
            shared: Arc::new(Shared::default()),
        }
    }

    pub fn set_script(&self, script: ConnectScript) {
        *self.script.lock().unwrap() = script;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.shared.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.shared.calls.lock().unwrap().clear();
    }

    pub fn requests(&self) -> Vec<ConnectRequest> {
        self.shared.requests.lock().unwrap().clone()
    }

    pub fn refuse_subscription(&self, topic: &str) {
        self.shared.refused.lock().unwrap().push(topic.to_string());
    }

    pub fn fail_publishes(&self, fail: bool) {
        self.shared.fail_publishes.store(fail, Ordering::SeqCst);
    }

    /// Push an event onto the most recently opened link.
    pub fn emit(&self, event: BrokerEvent) -> bool {
        self.shared
            .events
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|tx| tx.send(event).is_ok())
    }
}

#[async_trait]
impl BrokerTransport for ScriptedTransport {
    async fn open(&self, request: ConnectRequest) -> Result<Opened, TransportError> {
        let client_id = request.client_id.clone();
        self.shared.record(Call::Open(client_id.clone()));
        self.shared.requests.lock().unwrap().push(request);

        let (tx, rx) = mpsc::unbounded_channel();
        match self.script.lock().unwrap().clone() {
            ConnectScript::Accept => {
                let _ = tx.send(BrokerEvent::Connected);
            }
            ConnectScript::Fail(reason) => {
                let _ = tx.send(BrokerEvent::Failed { reason });
            }
            ConnectScript::Hang => {}
        }
        *self.shared.events.lock().unwrap() = Some(tx);

        Ok(Opened {
            link: Arc::new(ScriptedLink {
                client_id,
                shared: Arc::clone(&self.shared),
            }),
            events: rx,
        })
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

struct ScriptedLink {
    client_id: String,
    shared: Arc<Shared>,
}

#[async_trait]
impl BrokerLink for ScriptedLink {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        _quality: Quality,
        retain: bool,
    ) -> Result<(), TransportError> {
        self.shared.record(Call::Publish {
            topic: topic.to_string(),
            payload: String::from_utf8_lossy(&payload).into_owned(),
            retain,
        });
        if self.shared.fail_publishes.load(Ordering::SeqCst) {
            return Err(TransportError::PublishFailed("rejected".into()));
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str, _quality: Quality) -> Result<(), TransportError> {
        self.shared.record(Call::Subscribe(topic.to_string()));
        if self.shared.refused.lock().unwrap().iter().any(|t| t == topic) {
            return Err(TransportError::SubscribeFailed("not authorized".into()));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.shared.record(Call::Close);
        Ok(())
    }
}
