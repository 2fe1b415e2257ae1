//! A registered session against the controlling server.

use browserlink_core::{
    AgentRegistration, CorrelationId, Error, Message, Result, SessionConfig,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::encoder::CommandEncoder;
use crate::post_office::PostOffice;
use crate::transport::TransportChannel;

const UNSOLICITED_CAPACITY: usize = 256;

pub struct Session {
    transport: TransportChannel,
    post_office: Arc<PostOffice>,
    driver: JoinHandle<()>,
    unsolicited: Option<mpsc::Receiver<Message>>,
    registration: AgentRegistration,
    request_timeout: Duration,
}

impl Session {
    /// Connect, announce the agent, and start driving the post office.
    ///
    /// Whatever the server sends before task traffic starts (acknowledgements,
    /// greetings) is handed to [`Session::unsolicited`] like any other push.
    pub async fn connect(config: &SessionConfig) -> Result<Self> {
        let mut transport = TransportChannel::connect(&config.server_url).await?;

        let registration = AgentRegistration {
            agent_id: if config.agent_id.trim().is_empty() {
                uuid::Uuid::new_v4().to_string()
            } else {
                config.agent_id.clone()
            },
            agent_name: config.agent_name.clone(),
            agent_type: config.agent_type.clone(),
        };
        transport.sender().send_json(&registration).await?;

        let inbound = transport
            .receive()
            .ok_or_else(|| Error::Other("inbound stream already taken".to_string()))?;
        let (events_tx, events_rx) = mpsc::channel(UNSOLICITED_CAPACITY);
        let post_office = Arc::new(PostOffice::with_unsolicited(transport.sender(), events_tx));
        let driver = tokio::spawn(post_office.clone().run(inbound, config.expiry_tick()));

        info!(
            server = %transport.address(),
            agent_id = %registration.agent_id,
            agent_name = %registration.agent_name,
            "Session registered"
        );

        Ok(Self {
            transport,
            post_office,
            driver,
            unsolicited: Some(events_rx),
            registration,
            request_timeout: config.request_timeout(),
        })
    }

    pub fn registration(&self) -> &AgentRegistration {
        &self.registration
    }

    pub fn post_office(&self) -> &Arc<PostOffice> {
        &self.post_office
    }

    pub async fn submit<F>(&self, build: F, timeout: Duration) -> Result<Message>
    where
        F: FnOnce(CorrelationId) -> Message,
    {
        self.post_office.submit(build, timeout).await
    }

    /// Run `script` in the browser context and return the response's result.
    pub async fn execute_js(&self, script: &str, timeout: Option<Duration>) -> Result<Value> {
        let reply = self
            .submit(
                |id| CommandEncoder::script_task(id, script),
                timeout.unwrap_or(self.request_timeout),
            )
            .await?;
        expect_result(reply)
    }

    /// Send a free-form task and return the response's result.
    pub async fn send_task(&self, task: &str, timeout: Option<Duration>) -> Result<Value> {
        let reply = self
            .submit(
                |id| Message::task(id, Some("user"), json!(task)),
                timeout.unwrap_or(self.request_timeout),
            )
            .await?;
        expect_result(reply)
    }

    /// Tasks, logs and events pushed by the server. Can be taken once.
    pub fn unsolicited(&mut self) -> Option<mpsc::Receiver<Message>> {
        self.unsolicited.take()
    }

    pub async fn pending_count(&self) -> usize {
        self.post_office.pending_count().await
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Close the connection; requests still in flight fail with `ConnectionLost`.
    pub async fn close(self) {
        self.transport.close();
        let _ = self.driver.await;
        info!(agent_id = %self.registration.agent_id, "Session closed");
    }
}

fn expect_result(reply: Message) -> Result<Value> {
    match reply {
        Message::Response(response) => response.into_result(),
        other => Err(Error::Protocol(format!("expected a response, got {}", other.kind()))),
    }
}
