//! Sending commands to a manager and waiting for the reply.

use std::sync::Arc;
use std::time::Duration;

use datasource_bus::{BusConfig, EventPublisher, EventSubscriber, Message, Transport, ZmqPublisher, ZmqSubscriber};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::ClientError;
use crate::protocol::{Command, CommandResponse, HandlerParams, ProgressEvent};
use crate::topics::{command_topic, fresh_progress_topic, fresh_response_topic};

/// Default pause between subscribing and publishing.
pub const DEFAULT_SUBSCRIBE_SETTLE: Duration = Duration::from_millis(200);

/// Issues `start_data_source` commands over the bus.
///
/// One publisher is shared by all requests; each request gets its own
/// subscriber so concurrent requests never read each other's replies.
pub struct CommandClient {
    publisher: Arc<dyn EventPublisher>,
    backend: Transport,
    subscribe_settle: Duration,
}

impl CommandClient {
    pub async fn connect(bus: &BusConfig) -> Result<Self, ClientError> {
        let publisher = ZmqPublisher::connect(&bus.frontend_transport()?).await?;
        Ok(Self {
            publisher: Arc::new(publisher),
            backend: bus.backend_transport()?,
            subscribe_settle: DEFAULT_SUBSCRIBE_SETTLE,
        })
    }

    /// Time given to subscriptions to reach the broker before the command
    /// goes out. Too short and a fast job's reply can be missed.
    pub fn subscribe_settle(mut self, settle: Duration) -> Self {
        self.subscribe_settle = settle;
        self
    }

    /// Start `datasource` on the manager at `manager_host` and wait for its
    /// response. Progress goes to a private topic nobody listens on here.
    pub async fn send(
        &self,
        manager_host: &str,
        datasource: &str,
        params: HandlerParams,
        timeout: Duration,
    ) -> Result<CommandResponse, ClientError> {
        self.send_command(manager_host, start_command(datasource, params), timeout, None)
            .await
    }

    /// Like [`send`](Self::send), with progress on a private topic forwarded
    /// to `progress` while waiting.
    pub async fn send_with_progress(
        &self,
        manager_host: &str,
        datasource: &str,
        params: HandlerParams,
        timeout: Duration,
        progress: mpsc::UnboundedSender<ProgressEvent>,
    ) -> Result<CommandResponse, ClientError> {
        self.send_command(manager_host, start_command(datasource, params), timeout, Some(progress))
            .await
    }

    /// Publish a prepared command and wait up to `timeout` for the response
    /// carrying its `request_id`.
    ///
    /// Returns [`ClientError::Timeout`] when nothing arrives; a response
    /// whose status is `failed` or `rejected` is still an `Ok`.
    pub async fn send_command(
        &self,
        manager_host: &str,
        command: Command,
        timeout: Duration,
        progress: Option<mpsc::UnboundedSender<ProgressEvent>>,
    ) -> Result<CommandResponse, ClientError> {
        let request_id = command.request_id;
        let response_topic = command.response_channel.clone();
        let progress_topic = command.progress_topic().to_string();

        let subscriber = ZmqSubscriber::connect(&self.backend).await?;
        subscriber.subscribe(&response_topic).await?;
        if progress.is_some() {
            subscriber.subscribe(&progress_topic).await?;
        }
        tokio::time::sleep(self.subscribe_settle).await;

        let topic = command_topic(manager_host);
        let message = Message::new(topic.as_str(), &command).map_err(ClientError::Encode)?;
        self.publisher.publish(message).await?;
        info!(%request_id, %topic, datasource = %command.params.datasource, "command sent");

        let wait = wait_for_response(
            &subscriber,
            request_id,
            &response_topic,
            &progress_topic,
            progress.as_ref(),
        );
        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => {
                warn!(%request_id, ?timeout, "no response");
                Err(ClientError::Timeout(timeout))
            }
        }
    }
}

/// A command with its own response and progress topics.
fn start_command(datasource: &str, params: HandlerParams) -> Command {
    Command::start_data_source(
        datasource,
        params,
        fresh_response_topic(),
        Some(fresh_progress_topic()),
    )
}

async fn wait_for_response(
    subscriber: &ZmqSubscriber,
    request_id: Uuid,
    response_topic: &str,
    progress_topic: &str,
    progress: Option<&mpsc::UnboundedSender<ProgressEvent>>,
) -> Result<CommandResponse, ClientError> {
    loop {
        let message = subscriber.recv().await?;
        if message.topic == response_topic {
            match message.decode::<CommandResponse>() {
                Ok(response) if response.request_id == request_id => return Ok(response),
                Ok(response) => {
                    warn!(expected = %request_id, got = %response.request_id, "ignoring response for another request");
                }
                Err(e) => warn!(error = %e, "ignoring undecodable response"),
            }
        } else if message.topic == progress_topic {
            if let Some(progress) = progress {
                match message.decode::<ProgressEvent>() {
                    Ok(event) => {
                        // The caller may stop listening early; the response still matters.
                        let _ = progress.send(event);
                    }
                    Err(e) => debug!(error = %e, "ignoring undecodable progress event"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topics::{DEFAULT_PROGRESS_TOPIC, PROGRESS_TOPIC_PREFIX, RESPONSE_TOPIC_PREFIX};

    #[test]
    fn every_command_gets_private_topics() {
        let a = start_command("EchoHandler", HandlerParams::new());
        let b = start_command("EchoHandler", HandlerParams::new());

        assert_ne!(a.request_id, b.request_id);
        assert_ne!(a.response_channel, b.response_channel);
        assert_ne!(a.progress_topic(), b.progress_topic());
        for command in [&a, &b] {
            assert!(command.response_channel.starts_with(RESPONSE_TOPIC_PREFIX));
            assert!(command.progress_topic().starts_with(PROGRESS_TOPIC_PREFIX));
            assert_ne!(command.progress_topic(), DEFAULT_PROGRESS_TOPIC);
        }
        assert!(a.validate().is_ok());
    }
}
