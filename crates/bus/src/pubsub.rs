use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};
use zeromq::prelude::*;
use zeromq::{PubSocket, SubSocket};

use crate::error::BusError;
use crate::message::Message;
use crate::traits::{EventPublisher, EventSubscriber};
use crate::transport::Transport;

/// ZeroMQ PUB socket publisher.
///
/// Normally connects to the broker's frontend (a SUB socket subscribed to
/// everything), which forwards to the backend PUB socket that subscribers
/// connect to.
pub struct ZmqPublisher {
    socket: Mutex<PubSocket>,
}

impl ZmqPublisher {
    /// Create a new publisher that connects to the broker's frontend endpoint.
    #[instrument(skip_all, fields(endpoint = %transport))]
    pub async fn connect(transport: &Transport) -> Result<Self, BusError> {
        let mut socket = PubSocket::new();
        let endpoint = transport.endpoint();
        info!(endpoint = %endpoint, "connecting PUB socket to broker frontend");
        socket.connect(&endpoint).await?;
        Ok(Self {
            socket: Mutex::new(socket),
        })
    }

    /// Create a new publisher that binds to the given endpoint.
    ///
    /// Use this for direct PUB/SUB without a broker (publisher binds, subscribers connect).
    #[instrument(skip_all, fields(endpoint = %transport))]
    pub async fn bind(transport: &Transport) -> Result<Self, BusError> {
        let mut socket = PubSocket::new();
        let endpoint = transport.endpoint();
        info!(endpoint = %endpoint, "binding PUB socket");
        socket.bind(&endpoint).await?;
        Ok(Self {
            socket: Mutex::new(socket),
        })
    }
}

#[async_trait]
impl EventPublisher for ZmqPublisher {
    async fn publish(&self, message: Message) -> Result<(), BusError> {
        let zmq_msg = message.to_zmq();

        let mut socket = self.socket.lock().await;
        socket.send(zmq_msg).await?;

        debug!(topic = %message.topic, bytes = message.payload.len(), "published message");
        Ok(())
    }
}

/// ZeroMQ SUB socket subscriber, normally connected to the broker's backend.
pub struct ZmqSubscriber {
    socket: Mutex<SubSocket>,
}

impl ZmqSubscriber {
    /// Create a new subscriber that connects to the broker's backend endpoint
    /// (or directly to a bound publisher).
    #[instrument(skip_all, fields(endpoint = %transport))]
    pub async fn connect(transport: &Transport) -> Result<Self, BusError> {
        let mut socket = SubSocket::new();
        let endpoint = transport.endpoint();
        info!(endpoint = %endpoint, "connecting SUB socket to broker backend");
        socket.connect(&endpoint).await?;
        Ok(Self {
            socket: Mutex::new(socket),
        })
    }
}

#[async_trait]
impl EventSubscriber for ZmqSubscriber {
    /// An empty prefix subscribes to all topics.
    async fn subscribe(&self, topic_prefix: &str) -> Result<(), BusError> {
        let mut socket = self.socket.lock().await;
        socket.subscribe(topic_prefix).await?;
        info!(topic_prefix = %topic_prefix, "subscribed to topic prefix");
        Ok(())
    }

    async fn recv(&self) -> Result<Message, BusError> {
        let mut socket = self.socket.lock().await;
        let zmq_msg = socket.recv().await?;
        let message = Message::from_zmq(&zmq_msg)?;
        debug!(topic = %message.topic, "received message");
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn direct_pub_sub_roundtrip() {
        let transport = Transport::tcp("127.0.0.1", 17700);

        let publisher = ZmqPublisher::bind(&transport).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let subscriber = ZmqSubscriber::connect(&transport).await.unwrap();
        subscriber.subscribe("response_").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let msg = Message::raw("response_0001", br#"{"status":"success"}"#.to_vec());
        publisher.publish(msg.clone()).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(2), subscriber.recv())
            .await
            .expect("timed out waiting for message")
            .unwrap();

        assert_eq!(received, msg);
    }

    #[tokio::test]
    async fn topic_filtering_works() {
        let transport = Transport::tcp("127.0.0.1", 17701);

        let publisher = ZmqPublisher::bind(&transport).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let subscriber = ZmqSubscriber::connect(&transport).await.unwrap();
        subscriber.subscribe("progress_aa").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        publisher
            .publish(Message::raw("progress_bb", b"{}".to_vec()))
            .await
            .unwrap();
        publisher
            .publish(Message::raw("progress_aa", br#"{"processed":1}"#.to_vec()))
            .await
            .unwrap();

        let received = tokio::time::timeout(Duration::from_secs(2), subscriber.recv())
            .await
            .expect("timed out")
            .unwrap();
        assert_eq!(received.topic, "progress_aa");

        let nothing = tokio::time::timeout(Duration::from_millis(300), subscriber.recv()).await;
        assert!(nothing.is_err(), "should not receive filtered message");
    }
}
