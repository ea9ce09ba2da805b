pub mod broker;
pub mod config;
pub mod error;
pub mod message;
pub mod pubsub;
pub mod session;
pub mod signal;
pub mod traits;
pub mod transport;

pub use broker::{BrokerConfig, EventBroker};
pub use config::BusConfig;
pub use error::BusError;
pub use message::Message;
pub use pubsub::{ZmqPublisher, ZmqSubscriber};
pub use session::{probe_health, BusSession, RetryPolicy};
pub use signal::shutdown_signal;
pub use traits::{EventPublisher, EventSubscriber};
pub use transport::Transport;
