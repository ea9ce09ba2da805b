pub mod client;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod handlers;
pub mod launcher;
pub mod net;
pub mod progress;
pub mod protocol;
pub mod registry;
pub mod runner;
pub mod topics;

pub use client::CommandClient;
pub use config::DatasourceConfig;
pub use dispatcher::{Dispatcher, DispatcherConfig, DispatcherState, DispatcherStats};
pub use error::{ClientError, CommandError, ConfigError, HandlerError, LaunchError, RegistryError, RunnerError};
pub use handler::{DataSourceHandler, HandlerFactory};
pub use launcher::{JobLauncher, JobOutcome, ProcessLauncher};
pub use progress::{NullSink, OfflinePublisher, ProgressEmitter, ProgressSink};
pub use protocol::{Command, CommandResponse, HandlerParams, JobSpec, ProgressEvent, ResponseStatus};
pub use registry::HandlerRegistry;
pub use runner::{JobReport, JobRunner};
