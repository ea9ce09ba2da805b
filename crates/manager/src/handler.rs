//! The contract every data-source handler implements.

use std::sync::Arc;

use crate::error::HandlerError;
use crate::progress::ProgressSink;
use crate::protocol::HandlerParams;

/// A unit of ingestion work, run to completion inside a job process.
///
/// Handlers are built from their parameter mapping by a [`HandlerFactory`],
/// receive a progress sink, and then [`fetch`](Self::fetch) exactly once on a
/// blocking thread.
pub trait DataSourceHandler: Send {
    /// Replace the sink that [`fetch`](Self::fetch) reports progress to.
    fn set_progress_sink(&mut self, sink: Arc<dyn ProgressSink>);

    /// Do the work. Blocking; may report progress any number of times.
    fn fetch(&mut self) -> Result<(), HandlerError>;
}

/// Builds a handler from its parameters. Parameter problems should surface
/// here as [`HandlerError::InvalidParams`] rather than later in `fetch`.
pub type HandlerFactory = fn(HandlerParams) -> Result<Box<dyn DataSourceHandler>, HandlerError>;
