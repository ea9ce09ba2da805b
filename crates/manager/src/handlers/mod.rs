//! Handlers compiled into the launcher.
//!
//! Real ingestion handlers (GitHub, mailboxes, ...) live outside this
//! repository; they plug in by adding an entry to [`BUILTIN`].

pub mod echo;

use crate::handler::HandlerFactory;

/// Every handler the launcher can resolve, by identifier.
pub const BUILTIN: &[(&str, HandlerFactory)] = &[(echo::NAME, echo::EchoHandler::from_params)];
