//! The daemon runtime: HTTP listeners, the feed pusher and its
//! scheduler, the journal, and the two-phase application life cycle
//! that ties a [`portico_repo::Repository`] to a search appliance.
//!
//! Repository authors depend on this crate and hand their
//! implementation to [`Application::run`] (or [`cli::run_adaptor`]
//! for the full command-line surface).

pub mod app;
pub mod authz;
pub mod cli;
pub mod dashboard;
pub mod doc_handler;
pub mod http_server;
pub mod journal;
pub mod pusher;
pub mod scheduler;

#[cfg(test)]
pub(crate) mod test_support;

pub use app::Application;
pub use journal::{Journal, JournalSnapshot, PushStatus};
pub use pusher::{FullPushOutcome, Pusher};
