//! Driver shell for a SWIM-family cluster membership failure detector.
//!
//! The protocol-logic engine (the [`engine::Engine`] trait) decides
//! *what* the protocol does; this crate makes those decisions happen
//! against a real network and a real clock: it dispatches inbound
//! messages to the engine, executes the directives the engine emits,
//! drives periodic protocol-period ticks and suspicion-timeout
//! escalation, probes initial contact points, and delivers membership
//! change notifications to the embedder.
//!
//! All engine state is owned by a single spawned task (the protocol
//! loop). External callers interact through the cloneable
//! [`ShellHandle`] and the event stream returned by [`start_shell`].

pub mod cli;
pub mod engine;
#[cfg(feature = "metrics")]
pub mod metrics;
mod peer;
mod shell;
mod task_manager;
mod timer;

pub use peer::{ChannelHandle, Datagram, Peer};
pub use shell::{start_shell, ShellConfig, ShellHandle};
pub use swim_messages as messages;
pub use task_manager::TaskManager;
pub use timer::TimerHandle;

use tokio::sync::mpsc::error::TrySendError;

#[derive(thiserror::Error, Debug)]
#[error("The queue is full")]
pub struct QueueFull;

impl<T> From<TrySendError<T>> for QueueFull {
    fn from(_: TrySendError<T>) -> Self {
        Self
    }
}
