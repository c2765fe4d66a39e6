//! # StreamHub Core
//!
//! Real-time change-stream hub.
//!
//! This crate provides:
//! - Change source port with an in-memory implementation
//! - Collection watch registry (one stream per collection, many handlers)
//! - Event normalizer (raw change documents to domain events)
//! - Broadcast dispatcher (local fan-out plus cross-instance publish)
//! - Hub lifecycle (start, stop, reconnect with backoff)
//! - Per-collection checkpoints and resume
//!
//! ## Architecture
//!
//! ```text
//! ChangeSource ──raw──▶ normalize ──DomainEvent──▶ Dispatcher ──▶ handlers
//!      ▲                                               └────────▶ BroadcastPublisher
//!      └── Hub (lifecycle, recovery, checkpoints)
//! ```
//!
//! ## Key Invariants
//!
//! - Every delivered event corresponds to exactly one committed mutation
//! - A handler only sees events for the collection it registered on
//! - Per collection, events are dispatched in commit order
//! - Checkpoints never move backward except after a resume gap
//! - Delivery is at-least-once across reconnects
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use streamhub_core::{Hub, HubConfig, MemoryBroadcast, MemoryChangeSource};
//!
//! # async fn run() -> streamhub_core::HubResult<()> {
//! let source = Arc::new(MemoryChangeSource::new(["messages"]));
//! let hub = Hub::new(
//!     HubConfig::new(["messages"]),
//!     source.clone(),
//!     Arc::new(MemoryBroadcast::default()),
//! );
//!
//! hub.register("messages", None, |event| {
//!     println!("{} {}", event.kind, event.document_id);
//!     Ok(())
//! })?;
//! hub.start().await?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

mod config;
mod dispatch;
mod error;
mod event;
mod hub;
mod normalize;
mod recovery;
mod registry;
mod report;
mod source;

pub use config::{HubConfig, ReconnectConfig, DEFAULT_COLLECTIONS};
pub use dispatch::{BroadcastPublisher, DispatchReport, Dispatcher, MemoryBroadcast};
pub use error::{HubError, HubResult};
pub use event::{Document, DomainEvent, OperationKind, ResumeToken, UpdateDiff};
pub use hub::{Hub, HubState, Service};
pub use normalize::{document_id, normalize};
pub use registry::{
    Filter, HandlerError, HandlerResult, RegistrationHandle, WatchRegistry,
};
pub use report::{HubNotice, HubStats};
pub use source::{
    ChangeSender, ChangeSource, ChangeStream, ConnectOptions, MemoryChangeSource, RawChange,
};
