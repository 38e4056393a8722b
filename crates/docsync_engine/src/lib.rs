//! # docsync Engine
//!
//! Keeps a local document cache in sync with a backend.
//!
//! This crate provides:
//! - [`DocSync`]: the async client (listen, get, write, network control)
//! - [`SyncEngine`]: the deterministic state machine behind it
//! - [`RemoteStore`]: the listen and write streams with backoff, credentials
//!   and online state tracking
//! - [`View`] and query listeners: per-query result diffing, limbo
//!   detection and snapshot delivery
//! - [`AsyncQueue`]: the serial operation queue every state change runs on
//! - [`Connection`] and an in-process loopback transport
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ DocSync (async API)                          │
//! ├──────────────────────────────────────────────┤
//! │ AsyncQueue ── SyncEngine ── EventManager     │
//! │                   │    └──── View per query  │
//! │          ┌────────┴────────┐                 │
//! │      LocalStore        RemoteStore           │
//! │   (docsync_local)   listen / write streams   │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! The engine itself never awaits: timers are data handed to a
//! [`Scheduler`], stream events come back through a [`Dispatcher`]. The
//! client wires both to its queue; tests use [`ManualScheduler`] and the
//! loopback transport.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backoff;
mod client;
mod config;
mod connection;
mod error;
mod event_manager;
mod online_state;
mod queue;
mod remote_store;
mod scheduler;
mod stream;
mod sync_engine;
mod view;

pub use backoff::ExponentialBackoff;
pub use client::{DocSync, Listener, PendingWrite};
pub use config::{BackoffConfig, PersistenceMode, SyncConfig};
pub use connection::{
    loopback, AuthToken, Connection, CredentialsProvider, Dispatcher, EmptyCredentials,
    InboundEvent, LoopbackConnection, LoopbackServer, OutboundStream, StaticCredentials,
    StreamEvent, StreamKind, StreamSink,
};
pub use error::{SyncError, SyncResult};
pub use event_manager::{ListenOptions, ListenerId, QuerySnapshot, SnapshotSender};
pub use online_state::OnlineState;
pub use queue::{AsyncQueue, DelayedOperation};
pub use remote_store::{RemoteKeys, RemoteOutput, RemoteStore, MAX_PENDING_WRITES};
pub use scheduler::{ManualScheduler, QueueScheduler, Scheduler, TimerId, TimerToken};
pub use stream::StreamState;
pub use sync_engine::{open_persistence, Source, SyncEngine, SyncEvent};
pub use view::{
    ChangeType, DocumentViewChange, LimboDocumentChange, View, ViewChange, ViewDocumentChanges,
    ViewSnapshot,
};
