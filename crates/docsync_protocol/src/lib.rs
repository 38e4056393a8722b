//! # docsync Protocol
//!
//! Message shapes exchanged with the backing service and the logic that turns
//! the listen stream into consistent snapshots.
//!
//! This crate provides:
//! - [`ListenRequest`] / [`WriteRequest`] / [`WriteResponse`] stream messages
//! - [`WatchChange`]: the tagged union of inbound listen stream messages
//! - [`Code`] and [`Status`] for stream and write failures
//! - [`BloomFilter`] for existence filter membership tests
//! - [`WatchChangeAggregator`], which accumulates watch changes and emits a
//!   [`RemoteEvent`] at every snapshot boundary
//!
//! The wire encoding is left to the transport; every message derives serde
//! traits so any self-describing format can carry it.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod aggregator;
mod bloom_filter;
mod error;
mod messages;
mod remote_event;
mod status;
mod watch_change;

pub use aggregator::{BloomFilterApplication, TargetMetadataProvider, WatchChangeAggregator};
pub use bloom_filter::BloomFilter;
pub use error::{ProtocolError, ProtocolResult};
pub use messages::{ListenRequest, ResumeFrom, WriteRequest, WriteResponse};
pub use remote_event::{RemoteEvent, TargetChange};
pub use status::{Code, Status};
pub use watch_change::{
    BloomFilterParams, DocumentChange, DocumentDelete, DocumentRemove, ExistenceFilter,
    ExistenceFilterChange, WatchChange, WatchTargetChange, WatchTargetChangeState,
};
