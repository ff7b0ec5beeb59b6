//! Core library for the ts-process toolkit.
//!
//! This library implements the content-addressed processing cache behind ground-motion
//! comparisons: every `(station, incident, processing pipeline)` request is
//! fingerprinted, looked up in a durable per-project store and only computed on a miss.
//! Results are attributed to the incident that produced them so an incident can be
//! purged in one step.
//!
//! The [`project::Project`] type is the usual entry point; the lower-level components
//! ([`store`], [`tracker`], [`resolver`]) can also be wired together directly.

pub mod config;
pub mod error;
pub mod fingerprint;
pub mod incident;
pub mod logging;
pub mod processing;
pub mod project;
pub mod record;
pub mod resolver;
pub mod signal;
pub mod station;
pub mod store;
pub mod tracker;

pub use error::{AppResult, TsError};
pub use fingerprint::{fingerprint, Fingerprint};
pub use project::Project;
