//! Tollgate - Sliding-Window Admission Control
//!
//! This crate decides whether an actor may perform an action right now,
//! bounding how many requests each identifier makes per action within a
//! trailing window. Decisions are derived from a persisted event log so that
//! limits survive restarts and are shared by every process using the store.
//!
//! The pieces compose as: [`ratelimit::IdentifierResolver`] names the caller,
//! [`ratelimit::PolicyRegistry`] supplies the quota,
//! [`ratelimit::AdmissionEngine`] counts and decides against a
//! [`store::EventStore`], and [`http`] turns the decision into headers or a
//! 429 response.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod store;
