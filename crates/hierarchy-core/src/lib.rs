//! # Hierarchy Core
//!
//! Pure logic for Hierarchy Manager: contact-type hierarchy metadata, the
//! authoritative place cache, hierarchy resolution and validation, duplicate
//! warnings, move/merge/delete job building, signed job credentials, and the
//! job queue abstraction.
//!
//! This crate contains no tokio runtime, sqlx, HTTP client or process
//! spawning. Platform access comes in through [`cache::PlaceSource`] and
//! queue persistence through [`queue::JobStore`]; the `hierarchy-manager`
//! crate provides the native implementations.

pub mod cache;
pub mod config;
pub mod credential;
pub mod manage;
pub mod models;
pub mod normalize;
pub mod queue;
pub mod resolver;
pub mod session;
pub mod validate;
pub mod warnings;
