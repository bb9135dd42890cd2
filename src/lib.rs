//! # Hierarchy Manager
//!
//! Operator tooling for reshaping the place hierarchy of a community health
//! platform instance: check staged places against the live hierarchy, and
//! move, merge or delete places through a durable job queue drained by a
//! worker that drives the platform's configuration tool.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────────┐   ┌────────────┐
//! │ hmgr check   │──▶│ hierarchy-core    │◀──│ Platform   │
//! │ hmgr schedule│   │ cache / resolver │   │ HTTP API   │
//! └──────┬───────┘   └──────────────────┘   └─────▲──────┘
//!        │ job                                    │ health
//!        ▼                                        │
//!   ┌──────────┐   claim   ┌─────────────┐  spawn ┌┴─────────┐
//!   │  SQLite  │──────────▶│ hmgr worker │───────▶│ cht tool │
//!   │  queue   │◀──────────│             │◀───────│          │
//!   └──────────┘  settle   └─────────────┘  lines └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! hmgr init
//! hmgr check staged.json --type c_community_health_unit
//! hmgr schedule move --type c_community_health_unit \
//!     --source replacement="Kitui East" --source SUBCOUNTY=Kitui \
//!     --destination SUBCOUNTY=Mwingi
//! hmgr worker
//! hmgr jobs --logs <job-id>
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration with environment overrides |
//! | [`platform`] | HTTP client: login, place listing, health probe |
//! | [`check`] | Batch resolve/validate/warn of staged places |
//! | [`schedule`] | Building and enqueuing mutation jobs |
//! | [`worker`] | The mutation worker |
//! | [`command`] | Configuration tool command lines and process runner |
//! | [`queue_sqlite`] | SQLite job store |
//! | [`jobs`] | Queue inspection |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod check;
pub mod command;
pub mod config;
pub mod db;
pub mod jobs;
pub mod migrate;
pub mod platform;
pub mod queue_sqlite;
pub mod schedule;
pub mod worker;
