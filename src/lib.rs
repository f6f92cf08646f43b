//! # Portiko (Internal single sign-on broker)
//!
//! `portiko` brokers logins for internal applications. It verifies staff
//! credentials against a read-only company directory, hands out one-time
//! authorization codes, resolves per-application access rules and grants,
//! and signs RS256 access tokens relying applications verify offline with
//! the broker's public key.
//!
//! ## Data stores
//!
//! Two databases are involved:
//!
//! 1. **Broker database** (read-write): local accounts (bcrypt hashes),
//!    one-time tokens, permission grants, and the append-only admin audit
//!    log. Schema in `db/sql/01_portiko.sql`.
//! 2. **Staff directory** (read-only): the authoritative list of staff,
//!    owned by another system. The broker only ever reads it.
//!
//! Registered applications live in a JSON file reloaded on mtime change,
//! so operations can add an app without a restart.

pub mod api;
pub mod audit;
pub mod auth;
pub mod cli;
pub mod notify;
pub mod registry;
pub mod token;
