//! Credential verification, one-time artifacts, and access rules.

use std::future::Future;
use std::pin::Pin;

pub mod accounts;
pub mod authenticator;
pub mod directory;
pub mod error;
pub mod onetime;
pub mod permissions;
pub mod rate_limit;

/// Boxed future used by the injectable store traits so they stay object
/// safe without an async-trait dependency.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
