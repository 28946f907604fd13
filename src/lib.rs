//! Conversational calendar assistant with two-tier result caching.
//!
//! - [`cache::ResponseCache`]: fingerprint-keyed LRU in front of the
//!   reasoning backend ([`providers::CachedProvider`]).
//! - [`cache::QueryResultCache`]: revision-stamped cache in front of event
//!   listing ([`tools::CalendarTools`]), invalidated by every committed
//!   mutation.
//! - [`telemetry`]: per-turn hit and token-savings accounting.

pub mod agent;
pub mod app;
pub mod cache;
pub mod config;
pub mod error;
pub mod providers;
pub mod session;
pub mod store;
pub mod telemetry;
pub mod timeparse;
pub mod tools;

pub use app::App;
pub use config::Config;
pub use error::{CalendarError, Result};
