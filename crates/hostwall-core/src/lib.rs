//! # Hostwall Core
//!
//! Hostname-based egress filtering over Linux packet queues.
//!
//! The kernel classifies traffic into numbered NFQUEUE queues (via
//! operator-installed nftables rules); this crate inspects the queued
//! packets and returns accept/drop verdicts:
//!
//! - **DNS requests** pass only when every question asks for an allowed
//!   hostname.
//! - **DNS replies** are matched to a previously allowed request; their
//!   answers temporarily allow the answered IPs and alias targets.
//! - **General traffic** passes only towards (or from) currently
//!   allowed IPs, with an optional reverse-lookup fallback.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use hostwall_core::{Config, FilterManager, SystemResolver};
//!
//! # fn main() -> hostwall_core::Result<()> {
//! let config = Config::load("config.toml")?;
//! let resolver = Arc::new(SystemResolver::from_system_conf()?);
//! let mut manager = FilterManager::start(&config, resolver)?;
//! // ... wait for shutdown ...
//! manager.stop();
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod config;
pub mod conntrack;
pub mod error;
pub mod filter;
pub mod manager;
pub mod packet;
pub mod queue;
pub mod resolver;
mod sync;

#[cfg(test)]
pub(crate) mod testutil;

// Re-exports for convenience
pub use cache::TimedCache;
pub use config::{Config, FilterOptions, SELF_FILTER_NAME};
pub use error::{Error, Result};
pub use filter::Filter;
pub use manager::FilterManager;
pub use packet::{ConnectionId, IpFamily, Transport};
pub use resolver::{HostResolver, SystemResolver};
