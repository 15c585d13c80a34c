//! Approuter - a minimal HTTP application router
//!
//! Forwards incoming requests to backend destinations, providing:
//! - Declarative destination table (name, urlPrefix, targetBaseURL)
//! - Longest-prefix routing with declaration-order tiebreak
//! - Streaming request/response forwarding, no body buffering
//! - Optional verbatim Authorization forwarding per destination
//! - Gateway errors (404/502/504) for routing and backend failures

pub mod destinations;
pub mod error;
pub mod proxy;

pub use destinations::{Destination, DestinationTable};
pub use error::{ConfigError, ForwardError};
pub use proxy::{ProxyConfig, ProxyServer};
