//! Proxy configuration: the per-connection address filter

pub mod filter;

pub use filter::{FilterError, FilterState, FilterType, ProxyFilterManager, StatusOutcome};
