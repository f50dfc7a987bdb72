//! Configuration types for adapters and scans.
//!
//! - `AdapterConfig`: how to reach a source and the resource limits to honor
//! - `ScanOptions`: what a scan covers and what its report contains
//! - `UnitFilter`: include/exclude lists applied during enumeration
//!
//! All of these are plain values passed into constructors. Loading them from
//! files or the environment is left to callers.

mod connection;
mod filter;
mod scan;

pub use connection::AdapterConfig;
pub use filter::{UnitFilter, glob_match, matches_any_pattern};
pub use scan::ScanOptions;
