//! Analysis modules.
//!
//! Quarterly reduction and accumulation of tag states.

pub mod aggregator;

pub use aggregator::*;
