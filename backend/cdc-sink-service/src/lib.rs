//! CDC sink service
//!
//! Consumes change-data-capture topics and applies every change event
//! exactly once to a wide-column store, a relational store, or both.

pub mod config;
pub mod error;
pub mod kafka;
pub mod metrics;
pub mod services;
pub mod store;
