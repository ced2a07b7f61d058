//! Windowguard - Fixed-Window Request Rate Limiting
//!
//! This crate implements the decision and storage engine behind HTTP rate
//! limiting. A request is classified into an ordered set of vary dimensions
//! (route, method, tenant, GraphQL operation, ...), fingerprinted, and
//! counted against a fixed window kept in pluggable storage.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod storage;
