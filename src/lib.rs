//! Sliding Throttle - sliding-window request rate limiting
//!
//! This crate implements a per-key sliding-window rate limiter. Each identity
//! key owns a short, time-ordered history of admitted requests kept in a
//! pluggable store: an in-process map, or a gossip-replicated store shared by a
//! peer-to-peer mesh of nodes.

pub mod config;
pub mod error;
pub mod mesh;
pub mod ratelimit;
pub mod store;

pub use error::{Result, ThrottleError};
pub use ratelimit::{Decision, HistoryRecord, RateLimiter, RatePolicy};
