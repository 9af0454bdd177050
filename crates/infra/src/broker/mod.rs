//! Infrastructure-backed broker implementations.
//!
//! The broker seam itself lives in `circstore-events` as pure mechanics, with an
//! in-memory implementation for tests. This module provides Redis Streams.

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::RedisStreamsBroker;
