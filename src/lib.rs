//! Layered Cache - Three-tier cache facade
//!
//! Fronts application code with a single typed key/value interface over an
//! in-process memory tier, a local on-disk tier, and a distributed tier.
//! The tiers are coordinated with read-through / write-through, single-flight
//! load collapsing, circuit-breaker fault isolation around the distributed
//! store, cross-process invalidation via key-change notifications, a
//! self-limiting disk tier, and TTL jitter to de-synchronise expirations.

pub mod cache_types;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod disk_space;
pub mod distributed_cache;
pub mod error;
pub mod file_cache;
pub mod key_lock;
pub mod layered_cache;
pub mod memory_cache;
pub mod serializer;
pub mod single_flight;
pub mod store;
pub mod ttl_jitter;

pub use cache_types::{
    CacheParameters, Cacheable, DistributedItem, FileCacheItem, GetOrCreateContext, SharedValue,
};
pub use config::CacheOptions;
pub use error::{CacheError, Result};
pub use layered_cache::LayeredCache;
pub use serializer::{JsonLz4Serializer, JsonSerializer, Serializer};
pub use store::Store;
