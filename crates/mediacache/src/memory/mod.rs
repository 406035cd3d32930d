//! # Memory Tier
//!
//! Bounded in-memory caching with separate encoded and decoded tiers.

pub mod codec;
mod tiered;

pub use codec::{CacheCodec, DeflateCodec, IdentityCodec};
pub use tiered::{CacheStats, Evicted, EvictionHook, TieredMemoryCache};
