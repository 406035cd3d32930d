//! # Streaming Reads
//!
//! Serves byte ranges of a resource while it is still downloading.

mod engine;

pub use engine::{
    ContentInfo, ReadEvent, ReadHandle, ReadId, ReadRequest, ReadyData, StreamFulfillmentEngine,
};
