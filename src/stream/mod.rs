//! Streaming ingestion: per-venue adapters, connection tasks and the manager
//! supervising them.

pub mod adapter;
mod connection;
pub mod manager;
pub mod venues;

pub use adapter::{Frame, StreamAdapter, WsQuote, adapter_for, streaming_exchanges, supports_streaming};
pub use manager::{StreamEvent, StreamManager};
