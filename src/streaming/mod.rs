//! Streaming execution path
//!
//! One logical task pulls chunks from the [`AdaptiveChunker`](crate::chunker::AdaptiveChunker),
//! reduces them and yields results lazily. The only suspension point besides
//! the reducer itself is the backpressure wait.

pub mod backpressure;
pub mod processor;
pub mod state;

pub use backpressure::{Backoff, BackpressureGate, PressureOutcome};
pub use processor::{aggregate_stream, StreamingProcessor};
pub use state::{apply_transition, StateError, StreamEvent, StreamState};
