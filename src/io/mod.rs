//! Sources, sinks, and the filter chain: the response-writer plumbing.

pub mod filter;
pub mod sink;
pub mod source;

pub use filter::{Filter, FilterChain};
pub use sink::Sink;
pub use source::{BufferSource, CallbackSource, CompositeSource, FileSource, FilterSource, Source};
