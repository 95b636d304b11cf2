//! cq-providers: Model backend transports for colloquy
//!
//! This crate provides implementations of the `Transport` trait and the
//! retry / rate-limit context they share.

pub mod context;
pub mod openai;

pub use context::{RateLimiter, RetryPolicy, TransportContext};
pub use openai::ChatCompletionsTransport;
