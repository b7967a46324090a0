//! Outbound throttling
//!
//! Each traffic class has a bounded FIFO queue and a trailing send window;
//! a background dispatcher drains the queues without exceeding the window.

pub mod limiter;
pub mod window;

pub use limiter::{
    EnqueueOutcome, OutboundSink, RateLimiter, ThrottleNotice, ThrottleReason, TrafficClass,
};
pub use window::ThrottleWindow;
