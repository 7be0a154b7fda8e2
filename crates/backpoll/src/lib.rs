//! # Backpoll
//!
//! A backpressure-aware bridge from a poll-driven client to a pull-based
//! asynchronous consumer.
//!
//! Many native clients deliver results through callbacks that only fire
//! while the application keeps calling an opaque `poll()` entry point.
//! [`PollingSystem`] owns that loop and paces it with a high/low
//! watermark queue: polling pauses when the consumer falls behind and
//! resumes once it catches up, and the loop shuts down exactly once
//! whether iteration ends normally, the consumer walks away, or an
//! external shutdown is requested.
//!
//! ## Architecture
//!
//! ```text
//! run loop ──► poll() ──► deliver() ──► watermark queue ──► DeliveryStream
//!    ▲                                       │                 (consumer)
//!    └──── resume / park / shutdown ◄────────┘ queue signals
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! let (system, mut stream) = PollingSystem::create(PollingConfig::default())?;
//! system.set_poll_fn({
//!     let system = Arc::downgrade(&system);
//!     move || client.poll() // fires system.deliver(..) per result
//! });
//! tokio::spawn({
//!     let system = Arc::clone(&system);
//!     async move { system.run(Duration::from_millis(100)).await }
//! });
//!
//! while let Some(result) = stream.next().await {
//!     match result {
//!         Ok(item) => handle(item),
//!         Err(e) => report(e),
//!     }
//! }
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
// Common test patterns that are acceptable
#![cfg_attr(
    test,
    allow(
        clippy::field_reassign_with_default,
        clippy::manual_let_else,
        clippy::needless_return,
        clippy::unreadable_literal,
        clippy::unused_async
    )
)]

/// Polling system error types.
pub mod error;

/// Polling system configuration.
pub mod config;

/// High/low watermark delivery queue.
pub mod watermark;

/// Consumer-facing delivery stream.
pub mod stream;

/// Polling system metrics.
pub mod metrics;

/// The backpressure-aware polling coordinator.
pub mod system;

mod state;

pub use config::PollingConfig;
pub use error::PollingError;
pub use metrics::PollingMetrics;
pub use stream::DeliveryStream;
pub use system::PollingSystem;
pub use watermark::{PushOutcome, QueueDelegate, QueueSource};
