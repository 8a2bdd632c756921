//! Assured replication
//!
//! The sending side blocks a writer until its update is acknowledged, the
//! receiving side answers Safe Read updates after replay, and relays
//! aggregate answers before acknowledging.

pub mod expected;
pub mod metrics;
pub mod responder;
pub mod sender;

pub use expected::ExpectedAcks;
pub use metrics::{AssuredMetrics, AssuredSnapshot, ModeCounters};
pub use responder::AssuredResponder;
pub use sender::{AckDeadline, AssuredSendCoordinator, AssuredState, PublishOutcome};
