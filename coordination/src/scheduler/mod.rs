//! Turn scheduling.
//!
//! Each session runs as one actor task that owns its [`Session`](crate::session::Session)
//! and processes, strictly in order, its own ticks and every message sent
//! through a [`SessionHandle`]. The [`TurnCoordinator`] starts and stops
//! those actors and owns what they share.
//!
//! A tick does at most one of:
//! - end the session when a limit is reached
//! - release a finished speech's floor and hand it to the listeners
//! - start the next speech (queued request first, then the least recent speaker)

mod actor;
pub mod handle;
pub mod manager;
pub mod trigger;

pub use handle::SessionHandle;
pub use manager::{SessionRequest, SharedTurnCoordinator, TurnCoordinator};
pub use trigger::{ClaimOutcome, DropReason, PendingTrigger};
