//! Event-driven observation of turn coordination
//!
//! Sessions publish every lifecycle step as a [`TurnEvent`] on a shared
//! [`EventBus`]. This is the outbound interface: `utterance_finalized`
//! events feed transports and transcripts, `session_ended` events tell
//! callers a conversation is over.
//!
//! # Event Flow
//!
//! ```text
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────┐
//! │ Session actor│────▶│  Event Bus   │────▶│  Subscribers │
//! │  (publish)   │     │  (broadcast) │     │ (recv/filter)│
//! └──────────────┘     └──────────────┘     └──────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use turn_coordination::events::EventFilter;
//!
//! let mut utterances = coordinator
//!     .event_bus()
//!     .subscribe_filtered(EventFilter::new().types(vec!["utterance_finalized"]));
//!
//! while let Ok(event) = utterances.recv().await {
//!     println!("{:?}", event);
//! }
//! ```

pub mod bus;
pub mod types;

pub use bus::{EventBus, EventFilter, FilteredReceiver, SharedEventBus};
pub use types::TurnEvent;
