//! Persistent state management
//!
//! A single actor owns the store; everything else holds a [`StateManager`]
//! handle. See [`messages::StateCommand`] for the full command surface.

pub mod manager;
pub mod messages;

pub use manager::{StateEvent, StateManager};
pub use messages::{EventDraft, StateCommand, StateError, StateResult, TimelineQuery};
