//! Event bus and the event catalog

pub mod bus;
pub mod types;

pub use bus::{EventBus, create_event_bus};
pub use types::BusEvent;
