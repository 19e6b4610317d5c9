//! External service integrations.

pub mod event_bus {
    pub use crate::event_bus::*;
}

pub mod events {
    pub use crate::events::*;
}
