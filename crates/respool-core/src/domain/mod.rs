//! Domain layer
//!
//! Contains the lock pool and the event types it publishes.

pub mod events;
pub mod locking;
