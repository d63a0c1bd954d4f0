//! Core data model: message identity, envelope, parsed view, parts and events.

pub mod address;
pub mod message;
