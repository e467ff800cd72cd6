//! Core types for statewire: state container, patches, sessions, wire protocol,
//! config, and errors.

pub mod config;
pub mod error;
pub mod patch;
pub mod protocol;
pub mod session;
pub mod shape;
pub mod state;
pub mod transport;
