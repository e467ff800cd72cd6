//! statewire gateway: hosts sessions and streams their state to subscribers.
//!
//! Each session owns a [`StepRunner`](statewire_agent::StepRunner) writing to
//! a [`SessionChannel`], which fans sequenced events out to in-process
//! [`Subscription`]s and to WebSocket clients at `/sessions/{id}/ws`.

pub mod channel;
pub mod connection;
pub mod events;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod server;
pub mod state;

pub use channel::{SessionChannel, Subscription};
pub use server::{router, serve, start_gateway};
pub use state::{GatewayState, SessionEntry};
