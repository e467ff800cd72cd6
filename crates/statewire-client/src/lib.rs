//! Frontend side of statewire.
//!
//! A [`ClientStore`] keeps a mirror of one session's state: it applies
//! sequenced events in order, buffers short reorderings, shows local writes
//! optimistically until the backend settles them, and publishes a change
//! notification after every visible update. [`ClientSubscription`] drives a
//! store from any [`EventSource`](statewire_core::transport::EventSource),
//! such as [`WsTransport`].

pub mod reconcile;
pub mod store;
pub mod subscription;
pub mod ws;

pub use reconcile::{PendingWrites, Settled};
pub use store::{ClientStore, Ingest, MirrorChange};
pub use subscription::ClientSubscription;
pub use ws::{WsTransport, session_url};
