//! Connection to the relay server and its reconnect policy

mod backoff;
mod link;

pub use backoff::ExponentialBackoff;
pub use link::{Inbound, LinkSettings, RelayLink};
