//! ComfyUI backend integration.
//!
//! - [`api`]: REST client behind the [`api::ComfyBackend`] trait.
//! - [`client`], [`messages`], [`events`], [`reconnect`]: the event
//!   WebSocket, its message types and their normalization into job events.
//! - [`multiplexer`]: the single process-wide event connection, fanned out
//!   per prompt id.
//! - [`correlator`], [`resolver`]: drive one job to a result.
//! - [`registry`], [`shutdown`]: in-flight bookkeeping and cancellation on
//!   process exit.

pub mod api;
pub mod client;
pub mod correlator;
pub mod error;
pub mod events;
pub mod messages;
pub mod multiplexer;
pub mod reconnect;
pub mod registry;
pub mod resolver;
pub mod shutdown;

#[cfg(test)]
mod test_support;
