//! Domain logic for the ComfyUI relay.
//!
//! Everything in this crate is pure: the job lifecycle state machine,
//! output selection policy, media type derivation and the shared error
//! type. No I/O happens here; the `relay-comfyui` crate drives these
//! types from live backend traffic.

pub mod error;
pub mod job;
pub mod media;
pub mod output;
pub mod workflow;
