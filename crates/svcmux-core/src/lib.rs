//! # svcmux-core — Trait definitions for svcmux
//!
//! This crate defines the boundary between the dispatch core and its
//! collaborators. The dispatch loop never depends on a concrete transport,
//! registry, or request decoder — only on the traits declared here.
//!
//! ## Design principle
//!
//! > "Program to the interface. The loop routes descriptors; everything
//! >  that knows about bytes, sockets, or procedures lives behind a trait."
//!
//! The three seams:
//!
//! - [`transport::Transport`] — one endpoint's capability set.
//! - [`registry::TransportRegistry`] — the set of live endpoints and their
//!   pollable descriptors.
//! - [`processor::RequestProcessor`] — receive → decode → dispatch → reply
//!   for one ready descriptor, as a bounded synchronous unit.

pub mod error;
pub mod processor;
pub mod registry;
pub mod transport;
