//! How `stackops` talks to the process that owns the remote stacks.
//!
//! A provider is a long-lived child process. `stackops` writes one JSON
//! request per line to its stdin and reads one JSON response per line from
//! its stdout, strictly in order. Anything the provider wants to say to the
//! operator goes to stderr.
//!
//! - [`schema`]: the messages.
//! - [`client`]: the `stackops` side, an implementation of
//!   [`StackService`](stackops_core::stack_api::StackService).
//! - [`framework`]: the provider side, which turns a `StackService` into a
//!   provider executable.

pub mod client;
pub mod framework;
pub mod schema;
