//! Runespine: a governed kernel for rune invocation.
//!
//! Every call to a registered rune passes through one dispatcher that
//! resolves it against the registry, applies policy, schema, governance,
//! and stabilization gates, runs the handler, and records the outcome in
//! two independent hash-linked audit streams.
//!
//! See `DESIGN.md` for the architecture notes.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod credentials;
pub mod kernel;
pub mod logging;
