//! Server-side evaluation of form logic.
//!
//! Form definitions carry per-component expressions (visibility conditions,
//! calculated values, custom validations) written against a live component
//! API. This crate rebuilds just enough of that API to run them without
//! rendering anything:
//!
//! - **[`core`]**: Pure, deterministic logic. The component shim
//!   ([`core::shim`]), the per-pass execution environment
//!   ([`core::environment`]), the Logic Engine seam ([`core::engine`]) and the
//!   evaluation orchestrator ([`core::orchestrator`]).
//! - **[`io`]**: Side-effecting operations: config and form files, and the
//!   out-of-process task protocol ([`io::task_runner`], [`io::worker`]).

pub mod core;
pub mod exit_codes;
pub mod form;
pub mod io;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
