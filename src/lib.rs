//! Warden: capability-based authorization and sandboxed execution for
//! semi-trusted generated programs.
//!
//! A submitted program is scanned statically ([`analysis`]), then run under a
//! resource policy ([`sandbox`]) where every side effect needs an unexpired,
//! unrevoked capability ([`capability`]). Every decision lands in a
//! tamper-evident audit trail that drives incident response ([`audit`]).

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod ast;
pub mod config;
pub mod logging;

pub mod analysis;
pub mod capability;
pub mod sandbox;

pub mod audit;
pub mod pipeline;
