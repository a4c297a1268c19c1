//! pacer: a paced load-generation and measurement engine.
//!
//! The [`runner`] module drives N workers issuing calls on an absolute
//! per-call schedule; [`http`], [`grpc`], [`tcp`] and [`udp`] provide the
//! per-protocol call adapters consumed by it; [`server`] hosts the echo
//! and proxy servers used to validate measurements; [`report`] writes the
//! JSON result documents.

pub mod grpc;
pub mod http;
mod proto;
pub mod report;
pub mod runner;
pub mod server;
pub mod tcp;
pub mod udp;
