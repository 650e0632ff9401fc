//! The patrol daemon library.
//!
//! The binary in `main.rs` is a thin shell: argument parsing, logging,
//! and daemonization. Everything it runs lives here so integration tests
//! can drive the same stack over real sockets:
//!
//! - [`platform`]: typed interfaces to the host primitives the request
//!   handlers consume (files, power, system info, MSR/registry/WMI).
//! - [`dispatch`]: the request/response envelope and the dispatcher that
//!   routes authenticated payloads to handler families.
//! - [`framing`]: the stream-side codec that carves secure packets off
//!   the connection bytestream.
//! - [`endpoint`]: the two named local-socket endpoints, per-connection
//!   framing, and the session gate.
//! - [`supervisor`]: component ownership, startup order, and orderly
//!   teardown.

pub mod dispatch;
pub mod endpoint;
pub mod framing;
pub mod platform;
pub mod supervisor;
