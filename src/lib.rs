//! Checkpoint/restore core for soft-RoCE (`rxe`) verbs device contexts.
//!
//! This crate captures the userspace-visible state of an open `rxe` verbs
//! device context — protection domains, memory regions, completion queues,
//! and queue pairs — and rebuilds an equivalent context with identical
//! handles, keys, and queue-pair numbers on a destination host. It is
//! meant to be linked into a process-migration framework as a service
//! module, not run standalone.
//!
//! Module map:
//! - [`model`] — the decoded object graph.
//! - [`error`] — the crate-wide error type.
//! - [`driver`] — device-node → driver-tag registry.
//! - [`knobs`] — `last_qpn`/`last_mrn` procfs knobs and their scoped guards.
//! - [`catalog`] — per-kind handle table used to resolve dependencies.
//! - [`vma`] — VMA-ownership bookkeeping and the restore-time re-map hook.
//! - [`wire`] — byte-cursor helpers for the kernel dump ABI.
//! - [`decode`] — dump-buffer decoder.
//! - [`device`] — device/context lifecycle and the `VerbsDevice` trait.
//! - [`restore`] — dependency-ordered restore pipeline and QP state machine.
//! - [`event`] — async-event-fd shim.
//! - [`subsystem`] — the top-level `VerbsSubsystem` lifecycle object.

pub mod catalog;
pub mod decode;
pub mod device;
pub mod driver;
pub mod error;
pub mod event;
pub mod knobs;
pub mod model;
pub mod restore;
pub mod subsystem;
pub mod testutil;
pub mod vma;
pub mod wire;

pub use error::{CrError, CrResult};
pub use subsystem::VerbsSubsystem;
