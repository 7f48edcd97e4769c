//! # Collective communication between ranks
//!
//! Every rank runs the same sequence of rounds. In each round, every rank hands the
//! backend one [`Payload`] and gets back the payloads of all ranks, indexed by rank. That
//! single primitive, `exchange_round`, is enough to express the search protocol:
//!
//! *   **Broadcast**: the owner of a query batch contributes the rows, everyone else
//!     contributes [`Payload::Empty`].
//! *   **Gather**: every rank contributes its local candidates, and only the owner keeps the
//!     result ([`CollectiveBackend::gather`]).
//! *   **Barrier**: an exchange of empty payloads that fails if any rank aborted.
//!
//! The engine never looks at how payloads travel. [`CpuBackend`](cpu_backend::CpuBackend)
//! runs ranks as threads of one process over `crossbeam` channels; a networked backend
//! would implement the same trait.

pub mod backend;
pub mod cpu_backend;
pub mod message;

pub use backend::CollectiveBackend;
pub use cpu_backend::CpuBackend;
pub use message::{CallShape, Envelope, Neighbor, Payload, ensure_no_abort};
