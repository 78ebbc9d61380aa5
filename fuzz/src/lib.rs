//! Pure in-memory models of the shared-memory protocols, driven by the
//! bolero harnesses under `tests/`. The models re-state the protocol
//! invariants independently of the production code so a divergence in
//! either direction fails loudly.

pub mod ring_model;
pub mod transport_model;
