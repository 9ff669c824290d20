//! priosched - a preemptive priority scheduler core
//!
//! Design principles:
//! - Tractable: one global ready list, one lock discipline, explicit invariants
//! - Priority first: the highest-priority ready thread always runs next, and a
//!   mutex holder runs at least as high as anyone it keeps waiting
//! - Testable on a workstation: kernel threads are host threads, and only the
//!   one a logical CPU has selected may run
//!
//! Everything lives under [`kernel`].

pub mod kernel;
