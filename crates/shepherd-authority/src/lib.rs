//! Authority placement and handoff for the lock arbitration engine.
//!
//! Exactly one [`AuthorityInstance`] serves a given file at a time; the
//! [`AuthorityRegistry`] is the placement truth every instance validates
//! against, and [`transfer_authority`] moves a file's live lock state
//! between instances as one atomic unit.

pub mod handoff;
pub mod instance;
pub mod registry;

pub use handoff::transfer_authority;
pub use instance::AuthorityInstance;
pub use registry::{AuthorityRegistry, PlacementView};
