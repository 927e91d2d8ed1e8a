//! KubeVirt resource definitions
//!
//! Partial, read-only views of the KubeVirt CRDs the virt-joiner controller
//! works with. KubeVirt owns these schemas; only the fields we read are
//! modelled, so these types are never used to write objects back.

pub mod instancetype;
pub mod virtual_machine;

pub use instancetype::*;
pub use virtual_machine::*;
