//! # Types
//!
//! Value types shared by every engine: virtual addresses and the resolved
//! type graph.

pub mod address;
pub mod descriptor;

pub use address::Address;
pub use descriptor::{BaseEncoding, Compound, Enumerator, Member, Qualifier, TypeArena, TypeDescriptor, TypeId};
