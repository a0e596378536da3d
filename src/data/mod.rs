//! The PVA data model: type descriptions, structured values and change bitsets
//!
//! PVA values are self-describing. A [`FieldDesc`] describes the type of a value
//! and is sent once (at request initialisation), after which values are sent as
//! raw data, often only the subset of elements selected by a [`BitSet`].

mod bitset;
mod introspection;
pub mod nt;
mod value;

use thiserror::Error;

pub use bitset::BitSet;
pub use introspection::{FieldDesc, ScalarType, StructureDesc, TypeRegistry, UnionDesc};
pub use value::{PvField, PvStructure, PvUnion, PvValue, StructureBuilder};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DataError {
    #[error("Incompatible structure: {0}")]
    Incompatible(String),
    #[error("No field named '{0}'")]
    UnknownField(String),
    #[error("Type mismatch: {0}")]
    TypeMismatch(String),
}
