//! Sorted flat containers backed by contiguous storage.
//!
//! These are the leaf primitives the runtime builds on: small keyed
//! collections where cache-friendly binary search beats a tree or a hash
//! table. Positions are plain indices and are invalidated by any
//! insertion or removal.

mod flat_map;
mod flat_set;

pub use flat_map::FlatMap;
pub use flat_set::FlatSet;
