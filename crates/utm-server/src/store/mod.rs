//! Process-shared cache (A) and spatial index (B): the two components every
//! other worker reads from and writes through. Neither is ever the
//! persistent source of truth — the relational store (`persistence`) owns
//! that — but both must stay internally consistent under concurrent access.

pub mod kv;
pub mod spatial_index;
pub mod stream;

pub use kv::{KvStore, StoreError};
pub use spatial_index::{SpatialHit, SpatialIndex};
pub use stream::ObservationStream;
