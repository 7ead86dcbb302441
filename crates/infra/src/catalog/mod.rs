//! Target catalog data the apply engine writes.
//!
//! Handlers only ever see a `CatalogReader`; the apply engine is the single
//! writer and does so by replacing each target with its journaled `after`
//! snapshot (or removing it when the snapshot is absent).

pub mod postgres;
pub mod store;

pub use postgres::PostgresCatalogStore;
pub use store::{CatalogEntity, CatalogError, CatalogReader, CatalogStore, InMemoryCatalogStore};
