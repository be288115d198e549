//! Node-side persistent storage for the Caldera chain.

#![deny(rustdoc::broken_intra_doc_links)]
#![deny(rustdoc::private_intra_doc_links)]

pub mod rocksdb;

pub use crate::rocksdb::RocksDb;
