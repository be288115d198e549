//! The core types shared across the Caldera chain: universal addresses,
//! hashes, transactions, scripts and contract outputs.

#![deny(rustdoc::broken_intra_doc_links)]
#![deny(rustdoc::private_intra_doc_links)]

pub mod address;
pub mod contract;
pub mod hash;
pub mod script;
pub mod transaction;
