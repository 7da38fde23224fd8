#[macro_use]
extern crate serde;

#[macro_use]
extern crate log;

mod blob;
mod commitment;
mod coordinator;
mod election;
mod error;
mod keystore;
mod ledger;
mod recount;
mod retention;
mod store;
mod tally;

pub mod envelope;
pub mod keygen;

pub use blob::*;
pub use commitment::*;
pub use coordinator::*;
pub use election::*;
pub use error::*;
pub use envelope::MasterKey;
pub use keygen::{ElectionPublicKey, PrivateKeyHandoff};
pub use keystore::*;
pub use ledger::*;
pub use recount::*;
pub use retention::*;
pub use store::*;
pub use tally::*;

#[cfg(test)]
mod tests;
