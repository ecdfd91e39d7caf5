// Adapters layer: concrete implementations of the exchange ports.

pub mod channel;
pub mod ledger;
pub mod memory;
pub mod staging;
pub mod transform;

pub use channel::{FilteredChannel, HttpMailboxChannel, LocalMailboxChannel};
pub use ledger::JsonLedger;
pub use staging::LocalStagingStore;
pub use transform::{transform_for, DelimitedTransform, PartnerFormat};
