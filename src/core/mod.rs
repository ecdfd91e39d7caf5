pub mod exchange;
pub mod job;
pub mod sequence;

pub use crate::domain::model::{CycleReport, Record, SequenceClaim};
pub use crate::domain::ports::{
    DomesticLedger, FileTransform, RemoteChannel, SequenceAllocator, StagingStore, Storage,
};
pub use crate::utils::error::Result;
