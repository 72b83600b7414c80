mod error;
mod memory;
mod record;
mod traits;

pub mod conformance;

pub use error::StorageError;
pub use memory::MemoryStore;
pub use record::{
    ContentUpdate, EdgeRecord, EdgeStatus, EdgeUpdate, LabelValue, Labels, LockInfo, NewEdge,
    NewState, OutputDigest, OutputKeyRecord, SchemaSource, StateQuery, StateRecord,
    ValidationStatus,
};
pub use traits::{EdgeStore, StateStore, Storage};
