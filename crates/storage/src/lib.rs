//! KV-resident storage for the Annex persistence domain
//!
//! Four components, each a thin typed layer over the host KV engine or, for
//! the pin map, over a shared memory-mapped file:
//!
//! - `meta`: typed get/put of named records in the meta sub-database
//! - `delta_log`: append-only encoded updates keyed by `log_seq`
//! - `snapshot`: chunked serialized-index storage keyed by
//!   `(snapshot_seq, chunk_ordinal)`
//! - `pins`: fixed-layout reader-pin file coordinated by an OS file lock

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod delta_log;
pub mod meta;
pub mod pins;
pub mod snapshot;

pub use delta_log::DeltaLog;
pub use meta::{CheckpointPending, CheckpointStage, MetaStore, PublishMarker, SealMarker};
pub use pins::{PinFile, PinFloors, PIN_SLOT_COUNT, PIN_SLOT_LEN};
pub use snapshot::SnapshotCatalog;
