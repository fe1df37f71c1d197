mod model;
mod recorder;

pub use model::{
    embedded_timestamp, BackupRun, EncryptionMethod, MetadataDocument, RunStatus,
    VerificationStatus,
};
pub use recorder::{FileMetadataStore, MetadataRecorder, MetadataStore};
