use crate::error::Result;
use async_trait::async_trait;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct DumpOptions {
    /// 0-9, passed through to the dump tool.
    pub compression_level: u8,
    /// Number of export workers. Values above 1 switch to a multi-file
    /// format that is bundled into the single artifact.
    pub parallelism: u32,
}

#[derive(Debug, Clone)]
pub struct DumpStats {
    pub bytes_written: u64,
    pub duration_seconds: f64,
}

#[async_trait]
pub trait DatabaseDriver: Send + Sync {
    async fn test_connection(&self) -> Result<()>;
    /// Writes one dump file at `output`. Callers handle partial-file cleanup.
    async fn dump(&self, output: &Path, options: &DumpOptions) -> Result<()>;
    fn engine_name(&self) -> &'static str;
}

/// Structural check of an artifact. Returns false on any problem; a failed
/// check is an expected outcome, not an error.
#[async_trait]
pub trait ArtifactVerifier: Send + Sync {
    async fn verify(&self, artifact: &Path) -> bool;
}
