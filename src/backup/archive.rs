use crate::error::{BackupError, Result};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use tracing::{debug, info};
use zip::write::SimpleFileOptions;
use zip::{ZipArchive, ZipWriter};

pub const TOC_ENTRY: &str = "toc.dat";

const CUSTOM_DUMP_MAGIC: &[u8] = b"PGDMP";
const ZIP_MAGIC: &[u8] = b"PK\x03\x04";

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ArtifactKind {
    /// Single-file custom-format dump.
    CustomDump,
    /// Directory-format dump packed into a stored zip.
    DirectoryBundle,
    Unknown,
}

impl ArtifactKind {
    pub fn detect(path: &Path) -> Result<Self> {
        let mut header = [0u8; 5];
        let mut file = File::open(path)?;
        let mut filled = 0;
        while filled < header.len() {
            let n = file.read(&mut header[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        let header = &header[..filled];
        if header.starts_with(CUSTOM_DUMP_MAGIC) {
            Ok(ArtifactKind::CustomDump)
        } else if header.starts_with(ZIP_MAGIC) {
            Ok(ArtifactKind::DirectoryBundle)
        } else {
            Ok(ArtifactKind::Unknown)
        }
    }
}

/// Packs every file of a directory-format dump into one zip. Entries are
/// stored, since the dump files are already compressed.
pub fn bundle_directory(source_dir: &Path, dest_path: &Path) -> Result<usize> {
    info!("Bundling {} into {}", source_dir.display(), dest_path.display());

    let mut entries: Vec<_> = fs::read_dir(source_dir)?
        .collect::<io::Result<Vec<_>>>()?
        .into_iter()
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .collect();
    entries.sort_by_key(|e| e.file_name());

    if !entries.iter().any(|e| e.file_name() == TOC_ENTRY) {
        return Err(BackupError::DumpFailed(format!(
            "dump directory {} has no {}",
            source_dir.display(),
            TOC_ENTRY
        )));
    }

    let dest_file = File::create(dest_path)?;
    let mut zip = ZipWriter::new(BufWriter::new(dest_file));
    let options = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Stored)
        .large_file(true);
    let mut buffer = vec![0u8; 64 * 1024];

    for entry in &entries {
        let name = entry.file_name().to_string_lossy().to_string();
        debug!("Adding {}", name);
        zip.start_file(name.as_str(), options)?;

        let mut reader = BufReader::new(File::open(entry.path())?);
        loop {
            let bytes_read = reader.read(&mut buffer)?;
            if bytes_read == 0 {
                break;
            }
            zip.write_all(&buffer[..bytes_read])?;
        }
    }

    let mut writer = zip.finish()?;
    writer.flush()?;
    Ok(entries.len())
}

/// Reads every entry of a bundle to the end, which checks each entry's CRC,
/// and extracts the table of contents into `toc_dir`. Returns the number of
/// entries read.
pub fn read_back_bundle(bundle: &Path, toc_dir: &Path) -> Result<usize> {
    let mut archive = ZipArchive::new(BufReader::new(File::open(bundle)?))
        .map_err(|e| BackupError::VerificationFailed(e.to_string()))?;
    let mut found_toc = false;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| BackupError::VerificationFailed(e.to_string()))?;
        if entry.name() == TOC_ENTRY {
            fs::create_dir_all(toc_dir)?;
            let mut out = File::create(toc_dir.join(TOC_ENTRY))?;
            io::copy(&mut entry, &mut out)?;
            found_toc = true;
        } else {
            io::copy(&mut entry, &mut io::sink())?;
        }
    }

    if !found_toc {
        return Err(BackupError::VerificationFailed(format!(
            "bundle {} has no {}",
            bundle.display(),
            TOC_ENTRY
        )));
    }
    Ok(archive.len())
}

pub fn calculate_sha256(file_path: &Path) -> Result<String> {
    use sha2::{Digest, Sha256};

    let file = File::open(file_path)?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}
