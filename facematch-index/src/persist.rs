//! On-disk layout of a snapshot.
//!
//! A snapshot is stored as two files that are only meaningful together:
//!
//! - `faces.idx`: header (magic, format version, dimension, vector count,
//!   build id) followed by the `count x dimension` f32 matrix in host byte
//!   order.
//! - `faces.keys`: postcard-encoded key mapping carrying the same build id.
//!
//! Both files are first written under unique staging names and only renamed
//! into place once both are complete. If either file is missing the index is
//! reported as not built.

use std::borrow::Cow;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{FlatIndex, IndexError, IndexSnapshot, EMBEDDING_DIM};

pub const INDEX_FILE: &str = "faces.idx";
pub const KEYS_FILE: &str = "faces.keys";

const MAGIC: &[u8; 4] = b"FMIX";
const FORMAT_VERSION: u32 = 1;
// magic + version + dimension + count + build id
const HEADER_LEN: usize = 4 + 4 + 4 + 8 + 16;

#[derive(Debug, Serialize, Deserialize)]
struct KeyMapping {
    build_id: Uuid,
    built_at_ms: u64,
    keys: Vec<String>,
}

/// Locations of the two artifacts that make up a persisted snapshot.
#[derive(Debug, Clone)]
pub struct IndexFiles {
    pub index_path: PathBuf,
    pub keys_path: PathBuf,
}

impl IndexFiles {
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            index_path: dir.join(INDEX_FILE),
            keys_path: dir.join(KEYS_FILE),
        }
    }

    /// True only when both artifacts exist.
    pub fn is_complete(&self) -> bool {
        self.index_path.exists() && self.keys_path.exists()
    }

    pub fn persist(&self, snapshot: &IndexSnapshot) -> Result<(), IndexError> {
        self.stage(snapshot)?.commit()
    }

    /// Write both artifacts under staging names next to their final paths.
    pub fn stage(&self, snapshot: &IndexSnapshot) -> Result<StagedFiles, IndexError> {
        if let Some(parent) = self.index_path.parent() {
            fs::create_dir_all(parent)?;
        }
        if let Some(parent) = self.keys_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let build_id = snapshot.build_id();
        let staged = StagedFiles {
            index_tmp: staging_path(&self.index_path, build_id),
            keys_tmp: staging_path(&self.keys_path, build_id),
            files: self.clone(),
            committed: false,
        };

        write_index(&staged.index_tmp, snapshot)?;

        let mapping = KeyMapping {
            build_id,
            built_at_ms: snapshot
                .built_at()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
            keys: snapshot.keys().to_vec(),
        };
        let data = postcard::to_allocvec(&mapping)?;
        let mut file = File::create(&staged.keys_tmp)?;
        file.write_all(&data)?;
        file.sync_all()?;

        Ok(staged)
    }

    /// Load the persisted pair. `Ok(None)` means the index was never built
    /// (or only half of it is present).
    pub fn load(&self) -> Result<Option<IndexSnapshot>, IndexError> {
        match (self.index_path.exists(), self.keys_path.exists()) {
            (true, true) => {}
            (false, false) => return Ok(None),
            (index, keys) => {
                log::warn!(
                    "incomplete index artifacts (index: {}, keys: {}), treating index as not built",
                    index,
                    keys
                );
                return Ok(None);
            }
        }

        let raw = fs::read(&self.index_path)?;
        let (build_id, vectors) = decode_index(&raw)?;

        let mapping: KeyMapping = postcard::from_bytes(&fs::read(&self.keys_path)?)?;
        if mapping.keys.len() != vectors.nrows() {
            return Err(IndexError::KeyCountMismatch {
                vectors: vectors.nrows(),
                keys: mapping.keys.len(),
            });
        }
        if mapping.build_id != build_id {
            return Err(IndexError::PairMismatch {
                index: build_id,
                keys: mapping.build_id,
            });
        }

        let index = FlatIndex::build(vectors)?;
        let built_at = UNIX_EPOCH + Duration::from_millis(mapping.built_at_ms);
        log::debug!(
            "loaded index {} with {} vectors from {}",
            build_id,
            index.len(),
            self.index_path.display()
        );
        IndexSnapshot::from_parts(index, mapping.keys, build_id, built_at).map(Some)
    }

    /// Delete both artifacts, ignoring ones that are already gone.
    pub fn remove(&self) -> Result<(), IndexError> {
        for path in [&self.index_path, &self.keys_path] {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

/// Both artifacts of one build, written but not yet visible under their
/// final names. Dropping without `commit` removes the staged files.
#[derive(Debug)]
pub struct StagedFiles {
    files: IndexFiles,
    index_tmp: PathBuf,
    keys_tmp: PathBuf,
    committed: bool,
}

impl StagedFiles {
    pub fn commit(mut self) -> Result<(), IndexError> {
        fs::rename(&self.index_tmp, &self.files.index_path)?;
        fs::rename(&self.keys_tmp, &self.files.keys_path)?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for StagedFiles {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        for path in [&self.index_tmp, &self.keys_tmp] {
            if let Err(e) = fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    log::warn!("failed to remove staged file {}: {}", path.display(), e);
                }
            }
        }
    }
}

fn staging_path(path: &Path, build_id: Uuid) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".{}.tmp", build_id.simple()));
    path.with_file_name(name)
}

fn write_index(path: &Path, snapshot: &IndexSnapshot) -> Result<(), IndexError> {
    let vectors = snapshot.index().vectors();
    let data: Cow<'_, [f32]> = match vectors.as_slice() {
        Some(slice) => Cow::Borrowed(slice),
        None => Cow::Owned(vectors.iter().copied().collect()),
    };

    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    writer.write_all(MAGIC)?;
    writer.write_all(&FORMAT_VERSION.to_le_bytes())?;
    writer.write_all(&(EMBEDDING_DIM as u32).to_le_bytes())?;
    writer.write_all(&(vectors.nrows() as u64).to_le_bytes())?;
    writer.write_all(snapshot.build_id().as_bytes())?;
    writer.write_all(bytemuck::cast_slice::<f32, u8>(&data))?;
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    Ok(())
}

fn decode_index(raw: &[u8]) -> Result<(Uuid, Array2<f32>), IndexError> {
    if raw.len() < HEADER_LEN {
        return Err(IndexError::InvalidFormat(
            "file too small to contain header".to_string(),
        ));
    }
    if &raw[0..4] != MAGIC {
        return Err(IndexError::InvalidFormat("invalid magic bytes".to_string()));
    }

    let version = read_u32(raw, 4);
    if version != FORMAT_VERSION {
        return Err(IndexError::InvalidFormat(format!(
            "unsupported format version {} (expected {})",
            version, FORMAT_VERSION
        )));
    }

    let dimension = read_u32(raw, 8) as usize;
    if dimension != EMBEDDING_DIM {
        return Err(IndexError::Dimension {
            expected: EMBEDDING_DIM,
            actual: dimension,
        });
    }

    let count = usize::try_from(read_u64(raw, 12))
        .map_err(|_| IndexError::InvalidFormat("vector count overflows usize".to_string()))?;

    let mut id = [0u8; 16];
    id.copy_from_slice(&raw[20..HEADER_LEN]);
    let build_id = Uuid::from_bytes(id);

    let body = &raw[HEADER_LEN..];
    let expected = count
        .checked_mul(EMBEDDING_DIM * std::mem::size_of::<f32>())
        .ok_or_else(|| IndexError::InvalidFormat("vector count too large".to_string()))?;
    if body.len() != expected {
        return Err(IndexError::InvalidFormat(format!(
            "header declares {} vectors ({} bytes) but body holds {} bytes",
            count,
            expected,
            body.len()
        )));
    }

    let mut values = vec![0.0f32; count * EMBEDDING_DIM];
    bytemuck::cast_slice_mut::<f32, u8>(&mut values).copy_from_slice(body);
    let vectors = Array2::from_shape_vec((count, EMBEDDING_DIM), values)
        .map_err(|e| IndexError::InvalidFormat(e.to_string()))?;
    Ok((build_id, vectors))
}

fn read_u32(raw: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]])
}

fn read_u64(raw: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&raw[at..at + 8]);
    u64::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_staging_path_is_sibling() {
        let id = Uuid::new_v4();
        let p = staging_path(Path::new("/data/index/faces.idx"), id);
        assert_eq!(p.parent(), Some(Path::new("/data/index")));
        assert!(p
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("faces.idx."));
        assert!(p.to_string_lossy().ends_with(".tmp"));
    }

    #[test]
    fn test_decode_rejects_short_header() {
        let err = decode_index(b"FMIX").unwrap_err();
        assert!(matches!(err, IndexError::InvalidFormat(_)));
    }

    #[test]
    fn test_decode_rejects_bad_magic() {
        let raw = vec![0u8; HEADER_LEN];
        assert!(matches!(decode_index(&raw), Err(IndexError::InvalidFormat(_))));
    }
}
