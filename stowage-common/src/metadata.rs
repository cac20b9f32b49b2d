//! On-disk volume records.
//!
//! Each volume is stored as `<root>/volumes/volume_<id>.json` with its snapshots embedded.
//! Records are written to a temporary file in the same directory and renamed into place,
//! so a concurrent `load` sees either the previous or the new record.

use std::{
    io::Write,
    path::{Path, PathBuf},
};

use crate::{
    error::{ResultExt, StowageError, StowageResult},
    model::Volume,
};

const VOLUMES_DIR: &str = "volumes";
const VOLUME_RECORD_PREFIX: &str = "volume_";
const RECORD_SUFFIX: &str = ".json";

/// Serialize `value` next to `path` and rename it into place.
pub fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> StowageResult<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let json = serde_json::to_vec_pretty(value)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temporary file in {}", dir.display()))?;
    tmp.write_all(&json)
        .and_then(|_| tmp.as_file().sync_all())
        .with_context(|| format!("Failed to write {}", path.display()))?;
    tmp.persist(path)
        .map_err(|e| StowageError::Io(e.error))
        .with_context(|| format!("Failed to persist {}", path.display()))?;
    Ok(())
}

/// Read a JSON document written by [`write_json_atomic`], `None` when it does not exist.
pub fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> StowageResult<Option<T>> {
    let file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StowageError::Io(e).context(format!("open {}", path.display()))),
    };
    let value = serde_json::from_reader(std::io::BufReader::new(file))
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    Ok(Some(value))
}

#[derive(Debug, Clone)]
pub struct MetadataStore {
    dir: PathBuf,
}

impl MetadataStore {
    pub fn open<P: AsRef<Path>>(root: P) -> StowageResult<Self> {
        let dir = root.as_ref().join(VOLUMES_DIR);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create metadata directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.dir
            .join(format!("{VOLUME_RECORD_PREFIX}{id}{RECORD_SUFFIX}"))
    }

    pub fn exists(&self, id: &str) -> bool {
        self.record_path(id).is_file()
    }

    pub fn load(&self, id: &str) -> StowageResult<Volume> {
        let path = self.record_path(id);
        let file = match std::fs::File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StowageError::NotFound(format!("Volume {id}")));
            }
            Err(e) => return Err(StowageError::Io(e).context(format!("open {}", path.display()))),
        };
        let volume: Volume = serde_json::from_reader(std::io::BufReader::new(file))
            .with_context(|| format!("Failed to parse volume record {}", path.display()))?;
        Ok(volume)
    }

    pub fn save(&self, volume: &Volume) -> StowageResult<()> {
        write_json_atomic(&self.record_path(&volume.id), volume)
            .with_context(|| format!("Failed to save volume record {}", volume.id))?;
        tracing::trace!(volume = %volume.id, "Saved volume record");
        Ok(())
    }

    pub fn remove(&self, id: &str) -> StowageResult<()> {
        let path = self.record_path(id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StowageError::NotFound(format!("Volume {id}")))
            }
            Err(e) => Err(StowageError::Io(e).context(format!("remove {}", path.display()))),
        }
    }

    /// Identifiers of every stored volume whose identifier starts with `prefix_filter`.
    pub fn list_ids(&self, prefix_filter: &str) -> StowageResult<Vec<String>> {
        let pattern = self.dir.join(format!(
            "{VOLUME_RECORD_PREFIX}{}*{RECORD_SUFFIX}",
            glob::Pattern::escape(prefix_filter)
        ));
        let pattern = pattern.to_string_lossy().to_string();
        let entries = glob::glob(&pattern)
            .map_err(|e| StowageError::InvalidState(format!("Invalid record pattern: {e}")))?;

        let mut ids = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| StowageError::Io(e.into_error()))?;
            let id = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix(VOLUME_RECORD_PREFIX))
                .and_then(|n| n.strip_suffix(RECORD_SUFFIX));
            if let Some(id) = id {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    pub fn load_all(&self) -> StowageResult<Vec<Volume>> {
        self.list_ids("")?
            .iter()
            .map(|id| self.load(id))
            .collect()
    }
}
