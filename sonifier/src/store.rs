//! Durable block store.
//!
//! One mono 32-bit float WAV file per block in a single directory. The file
//! name alone carries the identity (sequence + creation time), so a directory
//! listing is the index. A block is written to a hidden temporary file and
//! renamed into place, so a listed entry is always complete.
//!
//! The store is a plain handle on a directory: clones share the same
//! entries, which lets the ingest and loader threads each own one.

use anyhow::{Context, Result};
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use std::fs::{self, File};
use std::io::{self, BufReader, Cursor, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::block::{Block, EntryId};

const TEMP_PREFIX: &str = ".";
const TEMP_SUFFIX: &str = ".tmp";

/// A published block file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEntry {
    // ---
    pub id: EntryId,
    pub path: PathBuf,
}

/// Directory-backed, ordered, capacity-bounded block storage.
#[derive(Debug, Clone)]
pub struct BlockStore {
    // ---
    dir: PathBuf,
    sample_rate: u32,
}

impl BlockStore {
    // ---
    /// Opens (creating if needed) the store at `dir` for blocks at `sample_rate`.
    ///
    /// Leftover temporary files from an interrupted write are always removed.
    /// With `clear`, published blocks from a previous run are removed too;
    /// otherwise they stay and will be played.
    ///
    /// # Errors
    ///
    /// Returns error if the directory cannot be created or listed.
    pub fn open(dir: impl Into<PathBuf>, sample_rate: u32, clear: bool) -> Result<Self> {
        // ---
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create store directory {}", dir.display()))?;

        let store = Self { dir, sample_rate };
        let (published, temporary) = store.sweep(clear)?;

        if temporary > 0 {
            warn!("Removed {} incomplete block writes", temporary);
        }
        if clear && published > 0 {
            info!(
                "Deleted {} blocks from a previous run in {}",
                published,
                store.dir.display()
            );
        }

        Ok(store)
    }

    /// Store directory.
    pub fn dir(&self) -> &Path {
        // ---
        &self.dir
    }

    /// Sample rate every stored block must have.
    pub fn sample_rate(&self) -> u32 {
        // ---
        self.sample_rate
    }

    /// Sequence number following the newest persisted block (0 when empty).
    pub fn next_sequence(&self) -> Result<u64> {
        // ---
        Ok(self
            .list()?
            .iter()
            .map(|e| e.id.sequence + 1)
            .max()
            .unwrap_or(0))
    }

    /// Persists a block. The entry becomes visible only once fully written.
    ///
    /// # Errors
    ///
    /// Returns error if the block's rate does not match the store or the
    /// file cannot be written. No partial entry is left visible.
    pub fn put(&self, block: &Block) -> Result<StoreEntry> {
        // ---
        if block.sample_rate != self.sample_rate {
            anyhow::bail!(
                "block {} is at {} Hz, store holds {} Hz",
                block.sequence,
                block.sample_rate,
                self.sample_rate
            );
        }

        let id = block.id();
        let file_name = id.file_name();
        let path = self.dir.join(&file_name);
        let temp_path = self.dir.join(format!("{TEMP_PREFIX}{file_name}{TEMP_SUFFIX}"));

        let bytes = encode_wav(block, self.sample_rate)?;
        if let Err(e) = write_synced(&temp_path, &bytes) {
            let _ = fs::remove_file(&temp_path);
            return Err(e)
                .with_context(|| format!("failed to write {}", temp_path.display()));
        }

        if let Err(e) = fs::rename(&temp_path, &path) {
            let _ = fs::remove_file(&temp_path);
            return Err(e).with_context(|| format!("failed to publish {}", path.display()));
        }

        debug!("Stored {} ({} samples)", file_name, block.len());
        Ok(StoreEntry { id, path })
    }

    /// All published entries, oldest first.
    ///
    /// # Errors
    ///
    /// Returns error if the directory cannot be read.
    pub fn list(&self) -> Result<Vec<StoreEntry>> {
        // ---
        let mut entries: Vec<StoreEntry> = fs::read_dir(&self.dir)
            .with_context(|| format!("failed to list {}", self.dir.display()))?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let id = EntryId::parse(entry.file_name().to_str()?)?;
                Some(StoreEntry {
                    id,
                    path: entry.path(),
                })
            })
            .collect();

        entries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(entries)
    }

    /// Number of published entries.
    pub fn len(&self) -> Result<usize> {
        // ---
        Ok(self.list()?.len())
    }

    /// Returns true if nothing is published.
    pub fn is_empty(&self) -> Result<bool> {
        // ---
        Ok(self.list()?.is_empty())
    }

    /// Reads a block back.
    ///
    /// Returns `Ok(None)` if the entry vanished (evicted) since it was listed.
    ///
    /// # Errors
    ///
    /// Returns error if the file exists but is not a block this store wrote.
    pub fn read(&self, entry: &StoreEntry) -> Result<Option<Block>> {
        // ---
        let file = match File::open(&entry.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to open {}", entry.path.display()))
            }
        };

        let reader = WavReader::new(BufReader::new(file))
            .with_context(|| format!("invalid WAV file {}", entry.path.display()))?;
        let spec = reader.spec();

        if spec.channels != 1
            || spec.sample_format != SampleFormat::Float
            || spec.bits_per_sample != 32
        {
            anyhow::bail!(
                "{} is not mono 32-bit float ({} ch, {:?} {}-bit)",
                entry.path.display(),
                spec.channels,
                spec.sample_format,
                spec.bits_per_sample
            );
        }
        if spec.sample_rate != self.sample_rate {
            anyhow::bail!(
                "{} has rate {} Hz, expected {} Hz",
                entry.path.display(),
                spec.sample_rate,
                self.sample_rate
            );
        }

        let samples = reader
            .into_samples::<f32>()
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("failed to read samples from {}", entry.path.display()))?;

        Ok(Some(Block {
            sequence: entry.id.sequence,
            sample_rate: spec.sample_rate,
            samples,
            created: entry.id.created,
        }))
    }

    /// Removes an entry. Returns `false` if it was already gone.
    pub fn remove(&self, id: &EntryId) -> Result<bool> {
        // ---
        let path = self.dir.join(id.file_name());
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("failed to remove {}", path.display())),
        }
    }

    /// Removes the oldest entries until at most `limit` remain.
    ///
    /// Entries are evicted whether or not they were played.
    ///
    /// # Returns
    ///
    /// Identities of the entries this call removed.
    pub fn evict_if_over(&self, limit: usize) -> Result<Vec<EntryId>> {
        // ---
        let entries = self.list()?;
        let excess = entries.len().saturating_sub(limit);
        let mut evicted = Vec::with_capacity(excess);

        for entry in entries.iter().take(excess) {
            if self.remove(&entry.id)? {
                debug!("Evicted {}", entry.id.file_name());
                evicted.push(entry.id);
            }
        }

        Ok(evicted)
    }

    /// Deletes temporary files and, if `published`, all entries.
    fn sweep(&self, published: bool) -> Result<(usize, usize)> {
        // ---
        let mut removed_published = 0;
        let mut removed_temporary = 0;

        for entry in fs::read_dir(&self.dir)
            .with_context(|| format!("failed to list {}", self.dir.display()))?
            .filter_map(|entry| entry.ok())
        {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };

            let is_temporary = name
                .strip_prefix(TEMP_PREFIX)
                .and_then(|rest| rest.strip_suffix(TEMP_SUFFIX))
                .and_then(EntryId::parse)
                .is_some();
            let is_published = EntryId::parse(name).is_some();

            if is_temporary || (published && is_published) {
                match fs::remove_file(entry.path()) {
                    Ok(()) if is_temporary => removed_temporary += 1,
                    Ok(()) => removed_published += 1,
                    Err(e) => warn!("Could not delete {}: {}", name, e),
                }
            }
        }

        Ok((removed_published, removed_temporary))
    }
}

fn encode_wav(block: &Block, sample_rate: u32) -> Result<Vec<u8>> {
    // ---
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 32,
        sample_format: SampleFormat::Float,
    };

    let mut bytes = Vec::with_capacity(64 + block.len() * 4);
    let mut writer =
        WavWriter::new(Cursor::new(&mut bytes), spec).context("failed to start WAV encoding")?;
    for &sample in &block.samples {
        writer.write_sample(sample).context("failed to encode sample")?;
    }
    writer.finalize().context("failed to finalize WAV encoding")?;

    Ok(bytes)
}

fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    // ---
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use chrono::{DateTime, Duration, Utc};

    fn block_at(sequence: u64, created: DateTime<Utc>) -> Block {
        Block {
            sequence,
            sample_rate: 1000,
            samples: vec![0.25, -0.5, 1.0, sequence as f32 / 100.0],
            created,
        }
    }

    fn block(sequence: u64) -> Block {
        let base = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();
        block_at(sequence, base + Duration::milliseconds(sequence as i64))
    }

    #[test]
    fn test_put_then_read() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let store = BlockStore::open(dir.path(), 1000, true).unwrap();

        let original = block(3);
        let entry = store.put(&original).unwrap();
        let restored = store.read(&entry).unwrap().expect("entry present");

        assert_eq!(restored, original);
    }

    #[test]
    fn test_list_is_creation_ordered() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let store = BlockStore::open(dir.path(), 1000, true).unwrap();

        for seq in [2, 0, 1] {
            store.put(&block(seq)).unwrap();
        }
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let sequences: Vec<u64> = store.list().unwrap().iter().map(|e| e.id.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2]);
    }

    #[test]
    fn test_temporary_files_never_listed() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let store = BlockStore::open(dir.path(), 1000, true).unwrap();
        let torn = format!(".{}.tmp", block(0).id().file_name());
        fs::write(dir.path().join(&torn), b"RIFF").unwrap();

        assert!(store.is_empty().unwrap());

        // Reopening cleans it up even without clearing
        BlockStore::open(dir.path(), 1000, false).unwrap();
        assert!(!dir.path().join(&torn).exists());
    }

    #[test]
    fn test_evict_keeps_newest() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let store = BlockStore::open(dir.path(), 1000, true).unwrap();
        for seq in 0..5 {
            store.put(&block(seq)).unwrap();
        }

        let evicted = store.evict_if_over(3).unwrap();
        assert_eq!(
            evicted.iter().map(|id| id.sequence).collect::<Vec<_>>(),
            vec![0, 1]
        );

        let remaining: Vec<u64> = store.list().unwrap().iter().map(|e| e.id.sequence).collect();
        assert_eq!(remaining, vec![2, 3, 4]);
        assert!(store.evict_if_over(3).unwrap().is_empty());
    }

    #[test]
    fn test_retention_bound_holds_after_every_put() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let store = BlockStore::open(dir.path(), 1000, true).unwrap();
        for seq in 0..25 {
            store.put(&block(seq)).unwrap();
            store.evict_if_over(4).unwrap();
            assert!(store.len().unwrap() <= 4);
        }
    }

    #[test]
    fn test_vanished_entry_reads_as_none() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let store = BlockStore::open(dir.path(), 1000, true).unwrap();
        let entry = store.put(&block(0)).unwrap();

        assert!(store.remove(&entry.id).unwrap());
        assert!(store.read(&entry).unwrap().is_none());
        assert!(!store.remove(&entry.id).unwrap());
    }

    #[test]
    fn test_rejects_wrong_rate() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let store = BlockStore::open(dir.path(), 44_100, true).unwrap();
        assert!(store.put(&block(0)).is_err());
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn test_reopen_resumes_sequence() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        {
            let store = BlockStore::open(dir.path(), 1000, true).unwrap();
            assert_eq!(store.next_sequence().unwrap(), 0);
            store.put(&block(0)).unwrap();
            store.put(&block(1)).unwrap();
        }

        let kept = BlockStore::open(dir.path(), 1000, false).unwrap();
        assert_eq!(kept.next_sequence().unwrap(), 2);

        let cleared = BlockStore::open(dir.path(), 1000, true).unwrap();
        assert_eq!(cleared.next_sequence().unwrap(), 0);
    }
}
