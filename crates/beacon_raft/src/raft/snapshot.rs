//! Snapshot slot storage.
//!
//! A snapshot is a single file of length-prefixed, crc32-framed records: the
//! state machine's raw KV records followed by one meta record capturing
//! {term, votedFor, lastApplied, membership}. Producing a snapshot writes a
//! temp file and atomically renames it over the current slot; installs stage
//! into a separate file until the final chunk arrives.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use crc32fast::Hasher;

use super::types::{RawRecord, SnapshotItem, SnapshotMeta};

const CURRENT_FILE: &str = "current.snap";
const STAGING_FILE: &str = "staging.snap";
const PRODUCE_FILE: &str = "produce.tmp";

pub struct SnapshotStore {
    dir: PathBuf,
    staging: Mutex<Option<BufWriter<File>>>,
}

impl SnapshotStore {
    pub fn open(dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).context("create snapshot dir")?;
        Ok(Self {
            dir,
            staging: Mutex::new(None),
        })
    }

    fn current_path(&self) -> PathBuf {
        self.dir.join(CURRENT_FILE)
    }

    /// Write a complete snapshot and atomically replace the previous one.
    pub fn write(&self, records: &[RawRecord], meta: &SnapshotMeta) -> anyhow::Result<()> {
        let tmp_path = self.dir.join(PRODUCE_FILE);
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&tmp_path)
            .context("open snapshot temp")?;
        let mut out = BufWriter::new(file);
        for record in records {
            write_record(&mut out, &SnapshotItem::Record(record.clone()))?;
        }
        write_record(&mut out, &SnapshotItem::Meta(meta.clone()))?;
        out.flush()?;
        out.get_ref().sync_all()?;
        fs::rename(&tmp_path, self.current_path()).context("replace snapshot")?;
        Ok(())
    }

    pub fn read_meta(&self) -> anyhow::Result<Option<SnapshotMeta>> {
        Ok(self.read_all()?.map(|(meta, _)| meta))
    }

    /// Load the current snapshot, if any. The meta record must close the file.
    pub fn read_all(&self) -> anyhow::Result<Option<(SnapshotMeta, Vec<RawRecord>)>> {
        let file = match File::open(self.current_path()) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let mut reader = BufReader::new(file);
        let mut records = Vec::new();
        let mut meta = None;
        while let Some(item) = read_record(&mut reader)? {
            match item {
                SnapshotItem::Record(record) => {
                    anyhow::ensure!(meta.is_none(), "snapshot record after meta");
                    records.push(record);
                }
                SnapshotItem::Meta(m) => {
                    anyhow::ensure!(meta.is_none(), "duplicate snapshot meta");
                    meta = Some(m);
                }
            }
        }
        let meta = meta.context("snapshot missing meta record")?;
        Ok(Some((meta, records)))
    }

    /// Start staging an incoming snapshot, discarding any partial one.
    pub fn begin_install(&self) -> anyhow::Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(self.dir.join(STAGING_FILE))
            .context("open snapshot staging")?;
        *self.staging.lock().unwrap() = Some(BufWriter::new(file));
        Ok(())
    }

    pub fn stage_item(&self, item: &SnapshotItem) -> anyhow::Result<()> {
        let mut guard = self.staging.lock().unwrap();
        let out = guard.as_mut().context("no snapshot install in progress")?;
        write_record(out, item)
    }

    /// Seal the staged snapshot as the current slot.
    pub fn finish_install(&self) -> anyhow::Result<()> {
        let mut guard = self.staging.lock().unwrap();
        let mut out = guard.take().context("no snapshot install in progress")?;
        out.flush()?;
        out.get_ref().sync_all()?;
        drop(out);
        fs::rename(self.dir.join(STAGING_FILE), self.current_path())
            .context("seal staged snapshot")?;
        Ok(())
    }

    pub fn abort_install(&self) {
        *self.staging.lock().unwrap() = None;
        let _ = fs::remove_file(self.dir.join(STAGING_FILE));
    }
}

fn write_record(out: &mut BufWriter<File>, item: &SnapshotItem) -> anyhow::Result<()> {
    let payload = bincode::serde::encode_to_vec(item, bincode::config::standard())
        .context("encode snapshot item")?;
    let mut hasher = Hasher::new();
    hasher.update(&payload);
    let checksum = hasher.finalize();
    out.write_all(&(payload.len() as u32).to_be_bytes())?;
    out.write_all(&checksum.to_be_bytes())?;
    out.write_all(&payload)?;
    Ok(())
}

fn read_record(reader: &mut BufReader<File>) -> anyhow::Result<Option<SnapshotItem>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut crc_buf = [0u8; 4];
    reader.read_exact(&mut crc_buf)?;
    let expected = u32::from_be_bytes(crc_buf);
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    let mut hasher = Hasher::new();
    hasher.update(&payload);
    anyhow::ensure!(hasher.finalize() == expected, "snapshot checksum mismatch");
    let (item, _) = bincode::serde::decode_from_slice(&payload, bincode::config::standard())
        .context("decode snapshot item")?;
    Ok(Some(item))
}
