//! Per-address verification cache.
//!
//! A [`TrustStore`] maps a network address to the time it last solved a
//! challenge. A record is honored only while
//! `now - verified_at < verification_duration`; an expired record is
//! indistinguishable from a missing one.
//!
//! When opened with a path, the store is loaded from a flat JSON object
//! (`{"203.0.113.7": 1760000000000}`) with expired entries dropped, and
//! every change is written back by a background writer thread. Writes are
//! coalesced: if several snapshots queue up while a write is in flight,
//! only the newest is written. Write failures are logged and otherwise
//! ignored; the in-memory map stays authoritative.
//!
//! # Thread Safety
//!
//! Lookups take a read lock. An update holds the write lock while it mutates
//! the map, serializes a snapshot and queues it, so snapshots reach the
//! writer in the order the changes were made and the last one written is
//! always the newest. The writer thread does its file I/O without the lock.
//! An explicit [`TrustStore::save`], and the fallback used when the writer
//! thread could not be started, write while holding the lock.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{self, Write};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Mutex, PoisonError, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use thiserror::Error;

use crate::clock::SharedClock;

/// Errors from loading or saving the trust file.
#[derive(Debug, Error)]
pub enum TrustStoreError {
    /// Filesystem error.
    #[error("trust store I/O error: {0}")]
    Io(#[from] io::Error),

    /// The file is not a JSON object of address to timestamp.
    #[error("malformed trust store: {0}")]
    Json(#[from] serde_json::Error),

    /// The temporary file could not be moved into place.
    #[error("cannot persist trust store to {path}: {source}")]
    Persist {
        /// Destination path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: tempfile::PersistError,
    },
}

enum WriterCommand {
    Write(Vec<u8>),
    Flush(Sender<()>),
}

/// Background thread that owns all trust file writes.
struct TrustWriter {
    tx: Mutex<Option<Sender<WriterCommand>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TrustWriter {
    fn spawn(path: PathBuf) -> io::Result<Self> {
        let (tx, rx) = mpsc::channel();
        let handle = std::thread::Builder::new()
            .name("guarddog-trust-writer".to_string())
            .spawn(move || run_writer(&path, &rx))?;
        Ok(Self {
            tx: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
        })
    }

    fn send(&self, command: WriterCommand) -> bool {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|tx| tx.send(command).is_ok())
    }

    fn shutdown(&self) {
        // Dropping the sender ends the loop after queued writes drain.
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = self.handle.lock().unwrap_or_else(PoisonError::into_inner).take() {
            if handle.join().is_err() {
                tracing::warn!("trust store writer thread panicked");
            }
        }
    }
}

fn run_writer(path: &Path, rx: &Receiver<WriterCommand>) {
    while let Ok(command) = rx.recv() {
        let mut latest = None;
        let mut waiters = Vec::new();
        let mut next = Some(command);

        // Coalesce whatever is already queued.
        while let Some(command) = next {
            match command {
                WriterCommand::Write(bytes) => latest = Some(bytes),
                WriterCommand::Flush(ack) => waiters.push(ack),
            }
            next = rx.try_recv().ok();
        }

        if let Some(bytes) = latest {
            if let Err(err) = atomic_write(path, &bytes) {
                tracing::warn!(path = %path.display(), error = %err, "failed to save trust store");
            }
        }
        for ack in waiters {
            let _ = ack.send(());
        }
    }
}

/// Writes `bytes` to `path` through a temp file in the same directory.
fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), TrustStoreError> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir)?;

    let mut temp = tempfile::NamedTempFile::new_in(&dir)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        temp.as_file()
            .set_permissions(fs::Permissions::from_mode(0o600))?;
    }

    temp.as_file_mut().write_all(bytes)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|source| TrustStoreError::Persist {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}

/// Address-keyed cache of solved challenges.
pub struct TrustStore {
    records: RwLock<HashMap<IpAddr, u64>>,
    duration_ms: AtomicU64,
    clock: SharedClock,
    path: Option<PathBuf>,
    writer: Option<TrustWriter>,
}

impl std::fmt::Debug for TrustStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustStore")
            .field("records", &self.len())
            .field("duration_ms", &self.duration_ms.load(Ordering::Relaxed))
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

#[allow(clippy::cast_possible_truncation)]
const fn duration_ms(duration: Duration) -> u64 {
    duration.as_millis() as u64
}

impl TrustStore {
    /// Creates a store that is never written to disk.
    #[must_use]
    pub fn in_memory(verification_duration: Duration, clock: SharedClock) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            duration_ms: AtomicU64::new(duration_ms(verification_duration)),
            clock,
            path: None,
            writer: None,
        }
    }

    /// Loads the store from `path` (a missing file is an empty store) and
    /// starts the background writer.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn open(
        path: impl Into<PathBuf>,
        verification_duration: Duration,
        clock: SharedClock,
    ) -> Result<Self, TrustStoreError> {
        let path = path.into();
        let duration = duration_ms(verification_duration);
        let records = load_records(&path, clock.now_ms(), duration)?;
        tracing::info!(path = %path.display(), records = records.len(), "loaded trust store");

        let writer = match TrustWriter::spawn(path.clone()) {
            Ok(writer) => Some(writer),
            Err(err) => {
                tracing::warn!(error = %err, "cannot start trust store writer, saving synchronously");
                None
            },
        };

        Ok(Self {
            records: RwLock::new(records),
            duration_ms: AtomicU64::new(duration),
            clock,
            path: Some(path),
            writer,
        })
    }

    /// How long a verification is honored.
    #[must_use]
    pub fn verification_duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms.load(Ordering::Relaxed))
    }

    /// Changes how long verifications are honored. Existing records are
    /// re-evaluated against the new duration on their next lookup.
    pub fn set_verification_duration(&self, duration: Duration) {
        self.duration_ms.store(duration_ms(duration), Ordering::Relaxed);
    }

    fn is_valid(&self, verified_at: u64, now: u64) -> bool {
        now.saturating_sub(verified_at) < self.duration_ms.load(Ordering::Relaxed)
    }

    /// Returns `true` if `address` holds an unexpired record.
    #[must_use]
    pub fn is_verified(&self, address: IpAddr) -> bool {
        self.verified_at(address).is_some()
    }

    /// Verification time of an unexpired record.
    #[must_use]
    pub fn verified_at(&self, address: IpAddr) -> Option<u64> {
        let now = self.clock.now_ms();
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&address)
            .copied()
            .filter(|&at| self.is_valid(at, now))
    }

    /// Records that `address` solved a challenge now.
    pub fn mark_verified(&self, address: IpAddr) {
        let now = self.clock.now_ms();
        self.mutate(|records| {
            records.insert(address, now);
        });
        tracing::info!(address = %address, "address verified");
    }

    /// Drops the record for `address`.
    pub fn revoke(&self, address: IpAddr) -> bool {
        let mut removed = false;
        self.mutate(|records| removed = records.remove(&address).is_some());
        removed
    }

    /// Drops every record.
    pub fn clear(&self) {
        self.mutate(HashMap::clear);
        tracing::info!("cleared all verifications");
    }

    /// Drops expired records, returning how many were removed.
    pub fn prune_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let mut pruned = 0;
        self.mutate(|records| {
            let before = records.len();
            records.retain(|_, at| self.is_valid(*at, now));
            pruned = before - records.len();
        });
        pruned
    }

    /// Unexpired records, ordered by address.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<IpAddr, u64> {
        let now = self.clock.now_ms();
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|&(_, &at)| self.is_valid(at, now))
            .map(|(&ip, &at)| (ip, at))
            .collect()
    }

    /// Number of stored records, expired ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns `true` if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Path the store persists to, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Writes unexpired records to disk now, bypassing the writer.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save(&self) -> Result<(), TrustStoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        // Held across the write so no change can land between encode and disk.
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        let bytes = self.encode(&records)?;
        atomic_write(path, &bytes)
    }

    /// Blocks until every queued write has reached disk.
    pub fn flush(&self) {
        let Some(writer) = &self.writer else {
            return;
        };
        let (ack_tx, ack_rx) = mpsc::channel();
        if writer.send(WriterCommand::Flush(ack_tx)) {
            let _ = ack_rx.recv();
        }
    }

    fn mutate(&self, f: impl FnOnce(&mut HashMap<IpAddr, u64>)) {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut records);
        self.save_deferred(&records);
    }

    /// Queues a snapshot of `records`. Called with the write lock held.
    fn save_deferred(&self, records: &HashMap<IpAddr, u64>) {
        let Some(path) = &self.path else {
            return;
        };
        let bytes = match self.encode(records) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(error = %err, "failed to encode trust store");
                return;
            },
        };
        match &self.writer {
            Some(writer) => {
                if !writer.send(WriterCommand::Write(bytes)) {
                    tracing::warn!("trust store writer has stopped, change not persisted");
                }
            },
            None => {
                if let Err(err) = atomic_write(path, &bytes) {
                    tracing::warn!(error = %err, "failed to save trust store");
                }
            },
        }
    }

    fn encode(&self, records: &HashMap<IpAddr, u64>) -> Result<Vec<u8>, TrustStoreError> {
        let now = self.clock.now_ms();
        let on_disk: BTreeMap<String, u64> = records
            .iter()
            .filter(|&(_, &at)| self.is_valid(at, now))
            .map(|(ip, &at)| (ip.to_string(), at))
            .collect();
        Ok(serde_json::to_vec_pretty(&on_disk)?)
    }
}

impl Drop for TrustStore {
    fn drop(&mut self) {
        if let Some(writer) = &self.writer {
            writer.shutdown();
        }
    }
}

/// Reads the trust file, skipping unparseable addresses and expired records.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or is not a JSON
/// object of address to timestamp.
pub fn load_records(path: &Path, now_ms: u64, duration_ms: u64) -> Result<HashMap<IpAddr, u64>, TrustStoreError> {
    let content = match fs::read(path) {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(err) => return Err(err.into()),
    };
    if content.iter().all(u8::is_ascii_whitespace) {
        return Ok(HashMap::new());
    }

    let raw: BTreeMap<String, u64> = serde_json::from_slice(&content)?;
    let mut records = HashMap::with_capacity(raw.len());
    for (key, at) in raw {
        let Ok(ip) = key.parse::<IpAddr>() else {
            tracing::warn!(entry = %key, "skipping unparseable trust store address");
            continue;
        };
        if now_ms.saturating_sub(at) < duration_ms {
            records.insert(ip, at);
        }
    }
    Ok(records)
}
