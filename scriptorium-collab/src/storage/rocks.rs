//! RocksDB-backed ledger.
//!
//! Column families:
//! - `workspaces`   — workspace entries, keyed by hash
//! - `commits`      — commit entries (LZ4 compressed), keyed by hash
//! - `tips`         — workspace hash → tip commit hash
//! - `participants` — `<workspace:32><peer:32>` → empty
//! - `sessions`     — `<workspace:32><seq:8 big-endian>` → `SessionInfo`
//!
//! Record hashes are recomputed from the stored entry on every read, so a
//! corrupted row surfaces as a hash mismatch rather than silently.

use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};

use scriptorium_core::{
    Commit, CommitHash, Hash, PeerId, Record, RecordKind, SessionId, WorkspaceHash,
};

use crate::ledger::{
    CreateWorkspaceInput, JoinWorkspaceOutput, Ledger, LedgerError, SessionInfo,
    UpdateWorkspaceTipInput,
};

const CF_WORKSPACES: &str = "workspaces";
const CF_COMMITS: &str = "commits";
const CF_TIPS: &str = "tips";
const CF_PARTICIPANTS: &str = "participants";
const CF_SESSIONS: &str = "sessions";

const COLUMN_FAMILIES: &[&str] = &[CF_WORKSPACES, CF_COMMITS, CF_TIPS, CF_PARTICIPANTS, CF_SESSIONS];

/// Ledger store configuration.
#[derive(Debug, Clone)]
pub struct LedgerStoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Enable fsync on every write
    pub sync_writes: bool,
    /// Max open files for RocksDB
    pub max_open_files: i32,
}

impl Default for LedgerStoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("scriptorium_ledger"),
            block_cache_size: 64 * 1024 * 1024,
            sync_writes: true,
            max_open_files: 512,
        }
    }
}

impl LedgerStoreConfig {
    /// Small caches, no fsync.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 64,
        }
    }
}

impl From<rocksdb::Error> for LedgerError {
    fn from(e: rocksdb::Error) -> Self {
        LedgerError::Storage(e.to_string())
    }
}

pub struct RocksLedger {
    db: DBWithThreadMode<SingleThreaded>,
    config: LedgerStoreConfig,
    /// Serializes check-then-write sequences.
    write_lock: Mutex<()>,
    session_seq: AtomicU64,
}

impl RocksLedger {
    /// Open the ledger, creating the database and column families if needed.
    pub fn open(config: LedgerStoreConfig) -> Result<Self, LedgerError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cache = Cache::new_lru_cache(config.block_cache_size);
        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &cache)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(&db_opts, &config.path, cf_descriptors)?;
        let session_seq = Self::recover_session_seq(&db);
        log::info!("Opened ledger at {}", config.path.display());

        Ok(Self {
            db,
            config,
            write_lock: Mutex::new(()),
            session_seq: AtomicU64::new(session_seq),
        })
    }

    fn cf_options(name: &str, cache: &Cache) -> Options {
        let mut opts = Options::default();
        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_block_cache(cache);
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);

        match name {
            // Entries are already LZ4 compressed by us
            CF_COMMITS => opts.set_compression_type(DBCompressionType::None),
            _ => opts.set_compression_type(DBCompressionType::Lz4),
        }
        opts
    }

    /// Next free session sequence number.
    fn recover_session_seq(db: &DBWithThreadMode<SingleThreaded>) -> u64 {
        let Some(cf) = db.cf_handle(CF_SESSIONS) else {
            return 0;
        };
        db.iterator_cf(cf, IteratorMode::Start)
            .filter_map(|item| item.ok())
            .filter_map(|(key, _)| key.get(32..40).and_then(|b| <[u8; 8]>::try_from(b).ok()))
            .map(|b| u64::from_be_bytes(b) + 1)
            .max()
            .unwrap_or(0)
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, LedgerError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| LedgerError::Storage(format!("Column family '{name}' not found")))
    }

    fn write(&self, batch: WriteBatch) -> Result<(), LedgerError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn lock_writes(&self) -> std::sync::MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn has_commit(&self, hash: &CommitHash) -> Result<bool, LedgerError> {
        Ok(self.db.get_pinned_cf(self.cf(CF_COMMITS)?, hash.as_bytes())?.is_some())
    }

    fn load_commit(&self, hash: &CommitHash) -> Result<Option<Record>, LedgerError> {
        match self.db.get_cf(self.cf(CF_COMMITS)?, hash.as_bytes())? {
            Some(compressed) => Ok(Some(commit_record(*hash, &compressed)?)),
            None => Ok(None),
        }
    }

    fn load_tip(&self, workspace_hash: &WorkspaceHash) -> Result<CommitHash, LedgerError> {
        let bytes = self
            .db
            .get_cf(self.cf(CF_TIPS)?, workspace_hash.as_bytes())?
            .ok_or_else(|| LedgerError::NotFound(format!("workspace {workspace_hash}")))?;
        hash_from_slice(&bytes)
    }

    fn scan_prefix(&self, cf: &str, prefix: &[u8]) -> Result<Vec<(Box<[u8]>, Box<[u8]>)>, LedgerError> {
        let mut out = Vec::new();
        for item in self.db.iterator_cf(self.cf(cf)?, IteratorMode::From(prefix, Direction::Forward)) {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            out.push((key, value));
        }
        Ok(out)
    }

    fn participants(&self, workspace_hash: &WorkspaceHash) -> Result<Vec<PeerId>, LedgerError> {
        self.scan_prefix(CF_PARTICIPANTS, workspace_hash.as_bytes())?
            .into_iter()
            .map(|(key, _)| {
                PeerId::try_from(&key[32..]).map_err(|e| LedgerError::Storage(format!("bad participant key: {e}")))
            })
            .collect()
    }

    fn all_sessions(&self) -> Result<Vec<SessionInfo>, LedgerError> {
        let mut out = Vec::new();
        for item in self.db.iterator_cf(self.cf(CF_SESSIONS)?, IteratorMode::Start) {
            let (_, value) = item?;
            out.push(decode_session(&value)?);
        }
        Ok(out)
    }

    fn session_key(&self, session_id: SessionId) -> Result<Option<Box<[u8]>>, LedgerError> {
        for item in self.db.iterator_cf(self.cf(CF_SESSIONS)?, IteratorMode::Start) {
            let (key, value) = item?;
            if decode_session(&value)?.session_id == session_id {
                return Ok(Some(key));
            }
        }
        Ok(None)
    }
}

fn hash_from_slice(bytes: &[u8]) -> Result<Hash, LedgerError> {
    Hash::try_from(bytes).map_err(|e| LedgerError::Storage(format!("bad hash value: {e}")))
}

fn commit_record(hash: CommitHash, compressed: &[u8]) -> Result<Record, LedgerError> {
    let entry = lz4_flex::decompress_size_prepended(compressed)
        .map_err(|e| LedgerError::Storage(format!("decompression failed: {e}")))?;
    let record = Record { hash, kind: RecordKind::Commit, entry };
    record.verify()?;
    Ok(record)
}

fn encode_session(info: &SessionInfo) -> Result<Vec<u8>, LedgerError> {
    bincode::serde::encode_to_vec(info, bincode::config::standard())
        .map_err(|e| LedgerError::Storage(e.to_string()))
}

fn decode_session(bytes: &[u8]) -> Result<SessionInfo, LedgerError> {
    let (info, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| LedgerError::Storage(e.to_string()))?;
    Ok(info)
}

fn pair_key(a: &[u8; 32], b: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(32 + b.len());
    key.extend_from_slice(a);
    key.extend_from_slice(b);
    key
}

#[async_trait]
impl Ledger for RocksLedger {
    async fn create_workspace(&self, input: CreateWorkspaceInput) -> Result<Record, LedgerError> {
        let record = Record::workspace(&input.workspace)?;
        let _guard = self.lock_writes();
        if !self.has_commit(&input.initial_tip_hash)? {
            return Err(LedgerError::InvalidTip(input.initial_tip_hash));
        }
        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_WORKSPACES)?, record.hash.as_bytes(), &record.entry);
        batch.put_cf(self.cf(CF_TIPS)?, record.hash.as_bytes(), input.initial_tip_hash.as_bytes());
        self.write(batch)?;
        Ok(record)
    }

    async fn create_commit(&self, commit: Commit) -> Result<Record, LedgerError> {
        let record = Record::commit(&commit)?;
        let _guard = self.lock_writes();
        for parent in &commit.previous_commit_hashes {
            if !self.has_commit(parent)? {
                return Err(LedgerError::DanglingParent { commit: record.hash, parent: *parent });
            }
        }
        let compressed = lz4_flex::compress_prepend_size(&record.entry);
        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_COMMITS)?, record.hash.as_bytes(), &compressed);
        self.write(batch)?;
        Ok(record)
    }

    async fn update_workspace_tip(&self, input: UpdateWorkspaceTipInput) -> Result<(), LedgerError> {
        let _guard = self.lock_writes();
        if self.db.get_pinned_cf(self.cf(CF_WORKSPACES)?, input.workspace_hash.as_bytes())?.is_none() {
            return Err(LedgerError::NotFound(format!("workspace {}", input.workspace_hash)));
        }
        if !self.has_commit(&input.new_tip_hash)? {
            return Err(LedgerError::InvalidTip(input.new_tip_hash));
        }
        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_TIPS)?, input.workspace_hash.as_bytes(), input.new_tip_hash.as_bytes());
        self.write(batch)
    }

    async fn get_all_workspaces(&self) -> Result<Vec<Record>, LedgerError> {
        let mut out = Vec::new();
        for item in self.db.iterator_cf(self.cf(CF_WORKSPACES)?, IteratorMode::Start) {
            let (key, value) = item?;
            let record = Record { hash: hash_from_slice(&key)?, kind: RecordKind::Workspace, entry: value.into_vec() };
            record.verify()?;
            out.push(record);
        }
        Ok(out)
    }

    async fn get_all_commits(&self) -> Result<Vec<Record>, LedgerError> {
        let mut out = Vec::new();
        for item in self.db.iterator_cf(self.cf(CF_COMMITS)?, IteratorMode::Start) {
            let (key, value) = item?;
            out.push(commit_record(hash_from_slice(&key)?, &value)?);
        }
        Ok(out)
    }

    async fn get_workspace_tip(&self, workspace_hash: WorkspaceHash) -> Result<CommitHash, LedgerError> {
        self.load_tip(&workspace_hash)
    }

    async fn join_workspace(
        &self,
        workspace_hash: WorkspaceHash,
        peer: PeerId,
    ) -> Result<JoinWorkspaceOutput, LedgerError> {
        let _guard = self.lock_writes();
        let tip = self.load_tip(&workspace_hash)?;
        let current_tip = self.load_commit(&tip)?.ok_or(LedgerError::InvalidTip(tip))?;

        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_PARTICIPANTS)?, pair_key(workspace_hash.as_bytes(), peer.as_bytes()), b"");
        self.write(batch)?;

        Ok(JoinWorkspaceOutput { current_tip, participants: self.participants(&workspace_hash)? })
    }

    async fn leave_workspace(&self, workspace_hash: WorkspaceHash, peer: PeerId) -> Result<(), LedgerError> {
        let mut batch = WriteBatch::default();
        batch.delete_cf(self.cf(CF_PARTICIPANTS)?, pair_key(workspace_hash.as_bytes(), peer.as_bytes()));
        self.write(batch)
    }

    async fn get_sessions(&self, workspace_hash: WorkspaceHash) -> Result<Vec<SessionInfo>, LedgerError> {
        self.scan_prefix(CF_SESSIONS, workspace_hash.as_bytes())?
            .iter()
            .map(|(_, value)| decode_session(value))
            .collect()
    }

    async fn new_session(&self, workspace_hash: WorkspaceHash, scribe: PeerId) -> Result<SessionInfo, LedgerError> {
        let _guard = self.lock_writes();
        let initial_tip = self.load_tip(&workspace_hash)?;
        let info = SessionInfo { session_id: SessionId::new(), workspace_hash, scribe, initial_tip };
        let seq = self.session_seq.fetch_add(1, Ordering::SeqCst);

        let mut batch = WriteBatch::default();
        batch.put_cf(
            self.cf(CF_SESSIONS)?,
            pair_key(workspace_hash.as_bytes(), &seq.to_be_bytes()),
            encode_session(&info)?,
        );
        self.write(batch)?;
        Ok(info)
    }

    async fn get_session(&self, session_id: SessionId) -> Result<SessionInfo, LedgerError> {
        self.all_sessions()?
            .into_iter()
            .find(|s| s.session_id == session_id)
            .ok_or_else(|| LedgerError::NotFound(format!("session {session_id}")))
    }

    async fn close_session(&self, session_id: SessionId) -> Result<(), LedgerError> {
        let _guard = self.lock_writes();
        if let Some(key) = self.session_key(session_id)? {
            let mut batch = WriteBatch::default();
            batch.delete_cf(self.cf(CF_SESSIONS)?, key);
            self.write(batch)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scriptorium_core::Workspace;

    fn open(dir: &tempfile::TempDir) -> RocksLedger {
        RocksLedger::open(LedgerStoreConfig::for_testing(dir.path())).unwrap()
    }

    async fn seed(ledger: &RocksLedger) -> (CommitHash, WorkspaceHash) {
        let root = ledger
            .create_commit(Commit::root(vec![1, 2, 3], PeerId([1; 32]), None))
            .await
            .unwrap()
            .hash;
        let ws = ledger
            .create_workspace(CreateWorkspaceInput { workspace: Workspace::new("w"), initial_tip_hash: root })
            .await
            .unwrap()
            .hash;
        (root, ws)
    }

    #[test]
    fn test_open_creates_column_families() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = open(&dir);
        for name in COLUMN_FAMILIES {
            assert!(ledger.cf(name).is_ok());
        }
    }

    #[tokio::test]
    async fn test_commit_roundtrip_through_lz4() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = open(&dir);
        let (root, ws) = seed(&ledger).await;

        let commits = ledger.get_all_commits().await.unwrap();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].hash, root);
        assert_eq!(commits[0].decode_commit().unwrap().state, vec![1, 2, 3]);
        assert_eq!(ledger.get_workspace_tip(ws).await.unwrap(), root);
    }

    #[tokio::test]
    async fn test_rejects_dangling_parent_and_invalid_tip() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = open(&dir);
        let ghost = Hash::of(b"ghost");
        let orphan = Commit {
            state: vec![],
            previous_commit_hashes: vec![ghost],
            authors: vec![PeerId([1; 32])],
            witnesses: vec![],
            meta: None,
        };
        assert!(matches!(
            ledger.create_commit(orphan).await,
            Err(LedgerError::DanglingParent { parent, .. }) if parent == ghost
        ));
        assert_eq!(
            ledger
                .create_workspace(CreateWorkspaceInput { workspace: Workspace::new("w"), initial_tip_hash: ghost })
                .await,
            Err(LedgerError::InvalidTip(ghost))
        );
        assert!(ledger.get_all_workspaces().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sessions_ordered_and_closed() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = open(&dir);
        let (_, ws) = seed(&ledger).await;
        let first = ledger.new_session(ws, PeerId([1; 32])).await.unwrap();
        let second = ledger.new_session(ws, PeerId([2; 32])).await.unwrap();
        assert_eq!(ledger.get_sessions(ws).await.unwrap(), vec![first, second]);
        assert_eq!(ledger.get_session(second.session_id).await.unwrap(), second);

        ledger.close_session(first.session_id).await.unwrap();
        assert_eq!(ledger.get_sessions(ws).await.unwrap(), vec![second]);
    }

    #[tokio::test]
    async fn test_participants() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = open(&dir);
        let (root, ws) = seed(&ledger).await;
        ledger.join_workspace(ws, PeerId([2; 32])).await.unwrap();
        let out = ledger.join_workspace(ws, PeerId([1; 32])).await.unwrap();
        assert_eq!(out.current_tip.hash, root);
        assert_eq!(out.participants, vec![PeerId([1; 32]), PeerId([2; 32])]);

        ledger.leave_workspace(ws, PeerId([1; 32])).await.unwrap();
        assert_eq!(ledger.participants(&ws).unwrap(), vec![PeerId([2; 32])]);
    }

    #[tokio::test]
    async fn test_session_sequence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let (ws, first) = {
            let ledger = open(&dir);
            let (_, ws) = seed(&ledger).await;
            (ws, ledger.new_session(ws, PeerId([1; 32])).await.unwrap())
        };
        let ledger = open(&dir);
        let second = ledger.new_session(ws, PeerId([2; 32])).await.unwrap();
        assert_eq!(ledger.get_sessions(ws).await.unwrap(), vec![first, second]);
    }
}
