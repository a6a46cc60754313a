//! Shared fixtures for the integration tests: an in-memory remote with call
//! counters and a vault harness wired like the daemon.

#![allow(dead_code)]

use async_trait::async_trait;
use cryptsync_lib::crypto::kdf::KdfParams;
use cryptsync_lib::crypto::seal_blob;
use cryptsync_lib::db::MemoryBackend;
use cryptsync_lib::storage::{LocalStorage, LocalTree, RemoteObject, RemoteStore};
use cryptsync_lib::{SyncContext, SyncEngine, SyncError, SyncResult, SyncSettings};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Remote store backed by a map, counting every call.
pub struct MemoryRemote {
    objects: Mutex<BTreeMap<String, (Vec<u8>, i64)>>,
    clock: AtomicI64,
    pub uploads: AtomicUsize,
    pub downloads: AtomicUsize,
    pub deletes: AtomicUsize,
    pub lists: AtomicUsize,
    failing: Mutex<HashSet<String>>,
    listing_down: AtomicBool,
    /// Held by a test to park `list_files` mid-pass.
    pub gate: tokio::sync::Mutex<()>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            clock: AtomicI64::new(1_700_000_000_000),
            uploads: AtomicUsize::new(0),
            downloads: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
            lists: AtomicUsize::new(0),
            failing: Mutex::new(HashSet::new()),
            listing_down: AtomicBool::new(false),
            gate: tokio::sync::Mutex::new(()),
        }
    }

    fn tick(&self) -> i64 {
        self.clock.fetch_add(1_000, Ordering::SeqCst) + 1_000
    }

    /// Write an object as another device would, bypassing the counters.
    pub fn put_raw(&self, name: &str, blob: Vec<u8>) {
        let now = self.tick();
        self.objects
            .lock()
            .unwrap()
            .insert(name.to_string(), (blob, now));
    }

    pub fn remove_raw(&self, name: &str) {
        self.objects.lock().unwrap().remove(name);
    }

    pub fn blob(&self, name: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(name).map(|(b, _)| b.clone())
    }

    pub fn names(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    pub fn fail_uploads_of(&self, name: &str) {
        self.failing.lock().unwrap().insert(name.to_string());
    }

    /// Make every listing fail with a transient network error.
    pub fn fail_listing(&self, down: bool) {
        self.listing_down.store(down, Ordering::SeqCst);
    }

    pub fn heal(&self) {
        self.failing.lock().unwrap().clear();
        self.listing_down.store(false, Ordering::SeqCst);
    }

    /// Upload + delete calls.
    pub fn writes(&self) -> usize {
        self.uploads.load(Ordering::SeqCst) + self.deletes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn test_connection(&self) -> bool {
        true
    }

    async fn list_files(&self) -> SyncResult<Vec<RemoteObject>> {
        let _gate = self.gate.lock().await;
        self.lists.fetch_add(1, Ordering::SeqCst);
        if self.listing_down.load(Ordering::SeqCst) {
            return Err(SyncError::TransientNetwork("down".into()));
        }
        Ok(self
            .objects
            .lock()
            .unwrap()
            .iter()
            .map(|(name, (blob, lm))| RemoteObject {
                name: name.clone(),
                last_modified: *lm,
                size: blob.len() as u64,
            })
            .collect())
    }

    async fn upload_file(
        &self,
        _local_path: &str,
        ciphertext: Vec<u8>,
        remote_name: &str,
    ) -> SyncResult<()> {
        if self.failing.lock().unwrap().contains(remote_name) {
            return Err(SyncError::Http {
                status: 403,
                message: "denied".into(),
            });
        }
        self.uploads.fetch_add(1, Ordering::SeqCst);
        self.put_raw(remote_name, ciphertext);
        Ok(())
    }

    async fn download_file(&self, remote_name: &str) -> SyncResult<Vec<u8>> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        self.blob(remote_name)
            .ok_or_else(|| SyncError::NotFound(remote_name.to_string()))
    }

    async fn delete_file(&self, remote_name: &str) -> SyncResult<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.remove_raw(remote_name);
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// Cheap Argon2 parameters so tests don't spend seconds per derivation.
pub fn light_kdf() -> KdfParams {
    KdfParams {
        time_cost: 1,
        mem_cost_kib: 1024,
        parallelism: 1,
    }
}

pub fn settings(password: &str) -> SyncSettings {
    SyncSettings {
        endpoint: "memory://".into(),
        encryption_password: password.into(),
        ..Default::default()
    }
}

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub local: Arc<LocalStorage>,
    pub remote: Arc<MemoryRemote>,
    pub backend: Arc<MemoryBackend>,
    pub ctx: SyncContext,
    pub engine: Arc<SyncEngine>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_settings(settings("correct horse battery staple")).await
    }

    pub async fn with_settings(settings: SyncSettings) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let local = Arc::new(LocalStorage::new(dir.path()).unwrap());
        let remote = Arc::new(MemoryRemote::new());
        let backend = Arc::new(MemoryBackend::new());

        let ctx = SyncContext::with_kdf_params(
            settings,
            backend.clone(),
            remote.clone(),
            local.clone(),
            light_kdf(),
        )
        .await
        .unwrap();
        let engine = Arc::new(SyncEngine::new(ctx.clone()));

        Self {
            dir,
            local,
            remote,
            backend,
            ctx,
            engine,
        }
    }

    /// Write a file and record it the way the watcher would.
    pub async fn create(&self, path: &str, content: &[u8]) {
        self.local.write_binary(path, content).await.unwrap();
        self.ctx.ledger.on_create(path);
    }

    pub async fn modify(&self, path: &str, content: &[u8]) {
        self.local.write_binary(path, content).await.unwrap();
        self.ctx.ledger.on_modify(path);
    }

    pub async fn read(&self, path: &str) -> Vec<u8> {
        self.local.read_binary(path).await.unwrap()
    }

    /// Encrypt `content` with this vault's key and store it remotely as if
    /// another device had uploaded it.
    pub async fn push_from_elsewhere(&self, remote_name: &str, content: &[u8]) {
        self.ctx.crypto.ensure_ready().await.unwrap();
        let encrypted = self.ctx.crypto.encrypt_file(content, "elsewhere").await.unwrap();
        self.remote
            .put_raw(remote_name, seal_blob(&encrypted.nonce, &encrypted.ciphertext));
    }

    pub async fn decrypt_remote(&self, remote_name: &str) -> Vec<u8> {
        let blob = self.remote.blob(remote_name).unwrap();
        self.ctx.crypto.open_blob(&blob).await.unwrap().0
    }
}
