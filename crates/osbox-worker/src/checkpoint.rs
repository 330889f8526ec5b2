use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use aws_sdk_s3::primitives::ByteStream;
use sha2::{Digest, Sha256};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::S3Config;
use crate::error::WorkerError;

/// Scheme for snapshots that only exist on this worker's NVMe (crash
/// recovery, or object storage not configured).
pub const LOCAL_SCHEME: &str = "local://";

const UPLOAD_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

/// Keys and size of one uploaded snapshot. Workspace-only snapshots (cold
/// restart) have no memory/state keys.
#[derive(Debug, Clone)]
pub struct CheckpointInfo {
    pub mem_key: Option<String>,
    pub state_key: Option<String>,
    pub workspace_key: String,
    pub size_bytes: u64,
    pub region: String,
}

impl CheckpointInfo {
    /// Full snapshots restore memory + VMM state; anything else cold-boots.
    pub fn is_full(&self) -> bool {
        self.mem_key.is_some() && self.state_key.is_some()
    }
}

/// Local file paths of a downloaded (or local) snapshot.
pub struct SnapshotPaths {
    pub mem_path: Option<PathBuf>,
    pub state_path: Option<PathBuf>,
    pub workspace_path: PathBuf,
}

/// Files handed to `put_snapshot`.
pub struct SnapshotFiles {
    pub mem_path: Option<String>,
    pub state_path: Option<String>,
    pub workspace_path: String,
}

/// Object-storage-backed snapshot namespace with a local NVMe cache.
///
/// Layout: `snapshots/<sandbox>/<epoch>/mem.file|state.file|workspace.ext4`.
/// Without S3 configured the store degrades to `local://` keys that point at
/// the files on NVMe.
pub struct CheckpointStore {
    client: Option<aws_sdk_s3::Client>,
    bucket: String,
    region: String,
    cache_dir: String,
    pending: Mutex<Vec<JoinHandle<()>>>,
}

impl CheckpointStore {
    pub async fn new(s3: Option<S3Config>, cache_dir: String) -> Self {
        let (client, bucket, region) = match s3 {
            Some(config) => {
                let client = build_s3_client(&config).await;
                (Some(client), config.bucket, config.region)
            }
            None => (None, String::new(), "local".to_string()),
        };
        Self {
            client,
            bucket,
            region,
            cache_dir,
            pending: Mutex::new(Vec::new()),
        }
    }

    fn object_key(sandbox_id: &str, epoch: u64, name: &str) -> String {
        format!("snapshots/{}/{}/{}", sandbox_id, epoch, name)
    }

    /// Upload a snapshot bundle. The three files upload concurrently; the
    /// `CheckpointInfo` is produced only once all of them succeed, so a
    /// partial snapshot is never observable through `get_snapshot`.
    pub async fn put_snapshot(
        &self,
        sandbox_id: &str,
        epoch: u64,
        files: &SnapshotFiles,
    ) -> Result<CheckpointInfo, WorkerError> {
        let size_bytes = total_size(files).await?;

        let Some(client) = &self.client else {
            // No object storage: the NVMe files are the snapshot.
            return Ok(CheckpointInfo {
                mem_key: files.mem_path.as_ref().map(|p| format!("{}{}", LOCAL_SCHEME, p)),
                state_key: files.state_path.as_ref().map(|p| format!("{}{}", LOCAL_SCHEME, p)),
                workspace_key: format!("{}{}", LOCAL_SCHEME, files.workspace_path),
                size_bytes,
                region: self.region.clone(),
            });
        };

        let workspace_key = Self::object_key(sandbox_id, epoch, "workspace.ext4");
        let mem_key = files
            .mem_path
            .as_ref()
            .map(|_| Self::object_key(sandbox_id, epoch, "mem.file"));
        let state_key = files
            .state_path
            .as_ref()
            .map(|_| Self::object_key(sandbox_id, epoch, "state.file"));

        let upload_mem = async {
            match (&files.mem_path, &mem_key) {
                (Some(path), Some(key)) => upload(client, &self.bucket, key, path).await,
                _ => Ok(()),
            }
        };
        let upload_state = async {
            match (&files.state_path, &state_key) {
                (Some(path), Some(key)) => upload(client, &self.bucket, key, path).await,
                _ => Ok(()),
            }
        };
        let upload_workspace =
            upload(client, &self.bucket, &workspace_key, &files.workspace_path);

        tokio::try_join!(upload_mem, upload_state, upload_workspace)?;

        // GC partial uploads from prior epochs now that this one is whole.
        self.gc_other_epochs(sandbox_id, epoch).await;

        info!(
            sandbox_id = %sandbox_id,
            epoch,
            size_bytes,
            "snapshot uploaded"
        );

        Ok(CheckpointInfo {
            mem_key,
            state_key,
            workspace_key,
            size_bytes,
            region: self.region.clone(),
        })
    }

    /// Upload only the workspace image (periodic autosave of a running
    /// sandbox).
    pub async fn put_workspace_only(
        &self,
        sandbox_id: &str,
        epoch: u64,
        workspace_path: &str,
    ) -> Result<CheckpointInfo, WorkerError> {
        self.put_snapshot(
            sandbox_id,
            epoch,
            &SnapshotFiles {
                mem_path: None,
                state_path: None,
                workspace_path: workspace_path.to_string(),
            },
        )
        .await
    }

    /// Run `put_snapshot` in the background; the result arrives on the
    /// returned channel and the task is tracked for `wait_uploads`.
    pub async fn spawn_put_snapshot(
        self: &Arc<Self>,
        sandbox_id: String,
        epoch: u64,
        files: SnapshotFiles,
    ) -> oneshot::Receiver<Result<CheckpointInfo, WorkerError>> {
        let (tx, rx) = oneshot::channel();
        let store = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let result = store.put_snapshot(&sandbox_id, epoch, &files).await;
            if let Err(ref e) = result {
                warn!(sandbox_id = %sandbox_id, error = %e, "background snapshot upload failed");
            }
            let _ = tx.send(result);
        });
        self.pending.lock().await.push(handle);
        rx
    }

    /// Drain in-flight background uploads before shutdown.
    pub async fn wait_uploads(&self, timeout: Duration) {
        let handles: Vec<_> = self.pending.lock().await.drain(..).collect();
        if handles.is_empty() {
            return;
        }
        let drain = async {
            for handle in handles {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(timeout, drain).await.is_err() {
            warn!("timed out waiting for in-flight snapshot uploads");
        }
    }

    /// Download the snapshot files named by `info` into the local cache and
    /// return their paths. Cache entries are addressed by object key; a
    /// second call for the same keys returns immediately. `local://` keys
    /// resolve to their NVMe paths directly.
    pub async fn get_snapshot(
        &self,
        sandbox_id: &str,
        info: &CheckpointInfo,
    ) -> Result<SnapshotPaths, WorkerError> {
        let mem_path = match &info.mem_key {
            Some(key) => Some(self.fetch(sandbox_id, key).await?),
            None => None,
        };
        let state_path = match &info.state_key {
            Some(key) => Some(self.fetch(sandbox_id, key).await?),
            None => None,
        };
        let workspace_path = self.fetch(sandbox_id, &info.workspace_key).await?;

        Ok(SnapshotPaths {
            mem_path,
            state_path,
            workspace_path,
        })
    }

    async fn fetch(&self, sandbox_id: &str, key: &str) -> Result<PathBuf, WorkerError> {
        if let Some(local) = key.strip_prefix(LOCAL_SCHEME) {
            let path = PathBuf::from(local);
            if !path.exists() {
                return Err(WorkerError::SnapshotMissing(format!(
                    "{} (local file {} gone)",
                    sandbox_id, local
                )));
            }
            return Ok(path);
        }

        let cache_path = self.cache_path(sandbox_id, key);
        if cache_path.exists() {
            return Ok(cache_path);
        }

        let client = self.client.as_ref().ok_or_else(|| {
            WorkerError::DownloadFailed(format!("no object storage configured for key {}", key))
        })?;

        if let Some(parent) = cache_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| WorkerError::io("creating cache directory", e))?;
        }

        download(client, &self.bucket, key, &cache_path).await?;
        Ok(cache_path)
    }

    /// Cache entries are content-addressed by the object key (hashed, since keys
    /// contain slashes) so arbitrary eviction is safe.
    fn cache_path(&self, sandbox_id: &str, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        let name = key.rsplit('/').next().unwrap_or("blob");
        Path::new(&self.cache_dir)
            .join(sandbox_id)
            .join(format!("{}_{}", hex::encode(&digest[..8]), name))
    }

    async fn gc_other_epochs(&self, sandbox_id: &str, keep_epoch: u64) {
        let Some(client) = &self.client else { return };
        let prefix = format!("snapshots/{}/", sandbox_id);
        let keep = format!("snapshots/{}/{}/", sandbox_id, keep_epoch);

        let listed = match client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(&prefix)
            .send()
            .await
        {
            Ok(output) => output,
            Err(e) => {
                warn!(sandbox_id = %sandbox_id, error = %e, "snapshot GC list failed");
                return;
            }
        };

        for object in listed.contents() {
            let Some(key) = object.key() else { continue };
            if key.starts_with(&keep) {
                continue;
            }
            if let Err(e) = client
                .delete_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
            {
                warn!(key = %key, error = %e, "snapshot GC delete failed");
            }
        }
    }

    /// Delete all objects for a permanently destroyed sandbox.
    pub async fn delete_all(&self, sandbox_id: &str) {
        self.gc_other_epochs(sandbox_id, u64::MAX).await;
    }
}

async fn total_size(files: &SnapshotFiles) -> Result<u64, WorkerError> {
    let mut total = 0u64;
    for path in files
        .mem_path
        .iter()
        .chain(files.state_path.iter())
        .chain(std::iter::once(&files.workspace_path))
    {
        total += tokio::fs::metadata(path)
            .await
            .map_err(|e| WorkerError::io(format!("stat {}", path), e))?
            .len();
    }
    Ok(total)
}

/// Streaming upload with bounded exponential backoff. Snapshot files can
/// exceed tens of gigabytes; the body is always streamed from disk.
async fn upload(
    client: &aws_sdk_s3::Client,
    bucket: &str,
    key: &str,
    path: &str,
) -> Result<(), WorkerError> {
    let mut last_err = String::new();
    for attempt in 0..UPLOAD_ATTEMPTS {
        if attempt > 0 {
            tokio::time::sleep(RETRY_BASE_DELAY * 2u32.pow(attempt - 1)).await;
        }
        let body = match ByteStream::from_path(path).await {
            Ok(body) => body,
            Err(e) => {
                return Err(WorkerError::UploadFailed(format!(
                    "reading {}: {}",
                    path, e
                )))
            }
        };
        match client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(body)
            .send()
            .await
        {
            Ok(_) => return Ok(()),
            Err(e) => {
                last_err = e.to_string();
                warn!(key = %key, attempt, error = %last_err, "upload attempt failed");
            }
        }
    }
    Err(WorkerError::UploadFailed(format!(
        "{} after {} attempts: {}",
        key, UPLOAD_ATTEMPTS, last_err
    )))
}

/// Streaming download with bounded exponential backoff. Written to a
/// temporary name and renamed so a torn download never looks like a cache hit.
async fn download(
    client: &aws_sdk_s3::Client,
    bucket: &str,
    key: &str,
    dest: &Path,
) -> Result<(), WorkerError> {
    let mut last_err = String::new();
    for attempt in 0..UPLOAD_ATTEMPTS {
        if attempt > 0 {
            tokio::time::sleep(RETRY_BASE_DELAY * 2u32.pow(attempt - 1)).await;
        }
        match try_download(client, bucket, key, dest).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                last_err = e;
                warn!(key = %key, attempt, error = %last_err, "download attempt failed");
            }
        }
    }
    Err(WorkerError::DownloadFailed(format!(
        "{} after {} attempts: {}",
        key, UPLOAD_ATTEMPTS, last_err
    )))
}

async fn try_download(
    client: &aws_sdk_s3::Client,
    bucket: &str,
    key: &str,
    dest: &Path,
) -> Result<(), String> {
    let output = client
        .get_object()
        .bucket(bucket)
        .key(key)
        .send()
        .await
        .map_err(|e| e.to_string())?;

    let tmp = dest.with_extension("partial");
    let mut file = tokio::fs::File::create(&tmp)
        .await
        .map_err(|e| e.to_string())?;
    let mut body = output.body.into_async_read();
    tokio::io::copy(&mut body, &mut file)
        .await
        .map_err(|e| e.to_string())?;
    tokio::fs::rename(&tmp, dest)
        .await
        .map_err(|e| e.to_string())?;
    Ok(())
}

async fn build_s3_client(config: &S3Config) -> aws_sdk_s3::Client {
    let creds = aws_credential_types::Credentials::new(
        &config.access_key,
        &config.secret_key,
        None,
        None,
        "osbox-worker",
    );

    let mut s3_config = aws_sdk_s3::config::Builder::new()
        .region(aws_sdk_s3::config::Region::new(config.region.clone()))
        .credentials_provider(creds)
        .force_path_style(true);

    if let Some(ref endpoint) = config.endpoint {
        s3_config = s3_config.endpoint_url(endpoint);
    }

    aws_sdk_s3::Client::from_conf(s3_config.build())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn local_store(cache: &Path) -> CheckpointStore {
        CheckpointStore::new(None, cache.to_string_lossy().into_owned()).await
    }

    fn write_files(dir: &Path) -> SnapshotFiles {
        std::fs::write(dir.join("mem.file"), vec![0u8; 128]).unwrap();
        std::fs::write(dir.join("state.file"), vec![0u8; 64]).unwrap();
        std::fs::write(dir.join("workspace.ext4"), vec![0u8; 256]).unwrap();
        SnapshotFiles {
            mem_path: Some(dir.join("mem.file").to_string_lossy().into_owned()),
            state_path: Some(dir.join("state.file").to_string_lossy().into_owned()),
            workspace_path: dir.join("workspace.ext4").to_string_lossy().into_owned(),
        }
    }

    #[test]
    fn object_key_layout() {
        assert_eq!(
            CheckpointStore::object_key("sb_a", 1700000000, "mem.file"),
            "snapshots/sb_a/1700000000/mem.file"
        );
    }

    #[tokio::test]
    async fn local_put_returns_local_keys_and_sizes() {
        let dir = tempfile::tempdir().unwrap();
        let store = local_store(dir.path()).await;
        let files = write_files(dir.path());

        let info = store.put_snapshot("sb_a", 1, &files).await.unwrap();
        assert!(info.is_full());
        assert_eq!(info.size_bytes, 128 + 64 + 256);
        assert_eq!(info.region, "local");
        assert!(info.workspace_key.starts_with(LOCAL_SCHEME));
    }

    #[tokio::test]
    async fn local_roundtrip_resolves_paths() {
        let dir = tempfile::tempdir().unwrap();
        let store = local_store(dir.path()).await;
        let files = write_files(dir.path());

        let info = store.put_snapshot("sb_a", 1, &files).await.unwrap();
        let paths = store.get_snapshot("sb_a", &info).await.unwrap();

        assert_eq!(paths.mem_path.unwrap(), dir.path().join("mem.file"));
        assert_eq!(paths.workspace_path, dir.path().join("workspace.ext4"));
    }

    #[tokio::test]
    async fn missing_local_file_is_snapshot_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = local_store(dir.path()).await;
        let info = CheckpointInfo {
            mem_key: None,
            state_key: None,
            workspace_key: format!("{}{}", LOCAL_SCHEME, "/nonexistent/workspace.ext4"),
            size_bytes: 0,
            region: "local".into(),
        };
        let result = store.get_snapshot("sb_a", &info).await;
        assert!(matches!(result, Err(WorkerError::SnapshotMissing(_))));
    }

    #[tokio::test]
    async fn workspace_only_snapshot_is_not_full() {
        let dir = tempfile::tempdir().unwrap();
        let store = local_store(dir.path()).await;
        std::fs::write(dir.path().join("workspace.ext4"), vec![0u8; 32]).unwrap();

        let info = store
            .put_workspace_only(
                "sb_a",
                2,
                dir.path().join("workspace.ext4").to_str().unwrap(),
            )
            .await
            .unwrap();
        assert!(!info.is_full());
        assert!(info.mem_key.is_none());
        assert_eq!(info.size_bytes, 32);
    }

    #[tokio::test]
    async fn put_fails_when_source_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = local_store(dir.path()).await;
        let files = SnapshotFiles {
            mem_path: None,
            state_path: None,
            workspace_path: dir.path().join("gone.ext4").to_string_lossy().into_owned(),
        };
        assert!(store.put_snapshot("sb_a", 1, &files).await.is_err());
    }

    #[tokio::test]
    async fn spawn_put_reports_on_channel_and_drains() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(local_store(dir.path()).await);
        let files = write_files(dir.path());

        let rx = store
            .spawn_put_snapshot("sb_bg".to_string(), 3, files)
            .await;
        let info = rx.await.unwrap().unwrap();
        assert!(info.is_full());

        store.wait_uploads(Duration::from_secs(1)).await;
    }

    #[test]
    fn cache_paths_differ_per_key_but_are_stable() {
        let store = CheckpointStore {
            client: None,
            bucket: String::new(),
            region: "local".into(),
            cache_dir: "/var/osbox/checkpoints".into(),
            pending: Mutex::new(Vec::new()),
        };
        let a = store.cache_path("sb_a", "snapshots/sb_a/1/mem.file");
        let b = store.cache_path("sb_a", "snapshots/sb_a/2/mem.file");
        assert_ne!(a, b);
        assert_eq!(a, store.cache_path("sb_a", "snapshots/sb_a/1/mem.file"));
        assert!(a.starts_with("/var/osbox/checkpoints/sb_a"));
        assert!(a.to_string_lossy().ends_with("_mem.file"));
    }
}
