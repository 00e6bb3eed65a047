//! Object Store Client with local NVMe cache (spec §4.7). Uploads/downloads
//! are plain HTTP PUT/GET against an object-store endpoint — no S3 SDK
//! appears anywhere in the retrieved corpus, but `reqwest` does (the
//! teacher's own `features/vms/fast_provisioning.rs` builds short-lived
//! `reqwest::Client`s for readiness polling), so the store speaks HTTP
//! through it directly.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use nix::sys::statvfs::statvfs;
use sandbox_types::{SandboxError, SandboxResult};
use tokio::io::AsyncWriteExt;

/// Reserve fraction kept free on the cache volume before eviction kicks in.
const CACHE_FREE_RESERVE: f64 = 0.20;

pub struct ObjectStoreClient {
    http: reqwest::Client,
    base_url: String,
    cache_dir: Option<PathBuf>,
}

impl ObjectStoreClient {
    pub fn new(base_url: impl Into<String>, cache_dir: Option<PathBuf>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            cache_dir,
        }
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), urlencoding::encode(key))
    }

    fn cache_path(&self, key: &str) -> Option<PathBuf> {
        self.cache_dir.as_ref().map(|dir| dir.join(urlencoding::encode(key).into_owned()))
    }

    /// PUTs `local_path`'s contents to `key`, then best-effort seeds the
    /// cache (hard link first, falling back to a stream copy across
    /// devices) so a subsequent download on this worker is a cache hit.
    pub async fn upload(&self, key: &str, local_path: &Path) -> SandboxResult<u64> {
        let bytes = tokio::fs::read(local_path)
            .await
            .map_err(|e| SandboxError::ObjectStoreFailure(format!("read {}: {e}", local_path.display())))?;
        let size = bytes.len() as u64;

        let resp = self
            .http
            .put(self.object_url(key))
            .body(bytes)
            .send()
            .await
            .map_err(|e| SandboxError::ObjectStoreFailure(format!("upload {key}: {e}")))?;
        if !resp.status().is_success() {
            return Err(SandboxError::ObjectStoreFailure(format!(
                "upload {key} failed: status {}",
                resp.status()
            )));
        }

        if let Some(cache_path) = self.cache_path(key) {
            if let Err(e) = self.seed_cache(&cache_path, local_path).await {
                tracing::warn!(key, error = %e, "failed to seed object store cache after upload");
            }
        }
        Ok(size)
    }

    async fn seed_cache(&self, cache_path: &Path, local_path: &Path) -> SandboxResult<()> {
        if let Some(parent) = cache_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let _ = tokio::fs::remove_file(cache_path).await;
        if tokio::fs::hard_link(local_path, cache_path).await.is_err() {
            atomic_copy(local_path, cache_path).await?;
        }
        self.maybe_evict(cache_path).await;
        Ok(())
    }

    /// Cache-first download into `dest_path`. On a cache hit, the cached
    /// file's mtime is bumped for LRU and the content is copied to
    /// `dest_path`. On a miss, the object is streamed from the store and
    /// persisted into the cache at the same time; if caching fails the
    /// stream still lands at `dest_path` directly.
    pub async fn download(&self, key: &str, dest_path: &Path) -> SandboxResult<()> {
        if let Some(cache_path) = self.cache_path(key) {
            if tokio::fs::try_exists(&cache_path).await.unwrap_or(false) {
                touch(&cache_path).await;
                atomic_copy(&cache_path, dest_path).await?;
                return Ok(());
            }
        }

        let resp = self
            .http
            .get(self.object_url(key))
            .send()
            .await
            .map_err(|e| SandboxError::ObjectStoreFailure(format!("download {key}: {e}")))?;
        if !resp.status().is_success() {
            return Err(SandboxError::ObjectStoreFailure(format!(
                "download {key} failed: status {}",
                resp.status()
            )));
        }
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| SandboxError::ObjectStoreFailure(format!("download {key} body: {e}")))?;

        if let Some(parent) = dest_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        write_atomic(dest_path, &bytes).await?;

        if let Some(cache_path) = self.cache_path(key) {
            if let Err(e) = self.seed_cache(&cache_path, dest_path).await {
                tracing::warn!(key, error = %e, "failed to populate object store cache after download");
            }
        }
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> SandboxResult<()> {
        let resp = self
            .http
            .delete(self.object_url(key))
            .send()
            .await
            .map_err(|e| SandboxError::ObjectStoreFailure(format!("delete {key}: {e}")))?;
        if !resp.status().is_success() && resp.status().as_u16() != 404 {
            return Err(SandboxError::ObjectStoreFailure(format!(
                "delete {key} failed: status {}",
                resp.status()
            )));
        }
        if let Some(cache_path) = self.cache_path(key) {
            let _ = tokio::fs::remove_file(&cache_path).await;
        }
        Ok(())
    }

    pub async fn cache_hit(&self, key: &str) -> bool {
        match self.cache_path(key) {
            Some(p) => tokio::fs::try_exists(&p).await.unwrap_or(false),
            None => false,
        }
    }

    /// Evicts cached files in ascending access-time order until free space
    /// on the cache volume recovers above the reserve (spec §4.7).
    async fn maybe_evict(&self, just_written: &Path) {
        let Some(cache_dir) = &self.cache_dir else { return };
        let cache_dir = cache_dir.clone();
        let just_written = just_written.to_path_buf();
        let result = tokio::task::spawn_blocking(move || evict_until_under_pressure(&cache_dir, &just_written)).await;
        if let Ok(Err(e)) = result {
            tracing::warn!(error = %e, "cache eviction pass failed");
        }
    }
}

async fn touch(path: &Path) {
    let now = SystemTime::now();
    let path = path.to_path_buf();
    let _ = tokio::task::spawn_blocking(move || filetime_touch(&path, now)).await;
}

fn filetime_touch(path: &Path, now: SystemTime) -> std::io::Result<()> {
    let now = now.duration_since(SystemTime::UNIX_EPOCH).unwrap_or(Duration::ZERO);
    let atime = nix::sys::time::TimeSpec::new(now.as_secs() as i64, now.subsec_nanos() as i64);
    nix::sys::stat::utimensat(
        None,
        path,
        &atime,
        &atime,
        nix::sys::stat::UtimensatFlags::NoFollowSymlink,
    )
    .map_err(|e| std::io::Error::from_raw_os_error(e as i32))
}

/// Streams `src` to `dest` via a temporary sibling file, renamed into place
/// once fully written (spec §4.7: "all write paths use atomic rename").
async fn atomic_copy(src: &Path, dest: &Path) -> SandboxResult<()> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = sibling_tmp_path(dest);
    tokio::fs::copy(src, &tmp)
        .await
        .map_err(|e| SandboxError::ObjectStoreFailure(format!("copy {} -> {}: {e}", src.display(), tmp.display())))?;
    tokio::fs::rename(&tmp, dest).await.map_err(|e| {
        SandboxError::ObjectStoreFailure(format!("rename {} -> {}: {e}", tmp.display(), dest.display()))
    })?;
    Ok(())
}

async fn write_atomic(dest: &Path, data: &[u8]) -> SandboxResult<()> {
    let tmp = sibling_tmp_path(dest);
    let mut f = tokio::fs::File::create(&tmp).await?;
    f.write_all(data).await?;
    f.flush().await?;
    drop(f);
    tokio::fs::rename(&tmp, dest).await.map_err(|e| {
        SandboxError::ObjectStoreFailure(format!("rename {} -> {}: {e}", tmp.display(), dest.display()))
    })?;
    Ok(())
}

fn sibling_tmp_path(dest: &Path) -> PathBuf {
    let file_name = dest.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    dest.with_file_name(format!(".{file_name}.tmp-{}", std::process::id()))
}

fn evict_until_under_pressure(cache_dir: &Path, skip: &Path) -> std::io::Result<()> {
    while below_free_reserve(cache_dir)? {
        let mut entries: Vec<(PathBuf, SystemTime)> = std::fs::read_dir(cache_dir)?
            .filter_map(|e| e.ok())
            .filter(|e| e.path() != skip)
            .filter_map(|e| {
                let meta = e.metadata().ok()?;
                if !meta.is_file() {
                    return None;
                }
                let accessed = meta.accessed().unwrap_or(SystemTime::UNIX_EPOCH);
                Some((e.path(), accessed))
            })
            .collect();
        if entries.is_empty() {
            break;
        }
        entries.sort_by_key(|(_, accessed)| *accessed);
        let (oldest, _) = &entries[0];
        std::fs::remove_file(oldest)?;
    }
    Ok(())
}

fn below_free_reserve(path: &Path) -> std::io::Result<bool> {
    let stats = statvfs(path).map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
    let total = stats.blocks() as f64 * stats.fragment_size() as f64;
    if total <= 0.0 {
        return Ok(false);
    }
    let free = stats.blocks_available() as f64 * stats.fragment_size() as f64;
    Ok(free / total < CACHE_FREE_RESERVE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Bytes as AxumBytes;
    use axum::extract::Path as AxumPath;
    use axum::routing::{delete, get, put};
    use axum::Router;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    type Store = Arc<Mutex<HashMap<String, Vec<u8>>>>;

    async fn spawn_fake_store() -> (String, Store) {
        let store: Store = Arc::new(Mutex::new(HashMap::new()));
        let app_store = store.clone();
        let app = Router::new()
            .route(
                "/:key",
                put({
                    let store = app_store.clone();
                    move |AxumPath(key): AxumPath<String>, body: AxumBytes| {
                        let store = store.clone();
                        async move {
                            store.lock().unwrap().insert(key, body.to_vec());
                            axum::http::StatusCode::OK
                        }
                    }
                })
                .get({
                    let store = app_store.clone();
                    move |AxumPath(key): AxumPath<String>| {
                        let store = store.clone();
                        async move {
                            match store.lock().unwrap().get(&key).cloned() {
                                Some(bytes) => (axum::http::StatusCode::OK, bytes).into_response(),
                                None => axum::http::StatusCode::NOT_FOUND.into_response(),
                            }
                        }
                    }
                })
                .delete({
                    let store = app_store.clone();
                    move |AxumPath(key): AxumPath<String>| {
                        let store = store.clone();
                        async move {
                            store.lock().unwrap().remove(&key);
                            axum::http::StatusCode::OK
                        }
                    }
                }),
            )
            .with_state(());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), store)
    }

    use axum::response::IntoResponse;

    #[tokio::test]
    async fn upload_then_download_round_trips_through_cache() {
        let (base_url, _store) = spawn_fake_store().await;
        let dir = tempfile::tempdir().unwrap();
        let cache_dir = dir.path().join("cache");
        tokio::fs::create_dir_all(&cache_dir).await.unwrap();

        let client = ObjectStoreClient::new(base_url, Some(cache_dir.clone()));

        let src = dir.path().join("archive.tar.zst");
        tokio::fs::write(&src, b"archive-bytes").await.unwrap();

        let uploaded = client.upload("checkpoints/sbx1/snap.tar.zst", &src).await.unwrap();
        assert_eq!(uploaded, 13);
        assert!(client.cache_hit("checkpoints/sbx1/snap.tar.zst").await);

        let dest = dir.path().join("downloaded.tar.zst");
        client.download("checkpoints/sbx1/snap.tar.zst", &dest).await.unwrap();
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"archive-bytes");
    }

    #[tokio::test]
    async fn delete_removes_from_cache() {
        let (base_url, _store) = spawn_fake_store().await;
        let dir = tempfile::tempdir().unwrap();
        let cache_dir = dir.path().join("cache");
        tokio::fs::create_dir_all(&cache_dir).await.unwrap();
        let client = ObjectStoreClient::new(base_url, Some(cache_dir.clone()));

        let src = dir.path().join("a.bin");
        tokio::fs::write(&src, b"x").await.unwrap();
        client.upload("k1", &src).await.unwrap();
        assert!(client.cache_hit("k1").await);

        client.delete("k1").await.unwrap();
        assert!(!client.cache_hit("k1").await);
    }
}
