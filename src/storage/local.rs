use super::{FileStat, LocalTree};
use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tokio::fs;
use walkdir::WalkDir;

/// 本地仓库目录
pub struct LocalStorage {
    base_path: PathBuf,
    name: String,
}

impl LocalStorage {
    pub fn new(path: impl AsRef<Path>) -> SyncResult<Self> {
        let base_path = path.as_ref().to_path_buf();
        if !base_path.exists() {
            std::fs::create_dir_all(&base_path)?;
        }
        let name = format!("local:{}", base_path.display());
        Ok(Self { base_path, name })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub(crate) fn resolve_path(&self, path: &str) -> PathBuf {
        let path = path.trim_start_matches('/').trim_start_matches('\\');
        if path.is_empty() {
            self.base_path.clone()
        } else {
            self.base_path.join(path)
        }
    }

    /// 绝对路径转为以 `/` 分隔的相对路径；不在仓库内时返回 None
    pub fn relative_path(&self, full_path: &Path) -> Option<String> {
        let relative = full_path.strip_prefix(&self.base_path).ok()?.to_str()?;
        let relative = normalize_path(relative);
        if relative.is_empty() {
            None
        } else {
            Some(relative)
        }
    }
}

/// 规范化路径分隔符（统一使用 /）
fn normalize_path(path: &str) -> String {
    path.replace('\\', "/")
}

fn mtime_millis(metadata: &std::fs::Metadata) -> SyncResult<i64> {
    let modified = metadata
        .modified()?
        .duration_since(UNIX_EPOCH)
        .map_err(|e| SyncError::Io(std::io::Error::other(e)))?;
    Ok(modified.as_millis() as i64)
}

#[async_trait]
impl LocalTree for LocalStorage {
    async fn read_binary(&self, path: &str) -> SyncResult<Vec<u8>> {
        Ok(fs::read(self.resolve_path(path)).await?)
    }

    async fn write_binary(&self, path: &str, data: &[u8]) -> SyncResult<()> {
        let full_path = self.resolve_path(path);

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // 使用临时文件写入，然后原子重命名
        let mut temp_name = full_path.as_os_str().to_owned();
        temp_name.push(".cryptsync-tmp");
        let temp_path = PathBuf::from(temp_name);
        fs::write(&temp_path, data).await?;
        fs::rename(&temp_path, &full_path).await?;

        Ok(())
    }

    async fn delete(&self, path: &str) -> SyncResult<()> {
        match fs::remove_file(self.resolve_path(path)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_folder(&self, path: &str) -> SyncResult<()> {
        fs::create_dir_all(self.resolve_path(path)).await?;
        Ok(())
    }

    async fn stat(&self, path: &str) -> SyncResult<Option<FileStat>> {
        match fs::metadata(self.resolve_path(path)).await {
            Ok(metadata) if metadata.is_file() => Ok(Some(FileStat {
                mtime: mtime_millis(&metadata)?,
                size: metadata.len(),
            })),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_all_files(&self) -> SyncResult<Vec<String>> {
        let base = self.base_path.clone();

        // 使用 spawn_blocking 避免阻塞 async runtime
        let files = tokio::task::spawn_blocking(move || {
            WalkDir::new(&base)
                .follow_links(false)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|entry| entry.file_type().is_file())
                .filter_map(|entry| {
                    let relative = entry.path().strip_prefix(&base).ok()?.to_str()?;
                    Some(normalize_path(relative))
                })
                .filter(|path| !path.ends_with(".cryptsync-tmp"))
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|e| SyncError::Io(std::io::Error::other(e)))?;

        Ok(files)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_read_stat_delete() {
        let dir = tempfile::tempdir().unwrap();
        let local = LocalStorage::new(dir.path()).unwrap();

        local.write_binary("notes/deep/a.md", b"hello").await.unwrap();
        assert_eq!(local.read_binary("notes/deep/a.md").await.unwrap(), b"hello");

        let stat = local.stat("notes/deep/a.md").await.unwrap().unwrap();
        assert_eq!(stat.size, 5);
        assert!(stat.mtime > 0);

        // 目录不视为文件
        assert!(local.stat("notes").await.unwrap().is_none());
        assert!(local.exists("notes/deep/a.md").await.unwrap());

        local.delete("notes/deep/a.md").await.unwrap();
        assert!(!local.exists("notes/deep/a.md").await.unwrap());
        // 重复删除不报错
        local.delete("notes/deep/a.md").await.unwrap();
    }

    #[tokio::test]
    async fn test_list_all_files() {
        let dir = tempfile::tempdir().unwrap();
        let local = LocalStorage::new(dir.path()).unwrap();
        local.write_binary("a.md", b"1").await.unwrap();
        local.write_binary("sub/b.md", b"2").await.unwrap();
        local.create_folder("empty").await.unwrap();

        let mut files = local.list_all_files().await.unwrap();
        files.sort();
        assert_eq!(files, vec!["a.md", "sub/b.md"]);
    }

    #[test]
    fn test_relative_path() {
        let dir = tempfile::tempdir().unwrap();
        let local = LocalStorage::new(dir.path()).unwrap();
        assert_eq!(
            local.relative_path(&dir.path().join("x").join("y.md")).as_deref(),
            Some("x/y.md")
        );
        assert!(local.relative_path(dir.path()).is_none());
        assert!(local.relative_path(Path::new("/elsewhere/y.md")).is_none());
    }
}
