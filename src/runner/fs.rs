use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use super::executor::run_docker;

/// Read responses are capped at 10 MiB, writes at 50 MiB.
pub const MAX_READ_BYTES: u64 = 10 * 1024 * 1024;
pub const MAX_WRITE_BYTES: usize = 50 * 1024 * 1024;

/// Paths that are never served, regardless of what the rootfs contains.
const FORBIDDEN_PREFIXES: &[&str] = &["/proc", "/sys", "/dev"];

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum FsPathError {
    #[error("path must be absolute")]
    NotAbsolute,
    #[error("path escapes the task root")]
    Escapes,
    #[error("access to {0} is forbidden")]
    Forbidden(&'static str),
}

#[derive(Debug, Clone, Serialize)]
pub struct FsEntry {
    pub name: String,
    pub is_dir: bool,
    pub size_bytes: u64,
    pub modified: Option<String>,
}

/// Map an in-container absolute path onto the task's rootfs directory.
/// Rejects relative paths, any `..` traversal, and the forbidden kernel
/// pseudo-filesystems.
pub fn resolve_task_path(root: &Path, requested: &str) -> Result<PathBuf, FsPathError> {
    if !requested.starts_with('/') {
        return Err(FsPathError::NotAbsolute);
    }
    for prefix in FORBIDDEN_PREFIXES {
        if requested == *prefix || requested.starts_with(&format!("{prefix}/")) {
            return Err(FsPathError::Forbidden(prefix));
        }
    }

    let mut resolved = root.to_path_buf();
    for component in Path::new(requested).components() {
        match component {
            Component::RootDir => {}
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::Prefix(_) => return Err(FsPathError::Escapes),
        }
    }
    Ok(resolved)
}

/// The container's merged rootfs on the runner, via docker inspect.
pub async fn merged_rootfs(container_name: &str) -> Result<PathBuf> {
    let out = run_docker(&[
        "inspect".into(),
        "-f".into(),
        "{{.GraphDriver.Data.MergedDir}}".into(),
        container_name.to_string(),
    ])
    .await
    .with_context(|| format!("inspect rootfs of {container_name}"))?;
    let path = out.trim();
    if path.is_empty() || path == "<no value>" {
        anyhow::bail!("container {container_name} has no merged rootfs");
    }
    Ok(PathBuf::from(path))
}

pub async fn list_dir(path: &Path) -> Result<Vec<FsEntry>> {
    let mut out = Vec::new();
    let mut entries = tokio::fs::read_dir(path)
        .await
        .with_context(|| format!("read_dir {}", path.display()))?;
    while let Some(entry) = entries.next_entry().await? {
        let meta = entry.metadata().await?;
        out.push(FsEntry {
            name: entry.file_name().to_string_lossy().into_owned(),
            is_dir: meta.is_dir(),
            size_bytes: meta.len(),
            modified: meta
                .modified()
                .ok()
                .map(|t| chrono::DateTime::<chrono::Utc>::from(t).to_rfc3339()),
        });
    }
    out.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(out)
}

pub async fn read_file(path: &Path) -> Result<Vec<u8>> {
    let meta = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("stat {}", path.display()))?;
    if meta.len() > MAX_READ_BYTES {
        anyhow::bail!(
            "file is {} bytes, read limit is {MAX_READ_BYTES}",
            meta.len()
        );
    }
    Ok(tokio::fs::read(path).await?)
}

pub async fn write_file(path: &Path, contents: &[u8]) -> Result<()> {
    if contents.len() > MAX_WRITE_BYTES {
        anyhow::bail!(
            "payload is {} bytes, write limit is {MAX_WRITE_BYTES}",
            contents.len()
        );
    }
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, contents)
        .await
        .with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

pub async fn make_dir(path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(path)
        .await
        .with_context(|| format!("mkdir {}", path.display()))?;
    Ok(())
}

pub async fn rename(from: &Path, to: &Path) -> Result<()> {
    tokio::fs::rename(from, to)
        .await
        .with_context(|| format!("rename {} -> {}", from.display(), to.display()))?;
    Ok(())
}

pub async fn delete(path: &Path) -> Result<()> {
    let meta = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("stat {}", path.display()))?;
    if meta.is_dir() {
        tokio::fs::remove_dir_all(path).await?;
    } else {
        tokio::fs::remove_file(path).await?;
    }
    Ok(())
}

pub async fn stat(path: &Path) -> Result<FsEntry> {
    let meta = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("stat {}", path.display()))?;
    Ok(FsEntry {
        name: path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "/".into()),
        is_dir: meta.is_dir(),
        size_bytes: meta.len(),
        modified: meta
            .modified()
            .ok()
            .map(|t| chrono::DateTime::<chrono::Utc>::from(t).to_rfc3339()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root() -> PathBuf {
        PathBuf::from("/var/lib/docker/overlay2/abc/merged")
    }

    #[test]
    fn resolves_simple_absolute_paths() {
        assert_eq!(
            resolve_task_path(&root(), "/home/user/file.txt").unwrap(),
            root().join("home/user/file.txt")
        );
        assert_eq!(resolve_task_path(&root(), "/").unwrap(), root());
    }

    #[test]
    fn rejects_relative_paths() {
        assert_eq!(
            resolve_task_path(&root(), "etc/passwd"),
            Err(FsPathError::NotAbsolute)
        );
    }

    #[test]
    fn rejects_traversal() {
        assert_eq!(
            resolve_task_path(&root(), "/home/../../etc/passwd"),
            Err(FsPathError::Escapes)
        );
    }

    #[test]
    fn rejects_forbidden_prefixes() {
        for bad in ["/proc", "/proc/1/mem", "/sys/kernel", "/dev/sda"] {
            assert!(matches!(
                resolve_task_path(&root(), bad),
                Err(FsPathError::Forbidden(_))
            ));
        }
        // Lookalikes are fine.
        assert!(resolve_task_path(&root(), "/procfiles/a").is_ok());
        assert!(resolve_task_path(&root(), "/system/a").is_ok());
        assert!(resolve_task_path(&root(), "/devices/a").is_ok());
    }

    #[test]
    fn current_dir_components_collapse() {
        assert_eq!(
            resolve_task_path(&root(), "/home/./user").unwrap(),
            root().join("home/user")
        );
    }

    #[tokio::test]
    async fn file_round_trip_in_temp_root() {
        let dir = std::env::temp_dir().join(format!("kohaku-fs-test-{}", std::process::id()));
        let _ = tokio::fs::remove_dir_all(&dir).await;
        tokio::fs::create_dir_all(&dir).await.unwrap();

        let path = resolve_task_path(&dir, "/workspace/notes.txt").unwrap();
        write_file(&path, b"hello").await.unwrap();
        assert_eq!(read_file(&path).await.unwrap(), b"hello");

        let entries = list_dir(&dir.join("workspace")).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "notes.txt");
        assert_eq!(entries[0].size_bytes, 5);
        assert!(!entries[0].is_dir);

        let renamed = resolve_task_path(&dir, "/workspace/renamed.txt").unwrap();
        rename(&path, &renamed).await.unwrap();
        assert!(read_file(&path).await.is_err());

        let info = stat(&renamed).await.unwrap();
        assert_eq!(info.name, "renamed.txt");

        delete(&renamed).await.unwrap();
        assert!(stat(&renamed).await.is_err());

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn write_limit_enforced() {
        let dir = std::env::temp_dir().join(format!("kohaku-fs-limit-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("big");

        let oversized = vec![0u8; MAX_WRITE_BYTES + 1];
        assert!(write_file(&path, &oversized).await.is_err());
        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}
