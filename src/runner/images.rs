use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::executor::run_docker;
use crate::config::RunnerConfig;

/// Keeps local docker images in sync with the shared tarball directory.
///
/// Tarballs are named `{name}-{unix_ts}.tar`; the newest one wins. A single
/// in-flight load at a time: the mutex serializes syncs and the freshness
/// check is repeated after acquisition so queued waiters do not re-load what
/// the winner just loaded.
pub struct ImageSync {
    config: Arc<RunnerConfig>,
    lock: Mutex<()>,
}

/// Extract the timestamp from `{name}-{unix_ts}.tar`.
pub fn parse_tarball_name(file_name: &str, image_name: &str) -> Option<i64> {
    let rest = file_name.strip_prefix(image_name)?.strip_prefix('-')?;
    rest.strip_suffix(".tar")?.parse().ok()
}

/// Newest matching tarball in a directory, with its embedded timestamp.
pub fn newest_tarball(dir: &Path, image_name: &str) -> Option<(PathBuf, i64)> {
    let entries = std::fs::read_dir(dir).ok()?;
    entries
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name();
            let ts = parse_tarball_name(&name.to_string_lossy(), image_name)?;
            Some((entry.path(), ts))
        })
        .max_by_key(|(_, ts)| *ts)
}

/// Parse the RFC 3339 timestamp `docker image inspect -f '{{.Created}}'`
/// prints, into Unix seconds.
pub fn parse_docker_created(raw: &str) -> Option<i64> {
    chrono::DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|dt| dt.timestamp())
}

impl ImageSync {
    pub fn new(config: Arc<RunnerConfig>) -> Self {
        Self {
            config,
            lock: Mutex::new(()),
        }
    }

    /// Make sure the image a task references is present and current.
    pub async fn ensure_synced(
        &self,
        container_name: Option<&str>,
        registry_image: Option<&str>,
    ) -> Result<()> {
        if let Some(image) = registry_image {
            return self.ensure_registry_image(image).await;
        }
        let Some(name) = container_name else {
            anyhow::bail!("task names neither a container image nor a registry image");
        };
        self.ensure_tarball_image(name).await
    }

    /// Registry images: pull when absent. No shared storage involved.
    async fn ensure_registry_image(&self, image: &str) -> Result<()> {
        if image_created(image).await.is_some() {
            debug!(image = %image, "Registry image already present");
            return Ok(());
        }
        info!(image = %image, "Pulling registry image");
        run_docker(&["pull".into(), image.to_string()])
            .await
            .with_context(|| format!("pull {image}"))?;
        Ok(())
    }

    /// Tarball images: load when the newest shared tarball is newer than the
    /// local image (or the image is missing), then retag as
    /// `kohakuriver/{name}:base`.
    async fn ensure_tarball_image(&self, name: &str) -> Result<()> {
        let tag = format!("kohakuriver/{name}:base");
        let dir = self.config.container_dir();

        if !self.needs_load(&dir, name, &tag).await? {
            return Ok(());
        }

        let _guard = self.lock.lock().await;
        // Re-check: another task may have loaded while we waited.
        if !self.needs_load(&dir, name, &tag).await? {
            debug!(image = %tag, "Image became current while waiting for sync lock");
            return Ok(());
        }

        let (tarball, ts) = newest_tarball(&dir, name)
            .with_context(|| format!("no tarball for image {name:?} in {}", dir.display()))?;
        info!(image = %tag, tarball = %tarball.display(), ts, "Loading image tarball");

        let out = run_docker(&["load".into(), "-i".into(), tarball.display().to_string()])
            .await
            .context("docker load")?;
        let loaded_ref = out
            .lines()
            .filter_map(|l| l.strip_prefix("Loaded image: "))
            .next_back()
            .map(str::trim)
            .map(String::from);
        if let Some(loaded) = loaded_ref {
            if loaded != tag {
                run_docker(&["tag".into(), loaded.clone(), tag.clone()])
                    .await
                    .with_context(|| format!("tag {loaded} as {tag}"))?;
            }
        }
        info!(image = %tag, "Image tarball loaded");
        Ok(())
    }

    async fn needs_load(&self, dir: &Path, name: &str, tag: &str) -> Result<bool> {
        let newest = {
            let dir = dir.to_path_buf();
            let name = name.to_string();
            // Directory scan can touch slow shared storage; keep it off the
            // event loop.
            tokio::task::spawn_blocking(move || newest_tarball(&dir, &name))
                .await
                .context("tarball scan")?
        };
        let Some((_, tarball_ts)) = newest else {
            // No tarball: fine as long as the image already exists.
            return match image_created(tag).await {
                Some(_) => Ok(false),
                None => anyhow::bail!("image {tag} missing and no tarball found"),
            };
        };
        Ok(match image_created(tag).await {
            Some(created) => tarball_ts > created,
            None => true,
        })
    }
}

/// Creation time of a local image, or None when it does not exist.
async fn image_created(reference: &str) -> Option<i64> {
    let out = run_docker(&[
        "image".into(),
        "inspect".into(),
        "-f".into(),
        "{{.Created}}".into(),
        reference.to_string(),
    ])
    .await
    .ok()?;
    parse_docker_created(&out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tarball_name_parses() {
        assert_eq!(parse_tarball_name("base-1700000000.tar", "base"), Some(1700000000));
        assert_eq!(parse_tarball_name("pytorch-1.tar", "pytorch"), Some(1));
    }

    #[test]
    fn tarball_name_rejects_mismatches() {
        assert_eq!(parse_tarball_name("base-1700000000.tar", "pytorch"), None);
        assert_eq!(parse_tarball_name("base.tar", "base"), None);
        assert_eq!(parse_tarball_name("base-notanumber.tar", "base"), None);
        assert_eq!(parse_tarball_name("base-17.tar.gz", "base"), None);
    }

    #[test]
    fn tarball_name_with_hyphenated_image() {
        // "my-image-1700000000.tar" for image "my-image".
        assert_eq!(
            parse_tarball_name("my-image-1700000000.tar", "my-image"),
            Some(1700000000)
        );
        // And the prefix must match exactly up to the timestamp separator.
        assert_eq!(parse_tarball_name("my-image-x-1.tar", "my-image"), None);
    }

    #[test]
    fn newest_tarball_picks_highest_timestamp() {
        let dir = std::env::temp_dir().join(format!("kohaku-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        for name in ["base-100.tar", "base-300.tar", "base-200.tar", "other-900.tar"] {
            std::fs::write(dir.join(name), b"").unwrap();
        }

        let (path, ts) = newest_tarball(&dir, "base").unwrap();
        assert_eq!(ts, 300);
        assert!(path.ends_with("base-300.tar"));

        assert!(newest_tarball(&dir, "missing").is_none());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn newest_tarball_missing_dir_is_none() {
        assert!(newest_tarball(Path::new("/nonexistent-kohaku"), "base").is_none());
    }

    #[test]
    fn docker_created_parses_rfc3339() {
        assert_eq!(
            parse_docker_created("2024-01-01T00:00:00Z\n"),
            Some(1_704_067_200)
        );
        assert_eq!(
            parse_docker_created("2024-01-01T00:00:00.123456789Z"),
            Some(1_704_067_200)
        );
        assert_eq!(parse_docker_created("yesterday"), None);
    }
}
