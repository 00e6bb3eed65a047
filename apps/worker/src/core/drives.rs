//! Drive Provisioner (spec §4.5). Rootfs cloning follows the teacher's
//! `fast_provisioning.rs` reflink-copy idiom: try `cp --reflink=always`
//! first (copy-on-write on btrfs/xfs), fall back to a plain byte copy when
//! the filesystem doesn't support it.

use std::path::Path;

use anyhow::{bail, Context};
use sandbox_types::{SandboxError, SandboxResult};
use tokio::process::Command;

/// Copy-on-write clone when the filesystem supports it, otherwise a full
/// copy. Mirrors the teacher's `reflink_copy` fallback chain exactly.
pub async fn reflink_copy(src: &Path, dest: &Path) -> SandboxResult<()> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let reflink = Command::new("cp")
        .arg("--reflink=always")
        .arg(src)
        .arg(dest)
        .output()
        .await;

    if let Ok(output) = &reflink {
        if output.status.success() {
            return Ok(());
        }
    }

    tokio::fs::copy(src, dest).await.map_err(|e| {
        SandboxError::ArchiveFailure(format!("failed to copy {} -> {}: {e}", src.display(), dest.display()))
    })?;
    Ok(())
}

/// `prepare-rootfs(template-image, dest)`.
pub async fn prepare_rootfs(template_image: &Path, dest: &Path) -> SandboxResult<()> {
    reflink_copy(template_image, dest).await
}

/// `resolve-base-image(images-dir, template) -> path`.
pub async fn resolve_base_image(images_dir: &Path, template: &str) -> SandboxResult<std::path::PathBuf> {
    let path = images_dir.join(format!("{template}.ext4"));
    if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
        return Err(SandboxError::NotFound(format!("template-not-found: {template}")));
    }
    Ok(path)
}

/// `create-workspace(dest, size-mib)`: a sparse file formatted ext4.
pub async fn create_workspace(dest: &Path, size_mib: u32) -> SandboxResult<()> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    create_sparse_file(dest, size_mib as u64 * 1024 * 1024)
        .await
        .map_err(|e| SandboxError::ArchiveFailure(e.to_string()))?;

    let status = Command::new("mkfs.ext4")
        .args(["-F", "-q"])
        .arg(dest)
        .status()
        .await
        .map_err(|e| SandboxError::ArchiveFailure(format!("mkfs.ext4 spawn failed: {e}")))?;
    if !status.success() {
        return Err(SandboxError::ArchiveFailure(format!(
            "mkfs.ext4 failed for {}",
            dest.display()
        )));
    }
    Ok(())
}

async fn create_sparse_file(path: &Path, size_bytes: u64) -> anyhow::Result<()> {
    let file = tokio::fs::File::create(path)
        .await
        .with_context(|| format!("failed to create {}", path.display()))?;
    file.set_len(size_bytes).await.context("failed to set sparse file length")?;
    Ok(())
}

/// Probes whether `path`'s filesystem supports reflink clones (btrfs/xfs).
/// Used only for logging/diagnostics — `reflink_copy` always tries reflink
/// first and falls back regardless of this check.
pub async fn is_reflink_capable(path: &Path) -> bool {
    let output = Command::new("stat").args(["-f", "-c", "%T"]).arg(path).output().await;
    match output {
        Ok(o) if o.status.success() => {
            let fstype = String::from_utf8_lossy(&o.stdout);
            let fstype = fstype.trim();
            fstype == "btrfs" || fstype == "xfs"
        }
        _ => false,
    }
}

/// Returns an error with the `archive-failure` kind if `path` is missing,
/// used by drive-presence checks during wake's cold/hot path decision.
pub async fn require_exists(path: &Path) -> SandboxResult<()> {
    if !tokio::fs::try_exists(path).await.unwrap_or(false) {
        bail_missing(path)
    } else {
        Ok(())
    }
}

fn bail_missing(path: &Path) -> SandboxResult<()> {
    Err(SandboxError::PreconditionFailed(format!(
        "required drive missing: {}",
        path.display()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reflink_copy_falls_back_to_plain_copy() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.ext4");
        let dest = dir.path().join("nested/dest.ext4");
        tokio::fs::write(&src, b"fake-image-bytes").await.unwrap();

        reflink_copy(&src, &dest).await.unwrap();
        let got = tokio::fs::read(&dest).await.unwrap();
        assert_eq!(got, b"fake-image-bytes");
    }

    #[tokio::test]
    async fn resolve_base_image_fails_for_unknown_template() {
        let dir = tempfile::tempdir().unwrap();
        let err = resolve_base_image(dir.path(), "nonexistent").await.unwrap_err();
        assert!(matches!(err, SandboxError::NotFound(_)));
    }

    #[tokio::test]
    async fn resolve_base_image_finds_known_template() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("default.ext4"), b"x").await.unwrap();
        let path = resolve_base_image(dir.path(), "default").await.unwrap();
        assert_eq!(path, dir.path().join("default.ext4"));
    }
}
