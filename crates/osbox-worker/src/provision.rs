use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::WorkerError;

/// Per-sandbox disk images produced by the provisioner.
pub struct ProvisionedDisks {
    pub rootfs_path: String,
    pub workspace_path: String,
}

/// Resolve a template name to a base image path.
///
/// Checks `{name}.ext4`, `{name}-base.ext4`, then `{name}` verbatim in the
/// images directory.
pub fn resolve_template(images_dir: &str, template: &str) -> Result<PathBuf, WorkerError> {
    let candidates = [
        format!("{}/{}.ext4", images_dir, template),
        format!("{}/{}-base.ext4", images_dir, template),
        format!("{}/{}", images_dir, template),
    ];
    for candidate in &candidates {
        let path = Path::new(candidate);
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
    }
    Err(WorkerError::TemplateNotFound(template.to_string()))
}

/// Materialize per-VM disk images: a CoW clone of the template base image and
/// a fresh sparse ext4 workspace volume.
pub async fn provision(
    images_dir: &str,
    sandbox_dir: &str,
    template: &str,
    workspace_mib: u32,
) -> Result<ProvisionedDisks, WorkerError> {
    let base = resolve_template(images_dir, template)?;

    tokio::fs::create_dir_all(sandbox_dir)
        .await
        .map_err(|e| WorkerError::io(format!("creating {}", sandbox_dir), e))?;

    let rootfs_path = format!("{}/rootfs.ext4", sandbox_dir);
    let workspace_path = format!("{}/workspace.ext4", sandbox_dir);

    clone_rootfs(base.to_str().unwrap_or_default(), &rootfs_path).await?;
    make_workspace(&workspace_path, workspace_mib).await?;

    info!(
        template = %template,
        rootfs = %rootfs_path,
        workspace = %workspace_path,
        "disks provisioned"
    );

    Ok(ProvisionedDisks {
        rootfs_path,
        workspace_path,
    })
}

/// Reflink-copy the base image. Base images are never modified; the clone is
/// what Firecracker gets as the writable root drive.
///
/// On XFS/btrfs `--reflink=always` is an instant CoW clone. Elsewhere it
/// fails, and we fall back to a regular copy with a warning.
async fn clone_rootfs(src: &str, dest: &str) -> Result<(), WorkerError> {
    if !Path::new(src).exists() {
        return Err(WorkerError::TemplateNotFound(src.to_string()));
    }

    let reflink = tokio::process::Command::new("cp")
        .arg("--reflink=always")
        .arg(src)
        .arg(dest)
        .output()
        .await
        .map_err(|e| WorkerError::io("running cp --reflink", e))?;

    if reflink.status.success() {
        return Ok(());
    }

    warn!(
        src = %src,
        "filesystem does not support reflinks, falling back to full copy"
    );

    let copy = tokio::process::Command::new("cp")
        .arg(src)
        .arg(dest)
        .output()
        .await
        .map_err(|e| WorkerError::io("running cp", e))?;

    if !copy.status.success() {
        let stderr = String::from_utf8_lossy(&copy.stderr);
        return Err(WorkerError::io(
            format!("cp {} -> {}: {}", src, dest, stderr.trim()),
            std::io::Error::new(std::io::ErrorKind::Other, "cp failed"),
        ));
    }

    Ok(())
}

/// Create the sparse workspace volume: truncate to size, format ext4 with the
/// journal disabled (durability is the checkpoint store's job), label it
/// `workspace` so the guest init can find it.
async fn make_workspace(path: &str, size_mib: u32) -> Result<(), WorkerError> {
    let file = tokio::fs::File::create(path)
        .await
        .map_err(|e| WorkerError::io(format!("creating {}", path), e))?;
    file.set_len(size_mib as u64 * 1024 * 1024)
        .await
        .map_err(|e| WorkerError::io(format!("truncating {}", path), e))?;
    drop(file);

    let output = tokio::process::Command::new("mkfs.ext4")
        .arg("-q")
        .arg("-O")
        .arg("^has_journal")
        .arg("-L")
        .arg("workspace")
        .arg(path)
        .output()
        .await
        .map_err(|e| WorkerError::io("running mkfs.ext4", e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(WorkerError::io(
            format!("mkfs.ext4 {}: {}", path, stderr.trim()),
            std::io::Error::new(std::io::ErrorKind::Other, "mkfs failed"),
        ));
    }

    Ok(())
}

/// Remove a sandbox's data directory and its contents.
pub async fn cleanup(sandbox_dir: &str) -> Result<(), WorkerError> {
    if !Path::new(sandbox_dir).exists() {
        return Ok(());
    }
    tokio::fs::remove_dir_all(sandbox_dir)
        .await
        .map_err(|e| WorkerError::io(format!("removing {}", sandbox_dir), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_prefers_plain_ext4() {
        let dir = tempfile::tempdir().unwrap();
        let images = dir.path().to_str().unwrap();
        std::fs::write(dir.path().join("base.ext4"), b"a").unwrap();
        std::fs::write(dir.path().join("base-base.ext4"), b"b").unwrap();

        let resolved = resolve_template(images, "base").unwrap();
        assert!(resolved.ends_with("base.ext4"));
    }

    #[test]
    fn resolve_falls_back_to_base_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let images = dir.path().to_str().unwrap();
        std::fs::write(dir.path().join("python-base.ext4"), b"b").unwrap();

        let resolved = resolve_template(images, "python").unwrap();
        assert!(resolved.ends_with("python-base.ext4"));
    }

    #[test]
    fn resolve_accepts_verbatim_name() {
        let dir = tempfile::tempdir().unwrap();
        let images = dir.path().to_str().unwrap();
        std::fs::write(dir.path().join("custom.img"), b"c").unwrap();

        let resolved = resolve_template(images, "custom.img").unwrap();
        assert!(resolved.ends_with("custom.img"));
    }

    #[test]
    fn resolve_unknown_template_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = resolve_template(dir.path().to_str().unwrap(), "nope");
        assert!(matches!(result, Err(WorkerError::TemplateNotFound(_))));
    }

    #[tokio::test]
    async fn clone_rootfs_copies_content() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("base.ext4");
        let dest = dir.path().join("rootfs.ext4");
        std::fs::write(&src, b"fake-ext4-data").unwrap();

        clone_rootfs(src.to_str().unwrap(), dest.to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"fake-ext4-data");
    }

    #[tokio::test]
    async fn clone_rootfs_missing_source_fails() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("rootfs.ext4");
        let result = clone_rootfs("/nonexistent/base.ext4", dest.to_str().unwrap()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn cleanup_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox_dir = dir.path().join("sb_gone");
        assert!(cleanup(sandbox_dir.to_str().unwrap()).await.is_ok());

        std::fs::create_dir_all(&sandbox_dir).unwrap();
        std::fs::write(sandbox_dir.join("rootfs.ext4"), b"x").unwrap();
        assert!(cleanup(sandbox_dir.to_str().unwrap()).await.is_ok());
        assert!(!sandbox_dir.exists());
    }

    #[tokio::test]
    async fn provision_unknown_template_fails_before_touching_disk() {
        let images = tempfile::tempdir().unwrap();
        let sandbox = tempfile::tempdir().unwrap();
        let sandbox_dir = sandbox.path().join("sb_x");

        let result = provision(
            images.path().to_str().unwrap(),
            sandbox_dir.to_str().unwrap(),
            "missing",
            64,
        )
        .await;

        assert!(matches!(result, Err(WorkerError::TemplateNotFound(_))));
        assert!(!sandbox_dir.exists());
    }
}
