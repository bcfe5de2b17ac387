//! Overlayfs assembly and kernel module installation.
//!
//! Read-write overlays take a list of read-only lower layers plus an upper
//! and work directory; read-only overlays take only lowers and mount with
//! the RO flag. Directories are created on demand and cleaned back up if the
//! mount fails.

use std::path::{Path, PathBuf};
use std::process::Command;

use nix::mount::{mount, umount2, MntFlags, MsFlags};

use gcs_shared::{GcsError, GcsResult};

use crate::runtime::reaper;

/// Root under which module overlays are assembled.
const MODULE_OVERLAY_ROOT: &str = "/run/gcs/modules";

/// Build the overlayfs option string: colon-joined lowers, then upper/work
/// when writable.
pub fn overlay_options(
    lower_paths: &[String],
    upper: Option<&Path>,
    work: Option<&Path>,
) -> String {
    let mut options = format!("lowerdir={}", lower_paths.join(":"));
    if let Some(upper) = upper {
        options.push_str(&format!(",upperdir={}", upper.display()));
    }
    if let Some(work) = work {
        options.push_str(&format!(",workdir={}", work.display()));
    }
    options
}

/// Validate an overlay request. Split from the mount so the contract is
/// testable without privileges.
pub fn validate_overlay(
    lower_paths: &[String],
    upper: Option<&Path>,
    work: Option<&Path>,
    target: &Path,
    readonly: bool,
) -> GcsResult<()> {
    if target.as_os_str().is_empty() {
        return Err(GcsError::InvalidArgument(
            "overlay target must not be empty".to_string(),
        ));
    }
    if lower_paths.is_empty() || lower_paths.iter().any(|p| p.is_empty()) {
        return Err(GcsError::InvalidArgument(
            "overlay requires at least one non-empty lower layer".to_string(),
        ));
    }
    if readonly && (upper.is_some() || work.is_some()) {
        return Err(GcsError::InvalidArgument(
            "read-only overlay must not carry upper or work directories".to_string(),
        ));
    }
    if !readonly && (upper.is_none() || work.is_none()) {
        return Err(GcsError::InvalidArgument(
            "writable overlay requires upper and work directories".to_string(),
        ));
    }
    Ok(())
}

/// Mount an overlay at `target`.
pub fn mount_overlay(
    lower_paths: &[String],
    upper: Option<&Path>,
    work: Option<&Path>,
    target: &Path,
    readonly: bool,
) -> GcsResult<()> {
    validate_overlay(lower_paths, upper, work, target, readonly)?;

    // Create missing directories, remembering which ones we made so a
    // failed mount leaves no debris.
    let mut created: Vec<PathBuf> = Vec::new();
    for dir in [Some(target), upper, work].into_iter().flatten() {
        if !dir.exists() {
            std::fs::create_dir_all(dir)
                .map_err(|e| GcsError::io(format!("create {}", dir.display()), e))?;
            created.push(dir.to_path_buf());
        }
    }

    let options = overlay_options(lower_paths, upper, work);
    let flags = if readonly {
        MsFlags::MS_RDONLY
    } else {
        MsFlags::empty()
    };
    tracing::debug!(target = %target.display(), %options, readonly, "mounting overlay");
    if let Err(e) = mount(
        Some("overlay"),
        target,
        Some("overlay"),
        flags,
        Some(options.as_str()),
    ) {
        for dir in created.iter().rev() {
            let _ = std::fs::remove_dir(dir);
        }
        return Err(GcsError::io(
            format!("mount overlay at {}", target.display()),
            e.into(),
        ));
    }
    Ok(())
}

/// Unmount a previously assembled overlay.
pub fn unmount(target: &Path) -> GcsResult<()> {
    umount2(target, MntFlags::empty())
        .map_err(|e| GcsError::io(format!("unmount {}", target.display()), e.into()))
}

/// Install kernel modules from a driver directory: overlay it writable so
/// `depmod` can emit its indexes, then load every `.ko` found.
///
/// Idempotent: an existing overlay target means the drivers were already
/// installed, and the whole operation is skipped.
pub async fn install_modules(driver_dir: &Path) -> GcsResult<()> {
    let name = driver_dir
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| {
            GcsError::InvalidArgument(format!("driver directory {:?} has no name", driver_dir))
        })?;
    let base = PathBuf::from(MODULE_OVERLAY_ROOT).join(name);
    let target = base.join("rootfs");
    if target.exists() {
        tracing::info!(driver = %driver_dir.display(), "modules already installed, skipping");
        return Ok(());
    }

    let upper = base.join("upper");
    let work = base.join("work");
    mount_overlay(
        &[driver_dir.display().to_string()],
        Some(&upper),
        Some(&work),
        &target,
        false,
    )?;

    let modules = find_modules(&target);
    if modules.is_empty() {
        tracing::info!(driver = %driver_dir.display(), "no kernel modules found");
        return Ok(());
    }

    let mut depmod = Command::new("depmod");
    depmod.arg("-b").arg(&target);
    let (status, _) = reaper::run_reaped(depmod).await?;
    if status != 0 {
        return Err(GcsError::Unexpected(format!(
            "depmod exited with status {}",
            status
        )));
    }

    let mut modprobe = Command::new("modprobe");
    modprobe.arg("-d").arg(&target).arg("-a").args(&modules);
    let (status, _) = reaper::run_reaped(modprobe).await?;
    if status != 0 {
        return Err(GcsError::Unexpected(format!(
            "modprobe exited with status {}",
            status
        )));
    }
    tracing::info!(count = modules.len(), "kernel modules installed");
    Ok(())
}

/// Module names (file stems) of every `.ko` under `root`.
fn find_modules(root: &Path) -> Vec<String> {
    let mut modules = Vec::new();
    for entry in walkdir::WalkDir::new(root).into_iter().flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("ko") {
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                modules.push(stem.to_string());
            }
        }
    }
    modules.sort();
    modules
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlay_options_ro() {
        let lowers = vec!["/layers/a".to_string(), "/layers/b".to_string()];
        assert_eq!(
            overlay_options(&lowers, None, None),
            "lowerdir=/layers/a:/layers/b"
        );
    }

    #[test]
    fn test_overlay_options_rw() {
        let lowers = vec!["/l".to_string()];
        assert_eq!(
            overlay_options(&lowers, Some(Path::new("/u")), Some(Path::new("/w"))),
            "lowerdir=/l,upperdir=/u,workdir=/w"
        );
    }

    #[test]
    fn test_validate_rejects_empty_target() {
        let lowers = vec!["/l".to_string()];
        let err =
            validate_overlay(&lowers, None, None, Path::new(""), true).unwrap_err();
        assert!(err.to_string().contains("target"));
    }

    #[test]
    fn test_validate_rejects_upper_in_readonly() {
        let lowers = vec!["/l".to_string()];
        let err = validate_overlay(
            &lowers,
            Some(Path::new("/u")),
            None,
            Path::new("/t"),
            true,
        )
        .unwrap_err();
        assert!(err.to_string().contains("read-only"));
    }

    #[test]
    fn test_validate_requires_upper_and_work_for_rw() {
        let lowers = vec!["/l".to_string()];
        assert!(validate_overlay(&lowers, None, None, Path::new("/t"), false).is_err());
        assert!(validate_overlay(
            &lowers,
            Some(Path::new("/u")),
            Some(Path::new("/w")),
            Path::new("/t"),
            false
        )
        .is_ok());
    }

    #[test]
    fn test_validate_rejects_missing_lowers() {
        assert!(validate_overlay(&[], None, None, Path::new("/t"), true).is_err());
        let empty_lower = vec![String::new()];
        assert!(validate_overlay(&empty_lower, None, None, Path::new("/t"), true).is_err());
    }

    #[test]
    fn test_find_modules() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("drivers/net")).unwrap();
        std::fs::write(dir.path().join("drivers/net/virtio_net.ko"), "x").unwrap();
        std::fs::write(dir.path().join("drivers/ahci.ko"), "x").unwrap();
        std::fs::write(dir.path().join("README"), "x").unwrap();

        assert_eq!(find_modules(dir.path()), vec!["ahci", "virtio_net"]);
    }
}
