//! Mount primitives consumed by the node service.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use nix::errno::Errno;
use nix::mount::MsFlags;
use tracing::debug;

use crate::error::CsiError;

const PROC_MOUNTS: &str = "/proc/self/mounts";

/// Mount-point inspection, mounting and unmounting.
#[async_trait]
pub trait Mounter: Send + Sync {
    /// Whether `path` is currently a mount point.  A missing path is not.
    async fn is_mount_point(&self, path: &Path) -> Result<bool, CsiError>;

    /// Mount the filesystem on device `source` at the directory `target`.
    /// `options` are `mount(8)` style: `ro`, `noatime`, or filesystem data.
    async fn mount(
        &self,
        source: &str,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), CsiError>;

    /// Bind `source` at `target`, which must already exist.
    async fn bind_mount(&self, source: &str, target: &Path, read_only: bool)
    -> Result<(), CsiError>;

    /// Unmount `target`.  A missing path is not an error.
    async fn unmount(&self, target: &Path) -> Result<(), CsiError>;
}

/// [`Mounter`] using the host's mount table and `mount(2)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemMounter;

#[async_trait]
impl Mounter for SystemMounter {
    async fn is_mount_point(&self, path: &Path) -> Result<bool, CsiError> {
        let contents = match tokio::fs::read_to_string(PROC_MOUNTS).await {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(CsiError::Internal(format!("read {PROC_MOUNTS}: {e}"))),
        };
        let Some(resolved) = resolve(path).await? else {
            return Ok(false);
        };
        Ok(is_listed(&contents, &resolved))
    }

    async fn mount(
        &self,
        source: &str,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), CsiError> {
        let (flags, data) = split_options(options);
        nix::mount::mount(Some(source), target, Some(fs_type), flags, data.as_deref())
            .map_err(|e| CsiError::MountFailed {
                path: target.display().to_string(),
                reason: format!("{fs_type} from {source}: {e}"),
            })?;
        debug!(source, target = %target.display(), fs_type, ?options, "mounted");
        Ok(())
    }

    async fn bind_mount(
        &self,
        source: &str,
        target: &Path,
        read_only: bool,
    ) -> Result<(), CsiError> {
        let mount_err = |reason: String| CsiError::MountFailed {
            path: target.display().to_string(),
            reason,
        };

        let mut flags = MsFlags::MS_BIND;
        if read_only {
            flags |= MsFlags::MS_RDONLY;
        }
        nix::mount::mount(Some(source), target, None::<&str>, flags, None::<&str>)
            .map_err(|e| mount_err(e.to_string()))?;

        // MS_RDONLY is ignored on the initial bind; it only sticks on remount.
        if read_only {
            nix::mount::mount(
                None::<&str>,
                target,
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
                None::<&str>,
            )
            .map_err(|e| mount_err(format!("remount read-only: {e}")))?;
        }
        debug!(source, target = %target.display(), read_only, "bind mounted");
        Ok(())
    }

    async fn unmount(&self, target: &Path) -> Result<(), CsiError> {
        match nix::mount::umount(target) {
            Ok(()) => Ok(()),
            Err(Errno::ENOENT) => Ok(()),
            Err(e) => Err(CsiError::UnmountFailed {
                path: target.display().to_string(),
                reason: e.to_string(),
            }),
        }
    }
}

/// `path` with symlinks and trailing separators resolved, or `None` if it
/// does not exist.
async fn resolve(path: &Path) -> Result<Option<PathBuf>, CsiError> {
    match tokio::fs::canonicalize(path).await {
        Ok(resolved) => Ok(Some(resolved)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(CsiError::Internal(format!(
            "resolve {}: {e}",
            path.display()
        ))),
    }
}

fn is_listed(table: &str, path: &Path) -> bool {
    mount_points(table).any(|mp| Path::new(&mp) == path)
}

/// Split `mount(8)` options into `mount(2)` flags and the remaining
/// comma-separated filesystem data.
fn split_options(options: &[String]) -> (MsFlags, Option<String>) {
    let mut flags = MsFlags::empty();
    let mut data = Vec::new();
    for option in options {
        match option.as_str() {
            "rw" | "defaults" => {}
            "ro" => flags |= MsFlags::MS_RDONLY,
            "noatime" => flags |= MsFlags::MS_NOATIME,
            "nodiratime" => flags |= MsFlags::MS_NODIRATIME,
            "relatime" => flags |= MsFlags::MS_RELATIME,
            "nosuid" => flags |= MsFlags::MS_NOSUID,
            "nodev" => flags |= MsFlags::MS_NODEV,
            "noexec" => flags |= MsFlags::MS_NOEXEC,
            "sync" => flags |= MsFlags::MS_SYNCHRONOUS,
            other => data.push(other),
        }
    }
    (flags, (!data.is_empty()).then(|| data.join(",")))
}

/// Mount points listed in a `/proc/*/mounts` table, with octal escapes
/// (`\040` for space) decoded.
fn mount_points(table: &str) -> impl Iterator<Item = String> + '_ {
    // Format: <device> <mountpoint> <fstype> <options> <dump> <pass>
    table
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(unescape_octal)
}

fn unescape_octal(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while let Some(&byte) = bytes.get(i) {
        if byte == b'\\'
            && let Some(digits) = bytes.get(i + 1..i + 4)
            && digits.iter().all(|b| (b'0'..=b'7').contains(b))
            && let Ok(value) = u8::try_from(
                digits
                    .iter()
                    .fold(0u16, |acc, d| acc * 8 + u16::from(d - b'0')),
            )
        {
            out.push(value);
            i += 4;
        } else {
            out.push(byte);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = "\
overlay / overlay rw,relatime 0 0
proc /proc proc rw,nosuid,nodev,noexec,relatime 0 0
/dev/vdb /var/lib/kubelet/pods/p1/volumes/data\\0401 ext4 rw 0 0
";

    #[test]
    fn lists_mount_points() {
        let points: Vec<String> = mount_points(TABLE).collect();
        assert_eq!(
            points,
            ["/", "/proc", "/var/lib/kubelet/pods/p1/volumes/data 1"]
        );
    }

    #[test]
    fn unescapes_octal_sequences() {
        assert_eq!(unescape_octal("a\\040b"), "a b");
        assert_eq!(unescape_octal("tab\\011"), "tab\t");
        assert_eq!(unescape_octal("trailing\\04"), "trailing\\04");
    }

    #[test]
    fn listed_ignores_trailing_separator() {
        assert!(is_listed(TABLE, Path::new("/proc/")));
        assert!(is_listed(
            TABLE,
            Path::new("/var/lib/kubelet/pods/p1/volumes/data 1")
        ));
        assert!(!is_listed(TABLE, Path::new("/var/lib/kubelet")));
    }

    #[test]
    fn options_split_into_flags_and_data() {
        let options: Vec<String> = ["ro", "noatime", "discard", "errors=remount-ro"]
            .map(String::from)
            .to_vec();
        let (flags, data) = split_options(&options);
        assert_eq!(flags, MsFlags::MS_RDONLY | MsFlags::MS_NOATIME);
        assert_eq!(data.as_deref(), Some("discard,errors=remount-ro"));

        let (flags, data) = split_options(&["defaults".to_owned()]);
        assert!(flags.is_empty());
        assert_eq!(data, None);
    }

    #[tokio::test]
    async fn symlinked_path_resolves_to_its_target() {
        let tmp = tempfile::tempdir().unwrap();
        let real = tmp.path().join("real");
        std::fs::create_dir(&real).unwrap();
        let link = tmp.path().join("link");
        std::os::unix::fs::symlink(&real, &link).unwrap();

        let expected = std::fs::canonicalize(&real).unwrap();
        assert_eq!(resolve(&link).await.unwrap(), Some(expected.clone()));
        let trailing = PathBuf::from(format!("{}/", link.display()));
        assert_eq!(resolve(&trailing).await.unwrap(), Some(expected));
        assert_eq!(resolve(&tmp.path().join("absent")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn missing_path_is_not_a_mount_point() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("never-created");
        assert!(!SystemMounter.is_mount_point(&missing).await.unwrap());
        assert!(!SystemMounter.is_mount_point(tmp.path()).await.unwrap());
    }
}
