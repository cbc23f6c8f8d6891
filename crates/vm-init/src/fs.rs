//! Root filesystem assembly: squashfs base + ext4 overlay → overlayfs,
//! then pivot_root and the virtual filesystems.

use std::fs;
use std::io;
use std::path::Path;

use nix::mount::{MntFlags, MsFlags, mount, umount2};
use nix::unistd::{chdir, pivot_root};

#[derive(Debug)]
pub enum FsError {
    Mount { target: String, source: nix::Error },
    Mkdir { path: String, source: io::Error },
    Chdir { path: String, source: nix::Error },
    PivotRoot(nix::Error),
    MoveMount { from: String, to: String, source: nix::Error },
}

impl std::fmt::Display for FsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mount { target, source } => write!(f, "mount {target}: {source}"),
            Self::Mkdir { path, source } => write!(f, "mkdir {path}: {source}"),
            Self::Chdir { path, source } => write!(f, "chdir {path}: {source}"),
            Self::PivotRoot(e) => write!(f, "pivot_root: {e}"),
            Self::MoveMount { from, to, source } => {
                write!(f, "move mount {from} -> {to}: {source}")
            }
        }
    }
}

impl std::error::Error for FsError {}

fn mkdir_all(path: &str) -> Result<(), FsError> {
    fs::create_dir_all(path).map_err(|e| FsError::Mkdir {
        path: path.into(),
        source: e,
    })
}

fn do_mount(
    source: Option<&str>,
    target: &str,
    fstype: Option<&str>,
    flags: MsFlags,
    data: Option<&str>,
) -> Result<(), FsError> {
    mount(source, target, fstype, flags, data).map_err(|e| FsError::Mount {
        target: target.into(),
        source: e,
    })
}

fn move_mount(from: &str, to: &str) -> Result<(), FsError> {
    mount(Some(from), to, None::<&str>, MsFlags::MS_MOVE, None::<&str>).map_err(|e| {
        FsError::MoveMount {
            from: from.into(),
            to: to.into(),
            source: e,
        }
    })
}

/// Build the merged root and pivot into it.
pub fn assemble_root() -> Result<(), FsError> {
    // Read-only base and writable layer.
    do_mount(
        Some("/dev/vda"),
        "/rom",
        Some("squashfs"),
        MsFlags::MS_RDONLY,
        None,
    )?;
    do_mount(Some("/dev/vdb"), "/rw", Some("ext4"), MsFlags::empty(), None)?;

    mkdir_all("/rw/upper")?;
    mkdir_all("/rw/work")?;

    do_mount(
        Some("overlay"),
        "/mnt/root",
        Some("overlay"),
        MsFlags::empty(),
        Some("lowerdir=/rom,upperdir=/rw/upper,workdir=/rw/work"),
    )?;

    mkdir_all("/mnt/root/oldroot")?;
    chdir(Path::new("/mnt/root")).map_err(|e| FsError::Chdir {
        path: "/mnt/root".into(),
        source: e,
    })?;
    pivot_root(".", "oldroot").map_err(FsError::PivotRoot)?;

    // Carry the layer mounts and /dev across the pivot, then detach the old
    // root.
    let _ = fs::create_dir_all("/rom");
    let _ = fs::create_dir_all("/rw");
    move_mount("/oldroot/rom", "/rom")?;
    move_mount("/oldroot/rw", "/rw")?;
    move_mount("/oldroot/dev", "/dev")?;
    let _ = umount2("/oldroot", MntFlags::MNT_DETACH);

    do_mount(Some("proc"), "/proc", Some("proc"), MsFlags::empty(), None)?;
    do_mount(Some("sys"), "/sys", Some("sysfs"), MsFlags::empty(), None)?;

    // SAFETY: we are the init process; no other threads exist yet.
    unsafe {
        std::env::set_var(
            "PATH",
            "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin",
        );
        std::env::set_var("HOME", "/home/user");
        std::env::set_var("USER", "user");
    }
    let _ = std::env::set_current_dir("/home/user");

    eprintln!("[vm-init] root assembled");
    Ok(())
}
