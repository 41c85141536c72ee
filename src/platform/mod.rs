//! Platform-specific helpers: signals, ownership and permission fix-ups

use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::path::Path;
use std::process::{Command, Stdio};

use anyhow::{Context, Result};
use tracing::{debug, warn};

/// Owner applied to installed artifacts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Owner {
    pub uid: u32,
    pub gid: u32,
}

impl Owner {
    /// Resolve the user named by `DECKY_USER`, falling back to the current user
    pub fn resolve() -> Self {
        if let Ok(name) = std::env::var("DECKY_USER") {
            match Self::by_name(&name) {
                Some(owner) => return owner,
                None => warn!("Unknown user '{}', using the current user", name),
            }
        }
        Self::current()
    }

    /// The user this process runs as
    #[cfg(unix)]
    pub fn current() -> Self {
        // SAFETY: getuid/getgid cannot fail
        unsafe {
            Self {
                uid: libc::getuid(),
                gid: libc::getgid(),
            }
        }
    }

    #[cfg(not(unix))]
    pub fn current() -> Self {
        Self { uid: 0, gid: 0 }
    }

    #[cfg(unix)]
    fn by_name(name: &str) -> Option<Self> {
        let c_name = std::ffi::CString::new(name).ok()?;
        // SAFETY: getpwnam returns either null or a pointer to static storage
        // that stays valid until the next getpw* call on this thread
        unsafe {
            let pw = libc::getpwnam(c_name.as_ptr());
            if pw.is_null() {
                None
            } else {
                Some(Self {
                    uid: (*pw).pw_uid,
                    gid: (*pw).pw_gid,
                })
            }
        }
    }

    #[cfg(not(unix))]
    fn by_name(_name: &str) -> Option<Self> {
        None
    }
}

/// Ask a process to terminate (SIGTERM)
#[cfg(unix)]
pub fn terminate_process(pid: u32) -> Result<()> {
    let pid = i32::try_from(pid).context("PID out of range")?;
    // SAFETY: kill has no memory-safety preconditions
    let result = unsafe { libc::kill(pid, libc::SIGTERM) };
    if result == 0 {
        Ok(())
    } else {
        anyhow::bail!(
            "Failed to terminate process: {}",
            std::io::Error::last_os_error()
        )
    }
}

#[cfg(not(unix))]
pub fn terminate_process(pid: u32) -> Result<()> {
    let _ = pid;
    anyhow::bail!("Unsupported platform")
}

/// Add the execute bits to a file
#[cfg(unix)]
pub fn set_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(perms.mode() | 0o755);
    std::fs::set_permissions(path, perms)
}

#[cfg(not(unix))]
pub fn set_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Change the owner of a single path
#[cfg(unix)]
pub fn set_owner(path: &Path, owner: Owner) -> std::io::Result<()> {
    std::os::unix::fs::chown(path, Some(owner.uid), Some(owner.gid))
}

#[cfg(not(unix))]
pub fn set_owner(_path: &Path, _owner: Owner) -> std::io::Result<()> {
    Ok(())
}

/// Give the user write access to a whole tree so it can be removed
#[cfg(unix)]
pub fn make_tree_writable(root: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = std::fs::symlink_metadata(root)?;
    if metadata.file_type().is_symlink() {
        return Ok(());
    }
    let mut perms = metadata.permissions();
    perms.set_mode(perms.mode() | 0o200);
    std::fs::set_permissions(root, perms)?;

    if metadata.is_dir() {
        for entry in std::fs::read_dir(root)? {
            make_tree_writable(&entry?.path())?;
        }
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn make_tree_writable(_root: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Change the owner of a whole tree
pub fn set_tree_owner(root: &Path, owner: Owner) -> std::io::Result<()> {
    let metadata = std::fs::symlink_metadata(root)?;
    if metadata.file_type().is_symlink() {
        return Ok(());
    }
    set_owner(root, owner)?;
    if metadata.is_dir() {
        for entry in std::fs::read_dir(root)? {
            set_tree_owner(&entry?.path(), owner)?;
        }
    }
    Ok(())
}

/// Fire-and-forget a command, used to make the host loader reload the package
pub fn spawn_detached(command: &[String]) -> Result<()> {
    let (program, args) = command.split_first().context("Empty command")?;
    debug!("Spawning detached command: {}", command.join(" "));
    Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .with_context(|| format!("Failed to run {}", program))?;
    Ok(())
}

/// Best guess at the primary local IPv4 address
pub fn local_ip() -> IpAddr {
    let detect = || -> std::io::Result<IpAddr> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        // No packet is sent; connecting only selects the outbound interface
        socket.connect(("8.8.8.8", 53))?;
        Ok(socket.local_addr()?.ip())
    };
    match detect() {
        Ok(ip) => ip,
        Err(e) => {
            warn!("Failed to determine local IP address: {}", e);
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_detached_rejects_empty_command() {
        assert!(spawn_detached(&[]).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_set_executable_adds_exec_bits() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tool");
        std::fs::write(&path, b"#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).unwrap();

        set_executable(&path).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111);
    }

    #[cfg(unix)]
    #[test]
    fn test_set_tree_owner_to_current_user() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("bin")).unwrap();
        std::fs::write(dir.path().join("bin").join("core"), b"x").unwrap();

        set_tree_owner(dir.path(), Owner::current()).unwrap();
    }
}
