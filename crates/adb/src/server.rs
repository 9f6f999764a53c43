//! ADB server autostart
//!
//! When a connect is refused and the caller allows it, the client spawns
//! `adb fork-server server --reply-fd <fd>` detached and waits for the
//! three-byte `OK\n` acknowledgement on a pipe. At most one autostart is
//! attempted per process lifetime; the spawned server is not owned by
//! this process and outlives it.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::info;

use crate::error::{AdbError, Result};

static LAUNCH_TRIED: AtomicBool = AtomicBool::new(false);

/// Claim the process-wide autostart attempt. Returns false if some call
/// already tried (successfully or not).
pub(crate) fn claim_launch_attempt() -> bool {
    !LAUNCH_TRIED.swap(true, Ordering::SeqCst)
}

/// Spawn a local ADB server and wait until it is listening.
pub(crate) async fn launch_server() -> Result<()> {
    tokio::task::spawn_blocking(launch_server_process)
        .await
        .map_err(|_| AdbError::Connect("adb server launch task failed".into()))?
}

fn find_adb() -> Option<PathBuf> {
    let exe = if cfg!(windows) { "adb.exe" } else { "adb" };
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(exe))
        .find(|candidate| candidate.is_file())
}

#[cfg(unix)]
fn launch_server_process() -> Result<()> {
    use std::io::Read;
    use std::os::fd::FromRawFd;
    use std::os::unix::process::CommandExt;
    use std::process::{Command, Stdio};

    let Some(adb) = find_adb() else {
        return Err(AdbError::Connect("adb binary not found on PATH".into()));
    };

    let mut fds = [0i32; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(AdbError::Connect("failed to create reply pipe".into()));
    }
    let (read_fd, write_fd) = (fds[0], fds[1]);
    // Owns read_fd from here on.
    let mut ack_reader = unsafe { std::fs::File::from_raw_fd(read_fd) };

    let mut cmd = Command::new(&adb);
    cmd.arg("fork-server")
        .arg("server")
        .arg("--reply-fd")
        .arg(write_fd.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    unsafe {
        cmd.pre_exec(move || {
            // The reply fd must survive exec; the read side must not.
            let flags = libc::fcntl(write_fd, libc::F_GETFD);
            if flags >= 0 {
                libc::fcntl(write_fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC);
            }
            libc::close(read_fd);
            Ok(())
        });
    }

    let spawned = cmd.spawn();
    unsafe { libc::close(write_fd) };
    let child = spawned.map_err(|e| AdbError::Connect(format!("failed to spawn adb server: {e}")))?;

    let mut ack = [0u8; 3];
    ack_reader
        .read_exact(&mut ack)
        .map_err(|_| AdbError::Connect("adb server did not acknowledge startup".into()))?;
    if &ack != b"OK\n" {
        return Err(AdbError::Connect("adb server reported startup failure".into()));
    }

    info!(pid = child.id(), "autostarted adb server");
    // The server process is intentionally left running and unreaped.
    drop(child);
    Ok(())
}

#[cfg(windows)]
fn launch_server_process() -> Result<()> {
    use std::process::{Command, Stdio};

    let Some(adb) = find_adb() else {
        return Err(AdbError::Connect("adb binary not found on PATH".into()));
    };

    // Handing a raw reply handle through CreateProcess is not expressible
    // with std::process; `start-server` blocks until the daemon listens,
    // which is the part callers depend on.
    let status = Command::new(&adb)
        .arg("start-server")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map_err(|e| AdbError::Connect(format!("failed to spawn adb server: {e}")))?;

    if !status.success() {
        return Err(AdbError::Connect("adb server reported startup failure".into()));
    }

    info!("autostarted adb server");
    Ok(())
}
