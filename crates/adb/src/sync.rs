//! ADB sync subprotocol
//!
//! Opened by requesting the `sync:` service; from then on all traffic is
//! 8-byte requests (4-byte ASCII id + 4-byte little-endian argument)
//! plus payload. Data flows in chunks of at most 64 KiB. Directory
//! transfers walk an explicit work list, so depth is bounded by the
//! remote filesystem rather than the stack.

use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::devices::Features;
use crate::error::{AdbError, Result};

const fn mkid(tag: &[u8; 4]) -> u32 {
    u32::from_le_bytes(*tag)
}

const ID_LSTAT_V1: u32 = mkid(b"STAT");
const ID_STAT_V2: u32 = mkid(b"STA2");
const ID_LSTAT_V2: u32 = mkid(b"LST2");
const ID_LIST_V1: u32 = mkid(b"LIST");
const ID_LIST_V2: u32 = mkid(b"LIS2");
const ID_DENT_V1: u32 = mkid(b"DENT");
const ID_DENT_V2: u32 = mkid(b"DNT2");
const ID_SEND_V1: u32 = mkid(b"SEND");
const ID_SEND_V2: u32 = mkid(b"SND2");
const ID_RECV_V1: u32 = mkid(b"RECV");
const ID_RECV_V2: u32 = mkid(b"RCV2");
const ID_DONE: u32 = mkid(b"DONE");
const ID_DATA: u32 = mkid(b"DATA");
const ID_OKAY: u32 = mkid(b"OKAY");
const ID_FAIL: u32 = mkid(b"FAIL");
const ID_QUIT: u32 = mkid(b"QUIT");

/// Largest DATA chunk either side may send.
pub(crate) const SYNC_DATA_MAX: usize = 64 * 1024;
/// Longest remote path (including the `,mode` suffix on SEND).
const MAX_PATH_LENGTH: usize = 1024;

fn id_name(id: u32) -> String {
    match id {
        ID_LSTAT_V1 => "STAT".into(),
        ID_STAT_V2 => "STA2".into(),
        ID_LSTAT_V2 => "LST2".into(),
        ID_LIST_V1 => "LIST".into(),
        ID_LIST_V2 => "LIS2".into(),
        ID_DENT_V1 => "DENT".into(),
        ID_DENT_V2 => "DNT2".into(),
        ID_SEND_V1 => "SEND".into(),
        ID_SEND_V2 => "SND2".into(),
        ID_RECV_V1 => "RECV".into(),
        ID_RECV_V2 => "RCV2".into(),
        ID_DONE => "DONE".into(),
        ID_DATA => "DATA".into(),
        ID_OKAY => "OKAY".into(),
        ID_FAIL => "FAIL".into(),
        ID_QUIT => "QUIT".into(),
        other => format!("{other:#010x}"),
    }
}

// Remote mode bits (POSIX layout regardless of the local platform).
const S_IFMT: u32 = 0o170000;
const S_IFDIR: u32 = 0o040000;
const S_IFREG: u32 = 0o100000;
const S_IFLNK: u32 = 0o120000;

pub(crate) fn mode_is_dir(mode: u32) -> bool {
    mode & S_IFMT == S_IFDIR
}

pub(crate) fn mode_is_regular(mode: u32) -> bool {
    mode & S_IFMT == S_IFREG
}

pub(crate) fn mode_is_symlink(mode: u32) -> bool {
    mode & S_IFMT == S_IFLNK
}

/// Stat of a remote path. v1 servers only fill `mode`, `size` and the
/// time fields; the rest arrive with `stat_v2`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileStat {
    pub dev: u64,
    pub ino: u64,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
}

impl FileStat {
    pub fn is_dir(&self) -> bool {
        mode_is_dir(self.mode)
    }

    pub fn is_regular(&self) -> bool {
        mode_is_regular(self.mode)
    }

    pub fn is_symlink(&self) -> bool {
        mode_is_symlink(self.mode)
    }

    pub fn is_exe(&self) -> bool {
        self.mode & 0o111 != 0
    }
}

/// One entry of a remote directory listing.
#[derive(Debug, Clone, Default)]
pub struct DirEntry {
    pub name: String,
    pub mode: u32,
    pub size: u32,
    pub mtime: u32,
}

/// A file queued for a directory push.
#[derive(Debug, Clone)]
pub(crate) struct CopyInfo {
    pub lpath: PathBuf,
    pub rpath: String,
    pub mode: u32,
    pub mtime: u32,
}

fn u32_at(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(buf[off..off + 4].try_into().unwrap())
}

fn u64_at(buf: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(buf[off..off + 8].try_into().unwrap())
}

fn i64_at(buf: &[u8], off: usize) -> i64 {
    i64::from_le_bytes(buf[off..off + 8].try_into().unwrap())
}

fn push_frame(buf: &mut Vec<u8>, id: u32, arg: u32) {
    buf.extend_from_slice(&id.to_le_bytes());
    buf.extend_from_slice(&arg.to_le_bytes());
}

/// A socket switched into the sync service.
pub(crate) struct SyncConnection {
    stream: TcpStream,
}

impl SyncConnection {
    pub(crate) fn new(stream: TcpStream) -> Self {
        Self { stream }
    }

    async fn send_request(&mut self, id: u32, path: &str) -> Result<()> {
        if path.len() > MAX_PATH_LENGTH {
            return Err(AdbError::sync("sync path length too long"));
        }

        let mut buf = Vec::with_capacity(8 + path.len());
        push_frame(&mut buf, id, path.len() as u32);
        buf.extend_from_slice(path.as_bytes());
        self.stream.write_all(&buf).await?;
        Ok(())
    }

    async fn read_response(&mut self) -> Result<(u32, u32)> {
        let mut buf = [0u8; 8];
        self.stream.read_exact(&mut buf).await?;
        Ok((u32_at(&buf, 0), u32_at(&buf, 4)))
    }

    /// Stat without following a symlink at the end of the path.
    pub(crate) async fn lstat(&mut self, path: &str, stat_v2: bool) -> Result<FileStat> {
        let id = if stat_v2 { ID_LSTAT_V2 } else { ID_LSTAT_V1 };
        self.send_request(id, path).await?;
        self.finish_stat(stat_v2).await
    }

    /// Stat a remote path.
    ///
    /// v1 servers report symlinks as such with no way to follow them, so
    /// the target kind is probed by stat'ing the directory form; a failed
    /// probe means a regular file.
    pub(crate) async fn stat(&mut self, path: &str, stat_v2: bool) -> Result<FileStat> {
        let id = if stat_v2 { ID_STAT_V2 } else { ID_LSTAT_V1 };
        self.send_request(id, path).await?;
        let mut st = self.finish_stat(stat_v2).await?;

        if !stat_v2 && st.is_symlink() {
            st.size = 0;
            st.mode &= !S_IFMT;
            match self.lstat(&format!("{path}/"), stat_v2).await {
                Ok(probe) if mode_is_dir(probe.mode) => st.mode |= S_IFDIR,
                _ => st.mode |= S_IFREG,
            }
        }

        Ok(st)
    }

    async fn finish_stat(&mut self, stat_v2: bool) -> Result<FileStat> {
        if stat_v2 {
            let (id, error) = self.read_response().await?;
            let mut body = [0u8; 64];
            self.stream.read_exact(&mut body).await?;

            if id != ID_LSTAT_V2 && id != ID_STAT_V2 {
                return Err(AdbError::sync(format!(
                    "stat response has wrong message id {}",
                    id_name(id)
                )));
            }
            if error != 0 {
                return Err(AdbError::sync_code("sync stat failed", error as i32));
            }

            Ok(FileStat {
                dev: u64_at(&body, 0),
                ino: u64_at(&body, 8),
                mode: u32_at(&body, 16),
                nlink: u32_at(&body, 20),
                uid: u32_at(&body, 24),
                gid: u32_at(&body, 28),
                size: u64_at(&body, 32),
                atime: i64_at(&body, 40),
                mtime: i64_at(&body, 48),
                ctime: i64_at(&body, 56),
            })
        } else {
            let mut body = [0u8; 16];
            self.stream.read_exact(&mut body).await?;

            let id = u32_at(&body, 0);
            if id != ID_LSTAT_V1 {
                return Err(AdbError::sync(format!(
                    "stat response has wrong message id {}",
                    id_name(id)
                )));
            }

            let mtime = u32_at(&body, 12) as i64;
            Ok(FileStat {
                mode: u32_at(&body, 4),
                size: u32_at(&body, 8) as u64,
                mtime,
                ctime: mtime,
                ..Default::default()
            })
        }
    }

    /// List a remote directory.
    pub(crate) async fn list(&mut self, path: &str, ls_v2: bool) -> Result<Vec<DirEntry>> {
        self.send_request(if ls_v2 { ID_LIST_V2 } else { ID_LIST_V1 }, path)
            .await?;

        let record_len = if ls_v2 { 72 } else { 16 };
        let expected_id = if ls_v2 { ID_DENT_V2 } else { ID_DENT_V1 };
        let mut out = Vec::new();

        loop {
            let mut record = [0u8; 76];
            self.stream.read_exact(&mut record[..record_len + 4]).await?;

            let id = u32_at(&record, 0);
            if id == ID_DONE {
                break;
            }
            if id != expected_id {
                return Err(AdbError::sync(format!(
                    "unexpected {} in directory listing",
                    id_name(id)
                )));
            }

            let namelen = u32_at(&record, record_len) as usize;
            if namelen > 255 {
                return Err(AdbError::sync("directory entry name too long"));
            }
            let mut name = vec![0u8; namelen];
            self.stream.read_exact(&mut name).await?;

            let entry = if ls_v2 {
                DirEntry {
                    name: String::from_utf8_lossy(&name).into_owned(),
                    mode: u32_at(&record, 24),
                    size: u64_at(&record, 40) as u32,
                    mtime: i64_at(&record, 56) as u32,
                }
            } else {
                DirEntry {
                    name: String::from_utf8_lossy(&name).into_owned(),
                    mode: u32_at(&record, 4),
                    size: u32_at(&record, 8),
                    mtime: u32_at(&record, 12),
                }
            };
            out.push(entry);
        }

        Ok(out)
    }

    /// Pull one remote file into a local file. A partial local file is
    /// removed on failure.
    pub(crate) async fn recv_to_file(&mut self, rpath: &str, lpath: &Path) -> Result<()> {
        self.send_request(ID_RECV_V1, rpath).await?;

        let mut file = tokio::fs::File::create(lpath).await?;
        let result = async {
            loop {
                let (id, len) = self.read_response().await?;
                if id == ID_DONE {
                    return Ok(());
                }
                if id != ID_DATA {
                    return Err(AdbError::sync(format!(
                        "unexpected {} in sync recv",
                        id_name(id)
                    )));
                }
                let len = len as usize;
                if len > SYNC_DATA_MAX {
                    return Err(AdbError::sync("sync recv chunk too large"));
                }
                let mut buf = vec![0u8; len];
                self.stream.read_exact(&mut buf).await?;
                file.write_all(&buf).await?;
            }
        }
        .await;

        match result {
            Ok(()) => {
                file.flush().await?;
                Ok(())
            }
            Err(e) => {
                drop(file);
                let _ = tokio::fs::remove_file(lpath).await;
                Err(e)
            }
        }
    }

    /// Pull one remote file into memory.
    pub(crate) async fn recv_to_buffer(&mut self, rpath: &str) -> Result<Vec<u8>> {
        self.send_request(ID_RECV_V1, rpath).await?;

        let mut out = Vec::new();
        loop {
            let (id, len) = self.read_response().await?;
            if id == ID_DONE {
                return Ok(out);
            }
            if id != ID_DATA {
                return Err(AdbError::sync(format!(
                    "unexpected {} in sync recv",
                    id_name(id)
                )));
            }
            let len = len as usize;
            if len > SYNC_DATA_MAX {
                return Err(AdbError::sync("sync recv chunk too large"));
            }

            let start = out.len();
            out.resize(start + len, 0);
            self.stream.read_exact(&mut out[start..]).await?;
        }
    }

    /// Push an in-memory buffer to a remote path with mode 0777.
    pub(crate) async fn send_buffer(&mut self, rpath: &str, data: &[u8]) -> Result<()> {
        let path_and_mode = format!("{rpath},{}", 0o777);
        if path_and_mode.len() > MAX_PATH_LENGTH {
            return Err(AdbError::sync("sync path length too long"));
        }

        if data.len() < SYNC_DATA_MAX {
            // Small transfer: request, payload and trailer in one write.
            let mut buf = Vec::with_capacity(24 + path_and_mode.len() + data.len());
            push_frame(&mut buf, ID_SEND_V1, path_and_mode.len() as u32);
            buf.extend_from_slice(path_and_mode.as_bytes());
            push_frame(&mut buf, ID_DATA, data.len() as u32);
            buf.extend_from_slice(data);
            push_frame(&mut buf, ID_DONE, 0);
            self.stream.write_all(&buf).await?;
        } else {
            self.send_request(ID_SEND_V1, &path_and_mode).await?;
            for chunk in data.chunks(SYNC_DATA_MAX) {
                let mut frame = Vec::with_capacity(8 + chunk.len());
                push_frame(&mut frame, ID_DATA, chunk.len() as u32);
                frame.extend_from_slice(chunk);
                self.stream.write_all(&frame).await?;
            }
            let mut done = Vec::with_capacity(8);
            push_frame(&mut done, ID_DONE, 0);
            self.stream.write_all(&done).await?;
        }

        self.finish_send().await
    }

    /// Push one local file to a remote path.
    pub(crate) async fn send_file(
        &mut self,
        rpath: &str,
        lpath: &Path,
        mode: u32,
        mtime: u32,
    ) -> Result<()> {
        let path_and_mode = format!("{rpath},{mode}");
        if path_and_mode.len() > MAX_PATH_LENGTH {
            return Err(AdbError::sync("sync path length too long"));
        }

        let mut file = tokio::fs::File::open(lpath).await?;
        let mut chunk = vec![0u8; SYNC_DATA_MAX];
        let mut n = read_full(&mut file, &mut chunk).await?;

        if n < SYNC_DATA_MAX {
            let mut buf = Vec::with_capacity(24 + path_and_mode.len() + n);
            push_frame(&mut buf, ID_SEND_V1, path_and_mode.len() as u32);
            buf.extend_from_slice(path_and_mode.as_bytes());
            push_frame(&mut buf, ID_DATA, n as u32);
            buf.extend_from_slice(&chunk[..n]);
            push_frame(&mut buf, ID_DONE, mtime);
            self.stream.write_all(&buf).await?;
        } else {
            self.send_request(ID_SEND_V1, &path_and_mode).await?;
            loop {
                let mut frame = Vec::with_capacity(8 + n);
                push_frame(&mut frame, ID_DATA, n as u32);
                frame.extend_from_slice(&chunk[..n]);
                self.stream.write_all(&frame).await?;

                n = read_full(&mut file, &mut chunk).await?;
                if n == 0 {
                    break;
                }
            }
            let mut done = Vec::with_capacity(8);
            push_frame(&mut done, ID_DONE, mtime);
            self.stream.write_all(&done).await?;
        }

        self.finish_send().await
    }

    async fn finish_send(&mut self) -> Result<()> {
        let (id, arg) = self.read_response().await?;

        if id == ID_OKAY {
            if arg != 0 {
                return Err(AdbError::sync(format!("received OKAY with length {arg}")));
            }
            return Ok(());
        }
        if id != ID_FAIL {
            return Err(AdbError::sync(format!(
                "unexpected {} from daemon",
                id_name(id)
            )));
        }

        let len = arg as usize;
        if len > SYNC_DATA_MAX {
            return Err(AdbError::sync("oversize error message from daemon"));
        }
        let mut msg = vec![0u8; len];
        self.stream.read_exact(&mut msg).await?;
        Err(AdbError::sync(String::from_utf8_lossy(&msg).into_owned()))
    }

    /// Announce teardown; sent before the socket is dropped.
    pub(crate) async fn quit(&mut self) -> Result<()> {
        self.send_request(ID_QUIT, "").await
    }
}

async fn read_full(file: &mut tokio::fs::File, buf: &mut [u8]) -> Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        let n = file.read(&mut buf[total..]).await?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}

/// Pull a remote directory tree under a local directory.
///
/// Directories are created before their contents; symlinked entries are
/// resolved by stat and routed to the file or directory path.
pub(crate) async fn pull_dir(
    conn: &mut SyncConnection,
    rpath: &str,
    lpath: &Path,
    features: Features,
) -> Result<()> {
    let mut root = rpath.to_string();
    if !root.ends_with('/') {
        root.push('/');
    }

    let mut pending = vec![(root, lpath.to_path_buf())];
    while let Some((rdir, ldir)) = pending.pop() {
        tokio::fs::create_dir_all(&ldir).await.map_err(|e| {
            AdbError::sync(format!("failed to create directory '{}': {e}", ldir.display()))
        })?;

        for entry in conn.list(&rdir, features.ls_v2).await? {
            if entry.name == "." || entry.name == ".." {
                continue;
            }

            let crpath = posix_join(&rdir, &entry.name);
            let clpath = ldir.join(&entry.name);

            if mode_is_dir(entry.mode) {
                pending.push((crpath, clpath));
            } else if mode_is_symlink(entry.mode) {
                match conn.stat(&crpath, features.stat_v2).await {
                    Ok(st) if st.is_dir() => pending.push((crpath, clpath)),
                    Ok(_) => conn.recv_to_file(&crpath, &clpath).await?,
                    Err(_) => {} // dangling link, skipped
                }
            } else if mode_is_regular(entry.mode) {
                conn.recv_to_file(&crpath, &clpath).await?;
            }
        }
    }

    Ok(())
}

/// Walk a local directory tree, appending every directory's remote path
/// to `directories` and returning the files to transfer.
pub(crate) fn local_build_list(
    lroot: &Path,
    rroot: &str,
    directories: &mut Vec<String>,
) -> Result<Vec<CopyInfo>> {
    let mut files = Vec::new();
    let mut pending = vec![(lroot.to_path_buf(), rroot.to_string())];

    while let Some((ldir, rdir)) = pending.pop() {
        let entries = std::fs::read_dir(&ldir)
            .map_err(|e| AdbError::sync(format!("cannot list '{}': {e}", ldir.display())))?;

        for entry in entries {
            let Ok(entry) = entry else {
                continue;
            };
            // DirEntry::metadata does not traverse symlinks.
            let Ok(meta) = entry.metadata() else {
                continue;
            };

            let name = entry.file_name().to_string_lossy().into_owned();
            let crpath = posix_join(&rdir, &name);

            if meta.is_dir() {
                directories.push(crpath.clone());
                pending.push((entry.path(), crpath));
            } else if meta.is_file() {
                files.push(CopyInfo {
                    lpath: entry.path(),
                    rpath: crpath,
                    mode: file_mode(&meta),
                    mtime: file_mtime(&meta),
                });
            }
        }
    }

    Ok(files)
}

#[cfg(unix)]
pub(crate) fn file_mode(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::MetadataExt;
    meta.mode()
}

#[cfg(not(unix))]
pub(crate) fn file_mode(_meta: &std::fs::Metadata) -> u32 {
    S_IFREG | 0o644
}

pub(crate) fn file_mtime(meta: &std::fs::Metadata) -> u32 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// Batch `mkdir` arguments under a conservative command-line limit.
/// Returns the shell commands to run; an empty input yields none.
pub(crate) fn mkdir_batches(directories: &[String]) -> Result<Vec<String>> {
    // The shell limit is 64 KiB, but other text rides along on the line.
    const MAX_CMD: usize = 32768;

    let mut out = Vec::new();
    let mut cmd = String::from("mkdir");

    for dir in directories {
        let escaped = escape_arg(dir);
        if escaped.len() > 16384 {
            return Err(AdbError::sync(format!("path too long: {escaped}")));
        }
        if cmd.len() + escaped.len() > MAX_CMD {
            out.push(std::mem::replace(&mut cmd, String::from("mkdir")));
        }
        cmd.push(' ');
        cmd.push_str(&escaped);
    }

    if cmd != "mkdir" {
        out.push(cmd);
    }
    Ok(out)
}

/// Single-quote a shell argument, closing and reopening the quotes
/// around any embedded single quote.
pub(crate) fn escape_arg(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        if c == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(c);
        }
    }
    out.push('\'');
    out
}

/// `dirname("//foo")` is `"//"`, so a plain `== "/"` check is not enough.
pub(crate) fn is_root_dir(path: &str) -> bool {
    !path.is_empty() && path.chars().all(|c| c == '/')
}

pub(crate) fn posix_dirname(path: &str) -> String {
    let trimmed = path.strip_suffix('/').unwrap_or(path);
    let parent = match trimmed.rfind('/') {
        Some(pos) => &trimmed[..pos + 1],
        None => trimmed,
    };
    if parent.is_empty() {
        "/".to_string()
    } else {
        parent.to_string()
    }
}

pub(crate) fn posix_basename(path: &str) -> String {
    match path.rfind('/') {
        Some(pos) => path[pos + 1..].to_string(),
        None => path.to_string(),
    }
}

pub(crate) fn posix_join(path: &str, name: &str) -> String {
    let mut out = path.to_string();
    if !out.ends_with('/') {
        out.push('/');
    }
    out.push_str(name);
    out
}
