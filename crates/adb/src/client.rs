//! ADB client entry points
//!
//! [`AdbClient`] carries a [`TransportOption`] and exposes one async
//! method per host service. The [`blocking`] module mirrors the surface
//! for callers without a runtime: each call builds a private
//! current-thread runtime, runs the future to completion and drops the
//! runtime, which closes any socket the call still held.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

use crate::devices::{self, DeviceInfo, Features};
use crate::error::{AdbError, Result};
use crate::host;
use crate::options::{TransportOption, TransportType};
use crate::shell::{self, ShellOutput};
use crate::sync::{self, DirEntry, FileStat, SyncConnection};

/// Asynchronous ADB host client.
#[derive(Debug, Clone, Default)]
pub struct AdbClient {
    option: TransportOption,
}

impl AdbClient {
    pub fn new(option: TransportOption) -> Self {
        Self { option }
    }

    pub fn option(&self) -> &TransportOption {
        &self.option
    }

    /// Ask the server to exit. Never fails: a dead server is the goal.
    pub async fn kill(&self) {
        let Ok(mut stream) = TcpStream::connect(self.option.endpoint()).await else {
            return;
        };
        if host::send_service(&mut stream, "host:kill").await.is_err() {
            return;
        }
        // The server may still answer OKAY before exiting; consume it.
        let mut status = [0u8; 4];
        let _ = stream.read_exact(&mut status).await;
    }

    /// Run a raw service and read one framed string response.
    ///
    /// When autostart is disabled, an unreachable server yields an empty
    /// string rather than an error.
    pub async fn query(&self, service: &str) -> Result<String> {
        match host::connect(&self.option, service).await {
            Ok(mut stream) => host::read_hex_string(&mut stream).await,
            Err(AdbError::Connect(_)) if !self.option.launch_server => Ok(String::new()),
            Err(e) => Err(e),
        }
    }

    /// Run a host-scoped command, waiting only for its status.
    pub async fn command(&self, command: &str, timeout: Option<Duration>) -> Result<()> {
        let service = self.option.host_command(command);
        let mut stream = host::connect(&self.option, &service).await?;

        match timeout {
            Some(limit) => match tokio::time::timeout(limit, host::read_status(&mut stream)).await
            {
                Ok(result) => result,
                // Dropping the stream on return closes the socket.
                Err(_) => Err(AdbError::Timeout),
            },
            None => host::read_status(&mut stream).await,
        }
    }

    /// Run a host-scoped command and read one framed string response.
    ///
    /// Follows the same unreachable-server rule as [`query`](Self::query).
    pub async fn command_query(&self, command: &str) -> Result<String> {
        let service = self.option.host_command(command);
        match host::connect(&self.option, &service).await {
            Ok(mut stream) => host::read_hex_string(&mut stream).await,
            Err(AdbError::Connect(_)) if !self.option.launch_server => Ok(String::new()),
            Err(e) => Err(e),
        }
    }

    /// Open a device service and read the raw byte stream until EOF.
    pub async fn command_connect(&self, command: &str) -> Result<Vec<u8>> {
        let mut stream = host::connect(&self.option, command).await?;
        shell::read_to_end(&mut stream).await
    }

    /// Features advertised by the server for the selected transport.
    pub async fn features(&self) -> Result<Vec<String>> {
        let raw = self.command_query("features").await?;
        Ok(raw
            .split(',')
            .filter(|f| !f.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// List devices known to the server.
    pub async fn list_devices(
        &self,
        device_only: bool,
        target_serial: Option<&str>,
    ) -> Result<Vec<DeviceInfo>> {
        let raw = self.query("host:devices-l").await?;
        Ok(devices::parse_device_list(&raw, device_only, target_serial))
    }

    /// Block until a device for this transport reaches `state`.
    pub async fn wait_device(&self, state: &str, timeout: Option<Duration>) -> Result<()> {
        let target = match self.option.transport_type {
            TransportType::Usb => "usb",
            TransportType::Local => "local",
            TransportType::Any => "any",
        };
        self.command(&format!("wait-for-{target}-{state}"), timeout)
            .await
    }

    /// Run a shell command and collect its output.
    ///
    /// `force_v2` overrides feature detection; otherwise the shell
    /// protocol is used iff the server advertises `shell_v2`.
    pub async fn execute_shell(
        &self,
        command: &str,
        force_v2: Option<bool>,
    ) -> Result<ShellOutput> {
        let v2 = match force_v2 {
            Some(v2) => v2,
            None => self.features().await?.iter().any(|f| f == "shell_v2"),
        };

        let service = if v2 {
            format!("shell,v2,raw:{command}")
        } else {
            format!("shell:{command}")
        };
        let mut stream = host::connect(&self.option, &service).await?;

        if v2 {
            shell::read_shell_output(&mut stream).await
        } else {
            shell::read_raw_output(&mut stream).await
        }
    }

    /// Remount the device partitions read-write.
    pub async fn remount(&self, args: &str) -> Result<()> {
        let features = Features::from_list(&self.features().await?);

        if features.remount_shell {
            let command = format!("remount {args}");
            self.execute_shell(command.trim_end(), Some(features.shell_v2))
                .await?;
        } else {
            self.command_connect(&format!("remount:{args}")).await?;
        }
        Ok(())
    }

    /// Restart adbd with or without root, waiting for the reconnect.
    pub async fn root(&self, enable: bool) -> Result<()> {
        let service = if enable { "root:" } else { "unroot:" };
        let (mut stream, transport_id) = host::connect_with_id(&self.option, service).await?;

        // Figure out whether adbd actually restarted.
        let mut banner = [0u8; 256];
        let n = stream.read(&mut banner).await?;
        if String::from_utf8_lossy(&banner[..n]).contains("already running as root") {
            return Ok(());
        }

        // The transport we used is about to die; wait that out first.
        let mut disconnect_option = self.option.clone();
        disconnect_option.serial.clear();
        disconnect_option.transport_id = Some(transport_id);
        AdbClient::new(disconnect_option)
            .wait_device("disconnect", None)
            .await?;

        // With a pinned transport id there is nothing left to wait for:
        // the id will not come back.
        if self.option.transport_id.is_none() {
            self.wait_device("device", Some(Duration::from_secs(6)))
                .await?;
        }
        Ok(())
    }

    /// Stat a remote path.
    pub async fn sync_stat(&self, path: &str) -> Result<FileStat> {
        let features = self.server_features().await?;
        let mut conn = self.open_sync().await?;
        let st = conn.stat(path, features.stat_v2).await?;
        conn.quit().await?;
        Ok(st)
    }

    /// List a remote directory.
    pub async fn sync_list(&self, path: &str) -> Result<Vec<DirEntry>> {
        let features = self.server_features().await?;
        let mut conn = self.open_sync().await?;
        let entries = conn.list(path, features.ls_v2).await?;
        conn.quit().await?;
        Ok(entries)
    }

    /// Pull remote files or directory trees under `dst`.
    pub async fn sync_pull(&self, srcs: &[String], dst: &Path) -> Result<()> {
        let features = self.server_features().await?;
        let mut conn = self.open_sync().await?;

        let dst_meta = tokio::fs::metadata(dst).await.ok();
        let dst_exists = dst_meta.is_some();
        let dst_isdir = dst_meta.map(|m| m.is_dir()).unwrap_or(false);

        if !dst_exists {
            // A single source may pull to a not-yet-existing path, but
            // its parent directory must be there.
            if srcs.len() == 1 {
                let parent_ok = match dst.parent() {
                    Some(parent) if parent.as_os_str().is_empty() => true,
                    Some(parent) => tokio::fs::metadata(parent).await.is_ok(),
                    None => false,
                };
                if !parent_ok {
                    return Err(AdbError::sync(format!(
                        "cannot create file/directory '{}'",
                        dst.display()
                    )));
                }
            } else {
                return Err(AdbError::sync(format!(
                    "failed to access '{}'",
                    dst.display()
                )));
            }
        }
        if !dst_isdir && srcs.len() > 1 {
            return Err(AdbError::sync(format!(
                "target '{}' is not a directory",
                dst.display()
            )));
        }

        for src in srcs {
            let st = conn.stat(src, features.stat_v2).await?;

            if st.is_dir() {
                let mut dst_dir = dst.to_path_buf();
                // An existing destination receives the source directory
                // as a child.
                if dst_exists {
                    if !dst_isdir {
                        return Err(AdbError::sync(format!(
                            "target '{}' is not a directory",
                            dst.display()
                        )));
                    }
                    dst_dir.push(sync::posix_basename(src));
                }
                sync::pull_dir(&mut conn, src, &dst_dir, features).await?;
            } else if st.is_regular() {
                let mut dst_path = dst.to_path_buf();
                if dst_isdir {
                    dst_path.push(sync::posix_basename(src));
                }
                conn.recv_to_file(src, &dst_path).await?;
            }
        }

        conn.quit().await
    }

    /// Pull one remote file into memory.
    pub async fn sync_pull_buffer(&self, src: &str) -> Result<Vec<u8>> {
        let features = self.server_features().await?;
        let mut conn = self.open_sync().await?;

        let st = conn.stat(src, features.stat_v2).await?;
        if st.is_dir() {
            return Err(AdbError::sync(format!("target '{src}' is a directory")));
        }

        let buffer = conn.recv_to_buffer(src).await?;
        conn.quit().await?;
        Ok(buffer)
    }

    /// Push local files or directory trees under `dst`.
    pub async fn sync_push(&self, srcs: &[PathBuf], dst: &str) -> Result<()> {
        let features = self.server_features().await?;
        let mut conn = self.open_sync().await?;

        let (dst_exists, dst_isdir) = match conn.stat(dst, features.stat_v2).await {
            Ok(st) => (true, st.is_dir()),
            Err(_) => (false, false),
        };

        if !dst_isdir {
            if srcs.len() > 1 {
                return Err(AdbError::sync(format!("target '{dst}' is not a directory")));
            }
            // A trailing slash promises a directory; an existing
            // non-directory breaks that promise.
            if dst.ends_with('/') && dst_exists {
                return Err(AdbError::sync(format!(
                    "failed to access '{dst}': Not a directory"
                )));
            }
        }

        for src in srcs {
            let Ok(meta) = std::fs::metadata(src) else {
                continue;
            };

            if meta.is_dir() {
                let mut dst_dir = dst.to_string();
                if dst_exists {
                    if !dst_isdir {
                        return Err(AdbError::sync(format!(
                            "target '{dst}' is not a directory"
                        )));
                    }
                    let name = src
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    dst_dir = sync::posix_join(&dst_dir, &name);
                }
                self.push_dir(&mut conn, src, dst_dir, features).await?;
            } else if meta.is_file() {
                let dst_path = if dst_isdir {
                    let name = src
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    sync::posix_join(dst, &name)
                } else {
                    dst.to_string()
                };
                conn.send_file(
                    &dst_path,
                    src,
                    sync::file_mode(&meta),
                    sync::file_mtime(&meta),
                )
                .await?;
            }
        }

        conn.quit().await
    }

    /// Push an in-memory buffer to a remote file path.
    pub async fn sync_push_buffer(&self, data: &[u8], dst: &str) -> Result<()> {
        let features = self.server_features().await?;
        let mut conn = self.open_sync().await?;

        if let Ok(st) = conn.stat(dst, features.stat_v2).await {
            if st.is_dir() {
                return Err(AdbError::sync(format!("target '{dst}' is a directory")));
            }
        }

        conn.send_buffer(dst, data).await?;
        conn.quit().await
    }

    async fn push_dir(
        &self,
        conn: &mut SyncConnection,
        lpath: &Path,
        rpath: String,
        features: Features,
    ) -> Result<()> {
        let mut rpath = rpath;
        if !rpath.ends_with('/') {
            rpath.push('/');
        }

        // Every ancestor of the destination may need creating too.
        let mut directories = Vec::new();
        let mut ancestor = rpath.clone();
        while !sync::is_root_dir(&ancestor) {
            directories.push(ancestor.clone());
            ancestor = sync::posix_dirname(&ancestor);
        }
        directories.reverse();

        let files = sync::local_build_list(lpath, &rpath, &mut directories)?;

        // Older devices fail to create directories as a push side effect.
        // Pre-create them through the shell, ignoring failures (they may
        // already exist). Servers without shell_v2 choke on long command
        // lines and are not affected by the mkdir defect, so they skip
        // this entirely.
        if !features.fixed_push_mkdir && features.shell_v2 {
            for cmd in sync::mkdir_batches(&directories)? {
                let _ = self.execute_shell(&cmd, Some(true)).await;
            }
        }

        for ci in files {
            conn.send_file(&ci.rpath, &ci.lpath, ci.mode, ci.mtime).await?;
        }
        Ok(())
    }

    async fn server_features(&self) -> Result<Features> {
        Ok(Features::from_list(&self.features().await?))
    }

    async fn open_sync(&self) -> Result<SyncConnection> {
        Ok(SyncConnection::new(
            host::connect(&self.option, "sync:").await?,
        ))
    }
}

/// Blocking mirror of [`AdbClient`].
pub mod blocking {
    use super::*;

    /// Synchronous ADB host client; every call runs on its own
    /// short-lived current-thread runtime.
    #[derive(Debug, Clone, Default)]
    pub struct AdbClient {
        inner: super::AdbClient,
    }

    fn block_on<T>(
        fut: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(AdbError::Io)?;
        runtime.block_on(fut)
    }

    impl AdbClient {
        pub fn new(option: TransportOption) -> Self {
            Self {
                inner: super::AdbClient::new(option),
            }
        }

        pub fn option(&self) -> &TransportOption {
            self.inner.option()
        }

        pub fn kill(&self) {
            if let Ok(runtime) = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                runtime.block_on(self.inner.kill());
            }
        }

        pub fn query(&self, service: &str) -> Result<String> {
            block_on(self.inner.query(service))
        }

        pub fn command(&self, command: &str, timeout: Option<Duration>) -> Result<()> {
            block_on(self.inner.command(command, timeout))
        }

        pub fn command_query(&self, command: &str) -> Result<String> {
            block_on(self.inner.command_query(command))
        }

        pub fn command_connect(&self, command: &str) -> Result<Vec<u8>> {
            block_on(self.inner.command_connect(command))
        }

        pub fn features(&self) -> Result<Vec<String>> {
            block_on(self.inner.features())
        }

        pub fn list_devices(
            &self,
            device_only: bool,
            target_serial: Option<&str>,
        ) -> Result<Vec<DeviceInfo>> {
            block_on(self.inner.list_devices(device_only, target_serial))
        }

        pub fn wait_device(&self, state: &str, timeout: Option<Duration>) -> Result<()> {
            block_on(self.inner.wait_device(state, timeout))
        }

        pub fn execute_shell(
            &self,
            command: &str,
            force_v2: Option<bool>,
        ) -> Result<ShellOutput> {
            block_on(self.inner.execute_shell(command, force_v2))
        }

        pub fn remount(&self, args: &str) -> Result<()> {
            block_on(self.inner.remount(args))
        }

        pub fn root(&self, enable: bool) -> Result<()> {
            block_on(self.inner.root(enable))
        }

        pub fn sync_stat(&self, path: &str) -> Result<FileStat> {
            block_on(self.inner.sync_stat(path))
        }

        pub fn sync_list(&self, path: &str) -> Result<Vec<DirEntry>> {
            block_on(self.inner.sync_list(path))
        }

        pub fn sync_pull(&self, srcs: &[String], dst: &Path) -> Result<()> {
            block_on(self.inner.sync_pull(srcs, dst))
        }

        pub fn sync_pull_buffer(&self, src: &str) -> Result<Vec<u8>> {
            block_on(self.inner.sync_pull_buffer(src))
        }

        pub fn sync_push(&self, srcs: &[PathBuf], dst: &str) -> Result<()> {
            block_on(self.inner.sync_push(srcs, dst))
        }

        pub fn sync_push_buffer(&self, data: &[u8], dst: &str) -> Result<()> {
            block_on(self.inner.sync_push_buffer(data, dst))
        }
    }
}
