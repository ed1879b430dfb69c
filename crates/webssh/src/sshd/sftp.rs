//! The `sftp` subsystem, served from the local filesystem.
//!
//! Relative paths resolve against the configured working directory (or the
//! process working directory). Absolute paths are used as given: a user
//! who can reach this subsystem already has a shell.

use std::collections::HashMap;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use russh::ChannelStream;
use russh::server::Msg;
use russh_sftp::protocol::{
    Attrs, Data, File, FileAttributes, Handle, Name, OpenFlags, Status, StatusCode, Version,
};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::oneshot;
use tracing::{debug, trace};

enum OpenEntry {
    File(fs::File),
    Dir { path: PathBuf, listed: bool },
}

/// Per-channel SFTP server state.
pub(crate) struct SftpHandler {
    root: PathBuf,
    handles: HashMap<String, OpenEntry>,
    next_handle: u64,
    // Dropped together with the handler when the session ends.
    _done: oneshot::Sender<()>,
}

impl SftpHandler {
    pub fn new(root: PathBuf, done: oneshot::Sender<()>) -> Self {
        Self {
            root,
            handles: HashMap::new(),
            next_handle: 0,
            _done: done,
        }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        if path.is_empty() || path == "." {
            self.root.clone()
        } else {
            self.root.join(path)
        }
    }

    fn insert(&mut self, entry: OpenEntry) -> String {
        self.next_handle += 1;
        let handle = format!("h{}", self.next_handle);
        self.handles.insert(handle.clone(), entry);
        handle
    }

    fn file(&mut self, handle: &str) -> Result<&mut fs::File, StatusCode> {
        match self.handles.get_mut(handle) {
            Some(OpenEntry::File(file)) => Ok(file),
            _ => Err(StatusCode::Failure),
        }
    }
}

fn status_code(err: &std::io::Error) -> StatusCode {
    match err.kind() {
        ErrorKind::NotFound => StatusCode::NoSuchFile,
        ErrorKind::PermissionDenied => StatusCode::PermissionDenied,
        _ => StatusCode::Failure,
    }
}

fn io_err(err: std::io::Error) -> StatusCode {
    trace!(error = %err, "Filesystem call failed");
    status_code(&err)
}

fn ok(id: u32) -> Status {
    Status {
        id,
        status_code: StatusCode::Ok,
        error_message: "Ok".to_string(),
        language_tag: "en-US".to_string(),
    }
}

fn seconds(time: std::io::Result<std::time::SystemTime>) -> Option<u32> {
    time.ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .and_then(|d| u32::try_from(d.as_secs()).ok())
}

pub(crate) fn attributes(meta: &std::fs::Metadata) -> FileAttributes {
    let mut attrs = FileAttributes::default();
    attrs.size = Some(meta.len());
    attrs.mtime = seconds(meta.modified());
    attrs.atime = seconds(meta.accessed());
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        attrs.permissions = Some(meta.mode());
        attrs.uid = Some(meta.uid());
        attrs.gid = Some(meta.gid());
    }
    #[cfg(not(unix))]
    {
        attrs.permissions = Some(if meta.is_dir() { 0o040_755 } else { 0o100_644 });
    }
    attrs
}

fn open_options(flags: OpenFlags) -> OpenOptions {
    let mut options = OpenOptions::new();
    options
        .read(flags.contains(OpenFlags::READ))
        .write(flags.contains(OpenFlags::WRITE))
        .append(flags.contains(OpenFlags::APPEND));
    if flags.contains(OpenFlags::CREATE) {
        if flags.contains(OpenFlags::EXCLUDE) {
            options.create_new(true);
        } else {
            options.create(true);
        }
    }
    if flags.contains(OpenFlags::TRUNCATE) {
        options.truncate(true);
    }
    options
}

async fn stat_path(path: &Path, follow: bool) -> Result<FileAttributes, StatusCode> {
    let meta = if follow {
        fs::metadata(path).await
    } else {
        fs::symlink_metadata(path).await
    };
    meta.map(|m| attributes(&m)).map_err(io_err)
}

impl russh_sftp::server::Handler for SftpHandler {
    type Error = StatusCode;

    fn unimplemented(&self) -> Self::Error {
        StatusCode::OpUnsupported
    }

    async fn init(
        &mut self,
        version: u32,
        _extensions: HashMap<String, String>,
    ) -> Result<Version, Self::Error> {
        debug!(version, root = %self.root.display(), "SFTP session started");
        Ok(Version::new())
    }

    async fn realpath(&mut self, id: u32, path: String) -> Result<Name, Self::Error> {
        let resolved = self.resolve(&path);
        let canonical = fs::canonicalize(&resolved).await.unwrap_or(resolved);
        let name = canonical.to_string_lossy().into_owned();
        Ok(Name {
            id,
            files: vec![File::dummy(name)],
        })
    }

    async fn opendir(&mut self, id: u32, path: String) -> Result<Handle, Self::Error> {
        let path = self.resolve(&path);
        let meta = fs::metadata(&path).await.map_err(io_err)?;
        if !meta.is_dir() {
            return Err(StatusCode::NoSuchFile);
        }
        let handle = self.insert(OpenEntry::Dir { path, listed: false });
        Ok(Handle { id, handle })
    }

    async fn readdir(&mut self, id: u32, handle: String) -> Result<Name, Self::Error> {
        let path = match self.handles.get_mut(&handle) {
            Some(OpenEntry::Dir { listed: true, .. }) => return Err(StatusCode::Eof),
            Some(OpenEntry::Dir { path, listed }) => {
                *listed = true;
                path.clone()
            }
            _ => return Err(StatusCode::Failure),
        };

        let mut files = Vec::new();
        let mut dir = fs::read_dir(&path).await.map_err(io_err)?;
        while let Some(entry) = dir.next_entry().await.map_err(io_err)? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let attrs = match entry.metadata().await {
                Ok(meta) => attributes(&meta),
                Err(_) => FileAttributes::default(),
            };
            files.push(File::new(name, attrs));
        }
        Ok(Name { id, files })
    }

    async fn open(
        &mut self,
        id: u32,
        filename: String,
        pflags: OpenFlags,
        _attrs: FileAttributes,
    ) -> Result<Handle, Self::Error> {
        let path = self.resolve(&filename);
        let file = open_options(pflags).open(&path).await.map_err(io_err)?;
        trace!(path = %path.display(), "Opened file");
        let handle = self.insert(OpenEntry::File(file));
        Ok(Handle { id, handle })
    }

    async fn read(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        len: u32,
    ) -> Result<Data, Self::Error> {
        let file = self.file(&handle)?;
        file.seek(SeekFrom::Start(offset)).await.map_err(io_err)?;
        let mut data = vec![0u8; len as usize];
        let n = file.read(&mut data).await.map_err(io_err)?;
        if n == 0 {
            return Err(StatusCode::Eof);
        }
        data.truncate(n);
        Ok(Data { id, data })
    }

    async fn write(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        data: Vec<u8>,
    ) -> Result<Status, Self::Error> {
        let file = self.file(&handle)?;
        file.seek(SeekFrom::Start(offset)).await.map_err(io_err)?;
        file.write_all(&data).await.map_err(io_err)?;
        Ok(ok(id))
    }

    async fn close(&mut self, id: u32, handle: String) -> Result<Status, Self::Error> {
        match self.handles.remove(&handle) {
            Some(OpenEntry::File(mut file)) => {
                file.flush().await.map_err(io_err)?;
                Ok(ok(id))
            }
            Some(OpenEntry::Dir { .. }) => Ok(ok(id)),
            None => Err(StatusCode::Failure),
        }
    }

    async fn stat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        let attrs = stat_path(&self.resolve(&path), true).await?;
        Ok(Attrs { id, attrs })
    }

    async fn lstat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        let attrs = stat_path(&self.resolve(&path), false).await?;
        Ok(Attrs { id, attrs })
    }

    async fn fstat(&mut self, id: u32, handle: String) -> Result<Attrs, Self::Error> {
        let attrs = match self.handles.get(&handle) {
            Some(OpenEntry::File(file)) => attributes(&file.metadata().await.map_err(io_err)?),
            Some(OpenEntry::Dir { path, .. }) => stat_path(path, true).await?,
            None => return Err(StatusCode::Failure),
        };
        Ok(Attrs { id, attrs })
    }

    async fn mkdir(
        &mut self,
        id: u32,
        path: String,
        _attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        fs::create_dir(self.resolve(&path)).await.map_err(io_err)?;
        Ok(ok(id))
    }

    async fn rmdir(&mut self, id: u32, path: String) -> Result<Status, Self::Error> {
        fs::remove_dir(self.resolve(&path)).await.map_err(io_err)?;
        Ok(ok(id))
    }

    async fn remove(&mut self, id: u32, filename: String) -> Result<Status, Self::Error> {
        fs::remove_file(self.resolve(&filename)).await.map_err(io_err)?;
        Ok(ok(id))
    }

    async fn rename(
        &mut self,
        id: u32,
        oldpath: String,
        newpath: String,
    ) -> Result<Status, Self::Error> {
        fs::rename(self.resolve(&oldpath), self.resolve(&newpath))
            .await
            .map_err(io_err)?;
        Ok(ok(id))
    }
}

/// Serves SFTP on `stream` and resolves once the client is done.
pub(crate) async fn serve(stream: ChannelStream<Msg>, root: PathBuf) {
    let (done_tx, done_rx) = oneshot::channel();
    russh_sftp::server::run(stream, SftpHandler::new(root, done_tx)).await;
    let _ = done_rx.await;
    debug!("SFTP session finished");
}
