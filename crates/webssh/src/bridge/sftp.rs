//! File transfer over a bridge session's SFTP subchannel.

use russh_sftp::client::SftpSession;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::{Error, Result};

/// One navigable path prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Breadcrumb {
    /// Last path segment, or `/` for the root.
    pub name: String,
    /// Absolute path up to and including this segment.
    pub path: String,
}

/// A directory entry as shown to web clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirEntryView {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
    /// Modification time, seconds since the epoch.
    pub modified: Option<u32>,
}

/// Result of listing a directory.
#[derive(Debug, Clone, Serialize)]
pub struct Listing {
    pub path: String,
    pub breadcrumbs: Vec<Breadcrumb>,
    pub entries: Vec<DirEntryView>,
}

/// Splits `dir` on `/` and returns every prefix, root first.
///
/// Pure string formatting; nothing touches the remote side.
///
/// ```
/// use webssh::bridge::breadcrumbs;
///
/// let crumbs = breadcrumbs("/var/log/");
/// let paths: Vec<_> = crumbs.iter().map(|c| c.path.as_str()).collect();
/// assert_eq!(paths, ["/", "/var", "/var/log"]);
/// ```
pub fn breadcrumbs(dir: &str) -> Vec<Breadcrumb> {
    let mut crumbs = vec![Breadcrumb {
        name: "/".to_string(),
        path: "/".to_string(),
    }];
    let mut prefix = String::new();
    for segment in dir.split('/').filter(|s| !s.is_empty()) {
        prefix.push('/');
        prefix.push_str(segment);
        crumbs.push(Breadcrumb {
            name: segment.to_string(),
            path: prefix.clone(),
        });
    }
    crumbs
}

fn sftp_error(op: &str, path: &str, err: impl std::fmt::Display) -> Error {
    Error::Sftp(format!("{op} {path}: {err}"))
}

pub(crate) async fn list(sftp: &SftpSession, path: &str) -> Result<Listing> {
    let entries = sftp
        .read_dir(path)
        .await
        .map_err(|e| sftp_error("list", path, e))?;

    let mut entries: Vec<DirEntryView> = entries
        .filter(|entry| {
            let name = entry.file_name();
            name != "." && name != ".."
        })
        .map(|entry| {
            let attrs = entry.metadata();
            DirEntryView {
                name: entry.file_name(),
                is_dir: attrs.is_dir(),
                size: attrs.size.unwrap_or(0),
                modified: attrs.mtime,
            }
        })
        .collect();
    entries.sort_by(|a, b| b.is_dir.cmp(&a.is_dir).then_with(|| a.name.cmp(&b.name)));

    Ok(Listing {
        path: path.to_string(),
        breadcrumbs: breadcrumbs(path),
        entries,
    })
}

pub(crate) async fn download(sftp: &SftpSession, path: &str) -> Result<Vec<u8>> {
    let mut file = sftp
        .open(path)
        .await
        .map_err(|e| sftp_error("open", path, e))?;
    let mut contents = Vec::new();
    file.read_to_end(&mut contents)
        .await
        .map_err(|e| sftp_error("read", path, e))?;
    Ok(contents)
}

pub(crate) async fn upload(sftp: &SftpSession, path: &str, contents: &[u8]) -> Result<()> {
    let mut file = sftp
        .create(path)
        .await
        .map_err(|e| sftp_error("create", path, e))?;
    file.write_all(contents)
        .await
        .map_err(|e| sftp_error("write", path, e))?;
    file.shutdown()
        .await
        .map_err(|e| sftp_error("close", path, e))?;
    Ok(())
}

pub(crate) async fn create_dir(sftp: &SftpSession, path: &str) -> Result<()> {
    sftp.create_dir(path)
        .await
        .map_err(|e| sftp_error("mkdir", path, e))
}

/// Removes a file, or an empty directory.
pub(crate) async fn delete(sftp: &SftpSession, path: &str) -> Result<()> {
    let attrs = sftp
        .metadata(path)
        .await
        .map_err(|e| sftp_error("stat", path, e))?;
    if attrs.is_dir() {
        sftp.remove_dir(path)
            .await
            .map_err(|e| sftp_error("rmdir", path, e))
    } else {
        sftp.remove_file(path)
            .await
            .map_err(|e| sftp_error("remove", path, e))
    }
}
