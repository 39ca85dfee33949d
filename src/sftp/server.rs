//! Server side of the `sftp` subsystem, serving the local filesystem
//! through `tokio::fs`.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use log::{debug, warn};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::buffer::Buffer;
use crate::channel::{Channel, ChannelMsg};
use crate::error::{Error, Result};
use crate::sftp::attrs::{kind_from_permissions, FileAttributes, Timestamp};
use crate::sftp::proto::*;
use crate::sftp::SFTP_SUBSYSTEM;
use crate::shell::SubsystemFactory;

const READDIR_BATCH: usize = 64;
const MAX_READ_LEN: u32 = 256 * 1024;

/// Starts an [`SftpSubsystem`] for each session channel that requests
/// the `sftp` subsystem.
#[derive(Debug, Default)]
pub struct SftpSubsystemFactory;

#[async_trait]
impl SubsystemFactory for SftpSubsystemFactory {
    fn name(&self) -> &str {
        SFTP_SUBSYSTEM
    }

    async fn start(&self, channel: &Arc<Channel>) -> Result<()> {
        let rx = channel
            .take_receiver()
            .ok_or_else(|| Error::Protocol("channel stream already taken".into()))?;
        let server = SftpSubsystem::new(Arc::clone(channel));
        tokio::spawn(server.run(rx));
        Ok(())
    }
}

enum HandleState {
    File { file: tokio::fs::File, path: PathBuf },
    Dir {
        entries: Option<tokio::fs::ReadDir>,
    },
}

/// One SFTP server session bound to a channel. Speaks versions 3
/// through 6, negotiated down to what the client offers.
pub struct SftpSubsystem {
    channel: Arc<Channel>,
    version: u32,
    handles: HashMap<String, HandleState>,
    next_handle: u32,
}

impl std::fmt::Debug for SftpSubsystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SftpSubsystem")
            .field("version", &self.version)
            .field("handles", &self.handles.len())
            .finish()
    }
}

impl SftpSubsystem {
    fn new(channel: Arc<Channel>) -> Self {
        SftpSubsystem {
            channel,
            version: LOWEST_VERSION,
            handles: HashMap::new(),
            next_handle: 0,
        }
    }

    async fn run(mut self, mut rx: UnboundedReceiver<ChannelMsg>) {
        let mut acc = Buffer::new();
        while let Some(msg) = rx.recv().await {
            match msg {
                ChannelMsg::Data(data) => {
                    acc.put_raw(&data);
                    loop {
                        if acc.available() < 4 {
                            break;
                        }
                        let mark = acc.rpos();
                        let len = match acc.get_u32() {
                            Ok(len) => len as usize,
                            Err(_) => break,
                        };
                        if acc.available() < len {
                            acc.set_rpos(mark);
                            break;
                        }
                        let frame = match acc.get_raw(len) {
                            Ok(frame) => frame,
                            Err(_) => break,
                        };
                        if let Err(e) = self.process_frame(Buffer::from_vec(frame)).await {
                            warn!("sftp server stopping: {}", e);
                            return;
                        }
                    }
                    acc.compact();
                }
                ChannelMsg::Eof | ChannelMsg::Close => break,
                _ => {}
            }
        }
    }

    async fn send_frame(&self, ty: u8, body: impl FnOnce(&mut Buffer)) -> Result<()> {
        let mut buf = Buffer::new();
        buf.put_u32(0);
        buf.put_u8(ty);
        body(&mut buf);
        let end = buf.wpos();
        buf.set_wpos(0);
        buf.put_u32((end - 4) as u32);
        buf.set_wpos(end);
        self.channel.write_data(buf.unread()).await
    }

    async fn send_status(&self, id: u32, code: u32, message: &str) -> Result<()> {
        let text = if message.is_empty() {
            status_text(code)
        } else {
            message
        };
        self.send_frame(SSH_FXP_STATUS, |buf| {
            buf.put_u32(id);
            buf.put_u32(code);
            buf.put_str(text);
            buf.put_str("en");
        })
        .await
    }

    async fn send_attrs(&self, id: u32, attrs: &FileAttributes) -> Result<()> {
        let version = self.version;
        self.send_frame(SSH_FXP_ATTRS, |buf| {
            buf.put_u32(id);
            attrs.encode(buf, version);
        })
        .await
    }

    fn alloc_handle(&mut self, state: HandleState) -> String {
        let raw = format!("h{:08x}", self.next_handle);
        self.next_handle += 1;
        self.handles.insert(raw.clone(), state);
        raw
    }

    async fn process_frame(&mut self, mut buf: Buffer) -> Result<()> {
        let ty = buf.get_u8()?;

        if ty == SSH_FXP_INIT {
            let offered = buf.get_u32()?;
            self.version = offered.clamp(LOWEST_VERSION, HIGHEST_VERSION);
            debug!("sftp client offered version {}, using {}", offered, self.version);
            let version = self.version;
            return self
                .send_frame(SSH_FXP_VERSION, |buf| {
                    buf.put_u32(version);
                    buf.put_str(EXT_POSIX_RENAME);
                    buf.put_string(b"1");
                    buf.put_str(EXT_HARDLINK);
                    buf.put_string(b"1");
                })
                .await;
        }

        let id = buf.get_u32()?;
        match self.process_request(ty, id, &mut buf).await {
            Ok(()) => Ok(()),
            Err(Error::Io(e)) => self.send_status(id, io_status(&e), &e.to_string()).await,
            Err(Error::Encoding(_)) => self.send_status(id, SSH_FX_BAD_MESSAGE, "").await,
            Err(Error::Sftp { code, message }) => self.send_status(id, code, &message).await,
            Err(e) => Err(e),
        }
    }

    async fn process_request(&mut self, ty: u8, id: u32, buf: &mut Buffer) -> Result<()> {
        match ty {
            SSH_FXP_OPEN => self.op_open(id, buf).await,
            SSH_FXP_CLOSE => {
                let raw = handle_name(buf)?;
                match self.handles.remove(&raw) {
                    Some(_) => self.send_status(id, SSH_FX_OK, "").await,
                    None => self.send_status(id, SSH_FX_INVALID_HANDLE, "").await,
                }
            }
            SSH_FXP_READ => self.op_read(id, buf).await,
            SSH_FXP_WRITE => self.op_write(id, buf).await,
            SSH_FXP_LSTAT => {
                let path = buf.get_str()?;
                self.consume_stat_flags(buf);
                let md = tokio::fs::symlink_metadata(&path).await?;
                self.send_attrs(id, &attrs_from_metadata(&md)).await
            }
            SSH_FXP_STAT => {
                let path = buf.get_str()?;
                self.consume_stat_flags(buf);
                let md = tokio::fs::metadata(&path).await?;
                self.send_attrs(id, &attrs_from_metadata(&md)).await
            }
            SSH_FXP_FSTAT => {
                let raw = handle_name(buf)?;
                self.consume_stat_flags(buf);
                match self.handles.get(&raw) {
                    Some(HandleState::File { file, .. }) => {
                        let md = file.metadata().await?;
                        self.send_attrs(id, &attrs_from_metadata(&md)).await
                    }
                    _ => self.send_status(id, SSH_FX_INVALID_HANDLE, "").await,
                }
            }
            SSH_FXP_SETSTAT => {
                let path = buf.get_str()?;
                let attrs = FileAttributes::decode(buf, self.version)?;
                apply_attrs(std::path::Path::new(&path), &attrs).await?;
                self.send_status(id, SSH_FX_OK, "").await
            }
            SSH_FXP_FSETSTAT => {
                let raw = handle_name(buf)?;
                let attrs = FileAttributes::decode(buf, self.version)?;
                let path = match self.handles.get(&raw) {
                    Some(HandleState::File { path, .. }) => path.clone(),
                    _ => return self.send_status(id, SSH_FX_INVALID_HANDLE, "").await,
                };
                apply_attrs(&path, &attrs).await?;
                self.send_status(id, SSH_FX_OK, "").await
            }
            SSH_FXP_OPENDIR => {
                let path = buf.get_str()?;
                let entries = tokio::fs::read_dir(&path).await?;
                let raw = self.alloc_handle(HandleState::Dir {
                    entries: Some(entries),
                });
                self.send_frame(SSH_FXP_HANDLE, |buf| {
                    buf.put_u32(id);
                    buf.put_string(raw.as_bytes());
                })
                .await
            }
            SSH_FXP_READDIR => self.op_readdir(id, buf).await,
            SSH_FXP_REMOVE => {
                let path = buf.get_str()?;
                tokio::fs::remove_file(&path).await?;
                self.send_status(id, SSH_FX_OK, "").await
            }
            SSH_FXP_MKDIR => {
                let path = buf.get_str()?;
                let attrs = FileAttributes::decode(buf, self.version)?;
                tokio::fs::create_dir(&path).await?;
                apply_attrs(std::path::Path::new(&path), &attrs).await?;
                self.send_status(id, SSH_FX_OK, "").await
            }
            SSH_FXP_RMDIR => {
                let path = buf.get_str()?;
                tokio::fs::remove_dir(&path).await?;
                self.send_status(id, SSH_FX_OK, "").await
            }
            SSH_FXP_REALPATH => {
                let path = buf.get_str()?;
                let resolved = tokio::fs::canonicalize(&path).await?;
                let version = self.version;
                self.send_frame(SSH_FXP_NAME, |buf| {
                    buf.put_u32(id);
                    buf.put_u32(1);
                    buf.put_str(&resolved.to_string_lossy());
                    if version <= 3 {
                        buf.put_str(&resolved.to_string_lossy());
                    }
                    FileAttributes::default().encode(buf, version);
                })
                .await
            }
            SSH_FXP_RENAME => {
                let oldpath = buf.get_str()?;
                let newpath = buf.get_str()?;
                if self.version >= 5 {
                    let _flags = buf.get_u32()?;
                }
                tokio::fs::rename(&oldpath, &newpath).await?;
                self.send_status(id, SSH_FX_OK, "").await
            }
            SSH_FXP_READLINK => {
                let path = buf.get_str()?;
                let target = tokio::fs::read_link(&path).await?;
                let version = self.version;
                self.send_frame(SSH_FXP_NAME, |buf| {
                    buf.put_u32(id);
                    buf.put_u32(1);
                    buf.put_str(&target.to_string_lossy());
                    if version <= 3 {
                        buf.put_str(&target.to_string_lossy());
                    }
                    FileAttributes::default().encode(buf, version);
                })
                .await
            }
            SSH_FXP_SYMLINK => {
                let link_path = buf.get_str()?;
                let target = buf.get_str()?;
                tokio::fs::symlink(&target, &link_path).await?;
                self.send_status(id, SSH_FX_OK, "").await
            }
            SSH_FXP_LINK => {
                let link_path = buf.get_str()?;
                let existing = buf.get_str()?;
                let symbolic = buf.get_bool()?;
                if symbolic {
                    tokio::fs::symlink(&existing, &link_path).await?;
                } else {
                    tokio::fs::hard_link(&existing, &link_path).await?;
                }
                self.send_status(id, SSH_FX_OK, "").await
            }
            SSH_FXP_EXTENDED => self.op_extended(id, buf).await,
            other => {
                debug!("unsupported sftp request type {}", other);
                self.send_status(id, SSH_FX_OP_UNSUPPORTED, "").await
            }
        }
    }

    fn consume_stat_flags(&self, buf: &mut Buffer) {
        if self.version >= 4 {
            let _ = buf.get_u32();
        }
    }

    async fn op_open(&mut self, id: u32, buf: &mut Buffer) -> Result<()> {
        let path = buf.get_str()?;
        let mut options = tokio::fs::OpenOptions::new();
        if self.version >= 5 {
            let access = buf.get_u32()?;
            let flags = buf.get_u32()?;
            options.read(access & (ACE4_READ_DATA | ACE4_READ_ATTRIBUTES) != 0);
            options.write(access & ACE4_WRITE_DATA != 0);
            options.append(access & ACE4_APPEND_DATA != 0 || flags & SSH_FXF_APPEND_DATA != 0);
            match flags & SSH_FXF_ACCESS_DISPOSITION {
                SSH_FXF_CREATE_NEW => {
                    options.create_new(true).write(true);
                }
                SSH_FXF_CREATE_TRUNCATE => {
                    options.create(true).truncate(true).write(true);
                }
                SSH_FXF_OPEN_OR_CREATE => {
                    options.create(true).write(true);
                }
                SSH_FXF_TRUNCATE_EXISTING => {
                    options.truncate(true).write(true);
                }
                _ => {}
            }
        } else {
            let pflags = buf.get_u32()?;
            options
                .read(pflags & SSH_FXF_READ != 0)
                .write(pflags & SSH_FXF_WRITE != 0)
                .append(pflags & SSH_FXF_APPEND != 0)
                .create(pflags & SSH_FXF_CREAT != 0)
                .truncate(pflags & SSH_FXF_TRUNC != 0)
                .create_new(pflags & SSH_FXF_EXCL != 0);
        }
        let _attrs = FileAttributes::decode(buf, self.version)?;

        let file = options.open(&path).await?;
        let raw = self.alloc_handle(HandleState::File {
            file,
            path: PathBuf::from(path),
        });
        self.send_frame(SSH_FXP_HANDLE, |buf| {
            buf.put_u32(id);
            buf.put_string(raw.as_bytes());
        })
        .await
    }

    async fn op_read(&mut self, id: u32, buf: &mut Buffer) -> Result<()> {
        let raw = handle_name(buf)?;
        let offset = buf.get_u64()?;
        let len = buf.get_u32()?.min(MAX_READ_LEN);
        let file = match self.handles.get_mut(&raw) {
            Some(HandleState::File { file, .. }) => file,
            _ => return self.send_status(id, SSH_FX_INVALID_HANDLE, "").await,
        };
        file.seek(SeekFrom::Start(offset)).await?;
        let mut data = vec![0u8; len as usize];
        let n = file.read(&mut data).await?;
        if n == 0 && len > 0 {
            return self.send_status(id, SSH_FX_EOF, "").await;
        }
        data.truncate(n);
        self.send_frame(SSH_FXP_DATA, |buf| {
            buf.put_u32(id);
            buf.put_string(&data);
        })
        .await
    }

    async fn op_write(&mut self, id: u32, buf: &mut Buffer) -> Result<()> {
        let raw = handle_name(buf)?;
        let offset = buf.get_u64()?;
        let data = buf.get_string()?;
        let file = match self.handles.get_mut(&raw) {
            Some(HandleState::File { file, .. }) => file,
            _ => return self.send_status(id, SSH_FX_INVALID_HANDLE, "").await,
        };
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(&data).await?;
        // tokio files complete writes in the background; settle before
        // acknowledging so a following FSTAT sees the new size.
        file.flush().await?;
        self.send_status(id, SSH_FX_OK, "").await
    }

    async fn op_readdir(&mut self, id: u32, buf: &mut Buffer) -> Result<()> {
        let raw = handle_name(buf)?;
        let entries = match self.handles.get_mut(&raw) {
            Some(HandleState::Dir { entries }) => entries,
            _ => return self.send_status(id, SSH_FX_INVALID_HANDLE, "").await,
        };
        let reader = match entries {
            Some(reader) => reader,
            None => return self.send_status(id, SSH_FX_EOF, "").await,
        };

        let mut batch = Vec::new();
        while batch.len() < READDIR_BATCH {
            match reader.next_entry().await? {
                Some(entry) => {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    let attrs = match entry.metadata().await {
                        Ok(md) => attrs_from_metadata(&md),
                        Err(_) => FileAttributes::default(),
                    };
                    batch.push((name, attrs));
                }
                None => {
                    *entries = None;
                    break;
                }
            }
        }
        if batch.is_empty() {
            return self.send_status(id, SSH_FX_EOF, "").await;
        }

        let version = self.version;
        self.send_frame(SSH_FXP_NAME, |buf| {
            buf.put_u32(id);
            buf.put_u32(batch.len() as u32);
            for (name, attrs) in &batch {
                buf.put_str(name);
                if version <= 3 {
                    buf.put_str(&longname(name, attrs));
                }
                attrs.encode(buf, version);
            }
        })
        .await
    }

    async fn op_extended(&mut self, id: u32, buf: &mut Buffer) -> Result<()> {
        let name = buf.get_str()?;
        match name.as_str() {
            EXT_POSIX_RENAME => {
                let oldpath = buf.get_str()?;
                let newpath = buf.get_str()?;
                tokio::fs::rename(&oldpath, &newpath).await?;
                self.send_status(id, SSH_FX_OK, "").await
            }
            EXT_HARDLINK => {
                let oldpath = buf.get_str()?;
                let newpath = buf.get_str()?;
                tokio::fs::hard_link(&oldpath, &newpath).await?;
                self.send_status(id, SSH_FX_OK, "").await
            }
            _ => {
                debug!("unsupported sftp extension {:?}", name);
                self.send_status(id, SSH_FX_OP_UNSUPPORTED, "").await
            }
        }
    }
}

fn handle_name(buf: &mut Buffer) -> Result<String> {
    let raw = buf.get_string()?;
    String::from_utf8(raw).map_err(|_| Error::Sftp {
        code: SSH_FX_INVALID_HANDLE,
        message: "malformed handle".into(),
    })
}

fn io_status(e: &std::io::Error) -> u32 {
    use std::io::ErrorKind;
    match e.kind() {
        ErrorKind::NotFound => SSH_FX_NO_SUCH_FILE,
        ErrorKind::PermissionDenied => SSH_FX_PERMISSION_DENIED,
        ErrorKind::AlreadyExists => SSH_FX_FILE_ALREADY_EXISTS,
        _ => SSH_FX_FAILURE,
    }
}

fn system_time_stamp(t: std::io::Result<std::time::SystemTime>) -> Option<Timestamp> {
    let t = t.ok()?;
    let since = t.duration_since(UNIX_EPOCH).ok()?;
    Some(Timestamp {
        seconds: since.as_secs(),
        nanoseconds: Some(since.subsec_nanos()),
    })
}

fn attrs_from_metadata(md: &std::fs::Metadata) -> FileAttributes {
    let mode = md.mode();
    FileAttributes {
        kind: Some(kind_from_permissions(mode)),
        size: Some(md.len()),
        uid_gid: Some((md.uid(), md.gid())),
        owner_group: Some((md.uid().to_string(), md.gid().to_string())),
        permissions: Some(mode),
        atime: system_time_stamp(md.accessed()),
        create_time: None,
        mtime: system_time_stamp(md.modified()),
        acl: None,
        extended: Vec::new(),
    }
}

async fn apply_attrs(path: &std::path::Path, attrs: &FileAttributes) -> Result<()> {
    if let Some(perms) = attrs.permissions {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(perms & 0o7777);
        tokio::fs::set_permissions(path, perms).await?;
    }
    if let Some(size) = attrs.size {
        let file = tokio::fs::OpenOptions::new().write(true).open(path).await?;
        file.set_len(size).await?;
    }
    Ok(())
}

/// An `ls -l` style line for version 3 `NAME` replies.
fn longname(name: &str, attrs: &FileAttributes) -> String {
    let mode = attrs.permissions.unwrap_or(0);
    let kind = match mode & S_IFMT {
        S_IFDIR => 'd',
        S_IFLNK => 'l',
        _ => '-',
    };
    let mut perms = String::with_capacity(9);
    for shift in [6, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        perms.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        perms.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        perms.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    let (uid, gid) = attrs.uid_gid.unwrap_or((0, 0));
    format!(
        "{}{} 1 {:<8} {:<8} {:>10} {}",
        kind,
        perms,
        uid,
        gid,
        attrs.size.unwrap_or(0),
        name
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_map_to_substatus() {
        use std::io::{Error as IoError, ErrorKind};
        assert_eq!(
            io_status(&IoError::new(ErrorKind::NotFound, "x")),
            SSH_FX_NO_SUCH_FILE
        );
        assert_eq!(
            io_status(&IoError::new(ErrorKind::PermissionDenied, "x")),
            SSH_FX_PERMISSION_DENIED
        );
        assert_eq!(
            io_status(&IoError::new(ErrorKind::BrokenPipe, "x")),
            SSH_FX_FAILURE
        );
    }

    #[test]
    fn longname_renders_mode_bits() {
        let attrs = FileAttributes {
            permissions: Some(S_IFDIR | 0o755),
            uid_gid: Some((1000, 100)),
            size: Some(4096),
            ..FileAttributes::default()
        };
        let line = longname("src", &attrs);
        assert!(line.starts_with("drwxr-xr-x"), "{}", line);
        assert!(line.ends_with(" src"));
    }
}
