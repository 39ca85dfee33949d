//! The SFTP client: a request–reply RPC endpoint over a channel running
//! the `sftp` subsystem.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use bitflags::bitflags;
use log::{debug, warn};
use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::buffer::Buffer;
use crate::channel::{Channel, ChannelMsg};
use crate::error::{Error, Result};
use crate::future::{Awaitable, Completion};
use crate::sftp::attrs::FileAttributes;
use crate::sftp::proto::*;
use crate::sftp::SFTP_SUBSYSTEM;

bitflags! {
    /// How to open a remote file, independent of the negotiated
    /// protocol version.
    #[derive(Debug, Copy, Clone, Eq, PartialEq)]
    pub struct OpenMode: u32 {
        /// Open for reading.
        const READ = 0x01;
        /// Open for writing.
        const WRITE = 0x02;
        /// Writes go to the end of the file.
        const APPEND = 0x04;
        /// Create the file if it does not exist.
        const CREATE = 0x08;
        /// Truncate an existing file.
        const TRUNCATE = 0x10;
        /// With `CREATE`: fail if the file already exists.
        const EXCLUSIVE = 0x20;
    }
}

impl OpenMode {
    /// The classic version 3/4 `pflags` bitmask.
    fn v3_flags(self) -> u32 {
        // The public bits deliberately mirror SSH_FXF_*.
        self.bits()
    }

    /// The version 5+ `desired-access` ACE mask.
    fn v5_access(self) -> u32 {
        let mut access = 0;
        if self.contains(OpenMode::READ) {
            access |= ACE4_READ_DATA | ACE4_READ_ATTRIBUTES;
        }
        if self.contains(OpenMode::WRITE) {
            access |= ACE4_WRITE_DATA | ACE4_WRITE_ATTRIBUTES;
        }
        if self.contains(OpenMode::APPEND) {
            access |= ACE4_APPEND_DATA;
        }
        access
    }

    /// The version 5+ disposition plus modifier bits.
    fn v5_flags(self) -> u32 {
        let disposition = if self.contains(OpenMode::CREATE | OpenMode::EXCLUSIVE) {
            SSH_FXF_CREATE_NEW
        } else if self.contains(OpenMode::CREATE | OpenMode::TRUNCATE) {
            SSH_FXF_CREATE_TRUNCATE
        } else if self.contains(OpenMode::CREATE) {
            SSH_FXF_OPEN_OR_CREATE
        } else if self.contains(OpenMode::TRUNCATE) {
            SSH_FXF_TRUNCATE_EXISTING
        } else {
            SSH_FXF_OPEN_EXISTING
        };
        let mut flags = disposition;
        if self.contains(OpenMode::APPEND) {
            flags |= SSH_FXF_APPEND_DATA;
        }
        flags
    }
}

/// One entry of a `SSH_FXP_NAME` reply.
#[derive(Debug, Clone)]
pub struct NameEntry {
    /// The file name relative to the directory being listed (or the
    /// resolved path for `realpath`).
    pub filename: String,
    /// `ls -l` style line, version 3 only.
    pub longname: Option<String>,
    /// Attributes the server sent along.
    pub attrs: FileAttributes,
}

/// Filesystem statistics from `statvfs@openssh.com`.
#[derive(Debug, Clone, Default)]
#[allow(missing_docs)]
pub struct StatVfs {
    pub bsize: u64,
    pub frsize: u64,
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub favail: u64,
    pub fsid: u64,
    pub flag: u64,
    pub namemax: u64,
}

#[derive(Debug, Clone)]
enum Response {
    Status {
        code: u32,
        message: String,
    },
    Handle(Vec<u8>),
    Data(Vec<u8>),
    Name(Vec<NameEntry>),
    Attrs(FileAttributes),
    ExtendedReply(Vec<u8>),
}

type VersionInfo = (u32, Vec<(String, Vec<u8>)>);

struct ClientShared {
    channel: Arc<Channel>,
    next_id: AtomicU32,
    pending: Mutex<HashMap<u32, Awaitable<Response>>>,
    version: AtomicU32,
    version_reply: Awaitable<VersionInfo>,
    extensions: Mutex<Vec<(String, Vec<u8>)>>,
}

impl ClientShared {
    fn version(&self) -> u32 {
        self.version.load(Ordering::Relaxed)
    }

    fn fail_all(&self) {
        self.version_reply.cancel();
        for (_, pending) in self.pending.lock().drain() {
            pending.cancel();
        }
    }

    fn dispatch_frame(&self, mut buf: Buffer) {
        let result: Result<()> = (|| {
            let ty = buf.get_u8()?;
            if ty == SSH_FXP_VERSION {
                let version = buf.get_u32()?;
                let mut extensions = Vec::new();
                while buf.available() > 0 {
                    extensions.push((buf.get_str()?, buf.get_string()?));
                }
                self.version_reply.set((version, extensions));
                return Ok(());
            }

            let id = buf.get_u32()?;
            let response = match ty {
                SSH_FXP_STATUS => Response::Status {
                    code: buf.get_u32()?,
                    // Language tag follows the text; nothing uses it.
                    message: buf.get_str().unwrap_or_default(),
                },
                SSH_FXP_HANDLE => Response::Handle(buf.get_string()?),
                SSH_FXP_DATA => Response::Data(buf.get_string()?),
                SSH_FXP_NAME => {
                    let version = self.version();
                    let count = buf.get_u32()?;
                    let mut entries = Vec::with_capacity(count.min(1024) as usize);
                    for _ in 0..count {
                        let filename = buf.get_str()?;
                        let longname = if version <= 3 {
                            Some(buf.get_str()?)
                        } else {
                            None
                        };
                        let attrs = FileAttributes::decode(&mut buf, version)?;
                        entries.push(NameEntry {
                            filename,
                            longname,
                            attrs,
                        });
                    }
                    Response::Name(entries)
                }
                SSH_FXP_ATTRS => Response::Attrs(FileAttributes::decode(&mut buf, self.version())?),
                SSH_FXP_EXTENDED_REPLY => Response::ExtendedReply(buf.get_raw(buf.available())?),
                other => {
                    return Err(Error::Protocol(format!(
                        "unexpected sftp response type {}",
                        other
                    )))
                }
            };

            match self.pending.lock().remove(&id) {
                Some(pending) => {
                    pending.set(response);
                }
                // Replies to fire-and-forget closes land here.
                None => debug!("sftp response for unknown request id {}", id),
            }
            Ok(())
        })();
        if let Err(e) = result {
            warn!("dropping malformed sftp response: {}", e);
        }
    }
}

async fn read_loop(mut rx: UnboundedReceiver<ChannelMsg>, shared: Arc<ClientShared>) {
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
                    let len = acc.get_u32().expect("checked available") as usize;
                    if acc.available() < len {
                        acc.set_rpos(mark);
                        break;
                    }
                    let frame = acc.get_raw(len).expect("checked available");
                    shared.dispatch_frame(Buffer::from_vec(frame));
                }
                acc.compact();
            }
            ChannelMsg::Eof | ChannelMsg::Close => break,
            _ => {}
        }
    }
    shared.fail_all();
}

fn frame(ty: u8, id: Option<u32>, body: impl FnOnce(&mut Buffer)) -> Buffer {
    let mut buf = Buffer::new();
    buf.put_u32(0);
    buf.put_u8(ty);
    if let Some(id) = id {
        buf.put_u32(id);
    }
    body(&mut buf);
    let end = buf.wpos();
    buf.set_wpos(0);
    buf.put_u32((end - 4) as u32);
    buf.set_wpos(end);
    buf
}

/// An opaque server-issued handle for an open file or directory.
///
/// Dropping the handle without calling [`SftpClient::close`] sends a
/// best-effort close request in the background so server resources are
/// not leaked.
pub struct SftpHandle {
    raw: Vec<u8>,
    shared: Weak<ClientShared>,
    closed: bool,
}

impl std::fmt::Debug for SftpHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SftpHandle")
            .field("raw", &self.raw)
            .field("closed", &self.closed)
            .finish()
    }
}

impl SftpHandle {
    /// The raw handle bytes as issued by the server.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }
}

impl Drop for SftpHandle {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let shared = match self.shared.upgrade() {
            Some(shared) => shared,
            None => return,
        };
        let id = shared.next_id.fetch_add(1, Ordering::SeqCst);
        let raw = std::mem::take(&mut self.raw);
        let buf = frame(SSH_FXP_CLOSE, Some(id), |b| b.put_string(&raw));
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let _ = shared.channel.write_data(buf.unread()).await;
                });
            }
            Err(_) => debug!("sftp handle leaked outside a runtime"),
        }
    }
}

/// Client side of the SFTP protocol, versions 3 through 6.
///
/// Every request carries a monotonically assigned id; responses are
/// matched back through a dispatch table held under the client's lock.
/// Calls suspend until their paired response arrives.
pub struct SftpClient {
    shared: Arc<ClientShared>,
}

impl std::fmt::Debug for SftpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SftpClient")
            .field("version", &self.version())
            .finish()
    }
}

impl SftpClient {
    /// Request the `sftp` subsystem on `channel` and negotiate the
    /// protocol version.
    pub async fn start(channel: Arc<Channel>) -> Result<SftpClient> {
        let confirmed = channel
            .request("subsystem", true, |buf| buf.put_str(SFTP_SUBSYSTEM))?
            .expect("reply requested");
        match confirmed.wait().await {
            Completion::Value(true) => {}
            _ => return Err(Error::Protocol("sftp subsystem refused".into())),
        }

        let rx = channel
            .take_receiver()
            .ok_or_else(|| Error::Protocol("channel stream already taken".into()))?;
        let shared = Arc::new(ClientShared {
            channel,
            next_id: AtomicU32::new(0),
            pending: Mutex::new(HashMap::new()),
            version: AtomicU32::new(0),
            version_reply: Awaitable::new(),
            extensions: Mutex::new(Vec::new()),
        });
        tokio::spawn(read_loop(rx, Arc::clone(&shared)));

        let init = frame(SSH_FXP_INIT, None, |buf| buf.put_u32(HIGHEST_VERSION));
        shared.channel.write_data(init.unread()).await?;

        let (version, extensions) = match shared.version_reply.wait().await {
            Completion::Value(v) => v,
            Completion::Canceled => return Err(Error::Disconnected),
        };
        if !(LOWEST_VERSION..=HIGHEST_VERSION).contains(&version) {
            return Err(Error::Protocol(format!(
                "cannot interoperate with sftp version {}",
                version
            )));
        }
        shared.version.store(version, Ordering::Relaxed);
        *shared.extensions.lock() = extensions;
        debug!("sftp session negotiated version {}", version);
        Ok(SftpClient { shared })
    }

    /// The negotiated protocol version.
    pub fn version(&self) -> u32 {
        self.shared.version()
    }

    /// Whether the server advertised `name` in its `VERSION` reply.
    pub fn has_extension(&self, name: &str) -> bool {
        self.shared.extensions.lock().iter().any(|(n, _)| n == name)
    }

    async fn transact(&self, ty: u8, body: impl FnOnce(&mut Buffer)) -> Result<Response> {
        let shared = &self.shared;
        let id = shared.next_id.fetch_add(1, Ordering::SeqCst);
        let reply = Awaitable::new();
        shared.pending.lock().insert(id, reply.clone());

        let buf = frame(ty, Some(id), body);
        if let Err(e) = shared.channel.write_data(buf.unread()).await {
            shared.pending.lock().remove(&id);
            return Err(e);
        }
        match reply.wait().await {
            Completion::Value(response) => Ok(response),
            Completion::Canceled => Err(Error::Disconnected),
        }
    }

    fn status_error(code: u32, message: String) -> Error {
        let message = if message.is_empty() {
            status_text(code).to_owned()
        } else {
            message
        };
        Error::Sftp { code, message }
    }

    fn expect_ok(response: Response) -> Result<()> {
        match response {
            Response::Status {
                code: SSH_FX_OK, ..
            } => Ok(()),
            Response::Status { code, message } => Err(Self::status_error(code, message)),
            _ => Err(Error::Protocol("unexpected sftp response shape".into())),
        }
    }

    fn expect_handle(&self, response: Response) -> Result<SftpHandle> {
        match response {
            Response::Handle(raw) => Ok(SftpHandle {
                raw,
                shared: Arc::downgrade(&self.shared),
                closed: false,
            }),
            Response::Status { code, message } => Err(Self::status_error(code, message)),
            _ => Err(Error::Protocol("unexpected sftp response shape".into())),
        }
    }

    fn expect_attrs(response: Response) -> Result<FileAttributes> {
        match response {
            Response::Attrs(attrs) => Ok(attrs),
            Response::Status { code, message } => Err(Self::status_error(code, message)),
            _ => Err(Error::Protocol("unexpected sftp response shape".into())),
        }
    }

    fn expect_name(response: Response) -> Result<Vec<NameEntry>> {
        match response {
            Response::Name(entries) => Ok(entries),
            Response::Status { code, message } => Err(Self::status_error(code, message)),
            _ => Err(Error::Protocol("unexpected sftp response shape".into())),
        }
    }

    fn expect_single_name(response: Response) -> Result<String> {
        let entries = Self::expect_name(response)?;
        entries
            .into_iter()
            .next()
            .map(|e| e.filename)
            .ok_or_else(|| Error::Protocol("empty NAME response".into()))
    }

    /// Open `path`. The mode translates to the classic `pflags` bitmask
    /// up to version 4 and to the ACE access mask plus disposition from
    /// version 5 on.
    pub async fn open(
        &self,
        path: &str,
        mode: OpenMode,
        attrs: &FileAttributes,
    ) -> Result<SftpHandle> {
        let version = self.version();
        let response = self
            .transact(SSH_FXP_OPEN, |buf| {
                buf.put_str(path);
                if version >= 5 {
                    buf.put_u32(mode.v5_access());
                    buf.put_u32(mode.v5_flags());
                } else {
                    buf.put_u32(mode.v3_flags());
                }
                attrs.encode(buf, version);
            })
            .await?;
        self.expect_handle(response)
    }

    /// Close `handle` explicitly, surfacing any server-side error.
    pub async fn close(&self, mut handle: SftpHandle) -> Result<()> {
        handle.closed = true;
        let raw = std::mem::take(&mut handle.raw);
        let response = self
            .transact(SSH_FXP_CLOSE, |buf| buf.put_string(&raw))
            .await?;
        Self::expect_ok(response)
    }

    /// Read up to `len` bytes at `offset`. `Ok(None)` signals end of
    /// file.
    pub async fn read(
        &self,
        handle: &SftpHandle,
        offset: u64,
        len: u32,
    ) -> Result<Option<Vec<u8>>> {
        let response = self
            .transact(SSH_FXP_READ, |buf| {
                buf.put_string(&handle.raw);
                buf.put_u64(offset);
                buf.put_u32(len);
            })
            .await?;
        match response {
            Response::Data(data) => Ok(Some(data)),
            Response::Status {
                code: SSH_FX_EOF, ..
            } => Ok(None),
            Response::Status { code, message } => Err(Self::status_error(code, message)),
            _ => Err(Error::Protocol("unexpected sftp response shape".into())),
        }
    }

    /// Write `data` at `offset`.
    pub async fn write(&self, handle: &SftpHandle, offset: u64, data: &[u8]) -> Result<()> {
        let response = self
            .transact(SSH_FXP_WRITE, |buf| {
                buf.put_string(&handle.raw);
                buf.put_u64(offset);
                buf.put_string(data);
            })
            .await?;
        Self::expect_ok(response)
    }

    fn stat_flags(version: u32) -> Option<u32> {
        (version >= 4).then_some(
            SSH_FILEXFER_ATTR_SIZE
                | SSH_FILEXFER_ATTR_PERMISSIONS
                | SSH_FILEXFER_ATTR_ACCESSTIME
                | SSH_FILEXFER_ATTR_CREATETIME
                | SSH_FILEXFER_ATTR_MODIFYTIME
                | SSH_FILEXFER_ATTR_OWNERGROUP
                | SSH_FILEXFER_ATTR_SUBSECOND_TIMES,
        )
    }

    async fn path_stat(&self, ty: u8, path: &str) -> Result<FileAttributes> {
        let flags = Self::stat_flags(self.version());
        let response = self
            .transact(ty, |buf| {
                buf.put_str(path);
                if let Some(flags) = flags {
                    buf.put_u32(flags);
                }
            })
            .await?;
        Self::expect_attrs(response)
    }

    /// Attributes of `path`, following symlinks.
    pub async fn stat(&self, path: &str) -> Result<FileAttributes> {
        self.path_stat(SSH_FXP_STAT, path).await
    }

    /// Attributes of `path` itself, not following symlinks.
    pub async fn lstat(&self, path: &str) -> Result<FileAttributes> {
        self.path_stat(SSH_FXP_LSTAT, path).await
    }

    /// Attributes of an open handle.
    pub async fn fstat(&self, handle: &SftpHandle) -> Result<FileAttributes> {
        let flags = Self::stat_flags(self.version());
        let response = self
            .transact(SSH_FXP_FSTAT, |buf| {
                buf.put_string(&handle.raw);
                if let Some(flags) = flags {
                    buf.put_u32(flags);
                }
            })
            .await?;
        Self::expect_attrs(response)
    }

    /// Change attributes of `path`.
    pub async fn setstat(&self, path: &str, attrs: &FileAttributes) -> Result<()> {
        let version = self.version();
        let response = self
            .transact(SSH_FXP_SETSTAT, |buf| {
                buf.put_str(path);
                attrs.encode(buf, version);
            })
            .await?;
        Self::expect_ok(response)
    }

    /// Change attributes of an open handle.
    pub async fn fsetstat(&self, handle: &SftpHandle, attrs: &FileAttributes) -> Result<()> {
        let version = self.version();
        let response = self
            .transact(SSH_FXP_FSETSTAT, |buf| {
                buf.put_string(&handle.raw);
                attrs.encode(buf, version);
            })
            .await?;
        Self::expect_ok(response)
    }

    /// Open a directory for listing.
    pub async fn opendir(&self, path: &str) -> Result<SftpHandle> {
        let response = self
            .transact(SSH_FXP_OPENDIR, |buf| buf.put_str(path))
            .await?;
        self.expect_handle(response)
    }

    /// The next batch of directory entries; `Ok(None)` ends the
    /// iteration.
    pub async fn readdir(&self, handle: &SftpHandle) -> Result<Option<Vec<NameEntry>>> {
        let response = self
            .transact(SSH_FXP_READDIR, |buf| buf.put_string(&handle.raw))
            .await?;
        match response {
            Response::Name(entries) => Ok(Some(entries)),
            Response::Status {
                code: SSH_FX_EOF, ..
            } => Ok(None),
            Response::Status { code, message } => Err(Self::status_error(code, message)),
            _ => Err(Error::Protocol("unexpected sftp response shape".into())),
        }
    }

    /// Create a directory.
    pub async fn mkdir(&self, path: &str, attrs: &FileAttributes) -> Result<()> {
        let version = self.version();
        let response = self
            .transact(SSH_FXP_MKDIR, |buf| {
                buf.put_str(path);
                attrs.encode(buf, version);
            })
            .await?;
        Self::expect_ok(response)
    }

    /// Remove a directory.
    pub async fn rmdir(&self, path: &str) -> Result<()> {
        let response = self.transact(SSH_FXP_RMDIR, |buf| buf.put_str(path)).await?;
        Self::expect_ok(response)
    }

    /// Remove a file.
    pub async fn remove(&self, path: &str) -> Result<()> {
        let response = self
            .transact(SSH_FXP_REMOVE, |buf| buf.put_str(path))
            .await?;
        Self::expect_ok(response)
    }

    /// Rename `oldpath` to `newpath`.
    pub async fn rename(&self, oldpath: &str, newpath: &str) -> Result<()> {
        let version = self.version();
        let response = self
            .transact(SSH_FXP_RENAME, |buf| {
                buf.put_str(oldpath);
                buf.put_str(newpath);
                if version >= 5 {
                    buf.put_u32(0);
                }
            })
            .await?;
        Self::expect_ok(response)
    }

    /// Atomic rename via `posix-rename@openssh.com`.
    pub async fn posix_rename(&self, oldpath: &str, newpath: &str) -> Result<()> {
        if !self.has_extension(EXT_POSIX_RENAME) {
            return Err(Self::status_error(SSH_FX_OP_UNSUPPORTED, String::new()));
        }
        let response = self
            .transact(SSH_FXP_EXTENDED, |buf| {
                buf.put_str(EXT_POSIX_RENAME);
                buf.put_str(oldpath);
                buf.put_str(newpath);
            })
            .await?;
        Self::expect_ok(response)
    }

    /// Canonicalize `path` on the server.
    pub async fn realpath(&self, path: &str) -> Result<String> {
        let response = self
            .transact(SSH_FXP_REALPATH, |buf| buf.put_str(path))
            .await?;
        Self::expect_single_name(response)
    }

    /// The target of the symlink at `path`.
    pub async fn readlink(&self, path: &str) -> Result<String> {
        let response = self
            .transact(SSH_FXP_READLINK, |buf| buf.put_str(path))
            .await?;
        Self::expect_single_name(response)
    }

    /// Create a symlink at `link_path` pointing at `target`.
    pub async fn symlink(&self, link_path: &str, target: &str) -> Result<()> {
        self.link(target, link_path, true).await
    }

    /// Create a link at `link_path` to `existing`. Hard links require
    /// protocol version 6; earlier versions reject them as unsupported.
    pub async fn link(&self, existing: &str, link_path: &str, symbolic: bool) -> Result<()> {
        let version = self.version();
        if version >= 6 {
            let response = self
                .transact(SSH_FXP_LINK, |buf| {
                    buf.put_str(link_path);
                    buf.put_str(existing);
                    buf.put_bool(symbolic);
                })
                .await?;
            return Self::expect_ok(response);
        }
        if !symbolic {
            return Err(Self::status_error(
                SSH_FX_OP_UNSUPPORTED,
                format!("hard links require sftp version 6, negotiated {}", version),
            ));
        }
        let response = self
            .transact(SSH_FXP_SYMLINK, |buf| {
                buf.put_str(link_path);
                buf.put_str(existing);
            })
            .await?;
        Self::expect_ok(response)
    }

    /// Raw extension request; the reply payload is returned verbatim.
    pub async fn extended(&self, name: &str, data: &[u8]) -> Result<Vec<u8>> {
        let response = self
            .transact(SSH_FXP_EXTENDED, |buf| {
                buf.put_str(name);
                buf.put_raw(data);
            })
            .await?;
        match response {
            Response::ExtendedReply(payload) => Ok(payload),
            Response::Status { code, message } => Err(Self::status_error(code, message)),
            _ => Err(Error::Protocol("unexpected sftp response shape".into())),
        }
    }

    /// Filesystem statistics via `statvfs@openssh.com`.
    pub async fn statvfs(&self, path: &str) -> Result<StatVfs> {
        if !self.has_extension(EXT_STATVFS) {
            return Err(Self::status_error(SSH_FX_OP_UNSUPPORTED, String::new()));
        }
        let mut payload = Buffer::new();
        payload.put_str(path);
        let reply = self.extended(EXT_STATVFS, payload.unread()).await?;
        let mut buf = Buffer::from_vec(reply);
        Ok(StatVfs {
            bsize: buf.get_u64()?,
            frsize: buf.get_u64()?,
            blocks: buf.get_u64()?,
            bfree: buf.get_u64()?,
            bavail: buf.get_u64()?,
            files: buf.get_u64()?,
            ffree: buf.get_u64()?,
            favail: buf.get_u64()?,
            fsid: buf.get_u64()?,
            flag: buf.get_u64()?,
            namemax: buf.get_u64()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_mode_maps_to_classic_flags() {
        let mode = OpenMode::READ | OpenMode::WRITE | OpenMode::CREATE | OpenMode::TRUNCATE;
        assert_eq!(
            mode.v3_flags(),
            SSH_FXF_READ | SSH_FXF_WRITE | SSH_FXF_CREAT | SSH_FXF_TRUNC
        );
    }

    #[test]
    fn open_mode_maps_to_v5_disposition() {
        assert_eq!(
            (OpenMode::CREATE | OpenMode::EXCLUSIVE).v5_flags(),
            SSH_FXF_CREATE_NEW
        );
        assert_eq!(
            (OpenMode::CREATE | OpenMode::TRUNCATE).v5_flags(),
            SSH_FXF_CREATE_TRUNCATE
        );
        assert_eq!(OpenMode::CREATE.v5_flags(), SSH_FXF_OPEN_OR_CREATE);
        assert_eq!(OpenMode::TRUNCATE.v5_flags(), SSH_FXF_TRUNCATE_EXISTING);
        assert_eq!(OpenMode::READ.v5_flags(), SSH_FXF_OPEN_EXISTING);
        assert_eq!(
            (OpenMode::WRITE | OpenMode::APPEND).v5_flags(),
            SSH_FXF_OPEN_EXISTING | SSH_FXF_APPEND_DATA
        );

        let access = (OpenMode::READ | OpenMode::WRITE).v5_access();
        assert_eq!(
            access,
            ACE4_READ_DATA | ACE4_READ_ATTRIBUTES | ACE4_WRITE_DATA | ACE4_WRITE_ATTRIBUTES
        );
    }

    #[test]
    fn frames_carry_their_length() {
        let buf = frame(SSH_FXP_INIT, None, |b| b.put_u32(6));
        assert_eq!(buf.unread(), [0, 0, 0, 5, SSH_FXP_INIT, 0, 0, 0, 6]);

        let buf = frame(SSH_FXP_RMDIR, Some(3), |b| b.put_str("/tmp"));
        let mut parsed = Buffer::from_vec(buf.unread().to_vec());
        let len = parsed.get_u32().unwrap() as usize;
        assert_eq!(len, parsed.available());
        assert_eq!(parsed.get_u8().unwrap(), SSH_FXP_RMDIR);
        assert_eq!(parsed.get_u32().unwrap(), 3);
        assert_eq!(parsed.get_str().unwrap(), "/tmp");
    }
}
