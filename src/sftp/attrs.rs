//! The sparse file-attribute record and its two wire encodings: the
//! version 3 layout and the version 4+ layout with a type byte, named
//! owner/group and split timestamps.

use crate::buffer::Buffer;
use crate::error::Result;
use crate::sftp::proto::*;

/// Seconds since the epoch with optional sub-second precision
/// (version 4+ only; version 3 truncates to whole seconds).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Timestamp {
    /// Whole seconds.
    pub seconds: u64,
    /// Nanoseconds, when the peer sent sub-second times.
    pub nanoseconds: Option<u32>,
}

impl Timestamp {
    /// A timestamp with whole-second precision.
    pub fn from_seconds(seconds: u64) -> Self {
        Timestamp {
            seconds,
            nanoseconds: None,
        }
    }
}

/// A sparse record of file attributes; absent fields were not sent.
///
/// The permissions field always carries POSIX type bits: under the
/// version 4+ encoding they are synthesized from the type byte on
/// decode, so callers can treat either version uniformly.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct FileAttributes {
    /// Version 4+ file-type byte; derived from the permissions under
    /// version 3.
    pub kind: Option<u8>,
    /// Size in bytes.
    pub size: Option<u64>,
    /// Numeric owner, version 3 only.
    pub uid_gid: Option<(u32, u32)>,
    /// Named owner and group, version 4+ only.
    pub owner_group: Option<(String, String)>,
    /// POSIX permission and type bits.
    pub permissions: Option<u32>,
    /// Last access time.
    pub atime: Option<Timestamp>,
    /// Creation time, version 4+ only.
    pub create_time: Option<Timestamp>,
    /// Last modification time.
    pub mtime: Option<Timestamp>,
    /// Raw ACL blob, version 4+ only.
    pub acl: Option<Vec<u8>>,
    /// Vendor extensions as name/data pairs.
    pub extended: Vec<(String, Vec<u8>)>,
}

/// The POSIX type bits for a version 4+ type byte.
pub fn type_bits(kind: u8) -> u32 {
    match kind {
        SSH_FILEXFER_TYPE_REGULAR => S_IFREG,
        SSH_FILEXFER_TYPE_DIRECTORY => S_IFDIR,
        SSH_FILEXFER_TYPE_SYMLINK => S_IFLNK,
        SSH_FILEXFER_TYPE_SOCKET => S_IFSOCK,
        SSH_FILEXFER_TYPE_CHAR_DEVICE => S_IFCHR,
        SSH_FILEXFER_TYPE_BLOCK_DEVICE => S_IFBLK,
        SSH_FILEXFER_TYPE_FIFO => S_IFIFO,
        _ => 0,
    }
}

/// The version 4+ type byte for a set of POSIX type bits.
pub fn kind_from_permissions(permissions: u32) -> u8 {
    match permissions & S_IFMT {
        S_IFREG => SSH_FILEXFER_TYPE_REGULAR,
        S_IFDIR => SSH_FILEXFER_TYPE_DIRECTORY,
        S_IFLNK => SSH_FILEXFER_TYPE_SYMLINK,
        S_IFSOCK => SSH_FILEXFER_TYPE_SOCKET,
        S_IFCHR => SSH_FILEXFER_TYPE_CHAR_DEVICE,
        S_IFBLK => SSH_FILEXFER_TYPE_BLOCK_DEVICE,
        S_IFIFO => SSH_FILEXFER_TYPE_FIFO,
        _ => SSH_FILEXFER_TYPE_UNKNOWN,
    }
}

impl FileAttributes {
    /// Whether any sub-second component is present.
    fn has_subseconds(&self) -> bool {
        [self.atime, self.create_time, self.mtime]
            .iter()
            .flatten()
            .any(|t| t.nanoseconds.is_some())
    }

    /// Encode under the negotiated `version`.
    pub fn encode(&self, buf: &mut Buffer, version: u32) {
        if version <= 3 {
            self.encode_v3(buf)
        } else {
            self.encode_v4(buf)
        }
    }

    fn encode_v3(&self, buf: &mut Buffer) {
        let mut flags = 0u32;
        if self.size.is_some() {
            flags |= SSH_FILEXFER_ATTR_SIZE;
        }
        if self.uid_gid.is_some() {
            flags |= SSH_FILEXFER_ATTR_UIDGID;
        }
        if self.permissions.is_some() {
            flags |= SSH_FILEXFER_ATTR_PERMISSIONS;
        }
        let times = match (self.atime, self.mtime) {
            (Some(a), Some(m)) => {
                flags |= SSH_FILEXFER_ATTR_ACMODTIME;
                Some((a, m))
            }
            _ => None,
        };
        if !self.extended.is_empty() {
            flags |= SSH_FILEXFER_ATTR_EXTENDED;
        }

        buf.put_u32(flags);
        if let Some(size) = self.size {
            buf.put_u64(size);
        }
        if let Some((uid, gid)) = self.uid_gid {
            buf.put_u32(uid);
            buf.put_u32(gid);
        }
        if let Some(perms) = self.permissions {
            buf.put_u32(perms);
        }
        if let Some((atime, mtime)) = times {
            buf.put_u32(atime.seconds as u32);
            buf.put_u32(mtime.seconds as u32);
        }
        self.encode_extended(buf);
    }

    fn encode_v4(&self, buf: &mut Buffer) {
        let mut flags = 0u32;
        if self.size.is_some() {
            flags |= SSH_FILEXFER_ATTR_SIZE;
        }
        if self.owner_group.is_some() {
            flags |= SSH_FILEXFER_ATTR_OWNERGROUP;
        }
        if self.permissions.is_some() {
            flags |= SSH_FILEXFER_ATTR_PERMISSIONS;
        }
        if self.atime.is_some() {
            flags |= SSH_FILEXFER_ATTR_ACCESSTIME;
        }
        if self.create_time.is_some() {
            flags |= SSH_FILEXFER_ATTR_CREATETIME;
        }
        if self.mtime.is_some() {
            flags |= SSH_FILEXFER_ATTR_MODIFYTIME;
        }
        if self.acl.is_some() {
            flags |= SSH_FILEXFER_ATTR_ACL;
        }
        let subseconds = self.has_subseconds();
        if subseconds {
            flags |= SSH_FILEXFER_ATTR_SUBSECOND_TIMES;
        }
        if !self.extended.is_empty() {
            flags |= SSH_FILEXFER_ATTR_EXTENDED;
        }

        let kind = self
            .kind
            .or_else(|| self.permissions.map(kind_from_permissions))
            .unwrap_or(SSH_FILEXFER_TYPE_UNKNOWN);

        buf.put_u32(flags);
        buf.put_u8(kind);
        if let Some(size) = self.size {
            buf.put_u64(size);
        }
        if let Some((owner, group)) = &self.owner_group {
            buf.put_str(owner);
            buf.put_str(group);
        }
        if let Some(perms) = self.permissions {
            buf.put_u32(perms);
        }
        let put_time = |buf: &mut Buffer, t: Timestamp| {
            buf.put_u64(t.seconds);
            if subseconds {
                buf.put_u32(t.nanoseconds.unwrap_or(0));
            }
        };
        if let Some(t) = self.atime {
            put_time(buf, t);
        }
        if let Some(t) = self.create_time {
            put_time(buf, t);
        }
        if let Some(t) = self.mtime {
            put_time(buf, t);
        }
        if let Some(acl) = &self.acl {
            buf.put_string(acl);
        }
        self.encode_extended(buf);
    }

    fn encode_extended(&self, buf: &mut Buffer) {
        if self.extended.is_empty() {
            return;
        }
        buf.put_u32(self.extended.len() as u32);
        for (name, data) in &self.extended {
            buf.put_str(name);
            buf.put_string(data);
        }
    }

    /// Decode under the negotiated `version`.
    pub fn decode(buf: &mut Buffer, version: u32) -> Result<Self> {
        if version <= 3 {
            Self::decode_v3(buf)
        } else {
            Self::decode_v4(buf)
        }
    }

    fn decode_v3(buf: &mut Buffer) -> Result<Self> {
        let flags = buf.get_u32()?;
        let mut attrs = FileAttributes::default();
        if flags & SSH_FILEXFER_ATTR_SIZE != 0 {
            attrs.size = Some(buf.get_u64()?);
        }
        if flags & SSH_FILEXFER_ATTR_UIDGID != 0 {
            attrs.uid_gid = Some((buf.get_u32()?, buf.get_u32()?));
        }
        if flags & SSH_FILEXFER_ATTR_PERMISSIONS != 0 {
            let perms = buf.get_u32()?;
            attrs.permissions = Some(perms);
            attrs.kind = Some(kind_from_permissions(perms));
        }
        if flags & SSH_FILEXFER_ATTR_ACMODTIME != 0 {
            attrs.atime = Some(Timestamp::from_seconds(buf.get_u32()? as u64));
            attrs.mtime = Some(Timestamp::from_seconds(buf.get_u32()? as u64));
        }
        if flags & SSH_FILEXFER_ATTR_EXTENDED != 0 {
            attrs.extended = Self::decode_extended(buf)?;
        }
        Ok(attrs)
    }

    fn decode_v4(buf: &mut Buffer) -> Result<Self> {
        let flags = buf.get_u32()?;
        let kind = buf.get_u8()?;
        let subseconds = flags & SSH_FILEXFER_ATTR_SUBSECOND_TIMES != 0;

        let mut attrs = FileAttributes {
            kind: Some(kind),
            ..FileAttributes::default()
        };
        if flags & SSH_FILEXFER_ATTR_SIZE != 0 {
            attrs.size = Some(buf.get_u64()?);
        }
        if flags & SSH_FILEXFER_ATTR_OWNERGROUP != 0 {
            attrs.owner_group = Some((buf.get_str()?, buf.get_str()?));
        }
        if flags & SSH_FILEXFER_ATTR_PERMISSIONS != 0 {
            // Augment with the POSIX type bits so either encoding reads
            // the same downstream.
            attrs.permissions = Some(buf.get_u32()? & !S_IFMT | type_bits(kind));
        }
        let get_time = |buf: &mut Buffer| -> Result<Timestamp> {
            Ok(Timestamp {
                seconds: buf.get_u64()?,
                nanoseconds: if subseconds { Some(buf.get_u32()?) } else { None },
            })
        };
        if flags & SSH_FILEXFER_ATTR_ACCESSTIME != 0 {
            attrs.atime = Some(get_time(buf)?);
        }
        if flags & SSH_FILEXFER_ATTR_CREATETIME != 0 {
            attrs.create_time = Some(get_time(buf)?);
        }
        if flags & SSH_FILEXFER_ATTR_MODIFYTIME != 0 {
            attrs.mtime = Some(get_time(buf)?);
        }
        if flags & SSH_FILEXFER_ATTR_ACL != 0 {
            attrs.acl = Some(buf.get_string()?);
        }
        if flags & SSH_FILEXFER_ATTR_EXTENDED != 0 {
            attrs.extended = Self::decode_extended(buf)?;
        }
        Ok(attrs)
    }

    fn decode_extended(buf: &mut Buffer) -> Result<Vec<(String, Vec<u8>)>> {
        let count = buf.get_u32()?;
        let mut extended = Vec::with_capacity(count.min(64) as usize);
        for _ in 0..count {
            extended.push((buf.get_str()?, buf.get_string()?));
        }
        Ok(extended)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(attrs: &FileAttributes, version: u32) -> FileAttributes {
        let mut buf = Buffer::new();
        attrs.encode(&mut buf, version);
        FileAttributes::decode(&mut buf, version).unwrap()
    }

    #[test]
    fn v3_round_trips_every_flag_combination() {
        for mask in 0u32..32 {
            let mut attrs = FileAttributes::default();
            if mask & 1 != 0 {
                attrs.size = Some(1234);
            }
            if mask & 2 != 0 {
                attrs.uid_gid = Some((1000, 100));
            }
            if mask & 4 != 0 {
                attrs.permissions = Some(S_IFREG | 0o644);
                attrs.kind = Some(SSH_FILEXFER_TYPE_REGULAR);
            }
            if mask & 8 != 0 {
                attrs.atime = Some(Timestamp::from_seconds(1_700_000_000));
                attrs.mtime = Some(Timestamp::from_seconds(1_700_000_001));
            }
            if mask & 16 != 0 {
                attrs.extended = vec![("test@example.com".into(), b"blob".to_vec())];
            }
            let got = round_trip(&attrs, 3);
            assert_eq!(got, attrs, "mask {:#b}", mask);
        }
    }

    #[test]
    fn v4_round_trips_every_flag_combination() {
        for mask in 0u32..256 {
            let mut attrs = FileAttributes {
                kind: Some(SSH_FILEXFER_TYPE_DIRECTORY),
                ..FileAttributes::default()
            };
            if mask & 1 != 0 {
                attrs.size = Some(4096);
            }
            if mask & 2 != 0 {
                attrs.owner_group = Some(("user".into(), "wheel".into()));
            }
            if mask & 4 != 0 {
                attrs.permissions = Some(S_IFDIR | 0o755);
            }
            if mask & 8 != 0 {
                attrs.atime = Some(Timestamp::from_seconds(1_700_000_000));
            }
            if mask & 16 != 0 {
                attrs.create_time = Some(Timestamp::from_seconds(1_600_000_000));
            }
            if mask & 32 != 0 {
                attrs.mtime = Some(Timestamp::from_seconds(1_700_000_100));
            }
            if mask & 64 != 0 {
                attrs.acl = Some(b"\x00\x00\x00\x01ace".to_vec());
            }
            if mask & 128 != 0 {
                attrs.extended = vec![("test@example.com".into(), b"blob".to_vec())];
            }
            let got = round_trip(&attrs, 6);
            assert_eq!(got, attrs, "mask {:#b}", mask);
        }
    }

    #[test]
    fn v4_subsecond_times_round_trip() {
        let attrs = FileAttributes {
            kind: Some(SSH_FILEXFER_TYPE_REGULAR),
            atime: Some(Timestamp {
                seconds: 10,
                nanoseconds: Some(500_000_000),
            }),
            mtime: Some(Timestamp {
                seconds: 20,
                nanoseconds: Some(250_000_000),
            }),
            ..FileAttributes::default()
        };
        let mut buf = Buffer::new();
        attrs.encode(&mut buf, 6);
        let got = FileAttributes::decode(&mut buf, 6).unwrap();
        assert_eq!(got.atime.unwrap().nanoseconds, Some(500_000_000));
        assert_eq!(got.mtime.unwrap().nanoseconds, Some(250_000_000));
    }

    #[test]
    fn v4_decode_synthesizes_posix_type_bits() {
        let mut buf = Buffer::new();
        buf.put_u32(SSH_FILEXFER_ATTR_PERMISSIONS);
        buf.put_u8(SSH_FILEXFER_TYPE_SYMLINK);
        buf.put_u32(0o777);
        let attrs = FileAttributes::decode(&mut buf, 5).unwrap();
        assert_eq!(attrs.permissions, Some(S_IFLNK | 0o777));
        assert_eq!(attrs.kind, Some(SSH_FILEXFER_TYPE_SYMLINK));
    }

    #[test]
    fn v3_decode_derives_kind_from_permissions() {
        let mut buf = Buffer::new();
        buf.put_u32(SSH_FILEXFER_ATTR_PERMISSIONS);
        buf.put_u32(S_IFDIR | 0o700);
        let attrs = FileAttributes::decode(&mut buf, 3).unwrap();
        assert_eq!(attrs.kind, Some(SSH_FILEXFER_TYPE_DIRECTORY));
    }

}
