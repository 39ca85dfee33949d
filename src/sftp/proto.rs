//! Wire constants of the SFTP protocol, versions 3 through 6
//! (draft-ietf-secsh-filexfer).

#![allow(missing_docs)]

/// Lowest protocol version this implementation speaks.
pub const LOWEST_VERSION: u32 = 3;
/// Highest protocol version this implementation speaks.
pub const HIGHEST_VERSION: u32 = 6;

// Requests.
pub const SSH_FXP_INIT: u8 = 1;
pub const SSH_FXP_VERSION: u8 = 2;
pub const SSH_FXP_OPEN: u8 = 3;
pub const SSH_FXP_CLOSE: u8 = 4;
pub const SSH_FXP_READ: u8 = 5;
pub const SSH_FXP_WRITE: u8 = 6;
pub const SSH_FXP_LSTAT: u8 = 7;
pub const SSH_FXP_FSTAT: u8 = 8;
pub const SSH_FXP_SETSTAT: u8 = 9;
pub const SSH_FXP_FSETSTAT: u8 = 10;
pub const SSH_FXP_OPENDIR: u8 = 11;
pub const SSH_FXP_READDIR: u8 = 12;
pub const SSH_FXP_REMOVE: u8 = 13;
pub const SSH_FXP_MKDIR: u8 = 14;
pub const SSH_FXP_RMDIR: u8 = 15;
pub const SSH_FXP_REALPATH: u8 = 16;
pub const SSH_FXP_STAT: u8 = 17;
pub const SSH_FXP_RENAME: u8 = 18;
pub const SSH_FXP_READLINK: u8 = 19;
pub const SSH_FXP_SYMLINK: u8 = 20;
/// Version 6 and later only.
pub const SSH_FXP_LINK: u8 = 21;

// Responses.
pub const SSH_FXP_STATUS: u8 = 101;
pub const SSH_FXP_HANDLE: u8 = 102;
pub const SSH_FXP_DATA: u8 = 103;
pub const SSH_FXP_NAME: u8 = 104;
pub const SSH_FXP_ATTRS: u8 = 105;

pub const SSH_FXP_EXTENDED: u8 = 200;
pub const SSH_FXP_EXTENDED_REPLY: u8 = 201;

// Status codes.
pub const SSH_FX_OK: u32 = 0;
pub const SSH_FX_EOF: u32 = 1;
pub const SSH_FX_NO_SUCH_FILE: u32 = 2;
pub const SSH_FX_PERMISSION_DENIED: u32 = 3;
pub const SSH_FX_FAILURE: u32 = 4;
pub const SSH_FX_BAD_MESSAGE: u32 = 5;
pub const SSH_FX_NO_CONNECTION: u32 = 6;
pub const SSH_FX_CONNECTION_LOST: u32 = 7;
pub const SSH_FX_OP_UNSUPPORTED: u32 = 8;
pub const SSH_FX_INVALID_HANDLE: u32 = 9;
pub const SSH_FX_NO_SUCH_PATH: u32 = 10;
pub const SSH_FX_FILE_ALREADY_EXISTS: u32 = 11;
pub const SSH_FX_WRITE_PROTECT: u32 = 12;

// Classic open flags (versions 3 and 4).
pub const SSH_FXF_READ: u32 = 0x0000_0001;
pub const SSH_FXF_WRITE: u32 = 0x0000_0002;
pub const SSH_FXF_APPEND: u32 = 0x0000_0004;
pub const SSH_FXF_CREAT: u32 = 0x0000_0008;
pub const SSH_FXF_TRUNC: u32 = 0x0000_0010;
pub const SSH_FXF_EXCL: u32 = 0x0000_0020;

// Version 5+ dispositions (low bits of the flags field).
pub const SSH_FXF_CREATE_NEW: u32 = 0;
pub const SSH_FXF_CREATE_TRUNCATE: u32 = 1;
pub const SSH_FXF_OPEN_EXISTING: u32 = 2;
pub const SSH_FXF_OPEN_OR_CREATE: u32 = 3;
pub const SSH_FXF_TRUNCATE_EXISTING: u32 = 4;
pub const SSH_FXF_ACCESS_DISPOSITION: u32 = 0x0000_0007;
pub const SSH_FXF_APPEND_DATA: u32 = 0x0000_0008;

// Version 5+ desired-access bits (NFSv4 ACE mask).
pub const ACE4_READ_DATA: u32 = 0x0000_0001;
pub const ACE4_WRITE_DATA: u32 = 0x0000_0002;
pub const ACE4_APPEND_DATA: u32 = 0x0000_0004;
pub const ACE4_READ_ATTRIBUTES: u32 = 0x0000_0080;
pub const ACE4_WRITE_ATTRIBUTES: u32 = 0x0000_0100;

// Attribute-presence flags. Bit 0x8 means atime+mtime pair in version 3
// and access-time in version 4+.
pub const SSH_FILEXFER_ATTR_SIZE: u32 = 0x0000_0001;
pub const SSH_FILEXFER_ATTR_UIDGID: u32 = 0x0000_0002;
pub const SSH_FILEXFER_ATTR_PERMISSIONS: u32 = 0x0000_0004;
pub const SSH_FILEXFER_ATTR_ACMODTIME: u32 = 0x0000_0008;
pub const SSH_FILEXFER_ATTR_ACCESSTIME: u32 = 0x0000_0008;
pub const SSH_FILEXFER_ATTR_CREATETIME: u32 = 0x0000_0010;
pub const SSH_FILEXFER_ATTR_MODIFYTIME: u32 = 0x0000_0020;
pub const SSH_FILEXFER_ATTR_ACL: u32 = 0x0000_0040;
pub const SSH_FILEXFER_ATTR_OWNERGROUP: u32 = 0x0000_0080;
pub const SSH_FILEXFER_ATTR_SUBSECOND_TIMES: u32 = 0x0000_0100;
pub const SSH_FILEXFER_ATTR_EXTENDED: u32 = 0x8000_0000;

// Version 4+ file-type byte.
pub const SSH_FILEXFER_TYPE_REGULAR: u8 = 1;
pub const SSH_FILEXFER_TYPE_DIRECTORY: u8 = 2;
pub const SSH_FILEXFER_TYPE_SYMLINK: u8 = 3;
pub const SSH_FILEXFER_TYPE_SPECIAL: u8 = 4;
pub const SSH_FILEXFER_TYPE_UNKNOWN: u8 = 5;
pub const SSH_FILEXFER_TYPE_SOCKET: u8 = 6;
pub const SSH_FILEXFER_TYPE_CHAR_DEVICE: u8 = 7;
pub const SSH_FILEXFER_TYPE_BLOCK_DEVICE: u8 = 8;
pub const SSH_FILEXFER_TYPE_FIFO: u8 = 9;

// POSIX type bits carried in the permissions field.
pub const S_IFMT: u32 = 0o170000;
pub const S_IFSOCK: u32 = 0o140000;
pub const S_IFLNK: u32 = 0o120000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFBLK: u32 = 0o060000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFCHR: u32 = 0o020000;
pub const S_IFIFO: u32 = 0o010000;

// Well-known OpenSSH extensions.
pub const EXT_POSIX_RENAME: &str = "posix-rename@openssh.com";
pub const EXT_STATVFS: &str = "statvfs@openssh.com";
pub const EXT_FSTATVFS: &str = "fstatvfs@openssh.com";
pub const EXT_HARDLINK: &str = "hardlink@openssh.com";

/// Default human-readable text for a status code.
pub fn status_text(code: u32) -> &'static str {
    match code {
        SSH_FX_OK => "Success",
        SSH_FX_EOF => "End of file",
        SSH_FX_NO_SUCH_FILE => "No such file",
        SSH_FX_PERMISSION_DENIED => "Permission denied",
        SSH_FX_FAILURE => "Failure",
        SSH_FX_BAD_MESSAGE => "Bad message",
        SSH_FX_NO_CONNECTION => "No connection",
        SSH_FX_CONNECTION_LOST => "Connection lost",
        SSH_FX_OP_UNSUPPORTED => "Operation unsupported",
        SSH_FX_INVALID_HANDLE => "Invalid handle",
        SSH_FX_NO_SUCH_PATH => "No such path",
        SSH_FX_FILE_ALREADY_EXISTS => "File already exists",
        SSH_FX_WRITE_PROTECT => "Write protected",
        _ => "Unknown status",
    }
}
