//! The SFTP subsystem (draft-ietf-secsh-filexfer, versions 3 through 6):
//! a request–reply file-transfer protocol spoken over a session channel.

/// The subsystem name requested on a session channel.
pub const SFTP_SUBSYSTEM: &str = "sftp";

pub mod attrs;
pub mod proto;

mod client;
pub use client::{NameEntry, OpenMode, SftpClient, SftpHandle, StatVfs};

mod server;
pub use server::{SftpSubsystem, SftpSubsystemFactory};
