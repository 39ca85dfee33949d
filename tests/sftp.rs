//! SFTP end-to-end over a loopback session: version negotiation,
//! open/read/write/close, directory listing, stat and extensions.

mod common;

use std::sync::Arc;

use pretty_assertions::assert_eq;

use common::{spawn_pump, TestTransport};
use sshmux::sftp::attrs::FileAttributes;
use sshmux::sftp::proto::{SSH_FX_NO_SUCH_FILE, SSH_FX_OP_UNSUPPORTED, S_IFDIR, S_IFMT, S_IFREG};
use sshmux::sftp::{OpenMode, SftpClient, SftpSubsystemFactory};
use sshmux::{
    Completion, ConnectionConfig, ConnectionService, Error, SessionChannelFactory,
};

struct Loopback {
    client: Arc<ConnectionService>,
    _server: Arc<ConnectionService>,
    pump: tokio::task::JoinHandle<()>,
}

impl Drop for Loopback {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

fn loopback() -> Loopback {
    let client_transport = TestTransport::new();
    let server_transport = TestTransport::new();
    let client = ConnectionService::new(client_transport.clone(), ConnectionConfig::default());
    let server = ConnectionService::new(server_transport.clone(), ConnectionConfig::default());
    server.register_channel_factory(Arc::new(
        SessionChannelFactory::new().with_subsystem(Arc::new(SftpSubsystemFactory)),
    ));
    let pump = spawn_pump(
        client_transport,
        client.clone(),
        server_transport,
        server.clone(),
    );
    Loopback {
        client,
        _server: server,
        pump,
    }
}

async fn sftp_session(loopback: &Loopback) -> SftpClient {
    let channel = loopback.client.open_channel("session").unwrap();
    assert!(matches!(
        channel.open_result().wait().await,
        Completion::Value(Ok(()))
    ));
    SftpClient::start(channel).await.unwrap()
}

#[tokio::test]
async fn open_read_eof_close() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("x");
    std::fs::write(&path, "0123456789ABCDEF").unwrap();
    let path = path.to_str().unwrap().to_owned();

    let loopback = loopback();
    let sftp = sftp_session(&loopback).await;
    assert_eq!(sftp.version(), 6);

    let handle = sftp
        .open(&path, OpenMode::READ, &FileAttributes::default())
        .await
        .unwrap();

    let data = sftp.read(&handle, 0, 16).await.unwrap();
    assert_eq!(data.as_deref(), Some(&b"0123456789ABCDEF"[..]));

    // Reading past the end surfaces as end-of-file, not an error.
    let data = sftp.read(&handle, 16, 16).await.unwrap();
    assert_eq!(data, None);

    sftp.close(handle).await.unwrap();
}

#[tokio::test]
async fn write_then_stat_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.bin").to_str().unwrap().to_owned();

    let loopback = loopback();
    let sftp = sftp_session(&loopback).await;

    let handle = sftp
        .open(
            &path,
            OpenMode::WRITE | OpenMode::CREATE | OpenMode::TRUNCATE,
            &FileAttributes::default(),
        )
        .await
        .unwrap();
    sftp.write(&handle, 0, b"hello sftp").await.unwrap();
    sftp.write(&handle, 10, b" world").await.unwrap();
    let attrs = sftp.fstat(&handle).await.unwrap();
    assert_eq!(attrs.size, Some(16));
    sftp.close(handle).await.unwrap();

    let attrs = sftp.stat(&path).await.unwrap();
    assert_eq!(attrs.size, Some(16));
    assert_eq!(attrs.permissions.map(|p| p & S_IFMT), Some(S_IFREG));
    assert_eq!(std::fs::read(&path).unwrap(), b"hello sftp world");
}

#[tokio::test]
async fn directory_listing_ends_with_eof() {
    let dir = tempfile::tempdir().unwrap();
    for name in ["a", "b", "c"] {
        std::fs::write(dir.path().join(name), name).unwrap();
    }
    std::fs::create_dir(dir.path().join("sub")).unwrap();

    let loopback = loopback();
    let sftp = sftp_session(&loopback).await;

    let handle = sftp.opendir(dir.path().to_str().unwrap()).await.unwrap();
    let mut names = Vec::new();
    while let Some(batch) = sftp.readdir(&handle).await.unwrap() {
        for entry in batch {
            if entry.filename == "sub" {
                assert_eq!(entry.attrs.permissions.map(|p| p & S_IFMT), Some(S_IFDIR));
            }
            names.push(entry.filename);
        }
    }
    sftp.close(handle).await.unwrap();

    names.sort();
    assert_eq!(names, vec!["a", "b", "c", "sub"]);
}

#[tokio::test]
async fn missing_file_carries_substatus() {
    let loopback = loopback();
    let sftp = sftp_session(&loopback).await;

    match sftp.stat("/definitely/not/here").await {
        Err(Error::Sftp { code, .. }) => assert_eq!(code, SSH_FX_NO_SUCH_FILE),
        other => panic!("expected NO_SUCH_FILE, got {:?}", other),
    }
}

#[tokio::test]
async fn rename_remove_and_mkdir() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_str().unwrap().to_owned();
    std::fs::write(dir.path().join("old"), "payload").unwrap();

    let loopback = loopback();
    let sftp = sftp_session(&loopback).await;

    sftp.mkdir(&format!("{}/newdir", root), &FileAttributes::default())
        .await
        .unwrap();
    assert!(dir.path().join("newdir").is_dir());

    // The server advertises posix-rename; use it.
    sftp.posix_rename(&format!("{}/old", root), &format!("{}/newdir/new", root))
        .await
        .unwrap();
    assert!(dir.path().join("newdir/new").is_file());

    sftp.remove(&format!("{}/newdir/new", root)).await.unwrap();
    sftp.rmdir(&format!("{}/newdir", root)).await.unwrap();
    assert!(!dir.path().join("newdir").exists());
}

#[tokio::test]
async fn symlinks_and_hard_links() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_str().unwrap().to_owned();
    std::fs::write(dir.path().join("target"), "data").unwrap();

    let loopback = loopback();
    let sftp = sftp_session(&loopback).await;

    sftp.symlink(&format!("{}/sym", root), &format!("{}/target", root))
        .await
        .unwrap();
    let read = sftp.readlink(&format!("{}/sym", root)).await.unwrap();
    assert_eq!(read, format!("{}/target", root));

    // Version 6 serves hard links natively.
    sftp.link(
        &format!("{}/target", root),
        &format!("{}/hard", root),
        false,
    )
    .await
    .unwrap();
    assert_eq!(std::fs::read(dir.path().join("hard")).unwrap(), b"data");

    let realpath = sftp.realpath(&format!("{}/.", root)).await.unwrap();
    assert_eq!(realpath, std::fs::canonicalize(&root).unwrap().to_str().unwrap());
}

#[tokio::test]
async fn unknown_extension_is_unsupported() {
    let loopback = loopback();
    let sftp = sftp_session(&loopback).await;

    assert!(!sftp.has_extension("zeros@example.com"));
    match sftp.extended("zeros@example.com", &[]).await {
        Err(Error::Sftp { code, .. }) => assert_eq!(code, SSH_FX_OP_UNSUPPORTED),
        other => panic!("expected OP_UNSUPPORTED, got {:?}", other),
    }

    // statvfs is gated on the advertised extension list.
    match sftp.statvfs("/").await {
        Err(Error::Sftp { code, .. }) => assert_eq!(code, SSH_FX_OP_UNSUPPORTED),
        other => panic!("expected OP_UNSUPPORTED, got {:?}", other),
    }
}
