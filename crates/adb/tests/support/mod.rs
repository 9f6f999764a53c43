//! Fake ADB server plumbing shared by the protocol test suites.
#![allow(dead_code)] // each suite uses its own subset

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use adb::{TransportOption, TransportType};

pub const ID_STAT: u32 = u32::from_le_bytes(*b"STAT");
pub const ID_STA2: u32 = u32::from_le_bytes(*b"STA2");
pub const ID_LST2: u32 = u32::from_le_bytes(*b"LST2");
pub const ID_LIST: u32 = u32::from_le_bytes(*b"LIST");
pub const ID_DENT: u32 = u32::from_le_bytes(*b"DENT");
pub const ID_SEND: u32 = u32::from_le_bytes(*b"SEND");
pub const ID_RECV: u32 = u32::from_le_bytes(*b"RECV");
pub const ID_DONE: u32 = u32::from_le_bytes(*b"DONE");
pub const ID_DATA: u32 = u32::from_le_bytes(*b"DATA");
pub const ID_OKAY: u32 = u32::from_le_bytes(*b"OKAY");
pub const ID_FAIL: u32 = u32::from_le_bytes(*b"FAIL");
pub const ID_QUIT: u32 = u32::from_le_bytes(*b"QUIT");

/// Bind a listener on an ephemeral port and build client options that
/// point at it with autostart disabled.
pub async fn bind_server() -> (TcpListener, TransportOption) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let option = TransportOption {
        server: "127.0.0.1".into(),
        port: port.to_string(),
        launch_server: false,
        ..Default::default()
    };
    (listener, option)
}

/// Options pointing at a port with no listener behind it.
pub async fn dead_server_option() -> TransportOption {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    TransportOption {
        server: "127.0.0.1".into(),
        port: port.to_string(),
        transport_type: TransportType::Any,
        launch_server: false,
        ..Default::default()
    }
}

/// Read one length-prefixed service string.
pub async fn read_service(stream: &mut TcpStream) -> String {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await.unwrap();
    let len = usize::from_str_radix(std::str::from_utf8(&len_buf).unwrap(), 16).unwrap();
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await.unwrap();
    String::from_utf8(buf).unwrap()
}

pub async fn write_okay(stream: &mut TcpStream) {
    stream.write_all(b"OKAY").await.unwrap();
}

pub async fn write_fail(stream: &mut TcpStream, msg: &str) {
    stream.write_all(b"FAIL").await.unwrap();
    write_framed_str(stream, msg).await;
}

/// Write one length-prefixed string.
pub async fn write_framed_str(stream: &mut TcpStream, s: &str) {
    let framed = format!("{:04x}{}", s.len(), s);
    stream.write_all(framed.as_bytes()).await.unwrap();
}

/// Service a transport-switch exchange and return the selector string.
pub async fn accept_transport(stream: &mut TcpStream, transport_id: i64) -> String {
    let selector = read_service(stream).await;
    assert!(
        selector.starts_with("host:tport:") || selector.starts_with("host:transport-id:"),
        "unexpected transport selector {selector:?}"
    );
    write_okay(stream).await;
    if selector.starts_with("host:tport:") {
        stream.write_all(&transport_id.to_le_bytes()).await.unwrap();
    }
    selector
}

/// Accept one connection and serve a `host:features` query on it.
pub async fn serve_features(listener: &TcpListener, features: &str) {
    let (mut stream, _) = listener.accept().await.unwrap();
    let service = read_service(&mut stream).await;
    assert_eq!(service, "host:features");
    write_okay(&mut stream).await;
    write_framed_str(&mut stream, features).await;
}

/// Accept one connection, expect the transport switch plus the `sync:`
/// service, and hand the stream over in sync mode.
pub async fn accept_sync(listener: &TcpListener) -> TcpStream {
    let (mut stream, _) = listener.accept().await.unwrap();
    accept_transport(&mut stream, 1).await;
    let service = read_service(&mut stream).await;
    assert_eq!(service, "sync:");
    write_okay(&mut stream).await;
    stream
}

/// Read one 8-byte sync request header.
pub async fn read_sync_header(stream: &mut TcpStream) -> (u32, u32) {
    let mut buf = [0u8; 8];
    stream.read_exact(&mut buf).await.unwrap();
    (
        u32::from_le_bytes(buf[0..4].try_into().unwrap()),
        u32::from_le_bytes(buf[4..8].try_into().unwrap()),
    )
}

/// Read one sync request that carries a path payload.
pub async fn read_sync_request(stream: &mut TcpStream) -> (u32, String) {
    let (id, len) = read_sync_header(stream).await;
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).await.unwrap();
    (id, String::from_utf8(buf).unwrap())
}

pub async fn write_sync_header(stream: &mut TcpStream, id: u32, arg: u32) {
    let mut buf = [0u8; 8];
    buf[0..4].copy_from_slice(&id.to_le_bytes());
    buf[4..8].copy_from_slice(&arg.to_le_bytes());
    stream.write_all(&buf).await.unwrap();
}

/// Write a v1 stat response.
pub async fn write_stat_v1(stream: &mut TcpStream, mode: u32, size: u32, mtime: u32) {
    let mut buf = Vec::with_capacity(16);
    buf.extend_from_slice(&ID_STAT.to_le_bytes());
    buf.extend_from_slice(&mode.to_le_bytes());
    buf.extend_from_slice(&size.to_le_bytes());
    buf.extend_from_slice(&mtime.to_le_bytes());
    stream.write_all(&buf).await.unwrap();
}

/// Write a v2 stat response (for both STA2 and LST2 requests).
pub async fn write_stat_v2(stream: &mut TcpStream, id: u32, error: u32, mode: u32, size: u64) {
    let mut buf = Vec::with_capacity(72);
    buf.extend_from_slice(&id.to_le_bytes());
    buf.extend_from_slice(&error.to_le_bytes());
    buf.extend_from_slice(&0u64.to_le_bytes()); // dev
    buf.extend_from_slice(&0u64.to_le_bytes()); // ino
    buf.extend_from_slice(&mode.to_le_bytes());
    buf.extend_from_slice(&1u32.to_le_bytes()); // nlink
    buf.extend_from_slice(&0u32.to_le_bytes()); // uid
    buf.extend_from_slice(&0u32.to_le_bytes()); // gid
    buf.extend_from_slice(&size.to_le_bytes());
    buf.extend_from_slice(&0i64.to_le_bytes()); // atime
    buf.extend_from_slice(&0i64.to_le_bytes()); // mtime
    buf.extend_from_slice(&0i64.to_le_bytes()); // ctime
    stream.write_all(&buf).await.unwrap();
}

/// Write a v1 directory entry.
pub async fn write_dent_v1(stream: &mut TcpStream, name: &str, mode: u32, size: u32, mtime: u32) {
    let mut buf = Vec::with_capacity(20 + name.len());
    buf.extend_from_slice(&ID_DENT.to_le_bytes());
    buf.extend_from_slice(&mode.to_le_bytes());
    buf.extend_from_slice(&size.to_le_bytes());
    buf.extend_from_slice(&mtime.to_le_bytes());
    buf.extend_from_slice(&(name.len() as u32).to_le_bytes());
    buf.extend_from_slice(name.as_bytes());
    stream.write_all(&buf).await.unwrap();
}

/// Terminate a v1 listing.
pub async fn write_list_done_v1(stream: &mut TcpStream) {
    let mut buf = Vec::with_capacity(20);
    buf.extend_from_slice(&ID_DONE.to_le_bytes());
    buf.extend_from_slice(&[0u8; 16]);
    stream.write_all(&buf).await.unwrap();
}

/// Collect DATA frames until DONE; returns the reassembled payload and
/// the individual chunk sizes.
pub async fn read_push_data(stream: &mut TcpStream) -> (Vec<u8>, Vec<usize>) {
    let mut payload = Vec::new();
    let mut chunks = Vec::new();
    loop {
        let (id, arg) = read_sync_header(stream).await;
        if id == ID_DONE {
            return (payload, chunks);
        }
        assert_eq!(id, ID_DATA, "unexpected sync id {id:#x}");
        let len = arg as usize;
        assert!(len <= 64 * 1024, "oversize DATA chunk {len}");
        let start = payload.len();
        payload.resize(start + len, 0);
        stream.read_exact(&mut payload[start..]).await.unwrap();
        chunks.push(len);
    }
}
