//! ADB host-service framing and connection setup
//!
//! Every request to the ADB server is a 4-hex-digit length prefix
//! followed by an ASCII service string; every response starts with a
//! 4-byte `OKAY`/`FAIL` status. Non-host services additionally require a
//! transport-switch exchange right after the TCP connect.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{AdbError, Result};
use crate::options::{TransportOption, TransportType};
use crate::server;

/// Longest service string accepted by the server, excluding the prefix.
const MAX_SERVICE_LEN: usize = 1024;

/// Write one length-prefixed service string.
pub(crate) async fn send_service(stream: &mut TcpStream, service: &str) -> Result<()> {
    if service.len() > MAX_SERVICE_LEN {
        return Err(AdbError::Protocol(format!(
            "service string too long: {} bytes",
            service.len()
        )));
    }

    let framed = format!("{:04x}{}", service.len(), service);
    stream.write_all(framed.as_bytes()).await?;
    Ok(())
}

/// Read one length-prefixed string.
pub(crate) async fn read_hex_string(stream: &mut TcpStream) -> Result<String> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;

    let len_str = std::str::from_utf8(&len_buf)
        .map_err(|_| AdbError::Protocol("length prefix is not ASCII".into()))?;
    let len = usize::from_str_radix(len_str, 16)
        .map_err(|_| AdbError::Protocol(format!("bad length prefix {len_str:?}")))?;

    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    String::from_utf8(buf).map_err(|_| AdbError::Protocol("response is not valid UTF-8".into()))
}

/// Read a 4-byte status; a `FAIL` carries a length-prefixed message.
pub(crate) async fn read_status(stream: &mut TcpStream) -> Result<()> {
    let mut status = [0u8; 4];
    stream.read_exact(&mut status).await?;

    match &status {
        b"OKAY" => Ok(()),
        b"FAIL" => {
            let msg = read_hex_string(stream).await?;
            Err(AdbError::Protocol(msg))
        }
        other => Err(AdbError::Protocol(format!(
            "protocol fault (status {:02x} {:02x} {:02x} {:02x})",
            other[0], other[1], other[2], other[3]
        ))),
    }
}

/// Send the transport selector for `option` and read back the transport
/// id unless one was pinned up front.
pub(crate) async fn switch_transport(
    stream: &mut TcpStream,
    option: &TransportOption,
) -> Result<i64> {
    if let Some(id) = option.transport_id {
        send_service(stream, &format!("host:transport-id:{id}")).await?;
    } else if !option.serial.is_empty() {
        send_service(stream, &format!("host:tport:serial:{}", option.serial)).await?;
    } else {
        let kind = match option.transport_type {
            TransportType::Usb => "usb",
            TransportType::Local => "local",
            TransportType::Any => "any",
        };
        send_service(stream, &format!("host:tport:{kind}")).await?;
    }

    // A refusal here means no usable transport, which callers treat the
    // same as not reaching the server at all.
    read_status(stream).await.map_err(|e| match e {
        AdbError::Protocol(msg) => AdbError::Connect(msg),
        other => other,
    })?;

    if let Some(id) = option.transport_id {
        return Ok(id);
    }

    let mut id_buf = [0u8; 8];
    stream.read_exact(&mut id_buf).await?;
    Ok(i64::from_le_bytes(id_buf))
}

/// Connect to the ADB server and open `service`.
pub(crate) async fn connect(option: &TransportOption, service: &str) -> Result<TcpStream> {
    let (stream, _) = connect_with_id(option, service).await?;
    Ok(stream)
}

/// As [`connect`], also returning the transport id selected for a
/// non-host service (0 for host services).
pub(crate) async fn connect_with_id(
    option: &TransportOption,
    service: &str,
) -> Result<(TcpStream, i64)> {
    let endpoint = option.endpoint();

    let mut stream = match TcpStream::connect(&endpoint).await {
        Ok(stream) => stream,
        Err(e) => {
            if !option.launch_server || !server::claim_launch_attempt() {
                return Err(AdbError::Connect(e.to_string()));
            }
            server::launch_server().await?;
            // One retry after a successful autostart.
            TcpStream::connect(&endpoint)
                .await
                .map_err(|e| AdbError::Connect(e.to_string()))?
        }
    };

    let mut transport_id = 0;
    if !service.starts_with("host") {
        transport_id = switch_transport(&mut stream, option).await?;
    }

    send_service(&mut stream, service).await?;
    read_status(&mut stream).await?;

    Ok((stream, transport_id))
}
