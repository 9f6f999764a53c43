//! Shell protocol v2
//!
//! Framed packets: a one-byte packet id, a 4-byte little-endian length,
//! and the payload. The client drives stdout/stderr accumulation until
//! an exit packet delivers the one-byte status. Servers without
//! `shell_v2` stream raw stdout to EOF instead.

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

use crate::error::Result;

const ID_STDOUT: u8 = 1;
const ID_STDERR: u8 = 2;
const ID_EXIT: u8 = 3;
// Ids 0 (stdin), 4 (close-stdin) and 5 (window-size) never arrive on a
// read-only shell stream; unknown ids are drained and dropped.

const READ_BUFFER_SIZE: usize = 40960;

/// Result of a shell execution.
#[derive(Debug, Clone, Default)]
pub struct ShellOutput {
    pub exit_code: u8,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Drain a shell-v2 stream until the exit packet.
pub(crate) async fn read_shell_output(stream: &mut TcpStream) -> Result<ShellOutput> {
    let mut out = ShellOutput::default();
    let mut chunk = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let mut header = [0u8; 5];
        stream.read_exact(&mut header).await?;

        let id = header[0];
        let mut remaining =
            u32::from_le_bytes([header[1], header[2], header[3], header[4]]) as usize;

        if id == ID_EXIT {
            if remaining >= 1 {
                let mut status = [0u8; 1];
                stream.read_exact(&mut status).await?;
                out.exit_code = status[0];
                remaining -= 1;
            }
            skip(stream, &mut chunk, remaining).await?;
            return Ok(out);
        }

        while remaining > 0 {
            let n = remaining.min(chunk.len());
            stream.read_exact(&mut chunk[..n]).await?;
            match id {
                ID_STDOUT => out.stdout.extend_from_slice(&chunk[..n]),
                ID_STDERR => out.stderr.extend_from_slice(&chunk[..n]),
                _ => {}
            }
            remaining -= n;
        }
    }
}

/// Read a raw (non-v2) stream to EOF; status is 0, stderr empty.
pub(crate) async fn read_raw_output(stream: &mut TcpStream) -> Result<ShellOutput> {
    let mut stdout = Vec::new();
    stream.read_to_end(&mut stdout).await?;
    Ok(ShellOutput {
        exit_code: 0,
        stdout,
        stderr: Vec::new(),
    })
}

/// Read the entire remaining stream as raw bytes.
pub(crate) async fn read_to_end(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    stream.read_to_end(&mut out).await?;
    Ok(out)
}

async fn skip(stream: &mut TcpStream, chunk: &mut [u8], mut remaining: usize) -> Result<()> {
    while remaining > 0 {
        let n = remaining.min(chunk.len());
        stream.read_exact(&mut chunk[..n]).await?;
        remaining -= n;
    }
    Ok(())
}
