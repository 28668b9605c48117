//! Bulk-transport wire format, shared by the server and client sides.
//!
//! Commands travel as `{u8 cmd}{u16 arg_len be}{arg bytes}`; responses as
//! `{u8 status}`, with OK followed by an 8-byte big-endian size and raw
//! payload for listing and file bodies, and ERR followed by
//! `{u16 len}{message}`. The transport itself is a plain TCP stream; the
//! connection is the session.

use std::path::{Component, Path, PathBuf};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::constants::{MAX_ARG_LEN, MAX_LIST_SIZE};
use crate::content::normalize_rel_path;
use crate::error::{Error, Result};

// =============================================================================
// Commands and Status Codes
// =============================================================================

/// Request the full content listing of the shared root.
pub const CMD_LIST: u8 = 1;
/// Stream a file's bytes to the client.
pub const CMD_GET: u8 = 2;
/// Receive a file's bytes from the client.
pub const CMD_PUT: u8 = 3;
/// Remove a file from the shared root.
pub const CMD_DELETE: u8 = 4;
/// Liveness probe for cached sessions.
pub const CMD_PING: u8 = 5;

pub const STATUS_OK: u8 = 200;
pub const STATUS_ERR: u8 = 255;

// =============================================================================
// Framing Helpers
// =============================================================================

/// Send a command byte with its (possibly empty) argument.
pub async fn write_command<W>(stream: &mut W, cmd: u8, arg: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if arg.len() > MAX_ARG_LEN {
        return Err(Error::Protocol {
            message: format!("command argument of {} bytes too long", arg.len()),
        });
    }
    stream.write_u8(cmd).await?;
    stream.write_u16(arg.len() as u16).await?;
    if !arg.is_empty() {
        stream.write_all(arg.as_bytes()).await?;
    }
    stream.flush().await?;
    Ok(())
}

/// Read the next command and its argument. `Ok(None)` on clean EOF before
/// the command byte (the client hung up between requests).
pub async fn read_command<R>(stream: &mut R) -> Result<Option<(u8, String)>>
where
    R: AsyncRead + Unpin,
{
    let cmd = match stream.read_u8().await {
        Ok(cmd) => cmd,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let len = stream.read_u16().await? as usize;
    if len > MAX_ARG_LEN {
        return Err(Error::Protocol {
            message: format!("command argument of {len} bytes too long"),
        });
    }
    let mut arg = vec![0u8; len];
    stream.read_exact(&mut arg).await?;
    let arg = String::from_utf8(arg).map_err(|_| Error::Protocol {
        message: "command argument is not UTF-8".into(),
    })?;
    Ok(Some((cmd, arg)))
}

/// Send a bare OK status.
pub async fn write_ok<W>(stream: &mut W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    stream.write_u8(STATUS_OK).await?;
    stream.flush().await?;
    Ok(())
}

/// Send an OK status followed by a payload size header.
pub async fn write_ok_sized<W>(stream: &mut W, size: u64) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    stream.write_u8(STATUS_OK).await?;
    stream.write_u64(size).await?;
    stream.flush().await?;
    Ok(())
}

/// Send an ERR status with a message.
pub async fn write_err<W>(stream: &mut W, message: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let message = &message.as_bytes()[..message.len().min(u16::MAX as usize)];
    stream.write_u8(STATUS_ERR).await?;
    stream.write_u16(message.len() as u16).await?;
    stream.write_all(message).await?;
    stream.flush().await?;
    Ok(())
}

/// Read a status byte; ERR is surfaced as [`Error::TransferRejected`] with
/// the peer's message.
pub async fn read_status<R>(stream: &mut R) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let status = stream.read_u8().await?;
    match status {
        STATUS_OK => Ok(()),
        STATUS_ERR => {
            let len = stream.read_u16().await? as usize;
            let mut msg = vec![0u8; len];
            stream.read_exact(&mut msg).await?;
            Err(Error::TransferRejected {
                message: String::from_utf8_lossy(&msg).into_owned(),
            })
        }
        other => Err(Error::Protocol {
            message: format!("unexpected status byte {other}"),
        }),
    }
}

/// Read the 8-byte big-endian size header that follows an OK status.
pub async fn read_size<R>(stream: &mut R) -> Result<u64>
where
    R: AsyncRead + Unpin,
{
    Ok(stream.read_u64().await?)
}

/// Read a size-prefixed listing payload into a string.
pub async fn read_sized_text<R>(stream: &mut R) -> Result<String>
where
    R: AsyncRead + Unpin,
{
    let size = read_size(stream).await?;
    if size > MAX_LIST_SIZE {
        return Err(Error::Protocol {
            message: format!("listing of {size} bytes too large"),
        });
    }
    let mut payload = vec![0u8; size as usize];
    stream.read_exact(&mut payload).await?;
    String::from_utf8(payload).map_err(|_| Error::Protocol {
        message: "listing payload is not UTF-8".into(),
    })
}

// =============================================================================
// Path Safety
// =============================================================================

/// Normalize a received relative path and reject escapes.
///
/// Backslashes become forward slashes, leading slashes and `.` components
/// are stripped; `..` components, drive prefixes, and empty results are
/// rejected; a request must never resolve outside the shared root.
pub fn sanitize_rel_path(rel: &str) -> Result<String> {
    let normalized = normalize_rel_path(rel);
    let escape = || Error::PathEscape {
        path: rel.to_string(),
    };

    let mut parts: Vec<&str> = Vec::new();
    for part in normalized.split('/') {
        match part {
            "" | "." => continue,
            ".." => return Err(escape()),
            _ => {
                if part.contains(':') {
                    return Err(escape());
                }
                parts.push(part);
            }
        }
    }
    if parts.is_empty() {
        return Err(escape());
    }
    Ok(parts.join("/"))
}

/// Resolve a sanitized relative path against the shared root.
pub fn resolve_within(root: &Path, rel: &str) -> Result<PathBuf> {
    let clean = sanitize_rel_path(rel)?;
    let path = root.join(&clean);
    // Belt over braces: the joined path must still sit under the root.
    if path
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(Error::PathEscape {
            path: rel.to_string(),
        });
    }
    Ok(path)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_accepts_ordinary_paths() {
        assert_eq!(sanitize_rel_path("videos/foo.mp4").unwrap(), "videos/foo.mp4");
        assert_eq!(sanitize_rel_path("a/b/c").unwrap(), "a/b/c");
        assert_eq!(sanitize_rel_path("./a/./b").unwrap(), "a/b");
    }

    #[test]
    fn sanitize_strips_leading_slashes_and_backslashes() {
        assert_eq!(sanitize_rel_path("/videos/foo.mp4").unwrap(), "videos/foo.mp4");
        assert_eq!(sanitize_rel_path("videos\\foo.mp4").unwrap(), "videos/foo.mp4");
    }

    #[test]
    fn sanitize_rejects_escapes() {
        assert!(sanitize_rel_path("../etc/passwd").is_err());
        assert!(sanitize_rel_path("videos/../../etc/passwd").is_err());
        assert!(sanitize_rel_path("..").is_err());
        assert!(sanitize_rel_path("").is_err());
        assert!(sanitize_rel_path("/").is_err());
        assert!(sanitize_rel_path("C:\\windows\\system32").is_err());
    }

    #[test]
    fn resolve_stays_under_root() {
        let root = Path::new("/srv/synced");
        assert_eq!(
            resolve_within(root, "videos/foo.mp4").unwrap(),
            Path::new("/srv/synced/videos/foo.mp4")
        );
        assert!(resolve_within(root, "../oops").is_err());
    }

    #[tokio::test]
    async fn command_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        write_command(&mut client, CMD_GET, "videos/foo.mp4")
            .await
            .unwrap();
        let (cmd, arg) = read_command(&mut server).await.unwrap().unwrap();
        assert_eq!(cmd, CMD_GET);
        assert_eq!(arg, "videos/foo.mp4");
    }

    #[tokio::test]
    async fn empty_arg_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(64);
        write_command(&mut client, CMD_LIST, "").await.unwrap();
        let (cmd, arg) = read_command(&mut server).await.unwrap().unwrap();
        assert_eq!(cmd, CMD_LIST);
        assert_eq!(arg, "");
    }

    #[tokio::test]
    async fn eof_between_commands_is_none() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        assert!(read_command(&mut server).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn status_ok_and_err_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(256);

        write_ok(&mut a).await.unwrap();
        read_status(&mut b).await.unwrap();

        write_err(&mut a, "File not found").await.unwrap();
        match read_status(&mut b).await {
            Err(Error::TransferRejected { message }) => assert_eq!(message, "File not found"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn sized_ok_carries_payload_size() {
        let (mut a, mut b) = tokio::io::duplex(256);
        write_ok_sized(&mut a, 10 * 1024 * 1024).await.unwrap();
        read_status(&mut b).await.unwrap();
        assert_eq!(read_size(&mut b).await.unwrap(), 10 * 1024 * 1024);
    }
}
