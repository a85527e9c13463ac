//! Newline-delimited JSON codec over any async byte stream.
//!
//! Each message is one UTF-8 JSON document followed by `\n`.

use std::io;

use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum accepted length of a single line (16 MiB).
pub const MAX_LINE: u64 = 16 * 1024 * 1024;

/// Encodes `msg` as one JSON line and writes it to `w`.
pub async fn send<W: AsyncWrite + Unpin>(w: &mut W, msg: &impl Serialize) -> io::Result<()> {
    let mut line =
        serde_json::to_vec(msg).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    line.push(b'\n');
    w.write_all(&line).await?;
    w.flush().await
}

/// Reads one line from `r` and parses it with [`parse_lenient`].
///
/// Returns `UnexpectedEof` when the peer closed the stream, and
/// `InvalidData` when the line exceeds [`MAX_LINE`].
pub async fn recv<R: AsyncBufRead + Unpin>(r: &mut R) -> io::Result<Value> {
    let mut buf = Vec::new();
    let n = (&mut *r).take(MAX_LINE).read_until(b'\n', &mut buf).await?;
    if n == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "control socket closed",
        ));
    }
    if buf.last() != Some(&b'\n') && n as u64 == MAX_LINE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "control message exceeds 16 MiB limit",
        ));
    }
    Ok(parse_lenient(&buf))
}

/// Parses a received line as JSON.
///
/// A line that is not valid JSON is wrapped as `{"raw": "<text>"}` rather
/// than rejected; partial or concatenated messages are tolerated.
pub fn parse_lenient(bytes: &[u8]) -> Value {
    let trimmed = bytes.trim_ascii();
    serde_json::from_slice(trimmed).unwrap_or_else(|_| {
        serde_json::json!({ "raw": String::from_utf8_lossy(trimmed) })
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::Command;

    #[tokio::test]
    async fn send_appends_newline() {
        let mut buf = Vec::new();
        send(&mut buf, &Command::new("query-status")).await.unwrap();
        assert_eq!(buf, b"{\"execute\":\"query-status\"}\n");
    }

    #[tokio::test]
    async fn recv_reads_one_line_at_a_time() {
        let data = b"{\"return\": {}}\n{\"event\": \"STOP\"}\n";
        let mut r = tokio::io::BufReader::new(&data[..]);

        let first = recv(&mut r).await.unwrap();
        assert_eq!(first, serde_json::json!({"return": {}}));
        let second = recv(&mut r).await.unwrap();
        assert_eq!(second["event"], "STOP");

        let eof = recv(&mut r).await.unwrap_err();
        assert_eq!(eof.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn garbage_is_wrapped_as_raw() {
        let v = parse_lenient(b"{\"return\": {}}{\"event\"\r\n");
        assert_eq!(v["raw"], "{\"return\": {}}{\"event\"");
    }

    #[test]
    fn valid_json_is_passed_through() {
        let v = parse_lenient(b"  {\"return\": {\"status\": \"running\"}}\r\n");
        assert_eq!(v["return"]["status"], "running");
    }
}
