//! LSP base-protocol framing: `Content-Length` headers over byte streams.
//!
//! Every message is a block of `Name: value` header lines, each terminated
//! by CRLF, followed by an empty CRLF line and exactly `Content-Length`
//! bytes of UTF-8 JSON. Only `Content-Length` is interpreted; other headers
//! (notably `Content-Type`) are read and discarded.

use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::Error;

/// Upper bound on a single message body. Guards against malformed or
/// hostile servers exhausting memory with a bogus header.
const MAX_CONTENT_LENGTH: usize = 10 * 1024 * 1024;

/// Serializes `body` and writes one framed message to `writer`.
pub(crate) async fn write_message<W>(writer: &mut W, body: &Value) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    let payload = serde_json::to_string(body)?;
    let framed = format!("Content-Length: {}\r\n\r\n{payload}", payload.len());
    writer
        .write_all(framed.as_bytes())
        .await
        .map_err(|_| Error::TransportClosed)?;
    writer.flush().await.map_err(|_| Error::TransportClosed)?;
    Ok(())
}

/// Reads one framed message from `reader`.
///
/// Returns `Eof` when the stream ends cleanly between messages and
/// `Protocol` for truncated headers, a missing or oversized
/// `Content-Length`, a short body, or a body that is not valid JSON.
pub(crate) async fn read_message<R>(reader: &mut R) -> Result<Value, Error>
where
    R: AsyncBufRead + Unpin,
{
    let mut content_length: Option<usize> = None;
    let mut saw_header = false;

    loop {
        let mut line = String::new();
        let read = reader
            .read_line(&mut line)
            .await
            .map_err(|err| Error::Protocol(format!("header read failed: {err}")))?;
        if read == 0 {
            if saw_header {
                return Err(Error::Protocol("stream ended inside a header block".into()));
            }
            return Err(Error::Eof);
        }

        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            break;
        }
        saw_header = true;

        let Some((name, value)) = line.split_once(':') else {
            return Err(Error::Protocol(format!("malformed header line `{line}`")));
        };
        if name.trim().eq_ignore_ascii_case("content-length") {
            let parsed = value
                .trim()
                .parse::<usize>()
                .map_err(|_| Error::Protocol(format!("bad Content-Length `{}`", value.trim())))?;
            content_length = Some(parsed);
        }
    }

    let length = content_length
        .ok_or_else(|| Error::Protocol("missing Content-Length header".into()))?;
    if length > MAX_CONTENT_LENGTH {
        return Err(Error::Protocol(format!(
            "Content-Length {length} exceeds {MAX_CONTENT_LENGTH} byte cap"
        )));
    }

    let mut body = vec![0u8; length];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|err| Error::Protocol(format!("body read failed: {err}")))?;

    serde_json::from_slice(&body)
        .map_err(|err| Error::Protocol(format!("body is not valid JSON: {err}")))
}
