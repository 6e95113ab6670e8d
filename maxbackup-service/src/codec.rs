//! Length-prefixed JSON framing over any duplex byte stream.
//!
//! Frame format: a little-endian `u32` byte count `L` (1 ≤ L ≤ 8192)
//! followed by exactly `L` bytes of UTF-8 JSON. One frame = one message.
//! Every read and write is bounded by a per-operation timeout that resets
//! whenever bytes move.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{io_err, ServiceError};

/// Largest accepted frame body.
pub const MAX_FRAME_BYTES: usize = 8192;

/// Read one framed message and decode it.
///
/// Returns [`ServiceError::EndOfStream`] when the peer closed before the
/// first byte, [`ServiceError::Protocol`] on an invalid length or payload,
/// and [`ServiceError::Timeout`] when a read makes no progress in time.
pub async fn read_message<T, R>(reader: &mut R, timeout: Duration) -> Result<T, ServiceError>
where
    T: DeserializeOwned,
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    if read_full(reader, &mut header, timeout, true).await? {
        return Err(ServiceError::EndOfStream);
    }
    let length = u32::from_le_bytes(header) as usize;
    if length == 0 || length > MAX_FRAME_BYTES {
        return Err(ServiceError::Protocol(format!(
            "invalid frame length {length} (must be 1..={MAX_FRAME_BYTES})"
        )));
    }
    let mut body = vec![0u8; length];
    read_full(reader, &mut body, timeout, false).await?;
    serde_json::from_slice(&body)
        .map_err(|e| ServiceError::Protocol(format!("malformed message payload: {e}")))
}

/// Encode a message and write it as one frame.
///
/// Refuses payloads larger than [`MAX_FRAME_BYTES`] before touching the
/// stream.
pub async fn write_message<T, W>(
    writer: &mut W,
    value: &T,
    timeout: Duration,
) -> Result<(), ServiceError>
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(value)?;
    if body.len() > MAX_FRAME_BYTES {
        return Err(ServiceError::Protocol(format!(
            "encoded message is {} bytes, larger than the {MAX_FRAME_BYTES}-byte frame limit",
            body.len()
        )));
    }
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);

    tokio::time::timeout(timeout, async {
        writer.write_all(&frame).await?;
        writer.flush().await
    })
    .await
    .map_err(|_| ServiceError::Timeout("pipe write"))?
    .map_err(|e| io_err("pipe write", e))?;
    Ok(())
}

/// Fill `buf` completely, looping over partial reads.
///
/// Returns `true` when the peer closed before the first byte and
/// `eof_is_close` allows treating that as a clean close.
async fn read_full<R>(
    reader: &mut R,
    buf: &mut [u8],
    timeout: Duration,
    eof_is_close: bool,
) -> Result<bool, ServiceError>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0usize;
    while filled < buf.len() {
        let read = tokio::time::timeout(timeout, reader.read(&mut buf[filled..]))
            .await
            .map_err(|_| ServiceError::Timeout("pipe read"))?
            .map_err(|e| io_err("pipe read", e))?;
        if read == 0 {
            if filled == 0 && eof_is_close {
                return Ok(true);
            }
            return Err(ServiceError::Protocol(
                "peer closed connection mid-frame".to_string(),
            ));
        }
        filled += read;
    }
    Ok(false)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    use crate::protocol::{PipeRequest, PipeResponse, ResponseStatus};

    const TIMEOUT: Duration = Duration::from_secs(2);

    #[tokio::test]
    async fn request_roundtrips() {
        let (mut client, mut server) = duplex(1024);
        let request = PipeRequest {
            action: "REGISTER".to_string(),
            sid: "S-1-5-21-X".to_string(),
            config_path: Some("/home/x/cfg.json".to_string()),
        };
        write_message(&mut client, &request, TIMEOUT).await.expect("write");
        let received: PipeRequest = read_message(&mut server, TIMEOUT).await.expect("read");
        assert_eq!(received.action, "REGISTER");
        assert_eq!(received.sid, "S-1-5-21-X");
        assert_eq!(received.config_path.as_deref(), Some("/home/x/cfg.json"));
    }

    #[tokio::test]
    async fn response_roundtrips_losslessly() {
        let (mut client, mut server) = duplex(16 * 1024);
        let response = PipeResponse::success("all good");
        write_message(&mut server, &response, TIMEOUT).await.expect("write");
        let received: PipeResponse = read_message(&mut client, TIMEOUT).await.expect("read");
        assert_eq!(received.status, ResponseStatus::Success);
        assert_eq!(received.message, "all good");
        assert!(received.is_final);
    }

    #[tokio::test]
    async fn multiple_frames_in_sequence() {
        let (mut client, mut server) = duplex(16 * 1024);
        for n in 0..5 {
            let response = PipeResponse::info(format!("step {n}"));
            write_message(&mut server, &response, TIMEOUT).await.expect("write");
        }
        write_message(&mut server, &PipeResponse::success("done"), TIMEOUT)
            .await
            .expect("write final");
        drop(server);

        let mut finals = 0;
        let mut count = 0;
        loop {
            match read_message::<PipeResponse, _>(&mut client, TIMEOUT).await {
                Ok(response) => {
                    count += 1;
                    if response.is_final {
                        finals += 1;
                    }
                }
                Err(ServiceError::EndOfStream) => break,
                Err(err) => panic!("unexpected error: {err}"),
            }
        }
        assert_eq!(count, 6);
        assert_eq!(finals, 1, "exactly one final response");
    }

    #[tokio::test]
    async fn zero_length_frame_is_a_protocol_error() {
        let (mut client, mut server) = duplex(64);
        client.write_all(&0u32.to_le_bytes()).await.expect("write header");
        let err = read_message::<PipeResponse, _>(&mut server, TIMEOUT)
            .await
            .expect_err("must fail");
        assert!(matches!(err, ServiceError::Protocol(_)));
        assert!(err.to_string().contains("invalid frame length 0"));
    }

    #[tokio::test]
    async fn oversized_frame_is_a_protocol_error() {
        let (mut client, mut server) = duplex(64);
        let length = (MAX_FRAME_BYTES as u32) + 1;
        client.write_all(&length.to_le_bytes()).await.expect("write header");
        let err = read_message::<PipeResponse, _>(&mut server, TIMEOUT)
            .await
            .expect_err("must fail");
        assert!(matches!(err, ServiceError::Protocol(_)));
    }

    #[tokio::test]
    async fn payload_of_exactly_max_size_is_accepted() {
        let (mut client, mut server) = duplex(32 * 1024);
        // Pad the message so the encoded body is exactly MAX_FRAME_BYTES.
        let empty = serde_json::to_vec(&PipeResponse::info("")).expect("encode");
        let padding = MAX_FRAME_BYTES - empty.len();
        let response = PipeResponse::info("x".repeat(padding));
        let encoded = serde_json::to_vec(&response).expect("encode");
        assert_eq!(encoded.len(), MAX_FRAME_BYTES);

        write_message(&mut client, &response, TIMEOUT).await.expect("write");
        let received: PipeResponse = read_message(&mut server, TIMEOUT).await.expect("read");
        assert_eq!(received.message.len(), padding);
    }

    #[tokio::test]
    async fn writing_an_oversized_message_is_refused() {
        let (mut client, _server) = duplex(64);
        let response = PipeResponse::info("x".repeat(MAX_FRAME_BYTES));
        let err = write_message(&mut client, &response, TIMEOUT)
            .await
            .expect_err("must refuse");
        assert!(matches!(err, ServiceError::Protocol(_)));
        assert!(err.to_string().contains("frame limit"));
    }

    #[tokio::test]
    async fn closed_peer_reports_end_of_stream() {
        let (client, mut server) = duplex(64);
        drop(client);
        let err = read_message::<PipeResponse, _>(&mut server, TIMEOUT)
            .await
            .expect_err("must fail");
        assert!(matches!(err, ServiceError::EndOfStream));
    }

    #[tokio::test]
    async fn close_mid_frame_is_a_protocol_error() {
        let (mut client, mut server) = duplex(64);
        client.write_all(&100u32.to_le_bytes()).await.expect("header");
        client.write_all(b"only ten b").await.expect("partial body");
        drop(client);
        let err = read_message::<PipeResponse, _>(&mut server, TIMEOUT)
            .await
            .expect_err("must fail");
        assert!(matches!(err, ServiceError::Protocol(_)));
        assert!(err.to_string().contains("mid-frame"));
    }

    #[tokio::test]
    async fn stalled_peer_times_out() {
        let (_client, mut server) = duplex(64);
        let err = read_message::<PipeResponse, _>(&mut server, Duration::from_millis(50))
            .await
            .expect_err("must time out");
        assert!(matches!(err, ServiceError::Timeout(_)));
    }

    #[tokio::test]
    async fn invalid_json_payload_is_a_protocol_error() {
        let (mut client, mut server) = duplex(64);
        let body = b"not json at all";
        client
            .write_all(&(body.len() as u32).to_le_bytes())
            .await
            .expect("header");
        client.write_all(body).await.expect("body");
        let err = read_message::<PipeResponse, _>(&mut server, TIMEOUT)
            .await
            .expect_err("must fail");
        assert!(matches!(err, ServiceError::Protocol(_)));
        assert!(err.to_string().contains("malformed message payload"));
    }
}
