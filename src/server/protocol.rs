//! Control protocol framing.
//!
//! A client sends a stream of JSON objects, each one a [`Request`]. Objects
//! may be concatenated or separated by whitespace. Every request is answered
//! with a single byte: `t` when the hit is allowed, `f` otherwise.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::hitcounter::TrackedValue;

/// Response byte for an allowed hit.
pub const ALLOWED: u8 = b't';
/// Response byte for a flagged or invalid hit.
pub const FLAGGED: u8 = b'f';

/// Largest amount of buffered, undecoded input accepted from one client.
pub const MAX_REQUEST_BYTES: usize = 64 * 1024;

const READ_CHUNK: usize = 4096;

/// One hit reported by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub direction: String,
    pub value: TrackedValue,
}

/// Errors that end a control connection.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed request: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Request exceeds {limit} bytes")]
    RequestTooLarge { limit: usize },
}

/// The byte answering a decision.
pub fn encode_response(allowed: bool) -> u8 {
    if allowed {
        ALLOWED
    } else {
        FLAGGED
    }
}

/// Incrementally decodes requests from a byte stream.
#[derive(Debug)]
pub struct RequestReader<R> {
    reader: R,
    buf: Vec<u8>,
    limit: usize,
}

impl<R: AsyncRead + Unpin> RequestReader<R> {
    pub fn new(reader: R) -> Self {
        Self::with_limit(reader, MAX_REQUEST_BYTES)
    }

    pub fn with_limit(reader: R, limit: usize) -> Self {
        Self {
            reader,
            buf: Vec::with_capacity(READ_CHUNK),
            limit,
        }
    }

    /// Read the next request.
    ///
    /// Returns `Ok(None)` when the client closes the stream, including in the
    /// middle of a partial request.
    pub async fn next_request(&mut self) -> Result<Option<Request>, ProtocolError> {
        loop {
            if let Some(request) = self.decode_buffered()? {
                return Ok(Some(request));
            }

            if self.buf.len() >= self.limit {
                return Err(ProtocolError::RequestTooLarge { limit: self.limit });
            }

            let mut chunk = [0u8; READ_CHUNK];
            let want = READ_CHUNK.min(self.limit - self.buf.len());
            let n = self.reader.read(&mut chunk[..want]).await?;
            if n == 0 {
                return Ok(None);
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Try to take one complete request off the front of the buffer.
    fn decode_buffered(&mut self) -> Result<Option<Request>, ProtocolError> {
        let (next, consumed) = {
            let mut stream =
                serde_json::Deserializer::from_slice(&self.buf).into_iter::<Request>();
            let next = stream.next();
            (next, stream.byte_offset())
        };

        match next {
            Some(Ok(request)) => {
                self.buf.drain(..consumed);
                Ok(Some(request))
            }
            Some(Err(e)) if e.is_eof() => Ok(None),
            Some(Err(e)) => Err(e.into()),
            None => {
                // Only whitespace so far
                self.buf.clear();
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reads_concatenated_requests() {
        let input: &[u8] =
            br#"{"direction":"login","value":"10.0.0.1"} {"direction":"user","value":42}{"direction":"x","value":"y"}"#;
        let mut reader = RequestReader::new(input);

        let first = reader.next_request().await.unwrap().unwrap();
        assert_eq!(first.direction, "login");
        assert_eq!(first.value, TrackedValue::from("10.0.0.1"));

        let second = reader.next_request().await.unwrap().unwrap();
        assert_eq!(second.value, TrackedValue::Int32(42));

        let third = reader.next_request().await.unwrap().unwrap();
        assert_eq!(third.direction, "x");

        assert!(reader.next_request().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_request_split_across_reads() {
        let mock = tokio_test::io::Builder::new()
            .read(br#"{"direction":"lo"#)
            .read(br#"gin","value""#)
            .read(br#":"abc"}"#)
            .build();
        let mut reader = RequestReader::new(mock);

        let request = reader.next_request().await.unwrap().unwrap();
        assert_eq!(request.direction, "login");
        assert_eq!(request.value, TrackedValue::from("abc"));
        assert!(reader.next_request().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_malformed_request_is_an_error() {
        let input: &[u8] = br#"{"direction": 5, "value": "a"}"#;
        let mut reader = RequestReader::new(input);
        assert!(matches!(reader.next_request().await, Err(ProtocolError::Decode(_))));

        let input: &[u8] = br#"{"direction":"a","value":1.5}"#;
        let mut reader = RequestReader::new(input);
        assert!(matches!(reader.next_request().await, Err(ProtocolError::Decode(_))));

        let input: &[u8] = b"garbage";
        let mut reader = RequestReader::new(input);
        assert!(matches!(reader.next_request().await, Err(ProtocolError::Decode(_))));
    }

    #[tokio::test]
    async fn test_truncated_request_ends_stream() {
        let input: &[u8] = br#"{"direction":"login","val"#;
        let mut reader = RequestReader::new(input);
        assert!(reader.next_request().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_request_rejected() {
        let mut input = br#"{"direction":""#.to_vec();
        input.extend(std::iter::repeat(b'a').take(200));
        let mut reader = RequestReader::with_limit(input.as_slice(), 64);

        assert!(matches!(
            reader.next_request().await,
            Err(ProtocolError::RequestTooLarge { limit: 64 })
        ));
    }

    #[test]
    fn test_encode_response() {
        assert_eq!(encode_response(true), b't');
        assert_eq!(encode_response(false), b'f');
    }
}
