//! Per-connection request loop.

use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use super::protocol::{encode_response, ProtocolError, RequestReader};
use crate::hitcounter::{HitCounter, TrackedValue};

/// Anything able to answer a hit.
pub trait HitHandler: Send + Sync {
    fn handle_hit(&self, direction: &str, value: TrackedValue) -> bool;
}

impl HitHandler for HitCounter {
    fn handle_hit(&self, direction: &str, value: TrackedValue) -> bool {
        self.handle_request(direction, value)
    }
}

/// Serves one control connection until the client leaves or misbehaves.
pub struct ControlService<H: HitHandler> {
    handler: Arc<H>,
}

impl<H: HitHandler> Clone for ControlService<H> {
    fn clone(&self) -> Self {
        Self {
            handler: self.handler.clone(),
        }
    }
}

impl<H: HitHandler> ControlService<H> {
    pub fn new(handler: Arc<H>) -> Self {
        Self { handler }
    }

    /// Answer requests on `stream` in order, one byte each.
    ///
    /// Returns the number of requests answered. A clean disconnect is `Ok`;
    /// a malformed request ends the connection with an error and no answer.
    pub async fn serve<S>(&self, stream: S) -> Result<u64, ProtocolError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (read_half, mut write_half) = tokio::io::split(stream);
        let mut requests = RequestReader::new(read_half);
        let mut answered = 0u64;

        while let Some(request) = requests.next_request().await? {
            trace!(direction = %request.direction, value = %request.value, "Processing request");

            let allowed = self.handler.handle_hit(&request.direction, request.value);
            write_half.write_all(&[encode_response(allowed)]).await?;
            write_half.flush().await?;
            answered += 1;
        }

        debug!(answered = answered, "Client disconnected");
        Ok(answered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hitcounter::{DirectionSettings, ValueKind};
    use parking_lot::Mutex;
    use std::time::Duration;

    /// Allows only the value "ok" and remembers every call.
    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(String, TrackedValue)>>,
    }

    impl HitHandler for Recorder {
        fn handle_hit(&self, direction: &str, value: TrackedValue) -> bool {
            let allowed = value == TrackedValue::from("ok");
            self.calls.lock().push((direction.to_string(), value));
            allowed
        }
    }

    #[tokio::test]
    async fn test_answers_each_request_in_order() {
        let recorder = Arc::new(Recorder::default());
        let service = ControlService::new(recorder.clone());

        let mock = tokio_test::io::Builder::new()
            .read(br#"{"direction":"login","value":"ok"}"#)
            .write(b"t")
            .read(br#"{"direction":"login","value":"bad"}"#)
            .write(b"f")
            .read(br#"{"direction":"user","value":7}"#)
            .write(b"f")
            .build();

        let answered = service.serve(mock).await.unwrap();
        assert_eq!(answered, 3);

        let calls = recorder.calls.lock();
        assert_eq!(calls[2], ("user".to_string(), TrackedValue::Int32(7)));
    }

    #[tokio::test]
    async fn test_pipelined_requests() {
        let service = ControlService::new(Arc::new(Recorder::default()));

        let mock = tokio_test::io::Builder::new()
            .read(b"{\"direction\":\"a\",\"value\":\"ok\"}\n{\"direction\":\"a\",\"value\":\"no\"}\n")
            .write(b"t")
            .write(b"f")
            .build();

        assert_eq!(service.serve(mock).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_malformed_request_closes_without_answer() {
        let recorder = Arc::new(Recorder::default());
        let service = ControlService::new(recorder.clone());

        let mock = tokio_test::io::Builder::new()
            .read(br#"{"direction":"login","value":"ok"}"#)
            .write(b"t")
            .read(br#"{"direction":"login","value":[1,2]}"#)
            .build();

        assert!(matches!(service.serve(mock).await, Err(ProtocolError::Decode(_))));
        assert_eq!(recorder.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_serves_hit_counter() {
        let settings = DirectionSettings::new("login", ValueKind::String, Duration::from_secs(60), 1);
        let hit_counter = Arc::new(HitCounter::new(vec![settings]).unwrap());
        let service = ControlService::new(hit_counter.clone());

        let mock = tokio_test::io::Builder::new()
            .read(br#"{"direction":"login","value":"10.0.0.1"}"#)
            .write(b"t")
            .read(br#"{"direction":"login","value":"10.0.0.1"}"#)
            .write(b"f")
            .read(br#"{"direction":"nonexistent","value":"x"}"#)
            .write(b"f")
            .build();

        assert_eq!(service.serve(mock).await.unwrap(), 3);
        hit_counter.shutdown().await;
    }
}
