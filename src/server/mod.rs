//! Control protocol front end: accepts connections and answers hits.

mod listener;
mod protocol;
mod service;

pub use protocol::{
    encode_response, ProtocolError, Request, RequestReader, ALLOWED, FLAGGED, MAX_REQUEST_BYTES,
};
pub use listener::{ControlServer, Listener};
pub use service::{ControlService, HitHandler};
