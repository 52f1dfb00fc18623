use reqwest::Error as ReqwestError;
use serde_json::Error as JsonError;
use std::error::Error as StdError;
use std::fmt::Display;
use std::io::Error as IoError;
use tokio_tungstenite::tungstenite::Error as WsError;

/// Chatango API `Result` alias type.
pub type Result<T> = ::std::result::Result<T, Error>;

/// Chatango API error type.
#[derive(Debug)]
pub enum Error {
    /// A `reqwest` crate error
    Reqwest(ReqwestError),
    /// A `serde_json` crate error
    Json(JsonError),
    /// A `tungstenite` crate error
    WebSocket(WsError),
    /// A `std::io` module error
    Io(IoError),
    /// A room name that does not match `^[a-z0-9-]{1,20}$`
    InvalidRoomName(String),
    /// `connect()` was called on an endpoint that is already connected
    AlreadyConnected(String),
    /// The server refused the session with a `denied` frame
    Denied(String),
    /// An inbound frame missing required arguments, with a description
    Malformed(&'static str),
    /// A Chatango protocol error, with a description
    Protocol(&'static str),
    /// A miscellaneous error, with a description
    Other(&'static str),
}

impl From<IoError> for Error {
    fn from(err: IoError) -> Error {
        Error::Io(err)
    }
}

impl From<ReqwestError> for Error {
    fn from(err: ReqwestError) -> Error {
        Error::Reqwest(err)
    }
}

impl From<JsonError> for Error {
    fn from(err: JsonError) -> Error {
        Error::Json(err)
    }
}

impl From<WsError> for Error {
    fn from(err: WsError) -> Error {
        Error::WebSocket(err)
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
        match *self {
            Error::Reqwest(ref inner) => inner.fmt(f),
            Error::Json(ref inner) => inner.fmt(f),
            Error::WebSocket(ref inner) => inner.fmt(f),
            Error::Io(ref inner) => inner.fmt(f),
            Error::InvalidRoomName(ref name) => write!(f, "invalid room name: {:?}", name),
            Error::AlreadyConnected(ref name) => write!(f, "already connected to {}", name),
            Error::Denied(ref name) => write!(f, "server denied access to {}", name),
            Error::Malformed(msg) => write!(f, "malformed frame: {}", msg),
            Error::Protocol(msg) | Error::Other(msg) => f.write_str(msg),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match *self {
            Error::Reqwest(ref inner) => Some(inner),
            Error::Json(ref inner) => Some(inner),
            Error::WebSocket(ref inner) => Some(inner),
            Error::Io(ref inner) => Some(inner),
            _ => None,
        }
    }
}
