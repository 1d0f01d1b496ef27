use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("config is empty, expected a peer count on the first line")]
    MissingCount,
    #[error("invalid peer count {0:?}")]
    InvalidCount(String),
    #[error("line {line}: expected `<id> <host> <port>`, got {content:?}")]
    MalformedPeer { line: usize, content: String },
    #[error("line {line}: invalid port {port:?}")]
    InvalidPort { line: usize, port: String },
    #[error("peer {0} is listed more than once")]
    DuplicatePeer(String),
    #[error("config declares {expected} peers but lists {found}")]
    CountMismatch { expected: usize, found: usize },
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("peer stream i/o: {0}")]
    Io(#[from] io::Error),
    #[error("envelope (de)serialization: {0}")]
    Bincode(#[from] bincode::Error),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("empty submission line")]
    Empty,
    #[error("unknown submission marker {0:?}")]
    UnknownMarker(String),
    #[error("expected {expected} fields, got {found}")]
    Arity { expected: usize, found: usize },
    #[error("invalid amount {0:?}")]
    InvalidAmount(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("delay queue is empty")]
    Empty,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("handshake from {0:?} rejected: not a configured peer with a smaller id")]
    UnexpectedPeer(String),
    #[error("connection closed before handshake")]
    HandshakeClosed,
    #[error("expected handshake, got {0}")]
    HandshakeExpected(&'static str),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
