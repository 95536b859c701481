use std::{io, path::PathBuf};

use quinn::{ConnectError, ConnectionError, ReadToEndError, WriteError};

use crate::engine::error::DecodeError;

/// Transport-level failures, on either side of a connection.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("could not start connecting: {0}")]
    Connect(#[from] ConnectError),
    #[error("connection failed: {0}")]
    Connection(#[from] ConnectionError),
    #[error("could not write to stream: {0}")]
    Write(#[from] WriteError),
    #[error("could not read stream: {0}")]
    Read(#[from] ReadToEndError),
    #[error("tls: {0}")]
    Tls(#[from] rustls::Error),
    #[error("could not generate a certificate: {0}")]
    Certificate(#[from] rcgen::RcgenError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("no certificate found in {0}")]
    MissingCertificate(PathBuf),
    #[error("no pkcs8 or rsa private key found in {0}")]
    MissingKey(PathBuf),
    /// The server executed the command and reported a failure.
    #[error("server error {code}: {message}")]
    Remote { code: u8, message: String },
    #[error("malformed reply: {0}")]
    MalformedReply(#[from] DecodeError),
    /// The server finished the stream without a reply, which it does for
    /// duplicate requests.
    #[error("server sent no reply")]
    NoReply,
    #[error("engine task has stopped")]
    EngineStopped,
}
