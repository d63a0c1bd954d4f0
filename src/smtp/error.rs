//! Errors raised by the SMTP listener itself (not by individual commands).

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SmtpError {
    #[error("Could not bind SMTP listener on {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("SMTP I/O error: {0}")]
    Io(#[from] std::io::Error),
}
