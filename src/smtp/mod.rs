//! SMTP ingestion front end.

pub mod error;
pub mod reply;
pub mod server;
pub mod session;

pub use error::SmtpError;
pub use server::SmtpServer;
