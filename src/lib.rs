//! `mailsnare`: a development mail catcher.
//!
//! Applications under development send mail to the SMTP listener; every
//! message is kept in memory and can be listed, inspected part by part and
//! fetched as raw source. Live subscribers are told when messages arrive or
//! are removed.

pub mod config;
pub mod error;
pub mod ingest;
pub mod model;
pub mod parser;
pub mod query;
pub mod smtp;
pub mod store;
