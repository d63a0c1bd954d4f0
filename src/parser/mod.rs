//! Message parsing: header fields and the MIME part tree.

pub mod header;
pub mod mime;
