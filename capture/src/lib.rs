//! Collector side of a streamtrace connection: finds a client, receives its
//! stream and writes every record out as a JSON line.

pub mod discover;
pub mod session;
pub mod writer;

pub use discover::{discover, Announcement};
pub use session::{Poll, Session};
pub use writer::JsonLinesWriter;
