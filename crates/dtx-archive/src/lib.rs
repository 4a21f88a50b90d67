//! dtx-archive: keyed-archive object graph codec.
//!
//! Payloads and complex auxiliary items on a DTX connection are encoded as
//! keyed archives: a flat object table inside a binary property list, with
//! objects referencing each other by UID. This crate round-trips a [`Value`]
//! graph to and from that format:
//!
//! - [`archive`] serializes a [`Value`] the way `NSKeyedArchiver` would,
//!   so an existing peer accepts the bytes.
//! - [`unarchive`] resolves the UID graph back into a [`Value`], with
//!   class-dispatched decoding for the Foundation container classes and a
//!   lossless dictionary fallback for everything it does not know.
//!
//! Container values may carry an explicit archiver class via
//! [`Value::with_class`]; the class is consulted only while encoding and is
//! invisible to equality.

mod archiver;
mod error;
mod unarchiver;
mod value;

pub use archiver::archive;
pub use error::ArchiveError;
pub use unarchiver::unarchive;
pub use value::{ClassInfo, Classed, Dict, Value};
