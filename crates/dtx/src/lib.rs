//! dtx: multiplexed request/response messaging with the on-device
//! instrumentation daemon.
//!
//! A single duplex byte stream carries many independent conversations. Each
//! conversation is a [`DtxChannel`], opened by reverse-DNS identifier;
//! messages are a selector string plus primitive arguments, with replies
//! correlated back to the caller.
//!
//! # Quick start
//!
//! ```ignore
//! use std::time::Duration;
//! use dtx::prelude::*;
//!
//! // `stream` is an established duplex stream to the daemon: the lockdown
//! // service connection on iOS < 17, or a tunnel socket on iOS 17+.
//! let connection = DtxConnection::new(stream);
//! connection.connect().await?;
//!
//! let channel = connection.make_channel(wellknown::channel::DEVICE_INFO).await?;
//!
//! let mut request = DtxMessage::method("runningProcesses");
//! if let Some(reply) = channel.send_sync(request, Duration::from_secs(5)).await? {
//!     println!("{}", reply);
//! }
//!
//! connection.disconnect().await;
//! ```
//!
//! The heavy lifting lives in [`dtx_core`] (framing, channels, the
//! connection engine) and [`dtx_archive`] (the keyed-archive payload
//! codec); this crate re-exports their public surface.

pub use dtx_archive::{archive, unarchive, ArchiveError, ClassInfo, Dict, Value};
pub use dtx_core::{
    decode_entries, encode_entries, wellknown, AuxValue, ConnectionState, DtxChannel,
    DtxConnection, DtxError, DtxMessage, FrameHeader, MessageType, PayloadHeader,
    StreamTransport, TlsMode, CAPABILITIES_SELECTOR, DEFAULT_CHANNEL_CODE, DEFAULT_TIMEOUT_MS,
    GLOBAL_CHANNEL_CODE, REQUEST_CHANNEL_SELECTOR,
};

/// The names most callers want in scope.
pub mod prelude {
    pub use crate::{
        wellknown, AuxValue, DtxChannel, DtxConnection, DtxError, DtxMessage, MessageType, Value,
    };
}
