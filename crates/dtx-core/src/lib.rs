//! dtx-core: the DTX multiplexed messaging core.
//!
//! A DTX connection carries many independent conversations ("channels") over
//! one duplex byte stream. This crate owns everything between the stream and
//! the caller:
//!
//! - Frame assembly and parsing ([`DtxMessage`], [`FrameHeader`]), including
//!   fragmentation reassembly and the LZ4 / segmented-container
//!   decompression ladder.
//! - The auxiliary argument list ([`AuxValue`]) carried next to a payload.
//! - The connection engine ([`DtxConnection`]): receive worker, capability
//!   handshake, acknowledgement policy, channel allocation, shutdown.
//! - Per-channel request/reply correlation ([`DtxChannel`]).
//!
//! Payload object graphs are encoded by the `dtx-archive` crate, re-exported
//! here as [`Value`].
//!
//! # Quick start
//!
//! ```ignore
//! let stream = /* duplex byte stream from lockdown / tunnel */;
//! let connection = DtxConnection::new(stream);
//! connection.connect().await?;
//!
//! let channel = connection
//!     .make_channel("com.apple.instruments.server.services.deviceinfo")
//!     .await?;
//!
//! let mut msg = DtxMessage::method("runningProcesses");
//! let reply = channel.send_sync(msg, Duration::from_secs(5)).await?;
//! ```

mod aux;
mod channel;
mod compress;
mod connection;
mod error;
mod fragment;
mod message;
mod transport;
pub mod wellknown;

pub use aux::{decode_entries, encode_entries, AuxValue};
pub use channel::{DtxChannel, MessageHandler};
pub use connection::{
    ConnectionState, DtxConnection, UnroutedHandler, CAPABILITIES_SELECTOR,
    REQUEST_CHANNEL_SELECTOR,
};
pub use dtx_archive::{archive, unarchive, ArchiveError, ClassInfo, Dict, Value};
pub use error::DtxError;
pub use fragment::FragmentAssembler;
pub use message::{AuxData, DtxMessage, FrameHeader, MessageType, PayloadHeader};
pub use transport::{StreamTransport, TlsMode};

/// Frame magic, written big-endian on the wire.
pub const FRAME_MAGIC: u32 = 0x1F3D_5B79;
/// Fixed frame header length.
pub const FRAME_HEADER_LEN: usize = 32;
/// Fixed payload header length.
pub const PAYLOAD_HEADER_LEN: usize = 16;
/// Auxiliary sub-header magic (u64, little-endian on the wire).
pub const AUX_MAGIC: u64 = 0x01F0;
/// Default timeout for synchronous calls and the capability handshake.
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;
/// The implicit global channel present on every connection.
pub const GLOBAL_CHANNEL_CODE: i32 = 0;
/// Reserved channel for unsolicited server messages.
pub const DEFAULT_CHANNEL_CODE: i32 = -1;
