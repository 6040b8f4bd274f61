//! # squeeze-status
//!
//! Normalized player status for squeeze-sdk.
//!
//! Raw status payloads from the server (status pushes and `status` control
//! results) are decoded by [`StatusDecoder`] into immutable [`PlayerStatus`]
//! snapshots. Cover art references are resolved to absolute URLs by
//! [`ArtworkResolver`].
//!
//! ```rust,ignore
//! use squeeze_status::{ArtworkResolver, StatusDecoder};
//!
//! let decoder = StatusDecoder::new(ArtworkResolver::new("192.168.1.20", 9000)?);
//! let status = decoder.decode("00:04:20:aa:bb:cc", &payload)?;
//! println!("{} - {} ({} ms)", status.artist, status.title, status.position_ms);
//! ```

pub mod artwork;
pub mod decoder;
pub mod error;
pub mod logging;
pub mod status;

pub use artwork::ArtworkResolver;
pub use decoder::{choose_title, StatusDecoder};
pub use error::{Result, StatusError};
pub use status::{PlaybackMode, PlayerStatus};
