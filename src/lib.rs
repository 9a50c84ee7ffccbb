

#![warn(
    rust_2018_idioms,
    future_incompatible,
    unused_extern_crates,
    unused,

    missing_copy_implementations,
    missing_debug_implementations,

    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::cargo,
)]

#![deny(
    unused_variables,
    unused_assignments,
    unused_must_use,
    trivial_numeric_casts,
)]

#![forbid(unsafe_code)]

// TODO #![warn(missing_docs)]

//! Serve very large JPEG 2000 images progressively over JPIP
//! (ISO/IEC 15444-9). The crate indexes JP2, JPX and raw codestream
//! files once, remembers what each client already received, and frames
//! exactly the data-bin messages a requested window of interest needs.
//!
//! Socket handling, HTTP parsing, chunked framing and gzip are left to
//! a transport collaborator, which drives [`jpip::session::Session`].

pub mod io;

pub mod math;
pub mod error;
pub mod segment;
pub mod vint;
pub mod coding;
pub mod meta;
pub mod index;
pub mod jpip;
pub mod config;
pub mod stats;

/// Re-exports of all types commonly required
/// for serving images from a transport.
pub mod prelude {

    // main exports
    pub use crate::config::ServerConfig;
    pub use crate::index::cache::ImageCache;
    pub use crate::index::ImageIndex;
    pub use crate::jpip::request::Request;
    pub use crate::jpip::server::DataBinServer;
    pub use crate::jpip::session::{Reply, Session};

    // secondary data types
    pub use crate::coding::{CodingParameters, Packet, Progression};
    pub use crate::jpip::cache_model::{Amount, CacheModel};
    pub use crate::jpip::woi::{Woi, WoiComposer};
    pub use crate::jpip::{DataBinClass, EorCode};
    pub use crate::meta::ImageInfo;
    pub use crate::segment::FileSegment;
    pub use crate::stats::{NullStats, SessionStats};

    // export real types and attributes
    pub use crate::error::{Error, Result};
    pub use crate::math::{RoundingMode, Vec2};
}
