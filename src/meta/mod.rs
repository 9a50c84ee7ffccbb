

//! Describes everything about an image file that the server needs to know:
//! where the codestream headers, packet regions, PLT markers and meta-data
//! boxes live. Produced once per file by walking the box tree and the
//! marker stream, then frozen.

pub mod parse;

use std::path::{Path, PathBuf};

use crate::coding::CodingParameters;
use crate::error::Result;
use crate::segment::FileSegment;


/// The byte-level map of one JPEG 2000 codestream.
#[derive(Debug, Default, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CodestreamIndex {

    /// Covers the main header, from SOC up to the first SOT marker.
    pub header: FileSegment,

    /// The packet-data region of each tile-part, starting after its SOD marker.
    pub packets: Vec<FileSegment>,

    /// The payload of each PLT marker,
    /// excluding the marker length and index bytes.
    pub plt_markers: Vec<FileSegment>,
}


/// A JPIP place-holder box, sent to the client in lieu of an original box
/// so that it can reconstruct the logical file layout.
#[derive(Debug, Default, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PlaceHolder {

    /// The codestream number, or the meta-data bin it stands in for.
    pub id: u64,

    /// Whether the place-holder refers to a codestream box.
    pub is_codestream: bool,

    /// File segment of the original box header.
    pub header: FileSegment,

    /// Length of the original box contents.
    pub data_length: u64,
}

impl PlaceHolder {

    /// The number of bytes of the `phld` box in a response:
    /// the fixed fields plus the original box header.
    pub fn message_length(&self) -> u64 {
        44 + self.header.length
    }
}


/// The meta-data of an image: the byte ranges between and around the
/// codestream boxes, with one place-holder separating each pair of blocks.
#[derive(Debug, Default, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Metadata {
    pub segments: Vec<FileSegment>,
    pub placeholders: Vec<PlaceHolder>,
}


/// The complete parse result for one image file.
/// This is the serializable, frozen form;
/// the runtime index is built from it once per opened path.
#[derive(Debug, Default, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ImageInfo {

    /// Coding parameters shared by all codestreams of this image.
    pub coding: CodingParameters,

    /// One entry per codestream found in the file, or one entry per
    /// hyperlink when the image references external files.
    pub codestreams: Vec<CodestreamIndex>,

    /// The meta-data blocks of this file.
    pub metadata: Metadata,

    /// For JPX images with fragment tables: the external file each
    /// codestream slot refers to, as `(path, codestream index)` pairs.
    pub hyperlink_paths: Vec<(PathBuf, usize)>,

    /// The meta-data of each hyperlinked file.
    pub hyperlink_metadata: Vec<Metadata>,
}

impl ImageInfo {

    /// Walks the box tree and codestream markers of the file and returns
    /// its complete description. Hyperlinked files are parsed recursively.
    ///
    /// The root directory is used to resolve relative `file://` data
    /// references of JPX images.
    pub fn read_from_file(path: impl AsRef<Path>, root: impl AsRef<Path>) -> Result<Self> {
        let mut chain = Vec::new();
        parse::read_image(path.as_ref(), root.as_ref(), &mut chain)
    }
}
