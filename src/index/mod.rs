

//! The runtime index of an opened image.
//!
//! One `ImageIndex` exists per opened path, shared by every session that
//! browses the same image. It is immutable after parsing, except for the
//! packet indexes, which grow lazily as clients request higher resolutions.

pub mod cache;
pub mod packets;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::trace;

use crate::coding::{CodingParameters, Packet};
use crate::error::{u64_to_usize, Error, Result, UnitResult};
use crate::index::cache::FilePool;
use crate::index::packets::PacketIndex;
use crate::io::FileReader;
use crate::meta::{CodestreamIndex, ImageInfo, Metadata, PlaceHolder};
use crate::segment::FileSegment;


/// The resolved, shareable form of a parsed image.
///
/// Either `codestreams` is non-empty (a standalone image) or `hyper_links`
/// is non-empty (a JPX referencing external files); never both. Operations
/// on codestream `k` of a hyperlinked image delegate to `hyper_links[k]`.
#[derive(Debug)]
pub struct ImageIndex {
    path: PathBuf,
    coding: CodingParameters,
    metadata: Metadata,
    codestreams: Vec<CodestreamIndex>,
    streams: Vec<StreamState>,
    hyper_links: Vec<Arc<ImageIndex>>,
}

/// The growable part of the index for one codestream.
#[derive(Debug)]
struct StreamState {
    packets: RwLock<PacketIndex>,
    cursor: Mutex<PltCursor>,
}

/// Tracks how far the PLT byte stream and the tile-part packet regions
/// have been consumed, so that index growth resumes where it stopped.
#[derive(Debug, Default, Clone, Copy)]
struct PltCursor {
    last_plt: usize,
    last_offset_plt: u64,
    last_packet: usize,
    last_offset_packet: u64,

    /// The highest resolution the index was built for, if any.
    built_resolution: Option<u32>,
}

impl StreamState {
    fn new() -> Self {
        StreamState {
            packets: RwLock::new(PacketIndex::default()),
            cursor: Mutex::new(PltCursor::default()),
        }
    }
}


impl ImageIndex {

    /// Builds the runtime index from a parse result.
    pub fn from_info(path: PathBuf, info: ImageInfo) -> Self {
        let hyper_links = info.hyperlink_paths.iter()
            .map(|(linked_path, slot)| Arc::new(ImageIndex::hyperlink_node(linked_path.clone(), &info, *slot)))
            .collect::<Vec<_>>();

        let codestreams = if hyper_links.is_empty() { info.codestreams } else { Vec::new() };
        let streams = codestreams.iter().map(|_| StreamState::new()).collect();

        ImageIndex {
            path,
            coding: info.coding,
            metadata: info.metadata,
            codestreams,
            streams,
            hyper_links,
        }
    }

    /// The index of one externally referenced codestream.
    fn hyperlink_node(path: PathBuf, info: &ImageInfo, slot: usize) -> Self {
        ImageIndex {
            path,
            coding: info.coding.clone(),
            metadata: info.hyperlink_metadata[slot].clone(),
            codestreams: vec![info.codestreams[slot].clone()],
            streams: vec![StreamState::new()],
            hyper_links: Vec::new(),
        }
    }

    /// The path of the image file.
    pub fn path(&self) -> &Path { &self.path }

    /// The path of the file holding the given codestream,
    /// which differs from `path()` for hyperlinked codestreams.
    pub fn path_for(&self, codestream: usize) -> &Path {
        if self.hyper_links.is_empty() { &self.path }
        else { &self.hyper_links[codestream].path }
    }

    pub fn coding(&self) -> &CodingParameters { &self.coding }

    pub fn num_codestreams(&self) -> usize {
        if self.codestreams.is_empty() { self.hyper_links.len() }
        else { self.codestreams.len() }
    }

    pub fn hyper_links(&self) -> &[Arc<ImageIndex>] { &self.hyper_links }

    pub fn codestreams(&self) -> &[CodestreamIndex] { &self.codestreams }

    pub fn num_metadata(&self) -> usize {
        self.metadata.segments.len()
    }

    pub fn metadata_segment(&self, index: usize) -> FileSegment {
        self.metadata.segments[index]
    }

    pub fn place_holder(&self, index: usize) -> &PlaceHolder {
        &self.metadata.placeholders[index]
    }

    /// The main header segment of the given codestream.
    pub fn main_header(&self, codestream: usize) -> FileSegment {
        if self.codestreams.is_empty() {
            let linked = &self.hyper_links[codestream];
            linked.codestreams.last().map(|index| index.header).unwrap_or_default()
        }
        else {
            self.codestreams[codestream].header
        }
    }

    /// Returns the file segment of one packet, and the number of bytes
    /// that earlier layers of the same precinct contribute to its data-bin.
    ///
    /// Extends the packet index if the packet lies beyond what has been
    /// built so far. Completed entries are never modified, so two sessions
    /// always observe the same prefix.
    pub fn packet(&self, pool: &FilePool, codestream: usize, packet: Packet) -> Result<(FileSegment, u64)> {
        let (target, stream) =
            if self.hyper_links.is_empty() { (self, codestream) }
            else {
                let linked = self.hyper_links.get(codestream)
                    .ok_or_else(|| Error::bad_request(format!("codestream {} does not exist", codestream)))?;

                (linked.as_ref(), 0)
            };

        target.ensure_built(pool, stream, packet.resolution)?;
        target.locate_packet(stream, packet)
    }

    fn locate_packet(&self, stream: usize, packet: Packet) -> Result<(FileSegment, u64)> {
        let index = read_lock(&self.streams[stream].packets)?;

        let position = u64_to_usize(self.coding.progression_index(packet)?);
        if position >= index.len() {
            return Err(Error::internal("packet index shorter than requested"));
        }

        let segment = index.get(position);

        let mut bin_offset = 0;
        if packet.layer > 0 {
            if self.coding.progression == Some(crate::coding::Progression::Rpcl) {
                // layers of one precinct are adjacent, walk backwards
                for earlier in (position - packet.layer as usize) .. position {
                    bin_offset += index.get(earlier).length;
                }
            }
            else {
                for layer in 0 .. packet.layer {
                    let earlier = Packet { layer, .. packet };
                    let earlier_position = u64_to_usize(self.coding.progression_index(earlier)?);
                    bin_offset += index.get(earlier_position).length;
                }
            }
        }

        Ok((segment, bin_offset))
    }

    /// Grows the packet index far enough to cover the given resolution.
    /// Partial progress is kept if reading fails halfway.
    fn ensure_built(&self, pool: &FilePool, stream: usize, resolution: u32) -> UnitResult {
        let state = &self.streams[stream];
        let mut cursor = lock(&state.cursor)?;

        if cursor.built_resolution.map_or(false, |built| built >= resolution) {
            return Ok(());
        }

        let mut file = pool.open(&self.path)?;
        let mut index = write_lock(&state.packets)?;

        if index.is_empty() {
            *index = PacketIndex::with_max_offset(file.size());
        }

        let resolution_major = self.coding.progression
            .map_or(false, crate::coding::Progression::is_resolution_major);

        let max_index = if resolution < self.coding.num_levels && resolution_major {
            // the last packet below the boundary to the next resolution
            let boundary = Packet { resolution: resolution + 1, .. Packet::default() };
            self.coding.progression_index(boundary)? - 1
        }
        else {
            self.coding.progression_index(self.coding.last_packet())?
        };

        trace!(
            "extending packet index of {:?} from {} to {} entries",
            self.path, index.len(), max_index + 1
        );

        while (index.len() as u64) <= max_index {
            let length = read_next_packet_length(&mut file, &self.codestreams[stream], &mut cursor)?;
            record_next_packet(&self.codestreams[stream], &mut cursor, length, &mut index)?;
        }

        cursor.built_resolution = Some(
            cursor.built_resolution.map_or(resolution, |built| built.max(resolution))
        );

        Ok(())
    }
}


/// Decodes the next packet length from the PLT byte stream. Lengths use
/// 7-bit continuation coding and may span PLT marker boundaries.
fn read_next_packet_length(file: &mut FileReader, codestream: &CodestreamIndex, cursor: &mut PltCursor) -> Result<u64> {
    let markers = &codestream.plt_markers;
    let current = *markers.get(cursor.last_plt)
        .ok_or_else(|| Error::bad_image("packet index exhausted the PLT markers"))?;

    if cursor.last_offset_plt == 0 { file.seek_to(current.offset)?; }
    else { file.seek_to(cursor.last_offset_plt)?; }

    let mut length = 0_u64;

    loop {
        let byte = file.read_u8()?;
        length = (length << 7) | u64::from(byte & 0x7F);
        if byte & 0x80 == 0 { break; }
    }

    cursor.last_offset_plt = file.offset();

    if cursor.last_offset_plt == current.end() {
        cursor.last_plt += 1;
        cursor.last_offset_plt = 0;
    }

    Ok(length)
}

/// Appends the next packet, tracking the consumed position across the
/// concatenated tile-part packet regions.
fn record_next_packet(codestream: &CodestreamIndex, cursor: &mut PltCursor, length: u64, index: &mut PacketIndex) -> UnitResult {
    let parts = &codestream.packets;
    let current = *parts.get(cursor.last_packet)
        .ok_or_else(|| Error::bad_image("packet index exhausted the tile-parts"))?;

    let offset =
        if cursor.last_offset_packet == 0 { current.offset }
        else { cursor.last_offset_packet };

    index.push(FileSegment::new(offset, length));
    cursor.last_offset_packet = offset + length;

    if cursor.last_offset_packet == current.end() {
        cursor.last_packet += 1;
        cursor.last_offset_packet = 0;
    }

    Ok(())
}


fn lock<'l, T>(mutex: &'l Mutex<T>) -> Result<MutexGuard<'l, T>> {
    mutex.lock().map_err(|_| Error::internal("image index mutex poisoned"))
}

fn read_lock<'l, T>(lock: &'l RwLock<T>) -> Result<RwLockReadGuard<'l, T>> {
    lock.read().map_err(|_| Error::internal("packet index lock poisoned"))
}

fn write_lock<'l, T>(lock: &'l RwLock<T>) -> Result<RwLockWriteGuard<'l, T>> {
    lock.write().map_err(|_| Error::internal("packet index lock poisoned"))
}
