

//! The data-bin server: turns requests into a stream of response chunks,
//! sending only what the client does not already hold.

use std::sync::Arc;

use log::{debug, trace};
use smallvec::SmallVec;

use crate::error::{Error, Result, UnitResult};
use crate::index::cache::FilePool;
use crate::index::ImageIndex;
use crate::jpip::cache_model::CacheModel;
use crate::jpip::request::Request;
use crate::jpip::woi::{Woi, WoiComposer};
use crate::jpip::writer::{DataBinWriter, MessageContext};
use crate::jpip::{DataBinClass, EorCode};
use crate::segment::FileSegment;


/// Bytes reserved at the tail of every chunk, so that an end-of-response
/// message plus one small header always fit.
const MIN_SPACE: usize = 60;

/// When less than this remains of the byte budget after a truncated
/// chunk, the response ends with `ByteLimitReached` instead of
/// dribbling out tiny chunks.
const BYTE_LIMIT_SLACK: u64 = MIN_SPACE as u64 + 100;


/// Serves one image to one client channel.
///
/// The transport repeatedly calls [`DataBinServer::generate_chunk`] until
/// it signals completion; each call fills one buffer with messages that
/// respect both the remaining byte budget and the client cache model.
#[derive(Debug)]
pub struct DataBinServer {
    image: Arc<ImageIndex>,

    woi: Option<Woi>,
    has_woi: bool,
    metareq: bool,
    end_woi: bool,

    /// Bytes that remain of the `len` budget of the current request.
    pending: u64,

    codestreams: SmallVec<[usize; 4]>,

    /// Round-robin position within `codestreams`.
    current_idx: usize,

    cache_model: CacheModel,
    composer: WoiComposer,
    context: MessageContext,
}

/// What became of one data-bin inside a chunk.
enum BinStatus {

    /// The data was written completely, or the client already has it.
    Done,

    /// The chunk is full; the data was written partially or not at all.
    Truncated,
}

impl DataBinServer {

    /// A fresh server for one image, with an empty cache model.
    pub fn new(image: Arc<ImageIndex>) -> Self {
        DataBinServer {
            image,
            woi: None,
            has_woi: false,
            metareq: false,
            end_woi: false,
            pending: 0,
            codestreams: SmallVec::new(),
            current_idx: 0,
            cache_model: CacheModel::new(),
            composer: WoiComposer::new(),
            context: MessageContext::default(),
        }
    }

    /// The image this server streams.
    pub fn image(&self) -> &Arc<ImageIndex> { &self.image }

    /// Whether the current window has been transferred completely.
    pub fn end_of_woi(&self) -> bool { self.end_woi }

    /// Whether the client explicitly asked for meta-data.
    pub fn metadata_requested(&self) -> bool { self.metareq }

    /// The cache model of this channel.
    pub fn cache_model(&self) -> &CacheModel { &self.cache_model }

    /// Replaces the cache model, used when a checkpointed
    /// channel is resumed.
    pub fn restore_cache_model(&mut self, model: CacheModel) {
        self.cache_model = model;
    }

    /// Drops the window of the previous request.
    pub fn reset(&mut self) {
        self.has_woi = false;
        self.metareq = false;
    }

    /// Takes over the parameters of a new request on this channel.
    pub fn set_request(&mut self, request: &Request) -> UnitResult {
        self.context.clear();

        let mut reset_woi = false;

        self.has_woi = request.mask.has_woi();
        if self.has_woi {
            let woi = request.woi(self.image.coding());

            if self.woi != Some(woi) {
                debug!("new window of interest {:?}", woi);
                self.woi = Some(woi);
                reset_woi = true;
            }
        }

        if request.mask.model() {
            self.cache_model.merge(&request.cache_model);
        }

        if request.mask.metareq() {
            self.metareq = true;
        }

        if request.mask.stream() || request.mask.context() {
            if self.codestreams != request.codestreams {
                self.validate_codestreams(&request.codestreams)?;
                self.codestreams = request.codestreams.clone();
                self.current_idx = 0;
                reset_woi = true;
            }
        }

        // a windowed request that never named a codestream addresses the first
        if self.codestreams.is_empty() {
            self.codestreams.push(0);
        }

        if request.mask.len() {
            self.pending = request.length_response;
        }

        if reset_woi {
            self.end_woi = false;

            if let Some(woi) = self.woi {
                self.composer.reset(self.image.coding(), &woi);
            }
        }

        Ok(())
    }

    fn validate_codestreams(&self, requested: &[usize]) -> UnitResult {
        let available = self.image.num_codestreams();

        match requested.iter().find(|&&index| index >= available) {
            Some(missing) => Err(Error::bad_request(
                format!("codestream {} of {} does not exist", missing, available),
            )),

            None => Ok(()),
        }
    }

    /// Fills the buffer with the next chunk of the response.
    /// Returns the number of bytes written and whether the response
    /// is complete. The buffer length bounds the chunk size.
    pub fn generate_chunk(&mut self, pool: &FilePool, buffer: &mut [u8]) -> Result<(usize, bool)> {
        if self.pending == 0 {
            return Ok((0, true));
        }

        let budget = self.pending.min(buffer.len() as u64);
        let chunk = &mut buffer[.. crate::error::u64_to_usize(budget)];

        // the context outlives the writer, which borrows the buffer
        let mut context = std::mem::take(&mut self.context);
        let result = self.fill_chunk(pool, chunk, &mut context);
        self.context = context;

        let written = result?;

        let done = self.pending == 0;
        if done {
            self.cache_model.pack(1);
        }

        trace!("generated a chunk of {} bytes, done: {}", written, done);
        Ok((written, done))
    }

    fn fill_chunk(&mut self, pool: &FilePool, chunk: &mut [u8], context: &mut MessageContext) -> Result<usize> {
        let mut writer = DataBinWriter::new(chunk, context);
        let mut full = false;

        self.write_metadata(pool, &mut writer, &mut full)?;

        if !full {
            self.write_stream_headers(pool, &mut writer, &mut full)?;
        }

        if !full && self.has_woi {
            self.write_window_packets(pool, &mut writer, &mut full)?;
        }

        if !full {
            writer.write_eor(EorCode::WindowDone);
            self.end_woi = true;
            self.pending = 0;
        }
        else {
            self.pending = self.pending.saturating_sub(writer.written() as u64);

            if self.pending <= BYTE_LIMIT_SLACK {
                writer.write_eor(EorCode::ByteLimitReached);
                self.pending = 0;
            }
        }

        Ok(writer.written())
    }

    /// Sends the meta-data blocks, interleaved with the place-holder
    /// boxes that let the client reconstruct the file layout. An image
    /// without meta-data gets one empty meta-data message.
    fn write_metadata(&mut self, pool: &FilePool, writer: &mut DataBinWriter<'_>, full: &mut bool) -> UnitResult {
        if self.cache_model.is_full_metadata() {
            return Ok(());
        }

        let image = self.image.clone();
        let mut file = pool.open(image.path())?;

        if image.num_metadata() == 0 {
            self.write_cached_segment(
                writer, full, DataBinClass::MetaData,
                &mut file, 0, 0, FileSegment::NULL, 0, true,
            )?;

            return Ok(());
        }

        let mut bin_offset = 0_u64;

        for block in 0 .. image.num_metadata() {
            let last = block + 1 == image.num_metadata();
            let segment = image.metadata_segment(block);

            let status = self.write_cached_segment(
                writer, full, DataBinClass::MetaData,
                &mut file, 0, 0, segment, bin_offset, last,
            )?;

            bin_offset += segment.length;

            if last {
                if let BinStatus::Done = status {
                    self.cache_model.set_full_metadata();
                }
            }
            else {
                let place_holder = *image.place_holder(block);

                let status = self.write_cached_place_holder(
                    writer, full, &mut file, 0, 0, &place_holder, bin_offset,
                )?;

                if let BinStatus::Truncated = status {
                    break;
                }

                bin_offset += place_holder.message_length();
            }
        }

        Ok(())
    }

    /// Bootstraps every requested codestream: its main header and the
    /// empty tile header that jpp-streams are expected to carry.
    fn write_stream_headers(&mut self, pool: &FilePool, writer: &mut DataBinWriter<'_>, full: &mut bool) -> UnitResult {
        let image = self.image.clone();

        for position in 0 .. self.codestreams.len() {
            let codestream = self.codestreams[position];
            let mut file = pool.open(image.path_for(codestream))?;

            self.write_cached_segment(
                writer, full, DataBinClass::MainHeader,
                &mut file, codestream, 0, image.main_header(codestream), 0, true,
            )?;

            self.write_cached_segment(
                writer, full, DataBinClass::TileHeader,
                &mut file, codestream, 0, FileSegment::NULL, 0, true,
            )?;
        }

        Ok(())
    }

    /// Streams the precinct packets covering the window, cycling through
    /// the requested codestreams for every packet of the composition.
    fn write_window_packets(&mut self, pool: &FilePool, writer: &mut DataBinWriter<'_>, full: &mut bool) -> UnitResult {
        let image = self.image.clone();
        let coding = image.coding();

        while !writer.is_truncated() && !*full {
            let packet = match self.composer.current() {
                Some(packet) => packet,
                None => break,
            };

            let codestream = self.codestreams[self.current_idx];
            let (segment, bin_offset) = image.packet(pool, codestream, packet)?;

            let bin_id = coding.precinct_data_bin_id(packet);
            let last = packet.layer + 1 >= coding.num_layers;

            let mut file = pool.open(image.path_for(codestream))?;

            let status = self.write_cached_segment(
                writer, full, DataBinClass::Precinct,
                &mut file, codestream, bin_id, segment, bin_offset, last,
            )?;

            if let BinStatus::Done = status {
                if self.current_idx + 1 < self.codestreams.len() {
                    self.current_idx += 1;
                }
                else {
                    self.current_idx = 0;

                    if !self.composer.advance(coding) {
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// The single choke-point that reconciles the cache model with what
    /// is actually sent. Drops the prefix the client already holds,
    /// clamps the rest to the remaining space, and records the sent
    /// bytes in the cache model only once they are safely in the buffer.
    #[allow(clippy::too_many_arguments)]
    fn write_cached_segment(
        &mut self,
        writer: &mut DataBinWriter<'_>,
        full: &mut bool,
        class: DataBinClass,
        file: &mut crate::index::cache::PooledReader<'_>,
        codestream: usize,
        bin_id: u64,
        segment: FileSegment,
        bin_offset: u64,
        last: bool,
    ) -> Result<BinStatus> {
        let cached = self.cache_model.bin(class, codestream, bin_id);

        if cached.is_complete() {
            return Ok(BinStatus::Done);
        }

        // bytes of this segment the client already has
        let skip = u64::from(cached.value()).saturating_sub(bin_offset);

        if skip > segment.length {
            return Ok(BinStatus::Done);
        }

        let free = writer.free().saturating_sub(MIN_SPACE);

        if free == 0 {
            *full = true;
            return Ok(BinStatus::Truncated);
        }

        let mut part = segment;
        part.trim_front(skip);

        let mut last = last;
        let mut complete_write = true;

        if part.length > free as u64 {
            part.length = free as u64;
            last = false;
            complete_write = false;
        }

        writer.set_class(class);
        writer.set_codestream(codestream as u64);

        let sent_offset = bin_offset + skip;
        let written = writer.write_segment(bin_id, sent_offset, file, part, last)?;

        if !written {
            // the part was clamped to the free space, so it always fits
            return Err(Error::internal("a clamped segment overran the chunk"));
        }

        self.cache_model.add_to_bin(class, codestream, bin_id, part.length as u32, last);

        if complete_write { Ok(BinStatus::Done) }
        else { Ok(BinStatus::Truncated) }
    }

    /// Like `write_cached_segment`, but a place-holder box is
    /// never split across chunks.
    fn write_cached_place_holder(
        &mut self,
        writer: &mut DataBinWriter<'_>,
        full: &mut bool,
        file: &mut crate::index::cache::PooledReader<'_>,
        codestream: usize,
        bin_id: u64,
        place_holder: &crate::meta::PlaceHolder,
        bin_offset: u64,
    ) -> Result<BinStatus> {
        let cached = self.cache_model.bin(DataBinClass::MetaData, codestream, bin_id);

        if cached.is_complete() {
            return Ok(BinStatus::Done);
        }

        let skip = u64::from(cached.value()).saturating_sub(bin_offset);

        if place_holder.message_length() <= skip {
            return Ok(BinStatus::Done);
        }

        let space_needed = MIN_SPACE as u64 + place_holder.message_length();

        if (writer.free() as u64) <= space_needed {
            *full = true;
            return Ok(BinStatus::Truncated);
        }

        writer.set_class(DataBinClass::MetaData);
        writer.set_codestream(codestream as u64);

        let sent_offset = bin_offset.max(u64::from(cached.value()));
        let written = writer.write_placeholder(bin_id, sent_offset, file, place_holder, false)?;

        if !written {
            return Err(Error::internal("a measured place-holder overran the chunk"));
        }

        self.cache_model.add_to_bin(
            DataBinClass::MetaData, codestream, bin_id,
            place_holder.message_length() as u32, false,
        );

        Ok(BinStatus::Done)
    }
}
