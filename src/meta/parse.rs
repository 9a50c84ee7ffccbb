

//! The walkers that index an image file: one for the JPEG 2000
//! marker stream and one for the JP2/JPX box tree.
//!
//! Nothing is decoded here. The walkers only record where things are,
//! so that the server can later stream any byte range on demand.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use bit_field::BitField;
use log::trace;

use crate::coding::{CodingParameters, Progression};
use crate::error::{Error, Result, UnitResult};
use crate::io::FileReader;
use crate::math::{ceil_div, Vec2};
use crate::meta::{CodestreamIndex, ImageInfo, Metadata, PlaceHolder};
use crate::segment::FileSegment;


const MARKER_SOC: u16 = 0xFF4F;
const MARKER_SIZ: u16 = 0xFF51;
const MARKER_COD: u16 = 0xFF52;
const MARKER_PLT: u16 = 0xFF58;
const MARKER_SOT: u16 = 0xFF90;
const MARKER_SOD: u16 = 0xFF93;
const MARKER_EOC: u16 = 0xFFD9;

const BOX_JP2C: u32 = 0x6A70_3263; // "jp2c"
const BOX_JPCH: u32 = 0x6A70_6368; // "jpch"
const BOX_FTBL: u32 = 0x6674_626C; // "ftbl"
const BOX_FLST: u32 = 0x666C_7374; // "flst"
const BOX_DBTL: u32 = 0x6474_626C; // "dbtl"
const BOX_URL: u32 = 0x7572_6C20;  // "url "


/// Parses an image file, recursing into hyperlinked files.
/// The chain of paths already being parsed rejects hyperlink cycles.
pub(crate) fn read_image(path: &Path, root: &Path, chain: &mut Vec<PathBuf>) -> Result<ImageInfo> {
    if chain.iter().any(|ancestor| ancestor == path) {
        return Err(Error::bad_image(format!("hyperlink cycle through {:?}", path)));
    }

    chain.push(path.to_owned());
    let result = read_image_file(path, root, chain);
    chain.pop();

    // a file that ends in the middle of a box or marker is broken,
    // not an io failure of this server
    result.map_err(|error| match error {
        Error::Io(io) if io.kind() == ErrorKind::UnexpectedEof =>
            Error::bad_image(format!("unexpected end of file in {:?}", path)),

        other => other,
    })
}

fn read_image_file(path: &Path, root: &Path, chain: &mut Vec<PathBuf>) -> Result<ImageInfo> {
    let extension = path.extension()
        .and_then(|extension| extension.to_str())
        .map(str::to_ascii_lowercase);

    let mut file = FileReader::open(path)?;
    let mut info = ImageInfo::default();

    match extension.as_deref() {
        Some("jp2") => read_jp2(&mut file, &mut info)?,
        Some("jpx") => read_jpx(&mut file, &mut info, root, chain)?,
        Some("j2c") => read_raw_codestream(&mut file, &mut info)?,
        _ => return Err(Error::bad_image(format!("file type of {:?} not supported", path))),
    }

    if info.codestreams.is_empty() && info.hyperlink_paths.is_empty() {
        return Err(Error::bad_image(format!("no codestream in {:?}", path)));
    }

    if info.coding.precinct_size.is_empty() {
        return Err(Error::bad_image(format!("no COD marker in {:?}", path)));
    }

    info.coding.fill_total_precincts();
    Ok(info)
}


/// Walks the markers of one codestream, recording the header extent,
/// the packet-data region of each tile-part and every PLT payload.
fn read_codestream(file: &mut FileReader, coding: &mut CodingParameters, index: &mut CodestreamIndex) -> UnitResult {
    let mut any_plt = false;

    loop {
        let marker = file.read_u16()?;

        match marker {
            MARKER_EOC => {
                trace!("EOC marker");
                break;
            }

            MARKER_SOC => {
                trace!("SOC marker");
                index.header.offset = file.offset() - 2;
            }

            MARKER_SIZ => {
                trace!("SIZ marker");
                read_siz_marker(file, coding)?;
            }

            MARKER_COD => {
                trace!("COD marker");
                read_cod_marker(file, coding)?;
            }

            MARKER_SOT => {
                trace!("SOT marker");
                read_sot_marker(file, index)?;
            }

            MARKER_PLT => {
                trace!("PLT marker");
                read_plt_marker(file, index)?;
                any_plt = true;
            }

            MARKER_SOD => {
                trace!("SOD marker");
                read_sod_marker(file, index)?;
            }

            _ => {
                // any other marker carries its own 2-byte length
                let length = file.read_u16()?;
                let length = length.checked_sub(2)
                    .ok_or_else(|| Error::bad_image(format!("length of marker {:#06X}", marker)))?;

                file.skip(u64::from(length))?;
            }
        }
    }

    if !any_plt {
        return Err(Error::bad_image("codestream contains no PLT marker"));
    }

    Ok(())
}

/// SIZ: image and tile geometry, component count.
fn read_siz_marker(file: &mut FileReader, coding: &mut CodingParameters) -> UnitResult {
    file.skip(4)?; // Lsiz, Rsiz

    let reference_x = file.read_u32()?;
    let reference_y = file.read_u32()?;
    let origin_x = file.read_u32()?;
    let origin_y = file.read_u32()?;

    let width = reference_x.checked_sub(origin_x);
    let height = reference_y.checked_sub(origin_y);

    match (width, height) {
        (Some(width), Some(height)) =>
            coding.size = Vec2(u64::from(width), u64::from(height)),

        _ => return Err(Error::bad_image("image origin beyond its reference grid")),
    }

    file.skip(16)?; // tile size and tile origin

    let components = file.read_u16()?;
    coding.num_components = u32::from(components);

    // bit depth and sub-sampling of each component
    file.skip(3 * u64::from(components))?;
    Ok(())
}

/// COD: progression, layer count, decomposition levels, precinct sizes.
fn read_cod_marker(file: &mut FileReader, coding: &mut CodingParameters) -> UnitResult {
    file.skip(2)?; // Lcod

    let style = file.read_u8()?;
    let explicit_precincts = style.get_bit(0);

    coding.progression = Some(Progression::from_code(file.read_u8()?)?);
    coding.num_layers = u32::from(file.read_u16()?);

    file.skip(1)?; // component transform
    coding.num_levels = u32::from(file.read_u8()?);
    file.skip(4)?; // code-block size and style, wavelet transform

    coding.precinct_size.clear();

    for level in 0 ..= coding.num_levels {
        if explicit_precincts {
            // one exponent byte per resolution, lowest resolution first
            let exponents = file.read_u8()?;
            let width = 1_u64 << exponents.get_bits(0..4);
            let height = 1_u64 << exponents.get_bits(4..8);
            coding.precinct_size.push(Vec2(width, height));
        }
        else {
            // maximal precincts, covering the whole image at each resolution
            let width = ceil_div(coding.size.x(), 1_u64 << level);
            let height = ceil_div(coding.size.y(), 1_u64 << level);
            coding.precinct_size.insert(0, Vec2(width, height));
        }
    }

    Ok(())
}

/// SOT: closes the main header and opens the next tile-part region.
fn read_sot_marker(file: &mut FileReader, index: &mut CodestreamIndex) -> UnitResult {
    if index.header.length == 0 {
        index.header.length = file.offset() - 2 - index.header.offset;
    }

    file.skip(4)?; // Lsot, Isot
    let tile_part_length = file.read_u32()?;
    file.skip(2)?; // TPsot, TNsot

    let remaining = u64::from(tile_part_length).checked_sub(12)
        .ok_or_else(|| Error::bad_image("tile-part shorter than its SOT marker"))?;

    index.packets.push(FileSegment::new(file.offset(), remaining));
    Ok(())
}

/// PLT: records the payload, skipping the marker length and index bytes.
fn read_plt_marker(file: &mut FileReader, index: &mut CodestreamIndex) -> UnitResult {
    let payload_offset = file.offset() + 3;

    let marker_length = file.read_u16()?;
    let payload_length = u64::from(marker_length).checked_sub(3)
        .ok_or_else(|| Error::bad_image("empty PLT marker"))?;

    file.skip(u64::from(marker_length) - 2)?;
    index.plt_markers.push(FileSegment::new(payload_offset, payload_length));
    Ok(())
}

/// SOD: shrinks the open tile-part region to the bytes after this marker.
fn read_sod_marker(file: &mut FileReader, index: &mut CodestreamIndex) -> UnitResult {
    let segment = index.packets.last_mut()
        .ok_or_else(|| Error::bad_image("SOD marker before any SOT marker"))?;

    let header_bytes = file.offset() - segment.offset;
    segment.length = segment.length.checked_sub(header_bytes)
        .ok_or_else(|| Error::bad_image("tile-part header exceeds the tile-part"))?;

    segment.offset = file.offset();
    file.skip(segment.length)?;
    Ok(())
}


/// Reads one box header and returns the box type
/// and the number of content bytes after the header.
fn read_box_header(file: &mut FileReader) -> Result<(u32, u64)> {
    let length = file.read_u32()?;
    let box_type = file.read_u32()?;

    let content_length = match length {
        1 => {
            let extended = file.read_u64()?;
            extended.checked_sub(16)
                .ok_or_else(|| Error::bad_image("extended box length"))?
        }

        0 => file.size() - file.offset(),

        other => u64::from(other).checked_sub(8)
            .ok_or_else(|| Error::bad_image("box length"))?,
    };

    Ok((box_type, content_length))
}

/// A raw codestream without any box structure. The meta-data stays empty.
fn read_raw_codestream(file: &mut FileReader, info: &mut ImageInfo) -> UnitResult {
    info.codestreams.push(CodestreamIndex::default());

    let index = info.codestreams.last_mut()
        .ok_or_else(|| Error::internal("codestream vector vanished"))?;

    read_codestream(file, &mut info.coding, index)
}

/// Walks a JP2 box tree: everything around the codestream box
/// becomes meta-data, with one place-holder per codestream.
fn read_jp2(file: &mut FileReader, info: &mut ImageInfo) -> UnitResult {
    info.codestreams.push(CodestreamIndex::default());
    let mut block_start = 0_u64;

    while file.offset() != file.size() {
        let box_start = file.offset();
        let block_length = box_start - block_start;

        let (box_type, content_length) = read_box_header(file)?;
        let header_length = file.offset() - box_start;

        match box_type {
            BOX_JP2C => {
                trace!("jp2c box");
                info.metadata.segments.push(FileSegment::new(block_start, block_length));

                let codestream = info.codestreams.last_mut()
                    .ok_or_else(|| Error::internal("codestream vector vanished"))?;

                read_codestream(file, &mut info.coding, codestream)?;

                info.metadata.placeholders.push(PlaceHolder {
                    id: (info.codestreams.len() - 1) as u64,
                    is_codestream: true,
                    header: FileSegment::new(box_start, header_length),
                    data_length: content_length,
                });

                block_start = file.offset();
            }

            _ => file.skip(content_length)?,
        }
    }

    info.metadata.segments.push(FileSegment::new(block_start, file.offset() - block_start));
    Ok(())
}

/// Walks a JPX box tree. In addition to inline codestreams, fragment
/// tables may reference codestreams in external files, which are then
/// parsed recursively and attached at the referenced slots.
fn read_jpx(file: &mut FileReader, info: &mut ImageInfo, root: &Path, chain: &mut Vec<PathBuf>) -> UnitResult {
    let mut block_start = 0_u64;
    let mut fragment_table_header = FileSegment::NULL;
    let mut fragment_lists_in_table = 0;

    let mut data_references = Vec::new();
    let mut referenced_paths = Vec::new();

    while file.offset() != file.size() {
        let box_start = file.offset();
        let block_length = box_start - block_start;

        let (box_type, content_length) = read_box_header(file)?;
        let header_length = file.offset() - box_start;

        match box_type {
            BOX_JPCH => {
                trace!("jpch box");
                info.codestreams.push(CodestreamIndex::default());
            }

            BOX_JP2C => {
                trace!("jp2c box");
                info.metadata.segments.push(FileSegment::new(block_start, block_length));

                if info.codestreams.is_empty() {
                    info.codestreams.push(CodestreamIndex::default());
                }

                let codestream = info.codestreams.last_mut()
                    .ok_or_else(|| Error::internal("codestream vector vanished"))?;

                read_codestream(file, &mut info.coding, codestream)?;

                info.metadata.placeholders.push(PlaceHolder {
                    id: (info.codestreams.len() - 1) as u64,
                    is_codestream: true,
                    header: FileSegment::new(box_start, header_length),
                    data_length: content_length,
                });

                block_start = file.offset();
            }

            BOX_FTBL => {
                trace!("ftbl box");
                info.metadata.segments.push(FileSegment::new(block_start, block_length));
                fragment_table_header = FileSegment::new(box_start, header_length);
                fragment_lists_in_table = 0;
            }

            BOX_FLST => {
                trace!("flst box");
                let data_reference = read_flst_box(file)?;

                if fragment_lists_in_table > 0 {
                    info.metadata.segments.push(FileSegment::NULL);
                }

                fragment_lists_in_table += 1;

                info.metadata.placeholders.push(PlaceHolder {
                    id: data_references.len() as u64,
                    is_codestream: true,
                    header: fragment_table_header,
                    data_length: 0,
                });

                data_references.push(data_reference);
                block_start = file.offset();
            }

            BOX_DBTL => {
                trace!("dbtl box");
                file.skip(2)?; // number of data references, the boxes follow
            }

            BOX_URL => {
                trace!("url box");
                referenced_paths.push(read_url_box(file, content_length, root)?);
            }

            _ => file.skip(content_length)?,
        }
    }

    info.metadata.segments.push(FileSegment::new(block_start, file.offset() - block_start));

    if data_references.len() != referenced_paths.len() {
        return Err(Error::bad_image("fragment lists and data references out of step"));
    }

    for (index, path) in referenced_paths.iter().enumerate() {
        info.hyperlink_paths.push((path.clone(), index));
    }

    if !info.hyperlink_paths.is_empty() {
        info.codestreams = vec![CodestreamIndex::default(); info.hyperlink_paths.len()];
        info.hyperlink_metadata = vec![Metadata::default(); info.hyperlink_paths.len()];
    }

    for linked_index in 0 .. info.hyperlink_paths.len() {
        let (path, slot) = info.hyperlink_paths[linked_index].clone();
        let linked = read_image(&path, root, chain)?;

        let last_codestream = linked.codestreams.last()
            .ok_or_else(|| Error::bad_image(format!("no codestream in hyperlink {:?}", path)))?;

        info.coding = linked.coding.clone();
        info.codestreams[slot] = last_codestream.clone();
        info.hyperlink_metadata[slot] = linked.metadata.clone();
    }

    Ok(())
}

/// Returns the data-reference index of a fragment list.
/// Only single-fragment lists occur in the images this server hosts.
fn read_flst_box(file: &mut FileReader) -> Result<u16> {
    file.skip(14)?; // fragment count, offset and length of the first fragment
    file.read_u16()
}

/// Decodes the `file://` location of a data-reference URL box,
/// substituting a leading `./` with the configured images root.
fn read_url_box(file: &mut FileReader, content_length: u64, root: &Path) -> Result<PathBuf> {
    file.skip(4)?; // version and flags

    let location_length = content_length.checked_sub(4)
        .ok_or_else(|| Error::bad_image("url box length"))?;

    let mut location = vec![0_u8; crate::error::u64_to_usize(location_length)];
    file.read_exact(&mut location)?;

    // the location is null-terminated
    let terminator = location.iter().position(|&byte| byte == 0).unwrap_or(location.len());
    let location = String::from_utf8_lossy(&location[.. terminator]).into_owned();

    let path = location.strip_prefix("file://")
        .ok_or_else(|| Error::bad_image(format!("data reference {:?} is not a file url", location)))?;

    let path = path.replace("%23", "#");

    match path.strip_prefix("./") {
        Some(relative) => Ok(root.join(relative)),
        None => Ok(PathBuf::from(path)),
    }
}
