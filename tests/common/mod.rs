
//! Builds small synthetic images and decodes jpp-streams,
//! so the tests can assert on real files and real responses.

#![allow(dead_code)] // not every test binary uses every helper

use std::path::PathBuf;


pub fn push_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_be_bytes());
}

pub fn push_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_be_bytes());
}

pub fn push_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_be_bytes());
}

/// Big-endian base 128 with continuation bits,
/// as used by PLT markers and JPIP message headers.
pub fn push_7bit(out: &mut Vec<u8>, value: u64) {
    let mut groups = [0_u8; 10];
    let mut count = 0;
    let mut remaining = value;

    loop {
        groups[count] = (remaining & 0x7F) as u8;
        count += 1;
        remaining >>= 7;
        if remaining == 0 { break; }
    }

    for group in (1..count).rev() {
        out.push(groups[group] | 0x80);
    }

    out.push(groups[0]);
}


/// The geometry of a generated codestream.
#[derive(Debug, Clone)]
pub struct CodestreamSpec {
    pub size: u32,
    pub levels: u8,
    pub layers: u16,
    pub components: u16,
    pub progression: u8,
    pub packet_lengths: Vec<u64>,
}

impl CodestreamSpec {

    /// 128x128, 3 levels, 1 layer, 1 component, RPCL, whole-image
    /// precincts: one packet per resolution.
    pub fn simple() -> Self {
        CodestreamSpec {
            size: 128,
            levels: 3,
            layers: 1,
            components: 1,
            progression: 2, // RPCL
            packet_lengths: vec![60, 20, 30, 40],
        }
    }

    /// The i-th packet is filled with this byte.
    pub fn packet_fill(index: usize) -> u8 {
        0xA0 + index as u8
    }

    /// The main header length: SOC plus SIZ plus COD.
    pub fn header_length(&self) -> u64 {
        2 + (2 + 38 + 3 * u64::from(self.components)) + (2 + 12)
    }

    /// Serializes the codestream: SOC, SIZ, COD, one tile-part with a
    /// PLT marker listing every packet length, the packet data, EOC.
    pub fn build(&self) -> Vec<u8> {
        let mut out = Vec::new();

        // SOC
        push_u16(&mut out, 0xFF4F);

        // SIZ
        push_u16(&mut out, 0xFF51);
        push_u16(&mut out, 38 + 3 * self.components);
        push_u16(&mut out, 0); // capabilities
        push_u32(&mut out, self.size); // reference grid
        push_u32(&mut out, self.size);
        push_u32(&mut out, 0); // image origin
        push_u32(&mut out, 0);
        push_u32(&mut out, self.size); // tile size
        push_u32(&mut out, self.size);
        push_u32(&mut out, 0); // tile origin
        push_u32(&mut out, 0);
        push_u16(&mut out, self.components);
        for _ in 0..self.components {
            out.extend_from_slice(&[7, 1, 1]); // depth, sub-sampling
        }

        // COD, default precincts
        push_u16(&mut out, 0xFF52);
        push_u16(&mut out, 12);
        out.push(0); // style: no explicit precincts
        out.push(self.progression);
        push_u16(&mut out, self.layers);
        out.push(0); // component transform
        out.push(self.levels);
        out.extend_from_slice(&[4, 4, 0, 0]); // code-blocks, wavelet

        // the PLT payload: one 7-bit coded length per packet
        let mut plt_payload = Vec::new();
        for &length in &self.packet_lengths {
            push_7bit(&mut plt_payload, length);
        }

        let plt_marker_length = 3 + plt_payload.len() as u16;
        let data_length: u64 = self.packet_lengths.iter().sum();

        let tile_part_length =
            12 + (2 + u64::from(plt_marker_length)) + 2 + data_length;

        // SOT
        push_u16(&mut out, 0xFF90);
        push_u16(&mut out, 10);
        push_u16(&mut out, 0); // tile index
        push_u32(&mut out, tile_part_length as u32);
        out.push(0); // tile-part index
        out.push(1); // tile-part count

        // PLT
        push_u16(&mut out, 0xFF58);
        push_u16(&mut out, plt_marker_length);
        out.push(0); // marker index
        out.extend_from_slice(&plt_payload);

        // SOD and the packet data
        push_u16(&mut out, 0xFF93);
        for (index, &length) in self.packet_lengths.iter().enumerate() {
            out.extend(std::iter::repeat(Self::packet_fill(index)).take(length as usize));
        }

        // EOC
        push_u16(&mut out, 0xFFD9);
        out
    }

    /// The codestream without its PLT marker, which no server can index.
    pub fn build_without_plt(&self) -> Vec<u8> {
        let with = self.build();
        let mut out = Vec::new();

        // rebuild, dropping the PLT marker bytes
        let plt_start = find_marker(&with, 0xFF58).expect("built codestream has a PLT");
        let plt_length = u16::from_be_bytes([with[plt_start + 2], with[plt_start + 3]]);

        out.extend_from_slice(&with[.. plt_start]);
        out.extend_from_slice(&with[plt_start + 2 + plt_length as usize ..]);

        // the tile-part length shrank
        let sot = find_marker(&out, 0xFF90).expect("built codestream has a SOT");
        let old_length = u32::from_be_bytes([
            out[sot + 6], out[sot + 7], out[sot + 8], out[sot + 9],
        ]);

        let new_length = old_length - 2 - u32::from(plt_length);
        out[sot + 6 .. sot + 10].copy_from_slice(&new_length.to_be_bytes());

        out
    }
}

fn find_marker(bytes: &[u8], marker: u16) -> Option<usize> {
    let pattern = marker.to_be_bytes();
    bytes.windows(2).position(|window| window == pattern)
}


fn build_box(box_type: u32, content: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    push_u32(&mut out, 8 + content.len() as u32);
    push_u32(&mut out, box_type);
    out.extend_from_slice(content);
    out
}

/// Wraps a codestream into a minimal JP2 box tree:
/// signature, file type, one contiguous codestream box.
pub fn build_jp2(codestream: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();

    out.extend(build_box(0x6A50_2020, &[0x0D, 0x0A, 0x87, 0x0A])); // jP
    out.extend(build_box(0x6674_7970, b"jp2 \x00\x00\x00\x00jp2 ")); // ftyp
    out.extend(build_box(0x6A70_3263, codestream)); // jp2c
    out
}

/// A JPX that holds no codestream itself: one fragment table whose
/// fragment list points at a data reference, and a data-reference
/// table with one `file://` url box.
pub fn build_hyperlinked_jpx(location: &str) -> Vec<u8> {
    let mut out = Vec::new();

    out.extend(build_box(0x6A50_2020, &[0x0D, 0x0A, 0x87, 0x0A])); // jP
    out.extend(build_box(0x6674_7970, b"jpx \x00\x00\x00\x00jpx ")); // ftyp

    // flst: one fragment, data reference 1
    let mut fragment_list = Vec::new();
    push_u16(&mut fragment_list, 1);
    push_u64(&mut fragment_list, 0);
    push_u32(&mut fragment_list, 0);
    push_u16(&mut fragment_list, 1);

    out.extend(build_box(0x6674_626C, &build_box(0x666C_7374, &fragment_list))); // ftbl(flst)

    // dbtl: one url box
    let mut url = Vec::new();
    url.extend_from_slice(&[0, 0, 0, 0]); // version, flags
    url.extend_from_slice(location.as_bytes());
    url.push(0);

    let mut data_reference_table = Vec::new();
    push_u16(&mut data_reference_table, 1);
    data_reference_table.extend(build_box(0x7572_6C20, &url));

    out.extend(build_box(0x6474_626C, &data_reference_table)); // dbtl
    out
}


/// A fresh directory for one test, acting as the images folder.
pub fn test_images_folder(name: &str) -> PathBuf {
    let folder = std::env::temp_dir()
        .join(format!("jpip-tests-{}", std::process::id()))
        .join(name);

    std::fs::create_dir_all(&folder).expect("create test images folder");
    folder
}


/// One decoded element of a jpp-stream body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamItem {
    Message(Message),
    Eor(u8),
}

/// One decoded data-bin message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub class: u64,
    pub codestream: u64,
    pub bin_id: u64,
    pub bin_offset: u64,
    pub last: bool,
    pub payload: Vec<u8>,
}

fn read_7bit(bytes: &[u8], at: &mut usize) -> u64 {
    let mut value = 0_u64;

    loop {
        let byte = bytes[*at];
        *at += 1;
        value = (value << 7) | u64::from(byte & 0x7F);
        if byte & 0x80 == 0 { break; }
    }

    value
}

/// Decodes a whole response body into messages and end-of-response codes.
pub fn decode_stream(bytes: &[u8]) -> Vec<StreamItem> {
    let mut items = Vec::new();
    let mut at = 0;

    let mut class = 0_u64;
    let mut codestream = 0_u64;

    while at < bytes.len() {
        let first = bytes[at];

        if first == 0 {
            // end-of-response triplet
            assert_eq!(bytes[at + 2], 0, "malformed end-of-response");
            items.push(StreamItem::Eor(bytes[at + 1]));
            at += 3;
            continue;
        }

        at += 1;

        let preamble = (first >> 5) & 0x3;
        let last = first & 0x10 != 0;

        let bin_id = if first & 0x80 != 0 {
            read_7bit(bytes, &mut at)
        }
        else {
            u64::from(first & 0x0F)
        };

        if preamble >= 2 {
            class = read_7bit(bytes, &mut at);

            if preamble == 3 {
                codestream = read_7bit(bytes, &mut at);
            }
        }

        let bin_offset = read_7bit(bytes, &mut at);
        let length = read_7bit(bytes, &mut at) as usize;

        let payload = bytes[at .. at + length].to_vec();
        at += length;

        items.push(StreamItem::Message(Message {
            class, codestream, bin_id, bin_offset, last, payload,
        }));
    }

    items
}

/// The messages of a stream, without the end-of-response codes.
pub fn messages(items: &[StreamItem]) -> Vec<Message> {
    items.iter()
        .filter_map(|item| match item {
            StreamItem::Message(message) => Some(message.clone()),
            StreamItem::Eor(_) => None,
        })
        .collect()
}

/// The last item of a stream must be this end-of-response code.
pub fn assert_ends_with_eor(items: &[StreamItem], expected: u8) {
    match items.last() {
        Some(StreamItem::Eor(code)) => assert_eq!(
            *code, expected,
            "response ended with the wrong end-of-response code"
        ),

        other => panic!("response did not end with an end-of-response: {:?}", other),
    }
}
