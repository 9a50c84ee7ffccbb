

//! Parses the CGI-style query of a JPIP request.

use bit_field::BitField;
use smallvec::SmallVec;

use crate::coding::CodingParameters;
use crate::error::{Error, Result, UnitResult};
use crate::jpip::cache_model::CacheModel;
use crate::jpip::woi::Woi;
use crate::math::{ceil_div, RoundingMode, Size, Vec2};


/// Remembers which parameters a request actually carried.
/// Most fields of a request are only meaningful when their bit is set.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
pub struct ParameterMask(u16);

impl ParameterMask {
    const FSIZ: usize = 0;
    const ROFF: usize = 1;
    const RSIZ: usize = 2;
    const METAREQ: usize = 3;
    const LEN: usize = 4;
    const TARGET: usize = 5;
    const CID: usize = 6;
    const CNEW: usize = 7;
    const CCLOSE: usize = 8;
    const MODEL: usize = 9;
    const STREAM: usize = 10;
    const CONTEXT: usize = 11;

    pub fn fsiz(self) -> bool { self.0.get_bit(Self::FSIZ) }
    pub fn roff(self) -> bool { self.0.get_bit(Self::ROFF) }
    pub fn rsiz(self) -> bool { self.0.get_bit(Self::RSIZ) }
    pub fn metareq(self) -> bool { self.0.get_bit(Self::METAREQ) }
    pub fn len(self) -> bool { self.0.get_bit(Self::LEN) }
    pub fn target(self) -> bool { self.0.get_bit(Self::TARGET) }
    pub fn cid(self) -> bool { self.0.get_bit(Self::CID) }
    pub fn cnew(self) -> bool { self.0.get_bit(Self::CNEW) }
    pub fn cclose(self) -> bool { self.0.get_bit(Self::CCLOSE) }
    pub fn model(self) -> bool { self.0.get_bit(Self::MODEL) }
    pub fn stream(self) -> bool { self.0.get_bit(Self::STREAM) }
    pub fn context(self) -> bool { self.0.get_bit(Self::CONTEXT) }

    /// Whether any of the window parameters was supplied.
    pub fn has_woi(self) -> bool { self.0 & 0b111 != 0 }

    fn set(&mut self, bit: usize) { self.0.set_bit(bit, true); }
}


/// One parsed JPIP request.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Request {

    /// Which of the fields below were supplied.
    pub mask: ParameterMask,

    /// The image path, relative to the images folder.
    pub target: Option<String>,

    /// The channel this request continues.
    pub channel_id: Option<String>,

    /// The channel this request closes; `*` closes any channel.
    pub close_channel: Option<String>,

    /// `roff`: upper-left corner of the window, in pixels of the frame size.
    pub woi_position: Size,

    /// `rsiz`: extent of the window, in pixels of the frame size.
    pub woi_size: Size,

    /// `fsiz`: the requested frame size of the whole image.
    pub resolution_size: Size,

    /// How to choose the resolution level when `fsiz` matches none exactly.
    pub round_direction: RoundingMode,

    /// The requested codestreams, expanded from `stream=` or `context=`.
    pub codestreams: SmallVec<[usize; 4]>,

    /// `len`: the byte budget for the response.
    pub length_response: u64,

    /// The cache-model delta announced with `model=`.
    pub cache_model: CacheModel,
}

impl Request {

    /// Parses the query part of a request line,
    /// for example `target=sun.jp2&cnew=http&fsiz=1024,1024&len=2000`.
    pub fn from_query(query: &str) -> Result<Self> {
        let mut request = Request::default();

        for pair in query.split('&') {
            if pair.is_empty() { continue; }

            let (name, value) = match pair.find('=') {
                Some(position) => (&pair[.. position], &pair[position + 1 ..]),
                None => (pair, ""),
            };

            request.parse_parameter(name, value)?;
        }

        Ok(request)
    }

    fn parse_parameter(&mut self, name: &str, value: &str) -> UnitResult {
        match name {
            "target" => {
                self.mask.set(ParameterMask::TARGET);
                self.target = Some(percent_decode(value)?);
            }

            "cid" => {
                self.mask.set(ParameterMask::CID);
                self.channel_id = Some(percent_decode(value)?);
            }

            "cnew" => {
                self.mask.set(ParameterMask::CNEW);
            }

            "cclose" => {
                self.mask.set(ParameterMask::CCLOSE);
                self.close_channel = Some(percent_decode(value)?);
            }

            "metareq" => {
                self.mask.set(ParameterMask::METAREQ);
            }

            "fsiz" => {
                let value = percent_decode(value)?;
                let mut parts = value.split(',');

                self.resolution_size = parse_pair(&mut parts, "fsiz")?;

                if self.resolution_size.x() == 0 || self.resolution_size.y() == 0 {
                    return Err(Error::bad_request("fsiz must be positive"));
                }

                self.round_direction = match parts.next() {
                    Some("round-up") => RoundingMode::Up,
                    Some("round-down") => RoundingMode::Down,
                    _ => RoundingMode::Closest,
                };

                self.mask.set(ParameterMask::FSIZ);
            }

            "roff" => {
                let value = percent_decode(value)?;
                self.woi_position = parse_pair(&mut value.split(','), "roff")?;
                self.mask.set(ParameterMask::ROFF);
            }

            "rsiz" => {
                let value = percent_decode(value)?;
                self.woi_size = parse_pair(&mut value.split(','), "rsiz")?;
                self.mask.set(ParameterMask::RSIZ);
            }

            "len" => {
                self.length_response = parse_number(value, "len")?;
                self.mask.set(ParameterMask::LEN);
            }

            "stream" => {
                let value = percent_decode(value)?;
                self.parse_codestream_range(&value, ':')?;
                self.mask.set(ParameterMask::STREAM);
            }

            "context" => {
                let value = percent_decode(value)?;

                let range = value.strip_prefix("jpxl<")
                    .and_then(|rest| rest.strip_suffix('>'))
                    .ok_or_else(|| Error::bad_request(format!("context {:?}", value)))?;

                self.parse_codestream_range(range, '-')?;
                self.mask.set(ParameterMask::CONTEXT);
            }

            "model" => {
                let value = percent_decode(value)?;
                self.parse_model(&value)?;
                self.mask.set(ParameterMask::MODEL);
            }

            // unrecognised parameters are ignored, as the protocol allows
            _ => {}
        }

        Ok(())
    }

    /// Expands `a`, `a:b` or `a-b` into the list of requested codestreams.
    fn parse_codestream_range(&mut self, text: &str, separator: char) -> UnitResult {
        let (first, last) = match text.find(separator) {
            Some(position) => (&text[.. position], &text[position + 1 ..]),
            None => (text, text),
        };

        let first: usize = parse_number(first, "codestream range")?;
        let last: usize = parse_number(last, "codestream range")?;

        if last < first {
            return Err(Error::bad_request(format!("codestream range {}..{}", first, last)));
        }

        // an absurd range would allocate absurd cache models
        if last - first > 10_000 {
            return Err(Error::bad_request("too many codestreams requested"));
        }

        self.codestreams = (first ..= last).collect();
        Ok(())
    }

    /// Parses the `model=` items: `Hm`, `H<id>`, `P<id>` and `M<id>`,
    /// each with an optional `:n` byte count (complete when omitted),
    /// optionally scoped to a codestream range by a `[a-b]` prefix.
    fn parse_model(&mut self, text: &str) -> UnitResult {
        self.cache_model.clear();

        let mut scope_first = 0_usize;
        let mut scope_last = 0_usize;

        for item in text.split(',') {
            let mut item = item.trim();
            if item.is_empty() { continue; }

            if let Some(rest) = item.strip_prefix('[') {
                let end = rest.find(']')
                    .ok_or_else(|| Error::bad_request("unterminated codestream scope"))?;

                let range = &rest[.. end];

                let (first, last) = match range.find('-') {
                    Some(position) => (&range[.. position], &range[position + 1 ..]),
                    None => (range, range),
                };

                scope_first = parse_number(first, "model scope")?;
                scope_last = parse_number(last, "model scope")?;

                if scope_last < scope_first {
                    return Err(Error::bad_request("inverted codestream scope"));
                }

                item = &rest[end + 1 ..];
                if item.is_empty() { continue; }
            }

            if item.starts_with('-') {
                return Err(Error::bad_request("subtractive bin descriptors are not supported"));
            }

            self.parse_model_item(item, scope_first, scope_last)?;
        }

        Ok(())
    }

    fn parse_model_item(&mut self, item: &str, scope_first: usize, scope_last: usize) -> UnitResult {
        enum Kind { MainHeader, TileHeader, Precinct, MetaData }

        let (kind, rest) = match item.as_bytes()[0] {
            b'H' if item[1..].starts_with('m') => (Kind::MainHeader, &item[2..]),
            b'H' => (Kind::TileHeader, &item[1..]),
            b'P' => (Kind::Precinct, &item[1..]),
            b'M' => (Kind::MetaData, &item[1..]),
            _ => return Err(Error::bad_request(format!("bin descriptor {:?}", item))),
        };

        let (id_text, amount_text) = match rest.find(':') {
            Some(position) => (&rest[.. position], Some(&rest[position + 1 ..])),
            None => (rest, None),
        };

        let id: u64 = match kind {
            Kind::MainHeader => 0,
            _ => parse_number(id_text, "bin descriptor id")?,
        };

        // an omitted amount means the bin is complete
        let (delta, complete) = match amount_text {
            None => (0, true),

            Some(text) if text.starts_with('L') =>
                return Err(Error::bad_request("layer counts cannot be used for model updates")),

            Some(text) => (parse_number::<u32>(text, "bin descriptor amount")?, false),
        };

        match kind {
            Kind::MetaData => {
                self.cache_model.add_to_metadata(id, delta, complete);
            }

            kind => {
                for codestream in scope_first ..= scope_last {
                    let cache = self.cache_model.codestream(codestream);

                    match kind {
                        Kind::MainHeader => cache.add_to_main_header(delta, complete),
                        Kind::TileHeader => cache.add_to_tile_header(delta, complete),
                        Kind::Precinct => cache.add_to_precinct(id, delta, complete),
                        Kind::MetaData => unreachable!("handled above"),
                    };
                }
            }
        }

        Ok(())
    }

    /// The window of interest this request asks for, with the frame size
    /// rounded to a resolution level and the window scaled accordingly.
    pub fn woi(&self, parameters: &CodingParameters) -> Woi {
        let frame_size =
            if self.mask.fsiz() { self.resolution_size }
            else { parameters.size };

        let (resolution, level_size) = parameters.round_resolution(frame_size, self.round_direction);

        let mut position = self.woi_position;

        let mut size =
            if self.mask.rsiz() { self.woi_size }
            else { level_size };

        // the window was given in frame-size pixels;
        // scale it onto the grid of the chosen level
        if level_size != frame_size {
            position = Vec2(
                ceil_div(position.x() * level_size.x(), frame_size.x()),
                ceil_div(position.y() * level_size.y(), frame_size.y()),
            );

            size = Vec2(
                ceil_div(size.x() * level_size.x(), frame_size.x()),
                ceil_div(size.y() * level_size.y(), frame_size.y()),
            );
        }

        Woi { position, size, resolution }
    }
}


fn parse_number<N: std::str::FromStr>(text: &str, name: &str) -> Result<N> {
    text.trim().parse()
        .map_err(|_| Error::bad_request(format!("{} value {:?}", name, text)))
}

fn parse_pair(parts: &mut std::str::Split<'_, char>, name: &str) -> Result<Size> {
    let x = parts.next()
        .ok_or_else(|| Error::bad_request(format!("{} misses a value", name)))?;

    let y = parts.next()
        .ok_or_else(|| Error::bad_request(format!("{} misses its second value", name)))?;

    Ok(Vec2(parse_number(x, name)?, parse_number(y, name)?))
}

/// Decodes `%XX` escapes.
fn percent_decode(text: &str) -> Result<String> {
    if !text.contains('%') {
        return Ok(text.to_owned());
    }

    let bytes = text.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut position = 0;

    while position < bytes.len() {
        if bytes[position] == b'%' {
            let escape = bytes.get(position + 1 .. position + 3)
                .and_then(|pair| std::str::from_utf8(pair).ok())
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| Error::bad_request(format!("percent escape in {:?}", text)))?;

            decoded.push(escape);
            position += 3;
        }
        else {
            decoded.push(bytes[position]);
            position += 1;
        }
    }

    String::from_utf8(decoded)
        .map_err(|_| Error::bad_request(format!("escaped value in {:?} is not utf-8", text)))
}
