

//! The JPIP protocol engine: requests, the client cache model,
//! window composition, message framing and the data-bin server.

pub mod cache_model;
pub mod request;
pub mod server;
pub mod session;
pub mod woi;
pub mod writer;


/// The data-bin classes defined for the JPIP protocol.
/// This server produces precinct, tile-header, main-header and meta-data
/// bins; the remaining classes are understood by the framing writer only.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum DataBinClass {
    Precinct,
    ExtendedPrecinct,
    TileHeader,
    TileData,
    ExtendedTile,
    MainHeader,
    MetaData,
}

impl DataBinClass {

    /// The on-wire class code of a message header.
    pub fn code(self) -> u64 {
        match self {
            DataBinClass::Precinct => 0,
            DataBinClass::ExtendedPrecinct => 1,
            DataBinClass::TileHeader => 2,
            DataBinClass::TileData => 4,
            DataBinClass::ExtendedTile => 5,
            DataBinClass::MainHeader => 6,
            DataBinClass::MetaData => 8,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DataBinClass::Precinct => "precinct",
            DataBinClass::ExtendedPrecinct => "extended precinct",
            DataBinClass::TileHeader => "tile header",
            DataBinClass::TileData => "tile data",
            DataBinClass::ExtendedTile => "extended tile",
            DataBinClass::MainHeader => "main header",
            DataBinClass::MetaData => "meta data",
        }
    }
}


/// The reasons a response body can end with.
/// One of these codes terminates every jpp-stream.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum EorCode {

    /// All available image information has been transferred.
    ImageDone,

    /// All information relevant to the requested window has been transferred.
    WindowDone,

    /// The response is terminated in order to service a new request.
    WindowChange,

    /// The byte limit of a max-length request field has been reached.
    ByteLimitReached,

    /// The quality limit of a quality request field has been reached.
    QualityLimitReached,

    /// A limit on the session resources has been reached.
    /// The channel must not be used for further requests.
    SessionLimitReached,

    /// A limit on this response has been reached.
    /// Further requests on the same channel are fine.
    ResponseLimitReached,

    /// No specific reason.
    NonSpecified,
}

impl EorCode {
    pub fn code(self) -> u8 {
        match self {
            EorCode::ImageDone => 1,
            EorCode::WindowDone => 2,
            EorCode::WindowChange => 3,
            EorCode::ByteLimitReached => 4,
            EorCode::QualityLimitReached => 5,
            EorCode::SessionLimitReached => 6,
            EorCode::ResponseLimitReached => 7,
            EorCode::NonSpecified => 0xFF,
        }
    }
}


/// Variable-length Byte-Aligned Segments: the integer coding of JPIP
/// message headers. Big-endian base 128, the top bit of each byte
/// flagging continuation.
pub mod vbas {

    /// The number of bytes the value encodes to.
    pub fn encoded_len(value: u64) -> usize {
        let mut remaining = value >> 7;
        let mut len = 1;

        while remaining != 0 {
            remaining >>= 7;
            len += 1;
        }

        len
    }

    /// Encodes the value into the buffer at the given position.
    /// Returns the position after the encoding,
    /// or `None` if the buffer is too small.
    pub fn write(buffer: &mut [u8], at: usize, value: u64) -> Option<usize> {
        let mut groups = [0_u8; 10];
        let mut count = 0;
        let mut remaining = value;

        loop {
            groups[count] = (remaining & 0x7F) as u8;
            count += 1;
            remaining >>= 7;
            if remaining == 0 { break; }
        }

        if at + count > buffer.len() { return None; }

        let mut position = at;
        for group in (1 .. count).rev() {
            buffer[position] = groups[group] | 0x80;
            position += 1;
        }

        buffer[position] = groups[0];
        Some(position + 1)
    }

    /// Decodes one value from the buffer at the given position.
    /// Returns the value and the position after it.
    pub fn read(buffer: &[u8], at: usize) -> Option<(u64, usize)> {
        let mut value = 0_u64;
        let mut position = at;

        loop {
            let byte = *buffer.get(position)?;
            position += 1;

            value = (value << 7) | u64::from(byte & 0x7F);

            if byte & 0x80 == 0 { break; }
            if position - at >= 10 { return None; }
        }

        Some((value, position))
    }


}
