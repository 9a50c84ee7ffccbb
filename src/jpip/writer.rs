

//! Frames data-bin messages into a response buffer.
//!
//! Every record is written all-or-nothing: if any part of a message
//! would overrun the buffer, the cursor is rewound to the start of the
//! record and the writer remembers that it ran out of room. Running out
//! of room is expected and not an error.

use crate::error::{Error, Result};
use crate::io::FileReader;
use crate::jpip::{vbas, DataBinClass, EorCode};
use crate::meta::PlaceHolder;
use crate::segment::FileSegment;


/// The message-header state that persists across the chunks of one
/// response: headers abbreviate the class and codestream fields when
/// they repeat the previous message.
#[derive(Debug, Default, Clone, Copy)]
pub struct MessageContext {
    class: Option<DataBinClass>,
    codestream: u64,
    previous: Option<(DataBinClass, u64)>,
}

impl MessageContext {

    /// Forgets the previous message, so the next header is self-contained.
    pub fn clear(&mut self) {
        *self = MessageContext::default();
    }
}


/// Writes data-bin messages into a borrowed buffer.
/// One writer exists per generated chunk; the context outlives it.
#[derive(Debug)]
pub struct DataBinWriter<'b> {
    buffer: &'b mut [u8],
    written: usize,
    truncated: bool,
    context: &'b mut MessageContext,
}

impl<'b> DataBinWriter<'b> {

    pub fn new(buffer: &'b mut [u8], context: &'b mut MessageContext) -> Self {
        DataBinWriter { buffer, written: 0, truncated: false, context }
    }

    /// The number of bytes written so far.
    pub fn written(&self) -> usize { self.written }

    /// The number of bytes still available.
    pub fn free(&self) -> usize { self.buffer.len() - self.written }

    /// Whether a record did not fit. The buffer holds
    /// only complete records regardless.
    pub fn is_truncated(&self) -> bool { self.truncated }

    /// The codestream the next message belongs to.
    pub fn set_codestream(&mut self, codestream: u64) {
        self.context.codestream = codestream;
    }

    /// The data-bin class of the next message.
    pub fn set_class(&mut self, class: DataBinClass) {
        self.context.class = Some(class);
    }

    /// Writes one data-bin message: header plus `segment.length` bytes
    /// copied from the file. Returns false if the record did not fit,
    /// leaving the buffer contents unchanged.
    pub fn write_segment(
        &mut self, bin_id: u64, bin_offset: u64,
        file: &mut FileReader, segment: FileSegment, last: bool,
    ) -> Result<bool> {
        let record_start = self.written;

        self.push_message_header(bin_id, bin_offset, segment.length, last)?;

        if !self.truncated && segment.length > 0 {
            self.push_file_bytes(file, segment)?;
        }

        Ok(self.commit_record(record_start))
    }

    /// Writes one meta-data message containing a `phld` box that stands
    /// in for the original box at the client. Never splits the box.
    pub fn write_placeholder(
        &mut self, bin_id: u64, bin_offset: u64,
        file: &mut FileReader, place_holder: &PlaceHolder, last: bool,
    ) -> Result<bool> {
        let record_start = self.written;

        self.push_message_header(bin_id, bin_offset, place_holder.message_length(), last)?;

        let box_length = place_holder.message_length();
        let codestream_box = place_holder.is_codestream;

        /* LBox    */ self.push_u32(box_length as u32);
        /* TBox    */ self.push_u32(0x7068_6C64); // "phld"
        /* Flags   */ self.push_u32(if codestream_box { 4 } else { 1 });
        /* OrigID  */ self.push_u64(if codestream_box { 0 } else { place_holder.id });

        /* OrigBH  */
        if place_holder.header.length > 0 && !self.truncated {
            self.push_file_bytes(file, place_holder.header)?;
        }

        /* EquivID */ self.push_u64(0);
        /* EquivBH */ self.push_u64(0);
        /* CSID    */ self.push_u64(if codestream_box { place_holder.id } else { 0 });

        Ok(self.commit_record(record_start))
    }

    /// Writes the end-of-response byte triplet.
    /// Returns false if even those three bytes did not fit.
    pub fn write_eor(&mut self, code: EorCode) -> bool {
        if self.free() < 3 {
            self.truncated = true;
            return false;
        }

        self.buffer[self.written] = 0;
        self.buffer[self.written + 1] = code.code();
        self.buffer[self.written + 2] = 0;
        self.written += 3;
        true
    }

    /// Rolls the cursor back when the record overran the buffer, and
    /// records the message context when it did not.
    fn commit_record(&mut self, record_start: usize) -> bool {
        if self.truncated {
            self.written = record_start;
            return false;
        }

        if let Some(class) = self.context.class {
            self.context.previous = Some((class, self.context.codestream));
        }

        true
    }

    /// The JPIP message header: the preamble byte, then the VBAS fields
    /// that the preamble announces.
    fn push_message_header(&mut self, bin_id: u64, bin_offset: u64, bin_length: u64, last: bool) -> Result<()> {
        let class = self.context.class
            .ok_or_else(|| Error::internal("message class was never set"))?;

        let codestream = self.context.codestream;

        // 1 repeats class and codestream, 2 announces a class,
        // 3 announces class and codestream
        let preamble: u8 = match self.context.previous {
            Some((previous_class, previous_codestream)) => {
                if previous_codestream != codestream { 3 }
                else if previous_class != class { 2 }
                else { 1 }
            }

            None => 3,
        };

        let mut first = preamble << 5;
        if last { first |= 1 << 4; }

        if bin_id < 16 {
            self.push_byte(first | (bin_id as u8 & 0x0F));
        }
        else {
            self.push_byte(first | 0x80);
            self.push_vbas(bin_id);
        }

        if preamble >= 2 {
            self.push_vbas(class.code());

            if preamble == 3 {
                self.push_vbas(codestream);
            }
        }

        self.push_vbas(bin_offset);
        self.push_vbas(bin_length);
        Ok(())
    }

    fn push_byte(&mut self, byte: u8) {
        if self.truncated { return; }

        if self.free() < 1 {
            self.truncated = true;
            return;
        }

        self.buffer[self.written] = byte;
        self.written += 1;
    }

    fn push_vbas(&mut self, value: u64) {
        if self.truncated { return; }

        match vbas::write(self.buffer, self.written, value) {
            Some(end) => self.written = end,
            None => self.truncated = true,
        }
    }

    fn push_u32(&mut self, value: u32) {
        if self.truncated { return; }

        if self.free() < 4 {
            self.truncated = true;
            return;
        }

        self.buffer[self.written .. self.written + 4].copy_from_slice(&value.to_be_bytes());
        self.written += 4;
    }

    fn push_u64(&mut self, value: u64) {
        if self.truncated { return; }

        if self.free() < 8 {
            self.truncated = true;
            return;
        }

        self.buffer[self.written .. self.written + 8].copy_from_slice(&value.to_be_bytes());
        self.written += 8;
    }

    /// Copies the segment bytes straight from the file into the buffer.
    /// A read failure is a real error and aborts the session.
    fn push_file_bytes(&mut self, file: &mut FileReader, segment: FileSegment) -> Result<()> {
        debug_assert!(!self.truncated);

        let length = crate::error::u64_to_usize(segment.length);

        if self.free() < length {
            self.truncated = true;
            return Ok(());
        }

        file.seek_to(segment.offset)?;
        file.read_exact(&mut self.buffer[self.written .. self.written + length])?;
        self.written += length;
        Ok(())
    }
}
