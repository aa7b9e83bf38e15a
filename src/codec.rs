//! Wire codec for the Plugwise ASCII-hex frame format
//!
//! ## Frame Format
//!
//! ```text
//! 05 05 03 03 | FFFF | [SSSS] | [MMMMMMMMMMMMMMMM] | PAYLOAD | CCCC | 0D 0A
//!   header     func    seq          address                     crc  footer
//! ```
//!
//! Everything between header and footer is upper-case ASCII hex. The
//! checksum is CRC-16/XMODEM over the function code and everything after it
//! up to the checksum itself. Some firmware emits a stray `0x83` byte in
//! front of the header; it is stripped on decode.
//!
//! Field encoders live in [`FieldWriter`], decoders in [`FieldReader`]. The
//! reader is strict: a payload that is shorter or longer than the layout
//! being parsed is a protocol error, never partially trusted.

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use crc::{Crc, CRC_16_XMODEM};

use crate::error::{PlugwiseError, PlugwiseResult};

/// Frame start marker
pub const HEADER: &[u8] = b"\x05\x05\x03\x03";

/// Stray byte some firmware sends in front of the header
pub const HEADER_PREFIX: u8 = 0x83;

/// Frame end marker
pub const FOOTER: &[u8] = b"\r\n";

/// Shortest frame worth interpreting (a plain acknowledgement)
pub const MIN_FRAME_LEN: usize = 22;

/// Year offset of the on-device calendar
pub const PLUGWISE_EPOCH: i32 = 2000;

/// Log buffer addresses are `index * 32 + LOGADDR_OFFSET`
pub const LOGADDR_OFFSET: u32 = 278_528;

/// Number of slots in the circular log buffer
pub const LOG_BUFFER_SLOTS: u32 = 6016;

/// CRC-16/CCITT as used on the wire: poly 0x1021, init 0, no reflection
const CRC_PLUGWISE: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// Compute the frame checksum over a byte slice
pub fn checksum(data: &[u8]) -> u16 {
    CRC_PLUGWISE.checksum(data)
}

/// Decoded frame envelope
///
/// `body` holds the ASCII hex between the function code and the checksum:
/// the sequence counter (responses only), the optional address and the
/// payload fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub function: u16,
    pub body: Vec<u8>,
}

/// Build a complete frame from a function code and an already encoded body
pub fn encode_frame(function: u16, body: &str) -> Vec<u8> {
    let inner = format!("{:04X}{}", function, body);
    let crc = checksum(inner.as_bytes());

    let mut frame = Vec::with_capacity(HEADER.len() + inner.len() + 4 + FOOTER.len());
    frame.extend_from_slice(HEADER);
    frame.extend_from_slice(inner.as_bytes());
    frame.extend_from_slice(format!("{:04X}", crc).as_bytes());
    frame.extend_from_slice(FOOTER);
    frame
}

/// Validate header, footer and checksum and split off the function code
pub fn decode_frame(raw: &[u8]) -> PlugwiseResult<Frame> {
    let raw = match raw.first() {
        Some(&HEADER_PREFIX) => &raw[1..],
        _ => raw,
    };

    if raw.len() < MIN_FRAME_LEN {
        return Err(PlugwiseError::protocol(format!(
            "frame too short: {} bytes",
            raw.len()
        )));
    }
    if !raw.starts_with(HEADER) {
        return Err(PlugwiseError::protocol("broken header"));
    }
    if !raw.ends_with(FOOTER) {
        return Err(PlugwiseError::protocol("broken footer"));
    }

    let inner = &raw[HEADER.len()..raw.len() - FOOTER.len()];
    let (content, crc_field) = inner.split_at(inner.len() - 4);
    let received = parse_hex(crc_field)? as u16;
    let expected = checksum(content);
    if received != expected {
        return Err(PlugwiseError::crc_mismatch(expected, received));
    }

    let function = parse_hex(&content[..4])? as u16;
    Ok(Frame {
        function,
        body: content[4..].to_vec(),
    })
}

/// Parse upper- or lower-case ASCII hex into an unsigned value
pub fn parse_hex(field: &[u8]) -> PlugwiseResult<u64> {
    if field.is_empty() || field.len() > 16 {
        return Err(PlugwiseError::protocol(format!(
            "invalid hex field width {}",
            field.len()
        )));
    }
    let text = std::str::from_utf8(field)
        .map_err(|_| PlugwiseError::protocol("non-ASCII bytes in hex field"))?;
    if !text.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(PlugwiseError::protocol(format!("invalid hex field '{}'", text)));
    }
    Ok(u64::from_str_radix(text, 16)?)
}

/// Serializes typed fields into ASCII hex
#[derive(Debug, Default, Clone)]
pub struct FieldWriter {
    buf: String,
}

impl FieldWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unsigned integer as `width` hex digits
    pub fn uint(&mut self, value: u64, width: usize) -> &mut Self {
        let masked = if width >= 16 { value } else { value & ((1u64 << (width * 4)) - 1) };
        self.buf.push_str(&format!("{:0width$X}", masked, width = width));
        self
    }

    /// Two's complement signed integer in `width` hex digits
    pub fn sint(&mut self, value: i64, width: usize) -> &mut Self {
        self.uint(value as u64, width)
    }

    /// Fixed-width ASCII text, right-padded with '0' or truncated
    pub fn string(&mut self, value: &str, width: usize) -> &mut Self {
        let mut text: String = value.chars().take(width).collect();
        while text.len() < width {
            text.push('0');
        }
        self.buf.push_str(&text);
        self
    }

    /// IEEE-754 single precision, big-endian, 8 hex digits
    pub fn float(&mut self, value: f32) -> &mut Self {
        self.uint(value.to_bits() as u64, 8)
    }

    /// Year offset, month and minutes since the start of the month
    pub fn datetime(&mut self, dt: &NaiveDateTime) -> &mut Self {
        let minutes = (dt.day() - 1) * 24 * 60 + dt.hour() * 60 + dt.minute();
        self.uint((dt.year() - PLUGWISE_EPOCH) as u64, 2)
            .uint(dt.month() as u64, 2)
            .uint(minutes as u64, 4)
    }

    /// Hour, minute, second as hex
    pub fn time(&mut self, t: &NaiveTime) -> &mut Self {
        self.uint(t.hour() as u64, 2)
            .uint(t.minute() as u64, 2)
            .uint(t.second() as u64, 2)
    }

    /// Hour, minute, second as decimal digit pairs
    pub fn clock_time(&mut self, t: &NaiveTime) -> &mut Self {
        self.buf
            .push_str(&format!("{:02}{:02}{:02}", t.hour(), t.minute(), t.second()));
        self
    }

    /// Day, month, year-2000 as decimal digit pairs
    pub fn clock_date(&mut self, d: &NaiveDate) -> &mut Self {
        self.buf.push_str(&format!(
            "{:02}{:02}{:02}",
            d.day(),
            d.month(),
            d.year() - PLUGWISE_EPOCH
        ));
        self
    }

    /// Log buffer index encoded as a memory address
    pub fn log_addr(&mut self, index: u32) -> &mut Self {
        self.uint((index as u64) * 32 + LOGADDR_OFFSET as u64, 8)
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.buf
    }

    pub fn finish(self) -> String {
        self.buf
    }
}

/// Strict cursor over an ASCII hex body
#[derive(Debug)]
pub struct FieldReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, width: usize) -> PlugwiseResult<&'a [u8]> {
        if self.remaining() < width {
            return Err(PlugwiseError::protocol(format!(
                "payload truncated: wanted {} more bytes, {} left",
                width,
                self.remaining()
            )));
        }
        let field = &self.data[self.pos..self.pos + width];
        self.pos += width;
        Ok(field)
    }

    pub fn uint(&mut self, width: usize) -> PlugwiseResult<u64> {
        parse_hex(self.take(width)?)
    }

    pub fn sint(&mut self, width: usize) -> PlugwiseResult<i64> {
        let raw = self.uint(width)?;
        let bits = width * 4;
        if bits >= 64 {
            return Ok(raw as i64);
        }
        let sign = 1u64 << (bits - 1);
        Ok(if raw & sign != 0 {
            raw as i64 - (1i64 << bits)
        } else {
            raw as i64
        })
    }

    pub fn string(&mut self, width: usize) -> PlugwiseResult<String> {
        let field = self.take(width)?;
        std::str::from_utf8(field)
            .map(str::to_string)
            .map_err(|_| PlugwiseError::protocol("non-ASCII bytes in string field"))
    }

    pub fn float(&mut self) -> PlugwiseResult<f32> {
        Ok(f32::from_bits(self.uint(8)? as u32))
    }

    /// Decode a month-minutes timestamp; `None` for unwritten or invalid dates
    pub fn datetime(&mut self) -> PlugwiseResult<Option<NaiveDateTime>> {
        let year = self.uint(2)? as i32 + PLUGWISE_EPOCH;
        let month = self.uint(2)? as u32;
        let minutes = self.uint(4)? as u32;
        let days = minutes / (24 * 60);
        let hour = (minutes / 60) % 24;
        let minute = minutes % 60;
        Ok(NaiveDate::from_ymd_opt(year, month, days + 1)
            .and_then(|d| d.and_hms_opt(hour, minute, 0)))
    }

    pub fn time(&mut self) -> PlugwiseResult<NaiveTime> {
        let h = self.uint(2)? as u32;
        let m = self.uint(2)? as u32;
        let s = self.uint(2)? as u32;
        NaiveTime::from_hms_opt(h, m, s)
            .ok_or_else(|| PlugwiseError::protocol(format!("invalid time {:02}:{:02}:{:02}", h, m, s)))
    }

    fn decimal_pair(&mut self) -> PlugwiseResult<u32> {
        let field = self.take(2)?;
        if !field.iter().all(u8::is_ascii_digit) {
            return Err(PlugwiseError::protocol("invalid decimal digits"));
        }
        Ok(((field[0] - b'0') * 10 + (field[1] - b'0')) as u32)
    }

    pub fn clock_time(&mut self) -> PlugwiseResult<NaiveTime> {
        let h = self.decimal_pair()?;
        let m = self.decimal_pair()?;
        let s = self.decimal_pair()?;
        NaiveTime::from_hms_opt(h, m, s)
            .ok_or_else(|| PlugwiseError::protocol(format!("invalid clock time {:02}{:02}{:02}", h, m, s)))
    }

    pub fn clock_date(&mut self) -> PlugwiseResult<NaiveDate> {
        let d = self.decimal_pair()?;
        let m = self.decimal_pair()?;
        let y = self.decimal_pair()? as i32 + PLUGWISE_EPOCH;
        NaiveDate::from_ymd_opt(y, m, d)
            .ok_or_else(|| PlugwiseError::protocol(format!("invalid clock date {:02}{:02}{}", d, m, y)))
    }

    /// Decode a log buffer address back into a slot index
    pub fn log_addr(&mut self) -> PlugwiseResult<u32> {
        let raw = self.uint(8)? as u32;
        Ok(raw.wrapping_sub(LOGADDR_OFFSET) / 32)
    }

    /// Fail unless every byte of the body was consumed
    pub fn finish(&self) -> PlugwiseResult<()> {
        if self.remaining() != 0 {
            return Err(PlugwiseError::protocol(format!(
                "payload has {} unexpected trailing bytes",
                self.remaining()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_check_value() {
        assert_eq!(checksum(b"123456789"), 0x31C3);
    }

    #[test]
    fn test_frame_encoding() {
        let frame = encode_frame(0x000A, "");
        assert!(frame.starts_with(HEADER));
        assert!(frame.ends_with(FOOTER));
        let crc = checksum(b"000A");
        let expected = format!("000A{:04X}", crc);
        assert_eq!(&frame[4..frame.len() - 2], expected.as_bytes());
    }

    #[test]
    fn test_frame_decoding() {
        let frame = encode_frame(0x0000, "000100C1");
        let decoded = decode_frame(&frame).unwrap();
        assert_eq!(decoded.function, 0x0000);
        assert_eq!(decoded.body, b"000100C1".to_vec());
        assert_eq!(frame.len(), MIN_FRAME_LEN);
    }

    #[test]
    fn test_frame_with_stray_prefix() {
        let mut frame = vec![HEADER_PREFIX];
        frame.extend_from_slice(&encode_frame(0x0000, "000100C1"));
        assert!(decode_frame(&frame).is_ok());
    }

    #[test]
    fn test_frame_rejects_corruption() {
        let frame = encode_frame(0x0013, "0001000D6F0000ABCDEF0000000100020000000300000000");
        // flip every bit of every payload byte in turn
        for pos in 4..frame.len() - 6 {
            for bit in 0..8 {
                let mut broken = frame.clone();
                broken[pos] ^= 1 << bit;
                assert!(decode_frame(&broken).is_err(), "pos {} bit {}", pos, bit);
            }
        }

        let mut no_footer = frame.clone();
        no_footer.pop();
        assert!(matches!(decode_frame(&no_footer), Err(PlugwiseError::Protocol { .. })));

        let mut bad_header = frame;
        bad_header[0] = 0x06;
        assert!(decode_frame(&bad_header).is_err());
    }

    #[test]
    fn test_integer_fields() {
        let mut w = FieldWriter::new();
        w.uint(0, 2).uint(0xFF, 2).uint(0xFFFF, 4).sint(-1, 4).sint(-32768, 4).sint(32767, 4);
        w.sint(-2, 8).sint(i32::MIN as i64, 8);
        assert_eq!(w.as_str(), "00FFFFFFFFFF80007FFFFFFFFFFE80000000");

        let text = w.finish();
        let mut r = FieldReader::new(text.as_bytes());
        assert_eq!(r.uint(2).unwrap(), 0);
        assert_eq!(r.uint(2).unwrap(), 0xFF);
        assert_eq!(r.uint(4).unwrap(), 0xFFFF);
        assert_eq!(r.sint(4).unwrap(), -1);
        assert_eq!(r.sint(4).unwrap(), -32768);
        assert_eq!(r.sint(4).unwrap(), 32767);
        assert_eq!(r.sint(8).unwrap(), -2);
        assert_eq!(r.sint(8).unwrap(), i32::MIN as i64);
        r.finish().unwrap();
    }

    #[test]
    fn test_wide_fields() {
        let mut w = FieldWriter::new();
        w.uint(u64::MAX, 16).sint(-5, 16);
        let text = w.finish();
        let mut r = FieldReader::new(text.as_bytes());
        assert_eq!(r.uint(16).unwrap(), u64::MAX);
        assert_eq!(r.sint(16).unwrap(), -5);
    }

    #[test]
    fn test_string_and_float() {
        let mut w = FieldWriter::new();
        w.string("000070A3", 8).float(1.0).float(-0.25);
        assert_eq!(w.as_str(), "000070A33F800000BE800000");
        let text = w.finish();
        let mut r = FieldReader::new(text.as_bytes());
        assert_eq!(r.string(8).unwrap(), "000070A3");
        assert_eq!(r.float().unwrap(), 1.0);
        assert_eq!(r.float().unwrap(), -0.25);
    }

    #[test]
    fn test_datetime_fields() {
        let samples = [
            NaiveDate::from_ymd_opt(2000, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap(),
            NaiveDate::from_ymd_opt(2024, 2, 29).unwrap().and_hms_opt(23, 59, 0).unwrap(),
            NaiveDate::from_ymd_opt(2031, 12, 31).unwrap().and_hms_opt(12, 15, 0).unwrap(),
        ];
        for dt in samples {
            let mut w = FieldWriter::new();
            w.datetime(&dt);
            let text = w.finish();
            assert_eq!(text.len(), 8);
            let mut r = FieldReader::new(text.as_bytes());
            assert_eq!(r.datetime().unwrap(), Some(dt));
        }

        // unwritten log entries read back as all-F
        let mut r = FieldReader::new(b"FFFFFFFF");
        assert_eq!(r.datetime().unwrap(), None);
    }

    #[test]
    fn test_clock_fields() {
        let t = NaiveTime::from_hms_opt(23, 5, 9).unwrap();
        let d = NaiveDate::from_ymd_opt(2023, 7, 4).unwrap();
        let mut w = FieldWriter::new();
        w.time(&t).clock_time(&t).clock_date(&d);
        assert_eq!(w.as_str(), "170509230509040723");
        let text = w.finish();
        let mut r = FieldReader::new(text.as_bytes());
        assert_eq!(r.time().unwrap(), t);
        assert_eq!(r.clock_time().unwrap(), t);
        assert_eq!(r.clock_date().unwrap(), d);
    }

    #[test]
    fn test_log_address() {
        let mut w = FieldWriter::new();
        w.log_addr(0).log_addr(6015);
        assert_eq!(w.as_str(), "0004400000072FE0");
        let text = w.finish();
        let mut r = FieldReader::new(text.as_bytes());
        assert_eq!(r.log_addr().unwrap(), 0);
        assert_eq!(r.log_addr().unwrap(), 6015);
    }

    #[test]
    fn test_reader_is_strict() {
        let mut r = FieldReader::new(b"00C1");
        assert!(r.uint(8).is_err());

        let mut r = FieldReader::new(b"00C1FF");
        r.uint(4).unwrap();
        assert!(r.finish().is_err());

        let mut r = FieldReader::new(b"00G1");
        assert!(r.uint(4).is_err());
    }
}
