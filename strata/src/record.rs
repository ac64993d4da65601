//! The record codec: fixed-width fields write their native little-endian
//! bytes, strings are length-prefixed, and a record is just the
//! concatenation of its field encodings.

use bytes::{Buf, BufMut, BytesMut};

/// Builds a record field by field.
#[derive(Debug, Default)]
pub struct RecordWriter {
    buf: BytesMut,
}

impl RecordWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_i32(&mut self, value: i32) -> &mut Self {
        self.buf.put_i32_le(value);
        self
    }

    pub fn put_f64(&mut self, value: f64) -> &mut Self {
        self.buf.put_f64_le(value);
        self
    }

    pub fn put_bool(&mut self, value: bool) -> &mut Self {
        self.buf.put_u8(value as u8);
        self
    }

    pub fn put_str(&mut self, value: &str) -> &mut Self {
        self.buf.put_i32_le(value.len() as i32);
        self.buf.put_slice(value.as_bytes());
        self
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf.to_vec()
    }
}

/// Walks a record's fields in order. Records come off pages this engine
/// wrote, so short buffers are a corruption bug, not a recoverable state.
pub struct RecordReader<'a> {
    buf: &'a [u8],
}

impl<'a> RecordReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        RecordReader { buf }
    }

    pub fn get_i32(&mut self) -> i32 {
        self.buf.get_i32_le()
    }

    pub fn get_f64(&mut self) -> f64 {
        self.buf.get_f64_le()
    }

    pub fn get_bool(&mut self) -> bool {
        self.buf.get_u8() != 0
    }

    pub fn get_str(&mut self) -> String {
        let len = self.buf.get_i32_le() as usize;
        let (head, tail) = self.buf.split_at(len);
        let value = String::from_utf8_lossy(head).into_owned();
        self.buf = tail;
        value
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_round_trip_in_order() {
        let mut writer = RecordWriter::new();
        writer
            .put_i32(-7)
            .put_str("strata")
            .put_bool(true)
            .put_f64(2.5);
        let bytes = writer.finish();

        let mut reader = RecordReader::new(&bytes);
        assert_eq!(reader.get_i32(), -7);
        assert_eq!(reader.get_str(), "strata");
        assert!(reader.get_bool());
        assert_eq!(reader.get_f64(), 2.5);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn integers_are_little_endian() {
        let mut writer = RecordWriter::new();
        writer.put_i32(1);
        assert_eq!(writer.finish(), b"\x01\x00\x00\x00");
    }

    #[test]
    fn strings_are_length_prefixed() {
        let mut writer = RecordWriter::new();
        writer.put_str("ab");
        assert_eq!(writer.finish(), b"\x02\x00\x00\x00ab");
    }
}
