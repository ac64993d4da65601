//! The slotted page layout.
//!
//! Every page starts with a 4-byte directory size, followed by the rest of
//! the subsystem header, then the slot directory (one signed 32-bit offset
//! per slot, a negative sign marking a tombstone), while records are packed
//! backward from the page tail. All integers are little-endian.

use crate::SlotId;

/// Passing this slot id to `put_record` appends a new record.
pub const NEW_SLOT: SlotId = -1;

/// Width of one slot directory entry.
pub const SLOT_BYTES: usize = 4;

/// The default subsystem header: just the directory-size word.
pub const BASE_HEADER: usize = 4;

/// Outcome of `put_record`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutResult {
    Ok(SlotId),
    OutOfSpace,
    OutOfRange,
}

/// Outcome of `get_record` and `delete_record`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetResult<T> {
    Ok(T),
    Deleted,
    OutOfRange,
}

impl<T> GetResult<T> {
    pub fn ok(self) -> Option<T> {
        match self {
            GetResult::Ok(value) => Some(value),
            _ => None,
        }
    }
}

/// A slotted view over a page buffer. The buffer is borrowed, so the same
/// type serves cache guards, raw storage pages and scratch buffers; mutating
/// operations are only available over `&mut [u8]`.
pub struct SlottedPage<B> {
    buf: B,
    header: usize,
}

fn read_i32(buf: &[u8], at: usize) -> i32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[at..at + 4]);
    i32::from_le_bytes(raw)
}

fn write_i32(buf: &mut [u8], at: usize, value: i32) {
    buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

impl<B: AsRef<[u8]>> SlottedPage<B> {
    /// Wraps a buffer, reserving `header` bytes (at least the directory-size
    /// word) for the subsystem header.
    pub fn new(buf: B, header: usize) -> Self {
        debug_assert!(header >= BASE_HEADER);
        debug_assert!(header <= buf.as_ref().len());
        SlottedPage { buf, header }
    }

    fn data(&self) -> &[u8] {
        self.buf.as_ref()
    }

    fn page_len(&self) -> usize {
        self.data().len()
    }

    /// Number of slots in the directory.
    pub fn directory_size(&self) -> usize {
        read_i32(self.data(), 0).max(0) as usize
    }

    fn slot_raw(&self, slot: usize) -> i32 {
        read_i32(self.data(), self.header + slot * SLOT_BYTES)
    }

    /// Start offset of the record in `slot`, tombstone sign stripped.
    fn record_start(&self, slot: usize) -> usize {
        self.slot_raw(slot).unsigned_abs() as usize
    }

    /// One-past-the-end offset of the record in `slot`: the previous record's
    /// start, or the page tail for slot 0.
    fn record_end(&self, slot: usize) -> usize {
        if slot == 0 {
            self.page_len()
        } else {
            self.record_start(slot - 1)
        }
    }

    /// Offset of the lowest record byte; the page tail while empty.
    fn last_record_offset(&self) -> usize {
        let dir = self.directory_size();
        if dir == 0 {
            self.page_len()
        } else {
            self.record_start(dir - 1)
        }
    }

    /// Bytes still available: `last_record_offset - directory - header`.
    pub fn free_space(&self) -> usize {
        self.last_record_offset() - self.directory_size() * SLOT_BYTES - self.header
    }

    pub fn get_record(&self, slot: SlotId) -> GetResult<&[u8]> {
        let dir = self.directory_size();
        if slot < 0 || slot as usize >= dir {
            return GetResult::OutOfRange;
        }
        let slot = slot as usize;
        if self.slot_raw(slot) < 0 {
            return GetResult::Deleted;
        }
        GetResult::Ok(&self.data()[self.record_start(slot)..self.record_end(slot)])
    }

    /// Enumerates every slot with its status.
    pub fn all_records(&self) -> impl Iterator<Item = (SlotId, GetResult<&[u8]>)> + '_ {
        (0..self.directory_size() as SlotId).map(move |slot| (slot, self.get_record(slot)))
    }

    /// The subsystem header area after the directory-size word.
    pub fn get_header(&self) -> &[u8] {
        &self.data()[BASE_HEADER..self.header]
    }

    /// The `index`-th i32 header field after the directory-size word.
    pub fn header_field(&self, index: usize) -> i32 {
        let at = BASE_HEADER + index * 4;
        debug_assert!(at + 4 <= self.header);
        read_i32(self.data(), at)
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> SlottedPage<B> {
    fn data_mut(&mut self) -> &mut [u8] {
        self.buf.as_mut()
    }

    fn set_directory_size(&mut self, size: usize) {
        write_i32(self.data_mut(), 0, size as i32);
    }

    fn set_slot_raw(&mut self, slot: usize, value: i32) {
        let header = self.header;
        write_i32(self.data_mut(), header + slot * SLOT_BYTES, value);
    }

    /// Writes `bytes` into the header area after the directory-size word.
    pub fn put_header(&mut self, bytes: &[u8]) {
        debug_assert!(BASE_HEADER + bytes.len() <= self.header);
        self.data_mut()[BASE_HEADER..BASE_HEADER + bytes.len()].copy_from_slice(bytes);
    }

    pub fn set_header_field(&mut self, index: usize, value: i32) {
        let at = BASE_HEADER + index * 4;
        debug_assert!(at + 4 <= self.header);
        write_i32(self.data_mut(), at, value);
    }

    /// Appends (`slot == directory_size` or `NEW_SLOT`) or updates in place.
    /// An update shifts trailing records by the size delta; nothing happens
    /// when the resulting free space would become negative.
    pub fn put_record(&mut self, bytes: &[u8], slot: SlotId) -> PutResult {
        let dir = self.directory_size();
        if slot == NEW_SLOT || slot as usize == dir {
            return self.append(bytes);
        }
        if slot < 0 || slot as usize > dir {
            return PutResult::OutOfRange;
        }
        self.update(bytes, slot as usize)
    }

    fn append(&mut self, bytes: &[u8]) -> PutResult {
        if bytes.len() + SLOT_BYTES > self.free_space() {
            return PutResult::OutOfSpace;
        }
        let dir = self.directory_size();
        let start = self.last_record_offset() - bytes.len();
        self.data_mut()[start..start + bytes.len()].copy_from_slice(bytes);
        self.set_directory_size(dir + 1);
        self.set_slot_raw(dir, start as i32);
        PutResult::Ok(dir as SlotId)
    }

    fn update(&mut self, bytes: &[u8], slot: usize) -> PutResult {
        let dir = self.directory_size();
        let start = self.record_start(slot);
        let end = self.record_end(slot);
        let old_len = end - start;
        let delta = bytes.len() as isize - old_len as isize;
        if delta > self.free_space() as isize {
            return PutResult::OutOfSpace;
        }

        let last = self.last_record_offset();
        if delta != 0 {
            // Shift this record's tail boundary and everything below it.
            let new_last = (last as isize - delta) as usize;
            self.data_mut().copy_within(last..start, new_last);
            for trailing in slot..dir {
                let raw = self.slot_raw(trailing);
                let shifted = (raw.unsigned_abs() as isize - delta) as i32;
                self.set_slot_raw(trailing, if raw < 0 { -shifted } else { shifted });
            }
        }

        let new_start = (start as isize - delta) as usize;
        self.data_mut()[new_start..end].copy_from_slice(bytes);
        // An update through a tombstoned slot revives it.
        self.set_slot_raw(slot, new_start as i32);
        PutResult::Ok(slot as SlotId)
    }

    /// Flips the slot's sign; the record bytes survive until a later shift.
    pub fn delete_record(&mut self, slot: SlotId) -> GetResult<()> {
        let dir = self.directory_size();
        if slot < 0 || slot as usize >= dir {
            return GetResult::OutOfRange;
        }
        let raw = self.slot_raw(slot as usize);
        if raw < 0 {
            return GetResult::Deleted;
        }
        self.set_slot_raw(slot as usize, -raw);
        GetResult::Ok(())
    }

    /// Zeroes the buffer and resets the directory.
    pub fn clear(&mut self) {
        self.data_mut().fill(0);
    }

    /// Repacks live records against the page tail and shrinks every
    /// tombstoned record to zero length, reclaiming its bytes.
    pub fn compact(&mut self) {
        let dir = self.directory_size();
        let mut cursor = self.page_len();
        for slot in 0..dir {
            let raw = self.slot_raw(slot);
            if raw < 0 {
                self.set_slot_raw(slot, -(cursor as i32));
                continue;
            }
            let start = self.record_start(slot);
            let len = self.record_end(slot) - start;
            cursor -= len;
            if start != cursor {
                self.data_mut().copy_within(start..start + len, cursor);
            }
            self.set_slot_raw(slot, cursor as i32);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PAGE_SIZE;

    fn empty_page() -> Vec<u8> {
        vec![0u8; PAGE_SIZE]
    }

    #[test]
    fn round_trip_two_records_then_delete() {
        let mut buf = empty_page();
        let mut page = SlottedPage::new(&mut buf[..], BASE_HEADER);

        let first = b"\x01\x00\x00\x00\x01\x00\x00\x00";
        let second = b"\x02\x00\x00\x00\x92\x00\x00\x00";
        assert_eq!(page.put_record(first, NEW_SLOT), PutResult::Ok(0));
        assert_eq!(page.put_record(second, NEW_SLOT), PutResult::Ok(1));

        assert_eq!(page.get_record(0), GetResult::Ok(&first[..]));
        assert_eq!(page.get_record(1), GetResult::Ok(&second[..]));

        assert_eq!(page.delete_record(0), GetResult::Ok(()));
        assert_eq!(page.get_record(0), GetResult::Deleted);
        // The neighbour is untouched.
        assert_eq!(page.get_record(1), GetResult::Ok(&second[..]));
    }

    #[test]
    fn space_identity_holds_after_every_operation() {
        let mut buf = empty_page();
        let mut page = SlottedPage::new(&mut buf[..], BASE_HEADER);

        let check = |page: &SlottedPage<&mut [u8]>| {
            let records: usize = (0..page.directory_size())
                .map(|slot| page.record_end(slot) - page.record_start(slot))
                .sum();
            assert_eq!(
                records + page.directory_size() * SLOT_BYTES + BASE_HEADER + page.free_space(),
                PAGE_SIZE
            );
        };

        check(&page);
        page.put_record(&[1; 100], NEW_SLOT);
        check(&page);
        page.put_record(&[2; 33], NEW_SLOT);
        check(&page);
        page.put_record(&[3; 217], 0);
        check(&page);
        page.delete_record(1);
        check(&page);
        page.compact();
        check(&page);
    }

    #[test]
    fn boundary_insert_at_exact_free_space() {
        let mut buf = empty_page();
        let mut page = SlottedPage::new(&mut buf[..], BASE_HEADER);
        let fits = page.free_space() - SLOT_BYTES;
        assert_eq!(page.put_record(&vec![7; fits + 1], NEW_SLOT), PutResult::OutOfSpace);
        assert!(matches!(page.put_record(&vec![7; fits], NEW_SLOT), PutResult::Ok(0)));
        assert_eq!(page.free_space(), 0);
    }

    #[test]
    fn in_place_growth_shifts_trailing_records() {
        let mut buf = empty_page();
        let mut page = SlottedPage::new(&mut buf[..], BASE_HEADER);
        page.put_record(b"aaaa", NEW_SLOT);
        page.put_record(b"bbbb", NEW_SLOT);
        page.put_record(b"cccc", NEW_SLOT);

        assert_eq!(page.put_record(b"xxxxxxxx", 1), PutResult::Ok(1));
        assert_eq!(page.get_record(0), GetResult::Ok(&b"aaaa"[..]));
        assert_eq!(page.get_record(1), GetResult::Ok(&b"xxxxxxxx"[..]));
        assert_eq!(page.get_record(2), GetResult::Ok(&b"cccc"[..]));
    }

    #[test]
    fn in_place_shrink_shifts_trailing_records() {
        let mut buf = empty_page();
        let mut page = SlottedPage::new(&mut buf[..], BASE_HEADER);
        page.put_record(b"aaaaaaaa", NEW_SLOT);
        page.put_record(b"bbbbbbbb", NEW_SLOT);
        page.put_record(b"cccccccc", NEW_SLOT);

        assert_eq!(page.put_record(b"bb", 1), PutResult::Ok(1));
        assert_eq!(page.get_record(1), GetResult::Ok(&b"bb"[..]));
        assert_eq!(page.get_record(2), GetResult::Ok(&b"cccccccc"[..]));
    }

    #[test]
    fn offsets_stay_monotonically_non_increasing() {
        let mut buf = empty_page();
        let mut page = SlottedPage::new(&mut buf[..], BASE_HEADER);
        for len in [10usize, 0, 25, 3] {
            page.put_record(&vec![9; len], NEW_SLOT);
        }
        page.delete_record(2);
        let mut last = PAGE_SIZE;
        for slot in 0..page.directory_size() {
            let start = page.record_start(slot);
            assert!(start <= last);
            last = start;
        }
    }

    #[test]
    fn update_rejects_growth_beyond_free_space() {
        let mut buf = empty_page();
        let mut page = SlottedPage::new(&mut buf[..], BASE_HEADER);
        page.put_record(&[1; 8], NEW_SLOT);
        let fits = page.free_space() + 8;
        assert_eq!(page.put_record(&vec![2; fits + 1], 0), PutResult::OutOfSpace);
        // The refused update left the record intact.
        assert_eq!(page.get_record(0), GetResult::Ok(&[1; 8][..]));
        assert!(matches!(page.put_record(&vec![2; fits], 0), PutResult::Ok(0)));
    }

    #[test]
    fn update_through_tombstone_revives_the_slot() {
        let mut buf = empty_page();
        let mut page = SlottedPage::new(&mut buf[..], BASE_HEADER);
        page.put_record(b"old!", NEW_SLOT);
        page.delete_record(0);
        assert_eq!(page.get_record(0), GetResult::Deleted);
        assert_eq!(page.put_record(b"newer!", 0), PutResult::Ok(0));
        assert_eq!(page.get_record(0), GetResult::Ok(&b"newer!"[..]));
    }

    #[test]
    fn out_of_range_slots_are_reported() {
        let mut buf = empty_page();
        let mut page = SlottedPage::new(&mut buf[..], BASE_HEADER);
        page.put_record(b"a", NEW_SLOT);
        assert_eq!(page.get_record(5), GetResult::OutOfRange);
        assert_eq!(page.get_record(-3), GetResult::OutOfRange);
        assert_eq!(page.put_record(b"b", 5), PutResult::OutOfRange);
        assert_eq!(page.delete_record(1), GetResult::OutOfRange);
    }

    #[test]
    fn all_records_reports_statuses() {
        let mut buf = empty_page();
        let mut page = SlottedPage::new(&mut buf[..], BASE_HEADER);
        page.put_record(b"live", NEW_SLOT);
        page.put_record(b"gone", NEW_SLOT);
        page.delete_record(1);

        let statuses: Vec<_> = page.all_records().collect();
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0], (0, GetResult::Ok(&b"live"[..])));
        assert_eq!(statuses[1], (1, GetResult::Deleted));
    }

    #[test]
    fn clear_resets_the_directory() {
        let mut buf = empty_page();
        let mut page = SlottedPage::new(&mut buf[..], BASE_HEADER);
        page.put_record(b"something", NEW_SLOT);
        page.clear();
        assert_eq!(page.directory_size(), 0);
        assert_eq!(page.free_space(), PAGE_SIZE - BASE_HEADER);
    }

    #[test]
    fn compact_reclaims_tombstoned_bytes() {
        let mut buf = empty_page();
        let mut page = SlottedPage::new(&mut buf[..], BASE_HEADER);
        page.put_record(&[1; 1000], NEW_SLOT);
        page.put_record(&[2; 1000], NEW_SLOT);
        page.put_record(&[3; 1000], NEW_SLOT);
        page.delete_record(1);
        let before = page.free_space();
        page.compact();
        assert_eq!(page.free_space(), before + 1000);
        assert_eq!(page.get_record(0), GetResult::Ok(&[1; 1000][..]));
        assert_eq!(page.get_record(1), GetResult::Deleted);
        assert_eq!(page.get_record(2), GetResult::Ok(&[3; 1000][..]));
    }

    #[test]
    fn wider_headers_carry_subsystem_fields() {
        let mut buf = empty_page();
        let mut page = SlottedPage::new(&mut buf[..], 12);
        page.set_header_field(0, 1234);
        page.set_header_field(1, -1);
        page.put_record(b"rec", NEW_SLOT);
        assert_eq!(page.header_field(0), 1234);
        assert_eq!(page.header_field(1), -1);
        assert_eq!(page.get_record(0), GetResult::Ok(&b"rec"[..]));
        assert_eq!(page.free_space(), PAGE_SIZE - 12 - SLOT_BYTES - 3);
        assert_eq!(page.get_header(), [1234i32.to_le_bytes(), (-1i32).to_le_bytes()].concat());
    }
}
