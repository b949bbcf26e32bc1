//! Record decoding: the cell state machine.
//!
//! A table-leaf cell is a payload-length varint, a rowid varint (for rowid
//! tables), then the record: a header-length varint, one serial-type varint
//! per column, and the column content bytes back to back. Payload above the
//! page's inline threshold continues on an overflow chain and is stitched
//! back together before column decoding.
//!
//! Every entry point here returns `Option`: `None` means "these bytes do not
//! decode to a record", which during carving is the common case and must stay
//! cheap. Real errors never cross this boundary.

pub mod serial;
pub mod varint;

use crate::blob::BlobCache;
use crate::error::Error;
use crate::overflow::read_overflow;
use crate::page::{Occupancy, Page};
use crate::pager::PageSource;
use crate::schema::{Descriptor, DescriptorKind};
use bytes::Bytes;
use serial::{SerialType, StorageClass};
use std::fmt;
use tracing::trace;

/// One decoded column value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// SQL NULL
    Null,
    /// Integer (any stored width, sign-extended)
    Int(i64),
    /// IEEE 754 double
    Real(f64),
    /// UTF-8 text (lossily decoded; recovery favors output over strictness)
    Text(String),
    /// Binary payload
    Blob(Bytes),
}

impl Value {
    /// True for the NULL value
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Real(v) => write!(f, "{v}"),
            Value::Text(v) => write!(f, "{v}"),
            Value::Blob(bytes) => {
                write!(f, "x'")?;
                for byte in bytes.iter() {
                    write!(f, "{byte:02x}")?;
                }
                write!(f, "'")
            }
        }
    }
}

/// Provenance of a recovered row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowStatus {
    /// Reached through a live cell pointer
    Active,
    /// Carved out of unallocated or freed page space
    Carved,
}

/// One recovered row with its origin
#[derive(Debug, Clone)]
pub struct Row {
    /// Name of the table or index the row belongs to
    pub table: String,
    /// Active or carved
    pub status: RowStatus,
    /// Page the row was found on
    pub page: u32,
    /// Byte offset of the cell (or carved header) within the page
    pub offset: usize,
    /// Absolute offset in the database file
    pub file_offset: u64,
    /// Declared payload length, or the reconstructed one for carved rows
    pub payload_len: u64,
    /// Rowid, when the cell carries one (carved rows never do)
    pub rowid: Option<i64>,
    /// Column values, one per header entry
    pub values: Vec<Value>,
}

/// Decodes cells against a page source, optionally parking BLOBs in a cache.
pub struct RecordDecoder<'a> {
    source: &'a dyn PageSource,
    blobs: Option<(&'a BlobCache, &'a str)>,
}

impl<'a> RecordDecoder<'a> {
    /// A decoder reading pages (and overflow chains) from `source`
    pub fn new(source: &'a dyn PageSource) -> Self {
        Self {
            source,
            blobs: None,
        }
    }

    /// Park every decoded BLOB column in `cache`, keyed under `db_name`
    pub fn with_blob_cache(mut self, cache: &'a BlobCache, db_name: &'a str) -> Self {
        self.blobs = Some((cache, db_name));
        self
    }

    /// Decode a live table-leaf cell at `offset`.
    ///
    /// On success the consumed byte range `[offset, cell_end)` is marked in
    /// `occupancy`. `None` means the cell is corrupt; the caller moves on.
    pub fn decode_table_cell(
        &self,
        page: &Page,
        desc: &Descriptor,
        offset: usize,
        occupancy: &mut Occupancy,
    ) -> Option<Row> {
        let info = desc.table_info()?;
        let data = page.data();

        let (payload_len, n) = varint::read_varint(data, offset).ok()?;
        let mut pos = offset + n;

        let rowid = if info.has_rowid {
            let (raw, n) = varint::read_varint(data, pos).ok()?;
            pos += n;
            Some(raw as i64)
        } else {
            None
        };

        let file_offset = self.source.file_offset(page.number(), offset);
        let (payload, cell_end) = self.assemble_payload(page, pos, payload_len)?;
        let (values, _) = self.decode_record_body(&payload, info.ipk_alias, rowid, file_offset)?;

        occupancy.mark(offset..cell_end);
        Some(Row {
            table: desc.name.clone(),
            status: RowStatus::Active,
            page: page.number(),
            offset,
            file_offset,
            payload_len,
            rowid,
            values,
        })
    }

    /// Decode a live index-leaf cell at `offset`.
    ///
    /// Index cells carry no rowid varint; for indexes on rowid tables the
    /// referenced rowid is the record's trailing column and is lifted out of
    /// the value list.
    pub fn decode_index_cell(
        &self,
        page: &Page,
        desc: &Descriptor,
        offset: usize,
        occupancy: &mut Occupancy,
    ) -> Option<Row> {
        let data = page.data();
        let (payload_len, n) = varint::read_varint(data, offset).ok()?;
        let pos = offset + n;

        let file_offset = self.source.file_offset(page.number(), offset);
        let (payload, cell_end) = self.assemble_payload(page, pos, payload_len)?;
        let (mut values, _) = self.decode_record_body(&payload, None, None, file_offset)?;

        let rowid = if matches!(desc.kind, DescriptorKind::Index(_)) {
            match values.last() {
                Some(Value::Int(r)) => {
                    let r = *r;
                    values.pop();
                    Some(r)
                }
                _ => None,
            }
        } else {
            None
        };

        occupancy.mark(offset..cell_end);
        Some(Row {
            table: desc.name.clone(),
            status: RowStatus::Active,
            page: page.number(),
            offset,
            file_offset,
            payload_len,
            rowid,
            values,
        })
    }

    /// Attempt a carved decode of a candidate record header at `offset`.
    ///
    /// Carved candidates start directly at the header-length varint: a
    /// deleted cell's payload-length and rowid varints are usually destroyed
    /// by the freeblock header that overwrote them. The payload length is
    /// reconstructed from the header itself, and decoding never reads at or
    /// past `limit` (the start of structurally live bytes).
    ///
    /// Returns the row and the end offset of the consumed range.
    pub fn decode_carved(
        &self,
        page: &Page,
        desc: &Descriptor,
        offset: usize,
        limit: usize,
    ) -> Option<(Row, usize)> {
        let window = page.data().get(offset..limit)?;
        let file_offset = self.source.file_offset(page.number(), offset);
        let (values, end) = self.decode_record_body(window, None, None, file_offset)?;

        let row = Row {
            table: desc.name.clone(),
            status: RowStatus::Carved,
            page: page.number(),
            offset,
            file_offset,
            payload_len: end as u64,
            rowid: None,
            values,
        };
        Some((row, offset + end))
    }

    /// Gather a cell's payload: the in-page portion, plus the overflow chain
    /// when the declared length exceeds the inline threshold.
    ///
    /// Returns the payload bytes and the end of the cell within the page
    /// (past the 4-byte overflow pointer when one is present).
    fn assemble_payload(
        &self,
        page: &Page,
        pos: usize,
        payload_len: u64,
    ) -> Option<(Vec<u8>, usize)> {
        let data = page.data();
        let total = usize::try_from(payload_len).ok()?;
        let local = serial::local_payload_len(payload_len, self.source.usable_size());

        if local >= total {
            let end = pos.checked_add(total)?;
            if end > data.len() {
                return None;
            }
            return Some((data[pos..end].to_vec(), end));
        }

        let local_end = pos.checked_add(local)?;
        if local_end + 4 > data.len() {
            return None;
        }
        let next = u32::from_be_bytes([
            data[local_end],
            data[local_end + 1],
            data[local_end + 2],
            data[local_end + 3],
        ]);

        let mut payload = data[pos..local_end].to_vec();
        match read_overflow(self.source, next, Some(total - local)) {
            Ok(tail) => payload.extend_from_slice(&tail),
            Err(err) => {
                trace!(
                    "abandoning record on page {}: overflow chain failed: {err}",
                    page.number()
                );
                return None;
            }
        }
        Some((payload, local_end + 4))
    }

    /// Decode a record body (header + columns) out of `payload`, mapping
    /// the error taxonomy to the caller-facing "no record" sentinel.
    fn decode_record_body(
        &self,
        payload: &[u8],
        ipk_alias: Option<usize>,
        rowid: Option<i64>,
        file_offset: u64,
    ) -> Option<(Vec<Value>, usize)> {
        match self.try_decode_record_body(payload, ipk_alias, rowid, file_offset) {
            Ok(decoded) => Some(decoded),
            Err(err) => {
                trace!("record candidate rejected: {err}");
                None
            }
        }
    }

    /// Returns the values and the end cursor (header length plus the summed
    /// column widths). `ipk_alias` substitutes the rowid for the zero-length
    /// INTEGER PRIMARY KEY placeholder column.
    fn try_decode_record_body(
        &self,
        payload: &[u8],
        ipk_alias: Option<usize>,
        rowid: Option<i64>,
        file_offset: u64,
    ) -> Result<(Vec<Value>, usize), Error> {
        let (header_len, n) = varint::read_varint(payload, 0)?;
        if header_len == 0 {
            return Err(Error::invalid_record_header("zero header length"));
        }
        let header_len = usize::try_from(header_len)
            .map_err(|_| Error::invalid_record_header("header length out of range"))?;
        if header_len < n || header_len > payload.len() {
            return Err(Error::invalid_record_header(format!(
                "header length {header_len} exceeds payload of {} bytes",
                payload.len()
            )));
        }

        let codes = varint::read_varint_sequence(&payload[n..header_len])
            .ok_or_else(|| Error::invalid_record_header("partial serial-type varint"))?;
        let types = SerialType::from_codes(&codes)?;

        let mut cursor = header_len;
        let mut values = Vec::with_capacity(types.len());
        for (index, st) in types.iter().enumerate() {
            let end = cursor
                .checked_add(st.len)
                .ok_or_else(|| Error::truncated(cursor))?;
            if end > payload.len() {
                return Err(Error::truncated(cursor));
            }
            let content = &payload[cursor..end];
            let value = match st.class {
                StorageClass::Null => {
                    if ipk_alias == Some(index) {
                        // Zero-length INTEGER PRIMARY KEY slot: the value
                        // lives in the rowid
                        rowid.map(Value::Int).unwrap_or(Value::Null)
                    } else {
                        Value::Null
                    }
                }
                StorageClass::Int => Value::Int(
                    serial::decode_int(content, st.len).ok_or_else(|| Error::truncated(cursor))?,
                ),
                StorageClass::Real => Value::Real(
                    serial::decode_real(content).ok_or_else(|| Error::truncated(cursor))?,
                ),
                StorageClass::ConstInt => Value::Int(i64::from(st.code == 9)),
                StorageClass::Text => Value::Text(String::from_utf8_lossy(content).into_owned()),
                StorageClass::Blob => {
                    let bytes = Bytes::copy_from_slice(content);
                    if let Some((cache, db)) = self.blobs {
                        cache.store(db, file_offset + cursor as u64, bytes.clone());
                    }
                    Value::Blob(bytes)
                }
            };
            values.push(value);
            cursor = end;
        }

        Ok((values, cursor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pager::MemSource;
    use crate::schema::{ColumnType, Descriptor};
    use pretty_assertions::assert_eq;

    const PS: usize = 512;

    fn users_desc() -> Descriptor {
        Descriptor::table(
            "users",
            2,
            vec![ColumnType::Int, ColumnType::Blob],
            true,
        )
    }

    /// Build a one-cell table-leaf page at page number 2 (page 1 is a dummy)
    fn leaf_with_cell(cell: &[u8], cell_offset: usize) -> Vec<Vec<u8>> {
        let mut page = vec![0u8; PS];
        page[0] = 0x0D;
        page[3..5].copy_from_slice(&1u16.to_be_bytes());
        page[5..7].copy_from_slice(&(cell_offset as u16).to_be_bytes());
        page[8..10].copy_from_slice(&(cell_offset as u16).to_be_bytes());
        page[cell_offset..cell_offset + cell.len()].copy_from_slice(cell);
        vec![vec![0u8; PS], page]
    }

    #[test]
    fn test_decode_single_cell_int_and_blob() {
        // payload: header [3, code 1, code 16] then 0x05 0xAA 0xBB
        let cell = [
            0x06, // payload length 6
            0x2A, // rowid 42
            0x03, 0x01, 0x10, // header: len 3, INT8, BLOB(2)
            0x05, 0xAA, 0xBB, // column content
        ];
        let source = MemSource::new(leaf_with_cell(&cell, 200), PS);
        let page = source.read_page(2).unwrap();
        let mut occ = Occupancy::new(page.len());

        let decoder = RecordDecoder::new(&source);
        let row = decoder
            .decode_table_cell(&page, &users_desc(), 200, &mut occ)
            .unwrap();

        assert_eq!(row.rowid, Some(42));
        assert_eq!(row.payload_len, 6);
        assert_eq!(row.status, RowStatus::Active);
        assert_eq!(row.values.len(), 2);
        assert_eq!(row.values[0], Value::Int(5));
        assert_eq!(row.values[1], Value::Blob(Bytes::from_static(&[0xAA, 0xBB])));

        // Exactly the cell's bytes are marked
        assert_eq!(row.file_offset, PS as u64 + 200);
        assert!(occ.range_is_clear(0..200));
        assert!((200..208).all(|i| occ.is_marked(i)));
        assert!(occ.next_marked(208).is_none());
    }

    #[test]
    fn test_rowid_aliasing_substitutes_pk_column() {
        let cell = [
            0x03, // payload length 3
            0x07, // rowid 7
            0x02, 0x00, // header: len 2, NULL placeholder
            0x00, // stray byte past the record
        ];
        let desc = Descriptor::table("t", 2, vec![ColumnType::Int], true).with_ipk_alias(0);
        let source = MemSource::new(leaf_with_cell(&cell, 100), PS);
        let page = source.read_page(2).unwrap();
        let mut occ = Occupancy::new(page.len());

        let row = RecordDecoder::new(&source)
            .decode_table_cell(&page, &desc, 100, &mut occ)
            .unwrap();
        assert_eq!(row.values, vec![Value::Int(7)]);
    }

    #[test]
    fn test_constant_serial_types() {
        let cell = [
            0x03, // payload length
            0x01, // rowid
            0x03, 0x08, 0x09, // header: len 3, const 0, const 1
        ];
        let desc = Descriptor::table("t", 2, vec![ColumnType::Int, ColumnType::Int], true);
        let source = MemSource::new(leaf_with_cell(&cell, 100), PS);
        let page = source.read_page(2).unwrap();
        let mut occ = Occupancy::new(page.len());

        let row = RecordDecoder::new(&source)
            .decode_table_cell(&page, &desc, 100, &mut occ)
            .unwrap();
        assert_eq!(row.values, vec![Value::Int(0), Value::Int(1)]);
    }

    #[test]
    fn test_underflow_aborts_without_panic() {
        // Declares a 100-byte payload near the end of the page
        let cell = [0x64, 0x01, 0x02, 0x01];
        let source = MemSource::new(leaf_with_cell(&cell, PS - 4), PS);
        let page = source.read_page(2).unwrap();
        let mut occ = Occupancy::new(page.len());

        let row = RecordDecoder::new(&source).decode_table_cell(&page, &users_desc(), PS - 4, &mut occ);
        assert!(row.is_none());
        assert_eq!(occ.marked_bytes(), 0);
    }

    #[test]
    fn test_zero_header_length_aborts() {
        let cell = [0x01, 0x01, 0x00];
        let source = MemSource::new(leaf_with_cell(&cell, 100), PS);
        let page = source.read_page(2).unwrap();
        let mut occ = Occupancy::new(page.len());
        assert!(RecordDecoder::new(&source)
            .decode_table_cell(&page, &users_desc(), 100, &mut occ)
            .is_none());
    }

    #[test]
    fn test_overflowing_payload_is_stitched() {
        // One TEXT column of 597 bytes: payload = 3-byte header + 597 = 600.
        // U=512 -> X=477, M=39, local = 39 + (600-39) % 508 = 92.
        let mut cell = Vec::new();
        cell.extend_from_slice(&[0x84, 0x58]); // payload length 600
        cell.push(0x01); // rowid 1
        let mut payload = Vec::new();
        payload.push(0x03); // header length 3
        varint::write_varint(13 + 2 * 597, &mut payload); // TEXT(597), 2 bytes
        payload.extend(std::iter::repeat(b'x').take(597));
        assert_eq!(payload.len(), 600);
        cell.extend_from_slice(&payload[..92]); // local portion
        cell.extend_from_slice(&3u32.to_be_bytes()); // overflow chain head

        let mut pages = leaf_with_cell(&cell, 120);
        let mut ovf = vec![0u8; PS];
        ovf[..4].copy_from_slice(&0u32.to_be_bytes());
        ovf[4..4 + 508].copy_from_slice(&payload[92..]);
        pages.push(ovf);

        let source = MemSource::new(pages, PS);
        let page = source.read_page(2).unwrap();
        let mut occ = Occupancy::new(page.len());

        let desc = Descriptor::table("notes", 2, vec![ColumnType::Text], true);
        let row = RecordDecoder::new(&source)
            .decode_table_cell(&page, &desc, 120, &mut occ)
            .unwrap();

        match &row.values[0] {
            Value::Text(text) => {
                assert_eq!(text.len(), 597);
                assert!(text.bytes().all(|b| b == b'x'));
            }
            other => panic!("expected text, got {other:?}"),
        }
        // cell end = 120 + 2 + 1 + 92 + 4
        assert!((120..219).all(|i| occ.is_marked(i)));
        assert!(occ.next_marked(219).is_none());
    }

    #[test]
    fn test_bad_overflow_pointer_abandons_record() {
        let mut cell = Vec::new();
        cell.extend_from_slice(&[0x84, 0x58]); // payload length 600
        cell.push(0x01);
        cell.extend(std::iter::repeat(0u8).take(92));
        cell.extend_from_slice(&99u32.to_be_bytes()); // no such page

        let source = MemSource::new(leaf_with_cell(&cell, 120), PS);
        let page = source.read_page(2).unwrap();
        let mut occ = Occupancy::new(page.len());
        let desc = Descriptor::table("notes", 2, vec![ColumnType::Text], true);
        assert!(RecordDecoder::new(&source)
            .decode_table_cell(&page, &desc, 120, &mut occ)
            .is_none());
    }

    #[test]
    fn test_index_cell_lifts_trailing_rowid() {
        let cell = [
            0x08, // payload length 8
            0x03, 0x15, 0x01, // header: len 3, TEXT(4), INT8
            b'a', b'b', b'c', b'd', 0x09, // "abcd", rowid 9
        ];
        let desc = Descriptor::index("t_name", 2, "t", vec![ColumnType::Text]);
        let mut pages = leaf_with_cell(&cell[..], 100);
        pages[1][0] = 0x0A; // index leaf flag
        let source = MemSource::new(pages, PS);
        let page = source.read_page(2).unwrap();
        let mut occ = Occupancy::new(page.len());

        let row = RecordDecoder::new(&source)
            .decode_index_cell(&page, &desc, 100, &mut occ)
            .unwrap();
        assert_eq!(row.rowid, Some(9));
        assert_eq!(row.values, vec![Value::Text("abcd".into())]);
    }

    #[test]
    fn test_carved_decode_reconstructs_payload_len() {
        // Record body alone (no payload-length or rowid prefix)
        let body = [0x03, 0x01, 0x10, 0x05, 0xAA, 0xBB];
        let mut pages = leaf_with_cell(&[0u8; 1], 80);
        pages[1][300..306].copy_from_slice(&body);
        let source = MemSource::new(pages, PS);
        let page = source.read_page(2).unwrap();

        let (row, end) = RecordDecoder::new(&source)
            .decode_carved(&page, &users_desc(), 300, PS)
            .unwrap();
        assert_eq!(row.status, RowStatus::Carved);
        assert_eq!(row.rowid, None);
        assert_eq!(row.payload_len, 6);
        assert_eq!(end, 306);
        assert_eq!(row.values[0], Value::Int(5));
    }

    #[test]
    fn test_carved_decode_respects_limit() {
        let body = [0x03, 0x01, 0x10, 0x05, 0xAA, 0xBB];
        let mut pages = leaf_with_cell(&[0u8; 1], 80);
        pages[1][300..306].copy_from_slice(&body);
        let source = MemSource::new(pages, PS);
        let page = source.read_page(2).unwrap();

        // Limit cuts the record's last byte off
        assert!(RecordDecoder::new(&source)
            .decode_carved(&page, &users_desc(), 300, 305)
            .is_none());
    }

    #[test]
    fn test_blob_columns_land_in_cache() {
        let cell = [
            0x06, 0x01, 0x03, 0x01, 0x10, 0x05, 0xAA, 0xBB,
        ];
        let source = MemSource::new(leaf_with_cell(&cell, 200), PS);
        let page = source.read_page(2).unwrap();
        let mut occ = Occupancy::new(page.len());
        let cache = BlobCache::new();

        RecordDecoder::new(&source)
            .with_blob_cache(&cache, "image.db")
            .decode_table_cell(&page, &users_desc(), 200, &mut occ)
            .unwrap();

        assert_eq!(cache.len(), 1);
        let key = cache.keys().pop().unwrap();
        assert!(key.starts_with("image.db:"));
        assert_eq!(cache.get(&key).unwrap().bytes(), &[0xAA, 0xBB]);
    }
}
