//! Database header parsing and page-addressable byte sources.
//!
//! The engine reads the whole database image once up front and serves pages
//! as cheap [`Bytes`] slices; no component performs I/O mid-decode. The
//! [`PageSource`] trait is the seam between the recovery algorithms and the
//! way bytes are obtained, so tests and embedders can substitute synthetic
//! images.

use crate::error::{Error, Result};
use crate::page::Page;
use crate::DB_HEADER_LEN;
use bytes::Bytes;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

/// The 16-byte magic at the start of every SQLite database file
pub const SQLITE_MAGIC: &[u8; 16] = b"SQLite format 3\0";

/// Parsed fields of the 100-byte database file header
#[derive(Debug, Clone)]
pub struct DbHeader {
    /// Page size in bytes (the stored value 1 means 65536)
    pub page_size: usize,
    /// Reserved bytes at the end of every page (byte 20)
    pub reserved_per_page: usize,
    /// Page count as recorded in the header (may disagree with file size)
    pub page_count: u32,
    /// First freelist trunk page (0 = none)
    pub freelist_head: u32,
    /// Number of freelist pages
    pub freelist_count: u32,
    /// Text encoding: 1 = UTF-8, 2 = UTF-16le, 3 = UTF-16be
    pub text_encoding: u32,
}

impl DbHeader {
    /// Parse the file header from the first bytes of a database image.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < DB_HEADER_LEN {
            return Err(Error::invalid_db_header(format!(
                "file too short for header: {} bytes",
                data.len()
            )));
        }
        if &data[..16] != SQLITE_MAGIC {
            return Err(Error::invalid_db_header("bad magic".to_string()));
        }

        let raw_page_size = u16::from_be_bytes([data[16], data[17]]);
        let page_size = match raw_page_size {
            1 => crate::MAX_PAGE_SIZE,
            n if n.is_power_of_two() && n >= 512 => n as usize,
            n => {
                return Err(Error::invalid_db_header(format!(
                    "page size {n} is not a power of two in 512..=32768"
                )))
            }
        };

        let read_u32 =
            |o: usize| u32::from_be_bytes([data[o], data[o + 1], data[o + 2], data[o + 3]]);

        Ok(Self {
            page_size,
            reserved_per_page: data[20] as usize,
            page_count: read_u32(28),
            freelist_head: read_u32(32),
            freelist_count: read_u32(36),
            text_encoding: read_u32(56),
        })
    }

    /// Usable bytes per page: page size minus the reserved region
    pub fn usable_size(&self) -> usize {
        self.page_size - self.reserved_per_page
    }
}

/// A page-addressable source of database bytes.
///
/// Implementations must be shareable across scan workers.
pub trait PageSource: Send + Sync {
    /// Page size in bytes
    fn page_size(&self) -> usize;

    /// Usable bytes per page (page size minus the reserved region)
    fn usable_size(&self) -> usize;

    /// Total number of pages
    fn page_count(&self) -> u32;

    /// Read a page by 1-based number. `None` when out of range.
    fn read_page(&self, number: u32) -> Option<Page>;

    /// Absolute file offset of a byte within a page
    fn file_offset(&self, number: u32, in_page: usize) -> u64 {
        u64::from(number - 1) * self.page_size() as u64 + in_page as u64
    }
}

/// Whole-file page source backed by one in-memory buffer.
pub struct FileSource {
    data: Bytes,
    header: DbHeader,
    page_count: u32,
}

impl FileSource {
    /// Read a database file into memory and parse its header.
    ///
    /// The header's page count is cross-checked against the file size; when
    /// they disagree (truncated or grown images are common in recovery work)
    /// the size-derived count wins, counting a trailing partial page.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read(path).map_err(|e| Error::file_read(path, e))?;
        if data.len() < 16 || &data[..16] != SQLITE_MAGIC {
            return Err(Error::not_sqlite(path));
        }
        let header = DbHeader::parse(&data)?;

        let from_size = data.len().div_ceil(header.page_size) as u32;
        let page_count = if header.page_count == from_size {
            header.page_count
        } else {
            warn!(
                "header claims {} pages, file size implies {}; trusting file size",
                header.page_count, from_size
            );
            from_size
        };

        debug!(
            "opened {}: page_size={} usable={} pages={}",
            path.display(),
            header.page_size,
            header.usable_size(),
            page_count
        );

        Ok(Self {
            data: Bytes::from(data),
            header,
            page_count,
        })
    }

    /// The parsed file header
    pub fn header(&self) -> &DbHeader {
        &self.header
    }

    /// Total size of the image in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True if the image carries no bytes
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl PageSource for FileSource {
    fn page_size(&self) -> usize {
        self.header.page_size
    }

    fn usable_size(&self) -> usize {
        self.header.usable_size()
    }

    fn page_count(&self) -> u32 {
        self.page_count
    }

    fn read_page(&self, number: u32) -> Option<Page> {
        if number == 0 || number > self.page_count {
            return None;
        }
        let start = (number as usize - 1) * self.header.page_size;
        let end = (start + self.header.page_size).min(self.data.len());
        if start >= self.data.len() {
            return None;
        }
        // A trailing partial page is served as-is; decoders bounds-check
        Some(Page::new(self.data.slice(start..end), number))
    }
}

/// In-memory page source for tests and synthetic images.
pub struct MemSource {
    pages: Vec<Bytes>,
    page_size: usize,
    reserved: usize,
}

impl MemSource {
    /// Build a source from explicit pages. All pages share one size.
    pub fn new(pages: Vec<Vec<u8>>, page_size: usize) -> Self {
        Self {
            pages: pages.into_iter().map(Bytes::from).collect(),
            page_size,
            reserved: 0,
        }
    }

    /// Set the reserved-bytes-per-page value
    pub fn with_reserved(mut self, reserved: usize) -> Self {
        self.reserved = reserved;
        self
    }
}

impl PageSource for MemSource {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn usable_size(&self) -> usize {
        self.page_size - self.reserved
    }

    fn page_count(&self) -> u32 {
        self.pages.len() as u32
    }

    fn read_page(&self, number: u32) -> Option<Page> {
        let index = (number as usize).checked_sub(1)?;
        let data = self.pages.get(index)?.clone();
        Some(Page::new(data, number))
    }
}
