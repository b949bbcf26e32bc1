//! # kerf-core
//!
//! A library for recovering structured records from damaged, partially
//! overwritten, or deleted regions of SQLite database files.
//!
//! This crate provides the core functionality for:
//! - Classifying raw pages of a database image by their btree flag byte
//! - Decoding live cells (varint headers, serial types, overflow chains)
//! - Carving deleted record fragments out of unallocated page space by
//!   matching candidate headers against known column-type signatures
//!
//! ## Architecture
//!
//! The library is organized into several modules:
//!
//! - [`pager`]: Database header parsing and page-addressable byte sources
//! - [`page`]: Page classification, btree page views, occupancy tracking
//! - [`record`]: Varint/serial-type codec and the active-record reader
//! - [`overflow`]: Overflow chain reassembly with cycle protection
//! - [`carver`]: Header pattern matching and the deleted-record carver
//! - [`schema`]: Table/index descriptors supplied by the caller
//! - [`blob`]: Concurrent cache of extracted BLOB payloads
//! - [`error`]: Error types and handling
//!
//! ## Example
//!
//! ```no_run
//! use kerf_core::{Carver, ColumnType, Descriptor, FileSource, Schema};
//!
//! // Open a database image and describe its schema
//! let source = FileSource::open("./damaged.db")?;
//! let schema = Schema::new(vec![Descriptor::table(
//!     "users",
//!     2,
//!     vec![ColumnType::Int, ColumnType::Text, ColumnType::Blob],
//!     true,
//! )])?;
//!
//! // Recover both live and deleted records
//! let carver = Carver::new(&source, &schema);
//! let report = carver.carve_database();
//! for row in &report.rows {
//!     println!("{} [{:?}] {:?}", row.table, row.status, row.values);
//! }
//! # Ok::<(), kerf_core::Error>(())
//! ```
//!
//! ## Robustness
//!
//! Every decoder in this crate treats its input as hostile. Failure to parse a
//! candidate is the expected steady state of carving and is reported as "no
//! record" rather than an error crossing a component boundary; the engine runs
//! to completion over arbitrarily corrupt images and partial results are
//! always acceptable.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unreachable_pub)]

pub mod blob;
pub mod carver;
pub mod error;
pub mod overflow;
pub mod page;
pub mod pager;
pub mod record;
pub mod schema;

// Re-export primary types for convenience
pub use blob::{BlobCache, BlobElement};
pub use carver::{CarveReport, Carver, CarverConfig, HeaderPattern};
pub use error::{Error, Result};
pub use overflow::read_overflow;
pub use page::{Occupancy, Page, PageKind};
pub use pager::{DbHeader, FileSource, MemSource, PageSource};
pub use record::{RecordDecoder, Row, RowStatus, Value};
pub use schema::{ColumnType, Descriptor, DescriptorKind, Schema};

/// Crate version for programmatic access
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Size of the database file header on page 1
pub const DB_HEADER_LEN: usize = 100;

/// Largest page size the file format permits
pub const MAX_PAGE_SIZE: usize = 65536;
