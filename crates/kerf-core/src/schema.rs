//! Schema descriptors supplied by the caller.
//!
//! The engine does not parse CREATE statements; it consumes already-derived
//! descriptors: the object's name, its root page, and for tables and indexes
//! the ordered column-type signature. A [`HeaderPattern`] is compiled from
//! every signature at construction so the carver never rebuilds it per
//! candidate.

use crate::carver::pattern::HeaderPattern;
use crate::error::{Error, Result};

/// Declared affinity of a column, reduced to the five storage signatures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    /// INTEGER affinity
    Int,
    /// REAL affinity
    Real,
    /// TEXT affinity
    Text,
    /// BLOB / no affinity
    Blob,
    /// NUMERIC affinity
    Numeric,
}

impl ColumnType {
    /// Map a declared type keyword to a column type.
    ///
    /// Case-insensitive; recognizes the common aliases. Unknown keywords map
    /// to `None` so callers can decide a default.
    pub fn from_keyword(keyword: &str) -> Option<Self> {
        match keyword.to_ascii_uppercase().as_str() {
            "INT" | "INTEGER" | "BIGINT" | "SMALLINT" | "TINYINT" => Some(Self::Int),
            "REAL" | "FLOAT" | "DOUBLE" => Some(Self::Real),
            "TEXT" | "CHAR" | "VARCHAR" | "CLOB" | "STRING" => Some(Self::Text),
            "BLOB" => Some(Self::Blob),
            "NUMERIC" | "DECIMAL" | "BOOLEAN" | "DATE" | "DATETIME" => Some(Self::Numeric),
            _ => None,
        }
    }
}

/// Table-specific descriptor fields
#[derive(Debug, Clone)]
pub struct TableInfo {
    /// Ordered column-type signature
    pub columns: Vec<ColumnType>,
    /// Whether rows carry an explicit rowid
    pub has_rowid: bool,
    /// Column index aliased to the rowid (INTEGER PRIMARY KEY), if any
    pub ipk_alias: Option<usize>,
}

/// Index-specific descriptor fields
#[derive(Debug, Clone)]
pub struct IndexInfo {
    /// Name of the indexed table
    pub table: String,
    /// Ordered signature of the indexed columns
    pub columns: Vec<ColumnType>,
}

/// What kind of database object a descriptor names
#[derive(Debug, Clone)]
pub enum DescriptorKind {
    /// A table btree
    Table(TableInfo),
    /// An index btree
    Index(IndexInfo),
    /// A view; carries no storage of its own
    View,
}

/// One schema object: shared fields plus the kind-specific variant
#[derive(Debug, Clone)]
pub struct Descriptor {
    /// Object name as declared in the schema
    pub name: String,
    /// Root page of the object's btree (0 for views)
    pub root_page: u32,
    /// Kind-specific fields
    pub kind: DescriptorKind,
    pattern: Option<HeaderPattern>,
}

impl Descriptor {
    /// Build a table descriptor, compiling its header pattern.
    pub fn table(
        name: impl Into<String>,
        root_page: u32,
        columns: Vec<ColumnType>,
        has_rowid: bool,
    ) -> Self {
        let pattern = HeaderPattern::new(columns.clone());
        Self {
            name: name.into(),
            root_page,
            kind: DescriptorKind::Table(TableInfo {
                columns,
                has_rowid,
                ipk_alias: None,
            }),
            pattern: Some(pattern),
        }
    }

    /// Mark a column as the INTEGER PRIMARY KEY rowid alias.
    pub fn with_ipk_alias(mut self, column: usize) -> Self {
        if let DescriptorKind::Table(ref mut info) = self.kind {
            info.ipk_alias = Some(column);
        }
        self
    }

    /// Build an index descriptor.
    ///
    /// Index records on a table btree append the referenced rowid after the
    /// indexed columns, so the compiled pattern carries a trailing integer
    /// constraint beyond the declared signature.
    pub fn index(
        name: impl Into<String>,
        root_page: u32,
        table: impl Into<String>,
        columns: Vec<ColumnType>,
    ) -> Self {
        let mut with_rowid = columns.clone();
        with_rowid.push(ColumnType::Int);
        Self {
            name: name.into(),
            root_page,
            kind: DescriptorKind::Index(IndexInfo {
                table: table.into(),
                columns,
            }),
            pattern: Some(HeaderPattern::new(with_rowid)),
        }
    }

    /// Build a view descriptor. Views own no pages and no pattern.
    pub fn view(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            root_page: 0,
            kind: DescriptorKind::View,
            pattern: None,
        }
    }

    /// The compiled header pattern, if this object stores records
    pub fn pattern(&self) -> Option<&HeaderPattern> {
        self.pattern.as_ref()
    }

    /// The declared column signature, if any
    pub fn columns(&self) -> Option<&[ColumnType]> {
        match &self.kind {
            DescriptorKind::Table(info) => Some(&info.columns),
            DescriptorKind::Index(info) => Some(&info.columns),
            DescriptorKind::View => None,
        }
    }

    /// Table-specific fields, if this is a table
    pub fn table_info(&self) -> Option<&TableInfo> {
        match &self.kind {
            DescriptorKind::Table(info) => Some(info),
            _ => None,
        }
    }

    /// True if this descriptor owns btree pages
    pub fn has_storage(&self) -> bool {
        !matches!(self.kind, DescriptorKind::View) && self.root_page != 0
    }
}

/// The ordered collection of descriptors for one analysis run.
///
/// Declaration order matters: when a carved header matches several
/// signatures, the first declared match wins. Structurally identical
/// signatures cannot be told apart from header bytes alone.
#[derive(Debug, Clone)]
pub struct Schema {
    descriptors: Vec<Descriptor>,
}

impl Schema {
    /// Build a schema from descriptors in declaration order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmptySchema`] when the list is empty; an analysis
    /// run without descriptors can recover nothing.
    pub fn new(descriptors: Vec<Descriptor>) -> Result<Self> {
        if descriptors.is_empty() {
            return Err(Error::EmptySchema);
        }
        Ok(Self { descriptors })
    }

    /// All descriptors in declaration order
    pub fn descriptors(&self) -> &[Descriptor] {
        &self.descriptors
    }

    /// Look up a descriptor by name
    pub fn get(&self, name: &str) -> Option<&Descriptor> {
        self.descriptors.iter().find(|d| d.name == name)
    }

    /// Descriptor whose btree is rooted at `page`, if any
    pub fn owner_of_root(&self, page: u32) -> Option<&Descriptor> {
        self.descriptors
            .iter()
            .find(|d| d.has_storage() && d.root_page == page)
    }

    /// First descriptor (declaration order) whose pattern admits `codes`.
    pub fn match_header(&self, codes: &[u64]) -> Option<&Descriptor> {
        self.descriptors
            .iter()
            .find(|d| d.pattern().is_some_and(|p| p.matches(codes)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample_schema() -> Schema {
        Schema::new(vec![
            Descriptor::table(
                "users",
                2,
                vec![ColumnType::Int, ColumnType::Text, ColumnType::Blob],
                true,
            )
            .with_ipk_alias(0),
            Descriptor::table("metrics", 3, vec![ColumnType::Real, ColumnType::Int], true),
            Descriptor::index("users_name", 4, "users", vec![ColumnType::Text]),
            Descriptor::view("active_users"),
        ])
        .unwrap()
    }

    #[test]
    fn test_empty_schema_is_error() {
        assert!(matches!(Schema::new(vec![]), Err(Error::EmptySchema)));
    }

    #[test]
    fn test_keyword_mapping() {
        assert_eq!(ColumnType::from_keyword("integer"), Some(ColumnType::Int));
        assert_eq!(ColumnType::from_keyword("VARCHAR"), Some(ColumnType::Text));
        assert_eq!(ColumnType::from_keyword("blob"), Some(ColumnType::Blob));
        assert_eq!(ColumnType::from_keyword("gibberish"), None);
    }

    #[test]
    fn test_match_header_declaration_order_wins() {
        let schema = sample_schema();
        // [int, text, blob] fits only `users`
        assert_eq!(schema.match_header(&[1, 15, 14]).unwrap().name, "users");
        // [real, int] fits only `metrics`
        assert_eq!(schema.match_header(&[7, 2]).unwrap().name, "metrics");
        // Index pattern is columns + rowid int
        assert_eq!(
            schema.match_header(&[15, 1]).unwrap().name,
            "users_name"
        );
        assert!(schema.match_header(&[7, 7, 7]).is_none());
    }

    #[test]
    fn test_first_of_identical_signatures_wins() {
        let schema = Schema::new(vec![
            Descriptor::table("a", 2, vec![ColumnType::Int], true),
            Descriptor::table("b", 3, vec![ColumnType::Int], true),
        ])
        .unwrap();
        assert_eq!(schema.match_header(&[1]).unwrap().name, "a");
    }

    #[test]
    fn test_owner_of_root_skips_views() {
        let schema = sample_schema();
        assert_eq!(schema.owner_of_root(2).unwrap().name, "users");
        assert_eq!(schema.owner_of_root(4).unwrap().name, "users_name");
        assert!(schema.owner_of_root(0).is_none());
    }

    #[test]
    fn test_ipk_alias_recorded() {
        let schema = sample_schema();
        let info = schema.get("users").unwrap().table_info().unwrap();
        assert_eq!(info.ipk_alias, Some(0));
        assert!(info.has_rowid);
    }
}
