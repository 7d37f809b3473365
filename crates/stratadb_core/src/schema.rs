//! Row schema, column metadata, and the colgroup partition.
//!
//! A row is encoded as its columns in schema order: fixed-width columns are
//! stored raw, variable-width columns carry a u32 LE length prefix, and the
//! last column of a schema is stored raw to the end of the record. Parsing
//! produces a [`ColumnVec`] of byte ranges into the encoded buffer, so a row
//! can be sliced, projected, and recombined without copying column data.
//!
//! [`TableSchema`] derives the physical layout from the row schema and the
//! index definitions: one colgroup per index, one single-column colgroup per
//! in-place-updatable column, and a final colgroup holding everything else.

use crate::error::{CoreError, CoreResult};

/// Column value type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    /// Signed 32-bit integer, little-endian.
    Int32,
    /// Signed 64-bit integer, little-endian.
    Int64,
    /// Unsigned 32-bit integer, little-endian.
    Uint32,
    /// Unsigned 64-bit integer, little-endian.
    Uint64,
    /// IEEE-754 double, little-endian.
    Float64,
    /// Opaque fixed-width bytes; width carried by the column metadata.
    Fixed,
    /// Variable-width bytes.
    VarBinary,
}

impl ColumnType {
    /// Returns the metadata type tag used in `dbmeta.json`.
    #[must_use]
    pub fn tag(self) -> &'static str {
        match self {
            Self::Int32 => "int32",
            Self::Int64 => "int64",
            Self::Uint32 => "uint32",
            Self::Uint64 => "uint64",
            Self::Float64 => "float64",
            Self::Fixed => "fixed",
            Self::VarBinary => "varbinary",
        }
    }

    /// Parses a metadata type tag.
    pub fn from_tag(tag: &str) -> CoreResult<Self> {
        Ok(match tag {
            "int32" => Self::Int32,
            "int64" => Self::Int64,
            "uint32" => Self::Uint32,
            "uint64" => Self::Uint64,
            "float64" => Self::Float64,
            "fixed" => Self::Fixed,
            "varbinary" => Self::VarBinary,
            other => {
                return Err(CoreError::invalid_argument(format!(
                    "unknown column type tag: {other}"
                )))
            }
        })
    }

    /// Returns true for integer types (eligible for zipped-int stores).
    #[must_use]
    pub fn is_integer(self) -> bool {
        matches!(self, Self::Int32 | Self::Int64 | Self::Uint32 | Self::Uint64)
    }
}

/// Metadata for one column.
#[derive(Debug, Clone)]
pub struct ColumnMeta {
    /// Column name, unique within the schema.
    pub name: String,
    /// Value type.
    pub ty: ColumnType,
    /// Width for `Fixed` columns; ignored otherwise.
    pub fixed_len: usize,
    /// Whether cells of this column may be rewritten in place after the row
    /// lands in the write store. Requires a fixed width and no index.
    pub inplace_updatable: bool,
    /// Whether the column's colgroup should always take the
    /// dictionary-compressed store during convert/purge.
    pub dict_zip: bool,
}

impl ColumnMeta {
    /// Creates a column of the given type.
    pub fn new(name: impl Into<String>, ty: ColumnType) -> Self {
        Self {
            name: name.into(),
            ty,
            fixed_len: 0,
            inplace_updatable: false,
            dict_zip: false,
        }
    }

    /// Creates an opaque fixed-width column.
    pub fn fixed(name: impl Into<String>, len: usize) -> Self {
        Self {
            name: name.into(),
            ty: ColumnType::Fixed,
            fixed_len: len,
            inplace_updatable: false,
            dict_zip: false,
        }
    }

    /// Marks the column as in-place updatable.
    #[must_use]
    pub fn updatable(mut self) -> Self {
        self.inplace_updatable = true;
        self
    }

    /// Requests dictionary compression for the column's colgroup.
    #[must_use]
    pub fn dict_zip(mut self) -> Self {
        self.dict_zip = true;
        self
    }

    /// Returns the fixed width of this column, or `None` for variable width.
    #[must_use]
    pub fn fixed_size(&self) -> Option<usize> {
        match self.ty {
            ColumnType::Int32 | ColumnType::Uint32 => Some(4),
            ColumnType::Int64 | ColumnType::Uint64 | ColumnType::Float64 => Some(8),
            ColumnType::Fixed => Some(self.fixed_len),
            ColumnType::VarBinary => None,
        }
    }
}

/// Byte ranges of parsed columns, relative to some encoded buffer.
#[derive(Debug, Default, Clone)]
pub struct ColumnVec {
    ranges: Vec<(u32, u32)>,
}

impl ColumnVec {
    /// Creates an empty column vector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes all ranges.
    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    /// Number of parsed columns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    /// Returns true if no columns are present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Appends a range.
    pub fn push(&mut self, start: usize, end: usize) {
        self.ranges.push((start as u32, end as u32));
    }

    /// Returns column `i` as a range into the source buffer.
    #[must_use]
    pub fn range(&self, i: usize) -> std::ops::Range<usize> {
        let (s, e) = self.ranges[i];
        s as usize..e as usize
    }

    /// Returns column `i` as a slice of `src`.
    #[must_use]
    pub fn col<'a>(&self, src: &'a [u8], i: usize) -> &'a [u8] {
        &src[self.range(i)]
    }

    /// Overwrites range `i`. The vector must already hold `i + 1` entries.
    pub fn set(&mut self, i: usize, start: usize, end: usize) {
        self.ranges[i] = (start as u32, end as u32);
    }

    /// Grows to `n` entries, filling with empty ranges.
    pub fn resize(&mut self, n: usize) {
        self.ranges.resize(n, (0, 0));
    }
}

/// An ordered list of columns with a shared encoding.
///
/// A schema is either the row schema itself or a projection of it (an index,
/// a colgroup, the writable-store subset); projections remember the parent
/// column id of each of their columns.
#[derive(Debug, Clone)]
pub struct Schema {
    name: String,
    columns: Vec<ColumnMeta>,
    parent_cols: Vec<usize>,
    fixed_row_len: Option<usize>,
}

impl Schema {
    /// Creates a root schema. Column names must be unique.
    pub fn new(name: impl Into<String>, columns: Vec<ColumnMeta>) -> CoreResult<Self> {
        let name = name.into();
        if columns.is_empty() {
            return Err(CoreError::invalid_argument("schema has no columns"));
        }
        for (i, col) in columns.iter().enumerate() {
            if col.ty == ColumnType::Fixed && col.fixed_len == 0 {
                return Err(CoreError::invalid_argument(format!(
                    "fixed column {} has zero width",
                    col.name
                )));
            }
            if columns[..i].iter().any(|c| c.name == col.name) {
                return Err(CoreError::invalid_argument(format!(
                    "duplicate column name: {}",
                    col.name
                )));
            }
        }
        let parent_cols = (0..columns.len()).collect();
        Ok(Self::with_parents(name, columns, parent_cols))
    }

    /// Creates a projection of `row` selecting `parents` in order.
    pub(crate) fn project_of(
        name: impl Into<String>,
        row: &Schema,
        parents: Vec<usize>,
    ) -> Self {
        let columns = parents.iter().map(|&p| row.columns[p].clone()).collect();
        Self::with_parents(name.into(), columns, parents)
    }

    fn with_parents(name: String, columns: Vec<ColumnMeta>, parent_cols: Vec<usize>) -> Self {
        let fixed_row_len = columns
            .iter()
            .map(ColumnMeta::fixed_size)
            .sum::<Option<usize>>();
        Self {
            name,
            columns,
            parent_cols,
            fixed_row_len,
        }
    }

    /// Schema name (used in file names for colgroups and indexes).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of columns.
    #[must_use]
    pub fn column_num(&self) -> usize {
        self.columns.len()
    }

    /// Returns column metadata by position.
    #[must_use]
    pub fn column(&self, i: usize) -> &ColumnMeta {
        &self.columns[i]
    }

    /// Looks up a column id by name.
    #[must_use]
    pub fn column_id(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Parent (row-schema) column id of column `i`.
    #[must_use]
    pub fn parent_col(&self, i: usize) -> usize {
        self.parent_cols[i]
    }

    /// Row width when every column is fixed, else `None`.
    #[must_use]
    pub fn fixed_row_len(&self) -> Option<usize> {
        self.fixed_row_len
    }

    /// Parses the record occupying `buf[start..]`, appending one range per
    /// column to `out`. Ranges are relative to `buf`.
    pub fn parse_row_append(
        &self,
        buf: &[u8],
        start: usize,
        out: &mut ColumnVec,
    ) -> CoreResult<()> {
        let mut pos = start;
        let end = buf.len();
        let last = self.columns.len() - 1;
        for (i, col) in self.columns.iter().enumerate() {
            match col.fixed_size() {
                Some(len) => {
                    if pos + len > end {
                        return Err(CoreError::corruption(format!(
                            "row too short in schema {}: column {} needs {} bytes, {} left",
                            self.name,
                            col.name,
                            len,
                            end - pos
                        )));
                    }
                    out.push(pos, pos + len);
                    pos += len;
                }
                None if i == last => {
                    out.push(pos, end);
                    pos = end;
                }
                None => {
                    if pos + 4 > end {
                        return Err(CoreError::corruption(format!(
                            "row too short in schema {}: missing length of column {}",
                            self.name, col.name
                        )));
                    }
                    let len = u32::from_le_bytes(buf[pos..pos + 4].try_into().unwrap()) as usize;
                    pos += 4;
                    if pos + len > end {
                        return Err(CoreError::corruption(format!(
                            "row too short in schema {}: column {} claims {} bytes",
                            self.name, col.name, len
                        )));
                    }
                    out.push(pos, pos + len);
                    pos += len;
                }
            }
        }
        if pos != end {
            return Err(CoreError::corruption(format!(
                "trailing {} bytes after last column in schema {}",
                end - pos,
                self.name
            )));
        }
        Ok(())
    }

    /// Parses a whole record.
    pub fn parse_row(&self, buf: &[u8], out: &mut ColumnVec) -> CoreResult<()> {
        out.clear();
        self.parse_row_append(buf, 0, out)
    }

    /// Re-encodes columns `cols[0..column_num]` (slices of `src`) into `out`.
    pub fn combine_row_append(&self, cols: &ColumnVec, src: &[u8], out: &mut Vec<u8>) {
        debug_assert_eq!(cols.len(), self.columns.len());
        let last = self.columns.len() - 1;
        for (i, col) in self.columns.iter().enumerate() {
            let data = cols.col(src, i);
            if col.fixed_size().is_none() && i != last {
                out.extend_from_slice(&(data.len() as u32).to_le_bytes());
            }
            out.extend_from_slice(data);
        }
    }

    /// Encodes this projection from parsed parent-row columns into `out`.
    ///
    /// `row_cols` must be the full row parse; `src` its backing buffer.
    pub fn select_parent_append(&self, row_cols: &ColumnVec, src: &[u8], out: &mut Vec<u8>) {
        let last = self.columns.len() - 1;
        for (i, col) in self.columns.iter().enumerate() {
            let data = row_cols.col(src, self.parent_cols[i]);
            if col.fixed_size().is_none() && i != last {
                out.extend_from_slice(&(data.len() as u32).to_le_bytes());
            }
            out.extend_from_slice(data);
        }
    }

    /// Serializes columns as metadata TSV rows:
    /// `<colId>\t<colName>\t<typeTag>[\t<fixedLen>][\tinplace]`.
    #[must_use]
    pub fn to_meta_rows(&self) -> Vec<String> {
        self.columns
            .iter()
            .enumerate()
            .map(|(id, col)| {
                let mut row = format!("{id}\t{}\t{}", col.name, col.ty.tag());
                if col.ty == ColumnType::Fixed {
                    row.push_str(&format!("\t{}", col.fixed_len));
                }
                if col.inplace_updatable {
                    row.push_str("\tinplace");
                }
                if col.dict_zip {
                    row.push_str("\tdictzip");
                }
                row
            })
            .collect()
    }

    /// Parses metadata TSV rows back into a schema.
    pub fn from_meta_rows(name: impl Into<String>, rows: &[String]) -> CoreResult<Self> {
        let mut columns = Vec::with_capacity(rows.len());
        for (expect_id, row) in rows.iter().enumerate() {
            let fields: Vec<&str> = row.split('\t').collect();
            if fields.len() < 3 {
                return Err(CoreError::invalid_argument(format!(
                    "bad RowSchema row: {row}"
                )));
            }
            let id: usize = fields[0]
                .parse()
                .map_err(|_| CoreError::invalid_argument(format!("bad column id: {}", fields[0])))?;
            if id != expect_id {
                return Err(CoreError::invalid_argument(format!(
                    "bad column id {id}, expected {expect_id}"
                )));
            }
            let ty = ColumnType::from_tag(fields[2])?;
            let mut col = ColumnMeta::new(fields[1], ty);
            let mut rest = &fields[3..];
            if ty == ColumnType::Fixed {
                let len = rest
                    .first()
                    .and_then(|f| f.parse().ok())
                    .ok_or_else(|| {
                        CoreError::invalid_argument(format!("fixed column {} missing length", fields[1]))
                    })?;
                col.fixed_len = len;
                rest = &rest[1..];
            }
            for flag in rest {
                match *flag {
                    "inplace" => col.inplace_updatable = true,
                    "dictzip" => col.dict_zip = true,
                    other => {
                        return Err(CoreError::invalid_argument(format!(
                            "unknown column flag {other:?} in RowSchema"
                        )))
                    }
                }
            }
            columns.push(col);
        }
        Schema::new(name, columns)
    }
}

/// Definition of one index: an ordered column-name list plus uniqueness.
#[derive(Debug, Clone)]
pub struct IndexDef {
    /// Columns forming the key, in key order.
    pub columns: Vec<String>,
    /// Whether the schema declares the key unique.
    pub unique: bool,
}

impl IndexDef {
    /// Creates a non-unique index over the given columns.
    pub fn new<S: Into<String>>(columns: impl IntoIterator<Item = S>) -> Self {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            unique: false,
        }
    }

    /// Marks the index unique.
    #[must_use]
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

/// An index schema: the projected key schema plus the uniqueness flag.
#[derive(Debug, Clone)]
pub struct IndexSchema {
    /// Projection of the row schema forming the key.
    pub schema: Schema,
    /// Whether the key is unique in the schema.
    pub unique: bool,
}

/// Where a row column lives physically.
#[derive(Debug, Clone, Copy)]
pub struct ColProject {
    /// Owning colgroup id.
    pub colgroup: usize,
    /// Position within the colgroup schema.
    pub sub: usize,
}

/// The full physical layout of a table.
///
/// Colgroups are ordered: one per index first (the index store doubles as
/// the colgroup store on read-only segments), then one per in-place-updatable
/// column, then a final group with the remaining columns. The writable store
/// holds every column that is not in an updatable colgroup.
#[derive(Debug)]
pub struct TableSchema {
    /// The row schema.
    pub row: Schema,
    /// Index schemas, in index-id order.
    pub indexes: Vec<IndexSchema>,
    /// Colgroup schemas, in colgroup-id order.
    pub colgroups: Vec<Schema>,
    /// Colgroup ids of in-place-updatable groups.
    pub updatable_colgroups: Vec<usize>,
    /// Projection held by the writable row store.
    pub wrt: Schema,
    /// Row column id → physical location.
    pub col_project: Vec<ColProject>,
    /// Row column id → writable-store column id, `None` for updatable columns.
    pub row_to_wrt: Vec<Option<usize>>,
}

impl TableSchema {
    /// Derives the physical layout from a row schema and index definitions.
    pub fn build(row: Schema, index_defs: &[IndexDef]) -> CoreResult<Self> {
        let ncols = row.column_num();
        let mut owner: Vec<Option<usize>> = vec![None; ncols];

        let mut indexes = Vec::with_capacity(index_defs.len());
        let mut colgroups = Vec::new();
        for (index_id, def) in index_defs.iter().enumerate() {
            if def.columns.is_empty() {
                return Err(CoreError::invalid_argument("index has no columns"));
            }
            let mut parents = Vec::with_capacity(def.columns.len());
            for colname in &def.columns {
                let col_id = row.column_id(colname).ok_or_else(|| {
                    CoreError::invalid_argument(format!(
                        "index column {colname} is not found in the row schema"
                    ))
                })?;
                if owner[col_id].is_some() {
                    return Err(CoreError::invalid_argument(format!(
                        "column {colname} appears in more than one index"
                    )));
                }
                if row.column(col_id).inplace_updatable {
                    return Err(CoreError::invalid_argument(format!(
                        "column {colname} is in-place updatable and cannot be indexed"
                    )));
                }
                owner[col_id] = Some(index_id);
                parents.push(col_id);
            }
            let name = def.columns.join("+");
            let schema = Schema::project_of(name, &row, parents);
            colgroups.push(schema.clone());
            indexes.push(IndexSchema {
                schema,
                unique: def.unique,
            });
        }

        let mut updatable_colgroups = Vec::new();
        for col_id in 0..ncols {
            let col = row.column(col_id);
            if !col.inplace_updatable {
                continue;
            }
            if col.fixed_size().is_none() {
                return Err(CoreError::invalid_argument(format!(
                    "in-place updatable column {} must be fixed width",
                    col.name
                )));
            }
            owner[col_id] = Some(colgroups.len());
            updatable_colgroups.push(colgroups.len());
            colgroups.push(Schema::project_of(col.name.clone(), &row, vec![col_id]));
        }

        let rest: Vec<usize> = (0..ncols).filter(|&c| owner[c].is_none()).collect();
        if !rest.is_empty() {
            let id = colgroups.len();
            for &c in &rest {
                owner[c] = Some(id);
            }
            colgroups.push(Schema::project_of("rest", &row, rest));
        }

        let mut col_project = Vec::with_capacity(ncols);
        for col_id in 0..ncols {
            let cg = owner[col_id].expect("every column is owned by a colgroup");
            let sub = (0..colgroups[cg].column_num())
                .position(|i| colgroups[cg].parent_col(i) == col_id)
                .expect("owner colgroup contains the column");
            col_project.push(ColProject { colgroup: cg, sub });
        }

        let wrt_parents: Vec<usize> = (0..ncols)
            .filter(|&c| !row.column(c).inplace_updatable)
            .collect();
        let mut row_to_wrt = vec![None; ncols];
        for (wrt_id, &col_id) in wrt_parents.iter().enumerate() {
            row_to_wrt[col_id] = Some(wrt_id);
        }
        let wrt = Schema::project_of("wrt", &row, wrt_parents);

        Ok(Self {
            row,
            indexes,
            colgroups,
            updatable_colgroups,
            wrt,
            col_project,
            row_to_wrt,
        })
    }

    /// Number of indexes.
    #[must_use]
    pub fn index_num(&self) -> usize {
        self.indexes.len()
    }

    /// Number of colgroups.
    #[must_use]
    pub fn colgroup_num(&self) -> usize {
        self.colgroups.len()
    }

    /// Extracts the key of index `index_id` from parsed row columns.
    pub fn index_key_append(
        &self,
        index_id: usize,
        row_cols: &ColumnVec,
        src: &[u8],
        out: &mut Vec<u8>,
    ) {
        self.indexes[index_id]
            .schema
            .select_parent_append(row_cols, src, out);
    }

    /// True when the colgroup should use the raw fixed-length store.
    #[must_use]
    pub fn use_fixed_len_store(&self, colgroup_id: usize) -> bool {
        let schema = &self.colgroups[colgroup_id];
        schema.fixed_row_len().is_some()
            && !(schema.column_num() == 1 && schema.column(0).ty.is_integer())
    }
}
