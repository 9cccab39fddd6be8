//! Table schema: the typed column list persisted as the file's first line.
//!
//! The header grammar is `name:type|name:type|…`. Positions inside a data
//! row are 1-based because index 0 holds the row marker byte.

use crate::errors::DbError;

/// Type of a declared table column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    /// UTF-8 text, percent-escaped when it carries `|`, CR or LF.
    Text,
    /// Plain decimal number.
    Number,
    /// Encoded as `1` / `0`.
    Boolean,
    /// Encoded as epoch milliseconds.
    Date,
    /// Arbitrary JSON, escaped like text.
    Object,
}

impl ColumnType {
    fn parse(token: &str) -> Result<Self, DbError> {
        match token {
            "string" => Ok(ColumnType::Text),
            "number" => Ok(ColumnType::Number),
            "boolean" => Ok(ColumnType::Boolean),
            "date" => Ok(ColumnType::Date),
            "object" => Ok(ColumnType::Object),
            other => Err(DbError::Parse(format!("column type `{other}`"))),
        }
    }

    fn token(self) -> &'static str {
        match self {
            ColumnType::Text => "string",
            ColumnType::Number => "number",
            ColumnType::Boolean => "boolean",
            ColumnType::Date => "date",
            ColumnType::Object => "object",
        }
    }
}

/// One declared column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub kind: ColumnType,
}

/// Ordered column list for a table file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    pub columns: Vec<Column>,
}

impl Schema {
    /// Parses a declaration such as `id:string|price:number|dt:date`.
    ///
    /// Both the persisted header line and the configuration string supplied
    /// at open use this grammar. A column without an explicit type is text.
    pub fn parse(header: &str) -> Result<Self, DbError> {
        let header = header.trim();
        if header.is_empty() {
            return Err(DbError::SchemaMissing);
        }

        let mut columns = Vec::new();
        for cell in header.split('|') {
            let cell = cell.trim();
            if cell.is_empty() {
                continue;
            }
            let (name, kind) = match cell.split_once(':') {
                Some((name, kind)) => (name.trim(), ColumnType::parse(kind.trim())?),
                None => (cell, ColumnType::Text),
            };
            columns.push(Column {
                name: name.to_string(),
                kind,
            });
        }

        if columns.is_empty() {
            return Err(DbError::SchemaMissing);
        }
        Ok(Schema { columns })
    }

    /// Serializes the schema back into its header line (without newline).
    pub fn header(&self) -> String {
        let mut out = String::new();
        for (i, col) in self.columns.iter().enumerate() {
            if i > 0 {
                out.push('|');
            }
            out.push_str(&col.name);
            out.push(':');
            out.push_str(col.kind.token());
        }
        out
    }

    /// Looks up a column by name.
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }
}
