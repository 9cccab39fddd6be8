//! Schema table: a database specialization with typed, pipe-delimited
//! rows.
//!
//! The first line of a table file is always the schema header. An existing
//! header wins over the declaration supplied at open; a fresh file gets
//! the declared header written immediately. A table opened with neither
//! still serves reads, but every write fails with
//! [`DbError::SchemaMissing`].

use std::ops::Deref;
use std::path::Path;

use crate::engine::{Database, DatabaseOptions, StorageKind};
use crate::errors::DbError;
use crate::scheduler::{resolved, Pending};
use crate::schema::Schema;
use crate::stream::{append_file, DocReader};

/// A fixed-schema table stored as `<name>.table`.
///
/// Derefs to [`Database`]: every query and write operation of the engine
/// is available, running through the table row codec.
pub struct Table {
    db: Database,
}

impl Table {
    /// Opens (or creates) a table. `declaration` is the schema grammar
    /// `name:type|name:type|…`, used only when the file carries no header
    /// yet.
    pub fn open(
        directory: impl AsRef<Path>,
        name: &str,
        declaration: Option<&str>,
    ) -> Result<Table, DbError> {
        Table::open_with(directory, name, declaration, DatabaseOptions::default())
    }

    /// `open` with explicit options.
    pub fn open_with(
        directory: impl AsRef<Path>,
        name: &str,
        declaration: Option<&str>,
        options: DatabaseOptions,
    ) -> Result<Table, DbError> {
        let directory = directory.as_ref();
        let data = directory.join(format!("{name}.table"));

        let schema = match read_header(&data)? {
            Some(header) => Some(Schema::parse(&header)?),
            None => match declaration {
                Some(decl) => {
                    let schema = Schema::parse(decl)?;
                    if !options.readonly {
                        fs_err::create_dir_all(directory)?;
                        append_file(&data, format!("{}\n", schema.header()).as_bytes())?;
                    }
                    Some(schema)
                }
                None => None,
            },
        };

        let db = Database::build(directory, name, options, StorageKind::Table, schema)?;
        Ok(Table { db })
    }

    /// The current column list, if any.
    pub fn schema(&self) -> Option<Schema> {
        self.db.inner.schema.read().clone()
    }

    /// Replaces the schema and rewrites every row through the new codec.
    /// Runs exclusively, like a `lock` section; dropping columns is
    /// allowed and discards their cells.
    pub fn extend(&self, declaration: &str) -> Pending<()> {
        match Schema::parse(declaration) {
            Ok(schema) => self.db.submit_extend(schema),
            Err(err) => resolved(Err(err)),
        }
    }
}

impl Deref for Table {
    type Target = Database;

    fn deref(&self) -> &Database {
        &self.db
    }
}

fn read_header(path: &Path) -> Result<Option<String>, DbError> {
    let mut reader = DocReader::open(path)?;
    Ok(reader.next_line()?.map(|record| record.text))
}
