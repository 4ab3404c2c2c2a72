//! The catalog: tracks every table in the database with its DbFile, name
//! and primary key, and loads line-oriented schema files.

use chumsky::prelude::*;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::dbfile::DbFile;
use crate::errors::{DbError, DbResult};
use crate::heap_file::HeapFile;
use crate::tuple::{Type, TupleDesc};

struct Table {
    file: Arc<dyn DbFile>,
    name: String,
    pkey: String,
}

/// A thread-safe registry mapping table ids to their files and metadata.
#[derive(Default)]
pub struct Catalog {
    tables: RwLock<HashMap<u32, Table>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a table. On a name conflict the newest registration wins
    /// the name; the older table stays reachable by id.
    pub fn add_table(&self, file: Arc<dyn DbFile>, name: &str, pkey: &str) {
        let mut tables = self.tables.write();
        for table in tables.values_mut() {
            if table.name == name {
                table.name = String::new();
            }
        }
        let id = file.id();
        tables.insert(
            id,
            Table {
                file,
                name: name.to_string(),
                pkey: pkey.to_string(),
            },
        );
    }

    pub fn table_id(&self, name: &str) -> DbResult<u32> {
        let tables = self.tables.read();
        tables
            .iter()
            .find(|(_, t)| t.name == name)
            .map(|(id, _)| *id)
            .ok_or_else(|| DbError::Db(format!("table named {} doesn't exist", name)))
    }

    pub fn db_file(&self, table_id: u32) -> DbResult<Arc<dyn DbFile>> {
        let tables = self.tables.read();
        tables
            .get(&table_id)
            .map(|t| t.file.clone())
            .ok_or_else(|| DbError::Db(format!("table {} doesn't exist", table_id)))
    }

    pub fn tuple_desc(&self, table_id: u32) -> DbResult<TupleDesc> {
        Ok(self.db_file(table_id)?.tuple_desc().clone())
    }

    pub fn primary_key(&self, table_id: u32) -> DbResult<String> {
        let tables = self.tables.read();
        tables
            .get(&table_id)
            .map(|t| t.pkey.clone())
            .ok_or_else(|| DbError::Db(format!("table {} doesn't exist", table_id)))
    }

    pub fn table_name(&self, table_id: u32) -> DbResult<String> {
        let tables = self.tables.read();
        tables
            .get(&table_id)
            .map(|t| t.name.clone())
            .ok_or_else(|| DbError::Db(format!("table {} doesn't exist", table_id)))
    }

    pub fn table_ids(&self) -> Vec<u32> {
        self.tables.read().keys().copied().collect()
    }

    /// Removes every table.
    pub fn clear(&self) {
        self.tables.write().clear();
    }

    /// Reads a schema file and registers a heap file per line. Lines look
    /// like `name (field type[ pk], field type, ...)` with types `int` and
    /// `string`, case-insensitive; each table's data lives in
    /// `<schema dir>/<name>.dat`.
    pub fn load_schema<P: AsRef<Path>>(&self, schema_path: P) -> DbResult<()> {
        let schema_path = schema_path.as_ref();
        let base_dir = schema_path.parent().unwrap_or_else(|| Path::new("."));
        let contents = std::fs::read_to_string(schema_path)?;

        for line in contents.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let (name, fields) = parse_schema_line(line)?;
            let mut types = Vec::new();
            let mut names = Vec::new();
            let mut pkey = String::new();
            for (field_name, field_type, is_pk) in fields {
                types.push(field_type);
                names.push(Some(field_name.clone()));
                if is_pk {
                    pkey = field_name;
                }
            }
            let td = TupleDesc::new(types, names);
            let data_path = base_dir.join(format!("{}.dat", name));
            let file = HeapFile::open(&data_path, td)?;
            crate::regolith_debug_log!(
                "[Catalog::load_schema] added table {} from {:?}",
                name,
                data_path
            );
            self.add_table(Arc::new(file), &name, &pkey);
        }
        Ok(())
    }
}

type SchemaField = (String, Type, bool);

fn schema_line_parser() -> impl Parser<char, (String, Vec<SchemaField>), Error = Simple<char>> {
    let ident = text::ident().padded();

    let field_type =
        text::ident()
            .padded()
            .try_map(|s: String, span| match s.to_lowercase().as_str() {
                "int" => Ok(Type::Int),
                "string" => Ok(Type::Str),
                other => Err(Simple::custom(span, format!("unknown type `{}`", other))),
            });

    let pk_marker = just("pk").padded().or_not().map(|pk| pk.is_some());

    let field = ident
        .then(field_type)
        .then(pk_marker)
        .map(|((name, ty), pk)| (name, ty, pk));

    ident
        .then(
            field
                .separated_by(just(',').padded())
                .delimited_by(just('(').padded(), just(')').padded()),
        )
        .then_ignore(end())
}

fn parse_schema_line(line: &str) -> DbResult<(String, Vec<SchemaField>)> {
    schema_line_parser().parse(line).map_err(|errs| {
        let msg = errs
            .into_iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        DbError::Db(format!("invalid catalog entry `{}`: {}", line, msg))
    })
}
