//! Structural transformation of a live database towards a [TargetSchema].
//!
//! Tables are never altered in place. Each rebuild renames the table to a hidden name, creates
//! the new definition under the original name, copies the surviving columns over and drops
//! the hidden table. The upgrade script runs between two rebuild passes: the first one only
//! adds columns, the second one applies the authored definitions and so drops what the target
//! schema no longer declares.

use crate::core::format_row;
use crate::ddl::{quote_ident, rewrite_trigger_body};
use crate::error::Error;
use crate::reader::{
    read_clean_statements, tabledef_from_statement_lines, TableDefinition, TargetSchema,
    TriggerDefinition,
};
use crate::version::VERSION_TABLE_LINES;
use indexmap::IndexMap;
use rusqlite::{Connection, ErrorCode};
use std::collections::HashSet;
use std::path::Path;

/// Prefix of the name a table is renamed to while it is rebuilt.
pub const HIDDEN_TABLE_PREFIX: &str = "_copy_of_";

const PROBE_TABLE: &str = "_schapp_trigger_probe";
const PROBE_TRIGGER: &str = "_schapp_trigger_probe_check";

/// What the structural phase did, for the upgrade report.
#[derive(Debug, Default)]
pub(crate) struct StructuralChanges {
    pub tables_created: Vec<String>,
    pub tables_rebuilt: Vec<String>,
    pub tables_dropped: Vec<String>,
    pub triggers_created: Vec<String>,
}

/// Transform the database to `schema`, running `upgrade_script` once all old and new columns
/// are available side by side.
pub(crate) fn apply(
    conn: &Connection,
    mut schema: TargetSchema,
    upgrade_script: Option<&Path>,
) -> Result<StructuralChanges, Error> {
    schema.tables.push(tabledef_from_statement_lines(
        VERSION_TABLE_LINES.iter().map(|l| l.to_string()).collect(),
    )?);

    let existing_tables = drop_programmability(conn)?;
    conn.execute_batch("pragma foreign_keys = off;")?;
    let tables_created = widen_tables(conn, &existing_tables, &schema.tables)?;

    if let Some(path) = upgrade_script {
        run_upgrade_script(conn, path)?;
    }

    let tables_dropped = create_constraints(conn, &schema.tables, &existing_tables)?;
    let triggers_created = create_programmability(conn, &schema.triggers, &schema.pass_through)?;

    let target_names: HashSet<&str> = schema.tables.iter().map(|t| t.name()).collect();
    let mut tables_rebuilt: Vec<String> = existing_tables
        .into_iter()
        .filter(|t| target_names.contains(t.as_str()))
        .collect();
    tables_rebuilt.sort();

    Ok(StructuralChanges {
        tables_created,
        tables_rebuilt,
        tables_dropped,
        triggers_created,
    })
}

/// Drop every trigger, view and index, returning the names of the existing tables.
fn drop_programmability(conn: &Connection) -> Result<Vec<String>, Error> {
    let objects: Vec<(String, String)> = {
        let mut stmt = conn.prepare(
            "select type, name from sqlite_master
             where not (type='index' and name like 'sqlite^_autoindex^_%' escape '^')",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect::<Result<Vec<_>, _>>()?
    };

    let mut tables = Vec::new();
    for (object_type, name) in objects {
        match object_type.to_lowercase().as_str() {
            kind @ ("trigger" | "view" | "index") => {
                #[cfg(feature = "tracing")]
                tracing::debug!(kind = kind, name = %name, "Dropping schema object");
                // a view's instead-of triggers disappear together with the view
                conn.execute_batch(&format!("drop {} if exists {};", kind, quote_ident(&name)))?;
            }
            // sqlite_sequence and friends are maintained by SQLite itself
            "table" if name.starts_with("sqlite_") => {}
            "table" => tables.push(name),
            _ => {
                return Err(Error::Database(format!(
                    "cannot handle {} object {}",
                    object_type, name
                )))
            }
        }
    }
    Ok(tables)
}

fn hidden_table_name(table_name: &str) -> Result<String, Error> {
    if table_name.starts_with(HIDDEN_TABLE_PREFIX) {
        return Err(Error::Database(format!(
            "table {} already carries the hidden table prefix {}; is it left over from an interrupted upgrade?",
            table_name, HIDDEN_TABLE_PREFIX
        )));
    }
    Ok(format!("{}{}", HIDDEN_TABLE_PREFIX, table_name))
}

fn hide_table(conn: &Connection, table_name: &str) -> Result<(), Error> {
    conn.execute_batch(&format!(
        "alter table {} rename to {};",
        quote_ident(table_name),
        quote_ident(&hidden_table_name(table_name)?)
    ))?;
    Ok(())
}

/// Create `table_name` with `create_sql`, fill it from the hidden copy and drop the copy.
fn recreate_table<'a>(
    conn: &Connection,
    table_name: &str,
    create_sql: &str,
    copy_columns: impl IntoIterator<Item = &'a String>,
) -> Result<(), Error> {
    conn.execute_batch(create_sql)?;
    let columns = copy_columns
        .into_iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let hidden = quote_ident(&hidden_table_name(table_name)?);
    conn.execute(
        &format!(
            "insert into {n}({l})\n  select {l}\n  from {h};",
            n = quote_ident(table_name),
            l = columns,
            h = hidden
        ),
        [],
    )?;
    conn.execute_batch(&format!("drop table {};", hidden))?;
    Ok(())
}

/// A `create table` statement declaring only columns and their types.
fn unconstrained_table_sql(
    table_name: &str,
    column_types: &IndexMap<String, String>,
) -> Result<String, Error> {
    if column_types.is_empty() {
        return Err(Error::Parse(format!("table {} declares no columns", table_name)));
    }
    let columns = column_types
        .iter()
        .map(|(name, type_name)| {
            if type_name.is_empty() {
                format!("  {}", quote_ident(name))
            } else {
                format!("  {} {}", quote_ident(name), type_name)
            }
        })
        .collect::<Vec<_>>()
        .join(",\n");
    Ok(format!("create table {}(\n{});", quote_ident(table_name), columns))
}

/// Column name to declared type of a live table.
fn table_columns(conn: &Connection, table_name: &str) -> Result<IndexMap<String, String>, Error> {
    let mut stmt = conn.prepare(&format!("pragma table_info({})", quote_ident(table_name)))?;
    let columns = stmt
        .query_map([], |row| Ok((row.get::<_, String>(1)?, row.get::<_, String>(2)?)))?
        .collect::<Result<IndexMap<_, _>, _>>()?;
    Ok(columns)
}

/// Give every existing table the union of its own and its target columns, dropping all
/// constraints, and create the target tables that do not exist yet. Returns the created tables.
fn widen_tables(
    conn: &Connection,
    existing_tables: &[String],
    target_tables: &[TableDefinition],
) -> Result<Vec<String>, Error> {
    for table_name in existing_tables {
        let existing_columns = table_columns(conn, table_name)?;
        let mut widened = existing_columns.clone();
        if let Some(target) = target_tables.iter().find(|t| t.name() == table_name) {
            for (column, type_name) in target.column_types() {
                // SQLite column names are case-insensitive
                let key = widened
                    .keys()
                    .find(|existing| existing.eq_ignore_ascii_case(column))
                    .cloned()
                    .unwrap_or_else(|| column.clone());
                widened.insert(key, type_name.clone());
            }
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(
            table = %table_name,
            columns = ?widened.keys().collect::<Vec<_>>(),
            "Widening existing table"
        );

        let create_sql = unconstrained_table_sql(table_name, &widened)?;
        hide_table(conn, table_name)?;
        recreate_table(conn, table_name, &create_sql, existing_columns.keys())?;
    }

    let mut created = Vec::new();
    for table in target_tables {
        if !existing_tables.iter().any(|t| t == table.name()) {
            #[cfg(feature = "tracing")]
            tracing::debug!(table = %table.name(), "Creating new table");
            conn.execute_batch(&unconstrained_table_sql(table.name(), table.column_types())?)?;
            created.push(table.name().to_string());
        }
    }
    created.sort();
    Ok(created)
}

/// Run the statements of an upgrade script. Rows returned by any statement are integrity
/// problems reported by the script; they fail the upgrade once the whole script has run.
fn run_upgrade_script(conn: &Connection, path: &Path) -> Result<(), Error> {
    #[cfg(feature = "tracing")]
    tracing::info!(script = %path.display(), "Running upgrade script");

    let mut output = Vec::new();
    for statement in read_clean_statements(path)? {
        let sql = statement?.join("\n");
        #[cfg(feature = "tracing")]
        tracing::debug!(sql = %sql, "Executing upgrade statement");

        let mut stmt = conn.prepare(&sql)?;
        let column_count = stmt.column_count();
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            output.push(format_row(row, column_count)?);
        }
    }

    if !output.is_empty() {
        #[cfg(feature = "tracing")]
        tracing::error!(rows = ?output, "Upgrade script reported integrity problems");
        return Err(Error::IntegrityCheck(output));
    }
    Ok(())
}

/// Rebuild every target table from its authored statement, keeping only the declared columns,
/// then drop the existing tables the target schema does not mention. Returns the dropped tables.
fn create_constraints(
    conn: &Connection,
    target_tables: &[TableDefinition],
    existing_tables: &[String],
) -> Result<Vec<String>, Error> {
    for table in target_tables {
        hide_table(conn, table.name())?;
    }
    for table in target_tables {
        recreate_table(conn, table.name(), &table.sql(), table.column_types().keys())?;
    }

    let mut dropped = Vec::new();
    for table_name in existing_tables {
        if !target_tables.iter().any(|t| t.name() == table_name) {
            #[cfg(feature = "tracing")]
            tracing::debug!(table = %table_name, "Dropping table absent from target schema");
            conn.execute_batch(&format!("drop table {};", quote_ident(table_name)))?;
            dropped.push(table_name.clone());
        }
    }
    dropped.sort();
    Ok(dropped)
}

/// Apply views and indexes, then generate the trigger pairs. Returns the created trigger names.
fn create_programmability(
    conn: &Connection,
    triggers: &[TriggerDefinition],
    pass_through: &[Vec<String>],
) -> Result<Vec<String>, Error> {
    for statement_lines in pass_through {
        conn.execute_batch(&statement_lines.join("\n"))?;
    }

    let mut created = Vec::new();
    for (i, trigger) in triggers.iter().enumerate() {
        let body = trigger.body();
        let events = [
            ('i', "insert".to_string()),
            ('u', format!("update of {}", trigger.columns())),
        ];
        for (tag, event) in events {
            let name = format!("{}_{}{}", trigger.table(), i, tag);
            conn.execute_batch(&format!(
                "create trigger {}\n   before {} on {}\n   for each row\n{}",
                quote_ident(&name),
                event,
                quote_ident(trigger.table()),
                body
            ))?;
            created.push(name);
        }
        validate_trigger(conn, trigger)?;
    }
    Ok(created)
}

/// Evaluate a trigger body once against all existing rows of its table by installing a
/// rewritten copy on a scratch table and inserting a dummy row into it.
///
/// Only an abort raised while the copy runs means existing rows violate the trigger; a body
/// that cannot be installed or run fails with the SQLite error itself.
fn validate_trigger(conn: &Connection, trigger: &TriggerDefinition) -> Result<(), Error> {
    let rewritten = rewrite_trigger_body(&trigger.body(), trigger.table())?;
    conn.execute_batch(&format!("create table {}(x int);", PROBE_TABLE))?;
    let checked = conn
        .execute_batch(&format!(
            "create trigger {}\n   before insert on {}\n   for each row\n{}",
            PROBE_TRIGGER, PROBE_TABLE, rewritten
        ))
        .map_err(Error::from)
        .and_then(|_| {
            match conn.execute(&format!("insert into {} values(0);", PROBE_TABLE), []) {
                Ok(_) => Ok(()),
                Err(rusqlite::Error::SqliteFailure(e, Some(message)))
                    if e.code == ErrorCode::ConstraintViolation =>
                {
                    Err(Error::IntegrityCheck(vec![format!(
                        "existing rows of {} violate trigger {}: {}",
                        trigger.table(),
                        trigger.columns(),
                        message
                    )]))
                }
                Err(e) => Err(e.into()),
            }
        });
    let dropped = conn.execute_batch(&format!("drop table {};", PROBE_TABLE));

    checked?;
    dropped?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::parse_schema;
    use std::io::Write;

    fn columns(conn: &Connection, table: &str) -> Vec<(String, String)> {
        table_columns(conn, table).unwrap().into_iter().collect()
    }

    fn table_names(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("select name from sqlite_master where type='table' order by name")
            .unwrap();
        stmt.query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<String>, _>>()
            .unwrap()
    }

    #[test]
    fn widening_keeps_old_columns_and_data() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "create table t(a int not null, old text);
             insert into t values(1, 'x');
             insert into t values(2, 'y');",
        )
        .unwrap();
        let schema = parse_schema("create table t(\n  a integer primary key,\n  b text);").unwrap();

        let created =
            widen_tables(&conn, &["t".to_string()], &schema.tables).unwrap();
        assert!(created.is_empty());
        assert_eq!(
            columns(&conn, "t"),
            vec![
                ("a".to_string(), "integer".to_string()),
                ("old".to_string(), "text".to_string()),
                ("b".to_string(), "text".to_string()),
            ]
        );
        let rows: Vec<(i64, String, Option<String>)> = conn
            .prepare("select a, old, b from t order by a")
            .unwrap()
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(
            rows,
            vec![(1, "x".to_string(), None), (2, "y".to_string(), None)]
        );
        assert_eq!(table_names(&conn), vec!["t"]);
    }

    #[test]
    fn drops_programmability_and_lists_tables() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "create table t(id integer primary key autoincrement, name text unique);
             create index t_name on t(name);
             create view v as select * from t;
             create trigger v_insert instead of insert on v begin select 1; end;
             create trigger t_check before insert on t begin select 1; end;",
        )
        .unwrap();

        let tables = drop_programmability(&conn).unwrap();
        assert_eq!(tables, vec!["t"]);
        let remaining: Vec<(String, String)> = conn
            .prepare("select type, name from sqlite_master order by name")
            .unwrap()
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(
            remaining,
            vec![
                ("index".to_string(), "sqlite_autoindex_t_1".to_string()),
                ("table".to_string(), "sqlite_sequence".to_string()),
                ("table".to_string(), "t".to_string()),
            ]
        );
    }

    #[test]
    fn hidden_prefix_is_refused() {
        assert_eq!(
            hidden_table_name("t").unwrap(),
            "_copy_of_t".to_string()
        );
        assert!(matches!(
            hidden_table_name("_copy_of_t"),
            Err(Error::Database(_))
        ));
    }

    #[test]
    fn unconstrained_sql_omits_missing_types() {
        let mut column_types = IndexMap::new();
        column_types.insert("a".to_string(), "int".to_string());
        column_types.insert("b".to_string(), String::new());
        assert_eq!(
            unconstrained_table_sql("t", &column_types).unwrap(),
            "create table \"t\"(\n  \"a\" int,\n  \"b\");"
        );
        assert!(unconstrained_table_sql("t", &IndexMap::new()).is_err());
    }

    #[test]
    fn upgrade_script_output_fails_after_whole_script() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("create table t(a int); insert into t values(1), (2);")
            .unwrap();
        let mut script = tempfile::NamedTempFile::new().unwrap();
        write!(
            script,
            "select a, 'orphan' from t where a > 1;\ninsert into t values(3);\n"
        )
        .unwrap();

        let err = run_upgrade_script(&conn, script.path()).unwrap_err();
        assert_eq!(err, Error::IntegrityCheck(vec!["(2, 'orphan')".to_string()]));
        // the statement after the reporting select still ran
        let count: i64 = conn
            .query_row("select count(*) from t", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 3);
    }

    #[test]
    fn trigger_pairs_are_created_and_validated() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "create table t(c1 int, c2 int);
             insert into t values(1, 2);",
        )
        .unwrap();
        let schema = parse_schema(
            "create triggers t c1, c2\nbegin\n  select raise(abort, 'c1 must be below c2') from (select 1) where NEW.c1 >= NEW.c2;\nend;",
        )
        .unwrap();

        let created = create_programmability(&conn, &schema.triggers, &[]).unwrap();
        assert_eq!(created, vec!["t_0i", "t_0u"]);
        let sql: String = conn
            .query_row(
                "select sql from sqlite_master where name='t_0u'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert!(sql.contains("before update of c1, c2 on \"t\""));
        assert!(!table_names(&conn).contains(&PROBE_TABLE.to_string()));

        let err = conn.execute("insert into t values(5, 1)", []).unwrap_err();
        assert!(err.to_string().contains("c1 must be below c2"));
    }

    #[test]
    fn trigger_validation_rejects_existing_rows() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "create table t(c1 int, c2 int);
             insert into t values(3, 2);",
        )
        .unwrap();
        let schema = parse_schema(
            "create triggers t c1\nbegin\n  select raise(abort, 'c1 must be below c2') from (select 1) where NEW.c1 >= NEW.c2;\nend;",
        )
        .unwrap();

        let err = create_programmability(&conn, &schema.triggers, &[]).unwrap_err();
        assert!(matches!(err, Error::IntegrityCheck(rows) if rows[0].contains("c1 must be below c2")));
        assert!(!table_names(&conn).contains(&PROBE_TABLE.to_string()));
    }

    #[test]
    fn malformed_trigger_body_is_not_a_violation() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "create table t(c1 int, c2 int);
             insert into t values(1, 2);",
        )
        .unwrap();
        let schema = parse_schema(
            "create triggers t c1\nbegin\n  select raise(abort, 'bad') from (select 1) where NEW.missing > 0;\nend;",
        )
        .unwrap();

        let err = create_programmability(&conn, &schema.triggers, &[]).unwrap_err();
        assert!(matches!(&err, Error::Rusqlite(e) if e.to_string().contains("no such column")));
        assert!(!table_names(&conn).contains(&PROBE_TABLE.to_string()));
    }

    #[test]
    fn trigger_body_with_escaped_quotes_is_validated() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "create table t(c1 int, c2 int);
             insert into t values(1, 2);",
        )
        .unwrap();
        let schema = parse_schema(
            "create triggers t c1, c2\nbegin\n  select raise(abort, 'c1 can''t exceed c2') from (select 1) where NEW.c1 >= NEW.c2;\nend;",
        )
        .unwrap();

        let created = create_programmability(&conn, &schema.triggers, &[]).unwrap();
        assert_eq!(created, vec!["t_0i", "t_0u"]);
        let err = conn.execute("insert into t values(3, 2)", []).unwrap_err();
        assert!(err.to_string().contains("c1 can't exceed c2"));
    }
}
