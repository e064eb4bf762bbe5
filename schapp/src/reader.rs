//! Reading schema and upgrade scripts.
//!
//! Scripts are split into statements line by line: a line ending in `;` ends a statement,
//! except inside a `begin ... end;` block where only `end;` does. A line consisting of `EOF`
//! ends the script early.

use crate::ddl;
use crate::error::Error;
use indexmap::IndexMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Cursor};
use std::path::Path;

/// The should-be definition of one table, taken from a `create table` statement.
#[derive(Debug, Clone, PartialEq)]
pub struct TableDefinition {
    name: String,
    statement_lines: Vec<String>,
    column_types: IndexMap<String, String>,
}

impl TableDefinition {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The lines of the `create table` statement, executed as-is when the table is rebuilt.
    pub fn statement_lines(&self) -> &[String] {
        &self.statement_lines
    }

    /// Column name to declared type, in declaration order.
    pub fn column_types(&self) -> &IndexMap<String, String> {
        &self.column_types
    }

    pub(crate) fn sql(&self) -> String {
        self.statement_lines.join("\n")
    }
}

/// A `create triggers <table> <columns>` pseudo statement.
///
/// Each definition becomes two real triggers on `table`: one before insert and one before
/// update of `columns`, both running `body_lines`.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerDefinition {
    table: String,
    columns: String,
    body_lines: Vec<String>,
}

impl TriggerDefinition {
    pub fn table(&self) -> &str {
        &self.table
    }

    /// The column list exactly as written, e.g. `c1, c2`.
    pub fn columns(&self) -> &str {
        &self.columns
    }

    pub fn body_lines(&self) -> &[String] {
        &self.body_lines
    }

    pub(crate) fn body(&self) -> String {
        self.body_lines.join("\n")
    }
}

/// One classified statement of a schema script.
#[derive(Debug, Clone, PartialEq)]
pub enum SchemaObject {
    Table(TableDefinition),
    View(Vec<String>),
    Index(Vec<String>),
    Triggers(TriggerDefinition),
}

impl SchemaObject {
    /// Classify a statement by its opening keywords.
    pub fn from_statement_lines(lines: Vec<String>) -> Result<Self, Error> {
        let first_line = lines
            .first()
            .ok_or_else(|| Error::Parse("empty statement".to_string()))?;
        if starts_with_keywords(first_line, &["create table"]) {
            Ok(Self::Table(tabledef_from_statement_lines(lines)?))
        } else if starts_with_keywords(first_line, &["create view"]) {
            Ok(Self::View(lines))
        } else if starts_with_keywords(first_line, &["create index", "create unique index"]) {
            Ok(Self::Index(lines))
        } else if starts_with_keywords(first_line, &["create triggers"]) {
            Ok(Self::Triggers(triggerdef_from_statement_lines(lines)?))
        } else {
            Err(Error::Parse(format!("cannot handle \"{}\"", first_line)))
        }
    }
}

/// The target schema: tables, trigger definitions and statements applied verbatim.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TargetSchema {
    pub tables: Vec<TableDefinition>,
    pub triggers: Vec<TriggerDefinition>,
    /// Views and indexes, in script order.
    pub pass_through: Vec<Vec<String>>,
}

impl TargetSchema {
    fn push(&mut self, object: SchemaObject) {
        match object {
            SchemaObject::Table(table) => self.tables.push(table),
            SchemaObject::Triggers(trigger) => self.triggers.push(trigger),
            SchemaObject::View(lines) | SchemaObject::Index(lines) => self.pass_through.push(lines),
        }
    }
}

fn starts_with_keywords(line: &str, beginnings: &[&str]) -> bool {
    let lowered = line.trim_start().to_lowercase();
    beginnings
        .iter()
        .any(|beginning| lowered.starts_with(&format!("{} ", beginning)))
}

/// Remove a trailing `--` comment, ignoring comment markers inside quotes.
fn strip_trailing_comment(line: &str) -> &str {
    let mut closing: Option<char> = None;
    let mut previous_dash = false;
    for (i, ch) in line.char_indices() {
        if let Some(quote) = closing {
            if ch == quote {
                closing = None;
            }
            continue;
        }
        match ch {
            '\'' | '"' | '`' => closing = Some(ch),
            '[' => closing = Some(']'),
            '-' if previous_dash => return line[..i - 1].trim_end(),
            _ => {}
        }
        previous_dash = ch == '-';
    }
    line.trim_end()
}

/// Lazy iterator over the statements of a script, each statement being its source lines.
pub struct CleanStatements<R> {
    lines: std::io::Lines<R>,
    statement: Vec<String>,
    is_block: bool,
    finished: bool,
}

impl<R: BufRead> CleanStatements<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            statement: Vec::new(),
            is_block: false,
            finished: false,
        }
    }

    fn finish(&mut self) -> Option<Result<Vec<String>, Error>> {
        self.finished = true;
        if self.statement.is_empty() {
            None
        } else {
            Some(Err(Error::Parse(format!(
                "incomplete input stream, remaining code: {}",
                self.statement.join(" \n")
            ))))
        }
    }
}

impl CleanStatements<Cursor<String>> {
    /// Read statements from an in-memory script.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(script: &str) -> Self {
        Self::new(Cursor::new(script.to_string()))
    }
}

impl<R: BufRead> Iterator for CleanStatements<R> {
    type Item = Result<Vec<String>, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        loop {
            let line = match self.lines.next() {
                Some(Ok(line)) => line,
                Some(Err(e)) => {
                    self.finished = true;
                    return Some(Err(Error::Generic(format!("could not read script: {}", e))));
                }
                None => return self.finish(),
            };
            if line.trim() == "EOF" {
                return self.finish();
            }

            let cleaned = strip_trailing_comment(&line);
            let stripped = cleaned.trim();
            if stripped.is_empty() && self.statement.is_empty() {
                continue;
            }
            self.statement.push(cleaned.to_string());
            if stripped.eq_ignore_ascii_case("begin") {
                self.is_block = true;
            }
            if stripped.ends_with(';') && (!self.is_block || stripped.eq_ignore_ascii_case("end;"))
            {
                self.is_block = false;
                return Some(Ok(std::mem::take(&mut self.statement)));
            }
        }
    }
}

/// Open a script file and iterate over its statements.
pub fn read_clean_statements(
    path: impl AsRef<Path>,
) -> Result<CleanStatements<BufReader<File>>, Error> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| Error::io(path, e))?;
    Ok(CleanStatements::new(BufReader::new(file)))
}

/// Build a [TableDefinition] from the lines of a `create table` statement.
///
/// The first line must end with `(`; the table name is its third whitespace separated word.
pub fn tabledef_from_statement_lines(lines: Vec<String>) -> Result<TableDefinition, Error> {
    let first_line = lines
        .first()
        .ok_or_else(|| Error::Parse("empty create table statement".to_string()))?;
    let Some(head) = first_line.trim_end().strip_suffix('(') else {
        return Err(Error::Parse(format!(
            "create table line does not end with '(': {:?}",
            first_line
        )));
    };
    let name = head
        .split_whitespace()
        .nth(2)
        .ok_or_else(|| Error::Parse(format!("create table line has no table name: {:?}", first_line)))?
        .to_string();
    let column_types = ddl::column_types(&lines.join("\n"))?;
    Ok(TableDefinition {
        name,
        statement_lines: lines,
        column_types,
    })
}

/// Split off the first whitespace-separated word, returning it and the rest of the line.
fn next_word(line: &str) -> Option<(&str, &str)> {
    let line = line.trim_start();
    if line.is_empty() {
        return None;
    }
    let end = line.find(char::is_whitespace).unwrap_or(line.len());
    Some(line.split_at(end))
}

/// Table and column list of a `create triggers <table> <columns>` line.
fn trigger_header(line: &str) -> Option<(&str, &str)> {
    let (_create, rest) = next_word(line)?;
    let (_triggers, rest) = next_word(rest)?;
    let (table, rest) = next_word(rest)?;
    Some((table, rest.trim())).filter(|(_, columns)| !columns.is_empty())
}

fn triggerdef_from_statement_lines(lines: Vec<String>) -> Result<TriggerDefinition, Error> {
    let Some((table, columns)) = trigger_header(&lines[0]) else {
        return Err(Error::Parse(format!(
            "expected \"create triggers <table> <columns>\" but found {:?}",
            lines[0]
        )));
    };
    if lines.len() < 2 {
        return Err(Error::Parse(format!(
            "trigger definition for {} has no body",
            table
        )));
    }
    Ok(TriggerDefinition {
        table: table.to_string(),
        columns: columns.to_string(),
        body_lines: lines[1..].to_vec(),
    })
}

/// Parse a schema script held in memory.
pub fn parse_schema(script: &str) -> Result<TargetSchema, Error> {
    collect_schema(CleanStatements::from_str(script))
}

/// Read and classify every statement of the schema script at `path`.
pub fn read_new_schema(path: impl AsRef<Path>) -> Result<TargetSchema, Error> {
    collect_schema(read_clean_statements(path)?)
}

fn collect_schema<R: BufRead>(statements: CleanStatements<R>) -> Result<TargetSchema, Error> {
    let mut schema = TargetSchema::default();
    for statement in statements {
        schema.push(SchemaObject::from_statement_lines(statement?)?);
    }
    Ok(schema)
}
