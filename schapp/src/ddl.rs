//! Token-level helpers for the DDL found in schema scripts.
//!
//! Column extraction and trigger body rewriting both work on the token stream produced by
//! `sqlparser`'s SQLite tokenizer, so string literals, quoted identifiers and comments are
//! never mistaken for column names or keywords.

use crate::error::Error;
use indexmap::IndexMap;
use sqlparser::dialect::SQLiteDialect;
use sqlparser::tokenizer::{Location, Token, Tokenizer, Word};

/// Leading keywords of a table constraint item inside `create table (...)`.
const TABLE_CONSTRAINT_KEYWORDS: &[&str] = &["CONSTRAINT", "PRIMARY", "UNIQUE", "CHECK", "FOREIGN"];

/// Keywords that end a column's type and start its constraints.
const COLUMN_CONSTRAINT_KEYWORDS: &[&str] = &[
    "CONSTRAINT",
    "PRIMARY",
    "NOT",
    "NULL",
    "UNIQUE",
    "CHECK",
    "DEFAULT",
    "COLLATE",
    "REFERENCES",
    "GENERATED",
    "AS",
];

fn tokenize(sql: &str) -> Result<Vec<Token>, Error> {
    let dialect = SQLiteDialect {};
    Tokenizer::new(&dialect, sql)
        .tokenize()
        .map_err(|e| Error::Parse(format!("could not tokenize {:?}: {}", sql, e)))
}

fn is_keyword(word: &Word, keywords: &[&str]) -> bool {
    word.quote_style.is_none()
        && keywords
            .iter()
            .any(|keyword| word.value.eq_ignore_ascii_case(keyword))
}

/// Quote an identifier for use in generated SQL.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Extract `column name -> declared type` from a `create table` statement, in declaration order.
///
/// Only the items of the outermost parenthesised list are considered. Table constraints are
/// skipped, and a column declared without a type maps to an empty string.
pub(crate) fn column_types(statement: &str) -> Result<IndexMap<String, String>, Error> {
    let tokens = tokenize(statement)?;
    let mut items: Vec<Vec<&Token>> = Vec::new();
    let mut current: Vec<&Token> = Vec::new();
    let mut depth = 0usize;
    let mut closed = false;

    for token in tokens.iter().filter(|t| !matches!(t, Token::Whitespace(_))) {
        if depth == 0 {
            if *token == Token::LParen {
                depth = 1;
            }
            continue;
        }
        match token {
            Token::LParen => {
                depth += 1;
                current.push(token);
            }
            Token::RParen => {
                depth -= 1;
                if depth == 0 {
                    items.push(std::mem::take(&mut current));
                    closed = true;
                    break;
                }
                current.push(token);
            }
            Token::Comma if depth == 1 => items.push(std::mem::take(&mut current)),
            _ => current.push(token),
        }
    }
    if !closed {
        return Err(Error::Parse(format!(
            "unbalanced parentheses in table definition: {}",
            statement
        )));
    }

    let mut columns = IndexMap::new();
    for item in items {
        let Some((first, rest)) = item.split_first() else {
            continue;
        };
        let Token::Word(name) = first else {
            return Err(Error::Parse(format!(
                "expected a column name but found '{}' in table definition: {}",
                first, statement
            )));
        };
        if is_keyword(name, TABLE_CONSTRAINT_KEYWORDS) {
            continue;
        }

        let mut type_name = String::new();
        let mut previous_was_word = false;
        for token in rest {
            match token {
                Token::Word(word) if is_keyword(word, COLUMN_CONSTRAINT_KEYWORDS) => break,
                Token::Word(word) => {
                    if previous_was_word {
                        type_name.push(' ');
                    }
                    type_name.push_str(&word.value);
                    previous_was_word = true;
                }
                other => {
                    type_name.push_str(&other.to_string());
                    previous_was_word = false;
                }
            }
        }

        if columns
            .insert(name.value.clone(), type_name)
            .is_some()
        {
            return Err(Error::Parse(format!(
                "duplicate column '{}' in table definition: {}",
                name.value, statement
            )));
        }
    }
    Ok(columns)
}

/// Tokens of `sql` together with the source text each one was read from.
///
/// Literals and quoted identifiers come out of the tokenizer unescaped, so SQL that has to be
/// executed again is assembled from these slices rather than from the tokens.
fn tokens_with_source(sql: &str) -> Result<Vec<(Token, &str)>, Error> {
    let dialect = SQLiteDialect {};
    let tokens = Tokenizer::new(&dialect, sql)
        .tokenize_with_location()
        .map_err(|e| Error::Parse(format!("could not tokenize {:?}: {}", sql, e)))?;

    let line_starts: Vec<usize> = std::iter::once(0)
        .chain(sql.match_indices('\n').map(|(i, _)| i + 1))
        .collect();
    // locations are 1-based lines and character columns
    let offset = |location: Location| -> usize {
        let Some(&line_start) = line_starts.get((location.line as usize).saturating_sub(1)) else {
            return sql.len();
        };
        sql[line_start..]
            .char_indices()
            .nth((location.column as usize).saturating_sub(1))
            .map_or(sql.len(), |(i, _)| line_start + i)
    };

    let starts: Vec<usize> = tokens.iter().map(|t| offset(t.span.start)).collect();
    let mut result = Vec::with_capacity(tokens.len());
    for (i, token) in tokens.into_iter().enumerate() {
        let end = starts.get(i + 1).copied().unwrap_or(sql.len());
        let source = sql.get(starts[i]..end).ok_or_else(|| {
            Error::Parse(format!("could not locate token {} in {:?}", token.token, sql))
        })?;
        result.push((token.token, source));
    }
    Ok(result)
}

/// Rewrite a trigger body so it can run outside of a row trigger on `table`.
///
/// `OLD.`/`NEW.` qualifiers are replaced by the table itself and every `from` gets the table
/// joined in front of its sources, so evaluating the body once checks every existing row.
/// Everything else is copied from `body` unchanged.
pub(crate) fn rewrite_trigger_body(body: &str, table: &str) -> Result<String, Error> {
    let tokens = tokens_with_source(body)?;
    let table = quote_ident(table);
    let mut rewritten = String::with_capacity(body.len() + table.len());

    for (i, (token, source)) in tokens.iter().enumerate() {
        match token {
            Token::Word(word)
                if is_keyword(word, &["OLD", "NEW"])
                    && matches!(tokens.get(i + 1), Some((Token::Period, _))) =>
            {
                rewritten.push_str(&table);
            }
            Token::Word(word) if is_keyword(word, &["FROM"]) => {
                rewritten.push_str(source);
                rewritten.push(' ');
                rewritten.push_str(&table);
                rewritten.push(',');
            }
            _ => rewritten.push_str(source),
        }
    }
    Ok(rewritten)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn types(sql: &str) -> Vec<(String, String)> {
        column_types(sql).unwrap().into_iter().collect()
    }

    #[test]
    fn simple_columns() {
        assert_eq!(
            types("create table T(\n   hello int,\n   world text not null);"),
            vec![
                ("hello".to_string(), "int".to_string()),
                ("world".to_string(), "text".to_string())
            ]
        );
    }

    #[test]
    fn table_constraints_are_not_columns() {
        let sql = "create table _database_version(\n  current_version text not null,\n  constraint only_one_row check(rowid==1));";
        assert_eq!(
            types(sql),
            vec![("current_version".to_string(), "text".to_string())]
        );

        let sql = "create table pairs(\n  a int,\n  b int,\n  primary key(a, b),\n  unique(b),\n  foreign key(a) references other(id));";
        assert_eq!(
            types(sql),
            vec![
                ("a".to_string(), "int".to_string()),
                ("b".to_string(), "int".to_string())
            ]
        );
    }

    #[test]
    fn multi_token_types_and_missing_types() {
        let sql = "create table t(\n  price decimal(10, 2) default 0,\n  big unsigned big int,\n  name varchar(20) references names(name),\n  anything);";
        assert_eq!(
            types(sql),
            vec![
                ("price".to_string(), "decimal(10,2)".to_string()),
                ("big".to_string(), "unsigned big int".to_string()),
                ("name".to_string(), "varchar(20)".to_string()),
                ("anything".to_string(), "".to_string()),
            ]
        );
    }

    #[test]
    fn quoted_identifiers_and_comments() {
        let sql = "create table t(\n  \"select\" text, -- a, b int\n  [order] int /* c int, */\n);";
        assert_eq!(
            types(sql),
            vec![
                ("select".to_string(), "text".to_string()),
                ("order".to_string(), "int".to_string())
            ]
        );
    }

    #[test]
    fn duplicate_column_is_rejected() {
        let err = column_types("create table t(\n  a int,\n  a text);").unwrap_err();
        assert!(matches!(err, Error::Parse(msg) if msg.contains("duplicate column 'a'")));
    }

    #[test]
    fn unbalanced_parentheses_are_rejected() {
        let err = column_types("create table t(\n  a int,\n  b text;").unwrap_err();
        assert!(matches!(err, Error::Parse(msg) if msg.contains("unbalanced")));
    }

    #[test]
    fn trigger_body_rewrite() {
        let body = "begin\n  select raise(abort, 'no parent for NEW.p')\n  from parent\n  where parent.id = NEW.parent_id and OLD.x is null;\nend;";
        let rewritten = rewrite_trigger_body(body, "child").unwrap();
        assert_eq!(
            rewritten,
            "begin\n  select raise(abort, 'no parent for NEW.p')\n  from \"child\", parent\n  where parent.id = \"child\".parent_id and \"child\".x is null;\nend;"
        );
    }

    #[test]
    fn trigger_body_rewrite_ignores_columns_named_like_keywords() {
        let body = "select \"from\", new_value from t where t.new = 1;";
        let rewritten = rewrite_trigger_body(body, "x").unwrap();
        assert_eq!(
            rewritten,
            "select \"from\", new_value from \"x\", t where t.new = 1;"
        );
    }

    #[test]
    fn trigger_body_rewrite_keeps_escaped_quotes() {
        let body = "begin\n  select raise(abort, 'c1 can''t exceed c2')\n  from (select 1)\n  where NEW.\"we\"\"ird\" >= NEW.c2;\nend;";
        let rewritten = rewrite_trigger_body(body, "t").unwrap();
        assert_eq!(
            rewritten,
            "begin\n  select raise(abort, 'c1 can''t exceed c2')\n  from \"t\", (select 1)\n  where \"t\".\"we\"\"ird\" >= \"t\".c2;\nend;"
        );
    }

    #[test]
    fn quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("plain"), "\"plain\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }
}
