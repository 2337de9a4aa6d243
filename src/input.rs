//! Name list loader.
//!
//! Each record holds one name in its first field. Fields are separated by `;`
//! and may be wrapped in single quotes so that a name can itself contain `;`.
//! A doubled quote inside a quoted field is a literal quote. Records end at a
//! newline outside of quotes.

use crate::inventory::EntityKind;
use crate::{ChurnError, Result, log_debug, log_warn};
use std::fs;
use std::path::Path;

const DELIMITER: char = ';';
const QUOTE: char = '\'';

/// Read a name list from disk. A missing file is fatal; bad records are not.
pub fn load_names(path: &Path, kind: EntityKind) -> Result<Vec<String>> {
    if !path.is_file() {
        return Err(ChurnError::InputNotFound(path.to_path_buf()));
    }

    log_debug!("Parsing {} list {}", kind, path.display());
    let contents = fs::read_to_string(path)?;
    Ok(parse_names(&contents, kind))
}

pub fn parse_names(contents: &str, kind: EntityKind) -> Vec<String> {
    let mut names = Vec::new();

    for (index, record) in split_records(contents).into_iter().enumerate() {
        let line = index + 1;
        match record {
            Ok(fields) if fields.iter().all(|f| f.trim().is_empty()) && fields.len() == 1 => {}
            Ok(fields) => {
                log_debug!("Found record {}: {}", line, fields.join(","));
                match fields.first().map(|f| f.trim()) {
                    Some(name) if !name.is_empty() => names.push(name.to_string()),
                    _ => log_warn!("No {} name specified on record {}, skipping", kind, line),
                }
            }
            Err(reason) => {
                log_warn!("Malformed {} record {}: {}, skipping", kind, line, reason);
            }
        }
    }

    names
}

type Record = std::result::Result<Vec<String>, &'static str>;

fn split_records(contents: &str) -> Vec<Record> {
    let mut records = Vec::new();
    let mut fields: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = contents.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            if c == QUOTE {
                if chars.peek() == Some(&QUOTE) {
                    field.push(QUOTE);
                    chars.next();
                } else {
                    in_quotes = false;
                }
            } else {
                field.push(c);
            }
            continue;
        }

        match c {
            QUOTE => in_quotes = true,
            DELIMITER => fields.push(std::mem::take(&mut field)),
            '\r' => {}
            '\n' => {
                fields.push(std::mem::take(&mut field));
                records.push(Ok(std::mem::take(&mut fields)));
            }
            _ => field.push(c),
        }
    }

    if in_quotes {
        records.push(Err("unterminated quote"));
    } else if !field.is_empty() || !fields.is_empty() {
        fields.push(field);
        records.push(Ok(fields));
    }

    records
}
