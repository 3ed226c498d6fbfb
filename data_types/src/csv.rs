//! CSV dialect of ingest contributions.
//!
//! The dialect travels from the ingest client through the catalog into the
//! generated `LOAD DATA` statement, so its components are validated once at
//! construction and rendered into SQL here.

use serde::{Deserialize, Serialize};
use snafu::{ensure, Snafu};

/// Errors of dialect construction.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum CsvError {
    #[snafu(display("CSV dialect component '{}' must translate to one byte, got '{}'", component, value))]
    BadComponent { component: &'static str, value: String },

    #[snafu(display("unsupported line terminator '{}'", value))]
    BadLineTerminator { value: String },
}

/// Raw dialect components as supplied by an ingest client.
///
/// Each component is a possibly escaped string (`\t`, `\\`, a single
/// character, or empty for "none"). Missing components fall back to the
/// MySQL defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialectInput {
    /// `FIELDS TERMINATED BY`
    pub fields_terminated_by: Option<String>,
    /// `FIELDS ENCLOSED BY`
    pub fields_enclosed_by: Option<String>,
    /// `FIELDS ESCAPED BY`
    pub fields_escaped_by: Option<String>,
    /// `LINES TERMINATED BY`
    pub lines_terminated_by: Option<String>,
    /// `NULL AS` marker used while preprocessing.
    pub null_marker: Option<String>,
}

/// A validated CSV dialect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsvDialect {
    /// Field delimiter.
    pub fields_terminated_by: u8,
    /// Optional field quote.
    pub fields_enclosed_by: Option<u8>,
    /// Optional escape character.
    pub fields_escaped_by: Option<u8>,
    /// Line terminator; only `\n` is supported by the reader.
    pub lines_terminated_by: u8,
    /// The textual NULL marker.
    pub null_marker: String,
}

impl Default for CsvDialect {
    fn default() -> Self {
        Self {
            fields_terminated_by: b'\t',
            fields_enclosed_by: None,
            fields_escaped_by: Some(b'\\'),
            lines_terminated_by: b'\n',
            null_marker: "\\N".to_string(),
        }
    }
}

/// Translate one escaped component into a byte. Empty means "none".
fn translate(component: &'static str, value: &str) -> Result<Option<u8>, CsvError> {
    let bytes: &[u8] = match value {
        "" => return Ok(None),
        "\\t" => b"\t",
        "\\n" => b"\n",
        "\\r" => b"\r",
        "\\\\" => b"\\",
        "\\'" => b"'",
        "\\\"" => b"\"",
        other => other.as_bytes(),
    };
    ensure!(
        bytes.len() == 1,
        BadComponentSnafu {
            component,
            value: value.to_string(),
        }
    );
    Ok(Some(bytes[0]))
}

impl CsvDialect {
    /// Validate raw components into a dialect.
    pub fn try_from_input(input: &DialectInput) -> Result<Self, CsvError> {
        let defaults = Self::default();

        let fields_terminated_by = match &input.fields_terminated_by {
            None => defaults.fields_terminated_by,
            Some(v) => translate("fields_terminated_by", v)?.ok_or_else(|| {
                CsvError::BadComponent {
                    component: "fields_terminated_by",
                    value: v.clone(),
                }
            })?,
        };
        let fields_enclosed_by = match &input.fields_enclosed_by {
            None => defaults.fields_enclosed_by,
            Some(v) => translate("fields_enclosed_by", v)?,
        };
        let fields_escaped_by = match &input.fields_escaped_by {
            None => defaults.fields_escaped_by,
            Some(v) => translate("fields_escaped_by", v)?,
        };
        let lines_terminated_by = match &input.lines_terminated_by {
            None => defaults.lines_terminated_by,
            Some(v) => {
                let byte = translate("lines_terminated_by", v)?.ok_or_else(|| {
                    CsvError::BadLineTerminator { value: v.clone() }
                })?;
                ensure!(
                    byte == b'\n',
                    BadLineTerminatorSnafu { value: v.clone() }
                );
                byte
            }
        };
        let null_marker = input
            .null_marker
            .clone()
            .unwrap_or(defaults.null_marker);

        Ok(Self {
            fields_terminated_by,
            fields_enclosed_by,
            fields_escaped_by,
            lines_terminated_by,
            null_marker,
        })
    }

    /// Render the `FIELDS ... LINES ...` options of a `LOAD DATA` statement.
    pub fn load_data_options_sql(&self) -> String {
        let mut sql = format!(
            "FIELDS TERMINATED BY {}",
            sql_char_literal(self.fields_terminated_by)
        );
        if let Some(c) = self.fields_enclosed_by {
            sql.push_str(&format!(" ENCLOSED BY {}", sql_char_literal(c)));
        }
        if let Some(c) = self.fields_escaped_by {
            sql.push_str(&format!(" ESCAPED BY {}", sql_char_literal(c)));
        }
        sql.push_str(&format!(
            " LINES TERMINATED BY {}",
            sql_char_literal(self.lines_terminated_by)
        ));
        sql
    }
}

/// A single-character MySQL string literal with the usual escapes.
fn sql_char_literal(byte: u8) -> String {
    match byte {
        b'\t' => "'\\t'".to_string(),
        b'\n' => "'\\n'".to_string(),
        b'\r' => "'\\r'".to_string(),
        b'\\' => "'\\\\'".to_string(),
        b'\'' => "'\\''".to_string(),
        other => format!("'{}'", other as char),
    }
}
