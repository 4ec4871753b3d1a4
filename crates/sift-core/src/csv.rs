//! Incremental CSV assembly for streamed exports.
//!
//! The export pipeline feeds one decoded JSON record at a time; rows are
//! appended in arrival order and never reordered. Escaping follows RFC 4180:
//! a field containing a comma, double quote, or newline is wrapped in double
//! quotes with internal quotes doubled. Null values render as empty strings.

use crate::error::ClientError;

/// Escape a single CSV field.
pub fn escape_field(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') || value.contains('\r') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Render a JSON value as a CSV cell. Strings pass through unquoted by the
/// JSON layer; null renders empty; other values use their JSON text form.
pub fn field_from_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Builds CSV text one record at a time.
///
/// Headers come from the explicit field projection when one was requested,
/// otherwise they are inferred from the key set of the first record.
#[derive(Debug)]
pub struct CsvBuilder {
    headers: Option<Vec<String>>,
    buf: String,
    rows: u64,
}

impl CsvBuilder {
    pub fn new(fields: Option<Vec<String>>) -> Self {
        Self {
            headers: fields.filter(|f| !f.is_empty()),
            buf: String::new(),
            rows: 0,
        }
    }

    /// Number of data rows appended so far (header excluded).
    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// Append one record. The first record fixes the header row; missing
    /// keys in later records render as empty cells.
    pub fn push_record(&mut self, record: &serde_json::Value) -> Result<(), ClientError> {
        let obj = record.as_object().ok_or_else(|| {
            ClientError::InvalidResponse("export stream produced a non-object record".to_string())
        })?;

        if self.headers.is_none() {
            self.headers = Some(obj.keys().cloned().collect());
        }
        let headers = self.headers.clone().unwrap_or_default();
        if self.rows == 0 {
            self.write_row(headers.iter().map(String::as_str));
        }

        let cells: Vec<String> = headers
            .iter()
            .map(|h| obj.get(h).map(field_from_json).unwrap_or_default())
            .collect();
        self.write_row(cells.iter().map(String::as_str));
        self.rows += 1;
        Ok(())
    }

    fn write_row<'a>(&mut self, cells: impl Iterator<Item = &'a str>) {
        let mut first = true;
        for cell in cells {
            if !first {
                self.buf.push(',');
            }
            self.buf.push_str(&escape_field(cell));
            first = false;
        }
        self.buf.push('\n');
    }

    /// Final CSV text: one header row plus one row per record, in input
    /// order. With an explicit projection the header row is present even
    /// when no record ever arrived.
    pub fn finish(mut self) -> String {
        if self.rows == 0 {
            if let Some(headers) = self.headers.take() {
                self.write_row(headers.iter().map(String::as_str));
            }
        }
        self.buf
    }
}
