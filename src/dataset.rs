use chrono::{Duration, NaiveDateTime};
use std::error::Error;
use std::fmt;
use std::fs::File;
use std::io::Read;

use crate::error::LoadError;

/// One cell of a dataset.  CSV cells are typed by inference when the file is
/// read; an empty cell or a NaN is the null marker.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    fn parse(cell: &str) -> Value {
        if cell.is_empty() {
            return Value::Null;
        }
        if let Ok(i) = cell.parse::<i64>() {
            return Value::Int(i);
        }
        if let Ok(x) = cell.parse::<f64>() {
            // NaN plays the role of null in the source files; only the
            // infinities are kept and dealt with at load time.
            if x.is_nan() {
                return Value::Null;
            }
            return Value::Float(x);
        }
        Value::Text(cell.to_string())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, ""),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Text(s) => write!(f, "{}", s),
        }
    }
}

/// In-memory tabular structure for one dataset: ordered rows, named columns.
/// One dataset corresponds 1:1 with one measurement table in the store.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub name: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl Dataset {
    /// Read the CSV file for a dataset name.
    pub fn from_csv_path(name: &str, path: &str) -> Result<Dataset, Box<dyn Error>> {
        let mut file = File::open(path)?;
        let mut buffer = String::new();
        file.read_to_string(&mut buffer)?;
        Dataset::from_reader(name, buffer.as_bytes())
    }

    pub fn from_reader<R: Read>(name: &str, reader: R) -> Result<Dataset, Box<dyn Error>> {
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_reader(reader);
        let columns: Vec<String> = rdr
            .headers()?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();
        let mut rows: Vec<Vec<Value>> = Vec::new();
        for record in rdr.records() {
            let record = record?;
            rows.push(record.iter().map(|cell| Value::parse(cell.trim())).collect());
        }
        Ok(Dataset {
            name: name.to_string(),
            columns,
            rows,
        })
    }

    /// Name of the target table in the store.
    pub fn table_name(&self) -> String {
        self.name.to_lowercase()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// The store rejects 'inf' and '-inf' values, so before a retry they are
    /// replaced with null.  Everything else passes through unchanged; the
    /// shape of the dataset is preserved and the operation is idempotent.
    pub fn sanitized(&self) -> Dataset {
        let rows = self
            .rows
            .iter()
            .map(|row| {
                row.iter()
                    .map(|v| match v {
                        Value::Float(x) if x.is_infinite() => Value::Null,
                        other => other.clone(),
                    })
                    .collect()
            })
            .collect();
        Dataset {
            name: self.name.clone(),
            columns: self.columns.clone(),
            rows,
        }
    }

    /// Parse the `h` column into 0-based hour offsets.  A label is one
    /// prefix character followed by a 1-based hour number, e.g. "H1" is
    /// offset 0.  Anything else is a fatal input error for the dataset.
    pub fn hour_offsets(&self) -> Result<Vec<i64>, LoadError> {
        let h = self
            .column_index("h")
            .ok_or_else(|| LoadError::MalformedInput {
                table: self.table_name(),
                value: "missing column h".to_string(),
            })?;
        let mut offsets = Vec::with_capacity(self.rows.len());
        for row in &self.rows {
            let label = match &row[h] {
                Value::Text(s) => s.as_str(),
                other => {
                    return Err(LoadError::MalformedInput {
                        table: self.table_name(),
                        value: other.to_string(),
                    })
                }
            };
            offsets.push(parse_hour_label(label).ok_or_else(|| {
                LoadError::MalformedInput {
                    table: self.table_name(),
                    value: label.to_string(),
                }
            })?);
        }
        Ok(offsets)
    }
}

fn parse_hour_label(label: &str) -> Option<i64> {
    let mut chars = label.chars();
    chars.next()?;
    let hour: i64 = chars.as_str().parse().ok()?;
    if hour < 1 {
        return None;
    }
    Some(hour - 1)
}

/// One derived timestamp per row: analysis start time plus the row's hour
/// offset.  Order-preserving; the result has exactly one entry per row.
/// An offset that overflows the representable timestamp range is as fatal
/// for the dataset as an unparseable label.
pub fn derive_hour_timestamps(
    dataset: &Dataset,
    start: NaiveDateTime,
) -> Result<Vec<NaiveDateTime>, LoadError> {
    let offsets = dataset.hour_offsets()?;
    let mut stamps = Vec::with_capacity(offsets.len());
    for hours in offsets {
        let stamp = Duration::try_hours(hours)
            .and_then(|d| start.checked_add_signed(d))
            .ok_or_else(|| LoadError::MalformedInput {
                table: dataset.table_name(),
                value: format!("hour offset {} out of range", hours),
            })?;
        stamps.push(stamp);
    }
    Ok(stamps)
}
