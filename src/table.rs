//! Tabular plumbing shared by the transformation and validation engines.
//!
//! Tables are polars `DataFrame`s at the edges. Rule logic works on one
//! column at a time as a `Vec<Cell>`, which tolerates the mixed-type columns
//! that mapping rules routinely produce.

use crate::error::{QaError, Result};
use polars::prelude::*;
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::path::Path;
use tracing::info;

/// A single scalar value.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

/// Kind of a non-missing cell, as reported by type-based rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CellKind {
    Bool,
    Int,
    Float,
    Str,
}

impl CellKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CellKind::Bool => "bool",
            CellKind::Int => "int",
            CellKind::Float => "float",
            CellKind::Str => "str",
        }
    }
}

impl Cell {
    pub fn str(value: impl Into<String>) -> Self {
        Cell::Str(value.into())
    }

    /// Null and NaN both count as missing.
    pub fn is_missing(&self) -> bool {
        match self {
            Cell::Null => true,
            Cell::Float(v) => v.is_nan(),
            _ => false,
        }
    }

    pub fn kind(&self) -> Option<CellKind> {
        match self {
            _ if self.is_missing() => None,
            Cell::Bool(_) => Some(CellKind::Bool),
            Cell::Int(_) => Some(CellKind::Int),
            Cell::Float(_) => Some(CellKind::Float),
            Cell::Str(_) => Some(CellKind::Str),
            Cell::Null => None,
        }
    }

    /// Text rendering of a present value; `None` when missing.
    pub fn text(&self) -> Option<String> {
        if self.is_missing() {
            None
        } else {
            Some(self.to_string())
        }
    }

    /// Numeric view: numbers as-is, strings only when they parse cleanly.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Cell::Int(v) => Some(*v as f64),
            Cell::Float(v) if !v.is_nan() => Some(*v),
            Cell::Str(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
            _ => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Cell::Int(_)) || matches!(self, Cell::Float(v) if !v.is_nan())
    }

    pub fn truthy(&self) -> bool {
        match self {
            Cell::Null => false,
            Cell::Bool(b) => *b,
            Cell::Int(v) => *v != 0,
            Cell::Float(v) => !v.is_nan() && *v != 0.0,
            Cell::Str(s) => !s.is_empty(),
        }
    }

    pub fn from_any_value(value: AnyValue<'_>) -> Self {
        match value {
            AnyValue::Null => Cell::Null,
            AnyValue::Boolean(b) => Cell::Bool(b),
            AnyValue::String(s) => Cell::Str(s.to_string()),
            AnyValue::StringOwned(s) => Cell::Str(s.to_string()),
            AnyValue::Int32(v) => Cell::Int(v as i64),
            AnyValue::Int64(v) => Cell::Int(v),
            AnyValue::UInt32(v) => Cell::Int(v as i64),
            AnyValue::UInt64(v) => i64::try_from(v).map_or(Cell::Float(v as f64), Cell::Int),
            AnyValue::Float32(v) => Cell::Float(v as f64),
            AnyValue::Float64(v) => Cell::Float(v),
            other => Cell::Str(other.to_string()),
        }
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cell::Null => Ok(()),
            Cell::Bool(b) => write!(f, "{}", if *b { "True" } else { "False" }),
            Cell::Int(v) => write!(f, "{}", v),
            Cell::Float(v) if v.is_nan() => Ok(()),
            Cell::Float(v) if v.fract() == 0.0 && v.abs() < 1e15 => write!(f, "{:.1}", v),
            Cell::Float(v) => write!(f, "{}", v),
            Cell::Str(s) => write!(f, "{}", s),
        }
    }
}

/// Read one column of `df` as cells.
pub fn column_cells(df: &DataFrame, name: &str) -> Result<Vec<Cell>> {
    let series = df.column(name)?;
    series_cells(series)
}

pub fn series_cells(series: &Series) -> Result<Vec<Cell>> {
    let mut cells = Vec::with_capacity(series.len());
    for idx in 0..series.len() {
        cells.push(Cell::from_any_value(series.get(idx)?));
    }
    Ok(cells)
}

/// Build a series, picking the narrowest dtype that holds every present cell.
/// Columns mixing text with other kinds become string columns.
pub fn series_from_cells(name: &str, cells: &[Cell]) -> Series {
    let kinds: Vec<CellKind> = cells.iter().filter_map(|c| c.kind()).collect();
    let all = |k: CellKind| kinds.iter().all(|kind| *kind == k);

    if !kinds.is_empty() && all(CellKind::Int) {
        let values: Vec<Option<i64>> = cells
            .iter()
            .map(|c| match c {
                Cell::Int(v) => Some(*v),
                _ => None,
            })
            .collect();
        Series::new(name, values)
    } else if !kinds.is_empty()
        && kinds.iter().all(|k| matches!(k, CellKind::Int | CellKind::Float))
    {
        let values: Vec<Option<f64>> = cells
            .iter()
            .map(|c| if c.is_missing() { None } else { c.as_f64() })
            .collect();
        Series::new(name, values)
    } else if !kinds.is_empty() && all(CellKind::Bool) {
        let values: Vec<Option<bool>> = cells
            .iter()
            .map(|c| match c {
                Cell::Bool(b) => Some(*b),
                _ => None,
            })
            .collect();
        Series::new(name, values)
    } else {
        let values: Vec<Option<String>> = cells.iter().map(|c| c.text()).collect();
        Series::new(name, values)
    }
}

/// Ordered, name-addressed set of cell columns of equal height.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Columns {
    order: Vec<String>,
    data: HashMap<String, Vec<Cell>>,
    height: usize,
}

impl Columns {
    pub fn with_height(height: usize) -> Self {
        Self {
            order: Vec::new(),
            data: HashMap::new(),
            height,
        }
    }

    pub fn from_frame(df: &DataFrame) -> Result<Self> {
        let mut columns = Self::with_height(df.height());
        for name in df.get_column_names() {
            let cells = column_cells(df, name)?;
            columns.insert(name, cells)?;
        }
        Ok(columns)
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn names(&self) -> &[String] {
        &self.order
    }

    pub fn contains(&self, name: &str) -> bool {
        self.data.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&[Cell]> {
        self.data.get(name).map(|v| v.as_slice())
    }

    /// Insert or overwrite a column. Overwriting keeps the original position.
    pub fn insert(&mut self, name: &str, cells: Vec<Cell>) -> Result<()> {
        if cells.len() != self.height {
            return Err(QaError::Table(format!(
                "column '{}' has {} values, table has {} rows",
                name,
                cells.len(),
                self.height
            )));
        }
        if !self.data.contains_key(name) {
            self.order.push(name.to_string());
        }
        self.data.insert(name.to_string(), cells);
        Ok(())
    }

    /// Row `idx` across all columns, in column order.
    pub fn row(&self, idx: usize) -> Vec<&Cell> {
        self.order
            .iter()
            .filter_map(|name| self.data.get(name).and_then(|cells| cells.get(idx)))
            .collect()
    }

    /// Keep only the rows at `indices`, in the given order.
    pub fn select_rows(&self, indices: &[usize]) -> Result<Self> {
        let mut out = Self::with_height(indices.len());
        for name in &self.order {
            let Some(cells) = self.data.get(name) else { continue };
            let picked = indices
                .iter()
                .map(|idx| {
                    cells.get(*idx).cloned().ok_or_else(|| {
                        QaError::Table(format!("row {} out of range for '{}'", idx, name))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            out.insert(name, picked)?;
        }
        Ok(out)
    }

    /// Build a frame holding `names` in the given order; absent names become all-null columns.
    pub fn to_frame(&self, names: &[String]) -> Result<DataFrame> {
        let nulls = vec![Cell::Null; self.height];
        let series: Vec<Series> = names
            .iter()
            .map(|name| {
                let cells = self.data.get(name).unwrap_or(&nulls);
                series_from_cells(name, cells)
            })
            .collect();
        Ok(DataFrame::new(series)?)
    }

    pub fn into_frame(self) -> Result<DataFrame> {
        let names = self.order.clone();
        self.to_frame(&names)
    }
}

/// Load a source table from CSV or Parquet, chosen by file extension.
pub fn load_table(path: &Path) -> Result<DataFrame> {
    if !path.exists() {
        return Err(QaError::Table(format!("Table file not found: {}", path.display())));
    }

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();

    let df = match extension.as_str() {
        "parquet" => LazyFrame::scan_parquet(path, ScanArgsParquet::default())
            .and_then(|lf| lf.collect())
            .map_err(|e| QaError::Table(format!("Failed to load {}: {}", path.display(), e)))?,
        "csv" | "txt" => LazyCsvReader::new(path)
            .with_infer_schema_length(Some(1000))
            .finish()
            .and_then(|lf| lf.collect())
            .map_err(|e| QaError::Table(format!("Failed to load {}: {}", path.display(), e)))?,
        other => {
            return Err(QaError::Table(format!(
                "Unsupported table format '{}' for {}",
                other,
                path.display()
            )))
        }
    };

    info!("Loaded {} rows x {} columns from {}", df.height(), df.width(), path.display());
    Ok(df)
}

pub fn write_csv(df: &mut DataFrame, path: &Path) -> Result<()> {
    let mut file = File::create(path)?;
    CsvWriter::new(&mut file)
        .include_header(true)
        .finish(df)
        .map_err(|e| QaError::Table(format!("Failed to write {}: {}", path.display(), e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_keeps_types() {
        let df = df! [
            "id" => [1i64, 2, 3],
            "score" => [Some(1.5), None, Some(2.0)],
            "name" => [Some("a"), Some("b"), None]
        ]
        .unwrap();

        let columns = Columns::from_frame(&df).unwrap();
        assert_eq!(columns.names(), &["id", "score", "name"]);
        assert_eq!(columns.get("score").unwrap()[1], Cell::Null);
        assert_eq!(columns.get("name").unwrap()[0], Cell::str("a"));

        let back = columns.into_frame().unwrap();
        assert_eq!(back.column("id").unwrap().dtype(), &DataType::Int64);
        assert_eq!(back.column("score").unwrap().dtype(), &DataType::Float64);
        assert_eq!(back.column("name").unwrap().dtype(), &DataType::String);
    }

    #[test]
    fn test_large_unsigned_values_do_not_wrap() {
        assert_eq!(Cell::from_any_value(AnyValue::UInt64(7)), Cell::Int(7));
        assert_eq!(
            Cell::from_any_value(AnyValue::UInt64(u64::MAX)),
            Cell::Float(u64::MAX as f64)
        );

        let df = df! [ "big" => [1u64, u64::MAX] ].unwrap();
        let columns = Columns::from_frame(&df).unwrap();
        assert_eq!(columns.get("big").unwrap()[1], Cell::Float(u64::MAX as f64));
    }

    #[test]
    fn test_mixed_column_becomes_text() {
        let cells = vec![Cell::Int(5), Cell::str("Unknown"), Cell::Null];
        let series = series_from_cells("age", &cells);
        assert_eq!(series.dtype(), &DataType::String);
        assert_eq!(series.null_count(), 1);
    }

    #[test]
    fn test_missing_and_text_rendering() {
        assert!(Cell::Float(f64::NAN).is_missing());
        assert!(Cell::Null.is_missing());
        assert_eq!(Cell::Float(5.0).to_string(), "5.0");
        assert_eq!(Cell::Int(42).text().as_deref(), Some("42"));
        assert_eq!(Cell::Null.text(), None);
        assert_eq!(Cell::str(" 12.5 ").as_f64(), Some(12.5));
    }

    #[test]
    fn test_insert_rejects_wrong_height() {
        let mut columns = Columns::with_height(2);
        assert!(columns.insert("a", vec![Cell::Int(1)]).is_err());
        columns.insert("a", vec![Cell::Int(1), Cell::Int(2)]).unwrap();
        columns.insert("b", vec![Cell::Null, Cell::Null]).unwrap();
        columns.insert("a", vec![Cell::Int(3), Cell::Int(4)]).unwrap();
        assert_eq!(columns.names(), &["a", "b"]);
        assert_eq!(columns.get("a").unwrap()[0], Cell::Int(3));

        let picked = columns.select_rows(&[1]).unwrap();
        assert_eq!(picked.height(), 1);
        assert_eq!(picked.row(0), vec![&Cell::Int(4), &Cell::Null]);
        assert!(columns.select_rows(&[5]).is_err());
    }
}
