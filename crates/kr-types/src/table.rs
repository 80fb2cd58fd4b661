//! Flat numeric tables with labelled rows, used for group results and costs.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::io::Write;
use std::path::Path;

use crate::errors::KrResult;
use crate::internal_error;

/// Column-named table of `f64` values with one label per row.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DataTable {
    columns: Vec<String>,
    labels: Vec<String>,
    rows: Vec<Vec<f64>>,
}

impl DataTable {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            labels: Vec::new(),
            rows: Vec::new(),
        }
    }

    /// Table with one all-NaN row per label.
    pub fn with_nan_rows(columns: Vec<String>, labels: Vec<String>) -> Self {
        let rows = vec![vec![f64::NAN; columns.len()]; labels.len()];
        Self {
            columns,
            labels,
            rows,
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn row(&self, index: usize) -> Option<&[f64]> {
        self.rows.get(index).map(|r| r.as_slice())
    }

    pub fn push_row(&mut self, label: impl Into<String>, values: Vec<f64>) -> KrResult<()> {
        if values.len() != self.columns.len() {
            return Err(internal_error!(
                "Row has {} value(s), table has {} column(s)",
                values.len(),
                self.columns.len()
            ));
        }
        self.labels.push(label.into());
        self.rows.push(values);
        Ok(())
    }

    pub fn get(&self, row: usize, column: &str) -> Option<f64> {
        let col = self.column_index(column)?;
        self.rows.get(row).map(|r| r[col])
    }

    pub fn set(&mut self, row: usize, column: &str, value: f64) -> KrResult<()> {
        let col = self
            .column_index(column)
            .ok_or_else(|| internal_error!("Unknown column '{}'", column))?;
        let cells = self
            .rows
            .get_mut(row)
            .ok_or_else(|| internal_error!("Row {} out of range", row))?;
        cells[col] = value;
        Ok(())
    }

    /// Overwrite a whole row, keyed by position.
    pub fn set_row(&mut self, row: usize, values: Vec<f64>) -> KrResult<()> {
        if values.len() != self.columns.len() {
            return Err(internal_error!("Row width mismatch"));
        }
        let cells = self
            .rows
            .get_mut(row)
            .ok_or_else(|| internal_error!("Row {} out of range", row))?;
        *cells = values;
        Ok(())
    }

    pub fn column(&self, name: &str) -> Option<Vec<f64>> {
        let col = self.column_index(name)?;
        Some(self.rows.iter().map(|r| r[col]).collect())
    }

    /// Append a column, one value per existing row.
    pub fn add_column(&mut self, name: impl Into<String>, values: Vec<f64>) -> KrResult<()> {
        if values.len() != self.rows.len() {
            return Err(internal_error!(
                "Column has {} value(s), table has {} row(s)",
                values.len(),
                self.rows.len()
            ));
        }
        self.columns.push(name.into());
        for (row, value) in self.rows.iter_mut().zip(values) {
            row.push(value);
        }
        Ok(())
    }

    /// Row with the smallest non-NaN value in `column`; first wins on ties.
    pub fn argmin(&self, column: &str) -> Option<usize> {
        let col = self.column_index(column)?;
        self.rows
            .iter()
            .enumerate()
            .filter(|(_, r)| !r[col].is_nan())
            .fold(None, |best: Option<(usize, f64)>, (i, r)| match best {
                Some((_, v)) if v <= r[col] => best,
                _ => Some((i, r[col])),
            })
            .map(|(i, _)| i)
    }

    /// Row order sorting `column` ascending, NaN last, stable.
    pub fn sort_order(&self, column: &str) -> KrResult<Vec<usize>> {
        let col = self
            .column_index(column)
            .ok_or_else(|| internal_error!("Unknown column '{}'", column))?;
        let mut order: Vec<usize> = (0..self.rows.len()).collect();
        order.sort_by(|&a, &b| nan_last_cmp(self.rows[a][col], self.rows[b][col]));
        Ok(order)
    }

    pub fn sorted_by(&self, column: &str) -> KrResult<DataTable> {
        let order = self.sort_order(column)?;
        Ok(Self {
            columns: self.columns.clone(),
            labels: order.iter().map(|&i| self.labels[i].clone()).collect(),
            rows: order.iter().map(|&i| self.rows[i].clone()).collect(),
        })
    }

    /// Projection onto `columns`, in the given order.
    pub fn select(&self, columns: &[String]) -> KrResult<DataTable> {
        let idx: Vec<usize> = columns
            .iter()
            .map(|c| {
                self.column_index(c)
                    .ok_or_else(|| internal_error!("Unknown column '{}'", c))
            })
            .collect::<KrResult<_>>()?;
        Ok(Self {
            columns: columns.to_vec(),
            labels: self.labels.clone(),
            rows: self
                .rows
                .iter()
                .map(|r| idx.iter().map(|&i| r[i]).collect())
                .collect(),
        })
    }

    /// Stack tables vertically over the union of their columns, NaN-filling gaps.
    pub fn concat<'a>(tables: impl IntoIterator<Item = &'a DataTable>) -> DataTable {
        let tables: Vec<&DataTable> = tables.into_iter().collect();
        let mut columns: Vec<String> = Vec::new();
        for table in &tables {
            for c in &table.columns {
                if !columns.contains(c) {
                    columns.push(c.clone());
                }
            }
        }

        let mut out = DataTable::new(columns);
        for table in tables {
            let mapping: Vec<Option<usize>> =
                out.columns.iter().map(|c| table.column_index(c)).collect();
            for (label, row) in table.labels.iter().zip(&table.rows) {
                out.labels.push(label.clone());
                out.rows.push(
                    mapping
                        .iter()
                        .map(|m| m.map(|i| row[i]).unwrap_or(f64::NAN))
                        .collect(),
                );
            }
        }
        out
    }

    /// Write as CSV with a leading label column. NaN cells are left empty.
    pub fn write_csv_to<W: Write>(&self, writer: W, label_header: &str) -> KrResult<()> {
        let mut wtr = csv::Writer::from_writer(writer);
        let mut header = vec![label_header.to_string()];
        header.extend(self.columns.iter().cloned());
        wtr.write_record(&header)?;

        for (label, row) in self.labels.iter().zip(&self.rows) {
            let mut record = vec![label.clone()];
            record.extend(row.iter().map(|v| {
                if v.is_nan() {
                    String::new()
                } else {
                    v.to_string()
                }
            }));
            wtr.write_record(&record)?;
        }
        wtr.flush()?;
        Ok(())
    }

    pub fn write_csv(&self, path: &Path, label_header: &str) -> KrResult<()> {
        let file = std::fs::File::create(path)?;
        self.write_csv_to(file, label_header)
    }
}

/// Ascending order with NaN after every number.
pub fn nan_last_cmp(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> DataTable {
        let mut t = DataTable::new(vec!["x".into(), "cost".into()]);
        t.push_row("Sim 0", vec![1.0, 3.0]).unwrap();
        t.push_row("Sim 1", vec![2.0, f64::NAN]).unwrap();
        t.push_row("Sim 2", vec![3.0, 1.0]).unwrap();
        t.push_row("Sim 3", vec![4.0, 1.0]).unwrap();
        t
    }

    #[test]
    fn argmin_skips_nan_and_keeps_first_tie() {
        assert_eq!(table().argmin("cost"), Some(2));
        assert_eq!(table().argmin("missing"), None);

        let all_nan = DataTable::with_nan_rows(vec!["c".into()], vec!["a".into(), "b".into()]);
        assert_eq!(all_nan.argmin("c"), None);
    }

    #[test]
    fn sorted_by_puts_nan_last() {
        let sorted = table().sorted_by("cost").unwrap();
        assert_eq!(sorted.labels(), &["Sim 2", "Sim 3", "Sim 0", "Sim 1"]);
    }

    #[test]
    fn push_row_rejects_wrong_width() {
        let mut t = table();
        assert!(t.push_row("bad", vec![1.0]).is_err());
        assert_eq!(t.num_rows(), 4);
    }

    #[test]
    fn concat_fills_missing_columns_with_nan() {
        let mut other = DataTable::new(vec!["cost".into(), "y".into()]);
        other.push_row("Sim 9", vec![0.5, 7.0]).unwrap();

        let joined = DataTable::concat([&table(), &other]);
        assert_eq!(joined.columns(), &["x", "cost", "y"]);
        assert_eq!(joined.num_rows(), 5);
        assert!(joined.get(0, "y").unwrap().is_nan());
        assert!(joined.get(4, "x").unwrap().is_nan());
        assert_eq!(joined.get(4, "cost"), Some(0.5));
    }

    #[test]
    fn select_and_add_column() {
        let mut t = table();
        t.add_column("z", vec![0.0; 4]).unwrap();
        assert!(t.add_column("bad", vec![0.0]).is_err());
        let s = t.select(&["z".to_string(), "x".to_string()]).unwrap();
        assert_eq!(s.row(1), Some(&[0.0, 2.0][..]));
    }

    #[test]
    fn csv_export_leaves_nan_cells_empty() {
        let mut buf = Vec::new();
        table().write_csv_to(&mut buf, "Simulation name").unwrap();
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "Simulation name,x,cost");
        assert_eq!(lines[2], "Sim 1,2,");
    }
}
