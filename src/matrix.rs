//! Column-compressed sparse feature matrix
//!
//! One-hot encoded mutant features are overwhelmingly zero, so the model code
//! works on a CSC layout: `col_ptr[j]..col_ptr[j + 1]` indexes the row ids and
//! values of column `j`.

use crate::resolver::Interval;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SparseMatrix {
    n_rows: usize,
    col_ptr: Vec<usize>,
    row_idx: Vec<usize>,
    values: Vec<f64>,
}

impl SparseMatrix {
    /// Empty matrix with `n_rows` rows and no columns
    pub fn with_rows(n_rows: usize) -> Self {
        Self {
            n_rows,
            col_ptr: vec![0],
            row_idx: Vec::new(),
            values: Vec::new(),
        }
    }

    pub fn from_dense_columns(n_rows: usize, columns: &[Vec<f64>]) -> Self {
        let mut m = Self::with_rows(n_rows);
        for c in columns {
            m.push_dense_column(c);
        }
        m
    }

    /// Append a column, storing only non-zero entries
    pub fn push_dense_column(&mut self, values: &[f64]) {
        debug_assert_eq!(values.len(), self.n_rows);
        for (row, &v) in values.iter().enumerate() {
            if v != 0.0 {
                self.row_idx.push(row);
                self.values.push(v);
            }
        }
        self.col_ptr.push(self.row_idx.len());
    }

    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    pub fn n_cols(&self) -> usize {
        self.col_ptr.len() - 1
    }

    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    /// False if any stored entry is NaN or infinite
    pub fn all_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }

    /// Non-zero `(row, value)` entries of column `j`
    pub fn column(&self, j: usize) -> impl Iterator<Item = (usize, f64)> + '_ {
        let span = self.col_ptr[j]..self.col_ptr[j + 1];
        self.row_idx[span.clone()]
            .iter()
            .copied()
            .zip(self.values[span].iter().copied())
    }

    pub fn dense_column(&self, j: usize) -> Vec<f64> {
        let mut out = vec![0.0; self.n_rows];
        for (row, v) in self.column(j) {
            out[row] = v;
        }
        out
    }

    /// `X w`
    pub fn mul_vec(&self, w: &[f64]) -> Vec<f64> {
        let mut out = vec![0.0; self.n_rows];
        for (j, &wj) in w.iter().enumerate() {
            if wj == 0.0 {
                continue;
            }
            for (row, v) in self.column(j) {
                out[row] += v * wj;
            }
        }
        out
    }

    /// `Xᵀ r`
    pub fn t_mul_vec(&self, r: &[f64]) -> Vec<f64> {
        (0..self.n_cols())
            .map(|j| self.column(j).map(|(row, v)| v * r[row]).sum())
            .collect()
    }

    /// Per-column means over all rows
    pub fn column_means(&self) -> Vec<f64> {
        let n = self.n_rows.max(1) as f64;
        (0..self.n_cols())
            .map(|j| self.column(j).map(|(_, v)| v).sum::<f64>() / n)
            .collect()
    }

    /// New matrix holding `rows` in the given order (duplicates allowed)
    pub fn select_rows(&self, rows: &[usize]) -> Self {
        let mut positions: Vec<Vec<usize>> = vec![Vec::new(); self.n_rows];
        for (new_row, &old_row) in rows.iter().enumerate() {
            positions[old_row].push(new_row);
        }

        let mut out = Self::with_rows(rows.len());
        let mut entries: Vec<(usize, f64)> = Vec::new();
        for j in 0..self.n_cols() {
            entries.clear();
            for (row, v) in self.column(j) {
                for &new_row in &positions[row] {
                    entries.push((new_row, v));
                }
            }
            entries.sort_by_key(|(r, _)| *r);
            for &(r, v) in &entries {
                out.row_idx.push(r);
                out.values.push(v);
            }
            out.col_ptr.push(out.row_idx.len());
        }
        out
    }

    pub fn select_columns(&self, cols: &[usize]) -> Self {
        let mut out = Self::with_rows(self.n_rows);
        for &j in cols {
            for (row, v) in self.column(j) {
                out.row_idx.push(row);
                out.values.push(v);
            }
            out.col_ptr.push(out.row_idx.len());
        }
        out
    }

    /// Matrix with every column inside `intervals` removed
    pub fn drop_intervals(&self, intervals: &[Interval]) -> Self {
        let keep: Vec<usize> = (0..self.n_cols())
            .filter(|j| !intervals.iter().any(|i| i.range().contains(j)))
            .collect();
        self.select_columns(&keep)
    }

    pub fn slice_interval(&self, interval: Interval) -> Self {
        let cols: Vec<usize> = interval.range().collect();
        self.select_columns(&cols)
    }

    /// Row-major view: for each row, its `(column, value)` entries sorted by
    /// column.
    pub fn rows(&self) -> Vec<Vec<(usize, f64)>> {
        let mut rows = vec![Vec::new(); self.n_rows];
        for j in 0..self.n_cols() {
            for (row, v) in self.column(j) {
                rows[row].push((j, v));
            }
        }
        rows
    }
}
