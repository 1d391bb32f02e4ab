//! 48x5 Lagrange fractional-delay interpolation table.

use crate::error::{RadarError, Result};
use serde::{Deserialize, Serialize};

pub const LAGRANGE_ROWS: usize = 48;
pub const LAGRANGE_COLUMNS: usize = 5;

/// On-disk JSON representation of the Lagrange matrix, as produced by
/// whatever offline tool generated the interpolation coefficients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LagrangeMatrixFile {
    pub description: String,
    pub rows: usize,
    pub columns: usize,
    pub data: Vec<Vec<f32>>,
}

/// A validated 48x5 table of Lagrange interpolation coefficients.
///
/// Row `r` holds the 5 taps for fractional delay `r / 48`. Every row sums to
/// `1.0` within 1%, which is the load-time validation criterion.
#[derive(Debug, Clone)]
pub struct LagrangeMatrix {
    rows: Vec<[f32; LAGRANGE_COLUMNS]>,
}

impl LagrangeMatrix {
    /// Validate and wrap an already-parsed file representation.
    ///
    /// `columns != 5` is rejected outright: the kernels this table feeds hard-code
    /// a 5-tap window, so a differently-shaped table can never be honored.
    pub fn from_file(file: LagrangeMatrixFile) -> Result<Self> {
        if file.rows != LAGRANGE_ROWS || file.data.len() != LAGRANGE_ROWS {
            return Err(RadarError::InvalidLagrangeFile(format!(
                "expected {LAGRANGE_ROWS} rows, found rows={} data.len()={}",
                file.rows,
                file.data.len()
            )));
        }
        if file.columns != LAGRANGE_COLUMNS {
            return Err(RadarError::InvalidLagrangeFile(format!(
                "expected {LAGRANGE_COLUMNS} columns, found {}",
                file.columns
            )));
        }

        let mut rows = Vec::with_capacity(LAGRANGE_ROWS);
        for (r, row) in file.data.iter().enumerate() {
            if row.len() != LAGRANGE_COLUMNS {
                return Err(RadarError::InvalidLagrangeFile(format!(
                    "row {r} has {} columns, expected {LAGRANGE_COLUMNS}",
                    row.len()
                )));
            }
            let sum: f32 = row.iter().sum();
            if (sum - 1.0).abs() > 0.01 {
                return Err(RadarError::InvalidLagrangeFile(format!(
                    "row {r} sums to {sum}, expected 1.0 +/- 0.01"
                )));
            }
            let mut fixed = [0.0f32; LAGRANGE_COLUMNS];
            fixed.copy_from_slice(row);
            rows.push(fixed);
        }

        Ok(Self { rows })
    }

    /// Parse and validate a Lagrange matrix from its JSON text form.
    pub fn from_json_str(text: &str) -> Result<Self> {
        let file: LagrangeMatrixFile = serde_json::from_str(text)
            .map_err(|e| RadarError::InvalidLagrangeFile(e.to_string()))?;
        Self::from_file(file)
    }

    /// Taps for row `r`, where `r` is taken modulo [`LAGRANGE_ROWS`] defensively.
    pub fn row(&self, r: usize) -> &[f32; LAGRANGE_COLUMNS] {
        &self.rows[r % LAGRANGE_ROWS]
    }

    /// Flatten into a row-major `48 * 5` slice suitable for upload to a device buffer.
    pub fn flatten(&self) -> Vec<f32> {
        self.rows.iter().flat_map(|row| row.iter().copied()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uniform_file() -> LagrangeMatrixFile {
        LagrangeMatrixFile {
            description: "test".into(),
            rows: LAGRANGE_ROWS,
            columns: LAGRANGE_COLUMNS,
            data: (0..LAGRANGE_ROWS).map(|_| vec![0.2; LAGRANGE_COLUMNS]).collect(),
        }
    }

    #[test]
    fn every_row_sums_to_one_within_one_percent() {
        let m = LagrangeMatrix::from_file(uniform_file()).unwrap();
        for r in 0..LAGRANGE_ROWS {
            let sum: f32 = m.row(r).iter().sum();
            assert!((sum - 1.0).abs() < 0.01);
        }
    }

    #[test]
    fn rejects_wrong_row_count() {
        let mut file = uniform_file();
        file.rows = 40;
        file.data.truncate(40);
        assert!(matches!(
            LagrangeMatrix::from_file(file),
            Err(RadarError::InvalidLagrangeFile(_))
        ));
    }

    #[test]
    fn rejects_wrong_column_count() {
        let mut file = uniform_file();
        file.columns = 4;
        for row in &mut file.data {
            row.pop();
        }
        assert!(matches!(
            LagrangeMatrix::from_file(file),
            Err(RadarError::InvalidLagrangeFile(_))
        ));
    }

    #[test]
    fn rejects_row_that_does_not_sum_to_one() {
        let mut file = uniform_file();
        file.data[3] = vec![10.0, 0.0, 0.0, 0.0, 0.0];
        assert!(matches!(
            LagrangeMatrix::from_file(file),
            Err(RadarError::InvalidLagrangeFile(_))
        ));
    }

    #[test]
    fn row_index_is_defensively_modulo() {
        let m = LagrangeMatrix::from_file(uniform_file()).unwrap();
        assert_eq!(m.row(0), m.row(LAGRANGE_ROWS));
    }
}
