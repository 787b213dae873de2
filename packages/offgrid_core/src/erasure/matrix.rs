//! Dense matrices over GF(256)

use super::galois::FIELD;
use super::CodecError;

/// Row-major matrix of field elements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<u8>,
}

impl Matrix {
    /// All-zero matrix.
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0u8; rows * cols],
        }
    }

    pub fn identity(size: usize) -> Self {
        let mut m = Self::zeros(size, size);
        for i in 0..size {
            m.set(i, i, 1);
        }
        m
    }

    /// Vandermonde matrix whose row `i` is `[1, a_i, a_i^2, ...]` with
    /// `a_i` the primitive element raised to `i`.
    ///
    /// The evaluation points are distinct for `rows <= 255`, so every
    /// `cols x cols` selection of rows is invertible.
    pub fn vandermonde(rows: usize, cols: usize) -> Self {
        let mut m = Self::zeros(rows, cols);
        for r in 0..rows {
            let point = FIELD.exp(r);
            for c in 0..cols {
                m.set(r, c, FIELD.power(point, c));
            }
        }
        m
    }

    pub fn from_rows(rows: &[Vec<u8>]) -> Result<Self, CodecError> {
        let cols = rows.first().map(|r| r.len()).unwrap_or(0);
        let mut data = Vec::with_capacity(rows.len() * cols);
        for (i, row) in rows.iter().enumerate() {
            if row.len() != cols {
                return Err(CodecError::InvalidMeta(format!(
                    "matrix row {} has {} columns, expected {}",
                    i,
                    row.len(),
                    cols
                )));
            }
            data.extend_from_slice(row);
        }
        Ok(Self {
            rows: rows.len(),
            cols,
            data,
        })
    }

    pub fn to_rows(&self) -> Vec<Vec<u8>> {
        (0..self.rows).map(|r| self.row(r).to_vec()).collect()
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    #[inline]
    pub fn get(&self, r: usize, c: usize) -> u8 {
        self.data[r * self.cols + c]
    }

    #[inline]
    pub fn set(&mut self, r: usize, c: usize, value: u8) {
        self.data[r * self.cols + c] = value;
    }

    pub fn row(&self, r: usize) -> &[u8] {
        &self.data[r * self.cols..(r + 1) * self.cols]
    }

    /// Rows `start..end` as a new matrix.
    pub fn sub_rows(&self, start: usize, end: usize) -> Self {
        Self {
            rows: end - start,
            cols: self.cols,
            data: self.data[start * self.cols..end * self.cols].to_vec(),
        }
    }

    pub fn multiply(&self, other: &Matrix) -> Result<Matrix, CodecError> {
        if self.cols != other.rows {
            return Err(CodecError::InvalidMeta(format!(
                "cannot multiply {}x{} by {}x{}",
                self.rows, self.cols, other.rows, other.cols
            )));
        }
        let mut out = Matrix::zeros(self.rows, other.cols);
        for r in 0..self.rows {
            for c in 0..other.cols {
                let mut acc = 0u8;
                for i in 0..self.cols {
                    acc ^= FIELD.multiply(self.get(r, i), other.get(i, c));
                }
                out.set(r, c, acc);
            }
        }
        Ok(out)
    }

    fn swap_rows(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        for c in 0..self.cols {
            self.data.swap(a * self.cols + c, b * self.cols + c);
        }
    }

    /// Gauss-Jordan inversion.
    pub fn invert(&self) -> Result<Matrix, CodecError> {
        if self.rows != self.cols {
            return Err(CodecError::InvalidMeta(format!(
                "cannot invert non-square {}x{} matrix",
                self.rows, self.cols
            )));
        }
        let size = self.rows;
        let mut work = self.clone();
        let mut inv = Matrix::identity(size);

        for col in 0..size {
            let pivot = (col..size)
                .find(|&r| work.get(r, col) != 0)
                .ok_or(CodecError::SingularMatrix)?;
            work.swap_rows(col, pivot);
            inv.swap_rows(col, pivot);

            let scale = FIELD
                .inverse(work.get(col, col))
                .ok_or(CodecError::SingularMatrix)?;
            for c in 0..size {
                work.set(col, c, FIELD.multiply(work.get(col, c), scale));
                inv.set(col, c, FIELD.multiply(inv.get(col, c), scale));
            }

            for r in 0..size {
                if r == col {
                    continue;
                }
                let factor = work.get(r, col);
                if factor == 0 {
                    continue;
                }
                for c in 0..size {
                    let w = work.get(r, c) ^ FIELD.multiply(factor, work.get(col, c));
                    work.set(r, c, w);
                    let v = inv.get(r, c) ^ FIELD.multiply(factor, inv.get(col, c));
                    inv.set(r, c, v);
                }
            }
        }
        Ok(inv)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_is_its_own_inverse() {
        let id = Matrix::identity(5);
        assert_eq!(id.invert().unwrap(), id);
    }

    #[test]
    fn test_invert_roundtrip() {
        let v = Matrix::vandermonde(4, 4);
        let inv = v.invert().unwrap();
        assert_eq!(v.multiply(&inv).unwrap(), Matrix::identity(4));
        assert_eq!(inv.multiply(&v).unwrap(), Matrix::identity(4));
    }

    #[test]
    fn test_singular_matrix_is_rejected() {
        let m = Matrix::from_rows(&[vec![1, 2], vec![1, 2]]).unwrap();
        assert!(matches!(m.invert(), Err(CodecError::SingularMatrix)));
    }

    #[test]
    fn test_ragged_rows_rejected() {
        assert!(Matrix::from_rows(&[vec![1, 2], vec![3]]).is_err());
    }

    #[test]
    fn test_vandermonde_first_column_is_ones() {
        let v = Matrix::vandermonde(10, 3);
        for r in 0..10 {
            assert_eq!(v.get(r, 0), 1);
        }
        assert_eq!(v.get(1, 1), 2);
        assert_eq!(v.get(1, 2), 4);
    }
}
