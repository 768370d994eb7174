//! Planar chessboard target geometry.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum BoardError {
    #[error("board needs at least 2x2 inner corners, got {columns}x{rows}")]
    TooFewCorners { columns: usize, rows: usize },
    #[error("square size must be positive and finite, got {0}")]
    InvalidSquareSize(f64),
    #[error("expected {expected} corners for this board, got {found}")]
    CornerCountMismatch { expected: usize, found: usize },
}

/// Inner-corner grid of a chessboard target.
///
/// `columns` and `rows` count *inner* corners, so a board with 10x7 squares
/// has 9 columns and 6 rows. `square_size` is in the physical unit the
/// extrinsics are reported in.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoardGeometry {
    columns: usize,
    rows: usize,
    square_size: f64,
}

impl BoardGeometry {
    pub fn new(columns: usize, rows: usize, square_size: f64) -> Result<Self, BoardError> {
        if columns < 2 || rows < 2 {
            return Err(BoardError::TooFewCorners { columns, rows });
        }
        if !(square_size > 0.0) || !square_size.is_finite() {
            return Err(BoardError::InvalidSquareSize(square_size));
        }
        Ok(BoardGeometry {
            columns,
            rows,
            square_size,
        })
    }

    pub fn columns(&self) -> usize {
        self.columns
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn square_size(&self) -> f64 {
        self.square_size
    }

    /// Number of inner corners, `columns * rows`.
    pub fn corner_count(&self) -> usize {
        self.columns * self.rows
    }

    /// 3-D board-frame coordinates of every inner corner.
    ///
    /// Row-major over the grid: `(c * square, r * square, 0)` for `r` in rows,
    /// `c` in columns. The same board always yields the same points, and the
    /// order matches the order of a detected [`CornerSet`](crate::detection::CornerSet).
    pub fn world_points(&self) -> Vec<Vector3<f64>> {
        let mut points = Vec::with_capacity(self.corner_count());
        for row in 0..self.rows {
            for col in 0..self.columns {
                points.push(Vector3::new(
                    col as f64 * self.square_size,
                    row as f64 * self.square_size,
                    0.0,
                ));
            }
        }
        points
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_world_points_layout() {
        let board = BoardGeometry::new(9, 6, 23.0).unwrap();
        let points = board.world_points();

        assert_eq!(points.len(), 54);
        assert_eq!(points[0], Vector3::new(0.0, 0.0, 0.0));
        assert_eq!(points[1], Vector3::new(23.0, 0.0, 0.0));
        assert_eq!(points[9], Vector3::new(0.0, 23.0, 0.0));
        assert_eq!(points[53], Vector3::new(8.0 * 23.0, 5.0 * 23.0, 0.0));
        assert!(points.iter().all(|p| p.z == 0.0));
    }

    #[test]
    fn test_world_points_are_deterministic() {
        for (cols, rows, square) in [(2, 2, 1.0), (9, 6, 23.0), (7, 11, 0.025), (4, 3, 1e-3)] {
            let board = BoardGeometry::new(cols, rows, square).unwrap();
            let first = board.world_points();
            let second = board.world_points();
            assert_eq!(first.len(), cols * rows);
            let same_bits = first
                .iter()
                .zip(second.iter())
                .all(|(a, b)| a.iter().zip(b.iter()).all(|(x, y)| x.to_bits() == y.to_bits()));
            assert!(same_bits);
        }
    }

    #[test]
    fn test_invalid_geometry_rejected() {
        assert_eq!(
            BoardGeometry::new(1, 6, 23.0),
            Err(BoardError::TooFewCorners { columns: 1, rows: 6 })
        );
        assert!(matches!(
            BoardGeometry::new(9, 6, 0.0),
            Err(BoardError::InvalidSquareSize(_))
        ));
        assert!(BoardGeometry::new(9, 6, f64::NAN).is_err());
    }
}
