//! Serpentine traversal of the plate grid.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One (column, row) position on the plate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Cell {
    /// Column index, along X.
    pub column: u32,
    /// Row index, along Y.
    pub row: u32,
}

impl Cell {
    /// Cell at `column`, `row`.
    pub const fn new(column: u32, row: u32) -> Self {
        Self { column, row }
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{}]", self.column, self.row)
    }
}

/// Every cell of a `columns` x `rows` grid, even rows left to right and odd
/// rows right to left.
pub fn sequence(columns: u32, rows: u32) -> Vec<Cell> {
    let mut cells = Vec::with_capacity((columns as usize) * (rows as usize));
    for row in 0..rows {
        if row % 2 == 0 {
            cells.extend((0..columns).map(|column| Cell::new(column, row)));
        } else {
            cells.extend((0..columns).rev().map(|column| Cell::new(column, row)));
        }
    }
    cells
}

/// The serpentine sequence from `start` (inclusive) to the end.
///
/// # Panics
///
/// When `start` is not on the grid; callers validate operator input first.
#[allow(clippy::panic)]
pub fn sequence_from(columns: u32, rows: u32, start: Cell) -> Vec<Cell> {
    let mut cells = sequence(columns, rows);
    let Some(index) = cells.iter().position(|cell| *cell == start) else {
        panic!("start cell {start} is not on the {columns}x{rows} grid");
    };
    cells.split_off(index)
}

/// The cell visited after `cell`, or `None` when `cell` is the last one.
pub fn next_in_sequence(columns: u32, rows: u32, cell: Cell) -> Option<Cell> {
    let cells = sequence(columns, rows);
    let index = cells.iter().position(|c| *c == cell)?;
    cells.get(index + 1).copied()
}
