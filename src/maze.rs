use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::constants::{extra_openings_for, PASSAGE, WALL};
use crate::error::GameError;
use crate::rng::GameRng;
use crate::types::Direction;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Vec<u8>>", into = "Vec<Vec<u8>>")]
pub struct Grid {
    cells: Vec<Vec<u8>>,
}

impl Grid {
    pub fn walled(width: usize, height: usize) -> Self {
        Self {
            cells: vec![vec![WALL; width]; height],
        }
    }

    pub fn from_rows(rows: Vec<Vec<u8>>) -> Result<Self, GameError> {
        let Some(first) = rows.first() else {
            return Err(GameError::InvalidGrid {
                reason: "grid has no rows".to_string(),
            });
        };
        let width = first.len();
        if width == 0 {
            return Err(GameError::InvalidGrid {
                reason: "grid has no columns".to_string(),
            });
        }
        for (y, row) in rows.iter().enumerate() {
            if row.len() != width {
                return Err(GameError::InvalidGrid {
                    reason: format!("row {y} has {} cells, expected {width}", row.len()),
                });
            }
            if let Some(cell) = row.iter().find(|cell| **cell != WALL && **cell != PASSAGE) {
                return Err(GameError::InvalidGrid {
                    reason: format!("row {y} contains non-binary cell {cell}"),
                });
            }
        }
        Ok(Self { cells: rows })
    }

    pub fn width(&self) -> i32 {
        self.cells.first().map(|row| row.len()).unwrap_or(0) as i32
    }

    pub fn height(&self) -> i32 {
        self.cells.len() as i32
    }

    pub fn rows(&self) -> &[Vec<u8>] {
        &self.cells
    }

    pub fn in_bounds(&self, x: i32, y: i32) -> bool {
        x >= 0 && y >= 0 && x < self.width() && y < self.height()
    }

    pub fn is_passable(&self, x: i32, y: i32) -> bool {
        if !self.in_bounds(x, y) {
            return false;
        }
        self.cells[y as usize][x as usize] == PASSAGE
    }

    pub fn passable_count(&self) -> usize {
        self.cells
            .iter()
            .map(|row| row.iter().filter(|cell| **cell == PASSAGE).count())
            .sum()
    }

    pub fn passable_cells(&self) -> Vec<(i32, i32)> {
        let mut out = Vec::new();
        for (y, row) in self.cells.iter().enumerate() {
            for (x, cell) in row.iter().enumerate() {
                if *cell == PASSAGE {
                    out.push((x as i32, y as i32));
                }
            }
        }
        out
    }

    pub fn reachable_from(&self, x: i32, y: i32) -> HashSet<(i32, i32)> {
        let mut out = HashSet::new();
        if !self.is_passable(x, y) {
            return out;
        }

        let mut queue = VecDeque::new();
        out.insert((x, y));
        queue.push_back((x, y));

        while let Some((cx, cy)) = queue.pop_front() {
            for dir in Direction::ALL {
                let (dx, dy) = dir.delta();
                let (nx, ny) = (cx + dx, cy + dy);
                if !self.is_passable(nx, ny) {
                    continue;
                }
                if out.insert((nx, ny)) {
                    queue.push_back((nx, ny));
                }
            }
        }

        out
    }

    pub fn is_connected(&self) -> bool {
        let cells = self.passable_cells();
        let Some(&(x, y)) = cells.first() else {
            return true;
        };
        self.reachable_from(x, y).len() == cells.len()
    }

    pub fn first_step_toward(&self, from: (i32, i32), to: (i32, i32)) -> Option<Direction> {
        if from == to || !self.is_passable(from.0, from.1) || !self.is_passable(to.0, to.1) {
            return None;
        }

        let mut first_step: HashMap<(i32, i32), Direction> = HashMap::new();
        let mut queue = VecDeque::new();
        queue.push_back(from);

        while let Some((cx, cy)) = queue.pop_front() {
            for dir in Direction::ALL {
                let (dx, dy) = dir.delta();
                let next = (cx + dx, cy + dy);
                if next == from || first_step.contains_key(&next) {
                    continue;
                }
                if !self.is_passable(next.0, next.1) {
                    continue;
                }
                let inherited = if (cx, cy) == from {
                    dir
                } else {
                    first_step[&(cx, cy)]
                };
                if next == to {
                    return Some(inherited);
                }
                first_step.insert(next, inherited);
                queue.push_back(next);
            }
        }

        None
    }

    fn open(&mut self, x: i32, y: i32) {
        if self.in_bounds(x, y) {
            self.cells[y as usize][x as usize] = PASSAGE;
        }
    }

    fn is_interior(&self, x: i32, y: i32) -> bool {
        x > 0 && y > 0 && x < self.width() - 1 && y < self.height() - 1
    }
}

impl TryFrom<Vec<Vec<u8>>> for Grid {
    type Error = GameError;

    fn try_from(rows: Vec<Vec<u8>>) -> Result<Self, Self::Error> {
        Grid::from_rows(rows)
    }
}

impl From<Grid> for Vec<Vec<u8>> {
    fn from(grid: Grid) -> Self {
        grid.cells
    }
}

pub fn generate_maze(rows: usize, columns: usize, rng: &mut GameRng) -> Grid {
    let mut grid = carve_perfect_maze(rows, columns, rng);
    open_extra_walls(&mut grid, extra_openings_for(rows), rng);
    grid
}

pub fn carve_perfect_maze(rows: usize, columns: usize, rng: &mut GameRng) -> Grid {
    let mut grid = Grid::walled(columns * 2 + 1, rows * 2 + 1);
    if rows == 0 || columns == 0 {
        return grid;
    }

    let mut current = (
        rng.int(0, columns as i32 - 1) * 2 + 1,
        rng.int(0, rows as i32 - 1) * 2 + 1,
    );
    grid.open(current.0, current.1);
    let mut stack = Vec::new();

    loop {
        let neighbors: Vec<(i32, i32)> = Direction::ALL
            .iter()
            .map(|dir| {
                let (dx, dy) = dir.delta();
                (current.0 + dx * 2, current.1 + dy * 2)
            })
            .filter(|&(x, y)| grid.is_interior(x, y) && !grid.is_passable(x, y))
            .collect();

        if !neighbors.is_empty() {
            let next = neighbors[rng.pick_index(neighbors.len())];
            grid.open((current.0 + next.0) / 2, (current.1 + next.1) / 2);
            grid.open(next.0, next.1);
            stack.push(current);
            current = next;
        } else if let Some(previous) = stack.pop() {
            current = previous;
        } else {
            break;
        }
    }

    grid
}

pub fn open_extra_walls(grid: &mut Grid, count: usize, rng: &mut GameRng) -> usize {
    let mut opened = 0;
    while opened < count {
        let candidates = openable_walls(grid);
        if candidates.is_empty() {
            break;
        }
        let (x, y) = candidates[rng.pick_index(candidates.len())];
        grid.open(x, y);
        opened += 1;
    }
    opened
}

fn openable_walls(grid: &Grid) -> Vec<(i32, i32)> {
    let mut out = Vec::new();
    for y in 1..grid.height() - 1 {
        for x in 1..grid.width() - 1 {
            if grid.is_passable(x, y) {
                continue;
            }
            // odd/odd cells are chambers, never walls worth opening
            if x % 2 == 1 && y % 2 == 1 {
                continue;
            }
            let touches_passage = Direction::ALL.iter().any(|dir| {
                let (dx, dy) = dir.delta();
                grid.is_passable(x + dx, y + dy)
            });
            if touches_passage {
                out.push((x, y));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_has_expected_dimensions() {
        let mut rng = GameRng::new(1);
        let grid = generate_maze(10, 7, &mut rng);
        assert_eq!(grid.height(), 21);
        assert_eq!(grid.width(), 15);
        assert!(grid.rows().iter().all(|row| row.len() == 15));
    }

    #[test]
    fn border_stays_walled() {
        for seed in 0..50u64 {
            let mut rng = GameRng::new(seed);
            let grid = generate_maze(6, 9, &mut rng);
            for x in 0..grid.width() {
                assert!(!grid.is_passable(x, 0));
                assert!(!grid.is_passable(x, grid.height() - 1));
            }
            for y in 0..grid.height() {
                assert!(!grid.is_passable(0, y));
                assert!(!grid.is_passable(grid.width() - 1, y));
            }
        }
    }

    #[test]
    fn every_passable_cell_is_reachable() {
        for seed in 0..200u64 {
            let mut rng = GameRng::new(seed);
            let rows = 1 + (seed % 12) as usize;
            let columns = 1 + ((seed / 3) % 12) as usize;
            let grid = generate_maze(rows, columns, &mut rng);
            assert!(grid.is_connected(), "seed {seed} ({rows}x{columns})");
        }
    }

    #[test]
    fn carve_produces_spanning_tree_over_chambers() {
        for seed in 0..50u64 {
            let mut rng = GameRng::new(seed);
            let grid = carve_perfect_maze(5, 8, &mut rng);
            let chambers = 5 * 8;
            // every chamber plus one opened wall per tree edge
            assert_eq!(grid.passable_count(), chambers + chambers - 1);
            for y in (1..grid.height()).step_by(2) {
                for x in (1..grid.width()).step_by(2) {
                    assert!(grid.is_passable(x, y));
                }
            }
            assert!(grid.is_connected());
        }
    }

    #[test]
    fn extra_wall_pass_only_opens_cells() {
        for seed in 0..50u64 {
            let mut rng = GameRng::new(seed);
            let before = carve_perfect_maze(10, 10, &mut rng);
            let mut after = before.clone();
            let opened = open_extra_walls(&mut after, extra_openings_for(10), &mut rng);

            assert_eq!(opened, 30);
            assert_eq!(after.passable_count(), before.passable_count() + opened);
            for (x, y) in before.passable_cells() {
                assert!(after.is_passable(x, y));
            }
            assert!(after.is_connected());
        }
    }

    #[test]
    fn extra_wall_pass_stops_when_nothing_is_left_to_open() {
        let mut rng = GameRng::new(5);
        let mut grid = carve_perfect_maze(1, 1, &mut rng);
        assert_eq!(open_extra_walls(&mut grid, 3, &mut rng), 0);
        assert_eq!(grid.passable_count(), 1);
    }

    #[test]
    fn degenerate_sizes_terminate_in_bounds() {
        let mut rng = GameRng::new(11);
        let empty = generate_maze(0, 4, &mut rng);
        assert_eq!(empty.height(), 1);
        assert_eq!(empty.width(), 9);
        assert_eq!(empty.passable_count(), 0);
        assert!(empty.is_connected());

        let none = generate_maze(3, 0, &mut rng);
        assert_eq!(none.width(), 1);
        assert_eq!(none.passable_count(), 0);

        let single = generate_maze(1, 1, &mut rng);
        assert_eq!(single.passable_cells(), vec![(1, 1)]);

        let strip = generate_maze(1, 6, &mut rng);
        assert!(strip.is_connected());
    }

    #[test]
    fn from_rows_rejects_ragged_and_non_binary_input() {
        assert!(Grid::from_rows(Vec::new()).is_err());
        assert!(Grid::from_rows(vec![vec![0, 1], vec![1]]).is_err());
        assert!(Grid::from_rows(vec![vec![0, 2]]).is_err());
        assert!(Grid::from_rows(vec![vec![0, 1], vec![1, 0]]).is_ok());
    }

    #[test]
    fn grid_serializes_as_nested_arrays() {
        let grid = Grid::from_rows(vec![vec![0, 1, 0]]).expect("valid grid");
        let json = serde_json::to_string(&grid).expect("grid should serialize");
        assert_eq!(json, "[[0,1,0]]");
        let back: Grid = serde_json::from_str(&json).expect("grid should deserialize");
        assert_eq!(back, grid);
        assert!(serde_json::from_str::<Grid>("[[0,3]]").is_err());
    }

    #[test]
    fn first_step_toward_follows_the_corridor() {
        let grid = Grid::from_rows(vec![
            vec![0, 0, 0, 0, 0],
            vec![0, 1, 1, 1, 0],
            vec![0, 0, 0, 1, 0],
            vec![0, 1, 1, 1, 0],
            vec![0, 0, 0, 0, 0],
        ])
        .expect("valid grid");
        assert_eq!(grid.first_step_toward((1, 1), (1, 3)), Some(Direction::Right));
        assert_eq!(grid.first_step_toward((3, 2), (1, 3)), Some(Direction::Down));
        assert_eq!(grid.first_step_toward((1, 1), (1, 1)), None);
        assert_eq!(grid.first_step_toward((1, 1), (0, 0)), None);
    }
}
