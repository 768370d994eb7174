//! Assembles candidate X-junctions into the board's corner lattice.
//!
//! Starting from a seed near the centroid of the candidates, the lattice is
//! grown breadth-first: each accepted corner predicts its four neighbours from
//! the local lattice vectors and claims the nearest unclaimed candidate close
//! enough to the prediction. The grown lattice must cover exactly
//! `columns x rows` cells, in either orientation.

use log::debug;
use nalgebra::Vector2;
use std::collections::{HashMap, VecDeque};

/// Seeds tried before giving up on an image.
const MAX_SEEDS: usize = 12;
/// Largest |cos| between the two lattice directions.
const MAX_AXIS_COS: f64 = 0.7;
/// Match tolerance as a fraction of the shorter local lattice vector.
const MATCH_TOLERANCE: f64 = 0.35;

#[derive(Debug, Clone, Copy)]
struct Node {
    index: usize,
    axis_u: Vector2<f64>,
    axis_v: Vector2<f64>,
}

/// Orders `candidates` into a row-major `columns x rows` grid.
///
/// Index 0 is the lattice corner nearest the image origin (smallest `x + y`).
/// For square boards, rows are the lattice direction that runs more
/// horizontally. Returns `None` when no seed grows into a complete lattice.
pub fn assemble_grid(
    candidates: &[Vector2<f64>],
    columns: usize,
    rows: usize,
) -> Option<Vec<Vector2<f64>>> {
    if candidates.len() < columns * rows {
        return None;
    }

    let centroid =
        candidates.iter().fold(Vector2::zeros(), |acc, p| acc + p) / candidates.len() as f64;
    let mut seeds: Vec<usize> = (0..candidates.len()).collect();
    seeds.sort_by(|&a, &b| {
        (candidates[a] - centroid)
            .norm_squared()
            .total_cmp(&(candidates[b] - centroid).norm_squared())
    });

    for &seed in seeds.iter().take(MAX_SEEDS) {
        let Some(lattice) = grow_lattice(candidates, seed) else {
            continue;
        };
        if let Some(ordered) = order_lattice(candidates, &lattice, columns, rows) {
            return Some(ordered);
        }
        debug!(
            "seed {seed} grew a lattice of {} corners, expected {}",
            lattice.len(),
            columns * rows
        );
    }
    None
}

fn nearest_except(
    candidates: &[Vector2<f64>],
    target: &Vector2<f64>,
    skip: impl Fn(usize) -> bool,
) -> Option<(usize, f64)> {
    candidates
        .iter()
        .enumerate()
        .filter(|(i, _)| !skip(*i))
        .map(|(i, p)| (i, (p - target).norm()))
        .min_by(|a, b| a.1.total_cmp(&b.1))
}

fn initial_axes(candidates: &[Vector2<f64>], seed: usize) -> Option<(Vector2<f64>, Vector2<f64>)> {
    let origin = candidates[seed];
    let mut neighbours: Vec<Vector2<f64>> = candidates
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != seed)
        .map(|(_, p)| p - origin)
        .filter(|d| d.norm() > f64::EPSILON)
        .collect();
    neighbours.sort_by(|a, b| a.norm_squared().total_cmp(&b.norm_squared()));

    let axis_u = *neighbours.first()?;
    let axis_v = neighbours.iter().skip(1).find(|d| {
        let cos = axis_u.dot(d) / (axis_u.norm() * d.norm());
        cos.abs() < MAX_AXIS_COS
    })?;
    Some((axis_u, *axis_v))
}

fn grow_lattice(candidates: &[Vector2<f64>], seed: usize) -> Option<HashMap<(i32, i32), usize>> {
    let (axis_u, axis_v) = initial_axes(candidates, seed)?;

    let mut lattice: HashMap<(i32, i32), usize> = HashMap::new();
    let mut claimed = vec![false; candidates.len()];
    let mut queue = VecDeque::new();

    lattice.insert((0, 0), seed);
    claimed[seed] = true;
    queue.push_back((
        (0, 0),
        Node {
            index: seed,
            axis_u,
            axis_v,
        },
    ));

    while let Some(((u, v), node)) = queue.pop_front() {
        let origin = candidates[node.index];
        let tolerance = MATCH_TOLERANCE * node.axis_u.norm().min(node.axis_v.norm());

        for (du, dv) in [(1, 0), (-1, 0), (0, 1), (0, -1)] {
            let cell = (u + du, v + dv);
            if lattice.contains_key(&cell) {
                continue;
            }
            let step = node.axis_u * du as f64 + node.axis_v * dv as f64;
            let predicted = origin + step;
            let Some((found, distance)) = nearest_except(candidates, &predicted, |i| claimed[i])
            else {
                continue;
            };
            if distance > tolerance {
                continue;
            }

            // carry the locally observed spacing forward, which follows perspective
            let observed = candidates[found] - origin;
            let child = if du != 0 {
                Node {
                    index: found,
                    axis_u: observed * du as f64,
                    axis_v: node.axis_v,
                }
            } else {
                Node {
                    index: found,
                    axis_u: node.axis_u,
                    axis_v: observed * dv as f64,
                }
            };
            lattice.insert(cell, found);
            claimed[found] = true;
            queue.push_back((cell, child));
        }
    }
    Some(lattice)
}

fn order_lattice(
    candidates: &[Vector2<f64>],
    lattice: &HashMap<(i32, i32), usize>,
    columns: usize,
    rows: usize,
) -> Option<Vec<Vector2<f64>>> {
    if lattice.len() != columns * rows {
        return None;
    }
    let min_u = lattice.keys().map(|k| k.0).min()?;
    let max_u = lattice.keys().map(|k| k.0).max()?;
    let min_v = lattice.keys().map(|k| k.1).min()?;
    let max_v = lattice.keys().map(|k| k.1).max()?;
    let extent_u = (max_u - min_u + 1) as usize;
    let extent_v = (max_v - min_v + 1) as usize;

    let at = |u: usize, v: usize| -> Option<Vector2<f64>> {
        lattice
            .get(&(min_u + u as i32, min_v + v as i32))
            .map(|&i| candidates[i])
    };

    // grid[v][u], complete by construction once the extents multiply out
    let mut grid: Vec<Vec<Vector2<f64>>> = Vec::with_capacity(extent_v);
    for v in 0..extent_v {
        let mut line = Vec::with_capacity(extent_u);
        for u in 0..extent_u {
            line.push(at(u, v)?);
        }
        grid.push(line);
    }

    // rows of `grid` must hold `columns` corners
    let grid = if extent_u == columns && extent_v == rows && columns != rows {
        grid
    } else if extent_u == rows && extent_v == columns && columns != rows {
        transpose(&grid)
    } else if extent_u == columns && extent_v == rows {
        let along_row = grid[0][columns - 1] - grid[0][0];
        let along_column = grid[rows - 1][0] - grid[0][0];
        if along_row.x.abs() * along_column.y.abs() >= along_row.y.abs() * along_column.x.abs() {
            grid
        } else {
            transpose(&grid)
        }
    } else {
        return None;
    };

    Some(canonical_flip(grid))
}

fn transpose(grid: &[Vec<Vector2<f64>>]) -> Vec<Vec<Vector2<f64>>> {
    let height = grid.len();
    let width = grid[0].len();
    (0..width)
        .map(|u| (0..height).map(|v| grid[v][u]).collect())
        .collect()
}

fn canonical_flip(mut grid: Vec<Vec<Vector2<f64>>>) -> Vec<Vector2<f64>> {
    let last_row = grid.len() - 1;
    let last_col = grid[0].len() - 1;
    let corners = [
        (false, false, grid[0][0]),
        (true, false, grid[0][last_col]),
        (false, true, grid[last_row][0]),
        (true, true, grid[last_row][last_col]),
    ];
    let (flip_cols, flip_rows, _) = corners
        .iter()
        .copied()
        .min_by(|a, b| (a.2.x + a.2.y).total_cmp(&(b.2.x + b.2.y)))
        .unwrap_or(corners[0]);

    if flip_rows {
        grid.reverse();
    }
    if flip_cols {
        for line in grid.iter_mut() {
            line.reverse();
        }
    }
    grid.into_iter().flatten().collect()
}
