//! Kuhn–Munkres (Hungarian) minimum-cost bipartite assignment on an `i64`
//! cost matrix.
//!
//! New code; the potential-based O(n^3) formulation is the textbook one.
//! `i64` costs avoid overflow for `pow(len_cm * 100, 2)`-scale inputs.

/// Finds a minimum-cost assignment of rows to columns. `cost[i][j]` is the
/// cost of assigning row `i` to column `j`; rows and columns need not be the
/// same count. Returns, for each row, the assigned column index, or `None`
/// if there were more rows than columns (that row goes unassigned).
///
/// Panics if `cost` is empty or ragged.
pub fn assign(cost: &[Vec<i64>]) -> Vec<Option<usize>> {
    let n = cost.len();
    assert!(n > 0, "cost matrix must have at least one row");
    let m = cost[0].len();
    assert!(cost.iter().all(|row| row.len() == m), "cost matrix rows must be equal length");
    assert!(m > 0, "cost matrix must have at least one column");

    let dim = n.max(m);
    const PAD_COST: i64 = i64::MAX / 8;
    let mut padded = vec![vec![PAD_COST; dim]; dim];
    for i in 0..n {
        for j in 0..m {
            padded[i][j] = cost[i][j];
        }
    }

    let assignment = solve_square(&padded);
    (0..n).map(|i| {
        let j = assignment[i];
        if j < m { Some(j) } else { None }
    }).collect()
}

/// The classic potential-based Hungarian algorithm for a square matrix,
/// 1-indexed internally (`u`/`v` potentials, `p`/`way` bookkeeping), adapted
/// from the standard formulation to 0-indexed inputs/outputs.
fn solve_square(a: &[Vec<i64>]) -> Vec<usize> {
    let n = a.len();
    const INF: i64 = i64::MAX / 4;
    let mut u = vec![0i64; n + 1];
    let mut v = vec![0i64; n + 1];
    let mut p = vec![0usize; n + 1]; // p[j] = 1-indexed row assigned to column j
    let mut way = vec![0usize; n + 1];

    for i in 1..=n {
        p[0] = i;
        let mut j0 = 0usize;
        let mut minv = vec![INF; n + 1];
        let mut used = vec![false; n + 1];
        loop {
            used[j0] = true;
            let i0 = p[j0];
            let mut delta = INF;
            let mut j1 = 0usize;
            for j in 1..=n {
                if used[j] {
                    continue;
                }
                let cur = a[i0 - 1][j - 1] - u[i0] - v[j];
                if cur < minv[j] {
                    minv[j] = cur;
                    way[j] = j0;
                }
                if minv[j] < delta {
                    delta = minv[j];
                    j1 = j;
                }
            }
            for j in 0..=n {
                if used[j] {
                    u[p[j]] += delta;
                    v[j] -= delta;
                } else {
                    minv[j] -= delta;
                }
            }
            j0 = j1;
            if p[j0] == 0 {
                break;
            }
        }
        loop {
            let j1 = way[j0];
            p[j0] = p[j1];
            j0 = j1;
            if j0 == 0 {
                break;
            }
        }
    }

    let mut result = vec![0usize; n];
    for j in 1..=n {
        if p[j] != 0 {
            result[p[j] - 1] = j - 1;
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assigns_a_bijection_for_a_square_matrix() {
        let cost = vec![
            vec![4, 1, 3],
            vec![2, 0, 5],
            vec![3, 2, 2],
        ];
        let assignment = assign(&cost);
        let cols: Vec<usize> = assignment.iter().map(|o| o.unwrap()).collect();
        let mut sorted = cols.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, vec![0, 1, 2]);
    }

    #[test]
    fn finds_the_known_minimum_for_a_5x5_matrix() {
        // Off-diagonal cost is always strictly larger, so the diagonal is
        // unambiguously the unique optimum regardless of row permutation.
        let n = 5;
        let cost: Vec<Vec<i64>> = (0..n)
            .map(|i| (0..n).map(|j| if i == j { 10 } else { 20 + (i as i64 - j as i64).abs() }).collect())
            .collect();
        let assignment = assign(&cost);
        let total: i64 = assignment.iter().enumerate().map(|(i, o)| cost[i][o.unwrap()]).sum();
        assert_eq!(total, 10 * n as i64);
        let cols: Vec<usize> = assignment.iter().map(|o| o.unwrap()).collect();
        assert_eq!(cols, (0..n).collect::<Vec<_>>());
    }

    #[test]
    fn more_rows_than_columns_leaves_extras_unassigned() {
        let cost = vec![vec![1, 2], vec![2, 1], vec![5, 5]];
        let assignment = assign(&cost);
        let assigned_cols: Vec<usize> = assignment.iter().filter_map(|o| *o).collect();
        assert_eq!(assigned_cols.len(), 2);
        let mut sorted = assigned_cols.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, vec![0, 1]);
    }

    #[test]
    fn large_squared_distances_do_not_overflow_i64() {
        let len_cm = 50_000i64;
        let big = (len_cm * 100).pow(2);
        let cost = vec![vec![big, big + 1], vec![big + 2, big]];
        let assignment = assign(&cost);
        assert!(assignment.iter().all(|o| o.is_some()));
    }
}
