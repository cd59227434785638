//! Cost-matrix construction and linear assignment for the two-stage
//! ByteTrack association. `linear_assignment` embeds the rectangular cost
//! matrix into a square one and solves it with the classic O(n^3)
//! Jonker-Volgenant/Hungarian shortest-augmenting-path algorithm — the same
//! formulation `lap.lapjv(cost_matrix, extend_cost=True, cost_limit=...)`
//! uses: opting a row or column out of any match costs exactly
//! `cost_limit`, so a real pair is only chosen when it beats sitting out.

const INF: f32 = f32::INFINITY;

/// Result of a linear assignment: matched `(row, col)` pairs plus the rows
/// and columns left unmatched, each index-ordered (lower index first).
#[derive(Debug, Clone, Default)]
pub struct Assignment {
    pub matches: Vec<(usize, usize)>,
    pub unmatched_rows: Vec<usize>,
    pub unmatched_cols: Vec<usize>,
}

/// Solves a rectangular linear assignment problem by embedding it into a
/// square `(rows + cols) x (rows + cols)` cost matrix: the top-left block
/// holds the real costs, the top-right and bottom-left blocks hold
/// `cost_limit` (the price of a row or column sitting out), and the
/// bottom-right block is free (dummy matched to dummy costs nothing).
/// Solving that square matrix optimally is equivalent to solving the
/// rectangular one under a cost cap — a real pair only wins over opting
/// out when its cost is less than `cost_limit`.
#[must_use]
pub fn linear_assignment(cost_matrix: &[Vec<f32>], cost_limit: f32) -> Assignment {
    let rows = cost_matrix.len();
    let cols = if rows == 0 { 0 } else { cost_matrix[0].len() };
    if rows == 0 || cols == 0 {
        return Assignment {
            matches: Vec::new(),
            unmatched_rows: (0..rows).collect(),
            unmatched_cols: (0..cols).collect(),
        };
    }

    let n = rows + cols;
    let limit = f64::from(cost_limit);
    let mut extended = vec![vec![limit; n]; n];
    for (r, row) in cost_matrix.iter().enumerate() {
        for (c, &cost) in row.iter().enumerate() {
            extended[r][c] = if cost.is_finite() { f64::from(cost) } else { limit };
        }
    }
    for row in extended.iter_mut().skip(rows) {
        for cell in row.iter_mut().skip(cols) {
            *cell = 0.0;
        }
    }

    let row_assignment = hungarian(&extended);

    let mut matched_rows = vec![false; rows];
    let mut matched_cols = vec![false; cols];
    let mut matches = Vec::new();
    for (r, &c) in row_assignment.iter().enumerate().take(rows) {
        if c < cols && cost_matrix[r][c].is_finite() && cost_matrix[r][c] <= cost_limit {
            matched_rows[r] = true;
            matched_cols[c] = true;
            matches.push((r, c));
        }
    }
    matches.sort_unstable();

    let unmatched_rows: Vec<usize> = (0..rows).filter(|&r| !matched_rows[r]).collect();
    let unmatched_cols: Vec<usize> = (0..cols).filter(|&c| !matched_cols[c]).collect();

    Assignment { matches, unmatched_rows, unmatched_cols }
}

/// Jonker-Volgenant/Hungarian shortest-augmenting-path solver for a square
/// cost matrix, O(n^3). Returns `assignment[row] = col` for every row.
fn hungarian(cost: &[Vec<f64>]) -> Vec<usize> {
    let n = cost.len();
    let mut u = vec![0.0f64; n + 1];
    let mut v = vec![0.0f64; n + 1];
    let mut p = vec![0usize; n + 1];
    let mut way = vec![0usize; n + 1];

    for i in 1..=n {
        p[0] = i;
        let mut j0 = 0usize;
        let mut minv = vec![f64::INFINITY; n + 1];
        let mut used = vec![false; n + 1];
        loop {
            used[j0] = true;
            let i0 = p[j0];
            let mut delta = f64::INFINITY;
            let mut j1 = 0usize;
            for j in 1..=n {
                if used[j] {
                    continue;
                }
                let cur = cost[i0 - 1][j - 1] - u[i0] - v[j];
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

    let mut assignment = vec![0usize; n];
    for j in 1..=n {
        if p[j] != 0 {
            assignment[p[j] - 1] = j - 1;
        }
    }
    assignment
}

/// `1 - iou` cost matrix between two axis-aligned box lists.
#[must_use]
pub fn iou_distance(a: &[helmet_risk_common::BoundingBox], b: &[helmet_risk_common::BoundingBox]) -> Vec<Vec<f32>> {
    a.iter().map(|x| b.iter().map(|y| 1.0 - x.iou(y)).collect()).collect()
}

/// Replaces each cost with `1 - (1 - cost) * det_score`, biasing the
/// assignment toward higher-confidence detections (the `fuse_score` step).
pub fn fuse_score(cost_matrix: &mut [Vec<f32>], det_scores: &[f32]) {
    for row in cost_matrix.iter_mut() {
        for (cost, &score) in row.iter_mut().zip(det_scores) {
            if cost.is_finite() {
                let iou_sim = 1.0 - *cost;
                *cost = 1.0 - iou_sim * score;
            }
        }
    }
}

/// Position-weighted convex combination of rotated IoU and normalized
/// center distance, used when both track and detection in a pair carry a
/// rotated box: `(1-w)*rIoU + w*(1 - clamp(dist/max_dist, 0, 1))`.
#[must_use]
pub fn position_weighted_similarity(
    rotated_iou: f32,
    center_dist: f32,
    position_weight: f32,
    max_center_dist: f32,
) -> f32 {
    let proximity = 1.0 - (center_dist / max_center_dist).clamp(0.0, 1.0);
    (1.0 - position_weight) * rotated_iou + position_weight * proximity
}

#[must_use]
pub fn infinite_cost() -> f32 {
    INF
}

#[cfg(test)]
mod tests {
    use super::*;
    use helmet_risk_common::BoundingBox;

    #[test]
    fn linear_assignment_matches_perfect_overlap() {
        let cost = vec![vec![0.0, 1.0], vec![1.0, 0.0]];
        let assignment = linear_assignment(&cost, 0.8);
        assert_eq!(assignment.matches.len(), 2);
        assert!(assignment.unmatched_rows.is_empty());
        assert!(assignment.unmatched_cols.is_empty());
    }

    #[test]
    fn linear_assignment_respects_cost_cap() {
        let cost = vec![vec![0.9]];
        let assignment = linear_assignment(&cost, 0.8);
        assert!(assignment.matches.is_empty());
        assert_eq!(assignment.unmatched_rows, vec![0]);
        assert_eq!(assignment.unmatched_cols, vec![0]);
    }

    #[test]
    fn linear_assignment_finds_the_optimal_pairing_not_the_greedy_one() {
        // Picking the globally cheapest cell first, (0,0)=1, forces (1,1)=100
        // for a total of 101. The optimal pairing is (0,1)=2 and (1,0)=1.5
        // for a total of 3.5.
        let cost = vec![vec![1.0, 2.0], vec![1.5, 100.0]];
        let assignment = linear_assignment(&cost, 1000.0);
        assert_eq!(assignment.matches, vec![(0, 1), (1, 0)]);
        assert!(assignment.unmatched_rows.is_empty());
        assert!(assignment.unmatched_cols.is_empty());
    }

    #[test]
    fn iou_distance_identical_boxes_is_zero_cost() {
        let a = vec![BoundingBox::new(0.0, 0.0, 10.0, 10.0)];
        let b = vec![BoundingBox::new(0.0, 0.0, 10.0, 10.0)];
        let cost = iou_distance(&a, &b);
        assert!(cost[0][0] < 1e-6);
    }

    #[test]
    fn fuse_score_scales_by_detection_confidence() {
        let mut cost = vec![vec![0.0]];
        fuse_score(&mut cost, &[0.5]);
        assert!((cost[0][0] - 0.5).abs() < 1e-6);
    }
}
