//! Mask-derived rotated boxes and rotated-box IoU.
//!
//! This is the Rust equivalent of an OpenCV `findContours` (external,
//! largest-by-area) + `minAreaRect` pipeline: boundary-pixel extraction,
//! monotone-chain convex hull, then a rotating-calipers minimum-area
//! rectangle over the hull's edges. Rotated IoU clips one rectangle's
//! corner polygon against the other's (Sutherland-Hodgman) and measures
//! the clipped area with the shoelace formula.

use helmet_risk_common::{Mask, Point2f, RotatedBox};

/// Derives the minimum-area rotated rectangle enclosing the largest
/// connected region of `mask`. Returns `None` for an empty mask or one
/// whose boundary collapses to fewer than 3 distinct points (a
/// `TransientInputError`-class condition upstream).
#[must_use]
pub fn rotated_box_from_mask(mask: &Mask) -> Option<RotatedBox> {
    let boundary = boundary_pixels(mask);
    if boundary.len() < 3 {
        return None;
    }
    let hull = convex_hull(&boundary);
    if hull.len() < 3 {
        return None;
    }
    min_area_rect(&hull)
}

fn boundary_pixels(mask: &Mask) -> Vec<Point2f> {
    let w = mask.width as i64;
    let h = mask.height as i64;
    let mut out = Vec::new();
    for (x, y) in mask.set_pixels() {
        let (xi, yi) = (x as i64, y as i64);
        let on_edge = xi == 0 || yi == 0 || xi == w - 1 || yi == h - 1;
        let has_empty_neighbor = [(-1, 0), (1, 0), (0, -1), (0, 1)].iter().any(|(dx, dy)| {
            let nx = xi + dx;
            let ny = yi + dy;
            nx < 0 || ny < 0 || nx >= w || ny >= h || !mask.get(nx as u32, ny as u32)
        });
        if on_edge || has_empty_neighbor {
            out.push(Point2f::new(x as f32, y as f32));
        }
    }
    out
}

/// Monotone-chain convex hull, returned counter-clockwise with no
/// duplicated closing point.
fn convex_hull(points: &[Point2f]) -> Vec<Point2f> {
    let mut pts = points.to_vec();
    pts.sort_by(|a, b| a.x.partial_cmp(&b.x).unwrap().then(a.y.partial_cmp(&b.y).unwrap()));
    pts.dedup_by(|a, b| a.x == b.x && a.y == b.y);
    if pts.len() < 3 {
        return pts;
    }

    fn cross(o: Point2f, a: Point2f, b: Point2f) -> f32 {
        (a.x - o.x) * (b.y - o.y) - (a.y - o.y) * (b.x - o.x)
    }

    let mut lower: Vec<Point2f> = Vec::new();
    for &p in &pts {
        while lower.len() >= 2 && cross(lower[lower.len() - 2], lower[lower.len() - 1], p) <= 0.0 {
            lower.pop();
        }
        lower.push(p);
    }
    let mut upper: Vec<Point2f> = Vec::new();
    for &p in pts.iter().rev() {
        while upper.len() >= 2 && cross(upper[upper.len() - 2], upper[upper.len() - 1], p) <= 0.0 {
            upper.pop();
        }
        upper.push(p);
    }
    lower.pop();
    upper.pop();
    lower.extend(upper);
    lower
}

/// Rotating-calipers minimum-area rectangle over a convex hull's edges:
/// one edge of the optimal rectangle is always collinear with a hull edge.
fn min_area_rect(hull: &[Point2f]) -> Option<RotatedBox> {
    let n = hull.len();
    if n < 3 {
        return None;
    }
    let mut best: Option<(f32, RotatedBox)> = None;

    for i in 0..n {
        let p0 = hull[i];
        let p1 = hull[(i + 1) % n];
        let edge_len = p0.dist(&p1);
        if edge_len < 1e-6 {
            continue;
        }
        let ux = (p1.x - p0.x) / edge_len;
        let uy = (p1.y - p0.y) / edge_len;
        // perpendicular axis
        let vx = -uy;
        let vy = ux;

        let (mut min_u, mut max_u, mut min_v, mut max_v) = (f32::MAX, f32::MIN, f32::MAX, f32::MIN);
        for &p in hull {
            let dx = p.x - p0.x;
            let dy = p.y - p0.y;
            let u = dx * ux + dy * uy;
            let v = dx * vx + dy * vy;
            min_u = min_u.min(u);
            max_u = max_u.max(u);
            min_v = min_v.min(v);
            max_v = max_v.max(v);
        }

        let w = max_u - min_u;
        let h = max_v - min_v;
        let area = w * h;

        let is_better = match &best {
            None => true,
            Some((best_area, _)) => area < *best_area,
        };
        if is_better {
            let cu = (min_u + max_u) / 2.0;
            let cv = (min_v + max_v) / 2.0;
            let center = Point2f::new(p0.x + cu * ux + cv * vx, p0.y + cu * uy + cv * vy);
            let angle_deg = uy.atan2(ux).to_degrees();
            let rb = RotatedBox { center, size: (w, h), angle_deg };
            best = Some((area, rb));
        }
    }

    best.map(|(_, rb)| rb)
}

/// Rotated-rectangle IoU via Sutherland-Hodgman polygon clipping followed
/// by the shoelace formula.
#[must_use]
pub fn rotated_iou(a: &RotatedBox, b: &RotatedBox) -> f32 {
    let poly_a = a.corners();
    let poly_b = b.corners();
    let area_a = polygon_area(&poly_a);
    let area_b = polygon_area(&poly_b);
    if area_a <= 0.0 || area_b <= 0.0 {
        return 0.0;
    }
    let clipped = clip_polygon(&poly_b, &poly_a);
    let inter = polygon_area(&clipped);
    let union = area_a + area_b - inter;
    if union <= 0.0 {
        0.0
    } else {
        (inter / union).clamp(0.0, 1.0)
    }
}

fn polygon_area(poly: &[Point2f]) -> f32 {
    if poly.len() < 3 {
        return 0.0;
    }
    let mut sum = 0.0;
    for i in 0..poly.len() {
        let p0 = poly[i];
        let p1 = poly[(i + 1) % poly.len()];
        sum += p0.x * p1.y - p1.x * p0.y;
    }
    (sum / 2.0).abs()
}

/// Clips `subject` against the convex polygon `clip` (Sutherland-Hodgman).
fn clip_polygon(subject: &[Point2f], clip: &[Point2f]) -> Vec<Point2f> {
    let mut output = subject.to_vec();
    let n = clip.len();
    for i in 0..n {
        if output.is_empty() {
            break;
        }
        let edge_start = clip[i];
        let edge_end = clip[(i + 1) % n];
        let input = output;
        output = Vec::with_capacity(input.len() + 1);
        for j in 0..input.len() {
            let current = input[j];
            let prev = input[(j + input.len() - 1) % input.len()];
            let current_inside = is_inside(edge_start, edge_end, current);
            let prev_inside = is_inside(edge_start, edge_end, prev);
            if current_inside {
                if !prev_inside {
                    if let Some(ip) = line_intersection(prev, current, edge_start, edge_end) {
                        output.push(ip);
                    }
                }
                output.push(current);
            } else if prev_inside {
                if let Some(ip) = line_intersection(prev, current, edge_start, edge_end) {
                    output.push(ip);
                }
            }
        }
    }
    output
}

fn is_inside(edge_start: Point2f, edge_end: Point2f, p: Point2f) -> bool {
    (edge_end.x - edge_start.x) * (p.y - edge_start.y) - (edge_end.y - edge_start.y) * (p.x - edge_start.x) >= 0.0
}

fn line_intersection(p1: Point2f, p2: Point2f, p3: Point2f, p4: Point2f) -> Option<Point2f> {
    let d1x = p2.x - p1.x;
    let d1y = p2.y - p1.y;
    let d2x = p4.x - p3.x;
    let d2y = p4.y - p3.y;
    let denom = d1x * d2y - d1y * d2x;
    if denom.abs() < 1e-9 {
        return None;
    }
    let t = ((p3.x - p1.x) * d2y - (p3.y - p1.y) * d2x) / denom;
    Some(Point2f::new(p1.x + t * d1x, p1.y + t * d1y))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square_mask(size: u32) -> Mask {
        Mask::new(size, size, vec![true; (size * size) as usize])
    }

    #[test]
    fn rotated_box_from_square_mask_is_axis_aligned_square() {
        let mask = square_mask(20);
        let rb = rotated_box_from_mask(&mask).expect("square mask has a rotated box");
        assert!((rb.size.0 - rb.size.1).abs() < 2.0);
    }

    #[test]
    fn rotated_box_from_empty_mask_is_none() {
        let mask = Mask::new(10, 10, vec![false; 100]);
        assert!(rotated_box_from_mask(&mask).is_none());
    }

    #[test]
    fn rotated_iou_identical_boxes_is_one() {
        let rb = RotatedBox { center: Point2f::new(5.0, 5.0), size: (10.0, 4.0), angle_deg: 15.0 };
        assert!((rotated_iou(&rb, &rb) - 1.0).abs() < 1e-3);
    }

    #[test]
    fn rotated_iou_disjoint_boxes_is_zero() {
        let a = RotatedBox { center: Point2f::new(0.0, 0.0), size: (2.0, 2.0), angle_deg: 0.0 };
        let b = RotatedBox { center: Point2f::new(100.0, 100.0), size: (2.0, 2.0), angle_deg: 0.0 };
        assert_eq!(rotated_iou(&a, &b), 0.0);
    }
}
