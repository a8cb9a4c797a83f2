//! Outline polygons for boolean masks.
//!
//! Borders are traced with `imageproc`'s Suzuki-Abe border following, which
//! reports them in raster order of their first pixel (top to bottom, then left
//! to right). Only outermost outer borders are kept: holes, and anything that
//! sits inside a hole, are dropped. Each border is then reduced with a closed
//! Douglas-Peucker pass at a tolerance of `0.005 * perimeter`.
//!
//! The tracer only finds borders that have background on their outside, so the
//! mask is traced inside a one pixel frame of background and the points are
//! shifted back afterwards. Regions touching the image edge are outlined along
//! the edge pixels.

use image::{GrayImage, Luma};
use imageproc::contours::{find_contours, BorderType};
use imageproc::point::Point;
use ndarray::Array2;

const SIMPLIFY_RATIO: f64 = 0.005;
const MIN_VERTICES: usize = 3;

pub type Outline = Vec<Point<i32>>;

pub fn extract_polygons(mask: &Array2<bool>) -> Vec<Outline> {
    if !mask.iter().any(|&v| v) {
        return Vec::new();
    }

    find_contours::<i32>(&framed(mask))
        .into_iter()
        .filter(|contour| contour.border_type == BorderType::Outer && contour.parent.is_none())
        .filter_map(|contour| {
            let points: Outline = contour
                .points
                .iter()
                .map(|p| Point::new(p.x - 1, p.y - 1))
                .collect();
            let epsilon = SIMPLIFY_RATIO * perimeter(&points);
            if points.len() < MIN_VERTICES || epsilon <= 0.0 {
                return None;
            }
            let polygon = simplify_closed(&points, epsilon);
            (polygon.len() >= MIN_VERTICES).then_some(polygon)
        })
        .collect()
}

/// Binary image of `mask` with one background pixel added on every side.
fn framed(mask: &Array2<bool>) -> GrayImage {
    let (rows, cols) = mask.dim();
    GrayImage::from_fn(cols as u32 + 2, rows as u32 + 2, |x, y| {
        let inside = x > 0
            && y > 0
            && mask
                .get(((y - 1) as usize, (x - 1) as usize))
                .copied()
                .unwrap_or(false);
        if inside {
            Luma([255])
        } else {
            Luma([0])
        }
    })
}

fn distance(a: Point<i32>, b: Point<i32>) -> f64 {
    let dx = f64::from(a.x - b.x);
    let dy = f64::from(a.y - b.y);
    dx.hypot(dy)
}

/// Length of the closed curve through `points`.
pub fn perimeter(points: &[Point<i32>]) -> f64 {
    match points {
        [] | [_] => 0.0,
        [.., last] => {
            let open: f64 = points.windows(2).map(|w| distance(w[0], w[1])).sum();
            open + distance(*last, points[0])
        }
    }
}

fn distance_to_line(p: Point<i32>, a: Point<i32>, b: Point<i32>) -> f64 {
    let length = distance(a, b);
    if length == 0.0 {
        return distance(p, a);
    }
    let cross = f64::from(b.x - a.x) * f64::from(a.y - p.y)
        - f64::from(a.x - p.x) * f64::from(b.y - a.y);
    cross.abs() / length
}

/// Douglas-Peucker on an open chain; both endpoints are always kept.
fn simplify_open(points: &[Point<i32>], epsilon: f64) -> Vec<Point<i32>> {
    if points.len() < 3 {
        return points.to_vec();
    }

    let mut keep = vec![false; points.len()];
    keep[0] = true;
    keep[points.len() - 1] = true;

    let mut pending = vec![(0, points.len() - 1)];
    while let Some((start, end)) = pending.pop() {
        if end <= start + 1 {
            continue;
        }
        let (split, max_distance) = (start + 1..end)
            .map(|i| (i, distance_to_line(points[i], points[start], points[end])))
            .fold((start, 0.0), |best, candidate| {
                if candidate.1 > best.1 {
                    candidate
                } else {
                    best
                }
            });
        if max_distance > epsilon {
            keep[split] = true;
            pending.push((start, split));
            pending.push((split, end));
        }
    }

    points
        .iter()
        .zip(keep)
        .filter_map(|(point, kept)| kept.then_some(*point))
        .collect()
}

/// Douglas-Peucker on a closed curve. The curve is cut at its first point and
/// at the point farthest from it, and the two chains are reduced separately.
fn simplify_closed(points: &[Point<i32>], epsilon: f64) -> Vec<Point<i32>> {
    let first = points[0];
    let (far, far_distance) = points
        .iter()
        .enumerate()
        .skip(1)
        .map(|(i, p)| (i, distance(first, *p)))
        .fold((0, 0.0), |best, candidate| {
            if candidate.1 > best.1 {
                candidate
            } else {
                best
            }
        });
    if far_distance == 0.0 {
        return vec![first];
    }

    let mut polygon = simplify_open(&points[..=far], epsilon);
    let mut closing: Vec<Point<i32>> = points[far..].to_vec();
    closing.push(first);
    let tail = simplify_open(&closing, epsilon);

    polygon.pop();
    polygon.extend(tail);
    polygon.pop();
    polygon
}
