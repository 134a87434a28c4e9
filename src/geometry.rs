//! Coordinate mapping from raw response lines to cells.
//!
//! A response line is a flat `x1,y1,x2,y2,...` list in transmission space. Mapping divides
//! every coordinate by the transmission scale and derives centroid and radius from the
//! restored vertices.

use crate::error::GeometryError;
use crate::model::{Cell, Point, Polygon, Rgb};
use rand::Rng;

/// Fewest vertices that still describe an area.
pub const MIN_POLYGON_POINTS: usize = 3;

/// Split one line into numbers. Blank tokens and non-numeric tokens are errors.
pub fn parse_line(line: &str) -> Result<Vec<f64>, GeometryError> {
    line.trim()
        .split(',')
        .enumerate()
        .map(|(i, tok)| {
            let tok = tok.trim();
            tok.parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .ok_or_else(|| {
                    GeometryError::MalformedGeometry(format!("token {} is not a number: {tok:?}", i + 1))
                })
        })
        .collect()
}

/// Build a cell from a flat coordinate list, restoring original-image space.
pub fn map_line(tokens: &[f64], scale_factor: f64, id: u32) -> Result<Cell, GeometryError> {
    map_line_with_color(tokens, scale_factor, id, random_color())
}

pub fn map_line_with_color(
    tokens: &[f64],
    scale_factor: f64,
    id: u32,
    color: Rgb,
) -> Result<Cell, GeometryError> {
    if !(scale_factor > 0.0) || !scale_factor.is_finite() {
        return Err(GeometryError::InvalidScale(scale_factor));
    }
    if tokens.len() % 2 != 0 {
        return Err(GeometryError::MalformedGeometry(format!(
            "odd coordinate count {}",
            tokens.len()
        )));
    }
    let n = tokens.len() / 2;
    if n < MIN_POLYGON_POINTS {
        return Err(GeometryError::MalformedGeometry(format!(
            "{n} point(s), need at least {MIN_POLYGON_POINTS}"
        )));
    }

    let mut xs = Vec::with_capacity(n);
    let mut ys = Vec::with_capacity(n);
    for pair in tokens.chunks_exact(2) {
        xs.push(pair[0] / scale_factor);
        ys.push(pair[1] / scale_factor);
    }
    let outline = Polygon { xs, ys };
    let centroid = centroid(&outline);
    let radius = mean_radius(&outline, centroid);

    Ok(Cell {
        id,
        centroid,
        radius,
        outline,
        color,
        intensity: 0.0,
    })
}

/// Arithmetic mean of all vertices. An empty outline sits at the origin.
fn centroid(outline: &Polygon) -> Point {
    if outline.is_empty() {
        return Point { x: 0.0, y: 0.0 };
    }
    let n = outline.len() as f64;
    let (sx, sy) = outline
        .vertices()
        .fold((0.0, 0.0), |(sx, sy), p| (sx + p.x, sy + p.y));
    Point {
        x: sx / n,
        y: sy / n,
    }
}

/// Mean Euclidean distance from each vertex to `c`.
fn mean_radius(outline: &Polygon, c: Point) -> f64 {
    if outline.is_empty() {
        return 0.0;
    }
    let n = outline.len() as f64;
    outline
        .vertices()
        .map(|p| (p.x - c.x).hypot(p.y - c.y))
        .sum::<f64>()
        / n
}

/// Light colors so outlines stay visible on dark images.
pub fn random_color() -> Rgb {
    let mut rng = rand::thread_rng();
    Rgb(
        rng.gen_range(100..=255),
        rng.gen_range(100..=255),
        rng.gen_range(100..=255),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-6;

    #[test]
    fn empty_outline_has_no_nan_stats() {
        let empty = Polygon {
            xs: Vec::new(),
            ys: Vec::new(),
        };
        let c = centroid(&empty);
        assert_eq!(c, Point { x: 0.0, y: 0.0 });
        assert_eq!(mean_radius(&empty, c), 0.0);
    }

    #[test]
    fn square_has_center_and_half_diagonal_radius() {
        let tokens = parse_line("10,10,20,10,20,20,10,20").unwrap();
        let cell = map_line(&tokens, 1.0, 1).unwrap();
        assert_eq!(cell.id, 1);
        assert!((cell.centroid.x - 15.0).abs() < EPS);
        assert!((cell.centroid.y - 15.0).abs() < EPS);
        assert!((cell.radius - 50f64.sqrt()).abs() < EPS);
        assert_eq!(cell.outline.len(), 4);
        assert_eq!(cell.intensity, 0.0);
    }

    #[test]
    fn coordinates_are_divided_by_scale() {
        for scale in [0.05, 0.25, 0.5, 1.0, 2.0] {
            let tokens = [3.0, 7.5, 12.25, 0.0, 9.0, 4.0];
            let cell = map_line(&tokens, scale, 1).unwrap();
            for (i, p) in cell.outline.vertices().enumerate() {
                assert!((p.x - tokens[2 * i] / scale).abs() < EPS);
                assert!((p.y - tokens[2 * i + 1] / scale).abs() < EPS);
            }
        }
    }

    #[test]
    fn scaled_square_centroid_is_restored() {
        let tokens = parse_line("0,0,10,0,10,10,0,10").unwrap();
        let cell = map_line(&tokens, 0.5, 1).unwrap();
        assert!((cell.centroid.x - 10.0).abs() < EPS);
        assert!((cell.centroid.y - 10.0).abs() < EPS);
    }

    #[test]
    fn odd_token_count_is_malformed() {
        let tokens = parse_line("1,2,3,4,5,6,7").unwrap();
        assert!(matches!(
            map_line(&tokens, 1.0, 1),
            Err(GeometryError::MalformedGeometry(_))
        ));
    }

    #[test]
    fn two_points_is_malformed() {
        let tokens = parse_line("1,2,3,4").unwrap();
        assert!(matches!(
            map_line(&tokens, 1.0, 1),
            Err(GeometryError::MalformedGeometry(_))
        ));
    }

    #[test]
    fn non_positive_scale_is_rejected() {
        let tokens = [0.0, 0.0, 1.0, 0.0, 1.0, 1.0];
        assert_eq!(
            map_line(&tokens, 0.0, 1).unwrap_err(),
            GeometryError::InvalidScale(0.0)
        );
        assert!(matches!(
            map_line(&tokens, -0.5, 1),
            Err(GeometryError::InvalidScale(_))
        ));
    }

    #[test]
    fn parse_rejects_garbage_and_empty_tokens() {
        assert!(parse_line("1,2,abc,4").is_err());
        assert!(parse_line("1,,3,4").is_err());
        assert!(parse_line("1,2,NaN,4").is_err());
        assert_eq!(parse_line(" 1.5, 2 ,3\r").unwrap(), vec![1.5, 2.0, 3.0]);
    }

    #[test]
    fn colors_stay_in_light_range() {
        for _ in 0..50 {
            let Rgb(r, g, b) = random_color();
            assert!(r >= 100 && g >= 100 && b >= 100);
        }
    }
}
