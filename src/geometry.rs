//! Semantic shape descriptors turned into convex collision primitives.
//!
//! Polygons are normalised (duplicate/closing vertices dropped, collinear
//! vertices removed, counter-clockwise winding) before an ear-clipping
//! triangulation whose triangles are merged back into convex pieces.

use glam::DVec2;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{Aabb, Pose, cross};

const GEOM_EPS: f64 = 1e-9;

/// Semantic shape description, in the entity's local frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ShapeDescriptor {
    Circle { radius: f64 },
    /// Axis-aligned box centred on the origin.
    Rectangle { width: f64, height: f64 },
    /// Simple polygon, any winding, optionally closed.
    Polygon { vertices: Vec<DVec2> },
    /// Rounded segment of `length` along the local x axis, centred on the origin.
    Segment { length: f64, radius: f64 },
}

/// Loose, untyped descriptor as it comes out of configuration files.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShapeParams {
    pub kind: String,
    pub radius: Option<f64>,
    pub width: Option<f64>,
    pub height: Option<f64>,
    pub length: Option<f64>,
    pub vertices: Option<Vec<DVec2>>,
}

/// One convex collision primitive.
#[derive(Clone, Debug, PartialEq)]
pub enum Primitive {
    Circle { center: DVec2, radius: f64 },
    /// Convex, counter-clockwise.
    Polygon { vertices: Vec<DVec2> },
    Segment { a: DVec2, b: DVec2, radius: f64 },
}

fn missing(kind: &str, field: &str) -> Error {
    Error::InvalidShape(format!("{kind} requires `{field}`"))
}

impl ShapeDescriptor {
    pub fn circle(radius: f64) -> Self {
        ShapeDescriptor::Circle { radius }
    }

    pub fn rectangle(width: f64, height: f64) -> Self {
        ShapeDescriptor::Rectangle { width, height }
    }

    pub fn polygon(vertices: impl Into<Vec<DVec2>>) -> Self {
        ShapeDescriptor::Polygon { vertices: vertices.into() }
    }

    pub fn segment(length: f64, radius: f64) -> Self {
        ShapeDescriptor::Segment { length, radius }
    }

    /// Build a descriptor from loose configuration data.
    pub fn from_params(params: &ShapeParams) -> Result<Self> {
        let kind = params.kind.as_str();
        let desc = match kind {
            "circle" => ShapeDescriptor::Circle { radius: params.radius.ok_or_else(|| missing(kind, "radius"))? },
            "rectangle" | "square" => {
                let width = params.width.ok_or_else(|| missing(kind, "width"))?;
                let height = if kind == "square" { params.height.unwrap_or(width) } else { params.height.ok_or_else(|| missing(kind, "height"))? };
                ShapeDescriptor::Rectangle { width, height }
            }
            "polygon" => ShapeDescriptor::Polygon {
                vertices: params.vertices.clone().ok_or_else(|| missing(kind, "vertices"))?,
            },
            "segment" => ShapeDescriptor::Segment {
                length: params.length.ok_or_else(|| missing(kind, "length"))?,
                radius: params.radius.unwrap_or(0.0),
            },
            other => return Err(Error::InvalidShapeKind(other.to_string())),
        };
        desc.validate()?;
        Ok(desc)
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            ShapeDescriptor::Circle { radius } if !(*radius > 0.0) => {
                Err(Error::InvalidShape(format!("circle radius must be positive, got {radius}")))
            }
            ShapeDescriptor::Rectangle { width, height } if !(*width > 0.0 && *height > 0.0) => {
                Err(Error::InvalidShape(format!("rectangle dimensions must be positive, got {width}x{height}")))
            }
            ShapeDescriptor::Segment { length, radius } if *length < 0.0 || *radius < 0.0 || (*length == 0.0 && *radius == 0.0) => {
                Err(Error::InvalidShape("segment needs a positive length or radius".into()))
            }
            ShapeDescriptor::Polygon { vertices } => normalize_polygon(vertices).map(|_| ()),
            _ => Ok(()),
        }
    }

    /// Convex primitives in the local frame. Non-convex polygons are decomposed.
    pub fn primitives(&self) -> Result<Vec<Primitive>> {
        self.validate()?;
        Ok(match self {
            ShapeDescriptor::Circle { radius } => vec![Primitive::Circle { center: DVec2::ZERO, radius: *radius }],
            ShapeDescriptor::Rectangle { width, height } => vec![Primitive::Polygon { vertices: box_vertices(*width, *height) }],
            ShapeDescriptor::Segment { length, radius } => {
                let half = DVec2::new(length / 2.0, 0.0);
                vec![Primitive::Segment { a: -half, b: half, radius: *radius }]
            }
            ShapeDescriptor::Polygon { vertices } => decompose(vertices)?
                .into_iter()
                .map(|vertices| Primitive::Polygon { vertices })
                .collect(),
        })
    }

    pub fn area(&self) -> f64 {
        match self {
            ShapeDescriptor::Circle { radius } => std::f64::consts::PI * radius * radius,
            ShapeDescriptor::Rectangle { width, height } => width * height,
            ShapeDescriptor::Segment { length, radius } => segment_area(*length, *radius),
            ShapeDescriptor::Polygon { vertices } => signed_area(vertices).abs(),
        }
    }

    /// Radius of the smallest origin-centred circle containing the shape.
    pub fn bounding_radius(&self) -> f64 {
        match self {
            ShapeDescriptor::Circle { radius } => *radius,
            ShapeDescriptor::Rectangle { width, height } => DVec2::new(width / 2.0, height / 2.0).length(),
            ShapeDescriptor::Segment { length, radius } => length / 2.0 + radius,
            ShapeDescriptor::Polygon { vertices } => vertices.iter().map(|v| v.length()).fold(0.0, f64::max),
        }
    }

    /// Local-frame containment test.
    pub fn contains_point(&self, p: DVec2) -> bool {
        match self.primitives() {
            Ok(prims) => prims.iter().any(|prim| prim.contains_point(p)),
            Err(_) => false,
        }
    }
}

fn box_vertices(width: f64, height: f64) -> Vec<DVec2> {
    let (hw, hh) = (width / 2.0, height / 2.0);
    vec![DVec2::new(-hw, -hh), DVec2::new(hw, -hh), DVec2::new(hw, hh), DVec2::new(-hw, hh)]
}

fn segment_area(length: f64, radius: f64) -> f64 {
    length * 2.0 * radius + std::f64::consts::PI * radius * radius
}

impl Primitive {
    /// This primitive expressed in the parent frame of `pose`.
    pub fn transformed(&self, pose: &Pose) -> Primitive {
        match self {
            Primitive::Circle { center, radius } => Primitive::Circle { center: pose.transform_point(*center), radius: *radius },
            Primitive::Polygon { vertices } => Primitive::Polygon {
                vertices: vertices.iter().map(|v| pose.transform_point(*v)).collect(),
            },
            Primitive::Segment { a, b, radius } => Primitive::Segment {
                a: pose.transform_point(*a),
                b: pose.transform_point(*b),
                radius: *radius,
            },
        }
    }

    pub fn aabb(&self) -> Aabb {
        match self {
            Primitive::Circle { center, radius } => Aabb::new(*center, *center).inflate(*radius),
            Primitive::Polygon { vertices } => {
                let first = vertices.first().copied().unwrap_or(DVec2::ZERO);
                vertices.iter().fold(Aabb::new(first, first), |bb, v| Aabb::new(bb.min.min(*v), bb.max.max(*v)))
            }
            Primitive::Segment { a, b, radius } => Aabb::new(a.min(*b), a.max(*b)).inflate(*radius),
        }
    }

    pub fn area(&self) -> f64 {
        match self {
            Primitive::Circle { radius, .. } => std::f64::consts::PI * radius * radius,
            Primitive::Polygon { vertices } => signed_area(vertices).abs(),
            Primitive::Segment { a, b, radius } => segment_area((*b - *a).length(), *radius),
        }
    }

    /// Moment of inertia about the frame origin for a uniform `mass`.
    pub fn moment(&self, mass: f64) -> f64 {
        match self {
            Primitive::Circle { center, radius } => mass * (radius * radius / 2.0 + center.length_squared()),
            Primitive::Segment { a, b, radius } => {
                let length = (*b - *a).length();
                let offset = (*a + *b) * 0.5;
                mass * ((length * length + 4.0 * radius * radius) / 12.0 + offset.length_squared())
            }
            Primitive::Polygon { vertices } => polygon_moment(mass, vertices),
        }
    }

    pub fn contains_point(&self, p: DVec2) -> bool {
        match self {
            Primitive::Circle { center, radius } => (p - *center).length_squared() <= radius * radius,
            Primitive::Polygon { vertices } => convex_contains(vertices, p),
            Primitive::Segment { a, b, radius } => (p - closest_point_on_segment(*a, *b, p)).length_squared() <= radius * radius,
        }
    }

    /// Closest point on the primitive's surface to `p`, and whether `p` is inside.
    pub fn nearest_surface_point(&self, p: DVec2) -> (DVec2, bool) {
        match self {
            Primitive::Circle { center, radius } => {
                let d = p - *center;
                let len = d.length();
                let dir = if len > GEOM_EPS { d / len } else { DVec2::X };
                (*center + dir * *radius, len <= *radius)
            }
            Primitive::Segment { a, b, radius } => {
                let q = closest_point_on_segment(*a, *b, p);
                let d = p - q;
                let len = d.length();
                let dir = if len > GEOM_EPS { d / len } else { (*b - *a).perp().normalize_or(DVec2::Y) };
                (q + dir * *radius, len <= *radius)
            }
            Primitive::Polygon { vertices } => {
                let n = vertices.len();
                let mut best = vertices[0];
                let mut best_d2 = f64::INFINITY;
                for i in 0..n {
                    let q = closest_point_on_segment(vertices[i], vertices[(i + 1) % n], p);
                    let d2 = (p - q).length_squared();
                    if d2 < best_d2 {
                        best_d2 = d2;
                        best = q;
                    }
                }
                (best, convex_contains(vertices, p))
            }
        }
    }
}

/// Total moment of inertia of the descriptor's primitives for `mass`, mass split by area.
pub fn moment_for(mass: f64, descriptor: &ShapeDescriptor) -> Result<f64> {
    let prims = descriptor.primitives()?;
    Ok(moment_for_primitives(mass, &prims))
}

/// Thin segments have no area; their mass is then split evenly and each one acts as a rod.
pub fn moment_for_primitives(mass: f64, prims: &[Primitive]) -> f64 {
    if prims.is_empty() {
        return 0.0;
    }
    let total: f64 = prims.iter().map(Primitive::area).sum();
    if total <= 0.0 {
        let share = mass / prims.len() as f64;
        return prims.iter().map(|p| p.moment(share)).sum();
    }
    prims.iter().map(|p| p.moment(mass * p.area() / total)).sum()
}

fn polygon_moment(mass: f64, verts: &[DVec2]) -> f64 {
    let n = verts.len();
    let mut numerator = 0.0;
    let mut denominator = 0.0;
    for i in 0..n {
        let a = verts[i];
        let b = verts[(i + 1) % n];
        let c = cross(a, b);
        numerator += c * (a.dot(a) + a.dot(b) + b.dot(b));
        denominator += c;
    }
    if denominator.abs() <= GEOM_EPS {
        return 0.0;
    }
    mass * numerator / (6.0 * denominator)
}

pub fn signed_area(verts: &[DVec2]) -> f64 {
    let n = verts.len();
    let mut sum = 0.0;
    for i in 0..n {
        sum += cross(verts[i], verts[(i + 1) % n]);
    }
    sum / 2.0
}

pub fn closest_point_on_segment(a: DVec2, b: DVec2, p: DVec2) -> DVec2 {
    let ab = b - a;
    let len2 = ab.length_squared();
    if len2 <= GEOM_EPS * GEOM_EPS {
        return a;
    }
    let t = ((p - a).dot(ab) / len2).clamp(0.0, 1.0);
    a + ab * t
}

/// Point-in-convex test for a counter-clockwise polygon (boundary counts as inside).
pub fn convex_contains(verts: &[DVec2], p: DVec2) -> bool {
    let n = verts.len();
    (0..n).all(|i| cross(verts[(i + 1) % n] - verts[i], p - verts[i]) >= -GEOM_EPS)
}

pub fn is_convex(verts: &[DVec2]) -> bool {
    let n = verts.len();
    if n < 3 {
        return false;
    }
    (0..n).all(|i| {
        let a = verts[i];
        let b = verts[(i + 1) % n];
        let c = verts[(i + 2) % n];
        cross(b - a, c - b) >= -GEOM_EPS
    })
}

/// Drop the closing vertex, duplicates and collinear points, and force counter-clockwise winding.
pub fn normalize_polygon(raw: &[DVec2]) -> Result<Vec<DVec2>> {
    let mut verts: Vec<DVec2> = Vec::with_capacity(raw.len());
    for v in raw {
        if verts.last().is_none_or(|last| (*last - *v).length_squared() > GEOM_EPS * GEOM_EPS) {
            verts.push(*v);
        }
    }
    while verts.len() > 1 && (verts[0] - verts[verts.len() - 1]).length_squared() <= GEOM_EPS * GEOM_EPS {
        verts.pop();
    }

    let mut changed = true;
    while changed && verts.len() >= 3 {
        changed = false;
        let n = verts.len();
        for i in 0..n {
            let prev = verts[(i + n - 1) % n];
            let next = verts[(i + 1) % n];
            if cross(verts[i] - prev, next - verts[i]).abs() <= GEOM_EPS {
                verts.remove(i);
                changed = true;
                break;
            }
        }
    }

    if verts.len() < 3 {
        return Err(Error::InvalidShape("polygon needs at least 3 non-collinear vertices".into()));
    }
    let area = signed_area(&verts);
    if area.abs() <= GEOM_EPS {
        return Err(Error::InvalidShape("polygon has zero area".into()));
    }
    if area < 0.0 {
        verts.reverse();
    }
    debug_assert!(signed_area(&verts) > 0.0, "winding must be counter-clockwise before decomposition");
    Ok(verts)
}

/// Split a simple polygon into convex counter-clockwise pieces.
pub fn decompose(raw: &[DVec2]) -> Result<Vec<Vec<DVec2>>> {
    let verts = normalize_polygon(raw)?;
    if is_convex(&verts) {
        return Ok(vec![verts]);
    }
    let triangles = triangulate(&verts)?;
    let pieces = merge_convex(&verts, triangles);
    Ok(pieces.into_iter().map(|idx| idx.into_iter().map(|i| verts[i]).collect()).collect())
}

fn point_in_triangle(p: DVec2, a: DVec2, b: DVec2, c: DVec2) -> bool {
    cross(b - a, p - a) >= 0.0 && cross(c - b, p - b) >= 0.0 && cross(a - c, p - c) >= 0.0
}

fn triangulate(verts: &[DVec2]) -> Result<Vec<Vec<usize>>> {
    let mut remaining: Vec<usize> = (0..verts.len()).collect();
    let mut triangles = Vec::with_capacity(verts.len().saturating_sub(2));
    while remaining.len() > 3 {
        let m = remaining.len();
        let ear = (0..m).find(|&i| {
            let (ip, ic, inx) = (remaining[(i + m - 1) % m], remaining[i], remaining[(i + 1) % m]);
            let (a, b, c) = (verts[ip], verts[ic], verts[inx]);
            if cross(b - a, c - b) <= GEOM_EPS {
                return false;
            }
            remaining
                .iter()
                .filter(|&&j| j != ip && j != ic && j != inx)
                .all(|&j| !point_in_triangle(verts[j], a, b, c))
        });
        let Some(i) = ear else {
            return Err(Error::InvalidShape("polygon is not simple".into()));
        };
        triangles.push(vec![remaining[(i + m - 1) % m], remaining[i], remaining[(i + 1) % m]]);
        remaining.remove(i);
    }
    triangles.push(remaining);
    Ok(triangles)
}

/// Hertel-Mehlhorn: drop shared diagonals while the union stays convex.
fn merge_convex(verts: &[DVec2], mut pieces: Vec<Vec<usize>>) -> Vec<Vec<usize>> {
    loop {
        let mut merged_any = false;
        'outer: for p in 0..pieces.len() {
            for q in (p + 1)..pieces.len() {
                if let Some(merged) = try_merge(&pieces[p], &pieces[q]) {
                    let points: Vec<DVec2> = merged.iter().map(|&i| verts[i]).collect();
                    if is_convex(&points) {
                        pieces[p] = merged;
                        pieces.remove(q);
                        merged_any = true;
                        break 'outer;
                    }
                }
            }
        }
        if !merged_any {
            return pieces;
        }
    }
}

fn try_merge(p: &[usize], q: &[usize]) -> Option<Vec<usize>> {
    let np = p.len();
    let nq = q.len();
    for i in 0..np {
        let (u, v) = (p[i], p[(i + 1) % np]);
        for j in 0..nq {
            if q[j] == v && q[(j + 1) % nq] == u {
                // p rotated to run v .. u, then q's interior from u back to v.
                let mut out: Vec<usize> = (0..np).map(|k| p[(i + 1 + k) % np]).collect();
                out.extend((1..nq - 1).map(|k| q[(j + 1 + k) % nq]));
                return Some(out);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn l_shape() -> Vec<DVec2> {
        vec![
            DVec2::new(0.0, 0.0),
            DVec2::new(20.0, 0.0),
            DVec2::new(20.0, 10.0),
            DVec2::new(10.0, 10.0),
            DVec2::new(10.0, 30.0),
            DVec2::new(0.0, 30.0),
        ]
    }

    #[test]
    fn test_unknown_kind_fails() {
        let params = ShapeParams { kind: "blob".into(), ..Default::default() };
        assert_eq!(ShapeDescriptor::from_params(&params), Err(Error::InvalidShapeKind("blob".into())));
    }

    #[test]
    fn test_params_from_json() {
        let params: ShapeParams = serde_json::from_str(r#"{ "kind": "rectangle", "width": 4.0, "height": 2.0 }"#).unwrap();
        assert_eq!(ShapeDescriptor::from_params(&params).unwrap(), ShapeDescriptor::rectangle(4.0, 2.0));
        let params = ShapeParams { kind: "circle".into(), ..Default::default() };
        assert!(matches!(ShapeDescriptor::from_params(&params), Err(Error::InvalidShape(_))));
    }

    #[test]
    fn test_clockwise_closed_polygon_is_normalised() {
        let mut verts = l_shape();
        verts.reverse();
        verts.push(verts[0]);
        let norm = normalize_polygon(&verts).unwrap();
        assert_eq!(norm.len(), 6);
        assert!(signed_area(&norm) > 0.0);
    }

    #[test]
    fn test_collinear_vertices_dropped() {
        let verts = vec![DVec2::new(0.0, 0.0), DVec2::new(5.0, 0.0), DVec2::new(10.0, 0.0), DVec2::new(10.0, 10.0), DVec2::new(0.0, 10.0)];
        assert_eq!(normalize_polygon(&verts).unwrap().len(), 4);
    }

    #[test]
    fn test_degenerate_polygon_rejected() {
        let verts = vec![DVec2::ZERO, DVec2::new(1.0, 1.0), DVec2::new(2.0, 2.0)];
        assert!(matches!(normalize_polygon(&verts), Err(Error::InvalidShape(_))));
    }

    #[test]
    fn test_convex_polygon_single_primitive() {
        let prims = ShapeDescriptor::rectangle(10.0, 4.0).primitives().unwrap();
        assert_eq!(prims.len(), 1);
        let prims = ShapeDescriptor::polygon(vec![DVec2::new(0.0, 0.0), DVec2::new(4.0, 0.0), DVec2::new(0.0, 3.0)]).primitives().unwrap();
        assert_eq!(prims.len(), 1);
    }

    #[test]
    fn test_l_shape_decomposes_into_convex_parts() {
        let parts = decompose(&l_shape()).unwrap();
        assert!(parts.len() >= 2);
        for part in &parts {
            assert!(is_convex(part));
            assert!(signed_area(part) > 0.0);
        }
        let total: f64 = parts.iter().map(|p| signed_area(p)).sum();
        assert!((total - 400.0).abs() < 1e-9);
    }

    #[test]
    fn test_moments_positive() {
        let shapes = [
            ShapeDescriptor::circle(3.0),
            ShapeDescriptor::rectangle(2.0, 5.0),
            ShapeDescriptor::segment(10.0, 1.0),
            ShapeDescriptor::polygon(l_shape()),
        ];
        for s in &shapes {
            assert!(moment_for(2.0, s).unwrap() > 0.0, "{s:?}");
        }
        // Disc: m r^2 / 2
        assert!((moment_for(2.0, &shapes[0]).unwrap() - 9.0).abs() < 1e-12);
        // Box: m (w^2 + h^2) / 12
        assert!((moment_for(12.0, &shapes[1]).unwrap() - 29.0).abs() < 1e-9);
    }

    #[test]
    fn test_contains_point() {
        let l = ShapeDescriptor::polygon(l_shape());
        assert!(l.contains_point(DVec2::new(5.0, 25.0)));
        assert!(!l.contains_point(DVec2::new(15.0, 25.0)));
        assert!(ShapeDescriptor::segment(10.0, 1.0).contains_point(DVec2::new(5.5, 0.0)));
    }

    #[test]
    fn test_transformed_primitive() {
        let prim = Primitive::Circle { center: DVec2::new(1.0, 0.0), radius: 1.0 };
        let moved = prim.transformed(&Pose::new(10.0, 0.0, std::f64::consts::FRAC_PI_2));
        match moved {
            Primitive::Circle { center, .. } => assert!((center - DVec2::new(10.0, 1.0)).length() < 1e-12),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_thin_segment_moment_is_rod_moment() {
        let m = moment_for(1.0, &ShapeDescriptor::segment(10.0, 0.0)).unwrap();
        assert!((m - 100.0 / 12.0).abs() < 1e-12);
    }

    proptest! {
        #[test]
        fn prop_circle_and_box_moment_positive(
            mass in 0.01f64..1e4,
            w in 0.1f64..500.0,
            h in 0.1f64..500.0,
            seg_radius in prop_oneof![Just(0.0f64), 0.1f64..500.0],
        ) {
            prop_assert!(moment_for(mass, &ShapeDescriptor::circle(w)).unwrap() > 0.0);
            prop_assert!(moment_for(mass, &ShapeDescriptor::rectangle(w, h)).unwrap() > 0.0);
            prop_assert!(moment_for(mass, &ShapeDescriptor::segment(w, seg_radius)).unwrap() > 0.0);
        }

        #[test]
        fn prop_star_decomposition_preserves_area(
            radii in proptest::collection::vec(5.0f64..50.0, 5..12),
            inner in 0.2f64..0.9,
        ) {
            // Star-shaped polygon: alternating outer/inner radii, always simple.
            let n = radii.len() * 2;
            let verts: Vec<DVec2> = (0..n)
                .map(|i| {
                    let r = if i % 2 == 0 { radii[i / 2] } else { radii[i / 2] * inner };
                    let a = std::f64::consts::TAU * i as f64 / n as f64;
                    DVec2::new(a.cos(), a.sin()) * r
                })
                .collect();
            let expected = signed_area(&normalize_polygon(&verts).unwrap());
            let parts = decompose(&verts).unwrap();
            let total: f64 = parts.iter().map(|p| signed_area(p)).sum();
            prop_assert!((total - expected).abs() < 1e-6 * expected.max(1.0));
            for p in &parts {
                prop_assert!(is_convex(p));
            }
            prop_assert!(moment_for(1.0, &ShapeDescriptor::polygon(verts)).unwrap() > 0.0);
        }
    }
}
