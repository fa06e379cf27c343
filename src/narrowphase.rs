use glam::DVec2;

use crate::api::{NarrowphaseApi, Overlap, SegmentHit};
use crate::geometry::{Primitive, closest_point_on_segment, convex_contains};
use crate::types::cross;

const EPS: f64 = 1e-12;

/// Narrowphase primitive tests.
pub struct Narrowphase;

/// Outward normal of edge `i` of a counter-clockwise polygon.
fn edge_normal(verts: &[DVec2], i: usize) -> DVec2 {
    let e = verts[(i + 1) % verts.len()] - verts[i];
    DVec2::new(e.y, -e.x).normalize_or_zero()
}

fn capsule_box(p: DVec2, q: DVec2, r: f64) -> [DVec2; 4] {
    let n = (q - p).perp().normalize_or_zero() * r;
    [p - n, q - n, q + n, p + n]
}

fn centroid(verts: &[DVec2]) -> DVec2 {
    verts.iter().copied().sum::<DVec2>() / verts.len().max(1) as f64
}

fn project(points: &[DVec2], axis: DVec2, r: f64) -> (f64, f64) {
    let mut lo = f64::INFINITY;
    let mut hi = f64::NEG_INFINITY;
    for p in points {
        let d = p.dot(axis);
        lo = lo.min(d);
        hi = hi.max(d);
    }
    (lo - r, hi + r)
}

fn segments_cross(a: DVec2, b: DVec2, c: DVec2, d: DVec2) -> bool {
    let d1 = cross(b - a, c - a);
    let d2 = cross(b - a, d - a);
    let d3 = cross(d - c, a - c);
    let d4 = cross(d - c, b - c);
    d1 * d2 <= 0.0 && d3 * d4 <= 0.0
}

/// Closest points between segments `p0q0` and `p1q1`.
fn closest_points_segments(p0: DVec2, q0: DVec2, p1: DVec2, q1: DVec2) -> (DVec2, DVec2) {
    let d0 = q0 - p0;
    let d1 = q1 - p1;
    let r = p0 - p1;
    let a = d0.length_squared();
    let e = d1.length_squared();
    let f = d1.dot(r);
    if a <= EPS && e <= EPS {
        return (p0, p1);
    }
    let (s, t) = if a <= EPS {
        (0.0, (f / e).clamp(0.0, 1.0))
    } else {
        let c = d0.dot(r);
        if e <= EPS {
            ((-c / a).clamp(0.0, 1.0), 0.0)
        } else {
            let b = d0.dot(d1);
            let denom = a * e - b * b;
            let mut s = if denom > EPS { ((b * f - c * e) / denom).clamp(0.0, 1.0) } else { 0.0 };
            let mut t = (b * s + f) / e;
            if t < 0.0 {
                t = 0.0;
                s = (-c / a).clamp(0.0, 1.0);
            } else if t > 1.0 {
                t = 1.0;
                s = ((b - c) / a).clamp(0.0, 1.0);
            }
            (s, t)
        }
    };
    (p0 + d0 * s, p1 + d1 * t)
}

impl NarrowphaseApi for Narrowphase {
    fn segment_circle(a: DVec2, b: DVec2, center: DVec2, r: f64) -> Option<SegmentHit> {
        // Roots of |m + t·d|² = r² with the half-b quadratic; keep the first one on the segment.
        let d = b - a;
        let m = a - center;
        let dd = d.dot(d);
        if dd == 0.0 {
            return None;
        }
        let half_b = m.dot(d);
        let q = half_b * half_b - dd * (m.dot(m) - r * r);
        if q < 0.0 {
            return None;
        }
        let root = q.sqrt();
        let toi = [(-half_b - root) / dd, (-half_b + root) / dd].into_iter().find(|t| (0.0..=1.0).contains(t))?;
        let contact = a + d * toi;
        Some(SegmentHit { toi, normal: (contact - center).normalize_or_zero(), contact })
    }

    fn segment_polygon(a: DVec2, b: DVec2, verts: &[DVec2]) -> Option<SegmentHit> {
        // Cyrus-Beck clipping against the outward face planes.
        let d = b - a;
        let mut t_enter = f64::NEG_INFINITY;
        let mut t_leave = f64::INFINITY;
        let mut n_enter = DVec2::ZERO;
        for i in 0..verts.len() {
            let n = edge_normal(verts, i);
            let num = n.dot(verts[i] - a);
            let den = n.dot(d);
            if den.abs() < EPS {
                if num < 0.0 {
                    return None;
                }
                continue;
            }
            let t = num / den;
            if den < 0.0 {
                if t > t_enter {
                    t_enter = t;
                    n_enter = n;
                }
            } else if t < t_leave {
                t_leave = t;
            }
            if t_enter > t_leave {
                return None;
            }
        }
        if !(0.0..=1.0).contains(&t_enter) {
            return None;
        }
        Some(SegmentHit { toi: t_enter, normal: n_enter, contact: a + d * t_enter })
    }

    fn segment_capsule(a: DVec2, b: DVec2, p: DVec2, q: DVec2, r: f64) -> Option<SegmentHit> {
        let mut best = Self::segment_circle(a, b, p, r);
        let mut consider = |hit: Option<SegmentHit>| {
            if let Some(h) = hit {
                if best.is_none_or(|bh| h.toi < bh.toi) {
                    best = Some(h);
                }
            }
        };
        consider(Self::segment_circle(a, b, q, r));
        if (q - p).length_squared() > EPS && r > 0.0 {
            consider(Self::segment_polygon(a, b, &capsule_box(p, q, r)));
        }
        best
    }

    fn contact_circle_circle(c0: DVec2, r0: f64, c1: DVec2, r1: f64) -> Option<Overlap> {
        let delta = c1 - c0;
        let dist2 = delta.length_squared();
        let rsum = r0 + r1;
        if dist2 > rsum * rsum {
            return None;
        }
        let dist = dist2.sqrt();
        // Coincident centres: pick +x so the pair still separates.
        let normal = if dist > EPS { delta / dist } else { DVec2::X };
        let depth = (rsum - dist).max(0.0);
        let contact = c0 + normal * (r0 - depth * 0.5);
        Some(Overlap { normal, depth, contact })
    }

    fn contact_polygon_circle(verts: &[DVec2], c: DVec2, r: f64) -> Option<Overlap> {
        let n = verts.len();
        let mut best_sep = f64::NEG_INFINITY;
        let mut best_idx = 0;
        for i in 0..n {
            let s = edge_normal(verts, i).dot(c - verts[i]);
            if s > best_sep {
                best_sep = s;
                best_idx = i;
            }
        }
        if best_sep > r {
            return None;
        }
        let face_n = edge_normal(verts, best_idx);
        if best_sep <= EPS {
            // Centre inside the polygon: push out through the least-penetrated face.
            let depth = r - best_sep;
            return Some(Overlap { normal: face_n, depth, contact: c - face_n * best_sep });
        }
        let q = closest_point_on_segment(verts[best_idx], verts[(best_idx + 1) % n], c);
        let d = c - q;
        let dist = d.length();
        if dist > r {
            return None;
        }
        let normal = if dist > EPS { d / dist } else { face_n };
        Some(Overlap { normal, depth: r - dist, contact: q })
    }

    fn contact_polygon_polygon(va: &[DVec2], vb: &[DVec2]) -> Option<Overlap> {
        fn max_separation(p1: &[DVec2], p2: &[DVec2]) -> (f64, usize) {
            let mut best = (f64::NEG_INFINITY, 0);
            for i in 0..p1.len() {
                let n = edge_normal(p1, i);
                let s = p2.iter().map(|v| n.dot(*v - p1[i])).fold(f64::INFINITY, f64::min);
                if s > best.0 {
                    best = (s, i);
                }
            }
            best
        }
        let (sa, ia) = max_separation(va, vb);
        if sa > 0.0 {
            return None;
        }
        let (sb, ib) = max_separation(vb, va);
        if sb > 0.0 {
            return None;
        }
        if sb > sa + 1e-9 {
            // Reference face on B.
            let nb = edge_normal(vb, ib);
            let depth = -sb;
            let deepest = va.iter().copied().min_by(|x, y| nb.dot(*x).total_cmp(&nb.dot(*y))).unwrap_or(DVec2::ZERO);
            Some(Overlap { normal: -nb, depth, contact: deepest + nb * (depth * 0.5) })
        } else {
            let na = edge_normal(va, ia);
            let depth = -sa;
            let deepest = vb.iter().copied().min_by(|x, y| na.dot(*x).total_cmp(&na.dot(*y))).unwrap_or(DVec2::ZERO);
            Some(Overlap { normal: na, depth, contact: deepest + na * (depth * 0.5) })
        }
    }

    fn contact_capsule_circle(p: DVec2, q: DVec2, r: f64, c: DVec2, rc: f64) -> Option<Overlap> {
        let closest = closest_point_on_segment(p, q, c);
        let mut ov = Self::contact_circle_circle(closest, r, c, rc)?;
        if (c - closest).length_squared() <= EPS {
            ov.normal = (q - p).perp().normalize_or(DVec2::Y);
        }
        Some(ov)
    }

    fn contact_capsule_capsule(p0: DVec2, q0: DVec2, r0: f64, p1: DVec2, q1: DVec2, r1: f64) -> Option<Overlap> {
        let (c0, c1) = closest_points_segments(p0, q0, p1, q1);
        let mut ov = Self::contact_circle_circle(c0, r0, c1, r1)?;
        if (c1 - c0).length_squared() <= EPS {
            // Crossing cores: separate along the first segment's normal, toward the second's midpoint.
            let n = (q0 - p0).perp().normalize_or(DVec2::Y);
            let towards = (p1 + q1) * 0.5 - (p0 + q0) * 0.5;
            ov.normal = if n.dot(towards) < 0.0 { -n } else { n };
        }
        Some(ov)
    }

    fn contact_polygon_capsule(verts: &[DVec2], p: DVec2, q: DVec2, r: f64) -> Option<Overlap> {
        let n = verts.len();
        let core_intersects = convex_contains(verts, p)
            || convex_contains(verts, q)
            || (0..n).any(|i| segments_cross(p, q, verts[i], verts[(i + 1) % n]));

        if !core_intersects {
            let mut best: Option<(f64, DVec2, DVec2)> = None;
            let mut offer = |poly_pt: DVec2, seg_pt: DVec2| {
                let d = (seg_pt - poly_pt).length();
                if best.is_none_or(|(bd, _, _)| d < bd) {
                    best = Some((d, poly_pt, seg_pt));
                }
            };
            for i in 0..n {
                let (a, b) = (verts[i], verts[(i + 1) % n]);
                offer(closest_point_on_segment(a, b, p), p);
                offer(closest_point_on_segment(a, b, q), q);
                offer(verts[i], closest_point_on_segment(p, q, verts[i]));
            }
            let (dist, poly_pt, seg_pt) = best?;
            if dist > r {
                return None;
            }
            let normal = if dist > EPS { (seg_pt - poly_pt) / dist } else { (seg_pt - centroid(verts)).normalize_or(DVec2::X) };
            return Some(Overlap { normal, depth: r - dist, contact: poly_pt });
        }

        // Core segment penetrates the polygon: minimum-overlap separating axis.
        let seg = [p, q];
        let mut axes: Vec<DVec2> = (0..n).map(|i| edge_normal(verts, i)).collect();
        let seg_n = (q - p).perp().normalize_or_zero();
        if seg_n != DVec2::ZERO {
            axes.push(seg_n);
        }
        let mut best_depth = f64::INFINITY;
        let mut best_axis = DVec2::X;
        for axis in axes {
            let (amin, amax) = project(verts, axis, 0.0);
            let (bmin, bmax) = project(&seg, axis, r);
            let depth = (amax - bmin).min(bmax - amin);
            if depth < best_depth {
                best_depth = depth;
                best_axis = axis;
            }
        }
        let towards = (p + q) * 0.5 - centroid(verts);
        let normal = if best_axis.dot(towards) < 0.0 { -best_axis } else { best_axis };
        let deepest = if p.dot(normal) < q.dot(normal) { p } else { q };
        Some(Overlap { normal, depth: best_depth.max(0.0), contact: deepest })
    }
}

/// Cast `a -> b`, thickened by `radius`, against one world-space primitive.
///
/// A segment starting inside the (thickened) primitive hits immediately at `toi = 0`.
pub fn cast_segment(prim: &Primitive, a: DVec2, b: DVec2, radius: f64) -> Option<SegmentHit> {
    let (surface, inside) = prim.nearest_surface_point(a);
    if inside || (surface - a).length() <= radius {
        return Some(SegmentHit { toi: 0.0, normal: (a - surface).normalize_or_zero(), contact: a });
    }
    match prim {
        Primitive::Circle { center, radius: r } => Narrowphase::segment_circle(a, b, *center, r + radius),
        Primitive::Segment { a: p, b: q, radius: r } => Narrowphase::segment_capsule(a, b, *p, *q, r + radius),
        Primitive::Polygon { vertices } => {
            let mut best = Narrowphase::segment_polygon(a, b, vertices);
            if radius > 0.0 {
                let n = vertices.len();
                for i in 0..n {
                    if let Some(h) = Narrowphase::segment_capsule(a, b, vertices[i], vertices[(i + 1) % n], radius) {
                        if best.is_none_or(|bh| h.toi < bh.toi) {
                            best = Some(h);
                        }
                    }
                }
            }
            best
        }
    }
}

/// Contact between two world-space primitives, normal pointing from `a` to `b`.
pub fn contact(a: &Primitive, b: &Primitive) -> Option<Overlap> {
    use Primitive::*;
    match (a, b) {
        (Circle { center: c0, radius: r0 }, Circle { center: c1, radius: r1 }) => Narrowphase::contact_circle_circle(*c0, *r0, *c1, *r1),
        (Polygon { vertices }, Circle { center, radius }) => Narrowphase::contact_polygon_circle(vertices, *center, *radius),
        (Circle { center, radius }, Polygon { vertices }) => {
            Narrowphase::contact_polygon_circle(vertices, *center, *radius).map(Overlap::flipped)
        }
        (Polygon { vertices: va }, Polygon { vertices: vb }) => Narrowphase::contact_polygon_polygon(va, vb),
        (Segment { a: p, b: q, radius: r }, Circle { center, radius: rc }) => Narrowphase::contact_capsule_circle(*p, *q, *r, *center, *rc),
        (Circle { center, radius: rc }, Segment { a: p, b: q, radius: r }) => {
            Narrowphase::contact_capsule_circle(*p, *q, *r, *center, *rc).map(Overlap::flipped)
        }
        (Segment { a: p0, b: q0, radius: r0 }, Segment { a: p1, b: q1, radius: r1 }) => {
            Narrowphase::contact_capsule_capsule(*p0, *q0, *r0, *p1, *q1, *r1)
        }
        (Polygon { vertices }, Segment { a: p, b: q, radius: r }) => Narrowphase::contact_polygon_capsule(vertices, *p, *q, *r),
        (Segment { a: p, b: q, radius: r }, Polygon { vertices }) => {
            Narrowphase::contact_polygon_capsule(vertices, *p, *q, *r).map(Overlap::flipped)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(c: DVec2, h: f64) -> Vec<DVec2> {
        vec![c + DVec2::new(-h, -h), c + DVec2::new(h, -h), c + DVec2::new(h, h), c + DVec2::new(-h, h)]
    }

    #[test]
    fn test_contact_circle_circle_basic() {
        let o = Narrowphase::contact_circle_circle(DVec2::ZERO, 1.0, DVec2::new(1.0, 0.0), 1.0).unwrap();
        assert!((o.depth - 1.0).abs() < 1e-12);
        // Normal points from A toward B: (+1, 0)
        assert!((o.normal - DVec2::X).length() < 1e-12);
    }

    #[test]
    fn test_contact_circle_circle_coincident() {
        let o = Narrowphase::contact_circle_circle(DVec2::ZERO, 20.0, DVec2::ZERO, 20.0).unwrap();
        assert_eq!(o.normal, DVec2::X);
        assert!((o.depth - 40.0).abs() < 1e-12);
    }

    #[test]
    fn test_contact_circle_circle_separated() {
        assert!(Narrowphase::contact_circle_circle(DVec2::ZERO, 1.0, DVec2::new(2.5, 0.0), 1.0).is_none());
    }

    #[test]
    fn test_polygon_circle_face_and_vertex() {
        let sq = square(DVec2::ZERO, 1.0);
        let o = Narrowphase::contact_polygon_circle(&sq, DVec2::new(1.5, 0.0), 1.0).unwrap();
        assert!((o.normal - DVec2::X).length() < 1e-12);
        assert!((o.depth - 0.5).abs() < 1e-12);
        let o = Narrowphase::contact_polygon_circle(&sq, DVec2::new(1.5, 1.5), 1.0).unwrap();
        assert!((o.normal - DVec2::new(1.0, 1.0).normalize()).length() < 1e-9);
        assert!(Narrowphase::contact_polygon_circle(&sq, DVec2::new(1.8, 1.8), 1.0).is_none());
    }

    #[test]
    fn test_polygon_circle_centre_inside() {
        let sq = square(DVec2::ZERO, 2.0);
        let o = Narrowphase::contact_polygon_circle(&sq, DVec2::new(1.5, 0.0), 1.0).unwrap();
        assert!((o.normal - DVec2::X).length() < 1e-12);
        assert!((o.depth - 1.5).abs() < 1e-12);
    }

    #[test]
    fn test_polygon_polygon() {
        let a = square(DVec2::ZERO, 1.0);
        let b = square(DVec2::new(1.5, 0.2), 1.0);
        let o = Narrowphase::contact_polygon_polygon(&a, &b).unwrap();
        assert!((o.depth - 0.5).abs() < 1e-9);
        assert!((o.normal - DVec2::X).length() < 1e-9);
        let far = square(DVec2::new(3.1, 0.0), 1.0);
        assert!(Narrowphase::contact_polygon_polygon(&a, &far).is_none());
    }

    #[test]
    fn test_capsules() {
        let o = Narrowphase::contact_capsule_circle(DVec2::new(-5.0, 0.0), DVec2::new(5.0, 0.0), 1.0, DVec2::new(2.0, 1.5), 1.0).unwrap();
        assert!((o.normal - DVec2::Y).length() < 1e-12);
        assert!((o.depth - 0.5).abs() < 1e-12);
        let o = Narrowphase::contact_capsule_capsule(
            DVec2::new(-5.0, 0.0),
            DVec2::new(5.0, 0.0),
            1.0,
            DVec2::new(0.0, 1.5),
            DVec2::new(0.0, 10.0),
            1.0,
        )
        .unwrap();
        assert!((o.normal - DVec2::Y).length() < 1e-12);
    }

    #[test]
    fn test_polygon_capsule_near_and_crossing() {
        let sq = square(DVec2::ZERO, 1.0);
        let o = Narrowphase::contact_polygon_capsule(&sq, DVec2::new(1.5, -3.0), DVec2::new(1.5, 3.0), 1.0).unwrap();
        assert!((o.normal - DVec2::X).length() < 1e-12);
        assert!((o.depth - 0.5).abs() < 1e-12);
        let o = Narrowphase::contact_polygon_capsule(&sq, DVec2::new(0.5, -3.0), DVec2::new(0.5, 3.0), 0.25).unwrap();
        assert!(o.depth > 0.0);
        assert!(Narrowphase::contact_polygon_capsule(&sq, DVec2::new(3.0, -3.0), DVec2::new(3.0, 3.0), 1.0).is_none());
    }

    // --- Segments ---------------------------------------------------------

    #[test]
    fn test_segment_circle_basic() {
        let hit = Narrowphase::segment_circle(DVec2::new(-2.0, 0.0), DVec2::new(2.0, 0.0), DVec2::ZERO, 1.0).unwrap();
        assert!((hit.toi - 0.25).abs() < 1e-12);
        assert!((hit.contact.x + 1.0).abs() < 1e-12);
        assert!((hit.normal.x + 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_segment_polygon_hit_and_miss() {
        let sq = square(DVec2::ZERO, 1.0);
        let hit = Narrowphase::segment_polygon(DVec2::new(-3.0, 0.0), DVec2::new(3.0, 0.0), &sq).unwrap();
        assert!((hit.toi - 1.0 / 3.0).abs() < 1e-12);
        assert!((hit.normal + DVec2::X).length() < 1e-12);
        assert!(Narrowphase::segment_polygon(DVec2::new(-3.0, 2.0), DVec2::new(3.0, 2.0), &sq).is_none());
        assert!(Narrowphase::segment_polygon(DVec2::new(-3.0, 0.0), DVec2::new(-2.0, 0.0), &sq).is_none());
    }

    #[test]
    fn test_segment_capsule_hits_rounded_end() {
        let hit = Narrowphase::segment_capsule(DVec2::new(-10.0, 0.0), DVec2::new(10.0, 0.0), DVec2::ZERO, DVec2::new(5.0, 0.0), 1.0).unwrap();
        assert!((hit.contact.x + 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_cast_starting_inside_hits_at_zero() {
        let prim = Primitive::Circle { center: DVec2::ZERO, radius: 5.0 };
        let hit = cast_segment(&prim, DVec2::ZERO, DVec2::new(100.0, 0.0), 0.0).unwrap();
        assert_eq!(hit.toi, 0.0);
    }

    #[test]
    fn test_thick_cast_against_polygon() {
        let prim = Primitive::Polygon { vertices: square(DVec2::ZERO, 1.0) };
        assert!(cast_segment(&prim, DVec2::new(-5.0, 1.5), DVec2::new(5.0, 1.5), 0.0).is_none());
        let hit = cast_segment(&prim, DVec2::new(-5.0, 1.5), DVec2::new(5.0, 1.5), 1.0).unwrap();
        assert!(hit.toi > 0.0 && hit.toi < 0.5);
    }

    #[test]
    fn test_contact_dispatch_flips_normal() {
        let circle = Primitive::Circle { center: DVec2::new(1.5, 0.0), radius: 1.0 };
        let poly = Primitive::Polygon { vertices: square(DVec2::ZERO, 1.0) };
        let ab = contact(&poly, &circle).unwrap();
        let ba = contact(&circle, &poly).unwrap();
        assert!((ab.normal + ba.normal).length() < 1e-12);
    }
}
