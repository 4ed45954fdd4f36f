//! Geometric kernel for the platform kinematics.
//!
//! Inverse kinematics only needs the attitude matrix and vector norms;
//! the interesting part is the forward direction, solved by
//! trilateration: intersect two actuator spheres into a circle, cut that
//! circle with a third sphere, and pick the mechanically feasible
//! candidate. All lengths are in metres, angles in radians.

use glam::{DMat3, DVec3};
use thiserror::Error;

/// Geometric tolerance for degeneracy decisions.
const PRECISION: f64 = 1e-5;

#[derive(Debug, Clone, Error)]
pub enum GeometryError {
    /// The spheres share no surface point
    #[error("spheres do not intersect")]
    SpheresDisjoint,

    /// Sphere centres coincide, the intersection is not a circle
    #[error("spheres are concentric")]
    ConcentricSpheres,

    /// Trilateration found no candidate point
    #[error("no intersection point found")]
    NoIntersection,
}

/// A circle in space: centre, radius and unit plane normal.
#[derive(Debug, Clone, Copy)]
pub struct Circle {
    pub centre: DVec3,
    pub radius: f64,
    pub normal: DVec3,
}

/// Attitude matrix for ZYX Euler angles: roll about x, then pitch about
/// y, then yaw about z.
pub fn rotation_matrix(roll: f64, pitch: f64, yaw: f64) -> DMat3 {
    DMat3::from_rotation_z(yaw) * DMat3::from_rotation_y(pitch) * DMat3::from_rotation_x(roll)
}

/// Intersect two spheres into a circle.
pub fn sphere_sphere_intersection(
    centre_a: DVec3,
    radius_a: f64,
    centre_b: DVec3,
    radius_b: f64,
) -> Result<Circle, GeometryError> {
    let span = centre_b - centre_a;
    let distance = span.length();
    if distance <= PRECISION {
        return Err(GeometryError::ConcentricSpheres);
    }

    // Relative position of the radical plane along the centre line.
    let relative =
        0.5 + (radius_a * radius_a - radius_b * radius_b) / (2.0 * distance * distance);
    let radius_squared = radius_a * radius_a - (distance * relative) * (distance * relative);
    if radius_squared < -PRECISION {
        return Err(GeometryError::SpheresDisjoint);
    }

    Ok(Circle {
        centre: centre_a + relative * span,
        radius: radius_squared.max(0.0).sqrt(),
        normal: span / distance,
    })
}

/// Intersect a circle with a sphere: zero, one or two points.
pub fn circle_sphere_intersections(circle: &Circle, centre: DVec3, radius: f64) -> Vec<DVec3> {
    // Cut the sphere with the circle's plane.
    let height = circle.normal.dot(circle.centre - centre);
    if height.abs() > radius + PRECISION {
        return Vec::new();
    }
    let cut_centre = centre + height * circle.normal;
    let cut_radius = (radius * radius - height * height).max(0.0).sqrt();

    // Two coplanar circles now.
    let span = cut_centre - circle.centre;
    let distance = span.length();
    if distance <= PRECISION
        || distance > circle.radius + cut_radius + PRECISION
        || distance < (circle.radius - cut_radius).abs() - PRECISION
    {
        return Vec::new();
    }

    let along = (circle.radius * circle.radius - cut_radius * cut_radius
        + distance * distance)
        / (2.0 * distance);
    let chord_squared = circle.radius * circle.radius - along * along;
    let foot = circle.centre + (along / distance) * span;
    if chord_squared <= PRECISION * PRECISION {
        return vec![foot];
    }

    let direction = circle.normal.cross(span / distance);
    let chord = chord_squared.sqrt();
    vec![foot + chord * direction, foot - chord * direction]
}

/// Find the point at the given distances from three known points.
///
/// With two candidates the one above the base plane wins; the platform
/// cannot fold through its own base.
pub fn trilaterate(centres: [DVec3; 3], radii: [f64; 3]) -> Result<DVec3, GeometryError> {
    let circle = sphere_sphere_intersection(centres[0], radii[0], centres[1], radii[1])?;
    let candidates = circle_sphere_intersections(&circle, centres[2], radii[2]);
    match candidates.as_slice() {
        [] => Err(GeometryError::NoIntersection),
        [only] => Ok(*only),
        [first, second, ..] => Ok(if first.z > 0.0 { *first } else { *second }),
    }
}
