use enum_dispatch::enum_dispatch;
use serde::{Deserialize, Serialize};

use crate::{error::ConfigError, floating_type_mod::FT, vec3f, V3};

/// Below this distance from a sphere center the ray direction is undefined.
const MIN_DIRECTION_LENGTH: FT = 1e-9;

#[enum_dispatch]
pub trait Collider {
    /// Returns the corrected predicted position. `old_position` is the committed position at the start of the step.
    fn project(&self, old_position: V3, predicted_position: V3) -> V3;
}

/**
 * Half space boundary. Fluid lives on the side the normal points to.
 */
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Plane {
    pub point: V3,
    pub normal: V3,
}

impl Plane {
    pub fn new(point: V3, normal: V3) -> Self {
        Plane {
            point,
            normal: normal.normalize(),
        }
    }

    pub fn signed_distance(&self, x: V3) -> FT {
        self.normal.dot(&(x - self.point))
    }
}

impl Collider for Plane {
    fn project(&self, old_position: V3, predicted_position: V3) -> V3 {
        let before = self.signed_distance(old_position);
        let after = self.signed_distance(predicted_position);

        if after >= 0. {
            predicted_position
        } else if before > 0. {
            // crossed the plane during this step
            predicted_position - self.normal * (2. * after)
        } else {
            // was already on or behind the plane, a reflection would leave it behind
            predicted_position - self.normal * after
        }
    }
}

/// Solid ball obstacle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sphere {
    pub center: V3,
    pub radius: FT,
}

impl Sphere {
    pub fn new(center: V3, radius: FT) -> Self {
        Sphere { center, radius }
    }
}

impl Collider for Sphere {
    fn project(&self, _old_position: V3, predicted_position: V3) -> V3 {
        let offset = predicted_position - self.center;
        let distance = offset.norm();
        if distance >= self.radius {
            return predicted_position;
        }

        let direction = if distance > MIN_DIRECTION_LENGTH {
            offset / distance
        } else {
            vec3f(0., 1., 0.)
        };
        self.center + direction * self.radius
    }
}

/**
 * Solid axis aligned box obstacle. A point inside is pushed out through the closest face.
 * Ties between faces resolve in x, y, z order and towards the positive side.
 */
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Cube {
    pub center: V3,
    pub half_extent: FT,
}

impl Cube {
    pub fn new(center: V3, half_extent: FT) -> Self {
        Cube { center, half_extent }
    }
}

impl Collider for Cube {
    fn project(&self, _old_position: V3, predicted_position: V3) -> V3 {
        let offset = predicted_position - self.center;
        if offset.iter().any(|d| d.abs() >= self.half_extent) {
            return predicted_position;
        }

        let mut axis = 0;
        for d in 1..3 {
            if offset[d].abs() > offset[axis].abs() {
                axis = d;
            }
        }

        let mut result = predicted_position;
        let side = if offset[axis] >= 0. { 1. } else { -1. };
        result[axis] = self.center[axis] + side * self.half_extent;
        result
    }
}

#[enum_dispatch(Collider)]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Boundary {
    Plane(Plane),
    Sphere(Sphere),
    Cube(Cube),
}

impl Boundary {
    /// Checks the geometric parameters and normalizes plane normals.
    pub fn validated(self) -> Result<Boundary, ConfigError> {
        fn finite(v: V3) -> bool {
            v.iter().all(|x| x.is_finite())
        }

        match self {
            Boundary::Plane(plane) => {
                let length = plane.normal.norm();
                if !finite(plane.point) || !finite(plane.normal) || length <= MIN_DIRECTION_LENGTH {
                    return Err(ConfigError::InvalidScene(format!(
                        "plane at {:?} needs a finite non-zero normal",
                        plane.point
                    )));
                }
                Ok(Plane::new(plane.point, plane.normal).into())
            }
            Boundary::Sphere(sphere) => {
                if !finite(sphere.center) || !(sphere.radius > 0.) || !sphere.radius.is_finite() {
                    return Err(ConfigError::InvalidScene(format!(
                        "sphere at {:?} needs a finite positive radius",
                        sphere.center
                    )));
                }
                Ok(self)
            }
            Boundary::Cube(cube) => {
                if !finite(cube.center) || !(cube.half_extent > 0.) || !cube.half_extent.is_finite() {
                    return Err(ConfigError::InvalidScene(format!(
                        "cube at {:?} needs a finite positive half extent",
                        cube.center
                    )));
                }
                Ok(self)
            }
        }
    }

    /// Floor, walls and ceiling of the box `[-1, 1] x [0, 2] x [-1, 1]`, normals pointing inwards.
    pub fn unit_box() -> Vec<Boundary> {
        vec![
            Plane::new(vec3f(0., 0., 0.), vec3f(0., 1., 0.)).into(),
            Plane::new(vec3f(-1., 0., 0.), vec3f(1., 0., 0.)).into(),
            Plane::new(vec3f(1., 0., 0.), vec3f(-1., 0., 0.)).into(),
            Plane::new(vec3f(0., 0., -1.), vec3f(0., 0., 1.)).into(),
            Plane::new(vec3f(0., 0., 1.), vec3f(0., 0., -1.)).into(),
            Plane::new(vec3f(0., 2., 0.), vec3f(0., -1., 0.)).into(),
        ]
    }
}

/// Runs all boundaries in list order. Later boundaries see the output of earlier ones.
pub fn resolve_collisions(boundaries: &[Boundary], old_position: V3, predicted_position: V3) -> V3 {
    boundaries
        .iter()
        .fold(predicted_position, |p, boundary| boundary.project(old_position, p))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assert_ft_approx_eq;

    fn floor() -> Plane {
        Plane::new(vec3f(0., 0., 0.), vec3f(0., 1., 0.))
    }

    #[test]
    fn plane_keeps_points_in_front() {
        let p = vec3f(0.3, 0.5, -0.2);
        assert_eq!(floor().project(vec3f(0.3, 0.6, -0.2), p), p);
    }

    #[test]
    fn plane_reflects_crossing_points() {
        let projected = floor().project(vec3f(0., 0.1, 0.), vec3f(0.2, -0.05, 0.));
        assert_ft_approx_eq(projected.y, 0.05, 1e-6, || "reflected y".to_string());
        assert_eq!(projected.x, 0.2);
        assert_eq!(projected.z, 0.);
    }

    #[test]
    fn plane_projects_points_that_start_on_the_surface() {
        let projected = floor().project(vec3f(0.3, 0., 0.2), vec3f(0.3, -0.0025, 0.2));
        assert_eq!(projected, vec3f(0.3, 0., 0.2));
    }

    #[test]
    fn plane_projects_points_that_start_behind() {
        let projected = floor().project(vec3f(0., -0.5, 0.), vec3f(0., -0.6, 0.));
        assert_eq!(projected, vec3f(0., 0., 0.));
    }

    #[test]
    fn plane_normal_is_normalized() {
        let wall = Plane::new(vec3f(1., 0., 0.), vec3f(-3., 0., 0.));
        assert_eq!(wall.normal, vec3f(-1., 0., 0.));
        let projected = wall.project(vec3f(0.9, 1., 0.), vec3f(1.1, 1., 0.));
        assert_ft_approx_eq(projected.x, 0.9, 1e-6, || "reflected x".to_string());
    }

    #[test]
    fn sphere_projects_inside_points_to_surface() {
        let sphere = Sphere::new(vec3f(0.5, 0.5, 0.5), 0.3);
        let inside = vec3f(0.6, 0.55, 0.45);
        let projected = sphere.project(inside, inside);
        let offset = projected - sphere.center;
        assert_ft_approx_eq(offset.norm(), 0.3, 1e-6, || "distance to center".to_string());

        // along the same ray
        let dir_before = (inside - sphere.center).normalize();
        let dir_after = offset.normalize();
        assert_ft_approx_eq(dir_before.dot(&dir_after), 1., 1e-6, || "ray direction".to_string());
    }

    #[test]
    fn sphere_leaves_outside_points_alone() {
        let sphere = Sphere::new(vec3f(0., 0., 0.), 0.3);
        let p = vec3f(0.3, 0.1, 0.);
        assert_eq!(sphere.project(p, p), p);
    }

    #[test]
    fn sphere_center_uses_fallback_direction() {
        let sphere = Sphere::new(vec3f(1., 1., 1.), 0.5);
        let projected = sphere.project(sphere.center, sphere.center);
        assert_eq!(projected, vec3f(1., 1.5, 1.));
    }

    #[test]
    fn cube_pushes_out_through_nearest_face() {
        let cube = Cube::new(vec3f(0., 0., 0.), 0.5);
        assert_eq!(cube.project(zero3(), vec3f(0.1, 0.45, -0.2)), vec3f(0.1, 0.5, -0.2));
        assert_eq!(cube.project(zero3(), vec3f(-0.4, 0.1, 0.2)), vec3f(-0.5, 0.1, 0.2));
        assert_eq!(cube.project(zero3(), vec3f(0.1, 0.1, -0.3)), vec3f(0.1, 0.1, -0.5));
    }

    #[test]
    fn cube_center_and_outside() {
        let cube = Cube::new(vec3f(0., 0., 0.), 0.5);
        assert_eq!(cube.project(zero3(), zero3()), vec3f(0.5, 0., 0.));
        let outside = vec3f(0.6, 0., 0.);
        assert_eq!(cube.project(zero3(), outside), outside);
        let on_face = vec3f(0.5, 0.2, 0.);
        assert_eq!(cube.project(zero3(), on_face), on_face);
    }

    #[test]
    fn later_boundaries_override_earlier_ones() {
        let boundaries: Vec<Boundary> = vec![
            Plane::new(vec3f(0., 0., 0.), vec3f(0., 1., 0.)).into(),
            Sphere::new(vec3f(0., 0., 0.), 0.2).into(),
        ];
        let projected = resolve_collisions(&boundaries, vec3f(0., 0.1, 0.), vec3f(0., -0.05, 0.));
        assert_ft_approx_eq(projected.y, 0.2, 1e-6, || "pushed out of the sphere".to_string());
    }

    #[test]
    fn validation_normalizes_and_rejects() {
        let plane: Boundary = Plane {
            point: vec3f(0., 0., 0.),
            normal: vec3f(0., 2., 0.),
        }
        .into();
        match plane.validated() {
            Ok(Boundary::Plane(p)) => assert_eq!(p.normal, vec3f(0., 1., 0.)),
            other => panic!("unexpected {:?}", other),
        }

        let degenerate: Boundary = Plane {
            point: vec3f(0., 0., 0.),
            normal: vec3f(0., 0., 0.),
        }
        .into();
        assert!(degenerate.validated().is_err());
        assert!(Boundary::from(Sphere::new(zero3(), -1.)).validated().is_err());
        assert!(Boundary::from(Cube::new(zero3(), 0.)).validated().is_err());
    }

    #[test]
    fn boundaries_deserialize_from_tagged_yaml() {
        let yaml = "
- type: plane
  point: [0.0, 0.0, 0.0]
  normal: [0.0, 1.0, 0.0]
- type: sphere
  center: [0.0, 0.5, 0.0]
  radius: 0.25
- type: cube
  center: [0.5, 0.5, 0.5]
  half_extent: 0.1
";
        let boundaries: Vec<Boundary> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(boundaries.len(), 3);
        assert!(matches!(boundaries[0], Boundary::Plane(_)));
        assert_eq!(boundaries[1], Boundary::Sphere(Sphere::new(vec3f(0., 0.5, 0.), 0.25)));
        assert_eq!(boundaries[2], Boundary::Cube(Cube::new(vec3f(0.5, 0.5, 0.5), 0.1)));
    }

    fn zero3() -> V3 {
        vec3f(0., 0., 0.)
    }
}
