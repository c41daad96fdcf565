use crate::{
    floating_type_mod::{FT, PI},
    V3,
};

use nalgebra::zero;

/// Below this distance two particles are treated as coincident and the spiky gradient has no direction.
pub const MIN_GRADIENT_DISTANCE: FT = 1e-6;

/**
 * Poly6 smoothing kernel `315 / (64 π h⁹) (h² − r²)³`, zero outside the support radius `h`.
 */
#[inline(always)]
pub fn poly6(r: FT, h: FT) -> FT {
    if r > h {
        return 0.;
    }
    let d = h * h - r * r;
    315. / (64. * PI * h.powi(9)) * d * d * d
}

/// Spiky kernel `15 / (π h⁶) (h − r)³`.
#[inline(always)]
pub fn spiky(r: FT, h: FT) -> FT {
    if r > h {
        return 0.;
    }
    let d = h - r;
    15. / (PI * h.powi(6)) * d * d * d
}

/**
 * Gradient of the spiky kernel with respect to the first particle of the pair, where `r = x_i - x_j`.
 *
 * The magnitude is `-45 / (π h⁶) (h − r)²`, so the result points from `x_i` towards `x_j`.
 * The gradient with respect to `x_j` is the negation of this value.
 */
#[inline(always)]
pub fn spiky_gradient(r: V3, h: FT) -> V3 {
    let r_len = r.norm();
    if r_len > h || r_len <= MIN_GRADIENT_DISTANCE {
        return zero();
    }
    let d = h - r_len;
    r * (-45. / (PI * h.powi(6)) * d * d / r_len)
}

/// Artificial pressure term `-k (W(r) / W(Δq))^n` that keeps particles from clustering.
#[inline(always)]
pub fn tensile_correction(r: FT, h: FT, k: FT, n: i32, delta_q: FT) -> FT {
    let reference = poly6(delta_q, h);
    if reference <= 0. {
        return 0.;
    }
    -k * (poly6(r, h) / reference).powi(n)
}

/// Gradient of the density constraint of particle `i` with respect to its neighbor `j`.
#[inline(always)]
pub fn constraint_gradient_wrt_neighbor(x_ij: V3, h: FT, rest_density: FT) -> V3 {
    -spiky_gradient(x_ij, h) / rest_density
}

/// Gradient of the density constraint of particle `i` with respect to itself.
///
/// This is the negated sum of the gradients with respect to each neighbor.
pub fn constraint_gradient_wrt_self(x_i: V3, neighbor_positions: impl Iterator<Item = V3>, h: FT, rest_density: FT) -> V3 {
    neighbor_positions.fold(zero(), |acc: V3, x_j| acc + spiky_gradient(x_i - x_j, h) / rest_density)
}

#[cfg(test)]
use crate::vec3f;

#[test]
fn kernels_vanish_outside_support() {
    let h = 0.25;
    for r in [0.2501, 0.26, 0.5, 1.0, 100.] {
        assert_eq!(poly6(r, h), 0.);
        assert_eq!(spiky(r, h), 0.);
        assert_eq!(spiky_gradient(vec3f(r, 0., 0.), h), zero::<V3>());
        assert_eq!(spiky_gradient(vec3f(0., -r, 0.), h), zero::<V3>());
    }

    // no sign flip when approaching the support radius
    let below = h * 0.9999;
    assert!(poly6(below, h) >= 0.);
    assert!(spiky(below, h) >= 0.);
    assert_eq!(poly6(h, h), 0.);
    assert_eq!(spiky(h, h), 0.);
    assert_eq!(spiky_gradient(vec3f(0., 0., h), h), zero::<V3>());
}

#[test]
fn spiky_gradient_is_zero_for_coincident_points() {
    assert_eq!(spiky_gradient(zero(), 0.25), zero::<V3>());
    assert_eq!(spiky_gradient(vec3f(1e-7, 0., 0.), 0.25), zero::<V3>());
}

#[test]
fn poly6_peak_value() {
    let h: FT = 0.25;
    let expected = 315. / (64. * PI * h * h * h);
    crate::assert_ft_approx_eq(poly6(0., h), expected, expected * 1e-5, || "poly6(0)".to_string());
}

#[test]
fn spiky_gradient_points_towards_neighbor() {
    let h = 0.25;
    let x_i = vec3f(0., 0., 0.);
    let x_j = vec3f(0.1, 0., 0.);
    let g = spiky_gradient(x_i - x_j, h);
    assert!(g.x > 0.);
    assert_eq!(g.y, 0.);
    assert_eq!(g.z, 0.);
}

#[test]
fn spiky_derivative_test() {
    let h: FT = 0.25;
    let test_grid_size = 24;
    let diff = h * 1e-3;
    let diff_half = diff * 0.5;
    let probe_offset = 2. * h / test_grid_size as FT;

    for z in 0..test_grid_size {
        for y in 0..test_grid_size {
            for x in 0..test_grid_size {
                let probe_point = vec3f(
                    (x as FT + 0.5) * probe_offset - h,
                    (y as FT + 0.5) * probe_offset - h,
                    (z as FT + 0.5) * probe_offset - h,
                );

                // the kernel has a kink at the origin
                if probe_point.norm() < 4. * diff {
                    continue;
                }

                let analytical_deriv = spiky_gradient(probe_point, h);

                let central = |offset: V3| {
                    (spiky((probe_point + offset * diff_half).norm(), h)
                        - spiky((probe_point - offset * diff_half).norm(), h))
                        / diff
                };
                let approx_deriv = vec3f(
                    central(vec3f(1., 0., 0.)),
                    central(vec3f(0., 1., 0.)),
                    central(vec3f(0., 0., 1.)),
                );

                let tolerance = 0.02 * analytical_deriv.norm() + 0.5;
                for d in 0..3 {
                    crate::assert_ft_approx_eq(analytical_deriv[d], approx_deriv[d], tolerance, || {
                        format!("spiky gradient at {:?} component {}", probe_point, d)
                    });
                }
            }
        }
    }
}

#[test]
fn constraint_gradient_symmetry() {
    let h = 0.25;
    let rest_density = 284.;
    let x_i = vec3f(0.01, 0.02, -0.03);
    let neighbors = [
        vec3f(0.1, 0., 0.),
        vec3f(-0.05, 0.12, 0.04),
        vec3f(0.0, -0.2, 0.1),
        vec3f(0.3, 0.3, 0.3),
    ];

    let self_gradient = constraint_gradient_wrt_self(x_i, neighbors.iter().cloned(), h, rest_density);
    let neighbor_sum = neighbors
        .iter()
        .fold(zero::<V3>(), |acc, &x_j| acc + constraint_gradient_wrt_neighbor(x_i - x_j, h, rest_density));

    for d in 0..3 {
        crate::assert_ft_approx_eq(self_gradient[d], -neighbor_sum[d], 1e-5, || {
            format!("gradient symmetry component {}", d)
        });
    }
}

#[test]
fn tensile_correction_is_repulsive_and_local() {
    let h = 0.25;
    let delta_q = 0.2 * h;
    crate::assert_ft_approx_eq(tensile_correction(delta_q, h, 0.2, 4, delta_q), -0.2, 1e-5, || {
        "s_corr at delta q".to_string()
    });
    assert!(tensile_correction(0.1, h, 0.2, 4, delta_q) < 0.);
    assert_eq!(tensile_correction(0.3, h, 0.2, 4, delta_q), 0.);
}
