use crate::simulation::boundary::{resolve_collisions, Boundary};
use crate::simulation::concurrency::{par_iter_mut1, par_iter_mut2, par_iter_reduce1};
use crate::simulation::error::{read_file, ConfigError};
use crate::simulation::neighborhood_search::{NeighborhoodCache, SpatialGrid};
use crate::simulation::simulation_parameters::SimulationParams;
use crate::simulation::sph_kernels::{
    constraint_gradient_wrt_neighbor, constraint_gradient_wrt_self, poly6, spiky_gradient, tensile_correction,
};
use crate::{floating_type_mod::FT, vec3f, V3};

use std::collections::HashMap;
use std::fmt::{Display, Write};
use std::path::Path;
use std::time::{Duration, Instant};

use nalgebra::zero;
use num_traits::Float;
use serde::{Deserialize, Serialize};

/// Guards the normalization of the vorticity location vector.
const VORTICITY_NORMALIZATION_EPSILON: FT = 1e-6;

#[derive(Clone)]
struct Counter<T> {
    values: Vec<T>,
    last_start: Instant,
}
impl<T> Counter<T> {
    fn new() -> Self {
        Counter::<T> {
            last_start: Instant::now(),
            values: Vec::new(),
        }
    }
    fn add_value(&mut self, v: T) {
        self.values.push(v);
    }
}
impl Counter<FT> {
    fn avg(&self) -> FT {
        self.values.iter().cloned().sum::<FT>() / self.values.len() as FT
    }
    fn min(&self) -> FT {
        self.values.iter().cloned().fold(FT::MAX, FT::min)
    }
    fn max(&self) -> FT {
        self.values.iter().cloned().fold(FT::MIN, FT::max)
    }
}
impl Counter<Duration> {
    fn begin(&mut self) {
        self.last_start = Instant::now();
    }

    fn end(&mut self) {
        self.values.push(Instant::now() - self.last_start);
    }

    fn avg(&self) -> Duration {
        if self.values.is_empty() {
            return Duration::ZERO;
        }
        self.values.iter().cloned().sum::<Duration>() / self.values.len() as u32
    }

    fn sum(&self) -> Duration {
        self.values.iter().cloned().sum::<Duration>()
    }
}

struct ValueCounters {
    counters: HashMap<String, Counter<FT>>,
    enabled: bool,
}
impl ValueCounters {
    fn new(enabled: bool) -> ValueCounters {
        ValueCounters {
            counters: HashMap::default(),
            enabled,
        }
    }

    fn add_value(&mut self, id: &str, v: FT) {
        if self.enabled {
            self.counters
                .entry(id.to_string())
                .or_insert_with(Counter::<FT>::new)
                .add_value(v);
        }
    }
}

struct PerformanceCounters {
    counters: HashMap<String, Counter<Duration>>,
    enabled: bool,
}
impl PerformanceCounters {
    fn new(enabled: bool) -> PerformanceCounters {
        PerformanceCounters {
            counters: HashMap::default(),
            enabled,
        }
    }

    fn begin(&mut self, id: &str) {
        if self.enabled {
            self.counters
                .entry(id.to_string())
                .or_insert_with(Counter::<Duration>::new)
                .begin();
        }
    }
    fn end(&mut self, id: &str) {
        if self.enabled {
            if let Some(counter) = self.counters.get_mut(id) {
                counter.end();
            }
        }
    }
}

macro_rules! decl_particle_vec {
    (pub struct $struct_name:ident { $(pub $field_name:ident: Vec<$field_type:ty> | $default_value:expr),*$(,)?  }) => {
        pub struct $struct_name {
            $(
                pub $field_name : Vec<$field_type>,
            )*
        }

        impl $struct_name {
            pub fn default(len: usize) -> Self {
                Self {
                    $(
                        $field_name: (0..len).map(|_| $default_value).collect::<Vec<$field_type>>(),
                    )*
                }
            }
        }
    }
}

decl_particle_vec! {
    pub struct ParticleVec {
        // committed at the end of each step
        pub position: Vec<V3> | zero(),

        // working position during the step
        pub predicted_position: Vec<V3> | zero(),

        pub velocity: Vec<V3> | zero(),
        pub velocity_temp: Vec<V3> | zero(),

        // values of the last solver iteration
        pub density: Vec<FT> | 0.,
        pub lambda: Vec<FT> | 0.,
        pub delta_p: Vec<V3> | zero(),

        pub vorticity: Vec<V3> | zero(),
        pub vorticity_direction: Vec<V3> | zero(),
    }
}

impl ParticleVec {
    pub fn len(&self) -> usize {
        self.position.len()
    }

    pub fn is_empty(&self) -> bool {
        self.position.is_empty()
    }
}

fn unit_mass() -> FT {
    1.
}

/// Initial state of one particle. The mass is accepted for compatibility and ignored, all particles have unit mass.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParticleInit {
    pub position: V3,
    #[serde(default = "zero_velocity")]
    pub velocity: V3,
    #[serde(default = "unit_mass")]
    pub mass: FT,
}

impl ParticleInit {
    pub fn at_rest(position: V3) -> Self {
        ParticleInit {
            position,
            velocity: zero(),
            mass: 1.,
        }
    }
}

pub struct FluidSimulation {
    particles: ParticleVec,
    neighs: NeighborhoodCache,
    grid: SpatialGrid,
    boundaries: Vec<Boundary>,
    params: SimulationParams,
    time: FT,

    pcounters: PerformanceCounters,
    vcounters: ValueCounters,

    step_number: usize,
}

impl FluidSimulation {
    pub fn new(
        initial_particles: Vec<ParticleInit>,
        boundaries: Vec<Boundary>,
        params: SimulationParams,
        counters_enabled: bool,
    ) -> Result<Self, ConfigError> {
        params.validate()?;
        let boundaries = boundaries
            .into_iter()
            .map(Boundary::validated)
            .collect::<Result<Vec<_>, _>>()?;

        let num_particles = initial_particles.len();
        let mut particles = ParticleVec::default(num_particles);
        for (i, p) in initial_particles.iter().enumerate() {
            particles.position[i] = p.position;
            particles.predicted_position[i] = p.position;
            particles.velocity[i] = p.velocity;
        }

        log::info!(
            "created fluid simulation with {} particles and {} boundaries",
            num_particles,
            boundaries.len()
        );

        Ok(FluidSimulation {
            particles,
            neighs: NeighborhoodCache::new(num_particles),
            grid: SpatialGrid::new(params.kernel_h),
            boundaries,
            params,
            time: 0.,
            step_number: 0,
            pcounters: PerformanceCounters::new(counters_enabled),
            vcounters: ValueCounters::new(counters_enabled),
        })
    }

    pub fn particle_count(&self) -> usize {
        self.particles.len()
    }

    pub fn position_of(&self, i: usize) -> V3 {
        self.particles.position[i]
    }

    pub fn try_position_of(&self, i: usize) -> Option<V3> {
        self.particles.position.get(i).copied()
    }

    pub fn velocity_of(&self, i: usize) -> V3 {
        self.particles.velocity[i]
    }

    /// Committed positions of all particles.
    pub fn positions(&self) -> &[V3] {
        &self.particles.position
    }

    pub fn densities(&self) -> &[FT] {
        &self.particles.density
    }

    pub fn particles(&self) -> &ParticleVec {
        &self.particles
    }

    /// Moves a particle between steps. The predicted position follows so the next step starts from here.
    pub fn set_position(&mut self, i: usize, position: V3) {
        self.particles.position[i] = position;
        self.particles.predicted_position[i] = position;
    }

    pub fn set_velocity(&mut self, i: usize, velocity: V3) {
        self.particles.velocity[i] = velocity;
    }

    pub fn neighbor_count(&self, i: usize) -> usize {
        self.neighs.neighbor_count(i)
    }

    pub fn boundaries(&self) -> &[Boundary] {
        &self.boundaries
    }

    pub fn params(&self) -> &SimulationParams {
        &self.params
    }

    pub fn set_params(&mut self, params: SimulationParams) -> Result<(), ConfigError> {
        params.validate()?;
        if params.kernel_h != self.grid.cell_size() {
            self.grid.set_cell_size(params.kernel_h);
        }
        self.params = params;
        Ok(())
    }

    pub fn time(&self) -> FT {
        self.time
    }

    pub fn step_number(&self) -> usize {
        self.step_number
    }

    /// Mean of `|density / rest_density - 1|` from the last solver iteration.
    pub fn average_density_error(&self) -> FT {
        if self.particles.is_empty() {
            return 0.;
        }
        let rest_density = self.params.rest_density;
        let sum = par_iter_reduce1(
            &self.particles.density,
            || 0.,
            |a, b| a + b,
            |_, &density| (density / rest_density - 1.).abs(),
        );
        sum / self.particles.len() as FT
    }

    fn compute_density_and_lambda(
        params: &SimulationParams,
        position: &[V3],
        neighs: &NeighborhoodCache,
        density: &mut [FT],
        lambda: &mut [FT],
    ) {
        let h = params.kernel_h;
        let rest_density = params.rest_density;
        let self_density = poly6(0., h);

        par_iter_mut2(density, lambda, |i, p_density, p_lambda| {
            let x_i = position[i];

            let mut rho = self_density;
            let mut grad_sum_sq = 0.;

            for j in neighs.iter(i) {
                let x_ij = x_i - position[j];
                rho += poly6(x_ij.norm(), h);
                grad_sum_sq += constraint_gradient_wrt_neighbor(x_ij, h, rest_density).norm_squared();
            }
            let grad_wrt_self =
                constraint_gradient_wrt_self(x_i, neighs.iter(i).map(|j| position[j]), h, rest_density);
            grad_sum_sq += grad_wrt_self.norm_squared();

            let mut constraint = rho / rest_density - 1.;
            if params.clamp_density_constraint {
                constraint = FT::max(constraint, 0.);
            }

            *p_density = rho;
            *p_lambda = -constraint / (grad_sum_sq + params.cfm_epsilon);
        });
    }

    fn compute_position_correction(
        params: &SimulationParams,
        position: &[V3],
        lambda: &[FT],
        neighs: &NeighborhoodCache,
        delta_p: &mut [V3],
    ) {
        let h = params.kernel_h;

        par_iter_mut1(delta_p, |i, p_delta_p| {
            let x_i = position[i];
            let mut sum: V3 = zero();
            for j in neighs.iter(i) {
                let x_ij = x_i - position[j];
                let s_corr = tensile_correction(
                    x_ij.norm(),
                    h,
                    params.tensile_k,
                    params.tensile_n,
                    params.tensile_delta_q,
                );
                sum += spiky_gradient(x_ij, h) * (lambda[i] + lambda[j] + s_corr);
            }
            *p_delta_p = sum / params.rest_density;
        });
    }

    fn apply_correction_and_collide(
        predicted_position: &mut [V3],
        delta_p: &[V3],
        position: &[V3],
        boundaries: &[Boundary],
    ) {
        par_iter_mut1(predicted_position, |i, p_predicted| {
            *p_predicted = resolve_collisions(boundaries, position[i], *p_predicted + delta_p[i]);
        });
    }

    fn compute_vorticity(position: &[V3], velocity: &[V3], neighs: &NeighborhoodCache, h: FT, vorticity: &mut [V3]) {
        par_iter_mut1(vorticity, |i, p_vorticity| {
            let mut omega: V3 = zero();
            for j in neighs.iter(i) {
                let v_ij = velocity[j] - velocity[i];
                // gradient with respect to the neighbor
                let grad_j = -spiky_gradient(position[i] - position[j], h);
                omega += v_ij.cross(&grad_j);
            }
            *p_vorticity = omega;
        });
    }

    fn compute_vorticity_direction(
        position: &[V3],
        vorticity: &[V3],
        neighs: &NeighborhoodCache,
        h: FT,
        vorticity_direction: &mut [V3],
    ) {
        par_iter_mut1(vorticity_direction, |i, p_direction| {
            let mut eta: V3 = zero();
            for j in neighs.iter(i) {
                eta += spiky_gradient(position[i] - position[j], h) * vorticity[j].norm();
            }
            *p_direction = eta / (eta.norm() + VORTICITY_NORMALIZATION_EPSILON);
        });
    }

    fn apply_vorticity_confinement(
        vorticity: &[V3],
        vorticity_direction: &[V3],
        vorticity_epsilon: FT,
        dt: FT,
        velocity: &mut [V3],
    ) {
        par_iter_mut1(velocity, |i, v| {
            *v += vorticity_direction[i].cross(&vorticity[i]) * (vorticity_epsilon * dt);
        });
    }

    fn apply_xsph_viscosity(
        position: &[V3],
        velocity_snapshot: &[V3],
        neighs: &NeighborhoodCache,
        h: FT,
        viscosity_c: FT,
        velocity: &mut [V3],
    ) {
        par_iter_mut1(velocity, |i, p_velocity| {
            let mut sum: V3 = zero();
            for j in neighs.iter(i) {
                sum += (velocity_snapshot[j] - velocity_snapshot[i]) * poly6((position[i] - position[j]).norm(), h);
            }
            *p_velocity = velocity_snapshot[i] + sum * viscosity_c;
        });
    }

    /// Runs one full step. A non-positive or non-finite `dt` leaves the state untouched.
    pub fn advance(&mut self, dt: FT) {
        if !(dt > 0.) || !dt.is_finite() {
            log::warn!("ignoring step with invalid time step {}", dt);
            return;
        }

        log::debug!("begin step {} at time {}", self.step_number, self.time);

        self.vcounters.add_value("particle-count", self.particles.len() as FT);
        self.pcounters.begin("simulation-step");

        let params = self.params;
        let h = params.kernel_h;
        let particles = &mut self.particles;

        // external forces, unit mass
        let gravity = params.gravity_vector();
        par_iter_mut1(&mut particles.velocity, |_, v| *v += gravity * dt);

        {
            let position = &particles.position;
            let velocity = &particles.velocity;
            par_iter_mut1(&mut particles.predicted_position, |i, p| *p = position[i] + velocity[i] * dt);
        }

        self.pcounters.begin("neighborhood");
        self.neighs
            .build_neighborhood_list_grid(&mut self.grid, &particles.predicted_position, h);
        if params.check_neighborhood {
            log::debug!("slow: checking neighborhood against brute force search");
            let num_mismatches = self.neighs.check_against_brute_force(&particles.predicted_position, h);
            if num_mismatches > 0 {
                log::warn!("{} particles have a wrong neighbor list", num_mismatches);
            }
        }
        self.pcounters.end("neighborhood");

        self.pcounters.begin("constraint-solve");
        let mut max_correction = 0.;
        for iteration in 0..params.solver_iterations {
            Self::compute_density_and_lambda(
                &params,
                &particles.predicted_position,
                &self.neighs,
                &mut particles.density,
                &mut particles.lambda,
            );

            Self::compute_position_correction(
                &params,
                &particles.predicted_position,
                &particles.lambda,
                &self.neighs,
                &mut particles.delta_p,
            );

            // every correction of this iteration is known before any position moves
            Self::apply_correction_and_collide(
                &mut particles.predicted_position,
                &particles.delta_p,
                &particles.position,
                &self.boundaries,
            );

            max_correction = par_iter_reduce1(&particles.delta_p, || 0., FT::max, |_, d| d.norm());
            log::trace!("iteration {}: max correction {}", iteration, max_correction);
        }
        self.pcounters.end("constraint-solve");

        {
            let position = &particles.position;
            let predicted_position = &particles.predicted_position;
            par_iter_mut1(&mut particles.velocity, |i, v| *v = (predicted_position[i] - position[i]) / dt);
        }

        self.pcounters.begin("vorticity");
        Self::compute_vorticity(
            &particles.predicted_position,
            &particles.velocity,
            &self.neighs,
            h,
            &mut particles.vorticity,
        );
        Self::compute_vorticity_direction(
            &particles.predicted_position,
            &particles.vorticity,
            &self.neighs,
            h,
            &mut particles.vorticity_direction,
        );
        Self::apply_vorticity_confinement(
            &particles.vorticity,
            &particles.vorticity_direction,
            params.vorticity_epsilon,
            dt,
            &mut particles.velocity,
        );
        self.pcounters.end("vorticity");

        self.pcounters.begin("viscosity");
        particles.velocity_temp.copy_from_slice(&particles.velocity);
        Self::apply_xsph_viscosity(
            &particles.predicted_position,
            &particles.velocity_temp,
            &self.neighs,
            h,
            params.viscosity_c,
            &mut particles.velocity,
        );
        self.pcounters.end("viscosity");

        particles.position.copy_from_slice(&particles.predicted_position);

        self.time += dt;
        self.step_number += 1;
        self.pcounters.end("simulation-step");

        let average_density = if particles.is_empty() {
            0.
        } else {
            particles.density.iter().sum::<FT>() / particles.len() as FT
        };
        self.vcounters.add_value("average-density", average_density);
        self.vcounters.add_value("max-correction", max_correction);

        log::debug!(
            "end step {}: average density {:.3} max correction {:.6}",
            self.step_number,
            average_density,
            max_correction
        );
    }
}

fn zero_velocity() -> V3 {
    zero()
}

/// Axis aligned block of particles on a regular lattice. Lattice points at or beyond `max` are left out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneFluidBlock {
    pub min: V3,
    pub max: V3,
    pub spacing: FT,
    #[serde(default = "zero_velocity")]
    pub velocity: V3,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneConfig {
    pub boundaries: Vec<Boundary>,
    #[serde(default)]
    pub blocks: Vec<SceneFluidBlock>,
    #[serde(default)]
    pub particles: Vec<ParticleInit>,
}

impl SceneConfig {
    /// Closed box `[-1, 1] x [0, 2] x [-1, 1]` with a single layer of particles near the ceiling.
    pub fn default_box() -> SceneConfig {
        SceneConfig {
            boundaries: Boundary::unit_box(),
            blocks: vec![SceneFluidBlock {
                min: vec3f(-1., 1.8, -1.),
                max: vec3f(1., 1.85, 1.),
                spacing: 0.15,
                velocity: zero(),
            }],
            particles: Vec::new(),
        }
    }

    pub fn from_yaml_str(yaml: &str) -> Result<SceneConfig, ConfigError> {
        serde_yaml::from_str(yaml).map_err(|source| ConfigError::Parse {
            origin: "scene".to_string(),
            source,
        })
    }

    pub fn load_yaml(path: &Path) -> Result<SceneConfig, ConfigError> {
        let scene_yaml = read_file(path)?;
        serde_yaml::from_str(&scene_yaml).map_err(|source| ConfigError::Parse {
            origin: path.display().to_string(),
            source,
        })
    }

    /// Lattice positions of all blocks followed by the explicit particles.
    pub fn initial_particles(&self) -> Result<Vec<ParticleInit>, ConfigError> {
        let mut particles = Vec::new();
        for block in &self.blocks {
            add_fluid_block(block, &mut particles)?;
        }
        particles.extend(self.particles.iter().cloned());
        Ok(particles)
    }
}

fn add_fluid_block(block: &SceneFluidBlock, particles: &mut Vec<ParticleInit>) -> Result<(), ConfigError> {
    if !(block.spacing > 0.) || !block.spacing.is_finite() {
        return Err(ConfigError::InvalidScene(format!(
            "fluid block spacing must be positive, got {}",
            block.spacing
        )));
    }
    if !block.min.iter().chain(block.max.iter()).all(|x| x.is_finite()) {
        return Err(ConfigError::InvalidScene("fluid block corners must be finite".to_string()));
    }

    let count = |d: usize| -> usize {
        let mut n = 0;
        while block.min[d] + n as FT * block.spacing < block.max[d] {
            n += 1;
        }
        n
    };
    let (num_x, num_y, num_z) = (count(0), count(1), count(2));

    if num_x * num_y * num_z == 0 {
        log::warn!("fluid block from {:?} to {:?} contains no particles", block.min, block.max);
    }

    for x in 0..num_x {
        for y in 0..num_y {
            for z in 0..num_z {
                particles.push(ParticleInit {
                    position: block.min + vec3f(x as FT, y as FT, z as FT) * block.spacing,
                    velocity: block.velocity,
                    mass: 1.,
                });
            }
        }
    }
    Ok(())
}

pub fn init_fluid_sim(
    simulation_params: SimulationParams,
    scene_config: &SceneConfig,
    counters_enabled: bool,
) -> Result<FluidSimulation, ConfigError> {
    let particles = scene_config.initial_particles()?;
    log::info!(
        "scene with {} particles from {} blocks",
        particles.len(),
        scene_config.blocks.len()
    );
    FluidSimulation::new(
        particles,
        scene_config.boundaries.clone(),
        simulation_params,
        counters_enabled,
    )
}

pub fn is_ft_approx_eq<FT: Float>(a: FT, b: FT, tolerance: FT) -> bool {
    assert!(!a.is_nan());
    assert!(!b.is_nan());
    b <= a + tolerance && b >= a - tolerance
}

pub fn assert_ft_approx_eq<FT: Float + Display>(a: FT, b: FT, tolerance: FT, s: impl FnOnce() -> String) {
    if !is_ft_approx_eq(a, b, tolerance) {
        panic!(
            "{} value not equal with a tolerance of {}:\n\ta={}\n\tb={}\n",
            s(),
            tolerance,
            a,
            b
        );
    }
}

pub fn write_statistics(fluid_simulation: &FluidSimulation) -> Result<String, std::fmt::Error> {
    let mut s = String::new();

    let simulation_time = fluid_simulation
        .pcounters
        .counters
        .get("simulation-step")
        .map_or(0., |c| c.sum().as_secs_f64());

    writeln!(s, "steps: {}", fluid_simulation.step_number)?;
    writeln!(s, "simulated-time: {}s", fluid_simulation.time)?;
    writeln!(s, "simulation-time: {}ms", simulation_time * 1000.)?;
    writeln!(s)?;

    let mut v = fluid_simulation.pcounters.counters.iter().collect::<Vec<_>>();
    v.sort_by(|x, y| x.0.cmp(y.0));
    for (label, pcounter) in v {
        writeln!(s, "{}: avg:{}ms", label, pcounter.avg().as_secs_f64() * 1000.)?;
    }
    writeln!(s)?;

    let mut v = fluid_simulation.vcounters.counters.iter().collect::<Vec<_>>();
    v.sort_by(|x, y| x.0.cmp(y.0));
    for (label, vcounter) in v {
        writeln!(
            s,
            "{}: min:{} max:{} avg:{}",
            label,
            vcounter.min(),
            vcounter.max(),
            vcounter.avg()
        )?;
    }

    Ok(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boundary::Plane;

    fn no_gravity() -> SimulationParams {
        SimulationParams {
            gravity_enabled: false,
            ..Default::default()
        }
    }

    fn sim(positions: &[V3], params: SimulationParams) -> FluidSimulation {
        let particles = positions.iter().map(|&p| ParticleInit::at_rest(p)).collect();
        FluidSimulation::new(particles, Vec::new(), params, false).unwrap()
    }

    #[test]
    fn isolated_particle_gets_no_correction() {
        for clamp in [true, false] {
            let params = SimulationParams {
                clamp_density_constraint: clamp,
                ..no_gravity()
            };
            let mut s = sim(&[vec3f(0.1, 0.2, 0.3)], params);
            s.advance(0.016);

            let p = s.particles();
            assert_eq!(s.neighbor_count(0), 0);
            assert_eq!(p.density[0], poly6(0., params.kernel_h));
            assert!(p.lambda[0].is_finite());
            assert_eq!(p.delta_p[0], zero::<V3>());
            assert_eq!(s.position_of(0), vec3f(0.1, 0.2, 0.3));
            assert_eq!(s.velocity_of(0), zero::<V3>());
        }
    }

    #[test]
    fn compressed_pair_is_pushed_apart() {
        let params = SimulationParams {
            rest_density: 100.,
            ..no_gravity()
        };
        let mut s = sim(&[vec3f(0., 0., 0.), vec3f(0.05, 0., 0.)], params);
        s.advance(0.016);

        let p = s.particles();
        assert!(p.density[0] > params.rest_density);
        assert!(p.lambda[0] < 0.);
        let separation = s.position_of(1).x - s.position_of(0).x;
        assert!(separation > 0.05, "separation {}", separation);

        // symmetric setup, symmetric result
        assert_ft_approx_eq(s.position_of(0).x, -(s.position_of(1).x - 0.05), 1e-5, || {
            "mirror symmetry".to_string()
        });
    }

    #[test]
    fn coincident_particles_contribute_density_but_no_gradient() {
        let params = no_gravity();
        let position = vec![vec3f(0., 0., 0.), vec3f(0., 0., 0.)];
        let mut neighs = NeighborhoodCache::new(2);
        let mut grid = SpatialGrid::new(params.kernel_h);
        neighs.build_neighborhood_list_grid(&mut grid, &position, params.kernel_h);
        assert_eq!(neighs.neighbor_count(0), 1);

        let mut density = vec![0.; 2];
        let mut lambda = vec![0.; 2];
        FluidSimulation::compute_density_and_lambda(&params, &position, &neighs, &mut density, &mut lambda);
        assert_eq!(density[0], 2. * poly6(0., params.kernel_h));
        assert!(lambda[0].is_finite());

        let mut delta_p = vec![zero::<V3>(); 2];
        FluidSimulation::compute_position_correction(&params, &position, &lambda, &neighs, &mut delta_p);
        assert_eq!(delta_p[0], zero::<V3>());
    }

    fn neighborhood(position: &[V3], h: FT) -> NeighborhoodCache {
        let mut neighs = NeighborhoodCache::new(position.len());
        let mut grid = SpatialGrid::new(h);
        neighs.build_neighborhood_list_grid(&mut grid, position, h);
        neighs
    }

    #[test]
    fn sparse_pair_attracts_unless_clamped() {
        let params = no_gravity();
        let position = vec![vec3f(0., 0., 0.), vec3f(0.2, 0., 0.)];
        let neighs = neighborhood(&position, params.kernel_h);

        let mut density = vec![0.; 2];
        let mut lambda = vec![0.; 2];
        FluidSimulation::compute_density_and_lambda(&params, &position, &neighs, &mut density, &mut lambda);
        assert!(density[0] < params.rest_density);
        assert!(lambda[0] > 0. && lambda[1] > 0., "lambda {:?}", lambda);

        let mut delta_p = vec![zero::<V3>(); 2];
        FluidSimulation::compute_position_correction(&params, &position, &lambda, &neighs, &mut delta_p);
        assert!(delta_p[0].x > 0.);
        assert!(delta_p[1].x < 0.);

        let clamped = SimulationParams {
            clamp_density_constraint: true,
            ..params
        };
        FluidSimulation::compute_density_and_lambda(&clamped, &position, &neighs, &mut density, &mut lambda);
        assert_eq!(lambda, vec![0., 0.]);
    }

    #[test]
    fn multiplier_matches_constraint_formula() {
        let params = no_gravity();
        let (h, rest_density) = (params.kernel_h, params.rest_density);
        let position = vec![
            vec3f(0., 0., 0.),
            vec3f(0.08, 0.01, 0.),
            vec3f(-0.05, 0.1, 0.03),
            vec3f(0.02, -0.07, 0.12),
            vec3f(0.15, 0.1, -0.05),
        ];
        let neighs = neighborhood(&position, h);

        let mut density = vec![0.; position.len()];
        let mut lambda = vec![0.; position.len()];
        FluidSimulation::compute_density_and_lambda(&params, &position, &neighs, &mut density, &mut lambda);

        for i in 0..position.len() {
            let mut rho = poly6(0., h);
            let mut grad_wrt_self: V3 = zero();
            let mut grad_sum_sq = 0.;
            for j in (0..position.len()).filter(|&j| j != i) {
                let x_ij = position[i] - position[j];
                if x_ij.norm() > h {
                    continue;
                }
                rho += poly6(x_ij.norm(), h);
                let grad_wrt_j = -spiky_gradient(x_ij, h) / rest_density;
                grad_wrt_self -= grad_wrt_j;
                grad_sum_sq += grad_wrt_j.norm_squared();
            }
            grad_sum_sq += grad_wrt_self.norm_squared();
            let expected = -(rho / rest_density - 1.) / (grad_sum_sq + params.cfm_epsilon);

            assert_ft_approx_eq(density[i], rho, rho * 1e-5, || format!("density of {}", i));
            assert_ft_approx_eq(lambda[i], expected, expected.abs() * 1e-4 + 1e-7, || {
                format!("lambda of {}", i)
            });
        }
    }

    #[test]
    fn xsph_preserves_momentum() {
        let h = 0.25;
        let position = vec![
            vec3f(0., 0., 0.),
            vec3f(0.1, 0., 0.),
            vec3f(0., 0.12, 0.05),
            vec3f(-0.08, 0.03, 0.),
        ];
        let snapshot = vec![
            vec3f(1., 0., 0.),
            vec3f(0., -2., 0.5),
            vec3f(0.3, 0.3, 0.3),
            vec3f(-1., 0., 0.2),
        ];
        let mut neighs = NeighborhoodCache::new(position.len());
        let mut grid = SpatialGrid::new(h);
        neighs.build_neighborhood_list_grid(&mut grid, &position, h);

        let mut velocity = snapshot.clone();
        FluidSimulation::apply_xsph_viscosity(&position, &snapshot, &neighs, h, 0.01, &mut velocity);

        let before: V3 = snapshot.iter().sum();
        let after: V3 = velocity.iter().sum();
        for d in 0..3 {
            assert_ft_approx_eq(before[d], after[d], 1e-3, || format!("momentum component {}", d));
        }
        // velocities moved towards each other
        assert!(velocity[0] != snapshot[0]);
    }

    #[test]
    fn uniform_velocity_has_no_vorticity() {
        let h = 0.25;
        let position = vec![vec3f(0., 0., 0.), vec3f(0.1, 0., 0.), vec3f(0., 0.1, 0.)];
        let velocity = vec![vec3f(0.5, -1., 0.25); 3];
        let mut neighs = NeighborhoodCache::new(position.len());
        let mut grid = SpatialGrid::new(h);
        neighs.build_neighborhood_list_grid(&mut grid, &position, h);

        let mut vorticity = vec![vec3f(1., 1., 1.); 3];
        FluidSimulation::compute_vorticity(&position, &velocity, &neighs, h, &mut vorticity);
        assert!(vorticity.iter().all(|w| *w == zero::<V3>()));

        let mut direction = vec![vec3f(1., 1., 1.); 3];
        FluidSimulation::compute_vorticity_direction(&position, &vorticity, &neighs, h, &mut direction);
        assert!(direction.iter().all(|n| n.iter().all(|x| x.is_finite())));
        assert!(direction.iter().all(|n| *n == zero::<V3>()));
    }

    #[test]
    fn shear_flow_has_vorticity() {
        let h = 0.25;
        let position = vec![vec3f(0., 0., 0.), vec3f(0., 0.1, 0.)];
        let velocity = vec![vec3f(0., 0., 0.), vec3f(1., 0., 0.)];
        let mut neighs = NeighborhoodCache::new(position.len());
        let mut grid = SpatialGrid::new(h);
        neighs.build_neighborhood_list_grid(&mut grid, &position, h);

        let mut vorticity = vec![zero::<V3>(); 2];
        FluidSimulation::compute_vorticity(&position, &velocity, &neighs, h, &mut vorticity);
        // u = y, curl is -z
        assert!(vorticity[0].z < 0.);
        assert_eq!(vorticity[0].x, 0.);
        assert_eq!(vorticity[0].y, 0.);
    }

    #[test]
    fn confinement_accelerates_shear_flow() {
        let h = 0.25;
        let (vorticity_epsilon, dt) = (0.0006, 0.016);
        let position = vec![vec3f(0., 0., 0.), vec3f(0., 0.1, 0.)];
        let before = vec![vec3f(0., 0., 0.), vec3f(1., 0., 0.)];
        let neighs = neighborhood(&position, h);

        let mut vorticity = vec![zero::<V3>(); 2];
        FluidSimulation::compute_vorticity(&position, &before, &neighs, h, &mut vorticity);
        let mut direction = vec![zero::<V3>(); 2];
        FluidSimulation::compute_vorticity_direction(&position, &vorticity, &neighs, h, &mut direction);

        let mut velocity = before.clone();
        FluidSimulation::apply_vorticity_confinement(&vorticity, &direction, vorticity_epsilon, dt, &mut velocity);

        for i in 0..2 {
            let change = velocity[i] - before[i];
            let expected = direction[i].cross(&vorticity[i]) * (vorticity_epsilon * dt);
            for d in 0..3 {
                assert_ft_approx_eq(change[d], expected[d], 1e-6, || format!("particle {} component {}", i, d));
            }
        }

        // the lower particle is pushed against the flow of its faster neighbor
        let change = velocity[0] - before[0];
        assert!(change.x < 0., "change {:?}", change);
        assert_eq!(change.y, 0.);
        assert_eq!(change.z, 0.);
    }

    #[test]
    fn set_position_moves_committed_and_predicted() {
        let mut s = sim(&[vec3f(0., 0., 0.)], no_gravity());
        s.set_position(0, vec3f(0.5, 0.5, 0.5));
        s.set_velocity(0, vec3f(1., 0., 0.));
        assert_eq!(s.position_of(0), vec3f(0.5, 0.5, 0.5));
        assert_eq!(s.particles().predicted_position[0], vec3f(0.5, 0.5, 0.5));

        s.advance(0.1);
        assert_ft_approx_eq(s.position_of(0).x, 0.6, 1e-5, || "moved with velocity".to_string());
        assert_eq!(s.step_number(), 1);
        assert!(s.try_position_of(1).is_none());
    }

    #[test]
    fn invalid_time_step_is_ignored() {
        let mut s = sim(&[vec3f(0., 1., 0.)], SimulationParams::default());
        s.advance(0.);
        s.advance(-0.1);
        s.advance(FT::NAN);
        assert_eq!(s.step_number(), 0);
        assert_eq!(s.position_of(0), vec3f(0., 1., 0.));
    }

    #[test]
    fn default_box_scene_matches_reference_layout() {
        let scene = SceneConfig::default_box();
        let particles = scene.initial_particles().unwrap();
        assert_eq!(particles.len(), 196);
        assert_eq!(scene.boundaries.len(), 6);
        assert!(particles.iter().all(|p| p.position.y == 1.8));
        assert!(particles
            .iter()
            .all(|p| p.position.x >= -1. && p.position.x < 1. && p.position.z >= -1. && p.position.z < 1.));
    }

    #[test]
    fn block_with_invalid_spacing_is_rejected() {
        let scene = SceneConfig {
            boundaries: vec![Plane::new(vec3f(0., 0., 0.), vec3f(0., 1., 0.)).into()],
            blocks: vec![SceneFluidBlock {
                min: vec3f(0., 0., 0.),
                max: vec3f(1., 1., 1.),
                spacing: 0.,
                velocity: zero(),
            }],
            particles: Vec::new(),
        };
        assert!(init_fluid_sim(SimulationParams::default(), &scene, false).is_err());
    }

    #[test]
    fn statistics_are_collected_when_enabled() {
        let particles = vec![ParticleInit::at_rest(vec3f(0., 1., 0.))];
        let mut s = FluidSimulation::new(particles, Boundary::unit_box(), SimulationParams::default(), true).unwrap();
        for _ in 0..3 {
            s.advance(0.016);
        }
        let stats = write_statistics(&s).unwrap();
        assert!(stats.contains("steps: 3"));
        assert!(stats.contains("constraint-solve"));
        assert!(stats.contains("particle-count: min:1 max:1 avg:1"));
    }
}
