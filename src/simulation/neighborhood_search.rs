use std::collections::HashMap;

use crate::{concurrency::par_iter_mut1, floating_type_mod::FT, V3, VI};

/// Coordinates beyond the `i32` range saturate to the outermost cell.
#[inline(always)]
pub fn particle_to_cell_pos(particle_pos: V3, cell_size: FT) -> VI<3> {
    (particle_pos / cell_size).map(|x| x.floor() as i32)
}

/**
 * Uniform grid hash. Each occupied cell maps to the ids and positions of the particles inside it.
 *
 * The cell size equals the kernel radius, so one ring of adjacent cells covers every
 * particle within one kernel radius.
 */
pub struct SpatialGrid {
    cell_size: FT,
    cells: HashMap<VI<3>, Vec<(usize, V3)>>,
}

impl SpatialGrid {
    pub fn new(cell_size: FT) -> Self {
        assert!(cell_size > 0., "grid cell size must be positive");
        SpatialGrid {
            cell_size,
            cells: HashMap::new(),
        }
    }

    pub fn cell_size(&self) -> FT {
        self.cell_size
    }

    /// Changing the cell size drops all contents.
    pub fn set_cell_size(&mut self, cell_size: FT) {
        assert!(cell_size > 0., "grid cell size must be positive");
        self.cell_size = cell_size;
        self.cells.clear();
    }

    pub fn clear(&mut self) {
        self.cells.clear();
    }

    pub fn insert(&mut self, id: usize, position: V3) {
        self.cells
            .entry(particle_to_cell_pos(position, self.cell_size))
            .or_insert_with(Vec::new)
            .push((id, position));
    }

    pub fn num_occupied_cells(&self) -> usize {
        self.cells.len()
    }

    /// Calls `f` for every stored id whose position lies within `radius` of `position`.
    pub fn for_each_neighbor(&self, position: V3, radius: FT, mut f: impl FnMut(usize)) {
        let ring = FT::max(1., (radius / self.cell_size).ceil()) as i32;
        let center = particle_to_cell_pos(position, self.cell_size);
        let radius_sq = radius * radius;

        // saturated bounds keep every cell of the range unique at the edge of the key space
        let lo = center.map(|c| c.saturating_sub(ring));
        let hi = center.map(|c| c.saturating_add(ring));

        for z in lo.z..=hi.z {
            for y in lo.y..=hi.y {
                for x in lo.x..=hi.x {
                    if let Some(entries) = self.cells.get(&VI::<3>::new(x, y, z)) {
                        for &(id, entry_position) in entries {
                            if (entry_position - position).norm_squared() <= radius_sq {
                                f(id);
                            }
                        }
                    }
                }
            }
        }
    }

    /// All ids within `radius` of `position`, including a particle stored exactly at `position`.
    pub fn query_neighbors(&self, position: V3, radius: FT) -> Vec<usize> {
        let mut result = Vec::new();
        self.for_each_neighbor(position, radius, |id| result.push(id));
        result
    }

    pub fn rebuild(&mut self, positions: &[V3]) {
        self.clear();
        for (id, &position) in positions.iter().enumerate() {
            self.insert(id, position);
        }
    }
}

/// O(n²) reference search.
pub fn brute_force_neighbors(positions: &[V3], i: usize, radius: FT) -> Vec<usize> {
    let radius_sq = radius * radius;
    (0..positions.len())
        .filter(|&j| j != i && (positions[j] - positions[i]).norm_squared() <= radius_sq)
        .collect()
}

/// For each particle, the ids of all other particles within the kernel radius.
pub struct NeighborhoodCache {
    neighs: Vec<Vec<u32>>,
}

impl NeighborhoodCache {
    pub fn new(num_particles: usize) -> Self {
        NeighborhoodCache {
            neighs: (0..num_particles).map(|_| Vec::new()).collect(),
        }
    }

    pub fn iter<'a>(&'a self, i: usize) -> impl Iterator<Item = usize> + 'a {
        self.neighs[i].iter().map(|&x| x as usize)
    }

    pub fn neighbor_count(&self, i: usize) -> usize {
        self.neighs[i].len()
    }

    pub fn len(&self) -> usize {
        self.neighs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.neighs.is_empty()
    }

    /// Refills `grid` from `positions` and stores the neighbor lists of every particle.
    pub fn build_neighborhood_list_grid(&mut self, grid: &mut SpatialGrid, positions: &[V3], support_radius: FT) {
        assert_eq!(self.neighs.len(), positions.len());

        grid.rebuild(positions);
        let grid = &*grid;

        par_iter_mut1(&mut self.neighs, |particle_id, p_neighs| {
            p_neighs.clear();
            grid.for_each_neighbor(positions[particle_id], support_radius, |neigh_particle_id| {
                if neigh_particle_id == particle_id {
                    return;
                }
                p_neighs.push(neigh_particle_id as u32);
            });
        });
    }

    /// Compares the lists against a brute force search. Returns the number of particles with a wrong list.
    pub fn check_against_brute_force(&self, positions: &[V3], support_radius: FT) -> usize {
        let mut num_mismatches = 0;
        for i in 0..positions.len() {
            let mut expected = brute_force_neighbors(positions, i, support_radius);
            let mut found: Vec<usize> = self.iter(i).collect();
            expected.sort_unstable();
            found.sort_unstable();
            if expected != found {
                log::warn!(
                    "neighbor list of particle {} differs from brute force search: found {} expected {}",
                    i,
                    found.len(),
                    expected.len()
                );
                num_mismatches += 1;
            }
        }
        num_mismatches
    }
}
