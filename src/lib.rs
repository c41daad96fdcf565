/*!
Position-Based Fluids simulation engine.

Particles are advanced one step at a time under gravity, a density constraint solved by
iterated position corrections, vorticity confinement and XSPH viscosity, while colliding
with a fixed list of plane, sphere and cube boundaries.
*/

pub mod simulation;

pub use simulation::*;
