// Aurora - GPU Fluid Backdrop Renderer
// Copyright (c) 2025 Filipe da Veiga Ventura Alves
// Licensed under MIT License

//! Host-side solver running the same stencils as the GPU programs.
//!
//! Sampling mirrors a clamp-to-edge linear sampler: texel centres sit at
//! `(i + 0.5) / size` and lookups outside the grid read the edge texel. Used
//! for deterministic tests and as a cross-check in `fluid_probe`.

use crate::config::FluidConfig;
use crate::error::EngineError;
use crate::field::{aspect_resolution, Extent, FieldSnapshot};
use crate::scheduler::FluidBackend;
use crate::splat::SplatCommand;

/// Normalized coordinate of texel `(x, y)`'s centre.
pub fn texel_centre(extent: Extent, x: u32, y: u32) -> [f32; 2] {
    [
        (x as f32 + 0.5) / extent.width as f32,
        (y as f32 + 0.5) / extent.height as f32,
    ]
}

#[derive(Debug, Clone, PartialEq)]
pub struct Grid<const N: usize> {
    pub extent: Extent,
    pub data: Vec<[f32; N]>,
}

impl<const N: usize> Grid<N> {
    pub fn filled(extent: Extent, value: [f32; N]) -> Self {
        Self {
            extent,
            data: vec![value; extent.texel_count()],
        }
    }

    pub fn from_fn(extent: Extent, mut f: impl FnMut(u32, u32) -> [f32; N]) -> Self {
        let mut data = Vec::with_capacity(extent.texel_count());
        for y in 0..extent.height {
            for x in 0..extent.width {
                data.push(f(x, y));
            }
        }
        Self { extent, data }
    }

    pub fn texel_size(&self) -> [f32; 2] {
        self.extent.texel_size()
    }

    pub fn uv(&self, x: u32, y: u32) -> [f32; 2] {
        texel_centre(self.extent, x, y)
    }

    /// Texel lookup clamped to the grid.
    pub fn get(&self, x: i64, y: i64) -> [f32; N] {
        let x = x.clamp(0, self.extent.width as i64 - 1) as usize;
        let y = y.clamp(0, self.extent.height as i64 - 1) as usize;
        self.data[y * self.extent.width as usize + x]
    }

    pub fn at(&self, x: u32, y: u32) -> [f32; N] {
        self.get(x as i64, y as i64)
    }

    /// Bilinear lookup at a normalized coordinate.
    pub fn sample(&self, uv: [f32; 2]) -> [f32; N] {
        let sx = uv[0] * self.extent.width as f32 - 0.5;
        let sy = uv[1] * self.extent.height as f32 - 0.5;
        let x0 = sx.floor();
        let y0 = sy.floor();
        let fx = sx - x0;
        let fy = sy - y0;
        let (x0, y0) = (x0 as i64, y0 as i64);

        let a = self.get(x0, y0);
        let b = self.get(x0 + 1, y0);
        let c = self.get(x0, y0 + 1);
        let d = self.get(x0 + 1, y0 + 1);
        let mut out = [0.0; N];
        for i in 0..N {
            let top = a[i] + (b[i] - a[i]) * fx;
            let bottom = c[i] + (d[i] - c[i]) * fx;
            out[i] = top + (bottom - top) * fy;
        }
        out
    }

    /// Resampled copy at a new extent.
    pub fn resampled(&self, extent: Extent) -> Self {
        Self::from_fn(extent, |x, y| self.sample(texel_centre(extent, x, y)))
    }

    /// Four-neighbour values `(l, r, t, b)` around `(x, y)`.
    fn neighbours(&self, x: u32, y: u32) -> ([f32; N], [f32; N], [f32; N], [f32; N]) {
        let (x, y) = (x as i64, y as i64);
        (
            self.get(x - 1, y),
            self.get(x + 1, y),
            self.get(x, y + 1),
            self.get(x, y - 1),
        )
    }

    pub fn to_snapshot(&self) -> FieldSnapshot {
        let texels = self
            .data
            .iter()
            .map(|value| {
                let mut texel = [0.0, 0.0, 0.0, 1.0];
                for (slot, v) in texel.iter_mut().zip(value.iter()) {
                    *slot = *v;
                }
                texel
            })
            .collect();
        FieldSnapshot {
            extent: self.extent,
            texels,
        }
    }
}

/// Adds a Gaussian impulse of `amount` (one entry per channel) to `target`.
/// Four-channel grids get their alpha reset to 1.
pub fn splat<const N: usize>(
    target: &Grid<N>,
    point: [f32; 2],
    amount: [f32; 3],
    radius: f32,
    aspect: f32,
) -> Grid<N> {
    Grid::from_fn(target.extent, |x, y| {
        let uv = target.uv(x, y);
        let px = (uv[0] - point[0]) * aspect;
        let py = uv[1] - point[1];
        let intensity = (-(px * px + py * py) / radius).exp() * 0.9;
        let mut out = target.at(x, y);
        for (i, value) in out.iter_mut().enumerate().take(3) {
            *value += intensity * amount[i];
        }
        if N == 4 {
            if let Some(alpha) = out.get_mut(3) {
                *alpha = 1.0;
            }
        }
        out
    })
}

/// Backward trace through `velocity`, sampling `source` upstream.
pub fn advect<const N: usize>(velocity: &Grid<2>, source: &Grid<N>, dt: f32, dissipation: f32) -> Grid<N> {
    let texel = velocity.texel_size();
    Grid::from_fn(source.extent, |x, y| {
        let uv = source.uv(x, y);
        let v = velocity.sample(uv);
        let coord = [uv[0] - dt * v[0] * texel[0], uv[1] - dt * v[1] * texel[1]];
        let mut out = source.sample(coord);
        for (i, value) in out.iter_mut().enumerate() {
            *value = if i == 3 { 1.0 } else { *value * dissipation };
        }
        out
    })
}

pub fn curl(velocity: &Grid<2>) -> Grid<1> {
    Grid::from_fn(velocity.extent, |x, y| {
        let (l, r, t, b) = velocity.neighbours(x, y);
        [0.5 * (r[1] - l[1] - t[0] + b[0])]
    })
}

/// Vorticity confinement: pushes velocity along the gradient of `|curl|`.
pub fn vorticity(velocity: &Grid<2>, curl: &Grid<1>, strength: f32, dt: f32) -> Grid<2> {
    Grid::from_fn(velocity.extent, |x, y| {
        let (l, r, t, b) = curl.neighbours(x, y);
        let c = curl.at(x, y)[0];
        let mut force = [0.5 * (t[0].abs() - b[0].abs()), 0.5 * (r[0].abs() - l[0].abs())];
        let length = (force[0] * force[0] + force[1] * force[1]).sqrt() + 0.0001;
        force[0] = force[0] / length * strength * c;
        force[1] = -(force[1] / length * strength * c);

        let v = velocity.at(x, y);
        [v[0] + force[0] * dt, v[1] + force[1] * dt]
    })
}

pub fn divergence(velocity: &Grid<2>) -> Grid<1> {
    Grid::from_fn(velocity.extent, |x, y| {
        let (l, r, t, b) = velocity.neighbours(x, y);
        [0.5 * (r[0] - l[0] + t[1] - b[1])]
    })
}

/// One Jacobi relaxation of the pressure Poisson equation.
pub fn jacobi(pressure: &Grid<1>, divergence: &Grid<1>) -> Grid<1> {
    Grid::from_fn(pressure.extent, |x, y| {
        let (l, r, t, b) = pressure.neighbours(x, y);
        [(l[0] + r[0] + b[0] + t[0] - divergence.at(x, y)[0]) * 0.25]
    })
}

pub fn subtract_gradient(pressure: &Grid<1>, velocity: &Grid<2>) -> Grid<2> {
    Grid::from_fn(velocity.extent, |x, y| {
        let (l, r, t, b) = pressure.neighbours(x, y);
        let v = velocity.at(x, y);
        [v[0] - (r[0] - l[0]), v[1] - (t[0] - b[0])]
    })
}

pub fn scale<const N: usize>(grid: &Grid<N>, value: f32) -> Grid<N> {
    Grid {
        extent: grid.extent,
        data: grid
            .data
            .iter()
            .map(|texel| texel.map(|channel| channel * value))
            .collect(),
    }
}

/// Sum of squared values of a scalar field.
pub fn energy(grid: &Grid<1>) -> f32 {
    grid.data.iter().map(|[v]| v * v).sum()
}

/// Full solver on host memory. Fields stay at the solver's resolution tiers.
#[derive(Debug, Clone)]
pub struct CpuFluid {
    config: FluidConfig,
    viewport: Extent,
    pub velocity: Grid<2>,
    pub dye: Grid<4>,
    pub pressure: Grid<1>,
    pub divergence: Grid<1>,
    pub curl: Grid<1>,
    steps: u64,
}

impl CpuFluid {
    pub fn new(config: &FluidConfig, viewport: Extent) -> Self {
        let sim = aspect_resolution(config.sim_resolution, viewport);
        let dye = aspect_resolution(config.dye_resolution, viewport);
        Self {
            config: config.clone(),
            viewport,
            velocity: Grid::filled(sim, [0.0; 2]),
            dye: Grid::filled(dye, [0.0, 0.0, 0.0, 1.0]),
            pressure: Grid::filled(sim, [0.0]),
            divergence: Grid::filled(sim, [0.0]),
            curl: Grid::filled(sim, [0.0]),
            steps: 0,
        }
    }

    pub fn viewport(&self) -> Extent {
        self.viewport
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Pressure projection alone: divergence, warm start, Jacobi, gradient.
    pub fn project(&mut self) {
        self.divergence = divergence(&self.velocity);
        self.pressure = scale(&self.pressure, self.config.pressure);
        for _ in 0..self.config.pressure_iterations {
            self.pressure = jacobi(&self.pressure, &self.divergence);
        }
        self.velocity = subtract_gradient(&self.pressure, &self.velocity);
    }
}

impl FluidBackend for CpuFluid {
    fn resize(&mut self, viewport: Extent) -> Result<(), EngineError> {
        let sim = aspect_resolution(self.config.sim_resolution, viewport);
        let dye = aspect_resolution(self.config.dye_resolution, viewport);
        if sim != self.velocity.extent {
            self.velocity = self.velocity.resampled(sim);
            self.pressure = Grid::filled(sim, [0.0]);
            self.divergence = Grid::filled(sim, [0.0]);
            self.curl = Grid::filled(sim, [0.0]);
        }
        if dye != self.dye.extent {
            self.dye = self.dye.resampled(dye);
        }
        self.viewport = viewport;
        Ok(())
    }

    fn splat(&mut self, command: &SplatCommand) {
        let aspect = self.viewport.aspect();
        self.velocity = splat(
            &self.velocity,
            command.point,
            [command.force[0], command.force[1], 0.0],
            command.radius,
            aspect,
        );
        self.dye = splat(&self.dye, command.point, command.color, command.radius, aspect);
    }

    fn step(&mut self, dt: f32) {
        self.curl = curl(&self.velocity);
        self.velocity = vorticity(&self.velocity, &self.curl, self.config.curl, dt);
        self.project();
        self.velocity = advect(&self.velocity, &self.velocity, dt, self.config.velocity_dissipation);
        self.dye = advect(&self.velocity, &self.dye, dt, self.config.density_dissipation);
        self.steps += 1;
    }

    fn present(&mut self) -> Result<(), EngineError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::splat::splat_radius;

    fn small_config() -> FluidConfig {
        FluidConfig {
            sim_resolution: 64,
            dye_resolution: 96,
            ..FluidConfig::default()
        }
    }

    #[test]
    fn bilinear_sample_hits_texel_centres_exactly() {
        let grid = Grid::from_fn(Extent::new(4, 3), |x, y| [(x + 10 * y) as f32]);
        for y in 0..3 {
            for x in 0..4 {
                assert!((grid.sample(grid.uv(x, y))[0] - grid.at(x, y)[0]).abs() < 1e-4);
            }
        }
        // Halfway between (0, 0) and (1, 0).
        assert!((grid.sample([0.25, 1.0 / 6.0])[0] - 0.5).abs() < 1e-5);
        // Outside the grid reads the edge.
        assert!((grid.sample([-1.0, -1.0])[0] - 0.0).abs() < 1e-6);
        assert!((grid.sample([2.0, 2.0])[0] - 23.0).abs() < 1e-6);
    }

    #[test]
    fn centred_splat_is_symmetric() {
        let grid = Grid::filled(Extent::new(64, 48), [0.0; 4]);
        let radius = splat_radius(&FluidConfig::default(), 64.0 / 48.0);
        let out = splat(&grid, [0.5, 0.5], [1.0, 0.5, 0.25], radius, 64.0 / 48.0);
        for y in 0..48 {
            for x in 0..64 {
                let here = out.at(x, y);
                let mirrored = out.at(63 - x, 47 - y);
                for i in 0..3 {
                    assert!((here[i] - mirrored[i]).abs() < 1e-6);
                }
                assert_eq!(here[3], 1.0);
            }
        }
        assert!(out.at(32, 24)[0] > 0.8);
    }

    #[test]
    fn at_rest_fluid_stays_at_rest() {
        let config = small_config();
        let mut fluid = CpuFluid::new(&config, Extent::new(800, 600));
        let velocity = fluid.velocity.clone();
        let dye = fluid.dye.clone();
        fluid.step(config.timestep);
        assert_eq!(fluid.velocity, velocity);
        assert_eq!(fluid.dye, dye);
    }

    #[test]
    fn projection_reduces_divergence() {
        let extent = Extent::new(64, 64);
        let velocity = Grid::from_fn(extent, |x, y| {
            let dx = x as f32 - 32.0;
            let dy = y as f32 - 28.0;
            let g = (-(dx * dx + dy * dy) / 40.0).exp();
            [30.0 * g, -12.0 * g]
        });
        let before = energy(&divergence(&velocity));

        let config = FluidConfig {
            sim_resolution: 64,
            pressure: 0.0,
            pressure_iterations: 20,
            ..FluidConfig::default()
        };
        let mut fluid = CpuFluid::new(&config, Extent::new(64, 64));
        fluid.velocity = velocity;
        fluid.project();
        let after = energy(&divergence(&fluid.velocity));

        assert!(before > 0.0);
        assert!(after < before, "divergence energy went from {before} to {after}");
    }

    #[test]
    fn dissipation_is_geometric() {
        let extent = Extent::new(16, 16);
        let velocity = Grid::filled(extent, [0.0; 2]);
        let mut dye = Grid::filled(extent, [0.8, 0.4, 0.2, 1.0]);
        let d = 0.97;
        for _ in 0..10 {
            dye = advect(&velocity, &dye, 0.016, d);
        }
        let expected = d.powi(10);
        for texel in &dye.data {
            assert!((texel[0] - (0.8 * expected)).abs() <= 1e-5 * (0.8 * expected).abs());
            assert!((texel[1] - (0.4 * expected)).abs() <= 1e-5 * (0.4 * expected).abs());
            assert!((texel[2] - (0.2 * expected)).abs() <= 1e-5 * (0.2 * expected).abs());
            assert_eq!(texel[3], 1.0);
        }
    }

    #[test]
    fn centre_splat_pushes_only_locally() {
        let config = FluidConfig::default();
        let viewport = Extent::new(800, 600);
        let mut fluid = CpuFluid::new(&config, viewport);
        fluid.splat(&SplatCommand {
            point: [0.5, 0.5],
            force: [1000.0, 0.0],
            color: [0.1, 0.1, 0.1],
            radius: splat_radius(&config, viewport.aspect()),
        });
        fluid.step(config.timestep);

        let centre = fluid.velocity.sample([0.5, 0.5]);
        assert!(centre[0] > 0.0, "centre velocity {centre:?}");
        let edge = fluid.velocity.sample([0.0, 0.5]);
        assert!(edge[0].abs() < 1e-6 && edge[1].abs() < 1e-6, "edge velocity {edge:?}");
    }

    #[test]
    fn resize_resamples_velocity_and_dye() {
        let config = FluidConfig::default();
        let mut fluid = CpuFluid::new(&config, Extent::new(800, 600));
        assert_eq!(fluid.velocity.extent, Extent::new(128, 96));
        assert_eq!(fluid.dye.extent, Extent::new(512, 384));
        fluid.dye = Grid::filled(fluid.dye.extent, [0.3, 0.2, 0.1, 1.0]);

        fluid.resize(Extent::new(1920, 1080)).unwrap();
        assert_eq!(fluid.velocity.extent, Extent::new(128, 72));
        assert_eq!(fluid.pressure.extent, Extent::new(128, 72));
        assert_eq!(fluid.dye.extent, Extent::new(512, 288));
        assert!((fluid.dye.at(100, 100)[0] - 0.3).abs() < 1e-6);
    }

    #[test]
    fn vorticity_of_still_fluid_adds_nothing() {
        let extent = Extent::new(8, 8);
        let velocity = Grid::filled(extent, [0.0; 2]);
        let out = vorticity(&velocity, &curl(&velocity), 30.0, 0.016);
        assert_eq!(out, velocity);
    }

    #[test]
    fn snapshot_pads_missing_channels() {
        let grid = Grid::filled(Extent::new(2, 1), [0.5]);
        let snapshot = grid.to_snapshot();
        assert_eq!(snapshot.get(1, 0), [0.5, 0.0, 0.0, 1.0]);
    }
}
