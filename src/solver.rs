// Aurora - GPU Fluid Backdrop Renderer
// Copyright (c) 2025 Filipe da Veiga Ventura Alves
// Licensed under MIT License

//! Solver pipeline: one fixed-timestep update of velocity and dye.
//!
//! Every stage reads the read half of a double buffer, renders into the write
//! half, then swaps. The recorded order is the submission order.

use crate::config::FluidConfig;
use crate::field::TextureField;
use crate::pass::{Pass, PassBatch};
use crate::program::{Keywords, PassParams, ProgramKind};
use crate::store::FieldStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolverStage {
    Curl,
    Vorticity,
    Divergence,
    /// Scales last frame's pressure by the configured warm-start factor.
    PressureWarmStart,
    Jacobi,
    GradientSubtract,
    AdvectVelocity,
    AdvectDye,
}

/// Stages of one step in execution order.
pub fn stages(pressure_iterations: u32) -> impl Iterator<Item = SolverStage> {
    use SolverStage::*;
    [Curl, Vorticity, Divergence, PressureWarmStart]
        .into_iter()
        .chain(std::iter::repeat(Jacobi).take(pressure_iterations as usize))
        .chain([GradientSubtract, AdvectVelocity, AdvectDye])
}

/// Records one solver step into `batch`.
pub fn step(batch: &mut PassBatch, store: &mut FieldStore, config: &FluidConfig, dt: f32) {
    for stage in stages(config.pressure_iterations) {
        record_stage(batch, store, config, dt, stage);
    }
}

/// Records a single stage. Stages that render into a double buffer swap it.
pub fn record_stage(
    batch: &mut PassBatch,
    store: &mut FieldStore,
    config: &FluidConfig,
    dt: f32,
    stage: SolverStage,
) {
    let sim_texel = store.velocity.texel_size();
    match stage {
        SolverStage::Curl => {
            batch.draw(Pass::new("Curl", ProgramKind::Curl, &store.curl).input(store.velocity.read()));
        }
        SolverStage::Vorticity => {
            let params = PassParams {
                curl: config.curl,
                dt,
                ..PassParams::with_texel(sim_texel)
            };
            batch.draw(
                Pass::new("Vorticity", ProgramKind::Vorticity, store.velocity.write())
                    .input(store.velocity.read())
                    .input(&store.curl)
                    .params(params),
            );
            store.velocity.swap();
        }
        SolverStage::Divergence => {
            batch.draw(
                Pass::new("Divergence", ProgramKind::Divergence, &store.divergence)
                    .input(store.velocity.read()),
            );
        }
        SolverStage::PressureWarmStart => {
            let params = PassParams {
                value: config.pressure,
                ..PassParams::with_texel(sim_texel)
            };
            batch.draw(
                Pass::new("Pressure Warm Start", ProgramKind::Clear, store.pressure.write())
                    .input(store.pressure.read())
                    .params(params),
            );
            store.pressure.swap();
        }
        SolverStage::Jacobi => {
            batch.draw(
                Pass::new("Pressure", ProgramKind::Pressure, store.pressure.write())
                    .input(store.pressure.read())
                    .input(&store.divergence),
            );
            store.pressure.swap();
        }
        SolverStage::GradientSubtract => {
            batch.draw(
                Pass::new("Gradient Subtract", ProgramKind::GradientSubtract, store.velocity.write())
                    .input(store.pressure.read())
                    .input(store.velocity.read()),
            );
            store.velocity.swap();
        }
        SolverStage::AdvectVelocity => {
            let velocity = store.velocity.read();
            batch.draw(advect(
                "Advect Velocity",
                store.velocity.write(),
                velocity,
                velocity,
                sim_texel,
                config.velocity_dissipation,
                dt,
            ));
            store.velocity.swap();
        }
        SolverStage::AdvectDye => {
            batch.draw(advect(
                "Advect Dye",
                store.dye.write(),
                store.velocity.read(),
                store.dye.read(),
                sim_texel,
                config.density_dissipation,
                dt,
            ));
            store.dye.swap();
        }
    }
}

/// Semi-Lagrangian advection of `source` by `velocity` into `target`.
fn advect(
    label: &'static str,
    target: &TextureField,
    velocity: &TextureField,
    source: &TextureField,
    velocity_texel: [f32; 2],
    dissipation: f32,
    dt: f32,
) -> Pass {
    let manual = velocity.filter() == wgpu::FilterMode::Nearest || source.filter() == wgpu::FilterMode::Nearest;
    let params = PassParams {
        dt,
        dissipation,
        source_texel_size: source.texel_size,
        ..PassParams::with_texel(velocity_texel)
    };
    Pass::new(label, ProgramKind::Advection, target)
        .input(velocity)
        .input(source)
        .keywords(Keywords::NONE.with(Keywords::MANUAL_FILTERING, manual))
        .params(params)
}
