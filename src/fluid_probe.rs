// Aurora - GPU Fluid Backdrop Renderer
// Copyright (c) 2025 Filipe da Veiga Ventura Alves
// Licensed under MIT License

// Headless probe: runs the GPU solver offscreen next to the CPU solver and
// logs how far apart they drift.
// Run with: cargo run --bin fluid_probe -- [ticks] [width] [height]

use std::time::Instant;

use anyhow::Context;

use aurora_fluid::{
    CpuFluid, Extent, FieldKind, FieldSnapshot, FluidConfig, FluidEngine, GpuContext, GpuFluid,
};

const SEED: u64 = 0x5eed;

struct FieldStats {
    max_magnitude: f32,
    mean: [f32; 3],
}

impl FieldStats {
    fn of(snapshot: &FieldSnapshot) -> Self {
        let count = snapshot.texels.len().max(1) as f32;
        let mut max_magnitude = 0.0f32;
        let mut sum = [0.0f32; 3];
        for texel in &snapshot.texels {
            max_magnitude = max_magnitude.max((texel[0] * texel[0] + texel[1] * texel[1]).sqrt());
            for (acc, channel) in sum.iter_mut().zip(texel) {
                *acc += channel;
            }
        }
        Self {
            max_magnitude,
            mean: sum.map(|s| s / count),
        }
    }
}

fn parse_arg(index: usize, default: u32) -> anyhow::Result<u32> {
    match std::env::args().nth(index) {
        Some(arg) => arg
            .parse()
            .with_context(|| format!("argument {index} must be a positive integer, got `{arg}`")),
        None => Ok(default),
    }
}

fn main() -> anyhow::Result<()> {
    use env_logger::Env;
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let ticks = parse_arg(1, 120)? as u64;
    let viewport = Extent::new(parse_arg(2, 640)?.max(1), parse_arg(3, 360)?.max(1));
    let config = FluidConfig::default();

    let ctx = GpuContext::headless()?;
    let gpu = GpuFluid::offscreen(ctx, &config, viewport)?;
    let mut gpu = FluidEngine::new(config.clone(), gpu, viewport)?.with_seed(SEED);
    let mut cpu = FluidEngine::new(config.clone(), CpuFluid::new(&config, viewport), viewport)?
        .with_seed(SEED);
    gpu.start();
    cpu.start();

    let started = Instant::now();
    let gpu_ticks = gpu.run(Some(ticks))?;
    let elapsed = started.elapsed().as_secs_f32();
    log::info!(
        "GPU: {gpu_ticks} ticks in {elapsed:.2}s ({:.2} ms/frame)",
        elapsed * 1000.0 / gpu_ticks.max(1) as f32
    );

    let started = Instant::now();
    let cpu_ticks = cpu.run(Some(ticks))?;
    let elapsed = started.elapsed().as_secs_f32();
    log::info!(
        "CPU: {cpu_ticks} ticks in {elapsed:.2}s ({:.2} ms/frame)",
        elapsed * 1000.0 / cpu_ticks.max(1) as f32
    );

    let backend = gpu.backend_mut().context("GPU backend was released")?;
    let store = backend.store();
    log::info!(
        "Fields: sim {}x{}, dye {}x{}, {:?}{}",
        store.velocity.extent().width,
        store.velocity.extent().height,
        store.dye.extent().width,
        store.dye.extent().height,
        store.formats.rgba.format,
        if store.tiers.reduced { " (reduced)" } else { "" }
    );

    let reference = cpu.backend().context("CPU backend was released")?;
    let pairs = [
        ("velocity", FieldKind::Velocity, reference.velocity.to_snapshot()),
        ("dye", FieldKind::Dye, reference.dye.to_snapshot()),
        ("divergence", FieldKind::Divergence, reference.divergence.to_snapshot()),
    ];
    for (name, kind, expected) in pairs {
        let Some(actual) = backend.read_field(kind)? else {
            continue;
        };
        let gpu_stats = FieldStats::of(&actual);
        let cpu_stats = FieldStats::of(&expected);
        log::info!(
            "{name}: max |xy| gpu {:.4} cpu {:.4}, mean rgb gpu {:.4?} cpu {:.4?}",
            gpu_stats.max_magnitude,
            cpu_stats.max_magnitude,
            gpu_stats.mean,
            cpu_stats.mean
        );
    }

    for kind in [FieldKind::Bloom, FieldKind::Sunrays] {
        match backend.read_field(kind)? {
            Some(snapshot) => log::info!("{kind:?}: mean rgb {:.4?}", FieldStats::of(&snapshot).mean),
            None => log::info!("{kind:?}: disabled"),
        }
    }

    gpu.stop();
    Ok(())
}
