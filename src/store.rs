// Aurora - GPU Fluid Backdrop Renderer
// Copyright (c) 2025 Filipe da Veiga Ventura Alves
// Licensed under MIT License

//! Field Store: owns every texture the solver and post-processing touch.
//!
//! Fields come in four resolution tiers (simulation, dye, bloom, sunrays),
//! each sized from the viewport aspect with [`aspect_resolution`]. Resizing
//! rebuilds only the tiers whose extent changed; velocity and dye carry their
//! contents across through a copy pass recorded ahead of the next solver step.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::FluidConfig;
use crate::error::EngineError;
use crate::field::{
    acquire_format, aspect_resolution, DoubleBuffer, Extent, FieldFormat, FormatProbe, TextureField,
};
use crate::gpu::GpuContext;
use crate::pass::{Pass, PassBatch, Samplers};
use crate::program::ProgramKind;

pub const DITHER_SIZE: u32 = 64;
const DITHER_SEED: u64 = 0x5eed_d17e;

/// Every field starts out as an at-rest, fully opaque black.
pub const REST_COLOR: wgpu::Color = wgpu::Color {
    r: 0.0,
    g: 0.0,
    b: 0.0,
    a: 1.0,
};

/// Formats chosen for each field category after walking the fallback chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldFormats {
    pub rgba: FieldFormat,
    pub rg: FieldFormat,
    pub r: FieldFormat,
    /// `None` when bloom is disabled in the config or by the hardware.
    pub bloom: Option<FieldFormat>,
    pub sunrays: Option<FieldFormat>,
}

impl FieldFormats {
    pub fn acquire(probe: &impl FormatProbe, config: &FluidConfig) -> Result<Self, EngineError> {
        let core = |candidate| {
            acquire_format(probe, candidate).map_err(|err| {
                EngineError::HardwareUnsupported(format!("simulation fields unavailable: {err}"))
            })
        };
        let rgba = core(wgpu::TextureFormat::Rgba16Float)?;
        let rg = core(wgpu::TextureFormat::Rg16Float)?;
        let r = core(wgpu::TextureFormat::R16Float)?;

        Ok(Self {
            rgba,
            rg,
            r,
            bloom: optional_format(probe, wgpu::TextureFormat::Rgba16Float, "Bloom", config.bloom)
                .filter(|format| {
                    let blendable = probe.supports_blending(format.format);
                    if !blendable {
                        log::warn!("Bloom disabled for this session: {:?} cannot blend", format.format);
                    }
                    blendable
                }),
            sunrays: optional_format(probe, wgpu::TextureFormat::R16Float, "Sunrays", config.sunrays),
        })
    }
}

fn optional_format(
    probe: &impl FormatProbe,
    candidate: wgpu::TextureFormat,
    feature: &str,
    enabled: bool,
) -> Option<FieldFormat> {
    if !enabled {
        return None;
    }
    match acquire_format(probe, candidate) {
        Ok(format) => Some(format),
        Err(err) => {
            log::warn!("{feature} disabled for this session: {err}");
            None
        }
    }
}

/// Requested resolution per category. Halved once if allocation fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolutionTiers {
    pub sim: u32,
    pub dye: u32,
    pub bloom: u32,
    pub sunrays: u32,
    pub reduced: bool,
}

impl ResolutionTiers {
    pub fn from_config(config: &FluidConfig) -> Self {
        Self {
            sim: config.sim_resolution,
            dye: config.dye_resolution,
            bloom: config.bloom_resolution,
            sunrays: config.sunrays_resolution,
            reduced: false,
        }
    }

    pub fn halved(&self) -> Self {
        Self {
            sim: (self.sim / 2).max(1),
            dye: (self.dye / 2).max(1),
            bloom: (self.bloom / 2).max(1),
            sunrays: (self.sunrays / 2).max(1),
            reduced: true,
        }
    }

    pub fn extents(&self, viewport: Extent) -> FieldExtents {
        FieldExtents {
            sim: aspect_resolution(self.sim, viewport),
            dye: aspect_resolution(self.dye, viewport),
            bloom: aspect_resolution(self.bloom, viewport),
            sunrays: aspect_resolution(self.sunrays, viewport),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldExtents {
    pub sim: Extent,
    pub dye: Extent,
    pub bloom: Extent,
    pub sunrays: Extent,
}

/// Successively halved extents for the bloom blur chain, stopping before a
/// level would be narrower than two texels.
pub fn bloom_level_extents(bloom: Extent, iterations: u32) -> Vec<Extent> {
    let mut levels = Vec::new();
    for i in 0..iterations.min(31) {
        let width = bloom.width >> (i + 1);
        let height = bloom.height >> (i + 1);
        if width < 2 || height < 2 {
            break;
        }
        levels.push(Extent::new(width, height));
    }
    levels
}

pub struct BloomFields {
    pub target: TextureField,
    pub levels: Vec<TextureField>,
}

pub struct SunraysFields {
    pub target: TextureField,
    pub temp: TextureField,
}

pub struct FieldStore {
    pub formats: FieldFormats,
    pub tiers: ResolutionTiers,
    pub viewport: Extent,
    pub velocity: DoubleBuffer<TextureField>,
    pub dye: DoubleBuffer<TextureField>,
    pub pressure: DoubleBuffer<TextureField>,
    pub divergence: TextureField,
    pub curl: TextureField,
    pub bloom: Option<BloomFields>,
    pub sunrays: Option<SunraysFields>,
    pub dither: TextureField,
    /// Bound in place of a disabled feature's texture.
    pub placeholder: TextureField,
    pub samplers: Samplers,
    bloom_iterations: u32,
}

/// Fields rebuilt by one resize. `None` means the category kept its extent.
struct Rebuild {
    simulation: Option<SimulationFields>,
    dye: Option<DoubleBuffer<TextureField>>,
    bloom: Option<BloomFields>,
    sunrays: Option<SunraysFields>,
}

struct SimulationFields {
    velocity: DoubleBuffer<TextureField>,
    pressure: DoubleBuffer<TextureField>,
    divergence: TextureField,
    curl: TextureField,
}

impl FieldStore {
    /// Allocates every field for `viewport`, retrying once at half resolution
    /// if the first attempt runs out of memory.
    pub fn new(ctx: &GpuContext, config: &FluidConfig, viewport: Extent) -> Result<Self, EngineError> {
        let formats = FieldFormats::acquire(ctx, config)?;
        let tiers = ResolutionTiers::from_config(config);
        match Self::allocate(ctx, config, formats, tiers, viewport) {
            Err(err @ EngineError::AllocationFailure { .. }) => {
                log::warn!("{err}; retrying at half resolution");
                Self::allocate(ctx, config, formats, tiers.halved(), viewport)
            }
            result => result,
        }
    }

    fn allocate(
        ctx: &GpuContext,
        config: &FluidConfig,
        formats: FieldFormats,
        tiers: ResolutionTiers,
        viewport: Extent,
    ) -> Result<Self, EngineError> {
        let extents = tiers.extents(viewport);
        let simulation = Self::build_simulation(ctx, formats, extents.sim)?;
        let dye = DoubleBuffer::allocate(ctx, "Dye", extents.dye, formats.rgba)?;
        let bloom = Self::build_bloom(ctx, formats, extents.bloom, config.bloom_iterations)?;
        let sunrays = Self::build_sunrays(ctx, formats, extents.sunrays)?;
        let dither = create_dither(ctx)?;
        let placeholder = TextureField::allocate(
            ctx,
            "Placeholder",
            Extent::new(1, 1),
            FieldFormat {
                format: wgpu::TextureFormat::Rgba8Unorm,
                filter: wgpu::FilterMode::Linear,
            },
        )?;

        log::info!(
            "Fields allocated: velocity {}x{}, dye {}x{}, bloom {}, sunrays {}",
            extents.sim.width,
            extents.sim.height,
            extents.dye.width,
            extents.dye.height,
            if bloom.is_some() { "on" } else { "off" },
            if sunrays.is_some() { "on" } else { "off" },
        );

        let store = Self {
            formats,
            tiers,
            viewport,
            velocity: simulation.velocity,
            dye,
            pressure: simulation.pressure,
            divergence: simulation.divergence,
            curl: simulation.curl,
            bloom,
            sunrays,
            dither,
            placeholder,
            samplers: Samplers::new(&ctx.device),
            bloom_iterations: config.bloom_iterations,
        };
        store.clear_all(ctx);
        Ok(store)
    }

    fn build_simulation(
        ctx: &GpuContext,
        formats: FieldFormats,
        extent: Extent,
    ) -> Result<SimulationFields, EngineError> {
        Ok(SimulationFields {
            velocity: DoubleBuffer::allocate(ctx, "Velocity", extent, formats.rg)?,
            pressure: DoubleBuffer::allocate(ctx, "Pressure", extent, formats.r)?,
            divergence: TextureField::allocate(ctx, "Divergence", extent, formats.r.nearest())?,
            curl: TextureField::allocate(ctx, "Curl", extent, formats.r.nearest())?,
        })
    }

    fn build_bloom(
        ctx: &GpuContext,
        formats: FieldFormats,
        extent: Extent,
        iterations: u32,
    ) -> Result<Option<BloomFields>, EngineError> {
        let Some(format) = formats.bloom else {
            return Ok(None);
        };
        let target = TextureField::allocate(ctx, "Bloom", extent, format)?;
        let levels = bloom_level_extents(extent, iterations)
            .into_iter()
            .enumerate()
            .map(|(i, level)| TextureField::allocate(ctx, &format!("Bloom Level {i}"), level, format))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Some(BloomFields { target, levels }))
    }

    fn build_sunrays(
        ctx: &GpuContext,
        formats: FieldFormats,
        extent: Extent,
    ) -> Result<Option<SunraysFields>, EngineError> {
        let Some(format) = formats.sunrays else {
            return Ok(None);
        };
        Ok(Some(SunraysFields {
            target: TextureField::allocate(ctx, "Sunrays", extent, format)?,
            temp: TextureField::allocate(ctx, "Sunrays Temp", extent, format)?,
        }))
    }

    fn clear_all(&self, ctx: &GpuContext) {
        let mut encoder = ctx.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Field Init"),
        });
        for field in self.simulation_fields().chain(self.dye_fields()) {
            field.clear(&mut encoder, REST_COLOR);
        }
        ctx.queue.submit(std::iter::once(encoder.finish()));
    }

    fn simulation_fields(&self) -> impl Iterator<Item = &TextureField> {
        [
            self.velocity.read(),
            self.velocity.write(),
            self.pressure.read(),
            self.pressure.write(),
            &self.divergence,
            &self.curl,
        ]
        .into_iter()
    }

    fn dye_fields(&self) -> impl Iterator<Item = &TextureField> {
        [self.dye.read(), self.dye.write()].into_iter()
    }

    pub fn extents(&self) -> FieldExtents {
        self.tiers.extents(self.viewport)
    }

    /// Reallocates the categories whose extent differs at `viewport` and
    /// records copies of the old velocity and dye into `batch`. The old
    /// textures stay alive until the recorded passes have been submitted.
    pub fn resize(
        &mut self,
        ctx: &GpuContext,
        viewport: Extent,
        batch: &mut PassBatch,
    ) -> Result<bool, EngineError> {
        let rebuild = match self.rebuild(ctx, self.tiers, viewport) {
            Err(err @ EngineError::AllocationFailure { .. }) if !self.tiers.reduced => {
                log::warn!("{err}; retrying at half resolution");
                let tiers = self.tiers.halved();
                let rebuild = self.rebuild_all(ctx, tiers, viewport)?;
                self.tiers = tiers;
                rebuild
            }
            result => result?,
        };
        self.viewport = viewport;

        let changed = rebuild.simulation.is_some()
            || rebuild.dye.is_some()
            || rebuild.bloom.is_some()
            || rebuild.sunrays.is_some();
        if !changed {
            return Ok(false);
        }

        let mut encoder = ctx.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Field Resize Init"),
        });

        if let Some(simulation) = rebuild.simulation {
            for field in [
                simulation.velocity.write(),
                simulation.pressure.read(),
                simulation.pressure.write(),
                &simulation.divergence,
                &simulation.curl,
            ] {
                field.clear(&mut encoder, REST_COLOR);
            }
            batch.draw(
                Pass::new("Resize Velocity", ProgramKind::Copy, simulation.velocity.read())
                    .input(self.velocity.read()),
            );
            self.velocity = simulation.velocity;
            self.pressure = simulation.pressure;
            self.divergence = simulation.divergence;
            self.curl = simulation.curl;
        }

        if let Some(dye) = rebuild.dye {
            dye.write().clear(&mut encoder, REST_COLOR);
            batch.draw(Pass::new("Resize Dye", ProgramKind::Copy, dye.read()).input(self.dye.read()));
            self.dye = dye;
        }

        if let Some(bloom) = rebuild.bloom {
            self.bloom = Some(bloom);
        }
        if let Some(sunrays) = rebuild.sunrays {
            self.sunrays = Some(sunrays);
        }

        ctx.queue.submit(std::iter::once(encoder.finish()));

        let extents = self.extents();
        log::info!(
            "Resized to {}x{}: velocity {}x{}, dye {}x{}",
            viewport.width,
            viewport.height,
            extents.sim.width,
            extents.sim.height,
            extents.dye.width,
            extents.dye.height
        );
        Ok(true)
    }

    fn rebuild(&self, ctx: &GpuContext, tiers: ResolutionTiers, viewport: Extent) -> Result<Rebuild, EngineError> {
        let old = self.extents();
        let new = tiers.extents(viewport);

        let simulation = if new.sim != old.sim {
            Some(Self::build_simulation(ctx, self.formats, new.sim)?)
        } else {
            None
        };
        let dye = if new.dye != old.dye {
            Some(DoubleBuffer::allocate(ctx, "Dye", new.dye, self.formats.rgba)?)
        } else {
            None
        };
        let bloom = if new.bloom != old.bloom {
            Self::build_bloom(ctx, self.formats, new.bloom, self.bloom_iterations)?
        } else {
            None
        };
        let sunrays = if new.sunrays != old.sunrays {
            Self::build_sunrays(ctx, self.formats, new.sunrays)?
        } else {
            None
        };
        Ok(Rebuild {
            simulation,
            dye,
            bloom,
            sunrays,
        })
    }

    /// Rebuild at a new tier, where every category's extent changes.
    fn rebuild_all(&self, ctx: &GpuContext, tiers: ResolutionTiers, viewport: Extent) -> Result<Rebuild, EngineError> {
        let new = tiers.extents(viewport);
        Ok(Rebuild {
            simulation: Some(Self::build_simulation(ctx, self.formats, new.sim)?),
            dye: Some(DoubleBuffer::allocate(ctx, "Dye", new.dye, self.formats.rgba)?),
            bloom: Self::build_bloom(ctx, self.formats, new.bloom, self.bloom_iterations)?,
            sunrays: Self::build_sunrays(ctx, self.formats, new.sunrays)?,
        })
    }

    /// Tiling factor that keeps one dither texel per dye texel.
    pub fn dither_scale(&self) -> [f32; 2] {
        let dye = self.dye.extent();
        [
            dye.width as f32 / self.dither.extent.width as f32,
            dye.height as f32 / self.dither.extent.height as f32,
        ]
    }
}

/// White-noise tile used to break up banding in the display pass.
fn create_dither(ctx: &GpuContext) -> Result<TextureField, EngineError> {
    let extent = Extent::new(DITHER_SIZE, DITHER_SIZE);
    let field = TextureField::allocate(
        ctx,
        "Dither",
        extent,
        FieldFormat {
            format: wgpu::TextureFormat::R8Unorm,
            filter: wgpu::FilterMode::Linear,
        },
    )?;

    let mut rng = StdRng::seed_from_u64(DITHER_SEED);
    let noise: Vec<u8> = (0..extent.texel_count()).map(|_| rng.gen()).collect();
    ctx.queue.write_texture(
        field.texture.as_image_copy(),
        &noise,
        wgpu::ImageDataLayout {
            offset: 0,
            bytes_per_row: Some(DITHER_SIZE),
            rows_per_image: Some(DITHER_SIZE),
        },
        wgpu::Extent3d {
            width: DITHER_SIZE,
            height: DITHER_SIZE,
            depth_or_array_layers: 1,
        },
    );
    Ok(field)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resize_to_widescreen_updates_every_tier() {
        let tiers = ResolutionTiers::from_config(&FluidConfig::default());

        let before = tiers.extents(Extent::new(800, 600));
        assert_eq!(before.sim, Extent::new(128, 96));
        assert_eq!(before.dye, Extent::new(512, 384));

        let after = tiers.extents(Extent::new(1920, 1080));
        assert_eq!(after.sim, Extent::new(128, 72));
        assert_eq!(after.dye, Extent::new(512, 288));
        assert_eq!(after.bloom, Extent::new(256, 144));
        assert_eq!(after.sunrays.width, 196);
    }

    #[test]
    fn halved_tiers_are_marked_reduced() {
        let tiers = ResolutionTiers::from_config(&FluidConfig::default()).halved();
        assert!(tiers.reduced);
        assert_eq!((tiers.sim, tiers.dye), (64, 256));
        assert_eq!(tiers.extents(Extent::new(800, 600)).sim, Extent::new(64, 48));
    }

    #[test]
    fn bloom_chain_stops_before_degenerate_levels() {
        let levels = bloom_level_extents(Extent::new(256, 144), 8);
        assert_eq!(levels.first(), Some(&Extent::new(128, 72)));
        assert!(levels.iter().all(|level| level.width >= 2 && level.height >= 2));
        // 144 >> 7 == 1, so the seventh level is dropped.
        assert_eq!(levels.len(), 6);

        assert!(bloom_level_extents(Extent::new(3, 3), 8).is_empty());
    }

    struct HalfFloatless;

    impl FormatProbe for HalfFloatless {
        fn supports_render_target(&self, format: wgpu::TextureFormat) -> bool {
            format == wgpu::TextureFormat::Rgba32Float
        }

        fn supports_linear_filtering(&self, _format: wgpu::TextureFormat) -> bool {
            false
        }
    }

    #[test]
    fn every_category_falls_back_to_full_float() {
        let formats = FieldFormats::acquire(&HalfFloatless, &FluidConfig::default()).unwrap();
        for format in [formats.rgba, formats.rg, formats.r] {
            assert_eq!(format.format, wgpu::TextureFormat::Rgba32Float);
            assert_eq!(format.filter, wgpu::FilterMode::Nearest);
        }
        // Full float targets can't take the additive bloom upsample.
        assert!(formats.bloom.is_none());
        assert!(formats.sunrays.is_some());
    }

    struct NothingRenders;

    impl FormatProbe for NothingRenders {
        fn supports_render_target(&self, _format: wgpu::TextureFormat) -> bool {
            false
        }

        fn supports_linear_filtering(&self, _format: wgpu::TextureFormat) -> bool {
            false
        }
    }

    #[test]
    fn missing_core_formats_are_fatal() {
        let err = FieldFormats::acquire(&NothingRenders, &FluidConfig::default()).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn unsupported_feature_format_disables_feature() {
        let format = optional_format(&NothingRenders, wgpu::TextureFormat::R16Float, "Sunrays", true);
        assert!(format.is_none());

        let config = FluidConfig {
            bloom: false,
            ..FluidConfig::default()
        };
        let formats = FieldFormats::acquire(&HalfFloatless, &config).unwrap();
        assert!(formats.bloom.is_none());
        assert!(formats.sunrays.is_some());

        let config = FluidConfig {
            sunrays: false,
            ..FluidConfig::default()
        };
        assert!(FieldFormats::acquire(&HalfFloatless, &config).unwrap().sunrays.is_none());
    }
}
