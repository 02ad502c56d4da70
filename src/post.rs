// Aurora - GPU Fluid Backdrop Renderer
// Copyright (c) 2025 Filipe da Veiga Ventura Alves
// Licensed under MIT License

//! Post-processing: bloom, light shafts and the final display composite.

use std::sync::Arc;

use crate::config::FluidConfig;
use crate::field::TextureField;
use crate::pass::{Pass, PassBatch};
use crate::program::{Blend, Keywords, PassParams, ProgramKind};
use crate::store::{BloomFields, FieldStore};

/// Soft-knee threshold curve as `(threshold - knee, 2 * knee, 0.25 / knee, threshold)`.
pub fn bloom_curve(threshold: f32, soft_knee: f32) -> [f32; 4] {
    let knee = threshold * soft_knee + 0.0001;
    [threshold - knee, knee * 2.0, 0.25 / knee, threshold]
}

/// Bloom is only composited when its blur chain has at least one level.
fn active_bloom(store: &FieldStore) -> Option<&BloomFields> {
    store.bloom.as_ref().filter(|bloom| !bloom.levels.is_empty())
}

/// Records prefilter, downsample chain, additive upsample and final scale.
pub fn bloom(batch: &mut PassBatch, store: &FieldStore, config: &FluidConfig) {
    let Some(bloom) = active_bloom(store) else {
        return;
    };

    batch.draw(
        Pass::new("Bloom Prefilter", ProgramKind::BloomPrefilter, &bloom.target)
            .input(store.dye.read())
            .params(PassParams {
                curve: bloom_curve(config.bloom_threshold, config.bloom_soft_knee),
                ..PassParams::with_texel(bloom.target.texel_size)
            }),
    );

    let mut last = &bloom.target;
    for level in &bloom.levels {
        batch.draw(
            Pass::new("Bloom Downsample", ProgramKind::BloomBlur, level)
                .input(last)
                .params(PassParams::with_texel(last.texel_size)),
        );
        last = level;
    }

    for level in bloom.levels.iter().rev().skip(1) {
        batch.draw(
            Pass::new("Bloom Upsample", ProgramKind::BloomBlur, level)
                .input(last)
                .blend(Blend::Additive)
                .params(PassParams::with_texel(last.texel_size)),
        );
        last = level;
    }

    batch.draw(
        Pass::new("Bloom Final", ProgramKind::BloomFinal, &bloom.target)
            .input(last)
            .params(PassParams {
                value: config.bloom_intensity,
                ..PassParams::with_texel(last.texel_size)
            }),
    );
}

/// Records the brightness mask, the radial light-shaft march and one blur.
/// The mask is written into the dye write slot, which the next advection
/// overwrites anyway.
pub fn sunrays(batch: &mut PassBatch, store: &FieldStore, config: &FluidConfig) {
    let Some(sunrays) = &store.sunrays else {
        return;
    };
    let mask = store.dye.write();

    batch.draw(Pass::new("Sunrays Mask", ProgramKind::SunraysMask, mask).input(store.dye.read()));
    batch.draw(
        Pass::new("Sunrays", ProgramKind::Sunrays, &sunrays.target)
            .input(mask)
            .params(PassParams {
                weight: config.sunrays_weight,
                ..PassParams::with_texel(sunrays.target.texel_size)
            }),
    );
    blur(batch, &sunrays.target, &sunrays.temp, 1);
}

/// Separable blur of `target`: horizontal into `temp`, vertical back.
pub fn blur(batch: &mut PassBatch, target: &TextureField, temp: &TextureField, iterations: u32) {
    let [texel_x, texel_y] = target.texel_size;
    for _ in 0..iterations {
        batch.draw(
            Pass::new("Blur Horizontal", ProgramKind::Blur, temp)
                .input(target)
                .params(PassParams::with_texel([texel_x, 0.0])),
        );
        batch.draw(
            Pass::new("Blur Vertical", ProgramKind::Blur, target)
                .input(temp)
                .params(PassParams::with_texel([0.0, texel_y])),
        );
    }
}

pub fn display_keywords(config: &FluidConfig, bloom: bool, sunrays: bool) -> Keywords {
    Keywords::NONE
        .with(Keywords::SHADING, config.shading)
        .with(Keywords::BLOOM, config.bloom && bloom)
        .with(Keywords::SUNRAYS, config.sunrays && sunrays)
}

/// What the display pass clears its target to before blending over it.
pub fn display_clear(config: &FluidConfig) -> wgpu::Color {
    if config.transparent {
        wgpu::Color::TRANSPARENT
    } else {
        let [r, g, b] = config.back_color;
        wgpu::Color {
            r: r as f64,
            g: g as f64,
            b: b as f64,
            a: 1.0,
        }
    }
}

/// Composites dye, bloom and sunrays onto `view`.
pub fn display(
    batch: &mut PassBatch,
    store: &FieldStore,
    config: &FluidConfig,
    view: Arc<wgpu::TextureView>,
    format: wgpu::TextureFormat,
) {
    let bloom = active_bloom(store).map(|bloom| &bloom.target);
    let sunrays = store.sunrays.as_ref().map(|sunrays| &sunrays.target);
    let keywords = display_keywords(config, bloom.is_some(), sunrays.is_some());

    batch.draw(
        Pass::to_view("Display", ProgramKind::Display, view, format)
            .input(store.dye.read())
            .input(bloom.unwrap_or(&store.placeholder))
            .input(sunrays.unwrap_or(&store.placeholder))
            .input(&store.dither)
            .keywords(keywords)
            .blend(Blend::Over)
            .clear_to(display_clear(config))
            .params(PassParams {
                dither_scale: store.dither_scale(),
                ..PassParams::with_texel(store.dye.texel_size())
            }),
    );
}

/// Records bloom and sunrays (when enabled) followed by the display pass.
pub fn render(
    batch: &mut PassBatch,
    store: &FieldStore,
    config: &FluidConfig,
    view: Arc<wgpu::TextureView>,
    format: wgpu::TextureFormat,
) {
    if config.bloom {
        bloom(batch, store, config);
    }
    if config.sunrays {
        sunrays(batch, store, config);
    }
    display(batch, store, config, view, format);
}
