// Aurora - GPU Fluid Backdrop Renderer
// Copyright (c) 2025 Filipe da Veiga Ventura Alves
// Licensed under MIT License

//! Texture fields and the double-buffer arena the solver ping-pongs through.

use std::sync::Arc;

use crate::error::EngineError;
use crate::gpu::GpuContext;

/// Width and height of a field or viewport, in texels or pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub width: u32,
    pub height: u32,
}

impl Extent {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn texel_size(&self) -> [f32; 2] {
        [1.0 / self.width.max(1) as f32, 1.0 / self.height.max(1) as f32]
    }

    pub fn aspect(&self) -> f32 {
        self.width.max(1) as f32 / self.height.max(1) as f32
    }

    pub fn halved(&self) -> Self {
        Self::new((self.width / 2).max(1), (self.height / 2).max(1))
    }

    pub fn texel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

/// Grid dimensions for a resolution tier that follow the viewport's aspect ratio.
///
/// The longer side gets exactly `resolution` texels and the shorter side is
/// scaled down to keep `width / height` as close to the viewport as rounding
/// allows.
pub fn aspect_resolution(resolution: u32, viewport: Extent) -> Extent {
    let resolution = resolution.max(1);
    let w = viewport.width.max(1) as f32;
    let h = viewport.height.max(1) as f32;
    let aspect = if w >= h { w / h } else { h / w };
    let short = ((resolution as f32 / aspect).round() as u32).clamp(1, resolution);
    if w >= h {
        Extent::new(resolution, short)
    } else {
        Extent::new(short, resolution)
    }
}

/// A render-target format together with the sampling mode the hardware allows for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldFormat {
    pub format: wgpu::TextureFormat,
    pub filter: wgpu::FilterMode,
}

impl FieldFormat {
    /// Same storage, but sampled without interpolation.
    pub fn nearest(self) -> Self {
        Self {
            filter: wgpu::FilterMode::Nearest,
            ..self
        }
    }
}

/// Hardware capability queries used to pick field formats.
pub trait FormatProbe {
    fn supports_render_target(&self, format: wgpu::TextureFormat) -> bool;
    fn supports_linear_filtering(&self, format: wgpu::TextureFormat) -> bool;

    /// Whether additive blending into `format` is allowed.
    fn supports_blending(&self, format: wgpu::TextureFormat) -> bool {
        format != wgpu::TextureFormat::Rgba32Float
    }
}

/// Next wider format to try when `format` cannot be rendered into.
pub fn fallback_format(format: wgpu::TextureFormat) -> Option<wgpu::TextureFormat> {
    use wgpu::TextureFormat::*;
    match format {
        R16Float => Some(Rg16Float),
        Rg16Float => Some(Rgba16Float),
        Rgba16Float => Some(Rgba32Float),
        _ => None,
    }
}

/// Walks the fallback chain from `candidate` until the probe accepts a format.
pub fn acquire_format(
    probe: &impl FormatProbe,
    candidate: wgpu::TextureFormat,
) -> Result<FieldFormat, EngineError> {
    let mut current = Some(candidate);
    while let Some(format) = current {
        if probe.supports_render_target(format) {
            let filter = if probe.supports_linear_filtering(format) {
                wgpu::FilterMode::Linear
            } else {
                wgpu::FilterMode::Nearest
            };
            if format != candidate {
                log::debug!("{candidate:?} unsupported, using {format:?}");
            }
            return Ok(FieldFormat { format, filter });
        }
        current = fallback_format(format);
    }
    Err(EngineError::FormatUnsupported {
        requested: candidate,
    })
}

/// Staging formats fields are copied into before mapping, widest first.
const READBACK_FORMATS: [wgpu::TextureFormat; 2] =
    [wgpu::TextureFormat::Rgba32Float, wgpu::TextureFormat::Rgba16Float];

/// First staging format the probe can render into, sampled nearest.
pub fn readback_format(probe: &impl FormatProbe) -> Result<FieldFormat, EngineError> {
    READBACK_FORMATS
        .into_iter()
        .find(|format| probe.supports_render_target(*format))
        .map(|format| FieldFormat {
            format,
            filter: wgpu::FilterMode::Nearest,
        })
        .ok_or(EngineError::FormatUnsupported {
            requested: READBACK_FORMATS[0],
        })
}

/// A GPU-resident 2D grid the passes sample from and render into.
pub struct TextureField {
    pub label: String,
    pub texture: wgpu::Texture,
    pub view: Arc<wgpu::TextureView>,
    pub extent: Extent,
    pub texel_size: [f32; 2],
    pub format: FieldFormat,
}

impl TextureField {
    /// Allocates inside an error scope so out-of-memory and oversize requests
    /// come back as `AllocationFailure` instead of a device panic.
    pub fn allocate(
        ctx: &GpuContext,
        label: &str,
        extent: Extent,
        format: FieldFormat,
    ) -> Result<Self, EngineError> {
        ctx.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        ctx.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let texture = ctx.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: wgpu::Extent3d {
                width: extent.width,
                height: extent.height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: format.format,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_SRC
                | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let validation = pollster::block_on(ctx.device.pop_error_scope());
        let oom = pollster::block_on(ctx.device.pop_error_scope());
        if let Some(err) = oom.or(validation) {
            return Err(EngineError::AllocationFailure {
                label: label.to_string(),
                width: extent.width,
                height: extent.height,
                reason: err.to_string(),
            });
        }

        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Ok(Self {
            label: label.to_string(),
            texture,
            view: Arc::new(view),
            extent,
            texel_size: extent.texel_size(),
            format,
        })
    }

    /// Like [`allocate`](Self::allocate), but retries once at half the
    /// extent when the first attempt fails.
    pub fn allocate_or_halve(
        ctx: &GpuContext,
        label: &str,
        extent: Extent,
        format: FieldFormat,
    ) -> Result<Self, EngineError> {
        match Self::allocate(ctx, label, extent, format) {
            Err(err @ EngineError::AllocationFailure { .. }) => {
                log::warn!("{err}; retrying at half resolution");
                Self::allocate(ctx, label, extent.halved(), format)
            }
            result => result,
        }
    }

    pub fn filter(&self) -> wgpu::FilterMode {
        self.format.filter
    }

    /// Records a clear of the whole field.
    pub fn clear(&self, encoder: &mut wgpu::CommandEncoder, color: wgpu::Color) {
        encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("Field Clear"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: &self.view,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(color),
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
        });
    }
}

/// Read/write pair addressed by index. Swapping flips which slot is read, so
/// the two allocations never move and a pass can't target the slot it samples.
#[derive(Debug, Clone)]
pub struct DoubleBuffer<T> {
    slots: [T; 2],
    read: usize,
}

impl<T> DoubleBuffer<T> {
    pub fn new(first: T, second: T) -> Self {
        Self {
            slots: [first, second],
            read: 0,
        }
    }

    pub fn read(&self) -> &T {
        &self.slots[self.read]
    }

    pub fn write(&self) -> &T {
        &self.slots[self.read ^ 1]
    }

    pub fn swap(&mut self) {
        self.read ^= 1;
    }

    pub fn read_index(&self) -> usize {
        self.read
    }
}

impl DoubleBuffer<TextureField> {
    pub fn allocate(
        ctx: &GpuContext,
        label: &str,
        extent: Extent,
        format: FieldFormat,
    ) -> Result<Self, EngineError> {
        let first = TextureField::allocate(ctx, &format!("{label} A"), extent, format)?;
        let second = TextureField::allocate(ctx, &format!("{label} B"), extent, format)?;
        Ok(Self::new(first, second))
    }

    pub fn extent(&self) -> Extent {
        self.read().extent
    }

    pub fn texel_size(&self) -> [f32; 2] {
        self.read().texel_size
    }
}

/// Host copy of a field, row-major with row 0 at `v = 0`.
#[derive(Debug, Clone)]
pub struct FieldSnapshot {
    pub extent: Extent,
    pub texels: Vec<[f32; 4]>,
}

impl FieldSnapshot {
    pub fn get(&self, x: u32, y: u32) -> [f32; 4] {
        let x = x.min(self.extent.width - 1) as usize;
        let y = y.min(self.extent.height - 1) as usize;
        self.texels[y * self.extent.width as usize + x]
    }

    /// Nearest texel to a normalized coordinate.
    pub fn at_uv(&self, u: f32, v: f32) -> [f32; 4] {
        let x = (u * self.extent.width as f32).floor().max(0.0) as u32;
        let y = (v * self.extent.height as f32).floor().max(0.0) as u32;
        self.get(x, y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn longer_side_matches_requested_resolution() {
        let viewports = [
            Extent::new(800, 600),
            Extent::new(600, 800),
            Extent::new(1920, 1080),
            Extent::new(1080, 1920),
            Extent::new(1000, 1000),
            Extent::new(3440, 1440),
            Extent::new(5000, 3),
        ];
        for resolution in [128, 196, 256, 512] {
            for viewport in viewports {
                let extent = aspect_resolution(resolution, viewport);
                assert_eq!(extent.width.max(extent.height), resolution, "{viewport:?}");

                let aspect = viewport.width.max(viewport.height) as f32
                    / viewport.width.min(viewport.height) as f32;
                let short = extent.width.min(extent.height) as f32;
                let ideal = resolution as f32 / aspect;
                assert!(
                    (short - ideal).abs() <= 0.5 || short == 1.0,
                    "{viewport:?} at {resolution}: short side {short}, ideal {ideal}"
                );
                assert_eq!(extent.width >= extent.height, viewport.width >= viewport.height);
            }
        }
    }

    #[test]
    fn texel_size_follows_extent() {
        let extent = aspect_resolution(128, Extent::new(800, 600));
        assert_eq!(extent, Extent::new(128, 96));
        assert_eq!(extent.texel_size(), [1.0 / 128.0, 1.0 / 96.0]);
    }

    #[test]
    fn two_swaps_restore_roles() {
        let mut buffer = DoubleBuffer::new("a", "b");
        assert_eq!((*buffer.read(), *buffer.write()), ("a", "b"));
        buffer.swap();
        assert_eq!((*buffer.read(), *buffer.write()), ("b", "a"));
        buffer.swap();
        assert_eq!((*buffer.read(), *buffer.write()), ("a", "b"));
        assert_eq!(buffer.read_index(), 0);
    }

    struct FakeProbe {
        renderable: HashSet<wgpu::TextureFormat>,
        filterable: HashSet<wgpu::TextureFormat>,
    }

    impl FormatProbe for FakeProbe {
        fn supports_render_target(&self, format: wgpu::TextureFormat) -> bool {
            self.renderable.contains(&format)
        }

        fn supports_linear_filtering(&self, format: wgpu::TextureFormat) -> bool {
            self.filterable.contains(&format)
        }
    }

    #[test]
    fn unsupported_format_resolves_to_fallback() {
        let probe = FakeProbe {
            renderable: [wgpu::TextureFormat::Rgba16Float].into_iter().collect(),
            filterable: [wgpu::TextureFormat::Rgba16Float].into_iter().collect(),
        };
        let format = acquire_format(&probe, wgpu::TextureFormat::R16Float).unwrap();
        assert_eq!(format.format, wgpu::TextureFormat::Rgba16Float);
        assert_eq!(format.filter, wgpu::FilterMode::Linear);
    }

    #[test]
    fn unfilterable_fallback_samples_nearest() {
        let probe = FakeProbe {
            renderable: [wgpu::TextureFormat::Rgba32Float].into_iter().collect(),
            filterable: HashSet::new(),
        };
        let format = acquire_format(&probe, wgpu::TextureFormat::Rg16Float).unwrap();
        assert_eq!(format.format, wgpu::TextureFormat::Rgba32Float);
        assert_eq!(format.filter, wgpu::FilterMode::Nearest);
    }

    #[test]
    fn exhausted_chain_reports_requested_format() {
        let probe = FakeProbe {
            renderable: HashSet::new(),
            filterable: HashSet::new(),
        };
        match acquire_format(&probe, wgpu::TextureFormat::R16Float) {
            Err(EngineError::FormatUnsupported { requested }) => {
                assert_eq!(requested, wgpu::TextureFormat::R16Float)
            }
            other => panic!("expected FormatUnsupported, got {other:?}"),
        }
    }

    #[test]
    fn half_float_adapter_reads_back_through_rgba16() {
        let probe = FakeProbe {
            renderable: [
                wgpu::TextureFormat::R16Float,
                wgpu::TextureFormat::Rg16Float,
                wgpu::TextureFormat::Rgba16Float,
            ]
            .into_iter()
            .collect(),
            filterable: HashSet::new(),
        };
        let format = readback_format(&probe).unwrap();
        assert_eq!(format.format, wgpu::TextureFormat::Rgba16Float);
        assert_eq!(format.filter, wgpu::FilterMode::Nearest);

        let probe = FakeProbe {
            renderable: READBACK_FORMATS.into_iter().collect(),
            filterable: HashSet::new(),
        };
        assert_eq!(readback_format(&probe).unwrap().format, wgpu::TextureFormat::Rgba32Float);

        let probe = FakeProbe {
            renderable: HashSet::new(),
            filterable: HashSet::new(),
        };
        assert!(!readback_format(&probe).unwrap_err().is_fatal());
    }

    #[test]
    fn snapshot_uv_lookup_clamps() {
        let snapshot = FieldSnapshot {
            extent: Extent::new(2, 2),
            texels: vec![[0.0; 4], [1.0; 4], [2.0; 4], [3.0; 4]],
        };
        assert_eq!(snapshot.at_uv(0.0, 0.0)[0], 0.0);
        assert_eq!(snapshot.at_uv(0.75, 0.25)[0], 1.0);
        assert_eq!(snapshot.at_uv(1.0, 1.0)[0], 3.0);
    }
}
