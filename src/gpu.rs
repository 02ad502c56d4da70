// Aurora - GPU Fluid Backdrop Renderer
// Copyright (c) 2025 Filipe da Veiga Ventura Alves
// Licensed under MIT License

use half::f16;

use crate::error::EngineError;
use crate::field::{Extent, FieldSnapshot, FormatProbe, TextureField};

/// Device handles shared by every stage of the engine.
pub struct GpuContext {
    pub instance: wgpu::Instance,
    pub adapter: wgpu::Adapter,
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
}

impl GpuContext {
    pub fn create_instance() -> wgpu::Instance {
        wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY | wgpu::Backends::GL,
            ..Default::default()
        })
    }

    pub async fn new(
        instance: wgpu::Instance,
        compatible_surface: Option<&wgpu::Surface<'_>>,
    ) -> Result<Self, EngineError> {
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface,
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| EngineError::HardwareUnsupported("no compatible adapter".into()))?;

        let info = adapter.get_info();
        log::info!("Using {} ({:?})", info.name, info.backend);

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("Fluid Device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::downlevel_defaults()
                        .using_resolution(adapter.limits()),
                    memory_hints: Default::default(),
                },
                None,
            )
            .await
            .map_err(|err| EngineError::HardwareUnsupported(err.to_string()))?;

        Ok(Self {
            instance,
            adapter,
            device,
            queue,
        })
    }

    /// Context without a presentation surface, for probes and tests.
    pub fn headless() -> Result<Self, EngineError> {
        pollster::block_on(Self::new(Self::create_instance(), None))
    }

    /// Copies `field` back to host memory. Only formats with a texel decoder
    /// (`Rgba32Float`, `Rgba16Float`, `Rgba8Unorm`) can be read; anything else
    /// is copied into one of those first.
    pub fn read_texture(&self, field: &TextureField) -> Result<FieldSnapshot, EngineError> {
        let Extent { width, height } = field.extent;
        let (bytes_per_pixel, decode) = texel_decoder(field.format.format).ok_or(
            EngineError::FormatUnsupported {
                requested: field.format.format,
            },
        )?;
        let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let stride_bytes = (width * bytes_per_pixel).div_ceil(align) * align;

        let staging_buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Field Readback"),
            size: (stride_bytes * height) as u64,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Read"),
        });
        encoder.copy_texture_to_buffer(
            field.texture.as_image_copy(),
            wgpu::ImageCopyBuffer {
                buffer: &staging_buffer,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(stride_bytes),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        self.queue.submit(std::iter::once(encoder.finish()));

        let buffer_slice = staging_buffer.slice(..);
        let (sender, receiver) = futures_intrusive::channel::shared::oneshot_channel();
        buffer_slice.map_async(wgpu::MapMode::Read, move |result| {
            sender.send(result).ok();
        });
        self.device.poll(wgpu::Maintain::Wait);
        match pollster::block_on(receiver.receive()) {
            Some(Ok(())) => {}
            Some(Err(err)) => {
                return Err(EngineError::AllocationFailure {
                    label: field.label.clone(),
                    width,
                    height,
                    reason: err.to_string(),
                })
            }
            None => {
                return Err(EngineError::AllocationFailure {
                    label: field.label.clone(),
                    width,
                    height,
                    reason: "readback channel closed".into(),
                })
            }
        }

        let data = buffer_slice.get_mapped_range();
        let mut texels = Vec::with_capacity(field.extent.texel_count());
        for row in data.chunks_exact(stride_bytes as usize).take(height as usize) {
            let row = &row[..(width * bytes_per_pixel) as usize];
            texels.extend(row.chunks_exact(bytes_per_pixel as usize).map(decode));
        }
        drop(data);
        staging_buffer.unmap();

        Ok(FieldSnapshot {
            extent: field.extent,
            texels,
        })
    }
}

type TexelDecoder = fn(&[u8]) -> [f32; 4];

fn texel_decoder(format: wgpu::TextureFormat) -> Option<(u32, TexelDecoder)> {
    match format {
        wgpu::TextureFormat::Rgba32Float => Some((16, decode_rgba32f)),
        wgpu::TextureFormat::Rgba16Float => Some((8, decode_rgba16f)),
        wgpu::TextureFormat::Rgba8Unorm => Some((4, decode_rgba8)),
        _ => None,
    }
}

fn decode_rgba32f(bytes: &[u8]) -> [f32; 4] {
    bytemuck::pod_read_unaligned(bytes)
}

fn decode_rgba16f(bytes: &[u8]) -> [f32; 4] {
    let mut texel = [0.0; 4];
    for (channel, half) in texel.iter_mut().zip(bytes.chunks_exact(2)) {
        *channel = f16::from_le_bytes([half[0], half[1]]).to_f32();
    }
    texel
}

fn decode_rgba8(bytes: &[u8]) -> [f32; 4] {
    let mut texel = [0.0; 4];
    for (channel, byte) in texel.iter_mut().zip(bytes) {
        *channel = *byte as f32 / 255.0;
    }
    texel
}

impl FormatProbe for GpuContext {
    /// Renders a clear into a 4x4 texture of `format` and reports whether the
    /// device accepted it.
    fn supports_render_target(&self, format: wgpu::TextureFormat) -> bool {
        let features = self.adapter.get_texture_format_features(format);
        let needed = wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING;
        if !features.allowed_usages.contains(needed) {
            return false;
        }

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Format Probe"),
            size: wgpu::Extent3d {
                width: 4,
                height: 4,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage: needed,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Format Probe"),
        });
        encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("Format Probe"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: &view,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        self.queue.submit(std::iter::once(encoder.finish()));
        let complete = pollster::block_on(self.device.pop_error_scope()).is_none();
        texture.destroy();
        complete
    }

    fn supports_linear_filtering(&self, format: wgpu::TextureFormat) -> bool {
        self.adapter
            .get_texture_format_features(format)
            .flags
            .contains(wgpu::TextureFormatFeatureFlags::FILTERABLE)
    }

    fn supports_blending(&self, format: wgpu::TextureFormat) -> bool {
        self.adapter
            .get_texture_format_features(format)
            .flags
            .contains(wgpu::TextureFormatFeatureFlags::BLENDABLE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn half_float_texels_decode() {
        let (bytes_per_pixel, decode) = texel_decoder(wgpu::TextureFormat::Rgba16Float).unwrap();
        assert_eq!(bytes_per_pixel, 8);
        let bytes: Vec<u8> = [1.0f32, -2.0, 0.5, 65504.0]
            .iter()
            .flat_map(|v| f16::from_f32(*v).to_le_bytes())
            .collect();
        assert_eq!(decode(&bytes), [1.0, -2.0, 0.5, 65504.0]);
    }

    #[test]
    fn full_float_and_unorm_texels_decode() {
        let (bytes_per_pixel, decode) = texel_decoder(wgpu::TextureFormat::Rgba32Float).unwrap();
        assert_eq!(bytes_per_pixel, 16);
        let texel = [0.25f32, -1.5, 3.0, 1.0];
        assert_eq!(decode(bytemuck::bytes_of(&texel)), texel);

        let (bytes_per_pixel, decode) = texel_decoder(wgpu::TextureFormat::Rgba8Unorm).unwrap();
        assert_eq!(bytes_per_pixel, 4);
        assert_eq!(decode(&[0, 255, 51, 255]), [0.0, 1.0, 0.2, 1.0]);
    }

    #[test]
    fn single_channel_formats_need_a_staging_copy() {
        for format in [wgpu::TextureFormat::R16Float, wgpu::TextureFormat::Rg16Float] {
            assert!(texel_decoder(format).is_none(), "{format:?}");
        }
    }
}
