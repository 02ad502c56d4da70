// Aurora - GPU Fluid Backdrop Renderer
// Copyright (c) 2025 Filipe da Veiga Ventura Alves
// Licensed under MIT License

//! Recording and submission of full-screen passes.
//!
//! Passes are recorded into a [`PassBatch`] in the order they must run and
//! submitted together in one command encoder. Each recorded pass holds its own
//! handles to the views it reads and writes, so swapping a double buffer after
//! recording a pass never changes what that pass touches.

use std::sync::Arc;

use crate::error::{EngineError, ShaderStage};
use crate::field::TextureField;
use crate::gpu::GpuContext;
use crate::program::{Blend, Keywords, PassParams, PipelineKey, ProgramKey, ProgramKind, ProgramRegistry};

const INITIAL_UNIFORM_SLOTS: u64 = 64;

/// Clamp-to-edge samplers shared by every pass.
pub struct Samplers {
    pub linear: wgpu::Sampler,
    pub nearest: wgpu::Sampler,
}

impl Samplers {
    pub fn new(device: &wgpu::Device) -> Self {
        let linear = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Field Sampler (linear)"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });
        let nearest = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Field Sampler (nearest)"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Nearest,
            min_filter: wgpu::FilterMode::Nearest,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });
        Self { linear, nearest }
    }
}

/// One growable uniform buffer holding every pass's `PassParams` for a
/// batch, addressed with dynamic offsets.
pub struct UniformArena {
    buffer: wgpu::Buffer,
    capacity: u64,
    stride: u64,
    staging: Vec<u8>,
}

impl UniformArena {
    pub fn new(device: &wgpu::Device) -> Self {
        let alignment = device.limits().min_uniform_buffer_offset_alignment as u64;
        let size = std::mem::size_of::<PassParams>() as u64;
        let stride = size.div_ceil(alignment) * alignment;
        Self {
            buffer: Self::create_buffer(device, stride * INITIAL_UNIFORM_SLOTS),
            capacity: INITIAL_UNIFORM_SLOTS,
            stride,
            staging: Vec::new(),
        }
    }

    fn create_buffer(device: &wgpu::Device, size: u64) -> wgpu::Buffer {
        device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Pass Uniforms"),
            size,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        })
    }

    pub fn clear(&mut self) {
        self.staging.clear();
    }

    /// Appends `params` and returns its dynamic offset.
    pub fn push(&mut self, params: &PassParams) -> u32 {
        let offset = self.staging.len();
        self.staging.extend_from_slice(bytemuck::bytes_of(params));
        self.staging.resize(offset + self.stride as usize, 0);
        offset as u32
    }

    pub fn len(&self) -> u64 {
        self.staging.len() as u64 / self.stride
    }

    pub fn is_empty(&self) -> bool {
        self.staging.is_empty()
    }

    /// Writes the staged blocks, growing the buffer first if they don't fit.
    pub fn upload(&mut self, ctx: &GpuContext) {
        let needed = self.len();
        if needed > self.capacity {
            self.capacity = needed.next_power_of_two();
            self.buffer = Self::create_buffer(&ctx.device, self.capacity * self.stride);
            log::debug!("Uniform arena grown to {} slots", self.capacity);
        }
        if !self.staging.is_empty() {
            ctx.queue.write_buffer(&self.buffer, 0, &self.staging);
        }
    }

    pub fn buffer(&self) -> &wgpu::Buffer {
        &self.buffer
    }
}

#[derive(Clone)]
struct PassInput {
    view: Arc<wgpu::TextureView>,
    filter: wgpu::FilterMode,
}

/// A single full-screen draw: one program, its inputs and one target.
#[derive(Clone)]
pub struct Pass {
    pub label: &'static str,
    program: ProgramKey,
    params: PassParams,
    inputs: Vec<PassInput>,
    target: Arc<wgpu::TextureView>,
    format: wgpu::TextureFormat,
    blend: Blend,
    clear: Option<wgpu::Color>,
}

impl Pass {
    /// A pass rendering into `target`, with `texel_size` preset to the target's.
    pub fn new(label: &'static str, kind: ProgramKind, target: &TextureField) -> Self {
        Self::to_view(label, kind, target.view.clone(), target.format.format)
            .params(PassParams::with_texel(target.texel_size))
    }

    /// A pass rendering into an arbitrary view, such as a surface frame.
    pub fn to_view(
        label: &'static str,
        kind: ProgramKind,
        view: Arc<wgpu::TextureView>,
        format: wgpu::TextureFormat,
    ) -> Self {
        Self {
            label,
            program: ProgramKey::plain(kind),
            params: PassParams::default(),
            inputs: Vec::new(),
            target: view,
            format,
            blend: Blend::Replace,
            clear: None,
        }
    }

    pub fn input(mut self, field: &TextureField) -> Self {
        self.inputs.push(PassInput {
            view: field.view.clone(),
            filter: field.filter(),
        });
        self
    }

    pub fn params(mut self, params: PassParams) -> Self {
        self.params = params;
        self
    }

    pub fn keywords(mut self, keywords: Keywords) -> Self {
        self.program = ProgramKey::new(self.program.kind, keywords);
        self
    }

    pub fn blend(mut self, blend: Blend) -> Self {
        self.blend = blend;
        self
    }

    /// Clears the target to `color` before drawing instead of loading it.
    pub fn clear_to(mut self, color: wgpu::Color) -> Self {
        self.clear = Some(color);
        self
    }

    pub fn kind(&self) -> ProgramKind {
        self.program.kind
    }

    pub fn program(&self) -> ProgramKey {
        self.program
    }

    pub fn reads(&self, view: &Arc<wgpu::TextureView>) -> bool {
        self.inputs.iter().any(|input| Arc::ptr_eq(&input.view, view))
    }

    pub fn writes(&self, view: &Arc<wgpu::TextureView>) -> bool {
        Arc::ptr_eq(&self.target, view)
    }

    /// Linear sampling is only declared when every input supports it.
    fn filtering(&self) -> bool {
        self.inputs
            .iter()
            .all(|input| input.filter == wgpu::FilterMode::Linear)
    }

    pub fn pipeline_key(&self) -> PipelineKey {
        PipelineKey {
            program: self.program,
            format: self.format,
            blend: self.blend,
            filtering: self.filtering(),
        }
    }
}

/// Ordered list of passes waiting for submission.
#[derive(Default)]
pub struct PassBatch {
    passes: Vec<Pass>,
}

impl PassBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn draw(&mut self, pass: Pass) {
        self.passes.push(pass);
    }

    pub fn passes(&self) -> &[Pass] {
        &self.passes
    }

    pub fn labels(&self) -> Vec<&'static str> {
        self.passes.iter().map(|pass| pass.label).collect()
    }

    /// Distinct pipelines the recorded passes need, in first-use order.
    pub fn pipeline_keys(&self) -> Vec<PipelineKey> {
        let mut keys: Vec<PipelineKey> = Vec::new();
        for key in self.passes.iter().map(Pass::pipeline_key) {
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        keys
    }

    pub fn len(&self) -> usize {
        self.passes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }

    pub fn clear(&mut self) {
        self.passes.clear();
    }

    /// Builds any missing pipelines, uploads uniforms and encodes every
    /// recorded pass into a single submission. The batch is empty afterwards.
    pub fn submit(
        &mut self,
        ctx: &GpuContext,
        registry: &mut ProgramRegistry,
        arena: &mut UniformArena,
        samplers: &Samplers,
    ) -> Result<(), EngineError> {
        if self.passes.is_empty() {
            return Ok(());
        }
        let passes = std::mem::take(&mut self.passes);

        arena.clear();
        let mut offsets = Vec::with_capacity(passes.len());
        for pass in &passes {
            registry.prepare(&ctx.device, pass.pipeline_key())?;
            offsets.push(arena.push(&pass.params));
        }
        arena.upload(ctx);

        let mut bind_groups = Vec::with_capacity(passes.len());
        for pass in &passes {
            let filtering = pass.filtering();
            let layout = registry
                .layout(pass.kind(), filtering)
                .ok_or_else(|| missing_pipeline(pass))?;
            let sampler = if filtering {
                &samplers.linear
            } else {
                &samplers.nearest
            };

            let mut entries = vec![
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                        buffer: arena.buffer(),
                        offset: 0,
                        size: Some(PassParams::min_binding_size()),
                    }),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(sampler),
                },
            ];
            for (i, input) in pass.inputs.iter().enumerate() {
                entries.push(wgpu::BindGroupEntry {
                    binding: 2 + i as u32,
                    resource: wgpu::BindingResource::TextureView(&input.view),
                });
            }
            bind_groups.push(ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(pass.label),
                layout,
                entries: &entries,
            }));
        }

        let mut encoder = ctx.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Fluid Frame"),
        });
        for ((pass, bind_group), offset) in passes.iter().zip(&bind_groups).zip(&offsets) {
            let pipeline = registry
                .pipeline(&pass.pipeline_key())
                .ok_or_else(|| missing_pipeline(pass))?;
            let load = match pass.clear {
                Some(color) => wgpu::LoadOp::Clear(color),
                None => wgpu::LoadOp::Load,
            };
            let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some(pass.label),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &pass.target,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load,
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            render_pass.set_pipeline(pipeline);
            render_pass.set_bind_group(0, bind_group, &[*offset]);
            render_pass.draw(0..3, 0..1);
        }
        ctx.queue.submit(std::iter::once(encoder.finish()));
        Ok(())
    }
}

fn missing_pipeline(pass: &Pass) -> EngineError {
    EngineError::ShaderCompile {
        program: pass.kind().name().to_string(),
        stage: ShaderStage::Link,
        diagnostic: format!("no pipeline prepared for pass `{}`", pass.label),
    }
}
