// Aurora - GPU Fluid Backdrop Renderer
// Copyright (c) 2025 Filipe da Veiga Ventura Alves
// Licensed under MIT License

//! Program registry: builds vertex/fragment pairs, caches them per keyword
//! permutation, and caches the render pipelines built from them per target.

use bytemuck::{Pod, Zeroable};
use std::collections::HashMap;
use std::num::NonZeroU64;

use crate::error::{EngineError, ShaderStage};

const COMMON_SHADER: &str = include_str!("../shaders/common.wgsl");
const BASE_VERTEX_SHADER: &str = include_str!("../shaders/base.vert.wgsl");
const BLUR_VERTEX_SHADER: &str = include_str!("../shaders/blur.vert.wgsl");

/// Uniform block shared by every program. Each pass fills the fields its
/// shader reads; the layout mirrors `PassParams` in `common.wgsl`.
#[repr(C)]
#[derive(Debug, Copy, Clone, Default, PartialEq, Pod, Zeroable)]
pub struct PassParams {
    pub texel_size: [f32; 2],        // offset 0
    pub point: [f32; 2],             // offset 8
    pub color: [f32; 4],             // offset 16
    pub curve: [f32; 4],             // offset 32 (bloom knee curve xyz, threshold w)
    pub dither_scale: [f32; 2],      // offset 48
    pub dt: f32,                     // offset 56
    pub dissipation: f32,            // offset 60
    pub value: f32,                  // offset 64 (scale factor / intensity)
    pub curl: f32,                   // offset 68
    pub aspect_ratio: f32,           // offset 72
    pub radius: f32,                 // offset 76
    pub weight: f32,                 // offset 80
    pub _pad: u32,                   // offset 84
    pub source_texel_size: [f32; 2], // offset 88, total 96
}

const _: [(); 96] = [(); std::mem::size_of::<PassParams>()];

impl PassParams {
    pub fn with_texel(texel_size: [f32; 2]) -> Self {
        Self {
            texel_size,
            ..Self::default()
        }
    }

    pub fn min_binding_size() -> NonZeroU64 {
        NonZeroU64::new(std::mem::size_of::<Self>() as u64).unwrap_or(NonZeroU64::MIN)
    }
}

/// Compile-time switches injected into a fragment stage as WGSL `const bool`s.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Keywords(u32);

impl Keywords {
    pub const NONE: Keywords = Keywords(0);
    pub const MANUAL_FILTERING: Keywords = Keywords(1 << 0);
    pub const SHADING: Keywords = Keywords(1 << 1);
    pub const BLOOM: Keywords = Keywords(1 << 2);
    pub const SUNRAYS: Keywords = Keywords(1 << 3);

    const NAMES: [(Keywords, &'static str); 4] = [
        (Keywords::MANUAL_FILTERING, "MANUAL_FILTERING"),
        (Keywords::SHADING, "SHADING"),
        (Keywords::BLOOM, "BLOOM"),
        (Keywords::SUNRAYS, "SUNRAYS"),
    ];

    pub fn contains(self, other: Keywords) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn with(self, other: Keywords, enabled: bool) -> Keywords {
        if enabled {
            Keywords(self.0 | other.0)
        } else {
            Keywords(self.0 & !other.0)
        }
    }

    /// `const NAME: bool = ...;` lines for every keyword `declared` by a program.
    fn preamble(self, declared: Keywords) -> String {
        let mut out = String::new();
        for (flag, name) in Self::NAMES {
            if declared.contains(flag) {
                out.push_str(&format!("const {name}: bool = {};\n", self.contains(flag)));
            }
        }
        out
    }
}

impl std::ops::BitOr for Keywords {
    type Output = Keywords;

    fn bitor(self, rhs: Keywords) -> Keywords {
        Keywords(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VertexKind {
    Base,
    Blur,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgramKind {
    Copy,
    Clear,
    Splat,
    Advection,
    Curl,
    Vorticity,
    Divergence,
    Pressure,
    GradientSubtract,
    BloomPrefilter,
    BloomBlur,
    BloomFinal,
    SunraysMask,
    Sunrays,
    Blur,
    Display,
}

struct ProgramSource {
    name: &'static str,
    vertex: VertexKind,
    fragment: &'static str,
    textures: usize,
    keywords: Keywords,
}

impl ProgramKind {
    pub const ALL: [ProgramKind; 16] = [
        ProgramKind::Copy,
        ProgramKind::Clear,
        ProgramKind::Splat,
        ProgramKind::Advection,
        ProgramKind::Curl,
        ProgramKind::Vorticity,
        ProgramKind::Divergence,
        ProgramKind::Pressure,
        ProgramKind::GradientSubtract,
        ProgramKind::BloomPrefilter,
        ProgramKind::BloomBlur,
        ProgramKind::BloomFinal,
        ProgramKind::SunraysMask,
        ProgramKind::Sunrays,
        ProgramKind::Blur,
        ProgramKind::Display,
    ];

    fn source(self) -> ProgramSource {
        use ProgramKind::*;
        let (name, vertex, fragment, textures, keywords) = match self {
            Copy => ("copy", VertexKind::Base, include_str!("../shaders/copy.wgsl"), 1, Keywords::NONE),
            Clear => ("clear", VertexKind::Base, include_str!("../shaders/clear.wgsl"), 1, Keywords::NONE),
            Splat => ("splat", VertexKind::Base, include_str!("../shaders/splat.wgsl"), 1, Keywords::NONE),
            Advection => (
                "advection",
                VertexKind::Base,
                include_str!("../shaders/advection.wgsl"),
                2,
                Keywords::MANUAL_FILTERING,
            ),
            Curl => ("curl", VertexKind::Base, include_str!("../shaders/curl.wgsl"), 1, Keywords::NONE),
            Vorticity => (
                "vorticity",
                VertexKind::Base,
                include_str!("../shaders/vorticity.wgsl"),
                2,
                Keywords::NONE,
            ),
            Divergence => (
                "divergence",
                VertexKind::Base,
                include_str!("../shaders/divergence.wgsl"),
                1,
                Keywords::NONE,
            ),
            Pressure => (
                "pressure",
                VertexKind::Base,
                include_str!("../shaders/pressure.wgsl"),
                2,
                Keywords::NONE,
            ),
            GradientSubtract => (
                "gradient_subtract",
                VertexKind::Base,
                include_str!("../shaders/gradient_subtract.wgsl"),
                2,
                Keywords::NONE,
            ),
            BloomPrefilter => (
                "bloom_prefilter",
                VertexKind::Base,
                include_str!("../shaders/bloom_prefilter.wgsl"),
                1,
                Keywords::NONE,
            ),
            BloomBlur => (
                "bloom_blur",
                VertexKind::Base,
                include_str!("../shaders/bloom_blur.wgsl"),
                1,
                Keywords::NONE,
            ),
            BloomFinal => (
                "bloom_final",
                VertexKind::Base,
                include_str!("../shaders/bloom_final.wgsl"),
                1,
                Keywords::NONE,
            ),
            SunraysMask => (
                "sunrays_mask",
                VertexKind::Base,
                include_str!("../shaders/sunrays_mask.wgsl"),
                1,
                Keywords::NONE,
            ),
            Sunrays => ("sunrays", VertexKind::Base, include_str!("../shaders/sunrays.wgsl"), 1, Keywords::NONE),
            Blur => ("blur", VertexKind::Blur, include_str!("../shaders/blur.wgsl"), 1, Keywords::NONE),
            Display => (
                "display",
                VertexKind::Base,
                include_str!("../shaders/display.wgsl"),
                4,
                Keywords::SHADING | Keywords::BLOOM | Keywords::SUNRAYS,
            ),
        };
        ProgramSource {
            name,
            vertex,
            fragment,
            textures,
            keywords,
        }
    }

    pub fn name(self) -> &'static str {
        self.source().name
    }

    /// Number of sampled textures the fragment stage binds, starting at binding 2.
    pub fn texture_count(self) -> usize {
        self.source().textures
    }

    /// Keywords this program understands; others are masked out of its key.
    pub fn declared_keywords(self) -> Keywords {
        self.source().keywords
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgramKey {
    pub kind: ProgramKind,
    pub keywords: Keywords,
}

impl ProgramKey {
    pub fn new(kind: ProgramKind, keywords: Keywords) -> Self {
        let declared = kind.declared_keywords();
        Self {
            kind,
            keywords: Keywords(keywords.0 & declared.0),
        }
    }

    pub fn plain(kind: ProgramKind) -> Self {
        Self::new(kind, Keywords::NONE)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Blend {
    Replace,
    Additive,
    /// Premultiplied colour over whatever the target was cleared to.
    Over,
}

impl Blend {
    fn state(self) -> Option<wgpu::BlendState> {
        match self {
            Blend::Replace => None,
            Blend::Additive => Some(wgpu::BlendState {
                color: wgpu::BlendComponent {
                    src_factor: wgpu::BlendFactor::One,
                    dst_factor: wgpu::BlendFactor::One,
                    operation: wgpu::BlendOperation::Add,
                },
                alpha: wgpu::BlendComponent {
                    src_factor: wgpu::BlendFactor::One,
                    dst_factor: wgpu::BlendFactor::One,
                    operation: wgpu::BlendOperation::Add,
                },
            }),
            Blend::Over => Some(wgpu::BlendState::PREMULTIPLIED_ALPHA_BLENDING),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineKey {
    pub program: ProgramKey,
    pub format: wgpu::TextureFormat,
    pub blend: Blend,
    /// Whether the layout declares a filtering sampler and filterable textures.
    pub filtering: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct LayoutKey {
    textures: usize,
    filtering: bool,
}

/// A linked vertex/fragment pair.
pub struct Program {
    pub label: String,
    vertex: wgpu::ShaderModule,
    fragment: wgpu::ShaderModule,
}

struct Layout {
    bind_group: wgpu::BindGroupLayout,
    pipeline: wgpu::PipelineLayout,
}

#[derive(Default)]
pub struct ProgramRegistry {
    programs: HashMap<ProgramKey, Program>,
    layouts: HashMap<LayoutKey, Layout>,
    pipelines: HashMap<PipelineKey, wgpu::RenderPipeline>,
}

impl ProgramRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn program_count(&self) -> usize {
        self.programs.len()
    }

    /// Builds (or returns the cached) program for `key`.
    pub fn compile(&mut self, device: &wgpu::Device, key: ProgramKey) -> Result<&Program, EngineError> {
        if !self.programs.contains_key(&key) {
            let source = key.kind.source();
            let label = if key.keywords == Keywords::NONE {
                source.name.to_string()
            } else {
                format!("{}#{:x}", source.name, key.keywords.0)
            };

            let vertex_body = match source.vertex {
                VertexKind::Base => BASE_VERTEX_SHADER,
                VertexKind::Blur => BLUR_VERTEX_SHADER,
            };
            let vertex = create_module(
                device,
                &label,
                ShaderStage::Vertex,
                format!("{COMMON_SHADER}\n{vertex_body}"),
            )?;
            let fragment = create_module(
                device,
                &label,
                ShaderStage::Fragment,
                format!(
                    "{}{COMMON_SHADER}\n{}",
                    key.keywords.preamble(source.keywords),
                    source.fragment
                ),
            )?;
            log::debug!("Compiled program {label}");
            self.programs.insert(
                key,
                Program {
                    label,
                    vertex,
                    fragment,
                },
            );
        }
        self.programs
            .get(&key)
            .ok_or_else(|| EngineError::ShaderCompile {
                program: key.kind.name().to_string(),
                stage: ShaderStage::Link,
                diagnostic: "program missing from cache".into(),
            })
    }

    pub fn pipeline_count(&self) -> usize {
        self.pipelines.len()
    }

    /// Builds every pipeline in `keys` up front so a broken program or a bad
    /// layout fails at startup instead of mid-frame.
    pub fn warm_up(
        &mut self,
        device: &wgpu::Device,
        keys: impl IntoIterator<Item = PipelineKey>,
    ) -> Result<(), EngineError> {
        for key in keys {
            self.prepare(device, key)?;
        }
        Ok(())
    }

    /// Ensures the program, its layout and the pipeline for `key` exist.
    pub fn prepare(&mut self, device: &wgpu::Device, key: PipelineKey) -> Result<(), EngineError> {
        if self.pipelines.contains_key(&key) {
            return Ok(());
        }
        self.compile(device, key.program)?;

        let layout_key = LayoutKey {
            textures: key.program.kind.texture_count(),
            filtering: key.filtering,
        };
        self.layouts
            .entry(layout_key)
            .or_insert_with(|| create_layout(device, layout_key));

        let (Some(program), Some(layout)) = (self.programs.get(&key.program), self.layouts.get(&layout_key))
        else {
            return Err(EngineError::ShaderCompile {
                program: key.program.kind.name().to_string(),
                stage: ShaderStage::Link,
                diagnostic: "program or layout missing from cache".into(),
            });
        };

        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some(&program.label),
            layout: Some(&layout.pipeline),
            vertex: wgpu::VertexState {
                module: &program.vertex,
                entry_point: "vs_main",
                buffers: &[],
                compilation_options: Default::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: &program.fragment,
                entry_point: "fs_main",
                targets: &[Some(wgpu::ColorTargetState {
                    format: key.format,
                    blend: key.blend.state(),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: Default::default(),
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                strip_index_format: None,
                front_face: wgpu::FrontFace::Ccw,
                cull_mode: None,
                polygon_mode: wgpu::PolygonMode::Fill,
                unclipped_depth: false,
                conservative: false,
            },
            depth_stencil: None,
            multisample: wgpu::MultisampleState {
                count: 1,
                mask: !0,
                alpha_to_coverage_enabled: false,
            },
            multiview: None,
            cache: None,
        });
        if let Some(err) = pollster::block_on(device.pop_error_scope()) {
            return Err(EngineError::ShaderCompile {
                program: program.label.clone(),
                stage: ShaderStage::Link,
                diagnostic: err.to_string(),
            });
        }

        self.pipelines.insert(key, pipeline);
        Ok(())
    }

    pub fn pipeline(&self, key: &PipelineKey) -> Option<&wgpu::RenderPipeline> {
        self.pipelines.get(key)
    }

    pub fn layout(&self, kind: ProgramKind, filtering: bool) -> Option<&wgpu::BindGroupLayout> {
        self.layouts
            .get(&LayoutKey {
                textures: kind.texture_count(),
                filtering,
            })
            .map(|layout| &layout.bind_group)
    }
}

fn create_module(
    device: &wgpu::Device,
    label: &str,
    stage: ShaderStage,
    source: String,
) -> Result<wgpu::ShaderModule, EngineError> {
    device.push_error_scope(wgpu::ErrorFilter::Validation);
    let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source: wgpu::ShaderSource::Wgsl(source.into()),
    });
    match pollster::block_on(device.pop_error_scope()) {
        Some(err) => Err(EngineError::ShaderCompile {
            program: label.to_string(),
            stage,
            diagnostic: err.to_string(),
        }),
        None => Ok(module),
    }
}

/// Binding 0: uniform block at a dynamic offset. Binding 1: sampler.
/// Bindings 2..: the program's sampled textures.
fn create_layout(device: &wgpu::Device, key: LayoutKey) -> Layout {
    let mut entries = vec![
        wgpu::BindGroupLayoutEntry {
            binding: 0,
            visibility: wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: true,
                min_binding_size: Some(PassParams::min_binding_size()),
            },
            count: None,
        },
        wgpu::BindGroupLayoutEntry {
            binding: 1,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Sampler(if key.filtering {
                wgpu::SamplerBindingType::Filtering
            } else {
                wgpu::SamplerBindingType::NonFiltering
            }),
            count: None,
        },
    ];
    for i in 0..key.textures {
        entries.push(wgpu::BindGroupLayoutEntry {
            binding: 2 + i as u32,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Texture {
                sample_type: wgpu::TextureSampleType::Float {
                    filterable: key.filtering,
                },
                view_dimension: wgpu::TextureViewDimension::D2,
                multisampled: false,
            },
            count: None,
        });
    }

    let label = format!("Pass Layout ({} textures)", key.textures);
    let bind_group = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some(&label),
        entries: &entries,
    });
    let pipeline = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some(&label),
        bind_group_layouts: &[&bind_group],
        push_constant_ranges: &[],
    });
    Layout {
        bind_group,
        pipeline,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_mask_undeclared_keywords() {
        let key = ProgramKey::new(ProgramKind::Curl, Keywords::SHADING | Keywords::BLOOM);
        assert_eq!(key.keywords, Keywords::NONE);

        let key = ProgramKey::new(
            ProgramKind::Display,
            Keywords::SHADING | Keywords::MANUAL_FILTERING,
        );
        assert!(key.keywords.contains(Keywords::SHADING));
        assert!(!key.keywords.contains(Keywords::MANUAL_FILTERING));
    }

    #[test]
    fn preamble_defines_every_declared_keyword() {
        let declared = ProgramKind::Display.declared_keywords();
        let text = Keywords::SHADING.preamble(declared);
        assert!(text.contains("const SHADING: bool = true;"));
        assert!(text.contains("const BLOOM: bool = false;"));
        assert!(text.contains("const SUNRAYS: bool = false;"));
        assert!(!text.contains("MANUAL_FILTERING"));
    }

    #[test]
    fn keyword_toggle() {
        let keywords = Keywords::NONE.with(Keywords::BLOOM, true).with(Keywords::SUNRAYS, true);
        assert!(keywords.contains(Keywords::BLOOM | Keywords::SUNRAYS));
        assert!(!keywords.with(Keywords::BLOOM, false).contains(Keywords::BLOOM));
    }

    #[test]
    fn every_program_reads_at_least_one_texture() {
        for kind in ProgramKind::ALL {
            assert!(kind.texture_count() >= 1, "{}", kind.name());
        }
        assert_eq!(ProgramKind::Display.texture_count(), 4);
    }
}
