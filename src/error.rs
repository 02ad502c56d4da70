// Aurora - GPU Fluid Backdrop Renderer
// Copyright (c) 2025 Filipe da Veiga Ventura Alves
// Licensed under MIT License

use std::fmt;

use thiserror::Error;

/// Which part of a program build produced a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    /// Pipeline creation, where the two stages are linked against a layout.
    Link,
}

impl fmt::Display for ShaderStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ShaderStage::Vertex => "vertex",
            ShaderStage::Fragment => "fragment",
            ShaderStage::Link => "link",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no usable graphics context: {0}")]
    HardwareUnsupported(String),

    #[error("no render-target support for {requested:?} or any of its fallbacks")]
    FormatUnsupported { requested: wgpu::TextureFormat },

    #[error("program `{program}` failed at the {stage} stage: {diagnostic}")]
    ShaderCompile {
        program: String,
        stage: ShaderStage,
        diagnostic: String,
    },

    #[error("could not allocate {label} at {width}x{height}: {reason}")]
    AllocationFailure {
        label: String,
        width: u32,
        height: u32,
        reason: String,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("presentation failed: {0}")]
    Surface(#[from] wgpu::SurfaceError),
}

impl EngineError {
    /// Fatal errors stop the engine; the rest degrade a feature and carry on.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, EngineError::FormatUnsupported { .. })
    }
}
