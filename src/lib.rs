// Aurora - GPU Fluid Backdrop Renderer
// Copyright (c) 2025 Filipe da Veiga Ventura Alves
// Licensed under MIT License

//! Interactive fluid backdrop: a stable-fluids solver on the GPU with dye
//! splats, bloom, light shafts and a dithered display composite.
//!
//! The host owns the window and event loop. It builds a [`GpuFluid`] backend,
//! wraps it in a [`FluidEngine`] and forwards pointer, resize and frame events.
//! [`CpuFluid`] runs the same solver on the CPU for tests and probes.

pub mod config;
pub mod engine;
pub mod error;
pub mod field;
pub mod gpu;
pub mod pass;
pub mod post;
pub mod program;
pub mod reference;
pub mod scheduler;
pub mod solver;
pub mod splat;
pub mod store;

pub use config::FluidConfig;
pub use engine::{FieldKind, FluidEngine, GpuFluid, Presenter, TickOutcome};
pub use error::{EngineError, ShaderStage};
pub use field::{Extent, FieldSnapshot};
pub use gpu::GpuContext;
pub use reference::CpuFluid;
pub use scheduler::{CancellationToken, FluidBackend, SchedulerState};
pub use splat::{PointerId, SplatCommand};
