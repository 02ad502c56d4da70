// Aurora - GPU Fluid Backdrop Renderer
// Copyright (c) 2025 Filipe da Veiga Ventura Alves
// Licensed under MIT License

//! The engine context and its wgpu backend.
//!
//! [`FluidEngine`] owns everything a session needs (configuration, input
//! state, scheduler, RNG and the backend) and is driven one [`tick`] at a
//! time by the host's frame callback. [`GpuFluid`] is the backend that
//! records solver, splat and post passes into a batch and submits them once
//! per frame.
//!
//! [`tick`]: FluidEngine::tick

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::FluidConfig;
use crate::error::EngineError;
use crate::field::{readback_format, Extent, FieldFormat, FieldSnapshot, TextureField};
use crate::gpu::GpuContext;
use crate::pass::{Pass, PassBatch, UniformArena};
use crate::post;
use crate::program::{ProgramKind, ProgramRegistry};
use crate::scheduler::{CancellationToken, FluidBackend, FrameScheduler, FrameState, SchedulerState};
use crate::solver;
use crate::splat::{self, PointerId, SplatCommand};
use crate::store::FieldStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Work was issued; request another frame.
    Continue,
    /// The engine is idle or stopped; stop requesting frames.
    Halted,
}

pub struct FluidEngine<B: FluidBackend> {
    config: FluidConfig,
    backend: Option<B>,
    frame: FrameState,
    scheduler: FrameScheduler,
    rng: StdRng,
}

impl<B: FluidBackend> FluidEngine<B> {
    /// Validates `config` and wraps `backend`. Nothing runs until [`start`].
    ///
    /// [`start`]: FluidEngine::start
    pub fn new(config: FluidConfig, backend: B, viewport: Extent) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(Self {
            config,
            backend: Some(backend),
            frame: FrameState::new(viewport),
            scheduler: FrameScheduler::new(),
            rng: StdRng::from_entropy(),
        })
    }

    /// Fixes the RNG so bursts and pointer colours are reproducible.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn config(&self) -> &FluidConfig {
        &self.config
    }

    pub fn state(&self) -> SchedulerState {
        self.scheduler.state()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.scheduler.token()
    }

    pub fn backend(&self) -> Option<&B> {
        self.backend.as_ref()
    }

    pub fn backend_mut(&mut self) -> Option<&mut B> {
        self.backend.as_mut()
    }

    pub fn viewport(&self) -> Extent {
        self.frame.viewport()
    }

    /// Starts ticking and seeds the scene with the configured initial burst.
    pub fn start(&mut self) {
        if !self.scheduler.start() {
            return;
        }
        log::info!("Fluid engine started");
        if self.config.initial_splats > 0 {
            self.frame.queue_burst(self.config.initial_splats);
        }
        if self.config.paused {
            self.scheduler.pause();
        }
    }

    /// Cancels further ticks and releases the backend with its GPU resources.
    pub fn stop(&mut self) {
        if self.scheduler.state() == SchedulerState::Stopped && self.backend.is_none() {
            return;
        }
        self.scheduler.stop();
        self.backend = None;
        log::info!("Fluid engine stopped");
    }

    pub fn pause(&mut self) {
        self.scheduler.pause();
    }

    pub fn resume(&mut self) {
        self.scheduler.resume();
    }

    pub fn toggle_pause(&mut self) {
        match self.scheduler.state() {
            SchedulerState::Running => self.scheduler.pause(),
            SchedulerState::Paused => self.scheduler.resume(),
            _ => {}
        }
    }

    pub fn pointer_down(&mut self, id: PointerId, x: f32, y: f32) {
        self.frame.pointers.press(id, x, y, &mut self.rng);
    }

    pub fn pointer_move(&mut self, id: PointerId, x: f32, y: f32) {
        let sensitivity = self.config.pointer_sensitivity;
        self.frame.pointers.motion(id, x, y, sensitivity, &mut self.rng);
    }

    pub fn pointer_up(&mut self, id: PointerId) {
        self.frame.pointers.release(id);
    }

    /// Queues a viewport change for the start of the next tick. Zero-sized
    /// viewports (minimized windows) are ignored.
    pub fn resize(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            return;
        }
        self.frame.request_resize(Extent::new(width, height));
    }

    pub fn request_burst(&mut self, count: u32) {
        self.frame.queue_burst(count);
    }

    /// Queues a single splat for the next tick.
    pub fn inject(&mut self, command: SplatCommand) {
        self.frame.enqueue(command);
    }

    /// Runs one frame: pending resize, queued splats, one solver step unless
    /// paused, then post-processing and presentation. A fatal backend error
    /// stops the engine before it is returned.
    pub fn tick(&mut self) -> Result<TickOutcome, EngineError> {
        if !self.scheduler.should_tick() {
            return Ok(TickOutcome::Halted);
        }
        let Some(backend) = self.backend.as_mut() else {
            return Ok(TickOutcome::Halted);
        };

        let paused = self.scheduler.state() == SchedulerState::Paused;
        let plan = self.frame.advance(&self.config, paused, &mut self.rng);
        match plan.execute(backend, self.config.timestep) {
            Ok(()) => Ok(TickOutcome::Continue),
            Err(err) if !err.is_fatal() => {
                log::warn!("{err}");
                Ok(TickOutcome::Continue)
            }
            Err(err) => {
                log::error!("Fluid engine halted: {err}");
                self.stop();
                Err(err)
            }
        }
    }

    /// Ticks until the engine halts, the token is cancelled or `max_ticks`
    /// frames have run. Returns the number of ticks that did work.
    pub fn run(&mut self, max_ticks: Option<u64>) -> Result<u64, EngineError> {
        let mut ticks = 0;
        while max_ticks.map_or(true, |max| ticks < max) {
            match self.tick()? {
                TickOutcome::Continue => ticks += 1,
                TickOutcome::Halted => break,
            }
        }
        Ok(ticks)
    }
}

/// Fields that can be read back for inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Velocity,
    Dye,
    Pressure,
    Divergence,
    Curl,
    Bloom,
    Sunrays,
}

impl FieldKind {
    pub const ALL: [FieldKind; 7] = [
        FieldKind::Velocity,
        FieldKind::Dye,
        FieldKind::Pressure,
        FieldKind::Divergence,
        FieldKind::Curl,
        FieldKind::Bloom,
        FieldKind::Sunrays,
    ];
}

/// Where the display pass lands.
pub enum Presenter {
    Surface {
        surface: wgpu::Surface<'static>,
        config: wgpu::SurfaceConfiguration,
    },
    Offscreen(TextureField),
}

const OFFSCREEN_FORMAT: FieldFormat = FieldFormat {
    format: wgpu::TextureFormat::Rgba8Unorm,
    filter: wgpu::FilterMode::Linear,
};

/// The wgpu backend: owns the device, programs, fields and presenter.
pub struct GpuFluid {
    ctx: GpuContext,
    config: FluidConfig,
    registry: ProgramRegistry,
    arena: UniformArena,
    store: FieldStore,
    presenter: Presenter,
    batch: PassBatch,
    /// Staging format for `read_field`; `None` when no float format renders.
    readback: Option<FieldFormat>,
}

impl GpuFluid {
    /// Backend presenting into a window surface.
    pub fn with_surface(
        ctx: GpuContext,
        surface: wgpu::Surface<'static>,
        config: &FluidConfig,
        viewport: Extent,
    ) -> Result<Self, EngineError> {
        let caps = surface.get_capabilities(&ctx.adapter);
        // The display pass applies its own gamma, so write to a linear format.
        let format = caps
            .formats
            .iter()
            .copied()
            .find(|format| !format.is_srgb())
            .or_else(|| caps.formats.first().copied())
            .ok_or_else(|| EngineError::HardwareUnsupported("surface reports no formats".into()))?;
        let alpha_mode = if config.transparent
            && caps.alpha_modes.contains(&wgpu::CompositeAlphaMode::PreMultiplied)
        {
            wgpu::CompositeAlphaMode::PreMultiplied
        } else {
            caps.alpha_modes
                .first()
                .copied()
                .unwrap_or(wgpu::CompositeAlphaMode::Auto)
        };

        let surface_config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format,
            width: viewport.width.max(1),
            height: viewport.height.max(1),
            present_mode: wgpu::PresentMode::Fifo,
            alpha_mode,
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        surface.configure(&ctx.device, &surface_config);
        log::info!("Surface configured as {format:?} ({alpha_mode:?})");

        Self::build(
            ctx,
            config,
            viewport,
            Presenter::Surface {
                surface,
                config: surface_config,
            },
        )
    }

    /// Backend rendering into an `Rgba8Unorm` texture, for probes and tests.
    pub fn offscreen(ctx: GpuContext, config: &FluidConfig, viewport: Extent) -> Result<Self, EngineError> {
        let target = TextureField::allocate_or_halve(&ctx, "Offscreen Target", viewport, OFFSCREEN_FORMAT)?;
        Self::build(ctx, config, viewport, Presenter::Offscreen(target))
    }

    fn build(
        ctx: GpuContext,
        config: &FluidConfig,
        viewport: Extent,
        presenter: Presenter,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let store = FieldStore::new(&ctx, config, viewport)?;
        let arena = UniformArena::new(&ctx.device);
        let readback = match readback_format(&ctx) {
            Ok(format) => Some(format),
            Err(err) => {
                log::warn!("Field read-back unavailable: {err}");
                None
            }
        };
        let mut fluid = Self {
            ctx,
            config: config.clone(),
            registry: ProgramRegistry::new(),
            arena,
            store,
            presenter,
            batch: PassBatch::new(),
            readback,
        };
        fluid.warm_up()?;
        Ok(fluid)
    }

    /// Records a throwaway frame (splat, solver step, post chain, resize
    /// copies and read-back copies) and builds every pipeline it needs, so a
    /// broken program or layout fails here rather than mid-frame. The frame is
    /// never submitted; its buffer swaps only exchange at-rest fields.
    fn warm_up(&mut self) -> Result<(), EngineError> {
        let (view, format) = match &self.presenter {
            Presenter::Offscreen(target) => (target.view.clone(), target.format.format),
            Presenter::Surface { config, .. } => (self.store.placeholder.view.clone(), config.format),
        };

        let mut rehearsal = PassBatch::new();
        let blank = SplatCommand {
            point: [0.5, 0.5],
            force: [0.0, 0.0],
            color: [0.0, 0.0, 0.0],
            radius: self.config.splat_radius,
        };
        splat::record(&mut rehearsal, &mut self.store, &blank, 1.0);
        solver::step(&mut rehearsal, &mut self.store, &self.config, self.config.timestep);
        post::render(&mut rehearsal, &self.store, &self.config, view, format);

        for field in [self.store.velocity.read(), self.store.dye.read()] {
            rehearsal.draw(Pass::new("Resize Copy", ProgramKind::Copy, field).input(field));
        }
        if let Some(readback) = self.readback {
            for kind in FieldKind::ALL {
                if let Some(source) = readable(&self.store, kind) {
                    let staging = self.store.placeholder.view.clone();
                    rehearsal.draw(
                        Pass::to_view("Readback Copy", ProgramKind::Copy, staging, readback.format)
                            .input(source),
                    );
                }
            }
        }

        self.registry.warm_up(&self.ctx.device, rehearsal.pipeline_keys())?;
        log::info!(
            "Prepared {} pipelines from {} programs",
            self.registry.pipeline_count(),
            self.registry.program_count()
        );
        Ok(())
    }

    pub fn context(&self) -> &GpuContext {
        &self.ctx
    }

    pub fn store(&self) -> &FieldStore {
        &self.store
    }

    pub fn viewport(&self) -> Extent {
        self.store.viewport
    }

    pub fn registry(&self) -> &ProgramRegistry {
        &self.registry
    }

    pub fn presenter(&self) -> &Presenter {
        &self.presenter
    }

    fn submit(&mut self) -> Result<(), EngineError> {
        self.batch
            .submit(&self.ctx, &mut self.registry, &mut self.arena, &self.store.samplers)
    }

    fn reconfigure(&self) {
        if let Presenter::Surface { surface, config } = &self.presenter {
            surface.configure(&self.ctx.device, config);
        }
    }

    /// Copies a field into host memory through a float staging texture.
    /// Returns `None` for a disabled feature.
    pub fn read_field(&mut self, kind: FieldKind) -> Result<Option<FieldSnapshot>, EngineError> {
        self.submit()?;
        let readback = self.readback.ok_or(EngineError::FormatUnsupported {
            requested: wgpu::TextureFormat::Rgba32Float,
        })?;
        let Some(source) = readable(&self.store, kind) else {
            return Ok(None);
        };

        let staging = TextureField::allocate(&self.ctx, "Readback Staging", source.extent, readback)?;
        self.batch
            .draw(Pass::new("Readback Copy", ProgramKind::Copy, &staging).input(source));
        self.submit()?;
        self.ctx.read_texture(&staging).map(Some)
    }

    /// Reads the last presented offscreen frame as 8-bit RGBA, row 0 at the
    /// top. `None` for surface presenters.
    pub fn read_output(&mut self) -> Result<Option<Vec<[u8; 4]>>, EngineError> {
        self.submit()?;
        let Presenter::Offscreen(target) = &self.presenter else {
            return Ok(None);
        };
        let snapshot = self.ctx.read_texture(target)?;
        Ok(Some(
            snapshot
                .texels
                .iter()
                .map(|texel| texel.map(|channel| (channel.clamp(0.0, 1.0) * 255.0).round() as u8))
                .collect(),
        ))
    }
}

/// The field behind `kind`, or `None` when its feature is disabled.
fn readable(store: &FieldStore, kind: FieldKind) -> Option<&TextureField> {
    match kind {
        FieldKind::Velocity => Some(store.velocity.read()),
        FieldKind::Dye => Some(store.dye.read()),
        FieldKind::Pressure => Some(store.pressure.read()),
        FieldKind::Divergence => Some(&store.divergence),
        FieldKind::Curl => Some(&store.curl),
        FieldKind::Bloom => store.bloom.as_ref().map(|bloom| &bloom.target),
        FieldKind::Sunrays => store.sunrays.as_ref().map(|sunrays| &sunrays.target),
    }
}

impl FluidBackend for GpuFluid {
    fn resize(&mut self, viewport: Extent) -> Result<(), EngineError> {
        match &mut self.presenter {
            Presenter::Surface { surface, config } => {
                config.width = viewport.width.max(1);
                config.height = viewport.height.max(1);
                surface.configure(&self.ctx.device, config);
            }
            Presenter::Offscreen(target) => {
                if target.extent != viewport {
                    *target =
                        TextureField::allocate_or_halve(&self.ctx, "Offscreen Target", viewport, OFFSCREEN_FORMAT)?;
                }
            }
        }
        self.store.resize(&self.ctx, viewport, &mut self.batch)?;
        Ok(())
    }

    fn splat(&mut self, command: &SplatCommand) {
        let aspect = self.store.viewport.aspect();
        splat::record(&mut self.batch, &mut self.store, command, aspect);
    }

    fn step(&mut self, dt: f32) {
        solver::step(&mut self.batch, &mut self.store, &self.config, dt);
    }

    fn present(&mut self) -> Result<(), EngineError> {
        let (surface, format) = match &self.presenter {
            Presenter::Offscreen(target) => {
                let view = target.view.clone();
                let format = target.format.format;
                post::render(&mut self.batch, &self.store, &self.config, view, format);
                return self.submit();
            }
            Presenter::Surface { surface, config } => (surface, config.format),
        };

        let frame = match surface.get_current_texture() {
            Ok(frame) => frame,
            Err(err @ wgpu::SurfaceError::OutOfMemory) => return Err(err.into()),
            Err(err) => {
                // Simulation work still lands; only this frame's image is lost.
                log::warn!("Skipping frame: {err}");
                if matches!(err, wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated) {
                    self.reconfigure();
                }
                return self.submit();
            }
        };

        let view = Arc::new(frame.texture.create_view(&wgpu::TextureViewDescriptor::default()));
        post::render(&mut self.batch, &self.store, &self.config, view, format);
        self.submit()?;
        frame.present();
        Ok(())
    }
}
