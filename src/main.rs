// Aurora - GPU Fluid Backdrop Renderer
// Copyright (c) 2025 Filipe da Veiga Ventura Alves
// Licensed under MIT License

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use rand::Rng;
use winit::{
    event::{ElementState, Event, KeyEvent, MouseButton, Touch, TouchPhase, WindowEvent},
    event_loop::EventLoop,
    keyboard::{KeyCode, PhysicalKey},
    window::Window,
};

use aurora_fluid::{Extent, FluidConfig, FluidEngine, GpuContext, GpuFluid, PointerId, TickOutcome};

const WINDOW_TITLE: &str = "Aurora";

/// Rolling frame-time average shown in the window title.
struct FrameCounter {
    frames: u32,
    elapsed: f32,
    last_frame: Instant,
    last_update: Instant,
}

impl FrameCounter {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            frames: 0,
            elapsed: 0.0,
            last_frame: now,
            last_update: now,
        }
    }

    fn frame(&mut self, window: &Window, paused: bool) {
        let now = Instant::now();
        self.elapsed += (now - self.last_frame).as_secs_f32();
        self.last_frame = now;
        self.frames += 1;

        if (now - self.last_update).as_secs_f32() >= 1.0 {
            let avg_ms = self.elapsed / self.frames as f32 * 1000.0;
            let suffix = if paused { " [paused]" } else { "" };
            window.set_title(&format!(
                "{WINDOW_TITLE} - {:.1} fps ({avg_ms:.2} ms){suffix}",
                1000.0 / avg_ms
            ));
            self.frames = 0;
            self.elapsed = 0.0;
            self.last_update = now;
        }
    }
}

fn load_config() -> anyhow::Result<FluidConfig> {
    if let Some(path) = std::env::args().nth(1).map(PathBuf::from) {
        return FluidConfig::load_from_disk(&path)
            .with_context(|| format!("failed to load settings from {}", path.display()));
    }

    let path = FluidConfig::default_path();
    if !path.exists() {
        return Ok(FluidConfig::default());
    }
    match FluidConfig::load_from_disk(&path) {
        Ok(config) => {
            log::info!("Loaded settings from {}", path.display());
            Ok(config)
        }
        Err(err) => {
            log::warn!("Ignoring {}: {err:#}", path.display());
            Ok(FluidConfig::default())
        }
    }
}

fn main() -> anyhow::Result<()> {
    use env_logger::Env;
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let config = load_config()?;

    let event_loop = EventLoop::new()?;
    let window = Arc::new(
        event_loop.create_window(
            winit::window::WindowAttributes::default()
                .with_title(WINDOW_TITLE)
                .with_transparent(config.transparent)
                .with_inner_size(winit::dpi::LogicalSize::new(1280, 720)),
        )?,
    );
    let size = window.inner_size();
    let viewport = Extent::new(size.width.max(1), size.height.max(1));

    let instance = GpuContext::create_instance();
    let surface = instance.create_surface(window.clone())?;
    let ctx = pollster::block_on(GpuContext::new(instance, Some(&surface)))?;
    let backend = GpuFluid::with_surface(ctx, surface, &config, viewport)?;

    let mut engine = FluidEngine::new(config, backend, viewport)?;
    engine.start();

    let mut frames = FrameCounter::new();
    let mut cursor = (0.0f32, 0.0f32);
    let mut rng = rand::thread_rng();

    event_loop.run(move |event, control_flow| match event {
        Event::WindowEvent { ref event, window_id } if window_id == window.id() => match event {
            WindowEvent::CloseRequested
            | WindowEvent::KeyboardInput {
                event:
                    KeyEvent {
                        physical_key: PhysicalKey::Code(KeyCode::Escape),
                        ..
                    },
                ..
            } => {
                engine.stop();
                control_flow.exit();
            }
            WindowEvent::KeyboardInput {
                event:
                    KeyEvent {
                        physical_key: PhysicalKey::Code(key),
                        state: ElementState::Pressed,
                        repeat: false,
                        ..
                    },
                ..
            } => match key {
                KeyCode::Space => engine.request_burst(rng.gen_range(5..25)),
                KeyCode::KeyP => engine.toggle_pause(),
                _ => {}
            },
            WindowEvent::CursorMoved { position, .. } => {
                cursor = (position.x as f32, position.y as f32);
                engine.pointer_move(PointerId::Mouse, cursor.0, cursor.1);
            }
            WindowEvent::MouseInput {
                state,
                button: MouseButton::Left,
                ..
            } => match state {
                ElementState::Pressed => engine.pointer_down(PointerId::Mouse, cursor.0, cursor.1),
                ElementState::Released => engine.pointer_up(PointerId::Mouse),
            },
            WindowEvent::Touch(Touch {
                phase, location, id, ..
            }) => {
                let pointer = PointerId::Touch(*id);
                let (x, y) = (location.x as f32, location.y as f32);
                match phase {
                    TouchPhase::Started => engine.pointer_down(pointer, x, y),
                    TouchPhase::Moved => engine.pointer_move(pointer, x, y),
                    TouchPhase::Ended | TouchPhase::Cancelled => engine.pointer_up(pointer),
                }
            }
            WindowEvent::Resized(physical_size) => {
                engine.resize(physical_size.width, physical_size.height);
            }
            WindowEvent::RedrawRequested => match engine.tick() {
                Ok(TickOutcome::Continue) => {
                    let paused = engine.state() == aurora_fluid::SchedulerState::Paused;
                    frames.frame(&window, paused);
                }
                Ok(TickOutcome::Halted) => control_flow.exit(),
                Err(err) => {
                    log::error!("{err}");
                    control_flow.exit();
                }
            },
            _ => {}
        },
        Event::AboutToWait => {
            window.request_redraw();
        }
        _ => {}
    })?;

    Ok(())
}
