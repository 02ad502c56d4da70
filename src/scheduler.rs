// Aurora - GPU Fluid Backdrop Renderer
// Copyright (c) 2025 Filipe da Veiga Ventura Alves
// Licensed under MIT License

//! Frame scheduling: lifecycle state, cancellation and the per-tick plan.
//!
//! [`FrameState::advance`] is the whole per-tick body minus the GPU work. It
//! turns queued input into a [`FramePlan`] that the engine hands to a
//! [`FluidBackend`], so it can be exercised without a device or a frame clock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rand::Rng;

use crate::config::FluidConfig;
use crate::error::EngineError;
use crate::field::Extent;
use crate::splat::{self, PointerSet, SplatCommand};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulerState {
    #[default]
    Idle,
    Running,
    Paused,
    Stopped,
}

/// Shared stop flag. Once cancelled, no further tick issues GPU work.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What a simulation backend must do each tick, in call order:
/// `resize` (if pending), `splat` per command, `step` (unless paused),
/// then `present`.
pub trait FluidBackend {
    fn resize(&mut self, viewport: Extent) -> Result<(), EngineError>;
    fn splat(&mut self, command: &SplatCommand);
    fn step(&mut self, dt: f32);
    fn present(&mut self) -> Result<(), EngineError>;
}

/// Work decided for a single tick.
#[derive(Debug, Clone, PartialEq)]
pub struct FramePlan {
    pub resize: Option<Extent>,
    pub splats: Vec<SplatCommand>,
    pub step: bool,
}

impl FramePlan {
    /// Replays the plan against `backend`.
    pub fn execute(&self, backend: &mut impl FluidBackend, dt: f32) -> Result<(), EngineError> {
        if let Some(viewport) = self.resize {
            backend.resize(viewport)?;
        }
        for command in &self.splats {
            backend.splat(command);
        }
        if self.step {
            backend.step(dt);
        }
        backend.present()
    }
}

/// Input and timers carried between ticks.
#[derive(Debug)]
pub struct FrameState {
    pub pointers: PointerSet,
    viewport: Extent,
    pending_resize: Option<Extent>,
    bursts: Vec<u32>,
    queue: Vec<SplatCommand>,
    color_timer: f32,
}

impl FrameState {
    pub fn new(viewport: Extent) -> Self {
        Self {
            pointers: PointerSet::new(),
            viewport,
            pending_resize: None,
            bursts: Vec::new(),
            queue: Vec::new(),
            color_timer: 0.0,
        }
    }

    pub fn viewport(&self) -> Extent {
        self.viewport
    }

    /// Defers a resize to the start of the next tick. Later requests replace
    /// earlier ones.
    pub fn request_resize(&mut self, viewport: Extent) {
        if viewport != self.viewport || self.pending_resize.is_some() {
            self.pending_resize = Some(viewport);
        }
    }

    /// Pushes a burst of `count` random splats; one burst is popped per tick.
    pub fn queue_burst(&mut self, count: u32) {
        self.bursts.push(count);
    }

    pub fn pending_bursts(&self) -> usize {
        self.bursts.len()
    }

    pub fn enqueue(&mut self, command: SplatCommand) {
        self.queue.push(command);
    }

    /// Runs one tick's bookkeeping and returns the GPU work it implies.
    pub fn advance(&mut self, config: &FluidConfig, paused: bool, rng: &mut impl Rng) -> FramePlan {
        let resize = self.pending_resize.take();
        if let Some(viewport) = resize {
            self.viewport = viewport;
        }

        if let Some(count) = self.bursts.pop() {
            log::debug!("Burst of {count} splats");
            let commands = splat::burst(count, config, self.viewport.aspect(), rng);
            self.queue.extend(commands);
        }

        if config.colorful {
            self.color_timer += config.timestep * config.color_update_speed;
            if self.color_timer >= 1.0 {
                self.color_timer = 0.0;
                self.pointers.recolor(rng);
            }
        }

        for pointer in self.pointers.drain_moved() {
            let command = splat::pointer_splat(&pointer, self.viewport, config);
            self.queue.push(command);
        }

        FramePlan {
            resize,
            splats: std::mem::take(&mut self.queue),
            step: !paused,
        }
    }
}

/// Lifecycle state machine: `Idle -> Running <-> Paused`, any -> `Stopped`.
#[derive(Debug, Default)]
pub struct FrameScheduler {
    state: SchedulerState,
    token: CancellationToken,
}

impl FrameScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Returns true only on the `Idle -> Running` transition.
    pub fn start(&mut self) -> bool {
        if self.state != SchedulerState::Idle || self.token.is_cancelled() {
            return false;
        }
        self.state = SchedulerState::Running;
        true
    }

    pub fn pause(&mut self) {
        if self.state == SchedulerState::Running {
            self.state = SchedulerState::Paused;
        }
    }

    pub fn resume(&mut self) {
        if self.state == SchedulerState::Paused {
            self.state = SchedulerState::Running;
        }
    }

    pub fn stop(&mut self) {
        self.token.cancel();
        self.state = SchedulerState::Stopped;
    }

    /// Whether the next tick may run. A token cancelled from elsewhere also
    /// stops the scheduler.
    pub fn should_tick(&mut self) -> bool {
        if self.token.is_cancelled() {
            self.state = SchedulerState::Stopped;
        }
        matches!(self.state, SchedulerState::Running | SchedulerState::Paused)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::splat::PointerId;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn lifecycle_transitions() {
        let mut scheduler = FrameScheduler::new();
        assert_eq!(scheduler.state(), SchedulerState::Idle);
        assert!(!scheduler.should_tick());

        assert!(scheduler.start());
        assert!(!scheduler.start());
        assert!(scheduler.should_tick());

        scheduler.pause();
        assert_eq!(scheduler.state(), SchedulerState::Paused);
        assert!(scheduler.should_tick());
        scheduler.resume();
        assert_eq!(scheduler.state(), SchedulerState::Running);

        scheduler.stop();
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
        assert!(!scheduler.should_tick());
        assert!(!scheduler.start());
    }

    #[test]
    fn cancelling_a_token_clone_halts_ticks() {
        let mut scheduler = FrameScheduler::new();
        scheduler.start();
        let token = scheduler.token();
        token.cancel();
        assert!(!scheduler.should_tick());
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
    }

    #[test]
    fn one_burst_is_popped_per_tick() {
        let config = FluidConfig::default();
        let mut rng = StdRng::seed_from_u64(1);
        let mut frame = FrameState::new(Extent::new(800, 600));
        frame.queue_burst(5);
        frame.queue_burst(3);

        let plan = frame.advance(&config, false, &mut rng);
        assert_eq!(plan.splats.len(), 3);
        assert_eq!(frame.pending_bursts(), 1);

        let plan = frame.advance(&config, false, &mut rng);
        assert_eq!(plan.splats.len(), 5);

        let plan = frame.advance(&config, false, &mut rng);
        assert!(plan.splats.is_empty());
        assert!(plan.step);
    }

    #[test]
    fn moved_pointers_become_splats_once() {
        let config = FluidConfig::default();
        let mut rng = StdRng::seed_from_u64(2);
        let mut frame = FrameState::new(Extent::new(800, 600));
        frame.pointers.press(PointerId::Mouse, 400.0, 300.0, &mut rng);
        frame.pointers.motion(PointerId::Mouse, 410.0, 300.0, config.pointer_sensitivity, &mut rng);

        let plan = frame.advance(&config, false, &mut rng);
        assert_eq!(plan.splats.len(), 1);
        assert!(plan.splats[0].force[0] > 0.0);
        assert_eq!(plan.splats[0].force[1], 0.0);

        assert!(frame.advance(&config, false, &mut rng).splats.is_empty());
    }

    #[test]
    fn paused_frames_still_take_splats() {
        let config = FluidConfig::default();
        let mut rng = StdRng::seed_from_u64(3);
        let mut frame = FrameState::new(Extent::new(800, 600));
        frame.queue_burst(2);
        let plan = frame.advance(&config, true, &mut rng);
        assert!(!plan.step);
        assert_eq!(plan.splats.len(), 2);
    }

    #[test]
    fn colors_cycle_on_timer() {
        let config = FluidConfig::default();
        let mut rng = StdRng::seed_from_u64(4);
        let mut frame = FrameState::new(Extent::new(800, 600));
        frame.pointers.press(PointerId::Touch(1), 0.0, 0.0, &mut rng);
        let initial = frame.pointers.get(PointerId::Touch(1)).unwrap().color;

        // 0.016 * 10 per tick crosses 1.0 on the seventh tick.
        for _ in 0..6 {
            frame.advance(&config, false, &mut rng);
        }
        assert_eq!(frame.pointers.get(PointerId::Touch(1)).unwrap().color, initial);
        frame.advance(&config, false, &mut rng);
        assert_ne!(frame.pointers.get(PointerId::Touch(1)).unwrap().color, initial);
    }

    #[test]
    fn colors_hold_when_not_colorful() {
        let config = FluidConfig {
            colorful: false,
            ..FluidConfig::default()
        };
        let mut rng = StdRng::seed_from_u64(5);
        let mut frame = FrameState::new(Extent::new(800, 600));
        frame.pointers.press(PointerId::Mouse, 0.0, 0.0, &mut rng);
        let initial = frame.pointers.get(PointerId::Mouse).unwrap().color;
        for _ in 0..20 {
            frame.advance(&config, false, &mut rng);
        }
        assert_eq!(frame.pointers.get(PointerId::Mouse).unwrap().color, initial);
    }

    #[test]
    fn resize_is_applied_on_next_tick_only() {
        let config = FluidConfig::default();
        let mut rng = StdRng::seed_from_u64(6);
        let mut frame = FrameState::new(Extent::new(800, 600));
        frame.request_resize(Extent::new(1024, 768));
        frame.request_resize(Extent::new(1920, 1080));
        assert_eq!(frame.viewport(), Extent::new(800, 600));

        let plan = frame.advance(&config, false, &mut rng);
        assert_eq!(plan.resize, Some(Extent::new(1920, 1080)));
        assert_eq!(frame.viewport(), Extent::new(1920, 1080));
        assert_eq!(frame.advance(&config, false, &mut rng).resize, None);

        frame.request_resize(Extent::new(1920, 1080));
        assert_eq!(frame.advance(&config, false, &mut rng).resize, None);
    }
}
