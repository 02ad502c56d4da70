// Aurora - GPU Fluid Backdrop Renderer
// Copyright (c) 2025 Filipe da Veiga Ventura Alves
// Licensed under MIT License

//! Splat injector: turns pointer motion and random bursts into Gaussian
//! impulses on velocity and dye.

use rand::Rng;

use crate::config::FluidConfig;
use crate::field::Extent;
use crate::pass::{Pass, PassBatch};
use crate::program::{PassParams, ProgramKind};
use crate::store::FieldStore;

/// Brightness applied to generated colours so dye doesn't saturate instantly.
const COLOR_SCALE: f32 = 0.15;

/// A queued impulse, consumed once by the frame that drains it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SplatCommand {
    /// Normalized position, `v` growing downwards like pixel rows.
    pub point: [f32; 2],
    /// Velocity added at the centre, in texels per unit time.
    pub force: [f32; 2],
    pub color: [f32; 3],
    /// Gaussian falloff denominator in aspect-corrected UV units.
    pub radius: f32,
}

/// Effective splat radius for a viewport of `aspect` (width / height).
pub fn splat_radius(config: &FluidConfig, aspect: f32) -> f32 {
    let radius = config.splat_radius / 100.0;
    if aspect > 1.0 {
        radius * aspect
    } else {
        radius
    }
}

pub fn hsv_to_rgb(h: f32, s: f32, v: f32) -> [f32; 3] {
    let i = (h * 6.0).floor();
    let f = h * 6.0 - i;
    let p = v * (1.0 - s);
    let q = v * (1.0 - f * s);
    let t = v * (1.0 - (1.0 - f) * s);

    match (i as i32).rem_euclid(6) {
        0 => [v, t, p],
        1 => [q, v, p],
        2 => [p, v, t],
        3 => [p, q, v],
        4 => [t, p, v],
        _ => [v, p, q],
    }
}

pub fn random_color(rng: &mut impl Rng) -> [f32; 3] {
    let [r, g, b] = hsv_to_rgb(rng.gen(), 1.0, 1.0);
    [r * COLOR_SCALE, g * COLOR_SCALE, b * COLOR_SCALE]
}

/// `count` splats at random positions with random directions.
pub fn burst(count: u32, config: &FluidConfig, aspect: f32, rng: &mut impl Rng) -> Vec<SplatCommand> {
    let radius = splat_radius(config, aspect);
    (0..count)
        .map(|_| {
            let color = random_color(rng);
            let point = [rng.gen::<f32>(), rng.gen::<f32>()];
            let force = [
                config.burst_speed * (rng.gen::<f32>() - 0.5),
                config.burst_speed * (rng.gen::<f32>() - 0.5),
            ];
            SplatCommand {
                point,
                force,
                color,
                radius,
            }
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PointerId {
    Mouse,
    Touch(u64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Pointer {
    pub id: PointerId,
    /// Position in viewport pixels.
    pub x: f32,
    pub y: f32,
    /// Last pixel delta times the pointer sensitivity.
    pub dx: f32,
    pub dy: f32,
    pub down: bool,
    pub moved: bool,
    pub color: [f32; 3],
}

impl Pointer {
    fn new(id: PointerId, x: f32, y: f32, color: [f32; 3]) -> Self {
        Self {
            id,
            x,
            y,
            dx: 0.0,
            dy: 0.0,
            down: false,
            moved: false,
            color,
        }
    }
}

/// Tracked contacts, one entry per pointer id. Updates to the same id
/// overwrite each other.
#[derive(Debug, Default)]
pub struct PointerSet {
    pointers: Vec<Pointer>,
}

impl PointerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pointers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pointers.is_empty()
    }

    pub fn get(&self, id: PointerId) -> Option<&Pointer> {
        self.pointers.iter().find(|pointer| pointer.id == id)
    }

    fn index(&self, id: PointerId) -> Option<usize> {
        self.pointers.iter().position(|pointer| pointer.id == id)
    }

    pub fn press(&mut self, id: PointerId, x: f32, y: f32, rng: &mut impl Rng) {
        let color = random_color(rng);
        let pointer = match self.index(id) {
            Some(i) => &mut self.pointers[i],
            None => {
                self.pointers.push(Pointer::new(id, x, y, color));
                let last = self.pointers.len() - 1;
                &mut self.pointers[last]
            }
        };
        pointer.x = x;
        pointer.y = y;
        pointer.dx = 0.0;
        pointer.dy = 0.0;
        pointer.moved = false;
        pointer.down = true;
        pointer.color = color;
    }

    /// Moves a pointer, pressed or not. A pointer seen for the first time only
    /// records its position.
    pub fn motion(&mut self, id: PointerId, x: f32, y: f32, sensitivity: f32, rng: &mut impl Rng) {
        let Some(i) = self.index(id) else {
            self.pointers.push(Pointer::new(id, x, y, random_color(rng)));
            return;
        };
        let pointer = &mut self.pointers[i];
        pointer.dx = (x - pointer.x) * sensitivity;
        pointer.dy = (y - pointer.y) * sensitivity;
        pointer.x = x;
        pointer.y = y;
        pointer.moved = pointer.dx.abs() > 0.0 || pointer.dy.abs() > 0.0;
    }

    /// The mouse stays tracked (it keeps stirring on hover); touches are dropped.
    pub fn release(&mut self, id: PointerId) {
        match id {
            PointerId::Mouse => {
                if let Some(i) = self.index(id) {
                    self.pointers[i].down = false;
                }
            }
            PointerId::Touch(_) => self.pointers.retain(|pointer| pointer.id != id),
        }
    }

    pub fn recolor(&mut self, rng: &mut impl Rng) {
        for pointer in &mut self.pointers {
            pointer.color = random_color(rng);
        }
    }

    /// Snapshots of every moved pointer; their `moved` flags are cleared.
    pub fn drain_moved(&mut self) -> Vec<Pointer> {
        let mut moved = Vec::new();
        for pointer in &mut self.pointers {
            if pointer.moved {
                pointer.moved = false;
                moved.push(pointer.clone());
            }
        }
        moved
    }
}

/// Splat for a moved pointer. Pixel deltas are taken as-is, without dividing
/// by the time between events, so fast event streams push harder.
pub fn pointer_splat(pointer: &Pointer, viewport: Extent, config: &FluidConfig) -> SplatCommand {
    let width = viewport.width.max(1) as f32;
    let height = viewport.height.max(1) as f32;
    let span = width.max(height);
    SplatCommand {
        point: [pointer.x / width, pointer.y / height],
        force: [
            pointer.dx / span * config.splat_force,
            pointer.dy / span * config.splat_force,
        ],
        color: pointer.color,
        radius: splat_radius(config, viewport.aspect()),
    }
}

/// Records the velocity impulse followed by the dye impulse.
pub fn record(batch: &mut PassBatch, store: &mut FieldStore, command: &SplatCommand, aspect: f32) {
    let params = PassParams {
        point: command.point,
        aspect_ratio: aspect,
        radius: command.radius,
        ..PassParams::default()
    };

    batch.draw(
        Pass::new("Splat Velocity", ProgramKind::Splat, store.velocity.write())
            .input(store.velocity.read())
            .params(PassParams {
                texel_size: store.velocity.texel_size(),
                color: [command.force[0], command.force[1], 0.0, 0.0],
                ..params
            }),
    );
    store.velocity.swap();

    let [r, g, b] = command.color;
    batch.draw(
        Pass::new("Splat Dye", ProgramKind::Splat, store.dye.write())
            .input(store.dye.read())
            .params(PassParams {
                texel_size: store.dye.texel_size(),
                color: [r, g, b, 0.0],
                ..params
            }),
    );
    store.dye.swap();
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn hsv_primaries() {
        let cases = [
            ((0.0, 1.0, 1.0), [1.0, 0.0, 0.0]),
            ((1.0 / 3.0, 1.0, 1.0), [0.0, 1.0, 0.0]),
            ((2.0 / 3.0, 1.0, 1.0), [0.0, 0.0, 1.0]),
            ((0.5, 0.0, 0.25), [0.25, 0.25, 0.25]),
        ];
        for ((h, s, v), expected) in cases {
            let rgb = hsv_to_rgb(h, s, v);
            for (got, want) in rgb.iter().zip(expected) {
                assert!((*got - want).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn generated_colors_are_dim() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let color = random_color(&mut rng);
            assert!(color.iter().all(|c| (0.0..=COLOR_SCALE).contains(c)));
            assert!((color.iter().cloned().fold(0.0, f32::max) - COLOR_SCALE).abs() < 1e-6);
        }
    }

    #[test]
    fn radius_widens_on_landscape_viewports() {
        let config = FluidConfig::default();
        assert!((splat_radius(&config, 0.5) - 0.0025).abs() < 1e-6);
        assert!((splat_radius(&config, 2.0) - 0.005).abs() < 1e-6);
    }

    #[test]
    fn burst_stays_in_bounds() {
        let config = FluidConfig::default();
        let mut rng = StdRng::seed_from_u64(11);
        let splats = burst(24, &config, 1.5, &mut rng);
        assert_eq!(splats.len(), 24);
        for splat in splats {
            assert!(splat.point.iter().all(|p| (0.0..1.0).contains(p)));
            assert!(splat.force.iter().all(|f| f.abs() <= config.burst_speed / 2.0));
            assert!((splat.radius - splat_radius(&config, 1.5)).abs() < 1e-6);
        }
    }

    #[test]
    fn first_motion_only_records_position() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut pointers = PointerSet::new();
        pointers.motion(PointerId::Mouse, 100.0, 50.0, 5.0, &mut rng);
        assert!(pointers.drain_moved().is_empty());

        pointers.motion(PointerId::Mouse, 110.0, 48.0, 5.0, &mut rng);
        let moved = pointers.drain_moved();
        assert_eq!(moved.len(), 1);
        assert_eq!((moved[0].dx, moved[0].dy), (50.0, -10.0));
        assert!(!moved[0].down, "hovering still stirs");
        assert!(pointers.drain_moved().is_empty());
    }

    #[test]
    fn press_resets_delta_and_marks_down() {
        let mut rng = StdRng::seed_from_u64(2);
        let mut pointers = PointerSet::new();
        pointers.motion(PointerId::Mouse, 0.0, 0.0, 5.0, &mut rng);
        pointers.motion(PointerId::Mouse, 4.0, 0.0, 5.0, &mut rng);
        pointers.press(PointerId::Mouse, 10.0, 10.0, &mut rng);

        let pointer = pointers.get(PointerId::Mouse).unwrap();
        assert!(pointer.down);
        assert!(!pointer.moved);
        assert_eq!((pointer.x, pointer.y), (10.0, 10.0));
    }

    #[test]
    fn release_keeps_mouse_and_drops_touches() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut pointers = PointerSet::new();
        pointers.press(PointerId::Mouse, 1.0, 1.0, &mut rng);
        pointers.press(PointerId::Touch(4), 2.0, 2.0, &mut rng);
        pointers.press(PointerId::Touch(9), 3.0, 3.0, &mut rng);

        pointers.release(PointerId::Mouse);
        pointers.release(PointerId::Touch(4));

        assert_eq!(pointers.len(), 2);
        assert!(!pointers.get(PointerId::Mouse).unwrap().down);
        assert!(pointers.get(PointerId::Touch(4)).is_none());
        assert!(pointers.get(PointerId::Touch(9)).unwrap().down);
    }

    #[test]
    fn recolor_touches_every_pointer() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut pointers = PointerSet::new();
        pointers.press(PointerId::Touch(0), 0.0, 0.0, &mut rng);
        pointers.press(PointerId::Touch(1), 0.0, 0.0, &mut rng);
        let before: Vec<_> = [0, 1]
            .map(|i| pointers.get(PointerId::Touch(i)).unwrap().color)
            .to_vec();
        pointers.recolor(&mut rng);
        let after: Vec<_> = [0, 1]
            .map(|i| pointers.get(PointerId::Touch(i)).unwrap().color)
            .to_vec();
        assert_ne!(before, after);
    }

    #[test]
    fn pointer_splat_normalizes_position_and_force() {
        let config = FluidConfig::default();
        let pointer = Pointer {
            id: PointerId::Mouse,
            x: 400.0,
            y: 150.0,
            dx: 80.0,
            dy: 0.0,
            down: true,
            moved: true,
            color: [0.1, 0.0, 0.0],
        };
        let splat = pointer_splat(&pointer, Extent::new(800, 600), &config);
        assert_eq!(splat.point, [0.5, 0.25]);
        assert!((splat.force[0] - (80.0 / 800.0 * config.splat_force)).abs() < 1e-3);
        assert_eq!(splat.force[1], 0.0);
        assert_eq!(splat.color, pointer.color);
    }
}
