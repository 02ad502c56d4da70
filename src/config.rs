// Aurora - GPU Fluid Backdrop Renderer
// Copyright (c) 2025 Filipe da Veiga Ventura Alves
// Licensed under MIT License

use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::error::EngineError;

const SETTINGS_FILE_NAME: &str = "fluid_settings.json";

/// Session-wide tuning. Built once at startup, validated by the engine, never
/// changed while the engine runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FluidConfig {
    pub sim_resolution: u32,
    pub dye_resolution: u32,
    pub bloom_resolution: u32,
    pub sunrays_resolution: u32,
    pub density_dissipation: f32,
    pub velocity_dissipation: f32,
    pub pressure: f32,            // Warm-start factor applied to last frame's pressure
    pub pressure_iterations: u32,
    pub curl: f32,
    pub splat_radius: f32,        // In hundredths of the shorter viewport side
    pub splat_force: f32,
    pub pointer_sensitivity: f32, // Multiplier on raw pixel deltas
    pub shading: bool,
    pub colorful: bool,
    pub color_update_speed: f32,
    pub paused: bool,
    pub back_color: [f32; 3],
    pub transparent: bool,
    pub bloom: bool,
    pub bloom_iterations: u32,
    pub bloom_intensity: f32,
    pub bloom_threshold: f32,
    pub bloom_soft_knee: f32,
    pub sunrays: bool,
    pub sunrays_weight: f32,
    pub timestep: f32,
    pub initial_splats: u32,
    pub burst_speed: f32, // Peak-to-peak range of random burst velocities
}

impl Default for FluidConfig {
    fn default() -> Self {
        Self {
            sim_resolution: 128,
            dye_resolution: 512,
            bloom_resolution: 256,
            sunrays_resolution: 196,
            density_dissipation: 0.97,
            velocity_dissipation: 0.98,
            pressure: 0.8,
            pressure_iterations: 20,
            curl: 30.0,
            splat_radius: 0.25,
            splat_force: 6000.0,
            pointer_sensitivity: 5.0,
            shading: true,
            colorful: true,
            color_update_speed: 10.0,
            paused: false,
            back_color: [0.0, 0.0, 0.0],
            transparent: false,
            bloom: true,
            bloom_iterations: 8,
            bloom_intensity: 0.8,
            bloom_threshold: 0.6,
            bloom_soft_knee: 0.7,
            sunrays: true,
            sunrays_weight: 1.0,
            timestep: 0.016,
            initial_splats: 5,
            burst_speed: 1000.0,
        }
    }
}

impl FluidConfig {
    pub fn default_path() -> PathBuf {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(SETTINGS_FILE_NAME)
    }

    pub fn load_from_disk(path: &Path) -> anyhow::Result<Self> {
        let data = fs::read_to_string(path)?;
        let mut config: FluidConfig = serde_json::from_str(&data)?;
        config.sanitize();
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_disk(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Clamps the purely cosmetic knobs into ranges the shaders behave in.
    pub fn sanitize(&mut self) {
        self.pressure = self.pressure.clamp(0.0, 1.0);
        self.curl = self.curl.clamp(0.0, 100.0);
        self.splat_force = self.splat_force.clamp(0.0, 100_000.0);
        self.pointer_sensitivity = self.pointer_sensitivity.clamp(0.0, 100.0);
        self.color_update_speed = self.color_update_speed.clamp(0.0, 100.0);
        self.bloom_iterations = self.bloom_iterations.clamp(1, 16);
        self.bloom_intensity = self.bloom_intensity.clamp(0.0, 5.0);
        self.bloom_threshold = self.bloom_threshold.clamp(0.0, 1.0);
        self.bloom_soft_knee = self.bloom_soft_knee.clamp(0.0, 1.0);
        self.sunrays_weight = self.sunrays_weight.clamp(0.0, 5.0);
        self.burst_speed = self.burst_speed.clamp(0.0, 10_000.0);
        for channel in &mut self.back_color {
            *channel = channel.clamp(0.0, 1.0);
        }
    }

    /// Rejects values that would break the solver rather than merely look odd.
    pub fn validate(&self) -> Result<(), EngineError> {
        let resolutions = [
            ("sim_resolution", self.sim_resolution),
            ("dye_resolution", self.dye_resolution),
            ("bloom_resolution", self.bloom_resolution),
            ("sunrays_resolution", self.sunrays_resolution),
        ];
        for (name, value) in resolutions {
            if value == 0 {
                return Err(EngineError::InvalidConfig(format!("{name} must be positive")));
            }
        }

        let dissipations = [
            ("density_dissipation", self.density_dissipation),
            ("velocity_dissipation", self.velocity_dissipation),
        ];
        for (name, value) in dissipations {
            if !(value > 0.0 && value <= 1.0) {
                return Err(EngineError::InvalidConfig(format!(
                    "{name} must lie in (0, 1], got {value}"
                )));
            }
        }

        if self.pressure_iterations == 0 {
            return Err(EngineError::InvalidConfig(
                "pressure_iterations must be at least 1".into(),
            ));
        }
        if !(self.timestep > 0.0 && self.timestep.is_finite()) {
            return Err(EngineError::InvalidConfig(format!(
                "timestep must be positive, got {}",
                self.timestep
            )));
        }
        if !(self.splat_radius > 0.0 && self.splat_radius.is_finite()) {
            return Err(EngineError::InvalidConfig(format!(
                "splat_radius must be positive, got {}",
                self.splat_radius
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        assert!(FluidConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_out_of_range_dissipation() {
        let mut config = FluidConfig::default();
        config.density_dissipation = 0.0;
        assert!(matches!(config.validate(), Err(EngineError::InvalidConfig(_))));

        config.density_dissipation = 1.0;
        config.velocity_dissipation = 1.2;
        assert!(matches!(config.validate(), Err(EngineError::InvalidConfig(_))));
    }

    #[test]
    fn rejects_zero_resolution_and_iterations() {
        let mut config = FluidConfig::default();
        config.dye_resolution = 0;
        assert!(config.validate().is_err());

        let mut config = FluidConfig::default();
        config.pressure_iterations = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config: FluidConfig =
            serde_json::from_str(r#"{ "curl": 12.5, "bloom": false }"#).unwrap();
        assert_eq!(config.curl, 12.5);
        assert!(!config.bloom);
        assert_eq!(config.pressure_iterations, 20);
    }

    #[test]
    fn settings_survive_disk_round_trip() {
        let dir = std::env::temp_dir().join(format!("aurora-config-{}", std::process::id()));
        let path = dir.join("settings.json");
        let mut config = FluidConfig::default();
        config.sunrays = false;
        config.pressure_iterations = 31;

        config.save_to_disk(&path).unwrap();
        let loaded = FluidConfig::load_from_disk(&path).unwrap();
        assert_eq!(loaded, config);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn sanitize_clamps_cosmetic_ranges() {
        let mut config = FluidConfig::default();
        config.bloom_iterations = 0;
        config.pressure = 3.0;
        config.back_color = [2.0, -1.0, 0.5];
        config.sanitize();
        assert_eq!(config.bloom_iterations, 1);
        assert_eq!(config.pressure, 1.0);
        assert_eq!(config.back_color, [1.0, 0.0, 0.5]);
    }
}
