//! Ray caster configuration and application settings.

use std::path::PathBuf;
use std::str::FromStr;

use ash::vk;
use multivol_core::constants::{MAX_VOLUMES, MAX_VOLUME_FILES};
use multivol_core::Aabb;
use serde::{Deserialize, Serialize};

use crate::error::{RenderError, Result};

/// Largest cube map face or light grid edge accepted.
pub const MAX_GRID_SIZE: u32 = 1024;

/// Strategy used to populate the per-pixel layer list.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OitMethod {
    /// Rasterized cube proxies with K depth-peel passes.
    #[default]
    DepthPeeling,
    /// Hardware rays through the top-level acceleration structure.
    RayTracing,
}

impl OitMethod {
    pub const fn name(self) -> &'static str {
        match self {
            Self::DepthPeeling => "peel",
            Self::RayTracing => "rt",
        }
    }
}

impl FromStr for OitMethod {
    type Err = RenderError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "peel" | "depth-peeling" | "raster" => Ok(Self::DepthPeeling),
            "rt" | "ray-tracing" | "raytracing" => Ok(Self::RayTracing),
            other => Err(RenderError::InvalidConfig(format!(
                "unknown OIT method '{other}' (expected 'peel' or 'rt')"
            ))),
        }
    }
}

/// Fixed parameters of a [`MultiRayCaster`](crate::MultiRayCaster).
#[derive(Clone, Debug, PartialEq)]
pub struct RayCasterConfig {
    /// Format of the color target the resolve pass blends into.
    pub target_format: vk::Format,
    /// Edge length of each cube map face marched per volume.
    pub grid_size: u32,
    /// Edge length of the light volume.
    pub light_grid_size: u32,
    pub num_volumes: u32,
    /// Number of distinct volume textures; volume `i` samples source `i % num_volume_srcs`.
    pub num_volume_srcs: u32,
    pub oit_method: OitMethod,
    /// Edge length of each renderer-owned volume texture.
    pub volume_resolution: u32,
    /// Proxy bounds for the ray tracing geometry. Defaults to the unit cube `[-1, 1]^3`.
    pub proxy_bounds: Option<Aabb>,
}

impl Default for RayCasterConfig {
    fn default() -> Self {
        Self {
            target_format: vk::Format::R8G8B8A8_UNORM,
            grid_size: 128,
            light_grid_size: 64,
            num_volumes: 4,
            num_volume_srcs: 1,
            oit_method: OitMethod::DepthPeeling,
            volume_resolution: 128,
            proxy_bounds: None,
        }
    }
}

impl RayCasterConfig {
    /// Check the sizes against each other and against the fixed limits.
    pub fn validate(&self) -> Result<()> {
        let check = |ok: bool, msg: String| {
            if ok {
                Ok(())
            } else {
                Err(RenderError::InvalidConfig(msg))
            }
        };

        check(
            (1..=MAX_GRID_SIZE).contains(&self.grid_size),
            format!("grid size {} must be in 1..={MAX_GRID_SIZE}", self.grid_size),
        )?;
        check(
            (1..=MAX_GRID_SIZE).contains(&self.light_grid_size),
            format!(
                "light grid size {} must be in 1..={MAX_GRID_SIZE}",
                self.light_grid_size
            ),
        )?;
        check(
            (1..=MAX_VOLUMES).contains(&self.num_volumes),
            format!(
                "volume count {} must be in 1..={MAX_VOLUMES}",
                self.num_volumes
            ),
        )?;
        check(
            (1..=self.num_volumes).contains(&self.num_volume_srcs),
            format!(
                "volume source count {} must be in 1..={}",
                self.num_volume_srcs, self.num_volumes
            ),
        )?;
        check(
            (1..=MAX_GRID_SIZE).contains(&self.volume_resolution),
            format!(
                "volume resolution {} must be in 1..={MAX_GRID_SIZE}",
                self.volume_resolution
            ),
        )?;
        if let Some(bounds) = self.proxy_bounds {
            check(
                bounds.min.cmplt(bounds.max).all(),
                format!("proxy bounds {bounds:?} are empty"),
            )?;
        }
        Ok(())
    }

    /// Proxy bounds used for the bottom-level acceleration structure.
    pub fn proxy_bounds(&self) -> Aabb {
        self.proxy_bounds
            .unwrap_or_else(|| Aabb::new(glam::Vec3::splat(-1.0), glam::Vec3::ONE))
    }

    /// Cube map layers across all volumes (six faces each).
    pub const fn cube_layers(&self) -> u32 {
        self.num_volumes * 6
    }

    /// Source texture index sampled by volume `index`.
    pub const fn source_index(&self, index: u32) -> u32 {
        index % self.num_volume_srcs
    }

    /// Source slot written when data is loaded for volume `index`.
    pub const fn volume_slot(&self, index: u32) -> Result<u32> {
        if index < self.num_volumes {
            Ok(self.source_index(index))
        } else {
            Err(RenderError::InvalidVolumeIndex {
                index,
                count: self.num_volumes,
            })
        }
    }
}

/// Application-level settings, mirroring the command line.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderSettings {
    pub grid_size: u32,
    pub light_grid_size: u32,
    pub max_ray_samples: u32,
    pub max_light_samples: u32,
    pub num_volumes: u32,
    pub volume_files: Vec<PathBuf>,
    /// Lattice center (xyz) and spacing (w) for the volumes.
    pub volume_pos_scale: [f32; 4],
    /// Edge length of the light volume in world units.
    pub light_map_scale: f32,
    pub clear_color: [f32; 4],
    pub oit_method: OitMethod,
    pub width: u32,
    pub height: u32,
    /// Frames to render before exiting.
    pub frames: u32,
    /// PNG written after the last frame.
    pub output: PathBuf,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            grid_size: 128,
            light_grid_size: 64,
            max_ray_samples: 256,
            max_light_samples: 64,
            num_volumes: 8,
            volume_files: Vec::new(),
            volume_pos_scale: [0.0, 0.0, 0.0, 2.0],
            light_map_scale: 16.0,
            clear_color: [0.2, 0.3, 0.45, 1.0],
            oit_method: OitMethod::DepthPeeling,
            width: 1280,
            height: 720,
            frames: 3,
            output: PathBuf::from("multivol.png"),
        }
    }
}

impl RenderSettings {
    /// Parse from the process arguments.
    pub fn from_args() -> Result<Self> {
        let args: Vec<String> = std::env::args().collect();
        Self::parse_args(&args)
    }

    /// Parse from a slice of arguments (the first is the program name).
    ///
    /// Recognizes:
    /// - `--grid-size <N>`, `--light-grid-size <N>`
    /// - `--max-ray-samples <N>`, `--max-light-samples <N>`
    /// - `--volumes <N>`
    /// - `--volume <PATH>` (repeatable, at most ten)
    /// - `--oit <peel|rt>`
    /// - `--width <N>`, `--height <N>`, `--frames <N>`
    /// - `--output <PATH>`
    pub fn parse_args(args: &[String]) -> Result<Self> {
        let mut settings = Self::default();

        let mut i = 1;
        while i < args.len() {
            let flag = args[i].as_str();
            let mut value = || next_value(args, &mut i, flag);
            match flag {
                "--grid-size" => settings.grid_size = parse_number(flag, value()?)?,
                "--light-grid-size" => settings.light_grid_size = parse_number(flag, value()?)?,
                "--max-ray-samples" => settings.max_ray_samples = parse_number(flag, value()?)?,
                "--max-light-samples" => {
                    settings.max_light_samples = parse_number(flag, value()?)?;
                }
                "--volumes" => settings.num_volumes = parse_number(flag, value()?)?,
                "--volume" => {
                    let path = PathBuf::from(value()?);
                    if settings.volume_files.len() >= MAX_VOLUME_FILES {
                        return Err(RenderError::InvalidConfig(format!(
                            "at most {MAX_VOLUME_FILES} volume files are supported"
                        )));
                    }
                    settings.volume_files.push(path);
                }
                "--oit" => settings.oit_method = value()?.parse()?,
                "--width" => settings.width = parse_number(flag, value()?)?,
                "--height" => settings.height = parse_number(flag, value()?)?,
                "--frames" => settings.frames = parse_number(flag, value()?)?,
                "--output" => settings.output = PathBuf::from(value()?),
                other => tracing::warn!("ignoring unknown argument '{other}'"),
            }
            i += 1;
        }

        Ok(settings)
    }

    /// Number of distinct volume sources: one per file, or one placeholder.
    pub fn num_volume_srcs(&self) -> u32 {
        (self.volume_files.len() as u32).clamp(1, self.num_volumes.max(1))
    }

    /// Ray caster configuration implied by these settings.
    pub fn ray_caster_config(&self, target_format: vk::Format) -> RayCasterConfig {
        RayCasterConfig {
            target_format,
            grid_size: self.grid_size,
            light_grid_size: self.light_grid_size,
            num_volumes: self.num_volumes,
            num_volume_srcs: self.num_volume_srcs(),
            oit_method: self.oit_method,
            ..RayCasterConfig::default()
        }
    }
}

fn next_value<'a>(args: &'a [String], i: &mut usize, flag: &str) -> Result<&'a str> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| RenderError::InvalidConfig(format!("{flag} needs a value")))
}

fn parse_number(flag: &str, value: &str) -> Result<u32> {
    value
        .parse()
        .map_err(|e| RenderError::InvalidConfig(format!("{flag} {value}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("multivol")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn default_config_is_valid() {
        RayCasterConfig::default().validate().unwrap();
    }

    #[test]
    fn more_sources_than_volumes_is_rejected() {
        let config = RayCasterConfig {
            num_volumes: 2,
            num_volume_srcs: 3,
            ..RayCasterConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(RenderError::InvalidConfig(_))
        ));
    }

    #[test]
    fn volume_count_is_bounded_by_key_bits() {
        let config = RayCasterConfig {
            num_volumes: MAX_VOLUMES + 1,
            ..RayCasterConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_grid_is_rejected() {
        let config = RayCasterConfig {
            grid_size: 0,
            ..RayCasterConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn sources_wrap_around_volumes() {
        let config = RayCasterConfig {
            num_volumes: 5,
            num_volume_srcs: 2,
            ..RayCasterConfig::default()
        };
        assert_eq!(config.source_index(0), 0);
        assert_eq!(config.source_index(3), 1);
        assert_eq!(config.source_index(4), 0);
        assert_eq!(config.cube_layers(), 30);
    }

    #[test]
    fn volume_slots_accept_every_volume() {
        let config = RayCasterConfig {
            num_volumes: 4,
            num_volume_srcs: 2,
            ..RayCasterConfig::default()
        };
        assert_eq!(config.volume_slot(1).unwrap(), 1);
        assert_eq!(config.volume_slot(2).unwrap(), 0);
        assert_eq!(config.volume_slot(3).unwrap(), 1);
        assert!(matches!(
            config.volume_slot(4),
            Err(RenderError::InvalidVolumeIndex { index: 4, count: 4 })
        ));
    }

    #[test]
    fn oit_method_parses_short_names() {
        assert_eq!("peel".parse::<OitMethod>().unwrap(), OitMethod::DepthPeeling);
        assert_eq!("RT".parse::<OitMethod>().unwrap(), OitMethod::RayTracing);
        assert!("linked-list".parse::<OitMethod>().is_err());
    }

    #[test]
    fn parses_full_command_line() {
        let settings = RenderSettings::parse_args(&args(&[
            "--grid-size",
            "64",
            "--light-grid-size",
            "32",
            "--max-ray-samples",
            "128",
            "--volumes",
            "4",
            "--volume",
            "a.dds",
            "--volume",
            "b.dds",
            "--oit",
            "rt",
            "--frames",
            "5",
            "--output",
            "out.png",
        ]))
        .unwrap();

        assert_eq!(settings.grid_size, 64);
        assert_eq!(settings.light_grid_size, 32);
        assert_eq!(settings.max_ray_samples, 128);
        assert_eq!(settings.num_volumes, 4);
        assert_eq!(settings.volume_files.len(), 2);
        assert_eq!(settings.num_volume_srcs(), 2);
        assert_eq!(settings.oit_method, OitMethod::RayTracing);
        assert_eq!(settings.frames, 5);
        assert_eq!(settings.output, PathBuf::from("out.png"));
    }

    #[test]
    fn missing_value_is_an_error() {
        assert!(RenderSettings::parse_args(&args(&["--grid-size"])).is_err());
        assert!(RenderSettings::parse_args(&args(&["--width", "wide"])).is_err());
    }

    #[test]
    fn volume_files_are_capped() {
        let mut list = Vec::new();
        for _ in 0..=MAX_VOLUME_FILES {
            list.extend(["--volume", "v.dds"]);
        }
        assert!(RenderSettings::parse_args(&args(&list)).is_err());
    }

    #[test]
    fn placeholder_source_without_files() {
        let settings = RenderSettings::default();
        assert_eq!(settings.num_volume_srcs(), 1);
        let config = settings.ray_caster_config(vk::Format::B8G8R8A8_UNORM);
        config.validate().unwrap();
        assert_eq!(config.target_format, vk::Format::B8G8R8A8_UNORM);
    }
}
