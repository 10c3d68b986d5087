use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::bake::MAX_LIGHTMAP_ATLAS;
use crate::renderer::{MAX_SHADOW_CASCADES, MIN_SHADOW_CASCADES};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ShadowMode {
    #[default]
    Cascaded,
    Single,
}

impl ShadowMode {
    pub fn label(self) -> &'static str {
        match self {
            ShadowMode::Cascaded => "Cascaded",
            ShadowMode::Single => "Single",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShadowConfig {
    #[serde(default)]
    pub mode: ShadowMode,
    #[serde(default = "ShadowConfig::default_cascade_count")]
    pub cascade_count: u32,
    #[serde(default = "ShadowConfig::default_split_lambda")]
    pub split_lambda: f32,
    #[serde(default = "ShadowConfig::default_shadow_far")]
    pub shadow_far: f32,
    #[serde(default = "ShadowConfig::default_near_offset")]
    pub near_offset: f32,
    #[serde(default = "ShadowConfig::default_resolution")]
    pub resolution: u32,
    #[serde(default = "ShadowConfig::default_fov_padding")]
    pub fov_padding: f32,
    #[serde(default = "ShadowConfig::default_split_padding")]
    pub split_padding: f32,
    #[serde(default = "ShadowConfig::default_radius_step")]
    pub radius_step: f32,
    #[serde(default = "ShadowConfig::default_max_lights")]
    pub max_lights: usize,
    #[serde(default = "ShadowConfig::default_depth_size")]
    pub depth_size: u32,
    #[serde(default = "ShadowConfig::default_single_near_offset")]
    pub single_near_offset: f32,
    #[serde(default = "ShadowConfig::default_single_far")]
    pub single_far: f32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BakeConfig {
    #[serde(default = "BakeConfig::default_output_folder")]
    pub output_folder: PathBuf,
    #[serde(default = "BakeConfig::default_file_pattern")]
    pub file_pattern: String,
    #[serde(default = "BakeConfig::default_bake_size")]
    pub bake_size: u32,
    #[serde(default)]
    pub bake_in_uv0: bool,
    #[serde(default)]
    pub bake_detail_normal: bool,
    #[serde(default = "BakeConfig::default_combine_direction_light_color")]
    pub combine_direction_light_color: bool,
    #[serde(default = "BakeConfig::default_shadow_bias")]
    pub shadow_bias: f32,
    #[serde(default)]
    pub bake_all: bool,
    #[serde(default = "BakeConfig::default_atlas_count")]
    pub atlas_count: usize,
    #[serde(default = "BakeConfig::default_directional_shadow_size")]
    pub directional_shadow_size: u32,
    #[serde(default = "BakeConfig::default_point_shadow_size")]
    pub point_shadow_size: u32,
    #[serde(default = "BakeConfig::default_area_shadow_size")]
    pub area_shadow_size: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    #[serde(default = "LogConfig::default_filter")]
    pub filter: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct PipelineConfig {
    #[serde(default)]
    pub shadow: ShadowConfig,
    #[serde(default)]
    pub bake: BakeConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Default)]
pub struct PipelineConfigOverrides {
    pub output_folder: Option<PathBuf>,
    pub bake_size: Option<u32>,
    pub bake_in_uv0: Option<bool>,
    pub cascade_count: Option<u32>,
}

impl ShadowConfig {
    const fn default_cascade_count() -> u32 {
        3
    }

    const fn default_split_lambda() -> f32 {
        0.9
    }

    const fn default_shadow_far() -> f32 {
        300.0
    }

    const fn default_near_offset() -> f32 {
        50.0
    }

    const fn default_resolution() -> u32 {
        2048
    }

    const fn default_fov_padding() -> f32 {
        0.2
    }

    const fn default_split_padding() -> f32 {
        1.005
    }

    const fn default_radius_step() -> f32 {
        1.0 / 16.0
    }

    const fn default_max_lights() -> usize {
        16
    }

    const fn default_depth_size() -> u32 {
        512
    }

    const fn default_single_near_offset() -> f32 {
        300.0
    }

    const fn default_single_far() -> f32 {
        500.0
    }

    /// Cascade count clamped to the supported range.
    pub fn effective_cascade_count(&self) -> usize {
        (self.cascade_count as usize).clamp(MIN_SHADOW_CASCADES, MAX_SHADOW_CASCADES)
    }
}

impl Default for ShadowConfig {
    fn default() -> Self {
        Self {
            mode: ShadowMode::default(),
            cascade_count: Self::default_cascade_count(),
            split_lambda: Self::default_split_lambda(),
            shadow_far: Self::default_shadow_far(),
            near_offset: Self::default_near_offset(),
            resolution: Self::default_resolution(),
            fov_padding: Self::default_fov_padding(),
            split_padding: Self::default_split_padding(),
            radius_step: Self::default_radius_step(),
            max_lights: Self::default_max_lights(),
            depth_size: Self::default_depth_size(),
            single_near_offset: Self::default_single_near_offset(),
            single_far: Self::default_single_far(),
        }
    }
}

impl BakeConfig {
    fn default_output_folder() -> PathBuf {
        PathBuf::from(".")
    }

    fn default_file_pattern() -> String {
        "LightMap_%d.png".to_string()
    }

    const fn default_bake_size() -> u32 {
        2048
    }

    const fn default_combine_direction_light_color() -> bool {
        true
    }

    const fn default_shadow_bias() -> f32 {
        0.0004
    }

    const fn default_atlas_count() -> usize {
        MAX_LIGHTMAP_ATLAS
    }

    const fn default_directional_shadow_size() -> u32 {
        2048
    }

    const fn default_point_shadow_size() -> u32 {
        1024
    }

    const fn default_area_shadow_size() -> u32 {
        1024
    }

    pub fn effective_atlas_count(&self) -> usize {
        self.atlas_count.min(MAX_LIGHTMAP_ATLAS)
    }

    /// Output path for one atlas slot. `%d` in the pattern is replaced by the slot index; a pattern
    /// without it gets `_<slot>` appended before the extension.
    pub fn output_path(&self, slot: usize) -> PathBuf {
        let file_name = if self.file_pattern.contains("%d") {
            self.file_pattern.replace("%d", &slot.to_string())
        } else {
            let pattern = Path::new(&self.file_pattern);
            let stem = pattern.file_stem().and_then(|s| s.to_str()).unwrap_or("LightMap");
            match pattern.extension().and_then(|ext| ext.to_str()) {
                Some(ext) => format!("{stem}_{slot}.{ext}"),
                None => format!("{stem}_{slot}.png"),
            }
        };
        self.output_folder.join(file_name)
    }
}

impl Default for BakeConfig {
    fn default() -> Self {
        Self {
            output_folder: Self::default_output_folder(),
            file_pattern: Self::default_file_pattern(),
            bake_size: Self::default_bake_size(),
            bake_in_uv0: false,
            bake_detail_normal: false,
            combine_direction_light_color: Self::default_combine_direction_light_color(),
            shadow_bias: Self::default_shadow_bias(),
            bake_all: false,
            atlas_count: Self::default_atlas_count(),
            directional_shadow_size: Self::default_directional_shadow_size(),
            point_shadow_size: Self::default_point_shadow_size(),
            area_shadow_size: Self::default_area_shadow_size(),
        }
    }
}

impl LogConfig {
    fn default_filter() -> String {
        "info".to_string()
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { filter: Self::default_filter() }
    }
}

impl PipelineConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes =
            fs::read(path).with_context(|| format!("Failed to read config file {}", path.display()))?;
        let cfg = serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(cfg)
    }

    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::load(path) {
            Ok(cfg) => cfg,
            Err(err) => {
                log::warn!("[config] Config load error: {err:?}. Falling back to defaults.");
                Self::default()
            }
        }
    }

    pub fn apply_overrides(&mut self, overrides: &PipelineConfigOverrides) {
        if let Some(folder) = overrides.output_folder.as_ref() {
            self.bake.output_folder = folder.clone();
        }
        if let Some(size) = overrides.bake_size {
            self.bake.bake_size = size;
        }
        if let Some(uv0) = overrides.bake_in_uv0 {
            self.bake.bake_in_uv0 = uv0;
        }
        if let Some(count) = overrides.cascade_count {
            self.shadow.cascade_count = count;
        }
    }
}

impl PipelineConfigOverrides {
    pub fn is_empty(&self) -> bool {
        self.output_folder.is_none()
            && self.bake_size.is_none()
            && self.bake_in_uv0.is_none()
            && self.cascade_count.is_none()
    }

    pub fn applied_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.output_folder.is_some() {
            fields.push("output");
        }
        if self.bake_size.is_some() {
            fields.push("size");
        }
        if self.bake_in_uv0.is_some() {
            fields.push("uv0");
        }
        if self.cascade_count.is_some() {
            fields.push("cascades");
        }
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_uses_defaults() {
        let cfg: PipelineConfig = serde_json::from_str("{}").expect("parse empty config");
        assert_eq!(cfg.shadow.cascade_count, 3);
        assert!((cfg.shadow.split_lambda - 0.9).abs() < f32::EPSILON);
        assert_eq!(cfg.shadow.mode, ShadowMode::Cascaded);
        assert_eq!(cfg.bake.file_pattern, "LightMap_%d.png");
        assert_eq!(cfg.bake.bake_size, 2048);
        assert!(cfg.bake.combine_direction_light_color);
        assert_eq!(cfg.log.filter, "info");
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let json = r#"{ "shadow": { "mode": "single", "cascade_count": 7 }, "bake": { "bake_in_uv0": true } }"#;
        let cfg: PipelineConfig = serde_json::from_str(json).expect("parse config");
        assert_eq!(cfg.shadow.mode, ShadowMode::Single);
        assert_eq!(cfg.shadow.effective_cascade_count(), MAX_SHADOW_CASCADES);
        assert!((cfg.shadow.shadow_far - 300.0).abs() < f32::EPSILON);
        assert!(cfg.bake.bake_in_uv0);
        assert_eq!(cfg.bake.area_shadow_size, 1024);
    }

    #[test]
    fn output_path_substitutes_slot_index() {
        let bake = BakeConfig { output_folder: PathBuf::from("out"), ..BakeConfig::default() };
        assert_eq!(bake.output_path(3), PathBuf::from("out").join("LightMap_3.png"));
        let plain = BakeConfig { file_pattern: "Lightmap.png".to_string(), ..bake.clone() };
        assert_eq!(plain.output_path(1), PathBuf::from("out").join("Lightmap_1.png"));
        let bare = BakeConfig { file_pattern: "Lightmap".to_string(), ..bake };
        assert_eq!(bare.output_path(2), PathBuf::from("out").join("Lightmap_2.png"));
    }

    #[test]
    fn overrides_apply_selected_fields() {
        let mut cfg = PipelineConfig::default();
        let overrides = PipelineConfigOverrides { bake_size: Some(256), ..Default::default() };
        assert!(!overrides.is_empty());
        cfg.apply_overrides(&overrides);
        assert_eq!(cfg.bake.bake_size, 256);
        assert_eq!(overrides.applied_fields(), vec!["size"]);
    }
}
