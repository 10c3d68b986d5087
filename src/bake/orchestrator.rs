use anyhow::{Context, Result};
use glam::Vec3;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;

use super::atlas::{partition_by_atlas, whole_mesh, AtlasPartition};
use super::job::{BakeEntry, BakeJob};
use super::stages::{
    AreaLightBakeStage, BakeShadowStage, DirectionalLightBakeStage, PointLightBakeStage, PointShadowBakeStage,
};
use super::{AtlasBinding, BakePass, MAX_LIGHTMAP_ATLAS};
use crate::camera3d::{Camera3D, Viewport};
use crate::config::{BakeConfig, ShadowConfig};
use crate::device::{ClearValue, GraphicsDevice, RenderTargetBinding, RenderTargetDesc, TargetFormat, TextureHandle};
use crate::light::{Light, LightKind};
use crate::mesh::Aabb;
use crate::renderer::blit::render_buffer_to_target;
use crate::renderer::{FrameState, PipelineChain, RenderStage, ShadowDepthCache, StageContext, StageInput};
use crate::scene::{shader_names, SceneView, ShaderId, ShaderLibrary, VisibleMesh};

const BAKE_CAMERA_FOV: f32 = std::f32::consts::FRAC_PI_3;
const BAKE_CAMERA_NEAR: f32 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BakeState {
    /// No session.
    Idle,
    Init,
    Bake,
    Finish,
    /// Output written; further ticks do nothing.
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct BakeProgress {
    pub position: usize,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct EntryReport {
    pub triangles_baked: usize,
    pub slots: Vec<usize>,
    /// The entry contributed nothing (no usable lightmap channel or no target for its slots).
    pub skipped: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct BakeSummary {
    pub written: Vec<PathBuf>,
    pub skipped_slots: Vec<usize>,
    pub entries: Vec<EntryReport>,
}

#[derive(Debug, Clone, Copy)]
struct AtlasTargets {
    direct: TextureHandle,
    point: TextureHandle,
}

/// Camera placed beyond the bound's max corner, looking at its center.
pub fn bake_camera(bound: &Aabb) -> Camera3D {
    let center = bound.center();
    let mut position = center + (bound.max - center) * 1.5;
    if position.distance_squared(center) < 1e-6 {
        position = center + Vec3::Z;
    }
    let far = (position.distance(center) * 4.0).max(10.0);
    Camera3D::new(position, center, BAKE_CAMERA_FOV, BAKE_CAMERA_NEAR, far)
}

/// Resumable lightmap bake. Each `update` call performs exactly one step of
/// `Init → Bake × entries → Finish → Done`.
pub struct LightBakeOrchestrator {
    config: BakeConfig,
    state: BakeState,
    job: Option<BakeJob>,
    casters: Vec<VisibleMesh>,
    targets: [Option<AtlasTargets>; MAX_LIGHTMAP_ATLAS],
    failed_slots: BTreeSet<usize>,
    partition: Option<AtlasPartition>,
    directional_chain: PipelineChain,
    area_chain: PipelineChain,
    point_chain: PipelineChain,
    frame: FrameState,
    cache: ShadowDepthCache,
    final_shader: ShaderId,
    final_no_direction_shader: ShaderId,
    summary: BakeSummary,
}

impl LightBakeOrchestrator {
    pub fn new(config: BakeConfig, shadow: &ShadowConfig, shaders: &ShaderLibrary) -> Result<Self> {
        let directional_chain = PipelineChain::from_stages(vec![
            Box::new(BakeShadowStage::new(config.directional_shadow_size, shadow, shaders)?) as Box<dyn RenderStage>,
            Box::new(DirectionalLightBakeStage::new(config.shadow_bias, shaders)?),
        ]);
        let area_chain = PipelineChain::from_stages(vec![
            Box::new(BakeShadowStage::new(config.area_shadow_size, shadow, shaders)?) as Box<dyn RenderStage>,
            Box::new(AreaLightBakeStage::new(shaders)?),
        ]);
        let point_chain = PipelineChain::from_stages(vec![
            Box::new(PointShadowBakeStage::new(config.point_shadow_size, shaders)?) as Box<dyn RenderStage>,
            Box::new(PointLightBakeStage::new(shaders)?),
        ]);
        Ok(Self {
            final_shader: shaders.require(shader_names::BAKE_FINAL)?,
            final_no_direction_shader: shaders.require(shader_names::BAKE_FINAL_NO_DIRECTION_LIGHT)?,
            cache: ShadowDepthCache::new(shadow.depth_size),
            config,
            state: BakeState::Idle,
            job: None,
            casters: Vec::new(),
            targets: [None; MAX_LIGHTMAP_ATLAS],
            failed_slots: BTreeSet::new(),
            partition: None,
            directional_chain,
            area_chain,
            point_chain,
            frame: FrameState::bake(),
            summary: BakeSummary::default(),
        })
    }

    pub fn config(&self) -> &BakeConfig {
        &self.config
    }

    pub fn state(&self) -> BakeState {
        self.state
    }

    pub fn progress(&self) -> BakeProgress {
        self.job
            .as_ref()
            .map(|job| BakeProgress { position: job.cursor(), total: job.len() })
            .unwrap_or_default()
    }

    pub fn summary(&self) -> &BakeSummary {
        &self.summary
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, BakeState::Init | BakeState::Bake | BakeState::Finish)
    }

    /// Begins a new session, abandoning any session in progress.
    pub fn start(&mut self, device: &mut dyn GraphicsDevice, job: BakeJob) {
        if self.is_running() {
            log::info!("[bake] Abandoning previous bake at {:?}", self.progress());
            self.cancel(device);
        }
        log::info!("[bake] Starting bake: {} entries, {} lights", job.len(), job.lights().len());
        self.casters = job.entries().iter().map(BakeEntry::as_visible).collect();
        self.job = Some(job);
        self.summary = BakeSummary::default();
        self.failed_slots.clear();
        self.frame = FrameState::bake();
        self.state = BakeState::Init;
    }

    /// Drops the session and its targets. Nothing is written.
    pub fn cancel(&mut self, device: &mut dyn GraphicsDevice) {
        self.release_session(device);
        self.job = None;
        self.state = BakeState::Idle;
    }

    /// Performs one step and reports where the cursor stands afterwards.
    pub fn update(&mut self, device: &mut dyn GraphicsDevice) -> Result<BakeProgress> {
        match self.state {
            BakeState::Idle | BakeState::Done => {}
            BakeState::Init => {
                let empty = self.job.as_ref().map_or(true, BakeJob::is_empty);
                self.state = if empty { BakeState::Finish } else { BakeState::Bake };
            }
            BakeState::Bake => {
                self.bake_entry(device)?;
                if self.job.as_ref().map_or(true, BakeJob::is_finished) {
                    self.state = BakeState::Finish;
                }
            }
            BakeState::Finish => {
                let written = self.write_output(device);
                self.release_session(device);
                self.state = BakeState::Done;
                written?;
                log::info!("[bake] Finished: {} lightmaps written", self.summary.written.len());
            }
        }
        Ok(self.progress())
    }

    fn bake_entry(&mut self, device: &mut dyn GraphicsDevice) -> Result<()> {
        self.partition = None;
        let Some(entry) = self.job.as_ref().and_then(BakeJob::current).cloned() else {
            return Ok(());
        };

        let partition = if self.config.bake_in_uv0 {
            whole_mesh(&entry.mesh)
        } else if entry.mesh.has_lightmap_channel() {
            partition_by_atlas(&entry.mesh, self.config.effective_atlas_count())
        } else {
            log::debug!("[bake] Entry has no lightmap channel; skipping");
            AtlasPartition::default()
        };
        if partition.dropped() > 0 {
            log::debug!("[bake] Dropped {} triangles with out-of-range atlas index", partition.dropped());
        }

        let mut slots = Vec::new();
        for (slot, sub_mesh) in partition.iter() {
            if let Some(targets) = self.ensure_targets(device, slot) {
                slots.push(AtlasBinding { slot, sub_mesh, direct: targets.direct, point: targets.point });
            }
        }
        let report = EntryReport {
            triangles_baked: slots.iter().map(|binding| binding.sub_mesh.indices.triangle_count()).sum(),
            slots: slots.iter().map(|binding| binding.slot).collect(),
            skipped: slots.is_empty(),
        };

        if !slots.is_empty() {
            let bound = entry.world_bounds();
            let camera = bake_camera(&bound);
            let size = self.config.bake_size;
            let lights: &[Light] = self.job.as_ref().map(BakeJob::lights).unwrap_or_default();
            for light in lights {
                let chain = match light.kind {
                    LightKind::Directional { .. } => &mut self.directional_chain,
                    LightKind::Area { .. } => &mut self.area_chain,
                    LightKind::Point { .. } | LightKind::Spot { .. } => &mut self.point_chain,
                };
                let pass = BakePass {
                    light,
                    bound,
                    render_mesh: &entry.mesh,
                    normal_map: entry.normal_map,
                    slots: &slots,
                    bake_in_uv0: self.config.bake_in_uv0,
                    detail_normal: self.config.bake_detail_normal,
                    bake_size: size,
                };
                self.frame.begin_frame();
                let mut ctx = StageContext {
                    device: &mut *device,
                    frame: &mut self.frame,
                    shadow_cache: &mut self.cache,
                    bake: Some(&pass),
                };
                let input = StageInput::new(
                    RenderTargetBinding::Texture(slots[0].direct),
                    Some(&camera),
                    SceneView::new(&self.casters, lights),
                    Viewport::square(size),
                );
                if let Err(err) = chain.render(&mut ctx, &input) {
                    log::warn!("[bake] Light {:?} skipped for this entry: {err:#}", light.id);
                }
            }
        }

        self.summary.entries.push(report);
        if let Some(job) = self.job.as_mut() {
            job.advance();
            log::info!("[bake] Baked entry {}/{}", job.cursor(), job.len());
        }
        self.partition = Some(partition);
        Ok(())
    }

    /// Accumulation targets for `slot`, allocated and cleared on first use. A slot whose
    /// allocation failed stays skipped for the rest of the session.
    fn ensure_targets(&mut self, device: &mut dyn GraphicsDevice, slot: usize) -> Option<AtlasTargets> {
        if let Some(targets) = self.targets[slot] {
            return Some(targets);
        }
        if self.failed_slots.contains(&slot) {
            return None;
        }
        match allocate_targets(device, self.config.bake_size) {
            Ok(targets) => {
                self.targets[slot] = Some(targets);
                Some(targets)
            }
            Err(err) => {
                log::warn!("[bake] Atlas slot {slot} skipped: {err:#}");
                self.failed_slots.insert(slot);
                None
            }
        }
    }

    fn write_output(&mut self, device: &mut dyn GraphicsDevice) -> Result<()> {
        self.summary.skipped_slots = self.failed_slots.iter().copied().collect();
        let shader = if self.config.combine_direction_light_color {
            self.final_shader
        } else {
            self.final_no_direction_shader
        };
        let size = self.config.bake_size;
        for (slot, targets) in self.targets.iter().enumerate() {
            let Some(targets) = targets else {
                continue;
            };
            let desc = RenderTargetDesc::new_2d("lightmap_result", size, TargetFormat::Rgba8);
            let result = match device.create_render_target(&desc) {
                Ok(texture) => texture,
                Err(err) => {
                    log::warn!("[bake] Atlas slot {slot} not written: {err:#}");
                    self.summary.skipped_slots.push(slot);
                    continue;
                }
            };
            let image = composite(device, result, shader, targets, size);
            device.release_texture(result);
            let image = image?;

            let path = self.config.output_path(slot);
            if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create lightmap folder {}", parent.display()))?;
            }
            image
                .save_with_format(&path, image::ImageFormat::Png)
                .with_context(|| format!("Failed to write lightmap {}", path.display()))?;
            log::info!("[bake] Wrote {}", path.display());
            self.summary.written.push(path);
        }
        self.summary.skipped_slots.sort_unstable();
        Ok(())
    }

    fn release_session(&mut self, device: &mut dyn GraphicsDevice) {
        for targets in self.targets.iter_mut().filter_map(Option::take) {
            device.release_texture(targets.direct);
            device.release_texture(targets.point);
        }
        self.partition = None;
        self.casters.clear();
        self.directional_chain.release(device);
        self.area_chain.release(device);
        self.point_chain.release(device);
        self.cache.clear(device);
        self.frame.begin_frame();
    }
}

fn allocate_targets(device: &mut dyn GraphicsDevice, size: u32) -> Result<AtlasTargets> {
    let direct = create_cleared(device, "lightmap_direct", size)?;
    let point = match create_cleared(device, "lightmap_point", size) {
        Ok(texture) => texture,
        Err(err) => {
            device.release_texture(direct);
            return Err(err);
        }
    };
    Ok(AtlasTargets { direct, point })
}

fn create_cleared(device: &mut dyn GraphicsDevice, label: &'static str, size: u32) -> Result<TextureHandle> {
    let texture = device.create_render_target(&RenderTargetDesc::new_2d(label, size, TargetFormat::Rgba8))?;
    device.bind_target(RenderTargetBinding::Texture(texture), ClearValue::BLACK)?;
    Ok(texture)
}

fn composite(
    device: &mut dyn GraphicsDevice,
    result: TextureHandle,
    shader: ShaderId,
    targets: &AtlasTargets,
    size: u32,
) -> Result<image::RgbaImage> {
    device.bind_target(RenderTargetBinding::Texture(result), ClearValue::BLACK)?;
    render_buffer_to_target(device, shader, &[targets.direct, targets.point], size, size)?;
    device.read_target(result).context("Failed to read back composited lightmap")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bake_camera_sits_past_the_max_corner() {
        let bound = Aabb::new(Vec3::new(-1.0, 0.0, -1.0), Vec3::new(1.0, 2.0, 1.0));
        let camera = bake_camera(&bound);
        assert!((camera.position - Vec3::new(1.5, 2.5, 1.5)).length() < 1e-5);
        assert_eq!(camera.target, bound.center());
        assert!(camera.far > camera.position.distance(camera.target));
    }

    #[test]
    fn degenerate_bound_still_gets_a_camera() {
        let bound = Aabb::new(Vec3::ONE, Vec3::ONE);
        let camera = bake_camera(&bound);
        assert!(camera.forward().length() > 0.5);
    }
}
