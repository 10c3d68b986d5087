use anyhow::{Context, Result};

use crate::device::{GraphicsDevice, RenderTargetDesc, TargetFormat, TextureHandle};
use crate::light::{Light, LightId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DepthTargetKind {
    /// Area and spot-from-bound lights.
    Texture2D,
    /// Point and spot lights, one face per axis.
    Cube,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepthEntry {
    /// `None` once a dynamic entry has been released for reuse.
    pub light: Option<LightId>,
    pub kind: DepthTargetKind,
    pub texture: TextureHandle,
    pub needs_render: bool,
}

/// Texture handed to the shadow stage for one light this frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthSlot {
    pub texture: TextureHandle,
    pub needs_render: bool,
}

/// Per-light depth targets reused across frames. Static lights keep their entry until invalidated;
/// dynamic entries are returned to a free pool every frame and handed to whichever dynamic light asks.
#[derive(Debug)]
pub struct ShadowDepthCache {
    size: u32,
    static_entries: Vec<DepthEntry>,
    dynamic_entries: Vec<DepthEntry>,
}

impl ShadowDepthCache {
    pub fn new(size: u32) -> Self {
        Self { size: size.max(1), static_entries: Vec::new(), dynamic_entries: Vec::new() }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn len(&self) -> usize {
        self.static_entries.len() + self.dynamic_entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entry(&self, light: LightId) -> Option<&DepthEntry> {
        self.static_entries.iter().chain(self.dynamic_entries.iter()).find(|entry| entry.light == Some(light))
    }

    pub fn depth_texture(&self, light: LightId) -> Option<TextureHandle> {
        self.entry(light).map(|entry| entry.texture)
    }

    pub fn get_or_create(&mut self, device: &mut dyn GraphicsDevice, light: &Light, kind: DepthTargetKind) -> Result<DepthSlot> {
        if light.dynamic_shadow {
            self.dynamic_slot(device, light.id, kind)
        } else {
            self.static_slot(device, light.id, kind)
        }
    }

    fn dynamic_slot(&mut self, device: &mut dyn GraphicsDevice, id: LightId, kind: DepthTargetKind) -> Result<DepthSlot> {
        self.drop_from_static(device, id);
        let position = self
            .dynamic_entries
            .iter()
            .position(|entry| entry.light == Some(id) && entry.kind == kind)
            .or_else(|| self.dynamic_entries.iter().position(|entry| entry.light.is_none() && entry.kind == kind));
        let index = match position {
            Some(index) => index,
            None => {
                let texture = self.allocate(device, kind)?;
                self.dynamic_entries.push(DepthEntry { light: None, kind, texture, needs_render: true });
                self.dynamic_entries.len() - 1
            }
        };
        let entry = &mut self.dynamic_entries[index];
        entry.light = Some(id);
        entry.needs_render = true;
        Ok(DepthSlot { texture: entry.texture, needs_render: true })
    }

    fn static_slot(&mut self, device: &mut dyn GraphicsDevice, id: LightId, kind: DepthTargetKind) -> Result<DepthSlot> {
        self.drop_from_dynamic(id);
        if let Some(index) = self.static_entries.iter().position(|entry| entry.light == Some(id)) {
            if self.static_entries[index].kind == kind {
                let entry = &self.static_entries[index];
                return Ok(DepthSlot { texture: entry.texture, needs_render: entry.needs_render });
            }
            let stale = self.static_entries.remove(index);
            device.release_texture(stale.texture);
        }
        let texture = self.allocate(device, kind)?;
        self.static_entries.push(DepthEntry { light: Some(id), kind, texture, needs_render: true });
        Ok(DepthSlot { texture, needs_render: true })
    }

    fn allocate(&self, device: &mut dyn GraphicsDevice, kind: DepthTargetKind) -> Result<TextureHandle> {
        let desc = match kind {
            DepthTargetKind::Texture2D => RenderTargetDesc::new_2d("shadow_depth", self.size, TargetFormat::R32Float),
            DepthTargetKind::Cube => RenderTargetDesc::new_cube("shadow_depth_cube", self.size, TargetFormat::R32Float),
        };
        device.create_render_target(&desc).with_context(|| format!("allocating {kind:?} shadow depth target"))
    }

    fn drop_from_static(&mut self, device: &mut dyn GraphicsDevice, id: LightId) {
        if let Some(index) = self.static_entries.iter().position(|entry| entry.light == Some(id)) {
            let entry = self.static_entries.remove(index);
            device.release_texture(entry.texture);
        }
    }

    fn drop_from_dynamic(&mut self, id: LightId) {
        for entry in self.dynamic_entries.iter_mut().filter(|entry| entry.light == Some(id)) {
            entry.light = None;
        }
    }

    pub fn mark_rendered(&mut self, light: LightId) {
        for entry in self.static_entries.iter_mut().chain(self.dynamic_entries.iter_mut()) {
            if entry.light == Some(light) {
                entry.needs_render = false;
            }
        }
    }

    /// Forces the static entry for `light` to re-render on its next request.
    pub fn invalidate(&mut self, light: LightId) {
        if let Some(entry) = self.static_entries.iter_mut().find(|entry| entry.light == Some(light)) {
            entry.needs_render = true;
        }
    }

    /// Returns every dynamic entry to the free pool. Textures stay allocated.
    pub fn clear_dynamic(&mut self) {
        for entry in &mut self.dynamic_entries {
            entry.light = None;
            entry.needs_render = true;
        }
    }

    pub fn clear(&mut self, device: &mut dyn GraphicsDevice) {
        for entry in self.static_entries.drain(..).chain(self.dynamic_entries.drain(..)) {
            device.release_texture(entry.texture);
        }
    }

    pub fn on_light_removed(&mut self, device: &mut dyn GraphicsDevice, light: LightId) {
        self.drop_from_static(device, light);
        self.drop_from_dynamic(light);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::HeadlessDevice;
    use glam::Vec3;

    #[test]
    fn static_entries_render_once_until_invalidated() {
        let mut device = HeadlessDevice::default();
        let mut cache = ShadowDepthCache::new(64);
        let light = Light::point(Vec3::ZERO, 4.0);

        let first = cache.get_or_create(&mut device, &light, DepthTargetKind::Cube).expect("slot");
        assert!(first.needs_render);
        cache.mark_rendered(light.id);
        let second = cache.get_or_create(&mut device, &light, DepthTargetKind::Cube).expect("slot");
        assert_eq!(first.texture, second.texture);
        assert!(!second.needs_render);

        cache.invalidate(light.id);
        assert!(cache.get_or_create(&mut device, &light, DepthTargetKind::Cube).expect("slot").needs_render);
        assert_eq!(device.texture_desc(first.texture).map(|d| d.layer_count()), Some(6));
    }

    #[test]
    fn dynamic_entries_are_pooled_between_frames() {
        let mut device = HeadlessDevice::default();
        let mut cache = ShadowDepthCache::new(64);
        let a = Light::point(Vec3::ZERO, 4.0).with_dynamic_shadow(true);
        let b = Light::point(Vec3::X, 4.0).with_dynamic_shadow(true);

        let slot_a = cache.get_or_create(&mut device, &a, DepthTargetKind::Cube).expect("slot");
        cache.mark_rendered(a.id);
        assert!(cache.get_or_create(&mut device, &a, DepthTargetKind::Cube).expect("slot").needs_render);

        cache.clear_dynamic();
        assert!(cache.entry(a.id).is_none());
        let slot_b = cache.get_or_create(&mut device, &b, DepthTargetKind::Cube).expect("slot");
        assert_eq!(slot_a.texture, slot_b.texture);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn light_switching_to_dynamic_keeps_one_entry() {
        let mut device = HeadlessDevice::default();
        let mut cache = ShadowDepthCache::new(64);
        let mut light = Light::area(Vec3::ZERO, glam::Quat::IDENTITY, glam::Vec2::ONE, 5.0);
        cache.get_or_create(&mut device, &light, DepthTargetKind::Texture2D).expect("slot");
        light.dynamic_shadow = true;
        cache.get_or_create(&mut device, &light, DepthTargetKind::Texture2D).expect("slot");
        assert_eq!(cache.len(), 1);
        assert_eq!(device.live_textures(), 1);

        cache.on_light_removed(&mut device, light.id);
        assert!(cache.entry(light.id).is_none());
        cache.clear(&mut device);
        assert_eq!(device.live_textures(), 0);
    }

    #[test]
    fn allocation_failure_is_reported() {
        let mut device = HeadlessDevice::default().with_target_limit(0);
        let mut cache = ShadowDepthCache::new(64);
        let light = Light::point(Vec3::ZERO, 4.0);
        assert!(cache.get_or_create(&mut device, &light, DepthTargetKind::Cube).is_err());
        assert!(cache.is_empty());
    }
}
