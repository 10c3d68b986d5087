use anyhow::{anyhow, bail, Context, Result};
use glam::{Mat4, Vec2, Vec3, Vec4};
use image::RgbaImage;
use std::collections::HashMap;
use std::sync::{mpsc, Arc};
use wgpu::util::DeviceExt;

use super::{
    Backend, ClearValue, DrawCall, DrawGeometry, GraphicsDevice, RenderTargetBinding, RenderTargetDesc,
    TargetDimension, TargetFormat, TextureHandle,
};
use crate::camera3d::Viewport;
use crate::mesh::{IndexBuffer, MeshVertex};
use crate::scene::ShaderId;

const DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth32Float;

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct DrawUniform {
    projection: [[f32; 4]; 4],
    view: [[f32; 4]; 4],
    world: [[f32; 4]; 4],
}

struct GpuTarget {
    texture: wgpu::Texture,
    full_view: wgpu::TextureView,
    desc: RenderTargetDesc,
}

struct RegisteredPipeline {
    pipeline: wgpu::RenderPipeline,
    texture_layout: Option<Arc<wgpu::BindGroupLayout>>,
}

/// `GraphicsDevice` backed by a headless wgpu device. Shader programs are owned by the caller and
/// registered per `ShaderId`; draws whose shader has no registered pipeline are skipped.
pub struct WgpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    draw_layout: Arc<wgpu::BindGroupLayout>,
    sampler: wgpu::Sampler,
    targets: HashMap<TextureHandle, GpuTarget>,
    depth_buffers: HashMap<(u32, u32), wgpu::TextureView>,
    pipelines: HashMap<ShaderId, RegisteredPipeline>,
    next_handle: u32,
    current: RenderTargetBinding,
    viewport: Viewport,
    projection: Mat4,
    view: Mat4,
}

impl WgpuDevice {
    pub fn new_headless() -> Result<Self> {
        pollster::block_on(Self::init_headless())
    }

    async fn init_headless() -> Result<Self> {
        let instance = wgpu::Instance::default();
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .context("Failed to request headless adapter")?;
        let device_desc = wgpu::DeviceDescriptor {
            label: Some("Light Bake Device"),
            required_features: wgpu::Features::empty(),
            required_limits: adapter.limits(),
            experimental_features: wgpu::ExperimentalFeatures::default(),
            memory_hints: wgpu::MemoryHints::default(),
            trace: wgpu::Trace::default(),
        };
        let (device, queue) =
            adapter.request_device(&device_desc).await.context("Failed to request headless device")?;

        let draw_layout = Arc::new(device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Draw Uniform BGL"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            }],
        }));
        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Pipeline Sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });

        Ok(Self {
            device,
            queue,
            draw_layout,
            sampler,
            targets: HashMap::new(),
            depth_buffers: HashMap::new(),
            pipelines: HashMap::new(),
            next_handle: 1,
            current: RenderTargetBinding::Screen,
            viewport: Viewport::new(1.0, 1.0),
            projection: Mat4::IDENTITY,
            view: Mat4::IDENTITY,
        })
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    /// Layout of bind group 0 (projection, view, world) every registered pipeline must use.
    pub fn draw_uniform_layout(&self) -> Arc<wgpu::BindGroupLayout> {
        Arc::clone(&self.draw_layout)
    }

    /// Registers the pipeline for `shader`. Bind group 1, when present, receives the draw's textures in
    /// order followed by a filtering sampler.
    pub fn register_pipeline(
        &mut self,
        shader: ShaderId,
        pipeline: wgpu::RenderPipeline,
        texture_layout: Option<Arc<wgpu::BindGroupLayout>>,
    ) {
        self.pipelines.insert(shader, RegisteredPipeline { pipeline, texture_layout });
    }

    fn texture_format(format: TargetFormat) -> wgpu::TextureFormat {
        match format {
            TargetFormat::Rgba8 => wgpu::TextureFormat::Rgba8Unorm,
            TargetFormat::R32Float => wgpu::TextureFormat::R32Float,
            TargetFormat::Depth32 => DEPTH_FORMAT,
        }
    }

    fn attachment_view(&self, binding: RenderTargetBinding) -> Result<(wgpu::TextureView, &RenderTargetDesc)> {
        let texture = binding.texture().context("Screen target is not available on a headless device")?;
        let target = self.targets.get(&texture).ok_or_else(|| anyhow!("Unknown render target {texture:?}"))?;
        let layer = match binding {
            RenderTargetBinding::Layer { layer, .. } => layer,
            RenderTargetBinding::CubeFace { face, .. } => face.index(),
            _ => 0,
        };
        let view = target.texture.create_view(&wgpu::TextureViewDescriptor {
            label: Some("Render Target Layer"),
            format: Some(Self::texture_format(target.desc.format)),
            dimension: Some(wgpu::TextureViewDimension::D2),
            base_mip_level: 0,
            mip_level_count: None,
            base_array_layer: layer,
            array_layer_count: Some(1),
            ..Default::default()
        });
        Ok((view, &target.desc))
    }

    fn depth_buffer(&mut self, width: u32, height: u32) -> wgpu::TextureView {
        self.depth_buffers
            .entry((width, height))
            .or_insert_with(|| {
                let texture = self.device.create_texture(&wgpu::TextureDescriptor {
                    label: Some("Render Target Depth"),
                    size: wgpu::Extent3d { width, height, depth_or_array_layers: 1 },
                    mip_level_count: 1,
                    sample_count: 1,
                    dimension: wgpu::TextureDimension::D2,
                    format: DEPTH_FORMAT,
                    usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
                    view_formats: &[],
                });
                texture.create_view(&wgpu::TextureViewDescriptor::default())
            })
            .clone()
    }

    fn encode_pass(&mut self, clear: ClearValue, draw: Option<&DrawCall<'_>>) -> Result<()> {
        let (color_view, desc) = self.attachment_view(self.current)?;
        let (width, height, format) = (desc.width, desc.height, desc.format);
        let is_depth = format == TargetFormat::Depth32;
        let depth_view = if is_depth { color_view.clone() } else { self.depth_buffer(width, height) };

        let geometry = match draw {
            Some(call) => Some(self.upload_geometry(call)?),
            None => None,
        };
        let bind_groups = match draw {
            Some(call) => Some(self.draw_bind_groups(call)?),
            None => None,
        };

        let mut encoder =
            self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("Pipeline Pass") });
        {
            let color_attachment = (!is_depth).then(|| wgpu::RenderPassColorAttachment {
                view: &color_view,
                depth_slice: None,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: match clear.color {
                        Some([r, g, b, a]) => wgpu::LoadOp::Clear(wgpu::Color {
                            r: r as f64,
                            g: g as f64,
                            b: b as f64,
                            a: a as f64,
                        }),
                        None => wgpu::LoadOp::Load,
                    },
                    store: wgpu::StoreOp::Store,
                },
            });
            let color_attachments: &[Option<wgpu::RenderPassColorAttachment>] =
                if is_depth { &[] } else { std::slice::from_ref(&color_attachment) };
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Pipeline Pass"),
                color_attachments,
                depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                    view: &depth_view,
                    depth_ops: Some(wgpu::Operations {
                        load: match clear.depth {
                            Some(depth) => wgpu::LoadOp::Clear(depth),
                            None => wgpu::LoadOp::Load,
                        },
                        store: wgpu::StoreOp::Store,
                    }),
                    stencil_ops: None,
                }),
                occlusion_query_set: None,
                timestamp_writes: None,
            });
            if let (Some(call), Some((vertex_buffer, index_buffer, index_format, index_count)), Some(groups)) =
                (draw, geometry.as_ref(), bind_groups.as_ref())
            {
                let Some(registered) = self.pipelines.get(&call.shader) else {
                    return Ok(());
                };
                pass.set_pipeline(&registered.pipeline);
                let vp = self.viewport;
                pass.set_viewport(vp.x, vp.y, vp.width.max(1.0), vp.height.max(1.0), 0.0, 1.0);
                pass.set_bind_group(0, &groups.0, &[]);
                if let Some(textures) = groups.1.as_ref() {
                    pass.set_bind_group(1, textures, &[]);
                }
                pass.set_vertex_buffer(0, vertex_buffer.slice(..));
                pass.set_index_buffer(index_buffer.slice(..), *index_format);
                pass.draw_indexed(0..*index_count, 0, 0..1);
            }
        }
        self.queue.submit(Some(encoder.finish()));
        Ok(())
    }

    fn upload_geometry(&self, call: &DrawCall<'_>) -> Result<(wgpu::Buffer, wgpu::Buffer, wgpu::IndexFormat, u32)> {
        let (vertices, indices): (Vec<MeshVertex>, IndexBuffer) = match call.geometry {
            DrawGeometry::Mesh(mesh) => (mesh.vertices.to_vec(), mesh.indices.clone()),
            DrawGeometry::FullscreenQuad { flip_v } => {
                let (v0, v1) = if flip_v { (1.0, 0.0) } else { (0.0, 1.0) };
                let quad = [
                    (Vec3::new(-1.0, -1.0, 0.0), Vec2::new(0.0, v1)),
                    (Vec3::new(1.0, -1.0, 0.0), Vec2::new(1.0, v1)),
                    (Vec3::new(1.0, 1.0, 0.0), Vec2::new(1.0, v0)),
                    (Vec3::new(-1.0, 1.0, 0.0), Vec2::new(0.0, v0)),
                ];
                let vertices =
                    quad.iter().map(|&(pos, uv)| MeshVertex::new(pos, Vec3::Z, Vec4::new(1.0, 0.0, 0.0, 1.0), uv)).collect();
                (vertices, IndexBuffer::U16(vec![0, 1, 2, 0, 2, 3]))
            }
        };
        if vertices.is_empty() || indices.is_empty() {
            bail!("Draw has no geometry");
        }
        let vertex_buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Draw Vertex Buffer"),
            contents: bytemuck::cast_slice(&vertices),
            usage: wgpu::BufferUsages::VERTEX,
        });
        let count = indices.len() as u32;
        let (contents, format): (Vec<u8>, wgpu::IndexFormat) = match &indices {
            IndexBuffer::U16(data) => {
                // Pad to a 4-byte multiple for the copy alignment rule.
                let mut padded = data.clone();
                if padded.len() % 2 == 1 {
                    padded.push(0);
                }
                (bytemuck::cast_slice(&padded).to_vec(), wgpu::IndexFormat::Uint16)
            }
            IndexBuffer::U32(data) => (bytemuck::cast_slice(data).to_vec(), wgpu::IndexFormat::Uint32),
        };
        let index_buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Draw Index Buffer"),
            contents: &contents,
            usage: wgpu::BufferUsages::INDEX,
        });
        Ok((vertex_buffer, index_buffer, format, count))
    }

    fn draw_bind_groups(&self, call: &DrawCall<'_>) -> Result<(wgpu::BindGroup, Option<wgpu::BindGroup>)> {
        let uniform = DrawUniform {
            projection: self.projection.to_cols_array_2d(),
            view: self.view.to_cols_array_2d(),
            world: call.world.to_cols_array_2d(),
        };
        let buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Draw Uniform Buffer"),
            contents: bytemuck::bytes_of(&uniform),
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let uniform_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Draw Uniform BG"),
            layout: self.draw_layout.as_ref(),
            entries: &[wgpu::BindGroupEntry { binding: 0, resource: buffer.as_entire_binding() }],
        });
        let texture_layout = self.pipelines.get(&call.shader).and_then(|p| p.texture_layout.clone());
        let texture_group = match texture_layout {
            Some(layout) if !call.textures.is_empty() => {
                let mut views = Vec::with_capacity(call.textures.len());
                for binding in &call.textures {
                    let target = self
                        .targets
                        .get(&binding.texture)
                        .ok_or_else(|| anyhow!("Draw samples released texture {:?}", binding.texture))?;
                    views.push(&target.full_view);
                }
                let mut entries: Vec<wgpu::BindGroupEntry> = views
                    .iter()
                    .enumerate()
                    .map(|(slot, view)| wgpu::BindGroupEntry {
                        binding: slot as u32,
                        resource: wgpu::BindingResource::TextureView(view),
                    })
                    .collect();
                entries.push(wgpu::BindGroupEntry {
                    binding: views.len() as u32,
                    resource: wgpu::BindingResource::Sampler(&self.sampler),
                });
                Some(self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some("Draw Texture BG"),
                    layout: layout.as_ref(),
                    entries: &entries,
                }))
            }
            _ => None,
        };
        Ok((uniform_group, texture_group))
    }
}

impl GraphicsDevice for WgpuDevice {
    fn backend(&self) -> Backend {
        Backend::Wgpu
    }

    fn create_render_target(&mut self, desc: &RenderTargetDesc) -> Result<TextureHandle> {
        if desc.width == 0 || desc.height == 0 {
            bail!("Render target '{}' has zero size", desc.label);
        }
        let format = Self::texture_format(desc.format);
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(desc.label),
            size: wgpu::Extent3d { width: desc.width, height: desc.height, depth_or_array_layers: desc.layer_count() },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            bail!("Failed to allocate render target '{}': {err}", desc.label);
        }
        let dimension = match desc.dimension {
            TargetDimension::D2 => wgpu::TextureViewDimension::D2,
            TargetDimension::Array(_) => wgpu::TextureViewDimension::D2Array,
            TargetDimension::Cube => wgpu::TextureViewDimension::Cube,
        };
        let full_view = texture.create_view(&wgpu::TextureViewDescriptor {
            label: Some(desc.label),
            format: Some(format),
            dimension: Some(dimension),
            base_mip_level: 0,
            mip_level_count: None,
            base_array_layer: 0,
            array_layer_count: None,
            ..Default::default()
        });
        let handle = TextureHandle(self.next_handle);
        self.next_handle += 1;
        self.targets.insert(handle, GpuTarget { texture, full_view, desc: desc.clone() });
        Ok(handle)
    }

    fn release_texture(&mut self, texture: TextureHandle) {
        if let Some(target) = self.targets.remove(&texture) {
            target.texture.destroy();
        }
        if self.current.texture() == Some(texture) {
            self.current = RenderTargetBinding::Screen;
        }
    }

    fn bind_target(&mut self, binding: RenderTargetBinding, clear: ClearValue) -> Result<()> {
        self.current = binding;
        if clear.is_none() || binding == RenderTargetBinding::Screen {
            return Ok(());
        }
        self.encode_pass(clear, None)
    }

    fn current_target(&self) -> RenderTargetBinding {
        self.current
    }

    fn set_viewport(&mut self, viewport: Viewport) {
        self.viewport = viewport;
    }

    fn set_transforms(&mut self, projection: Mat4, view: Mat4) {
        self.projection = projection;
        self.view = view;
    }

    fn draw(&mut self, call: &DrawCall<'_>) -> Result<()> {
        if !self.pipelines.contains_key(&call.shader) {
            log::trace!("[gpu] No pipeline registered for {:?}; draw skipped", call.shader);
            return Ok(());
        }
        if self.current == RenderTargetBinding::Screen {
            return Ok(());
        }
        self.encode_pass(ClearValue::NONE, Some(call))
    }

    fn read_target(&mut self, texture: TextureHandle) -> Result<RgbaImage> {
        let target = self.targets.get(&texture).ok_or_else(|| anyhow!("Unknown render target {texture:?}"))?;
        if target.desc.format != TargetFormat::Rgba8 {
            bail!("Only RGBA8 targets can be read back ('{}')", target.desc.label);
        }
        let (width, height) = (target.desc.width, target.desc.height);
        let unpadded_row = width * 4;
        let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let padded_row = unpadded_row.div_ceil(align) * align;
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Readback Buffer"),
            size: (padded_row * height) as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        let mut encoder =
            self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("Readback") });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &target.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &buffer,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_row),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d { width, height, depth_or_array_layers: 1 },
        );
        self.queue.submit(Some(encoder.finish()));

        let slice = buffer.slice(..);
        let (sender, receiver) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.device.poll(wgpu::PollType::wait_indefinitely()).context("Failed to wait for readback")?;
        receiver.recv().context("Readback callback dropped")?.context("Failed to map readback buffer")?;

        let mut pixels = Vec::with_capacity((unpadded_row * height) as usize);
        {
            let mapped = slice.get_mapped_range();
            for row in mapped.chunks(padded_row as usize).take(height as usize) {
                pixels.extend_from_slice(&row[..unpadded_row as usize]);
            }
        }
        buffer.unmap();
        RgbaImage::from_raw(width, height, pixels).context("Readback size mismatch")
    }
}
