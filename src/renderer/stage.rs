use anyhow::{bail, Result};
use smallvec::SmallVec;

use super::{FrameState, ShadowDepthCache};
use crate::bake::BakePass;
use crate::camera3d::{Camera3D, Viewport};
use crate::device::{CubeFace, GraphicsDevice, RenderTargetBinding};
use crate::scene::{Material, SceneView, ShaderInfo, VisibleMesh};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    Shadow,
    Lighting,
    BakeShadow,
    BakePointShadow,
    BakeDirectional,
    BakeArea,
    BakePoint,
}

impl StageKind {
    pub fn label(self) -> &'static str {
        match self {
            StageKind::Shadow => "shadow",
            StageKind::Lighting => "lighting",
            StageKind::BakeShadow => "bake-shadow",
            StageKind::BakePointShadow => "bake-point-shadow",
            StageKind::BakeDirectional => "bake-directional",
            StageKind::BakeArea => "bake-area",
            StageKind::BakePoint => "bake-point",
        }
    }
}

/// Arguments of one `render` call. Stages must not keep any of these past the call.
#[derive(Debug, Clone, Copy)]
pub struct StageInput<'a> {
    pub target: RenderTargetBinding,
    pub camera: Option<&'a Camera3D>,
    pub scene: SceneView<'a>,
    pub viewport: Viewport,
    pub face: Option<CubeFace>,
    pub previous: Option<StageKind>,
}

impl<'a> StageInput<'a> {
    pub fn new(target: RenderTargetBinding, camera: Option<&'a Camera3D>, scene: SceneView<'a>, viewport: Viewport) -> Self {
        Self { target, camera, scene, viewport, face: None, previous: None }
    }
}

/// Mutable services shared by every stage of a chain for the duration of one frame or bake tick.
pub struct StageContext<'a> {
    pub device: &'a mut dyn GraphicsDevice,
    pub frame: &'a mut FrameState,
    pub shadow_cache: &'a mut ShadowDepthCache,
    pub bake: Option<&'a BakePass<'a>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageFlow {
    Forward,
    /// Run the successor with a target this stage produced.
    ForwardTo(RenderTargetBinding),
    Stop,
}

pub trait RenderStage {
    fn kind(&self) -> StageKind;

    fn can_render_material(&self, material: &Material) -> bool {
        !material.shader.deferred
    }

    fn can_render_shader(&self, shader: &ShaderInfo) -> bool {
        !shader.deferred
    }

    /// Whether `draw_mesh` should see this mesh. Meshes without a material are skipped.
    fn accepts(&self, mesh: &VisibleMesh) -> bool {
        match mesh.material.as_deref() {
            Some(material) => self.can_render_material(material) && self.can_render_shader(&material.shader),
            None => false,
        }
    }

    fn render(&mut self, ctx: &mut StageContext<'_>, input: &StageInput<'_>) -> Result<StageFlow>;

    fn draw_mesh(&mut self, _ctx: &mut StageContext<'_>, _input: &StageInput<'_>, _mesh: &VisibleMesh) -> Result<()> {
        Ok(())
    }

    fn release(&mut self, _device: &mut dyn GraphicsDevice) {}
}

/// Runs `draw_mesh` for every visible mesh the stage accepts and returns how many were offered.
pub fn draw_visible<S: RenderStage + ?Sized>(
    stage: &mut S,
    ctx: &mut StageContext<'_>,
    input: &StageInput<'_>,
) -> Result<usize> {
    let mut offered = 0;
    for mesh in input.scene.meshes {
        if stage.accepts(mesh) {
            stage.draw_mesh(ctx, input, mesh)?;
            offered += 1;
        }
    }
    Ok(offered)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StageIndex(usize);

impl StageIndex {
    pub fn get(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainReport {
    pub executed: SmallVec<[StageKind; 4]>,
    pub stopped_early: bool,
}

/// Owns the stages of one pipeline and the successor links between them.
#[derive(Default)]
pub struct PipelineChain {
    stages: Vec<Box<dyn RenderStage>>,
    next: Vec<Option<StageIndex>>,
    head: Option<StageIndex>,
}

impl PipelineChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_stages(stages: Vec<Box<dyn RenderStage>>) -> Self {
        let mut chain = Self::new();
        let mut previous = None;
        for stage in stages {
            let index = chain.push(stage);
            if let Some(prev) = previous {
                chain.next[prev] = Some(index);
            }
            previous = Some(index.0);
        }
        chain
    }

    /// Adds a stage. The first stage pushed becomes the head.
    pub fn push(&mut self, stage: Box<dyn RenderStage>) -> StageIndex {
        let index = StageIndex(self.stages.len());
        self.stages.push(stage);
        self.next.push(None);
        if self.head.is_none() {
            self.head = Some(index);
        }
        index
    }

    pub fn link(&mut self, from: StageIndex, to: StageIndex) -> Result<()> {
        if from.0 >= self.stages.len() || to.0 >= self.stages.len() {
            bail!("Stage link {from:?} -> {to:?} is out of range");
        }
        if from == to {
            bail!("Stage {from:?} cannot follow itself");
        }
        self.next[from.0] = Some(to);
        Ok(())
    }

    pub fn unlink(&mut self, from: StageIndex) {
        if let Some(slot) = self.next.get_mut(from.0) {
            *slot = None;
        }
    }

    pub fn set_head(&mut self, head: StageIndex) -> Result<()> {
        if head.0 >= self.stages.len() {
            bail!("Head stage {head:?} is out of range");
        }
        self.head = Some(head);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn successor(&self, index: StageIndex) -> Option<StageIndex> {
        self.next.get(index.0).copied().flatten()
    }

    pub fn stage(&self, index: StageIndex) -> Option<&dyn RenderStage> {
        self.stages.get(index.0).map(|stage| stage.as_ref())
    }

    pub fn order(&self) -> Vec<StageKind> {
        let mut order = Vec::new();
        let mut cursor = self.head;
        while let Some(index) = cursor {
            if order.len() >= self.stages.len() {
                break;
            }
            order.push(self.stages[index.0].kind());
            cursor = self.next[index.0];
        }
        order
    }

    /// Drives the chain from its head. A cycle is cut after every stage has run once.
    pub fn render(&mut self, ctx: &mut StageContext<'_>, input: &StageInput<'_>) -> Result<ChainReport> {
        let mut report = ChainReport::default();
        let mut current_input = *input;
        let mut cursor = self.head;
        while let Some(index) = cursor {
            if report.executed.len() >= self.stages.len() {
                log::warn!("[pipeline] Stage chain loops back on itself; stopping after {} stages", report.executed.len());
                break;
            }
            let stage = &mut self.stages[index.0];
            let kind = stage.kind();
            let flow = stage.render(ctx, &current_input)?;
            report.executed.push(kind);
            match flow {
                StageFlow::Stop => {
                    report.stopped_early = self.next[index.0].is_some();
                    break;
                }
                StageFlow::Forward => {}
                StageFlow::ForwardTo(target) => current_input.target = target,
            }
            current_input.previous = Some(kind);
            cursor = self.next[index.0];
        }
        Ok(report)
    }

    pub fn release(&mut self, device: &mut dyn GraphicsDevice) {
        for stage in &mut self.stages {
            stage.release(device);
        }
    }
}
