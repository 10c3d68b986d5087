//! Render-pipeline composition and shadow rendering.
//!
//! Stages are stored in a [`PipelineChain`] arena and linked by index. Per-frame shared state that
//! the shading layer reads (shadow matrices, distances, the light being drawn) lives in
//! [`FrameState`] and is threaded through every stage call.

pub mod blit;
pub mod bounded;
pub mod cascade;
pub mod cube;
pub mod frame;
pub mod lighting_pass;
pub mod shadow_cache;
pub mod shadow_pass;
pub mod stage;

pub use crate::camera3d::{Camera3D, Viewport};
pub use bounded::{BoundedShadow, BoundedShadowProjector};
pub use cascade::{CascadeSettings, CascadeSplit, FrustumSplitComputer, ShadowCascades};
pub use frame::{FrameState, LightShadow, ShadowFrame, ShadowUniform};
pub use lighting_pass::LightingStage;
pub use shadow_cache::{DepthEntry, DepthSlot, DepthTargetKind, ShadowDepthCache};
pub use shadow_pass::{ShadowPassMetrics, ShadowRenderStage};
pub use stage::{
    draw_visible, ChainReport, PipelineChain, RenderStage, StageContext, StageFlow, StageIndex, StageInput,
    StageKind,
};

pub const MAX_SHADOW_CASCADES: usize = 3;
pub const MIN_SHADOW_CASCADES: usize = 2;
/// Lights considered per frame, in culling order.
pub const DEFAULT_MAX_LIGHTS: usize = 16;
