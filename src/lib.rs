pub mod bake;
pub mod camera3d;
pub mod cli;
pub mod config;
pub mod device;
pub mod light;
pub mod mesh;
pub mod renderer;
pub mod scene;

pub use bake::{BakeJob, BakeState, BakeSummary, LightBakeOrchestrator};
pub use config::{BakeConfig, PipelineConfig, ShadowConfig};
pub use renderer::{PipelineChain, ShadowDepthCache, ShadowRenderStage};
