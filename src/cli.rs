use crate::config::PipelineConfigOverrides;
use anyhow::{anyhow, bail, Context, Result};
use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CliOverrides {
    config: Option<PathBuf>,
    scene: Option<PathBuf>,
    output: Option<PathBuf>,
    size: Option<u32>,
    uv0: Option<bool>,
    cascades: Option<u32>,
}

impl CliOverrides {
    pub fn parse_from_env() -> Result<Self> {
        Self::parse(env::args())
    }

    pub fn parse<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut overrides = CliOverrides::default();
        let mut iter = args.into_iter();
        let _ = iter.next(); // skip program name if present
        while let Some(raw_flag) = iter.next() {
            let flag = raw_flag.as_ref();
            let Some(key) = flag.strip_prefix("--") else {
                bail!("Unexpected argument '{flag}'. Flags take the form --name value.");
            };
            let value =
                iter.next().ok_or_else(|| anyhow!("Expected a value after '{flag}'"))?.as_ref().to_string();
            match key {
                "config" => overrides.config = Some(PathBuf::from(value)),
                "scene" => overrides.scene = Some(PathBuf::from(value)),
                "output" => overrides.output = Some(PathBuf::from(value)),
                "size" => {
                    let size = value.parse::<u32>().with_context(|| format!("Invalid size '{value}'"))?;
                    if size == 0 {
                        bail!("Bake size must be greater than zero");
                    }
                    overrides.size = Some(size);
                }
                "uv0" => overrides.uv0 = Some(parse_bool_flag("uv0", &value)?),
                "cascades" => {
                    overrides.cascades =
                        Some(value.parse::<u32>().with_context(|| format!("Invalid cascades '{value}'"))?);
                }
                _ => bail!(
                    "Unknown flag '{flag}'. Supported flags: --config, --scene, --output, --size, --uv0, --cascades."
                ),
            }
        }
        Ok(overrides)
    }

    pub fn config_path(&self) -> Option<&PathBuf> {
        self.config.as_ref()
    }

    pub fn scene_path(&self) -> Option<&PathBuf> {
        self.scene.as_ref()
    }

    pub fn into_config_overrides(self) -> PipelineConfigOverrides {
        PipelineConfigOverrides {
            output_folder: self.output,
            bake_size: self.size,
            bake_in_uv0: self.uv0,
            cascade_count: self.cascades,
        }
    }
}

fn parse_bool_flag(flag: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" => Ok(false),
        other => bail!("Invalid {flag} value '{other}'. Use on/off or true/false."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_paths_and_bake_flags() {
        let args = ["bake_plan", "--scene", "scene.json", "--output", "out", "--size", "512", "--uv0", "on"];
        let cli = CliOverrides::parse(args).expect("parse overrides");
        assert_eq!(cli.scene_path(), Some(&PathBuf::from("scene.json")));
        let overrides = cli.into_config_overrides();
        assert_eq!(overrides.output_folder, Some(PathBuf::from("out")));
        assert_eq!(overrides.bake_size, Some(512));
        assert_eq!(overrides.bake_in_uv0, Some(true));
    }

    #[test]
    fn latest_flag_wins() {
        let args = ["bake_plan", "--size", "128", "--size", "1024", "--uv0", "on", "--uv0", "off"];
        let overrides = CliOverrides::parse(args).expect("parse overrides").into_config_overrides();
        assert_eq!(overrides.bake_size, Some(1024));
        assert_eq!(overrides.bake_in_uv0, Some(false));
    }

    #[test]
    fn missing_value_errors() {
        let err = CliOverrides::parse(["bake_plan", "--size"]).unwrap_err();
        assert!(err.to_string().contains("Expected a value"), "error should mention missing value");
    }

    #[test]
    fn rejects_zero_size_and_unknown_flags() {
        let err = CliOverrides::parse(["bake_plan", "--size", "0"]).unwrap_err();
        assert!(err.to_string().contains("greater than zero"));
        let err = CliOverrides::parse(["bake_plan", "--foo", "bar"]).unwrap_err();
        assert!(err.to_string().contains("Unknown flag"), "unknown flags should error");
    }
}
