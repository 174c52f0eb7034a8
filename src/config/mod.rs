//! Configuration loading and validation utilities.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde::Deserialize;
use tokio::fs;
use tracing::instrument;

use crate::{InpaintError, pipeline::fill::FillMode};

/// Command-line arguments used to bootstrap the runtime.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Inpaint post-processing nodes")]
pub struct CliArgs {
    /// Location of the settings document.
    #[arg(long, value_name = "PATH", default_value = "inpaint.toml", env = "INPAINT_SETTINGS")]
    pub settings: PathBuf,
    /// Model folder override.
    #[arg(long, value_name = "DIR", env = "INPAINT_MODEL_DIR")]
    pub model_dir: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Command,
}

/// Node operations reachable from the command line.
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Fill the masked region with grey or PDE inpainting.
    Fill {
        #[arg(long, value_name = "PATH")]
        image: PathBuf,
        #[arg(long, value_name = "PATH")]
        mask: PathBuf,
        #[arg(long, value_name = "PATH")]
        output: PathBuf,
        /// One of neutral, telea, navier-stokes.
        #[arg(long, value_name = "MODE")]
        fill: Option<String>,
        #[arg(long, value_name = "PIXELS")]
        falloff: Option<usize>,
    },
    /// Blur the masked region.
    Blur {
        #[arg(long, value_name = "PATH")]
        image: PathBuf,
        #[arg(long, value_name = "PATH")]
        mask: PathBuf,
        #[arg(long, value_name = "PATH")]
        output: PathBuf,
        #[arg(long, value_name = "PIXELS")]
        blur: Option<usize>,
        #[arg(long, value_name = "PIXELS")]
        falloff: Option<usize>,
    },
    /// Remap a denoise strength mask into a compositing mask.
    ConvertMask {
        #[arg(long, value_name = "PATH")]
        mask: PathBuf,
        #[arg(long, value_name = "PATH")]
        output: PathBuf,
        #[arg(long)]
        offset: Option<f32>,
        #[arg(long)]
        threshold: Option<f32>,
    },
    /// Load a head + patch pair from the model folder and report it.
    InspectPatch {
        #[arg(long, value_name = "FILE")]
        head: String,
        #[arg(long, value_name = "FILE")]
        patch: String,
    },
}

/// Parameter bounds enforced per operation.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct NodeLimits {
    pub max_falloff: usize,
    pub min_blur: usize,
    pub max_blur: usize,
    pub min_threshold: f32,
}

impl Default for NodeLimits {
    fn default() -> Self {
        Self {
            max_falloff: 8191,
            min_blur: 3,
            max_blur: 8191,
            min_threshold: 0.01,
        }
    }
}

impl NodeLimits {
    pub fn check_falloff(&self, falloff: usize) -> Result<usize, InpaintError> {
        if falloff > self.max_falloff {
            return Err(InpaintError::Configuration(format!(
                "falloff {falloff} exceeds limit {}",
                self.max_falloff
            )));
        }
        Ok(falloff)
    }

    pub fn check_blur(&self, blur: usize) -> Result<usize, InpaintError> {
        if blur < self.min_blur || blur > self.max_blur {
            return Err(InpaintError::Configuration(format!(
                "blur {blur} outside {}..={}",
                self.min_blur, self.max_blur
            )));
        }
        Ok(blur)
    }

    pub fn check_offset(&self, offset: f32) -> Result<f32, InpaintError> {
        if !(0.0..=1.0).contains(&offset) {
            return Err(InpaintError::Configuration(format!(
                "offset {offset} outside 0..=1"
            )));
        }
        Ok(offset)
    }

    pub fn check_threshold(&self, threshold: f32) -> Result<f32, InpaintError> {
        if !(self.min_threshold..=1.0).contains(&threshold) {
            return Err(InpaintError::Configuration(format!(
                "threshold {threshold} outside {}..=1",
                self.min_threshold
            )));
        }
        Ok(threshold)
    }
}

/// Default node parameters provided by the settings author.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct NodeDefaults {
    pub fill: FillMode,
    pub falloff: usize,
    pub blur: usize,
    pub offset: f32,
    pub threshold: f32,
}

impl Default for NodeDefaults {
    fn default() -> Self {
        Self {
            fill: FillMode::Neutral,
            falloff: 0,
            blur: 255,
            offset: 0.1,
            threshold: 0.2,
        }
    }
}

/// Location of model and patch files.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ModelSettings {
    pub dir: PathBuf,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("models/inpaint"),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
struct SettingsDocument {
    #[serde(default)]
    limits: NodeLimits,
    #[serde(default)]
    defaults: NodeDefaults,
    #[serde(default)]
    models: ModelSettings,
}

impl SettingsDocument {
    fn validate(&self) -> Result<(), InpaintError> {
        let limits = &self.limits;
        if limits.min_blur > limits.max_blur {
            return Err(InpaintError::Configuration(
                "min_blur must not exceed max_blur".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&limits.min_threshold) {
            return Err(InpaintError::Configuration(
                "min_threshold must lie in 0..=1".to_string(),
            ));
        }
        limits.check_falloff(self.defaults.falloff)?;
        limits.check_blur(self.defaults.blur)?;
        limits.check_offset(self.defaults.offset)?;
        limits.check_threshold(self.defaults.threshold)?;
        Ok(())
    }
}

/// Validated operation ready for execution.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Fill {
        image: PathBuf,
        mask: PathBuf,
        output: PathBuf,
        fill: FillMode,
        falloff: usize,
    },
    Blur {
        image: PathBuf,
        mask: PathBuf,
        output: PathBuf,
        blur: usize,
        falloff: usize,
    },
    ConvertMask {
        mask: PathBuf,
        output: PathBuf,
        offset: f32,
        threshold: f32,
    },
    InspectPatch {
        head: String,
        patch: String,
    },
}

/// Fully merged configuration set.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub limits: NodeLimits,
    pub defaults: NodeDefaults,
    pub model_dir: PathBuf,
    pub operation: Operation,
}

impl AppConfig {
    #[instrument(skip_all, fields(settings = %cli.settings.display()))]
    pub async fn load(cli: CliArgs) -> Result<Self, InpaintError> {
        let raw = fs::read_to_string(&cli.settings)
            .await
            .map_err(|err| InpaintError::Configuration(format!("failed to read settings: {err}")))?;
        Self::from_document(cli, &raw)
    }

    /// Merges CLI arguments with an in-memory settings document.
    pub fn from_document(cli: CliArgs, raw: &str) -> Result<Self, InpaintError> {
        let document: SettingsDocument = toml::from_str(raw).map_err(|err| {
            InpaintError::Configuration(format!("invalid settings document: {err}"))
        })?;
        document.validate()?;

        let limits = document.limits;
        let defaults = document.defaults;
        let operation = match cli.command {
            Command::Fill {
                image,
                mask,
                output,
                fill,
                falloff,
            } => Operation::Fill {
                image,
                mask,
                output,
                fill: match fill {
                    Some(label) => label.parse()?,
                    None => defaults.fill,
                },
                falloff: limits.check_falloff(falloff.unwrap_or(defaults.falloff))?,
            },
            Command::Blur {
                image,
                mask,
                output,
                blur,
                falloff,
            } => Operation::Blur {
                image,
                mask,
                output,
                blur: limits.check_blur(blur.unwrap_or(defaults.blur))?,
                falloff: limits.check_falloff(falloff.unwrap_or(defaults.falloff))?,
            },
            Command::ConvertMask {
                mask,
                output,
                offset,
                threshold,
            } => Operation::ConvertMask {
                mask,
                output,
                offset: limits.check_offset(offset.unwrap_or(defaults.offset))?,
                threshold: limits.check_threshold(threshold.unwrap_or(defaults.threshold))?,
            },
            Command::InspectPatch { head, patch } => Operation::InspectPatch { head, patch },
        };

        Ok(Self {
            model_dir: cli.model_dir.unwrap_or(document.models.dir),
            limits,
            defaults,
            operation,
        })
    }
}
