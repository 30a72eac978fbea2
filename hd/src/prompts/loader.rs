//! Template loading and rendering
//!
//! Handlebars registry seeded with the embedded defaults; a template
//! directory may override any of them by file name (`<name>.hbs`).

use std::path::Path;

use eyre::{Context, Result};
use handlebars::Handlebars;
use serde::Serialize;
use tracing::{debug, info};

use super::embedded;

pub struct PromptLoader {
    registry: Handlebars<'static>,
}

impl PromptLoader {
    /// Build a loader with the embedded templates only
    pub fn new() -> Result<Self> {
        let mut registry = Handlebars::new();
        registry.set_strict_mode(false);
        for (name, template) in embedded::all() {
            registry
                .register_template_string(name, template)
                .context(format!("embedded template {name} failed to parse"))?;
        }
        Ok(Self { registry })
    }

    /// Build a loader, overriding embedded templates from a directory
    pub fn with_overrides(dir: impl AsRef<Path>) -> Result<Self> {
        let mut loader = Self::new()?;
        let dir = dir.as_ref();
        if !dir.exists() {
            debug!(dir = %dir.display(), "No template override directory");
            return Ok(loader);
        }

        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e == "hbs")
                && let Some(name) = path.file_stem().and_then(|s| s.to_str())
            {
                let body = std::fs::read_to_string(&path)?;
                loader
                    .registry
                    .register_template_string(name, body)
                    .context(format!("override template {name} failed to parse"))?;
                info!(name, path = %path.display(), "Loaded template override");
            }
        }
        Ok(loader)
    }

    /// Render a template by name
    pub fn render<T: Serialize>(&self, name: &str, data: &T) -> Result<String> {
        self.registry
            .render(name, data)
            .context(format!("rendering template {name}"))
    }
}
