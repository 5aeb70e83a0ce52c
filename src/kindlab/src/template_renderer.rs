/// Template renderer using Tera for Jinja2-style template rendering
/// Supports full Jinja2 syntax: variables, conditionals, loops, filters
use super::embedded_templates;
use crate::error::{LabError, Result};
use std::path::Path;
use tera::{Context, Tera};

pub struct TemplateRenderer {
    tera: Tera,
}

impl TemplateRenderer {
    /// Create a TemplateRenderer from embedded templates (compiled into the binary).
    pub fn from_embedded() -> Result<Self> {
        tracing::debug!("[TemplateRenderer] Initializing Tera from embedded templates");

        let mut tera = Tera::default();
        tera.add_raw_templates(embedded_templates::ALL_TEMPLATES.iter().copied())
            .map_err(|e| LabError::Template(format!("Failed to load embedded templates: {}", e)))?;

        tracing::debug!(
            "[TemplateRenderer] Loaded {} embedded templates",
            embedded_templates::ALL_TEMPLATES.len()
        );

        Ok(Self { tera })
    }

    /// Render a template with a Tera Context directly
    pub fn render_with_context(&self, template_name: &str, context: &Context) -> Result<String> {
        let rendered = self.tera.render(template_name, context).map_err(|e| {
            LabError::Template(format!(
                "Failed to render template {}: {}",
                template_name, e
            ))
        })?;

        tracing::debug!(
            "[TemplateRenderer] Rendered template {} ({} bytes)",
            template_name,
            rendered.len()
        );

        Ok(rendered)
    }

    /// Write rendered template to a file
    pub fn render_to_file(
        &self,
        template_name: &str,
        context: &Context,
        output_path: &Path,
    ) -> Result<()> {
        let rendered = self.render_with_context(template_name, context)?;

        if let Some(parent) = output_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(output_path, rendered)?;

        tracing::info!(
            "[TemplateRenderer] Rendered template {} to {}",
            template_name,
            output_path.display()
        );

        Ok(())
    }
}
