//! Versioned template catalogue.
//!
//! Template versions are immutable. Registering a template under an existing
//! id adds a version instead of editing the stored one, so every deployment
//! can be re-rendered from exactly the version it pinned.

mod schema;

pub use schema::{render, resolve_variables, validate_schema, RenderedTemplate};

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, instrument};

use crate::error::{ControlError, ControlResult};
use crate::store::{TemplateFilter, TemplateStore};
use crate::types::{NewTemplate, Template, TemplateId, TemplateRef};

/// Registry of infrastructure templates.
#[derive(Clone)]
pub struct TemplateRegistry {
    store: Arc<dyn TemplateStore>,
}

impl TemplateRegistry {
    /// Create a registry over the given store.
    pub fn new(store: Arc<dyn TemplateStore>) -> Self {
        Self { store }
    }

    /// Register a template, or a new version of an existing one.
    ///
    /// Fails with [`ControlError::Schema`] if the variable schema is not
    /// self-consistent.
    #[instrument(skip(self, template), fields(name = %template.name))]
    pub async fn register(&self, template: NewTemplate) -> ControlResult<TemplateRef> {
        if template.name.trim().is_empty() {
            return Err(ControlError::schema("template name must not be empty"));
        }
        if template.body.trim().is_empty() {
            return Err(ControlError::schema("template body must not be empty"));
        }
        validate_schema(&template.variables, &template.body)?;

        let id = template.id.unwrap_or_else(TemplateId::generate);
        let version = match self.store.template_versions(&id).await?.last() {
            Some(latest) => latest + 1,
            None => 1,
        };

        let stored = Template {
            id,
            version,
            name: template.name,
            provider: template.provider,
            service_type: template.service_type,
            description: template.description,
            body: template.body,
            variables: template.variables,
            created_at: Utc::now(),
        };

        // A concurrent registration may have claimed this version first.
        self.store
            .insert_template(&stored)
            .await
            .map_err(|e| match e {
                ControlError::AlreadyExists(what) => {
                    ControlError::conflict(format!("{what} was registered concurrently"))
                }
                other => other,
            })?;

        let reference = stored.reference();
        info!(
            template = %reference,
            provider = %stored.provider,
            variables = stored.variables.len(),
            "template registered"
        );
        Ok(reference)
    }

    /// Fetch a template version, or the latest when `version` is `None`.
    pub async fn get(&self, id: &TemplateId, version: Option<u32>) -> ControlResult<Template> {
        self.store
            .get_template(id, version)
            .await?
            .ok_or_else(|| match version {
                Some(v) => ControlError::TemplateNotFound(format!("{id}@{v}")),
                None => ControlError::TemplateNotFound(id.to_string()),
            })
    }

    /// Latest version of each template matching the filter.
    pub async fn list(&self, filter: &TemplateFilter) -> ControlResult<Vec<Template>> {
        self.store.list_templates(filter).await
    }

    /// Every registered version of a template, ascending.
    pub async fn versions(&self, id: &TemplateId) -> ControlResult<Vec<u32>> {
        let versions = self.store.template_versions(id).await?;
        if versions.is_empty() {
            return Err(ControlError::TemplateNotFound(id.to_string()));
        }
        Ok(versions)
    }
}

impl std::fmt::Debug for TemplateRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateRegistry").finish_non_exhaustive()
    }
}
