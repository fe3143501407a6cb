//! Variable schema validation and template rendering.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::error::{ControlError, ControlResult};
use crate::types::{hex_digest, CloudProvider, Template, TemplateId, VariableSpec, Variables};

static VAR_REFERENCE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\bvar\.([A-Za-z_][A-Za-z0-9_]*)").ok());

static VAR_NAME: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").ok());

/// Check that a variable schema is self-consistent and covers the body.
///
/// Rejects empty or malformed names, duplicates, defaults whose type does
/// not match the declared type, and `var.<name>` references in the body
/// that no variable declares.
pub fn validate_schema(variables: &[VariableSpec], body: &str) -> ControlResult<()> {
    let (Some(name_pattern), Some(reference_pattern)) = (VAR_NAME.as_ref(), VAR_REFERENCE.as_ref())
    else {
        return Err(ControlError::internal("variable patterns failed to compile"));
    };

    let mut seen = HashSet::new();

    for spec in variables {
        if !name_pattern.is_match(&spec.name) {
            return Err(ControlError::schema(format!(
                "invalid variable name '{}'",
                spec.name
            )));
        }
        if !seen.insert(spec.name.as_str()) {
            return Err(ControlError::schema(format!(
                "variable '{}' is declared more than once",
                spec.name
            )));
        }
        if let Some(default) = &spec.default {
            if !spec.var_type.matches(default) {
                return Err(ControlError::schema(format!(
                    "default for variable '{}' is not a {}",
                    spec.name, spec.var_type
                )));
            }
        }
    }

    for capture in reference_pattern.captures_iter(body) {
        let name = &capture[1];
        if !seen.contains(name) {
            return Err(ControlError::schema(format!(
                "template body references undeclared variable '{name}'"
            )));
        }
    }

    Ok(())
}

/// Validate supplied values against a schema and fill in defaults.
///
/// Every problem is collected so the caller sees them all at once.
pub fn resolve_variables(
    specs: &[VariableSpec],
    supplied: &Variables,
) -> ControlResult<Variables> {
    let mut problems = Vec::new();
    let mut resolved = Variables::new();

    for name in supplied.keys() {
        if !specs.iter().any(|s| &s.name == name) {
            problems.push(format!("unknown variable '{name}'"));
        }
    }

    for spec in specs {
        match supplied.get(&spec.name) {
            Some(value) if spec.var_type.matches(value) => {
                resolved.insert(spec.name.clone(), value.clone());
            }
            Some(_) => problems.push(format!(
                "variable '{}' must be a {}",
                spec.name, spec.var_type
            )),
            None => match &spec.default {
                Some(default) => {
                    resolved.insert(spec.name.clone(), default.clone());
                }
                None if spec.required => {
                    problems.push(format!("missing required variable '{}'", spec.name));
                }
                None => {}
            },
        }
    }

    if problems.is_empty() {
        Ok(resolved)
    } else {
        Err(ControlError::validation(problems.join("; ")))
    }
}

/// A template version bound to validated variable values, ready for an
/// engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderedTemplate {
    /// Template identifier.
    pub template_id: TemplateId,
    /// Template version.
    pub template_version: u32,
    /// Provider the template targets.
    pub provider: CloudProvider,
    /// Infrastructure definition.
    pub body: String,
    /// Resolved variables, defaults included.
    pub variables: Variables,
}

impl RenderedTemplate {
    /// Digest of template id, version and resolved variables.
    ///
    /// Two renders with the same digest would produce the same plan, which
    /// is what apply checks against the stored snapshot.
    #[must_use]
    pub fn inputs_digest(&self) -> String {
        let bytes = serde_json::to_vec(&(
            self.template_id.as_str(),
            self.template_version,
            &self.variables,
        ))
        .unwrap_or_default();
        hex_digest(&bytes)
    }
}

/// Bind supplied variables to a template.
pub fn render(template: &Template, supplied: &Variables) -> ControlResult<RenderedTemplate> {
    let variables = resolve_variables(&template.variables, supplied)?;
    Ok(RenderedTemplate {
        template_id: template.id.clone(),
        template_version: template.version,
        provider: template.provider,
        body: template.body.clone(),
        variables,
    })
}
