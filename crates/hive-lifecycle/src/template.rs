//! Agent templates.
//!
//! A template fixes the sandbox image, the runtime kind, and shared-folder
//! intent. The catalog is part of service configuration; `create` rejects
//! template names outside it.

use std::collections::HashMap;

use hive_types::RuntimeKind;

/// One template entry.
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateSpec {
    /// Sandbox image reference.
    pub image: String,
    /// Runtime kind the image hosts.
    pub runtime: RuntimeKind,
    /// Whether agents from this template expose a shared folder.
    pub share_expose: bool,
    /// Whether agents from this template consume shared folders.
    pub share_consume: bool,
    /// Extra labels stamped on the container.
    pub extra_labels: HashMap<String, String>,
}

impl Default for TemplateSpec {
    fn default() -> Self {
        Self {
            image: "hive-agent:latest".to_string(),
            runtime: RuntimeKind::SandboxedLlm,
            share_expose: false,
            share_consume: false,
            extra_labels: HashMap::new(),
        }
    }
}

impl TemplateSpec {
    /// The built-in catalog shipped with the control plane.
    pub fn builtin_catalog() -> HashMap<String, TemplateSpec> {
        HashMap::from([
            ("default".to_string(), TemplateSpec::default()),
            (
                "collaborator".to_string(),
                TemplateSpec { share_expose: true, share_consume: true, ..Default::default() },
            ),
            (
                "shell".to_string(),
                TemplateSpec {
                    image: "hive-shell:latest".to_string(),
                    runtime: RuntimeKind::Shell,
                    ..Default::default()
                },
            ),
        ])
    }
}
