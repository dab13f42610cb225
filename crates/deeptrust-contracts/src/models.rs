use indexmap::IndexMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub name: String,
    pub provider: String,
    pub capabilities: Vec<String>,
    pub context_window: Option<u64>,
}

impl ModelSpec {
    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|item| item == capability)
    }
}

#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: IndexMap<String, ModelSpec>,
}

impl ModelRegistry {
    pub fn new(models: Option<IndexMap<String, ModelSpec>>) -> Self {
        Self {
            models: models.unwrap_or_else(default_models),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ModelSpec> {
        self.models.get(name)
    }

    pub fn list(&self) -> impl Iterator<Item = &ModelSpec> {
        self.models.values()
    }

    pub fn by_capability(&self, capability: &str, provider: Option<&str>) -> Vec<ModelSpec> {
        self.models
            .values()
            .filter(|model| model.supports(capability))
            .filter(|model| provider.map(|name| model.provider == name).unwrap_or(true))
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSelection {
    pub model: ModelSpec,
    pub requested: Option<String>,
    pub fallback_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ModelSelector {
    pub registry: ModelRegistry,
}

impl ModelSelector {
    pub fn new(registry: Option<ModelRegistry>) -> Self {
        Self {
            registry: registry.unwrap_or_else(|| ModelRegistry::new(None)),
        }
    }

    /// Resolve the model for an analysis. A requested model wins when it
    /// supports the media capability; otherwise the first registered model
    /// for the capability (optionally restricted to a provider) is used
    /// and the fallback is explained.
    pub fn select(
        &self,
        requested: Option<&str>,
        provider: Option<&str>,
        capability: &str,
    ) -> Result<ModelSelection, String> {
        let (fallback_reason, requested_text) = if let Some(requested_value) = requested {
            if let Some(model) = self.registry.get(requested_value) {
                if model.supports(capability)
                    && provider.map(|name| model.provider == name).unwrap_or(true)
                {
                    return Ok(ModelSelection {
                        model: model.clone(),
                        requested: Some(requested_value.to_string()),
                        fallback_reason: None,
                    });
                }
            }
            (
                Some(format!(
                    "Requested model '{requested_value}' unavailable for media type '{capability}'."
                )),
                Some(requested_value.to_string()),
            )
        } else {
            (Some("No model specified; using default.".to_string()), None)
        };

        let candidates = self.registry.by_capability(capability, provider);
        let Some(model) = candidates.first().cloned() else {
            return Err(format!("No models available for media type '{capability}'."));
        };
        Ok(ModelSelection {
            model,
            requested: requested_text,
            fallback_reason,
        })
    }
}

fn default_models() -> IndexMap<String, ModelSpec> {
    let mut map = IndexMap::new();

    let mut insert = |name: &str,
                      provider: &str,
                      capabilities: &[&str],
                      context_window: Option<u64>| {
        map.insert(
            name.to_string(),
            ModelSpec {
                name: name.to_string(),
                provider: provider.to_string(),
                capabilities: capabilities
                    .iter()
                    .map(|item| (*item).to_string())
                    .collect(),
                context_window,
            },
        );
    };

    insert(
        "google/gemini-2.0-flash-001",
        "openrouter",
        &["image", "video", "audio"],
        Some(1_000_000),
    );
    insert(
        "qwen/qwen2.5-vl-72b-instruct",
        "openrouter",
        &["image", "video"],
        Some(128_000),
    );
    insert(
        "openai/gpt-4o-mini",
        "openrouter",
        &["image"],
        Some(128_000),
    );
    insert(
        "gemini-2.0-flash",
        "gemini",
        &["image", "video", "audio"],
        Some(1_000_000),
    );
    insert(
        "gemini-2.5-pro",
        "gemini",
        &["image", "video", "audio"],
        Some(1_000_000),
    );
    insert("dryrun-forensic-1", "dryrun", &["image", "video", "audio"], None);

    map
}

#[cfg(test)]
mod tests {
    use indexmap::IndexMap;

    use super::{ModelRegistry, ModelSelector, ModelSpec};

    fn vision_model(name: &str, provider: &str) -> ModelSpec {
        ModelSpec {
            name: name.to_string(),
            provider: provider.to_string(),
            capabilities: vec!["image".to_string()],
            context_window: None,
        }
    }

    #[test]
    fn selector_honors_requested_model() {
        let selection = ModelSelector::new(None)
            .select(Some("gemini-2.0-flash"), None, "image")
            .unwrap();
        assert_eq!(selection.model.name, "gemini-2.0-flash");
        assert_eq!(selection.fallback_reason, None);
    }

    #[test]
    fn selector_falls_back_when_requested_model_unavailable() {
        let mut models = IndexMap::new();
        models.insert(
            "fallback-vision".to_string(),
            vision_model("fallback-vision", "openrouter"),
        );
        let selection = ModelSelector::new(Some(ModelRegistry::new(Some(models))))
            .select(Some("missing"), None, "image")
            .unwrap();
        assert_eq!(selection.model.name, "fallback-vision");
        assert_eq!(selection.requested.as_deref(), Some("missing"));
        assert_eq!(
            selection.fallback_reason.as_deref(),
            Some("Requested model 'missing' unavailable for media type 'image'.")
        );
    }

    #[test]
    fn selector_restricts_to_provider() {
        let mut models = IndexMap::new();
        models.insert(
            "router-vision".to_string(),
            vision_model("router-vision", "openrouter"),
        );
        models.insert(
            "native-vision".to_string(),
            vision_model("native-vision", "gemini"),
        );
        let selection = ModelSelector::new(Some(ModelRegistry::new(Some(models))))
            .select(None, Some("gemini"), "image")
            .unwrap();
        assert_eq!(selection.model.name, "native-vision");
        assert_eq!(
            selection.fallback_reason.as_deref(),
            Some("No model specified; using default.")
        );
    }

    #[test]
    fn selector_errors_when_capability_unserved() {
        let mut models = IndexMap::new();
        models.insert(
            "image-only".to_string(),
            vision_model("image-only", "openrouter"),
        );
        let err = ModelSelector::new(Some(ModelRegistry::new(Some(models))))
            .select(None, None, "audio")
            .err()
            .unwrap_or_default();
        assert_eq!(err, "No models available for media type 'audio'.");
    }

    #[test]
    fn default_registry_serves_every_media_type() {
        let registry = ModelRegistry::new(None);
        for capability in ["image", "video", "audio"] {
            assert!(
                !registry.by_capability(capability, None).is_empty(),
                "no default model for {capability}"
            );
        }
    }
}
