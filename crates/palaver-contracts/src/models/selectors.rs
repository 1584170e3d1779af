use super::registry::{ModelRegistry, ModelSpec};

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

    pub fn select(
        &self,
        requested: Option<&str>,
        capability: &str,
    ) -> Result<ModelSelection, String> {
        let (fallback_reason, requested_text) = if let Some(requested_value) = requested {
            if let Some(model) = self.registry.ensure(requested_value, capability) {
                return Ok(ModelSelection {
                    model,
                    requested: Some(requested_value.to_string()),
                    fallback_reason: None,
                });
            }
            (
                Some(format!(
                    "Requested model '{requested_value}' unavailable for capability '{capability}'."
                )),
                Some(requested_value.to_string()),
            )
        } else {
            (Some("No model specified; using default.".to_string()), None)
        };

        let candidates = self.registry.by_capability(capability);
        let Some(model) = candidates.first().cloned() else {
            return Err(format!(
                "No models available for capability '{capability}'."
            ));
        };
        Ok(ModelSelection {
            model,
            requested: requested_text,
            fallback_reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use indexmap::IndexMap;

    use super::super::registry::{ModelRegistry, ModelSpec};
    use super::ModelSelector;

    fn image_model(name: &str) -> ModelSpec {
        ModelSpec {
            name: name.to_string(),
            capabilities: vec!["image".to_string()],
            context_window: None,
        }
    }

    #[test]
    fn selector_falls_back_when_requested_model_unavailable() {
        let mut models = IndexMap::new();
        models.insert("gpt-image-1".to_string(), image_model("gpt-image-1"));
        let selection = ModelSelector::new(Some(ModelRegistry::new(Some(models))))
            .select(Some("missing"), "image")
            .unwrap();
        assert_eq!(selection.model.name, "gpt-image-1");
        assert_eq!(selection.requested.as_deref(), Some("missing"));
        assert_eq!(
            selection.fallback_reason.as_deref(),
            Some("Requested model 'missing' unavailable for capability 'image'.")
        );
    }

    #[test]
    fn selector_without_request_uses_default_with_explanation() {
        let mut models = IndexMap::new();
        models.insert("gpt-image-1".to_string(), image_model("gpt-image-1"));
        let selection = ModelSelector::new(Some(ModelRegistry::new(Some(models))))
            .select(None, "image")
            .unwrap();
        assert_eq!(selection.model.name, "gpt-image-1");
        assert_eq!(
            selection.fallback_reason.as_deref(),
            Some("No model specified; using default.")
        );
    }

    #[test]
    fn selector_errors_when_no_models_match_the_capability() {
        let mut models = IndexMap::new();
        models.insert(
            "text-only".to_string(),
            ModelSpec {
                name: "text-only".to_string(),
                capabilities: vec!["text".to_string()],
                context_window: None,
            },
        );
        let err = ModelSelector::new(Some(ModelRegistry::new(Some(models))))
            .select(Some("gpt-image-1"), "image")
            .err()
            .unwrap_or_default();
        assert_eq!(err, "No models available for capability 'image'.");
    }

    #[test]
    fn selector_honors_registry_order_for_fallback() {
        let mut models = IndexMap::new();
        models.insert("first-image".to_string(), image_model("first-image"));
        models.insert("second-image".to_string(), image_model("second-image"));
        let selection = ModelSelector::new(Some(ModelRegistry::new(Some(models))))
            .select(None, "image")
            .unwrap();
        assert_eq!(selection.model.name, "first-image");
    }
}
