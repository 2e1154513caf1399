//! Language-keyed call script selection.
//!
//! Scripts are static templates, not free-form generation: a lookup
//! table keyed by (campaign type, language), externalized as a YAML
//! asset and loaded once at startup. Variable substitution goes through
//! tera.

use std::collections::HashMap;

use serde::Deserialize;
use tera::Tera;
use thiserror::Error;

use crate::scheduler::job::CampaignType;

/// Script asset compiled into the binary.
const SCRIPT_ASSET: &str = include_str!("../../assets/call_scripts.yaml");

/// Errors that can occur during script selection and rendering.
#[derive(Debug, Error)]
pub enum ScriptError {
    /// The asset could not be parsed.
    #[error("Script asset parse error: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// A campaign type has no templates at all. This is a deployment
    /// configuration error, not a per-job condition.
    #[error("No script templates configured for campaign type {0}")]
    MissingCampaign(CampaignType),

    /// A campaign type lacks a template for the default language.
    #[error("Campaign type {campaign} has no '{language}' default-language template")]
    MissingDefaultTemplate {
        campaign: CampaignType,
        language: String,
    },

    /// Template rendering failed.
    #[error("Script rendering failed: {0}")]
    Render(#[from] tera::Error),
}

/// Raw asset shape.
#[derive(Debug, Deserialize)]
struct ScriptAsset {
    default_language: String,
    scripts: HashMap<CampaignType, HashMap<String, String>>,
}

/// Variables available to script templates.
#[derive(Debug, Clone, Default)]
pub struct ScriptContext {
    pub customer_name: Option<String>,
    pub tenant_name: String,
    pub service: Option<String>,
}

/// Lookup table of call scripts by campaign type and language.
#[derive(Debug)]
pub struct ScriptLibrary {
    default_language: String,
    scripts: HashMap<CampaignType, HashMap<String, String>>,
}

impl ScriptLibrary {
    /// Loads the compiled-in script asset.
    pub fn load_default() -> Result<Self, ScriptError> {
        Self::from_yaml(SCRIPT_ASSET)
    }

    /// Parses a script asset and verifies every campaign type carries a
    /// default-language template.
    pub fn from_yaml(yaml: &str) -> Result<Self, ScriptError> {
        let asset: ScriptAsset = serde_yaml::from_str(yaml)?;

        for campaign in CampaignType::ALL {
            let Some(by_language) = asset.scripts.get(&campaign) else {
                return Err(ScriptError::MissingCampaign(campaign));
            };
            if !by_language.contains_key(&asset.default_language) {
                return Err(ScriptError::MissingDefaultTemplate {
                    campaign,
                    language: asset.default_language.clone(),
                });
            }
        }

        Ok(Self {
            default_language: asset.default_language,
            scripts: asset.scripts,
        })
    }

    /// The global default language.
    pub fn default_language(&self) -> &str {
        &self.default_language
    }

    /// Selects the template for (campaign, language).
    ///
    /// An unknown language silently falls back to the default-language
    /// template; a campaign type with no templates is a configuration
    /// error.
    pub fn select(&self, campaign: CampaignType, language: &str) -> Result<&str, ScriptError> {
        let by_language = self
            .scripts
            .get(&campaign)
            .ok_or(ScriptError::MissingCampaign(campaign))?;

        let template = by_language
            .get(language)
            .or_else(|| by_language.get(&self.default_language))
            .ok_or_else(|| ScriptError::MissingDefaultTemplate {
                campaign,
                language: self.default_language.clone(),
            })?;

        Ok(template)
    }

    /// Selects and renders the script for (campaign, language).
    pub fn render(
        &self,
        campaign: CampaignType,
        language: &str,
        ctx: &ScriptContext,
    ) -> Result<String, ScriptError> {
        let template = self.select(campaign, language)?;

        let mut context = tera::Context::new();
        context.insert("customer_name", &ctx.customer_name);
        context.insert("tenant_name", &ctx.tenant_name);
        context.insert("service", &ctx.service);

        let rendered = Tera::one_off(template, &context, false)?;
        // Folded YAML scalars keep single newlines; speech output wants
        // one flat line.
        Ok(rendered.split_whitespace().collect::<Vec<_>>().join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn library() -> ScriptLibrary {
        ScriptLibrary::load_default().expect("bundled asset should load")
    }

    fn ctx() -> ScriptContext {
        ScriptContext {
            customer_name: Some("Anna".to_string()),
            tenant_name: "Salon Zuid".to_string(),
            service: Some("knippen".to_string()),
        }
    }

    #[test]
    fn test_default_asset_loads_and_covers_all_campaigns() {
        let lib = library();
        assert_eq!(lib.default_language(), "nl");
        for campaign in CampaignType::ALL {
            assert!(lib.select(campaign, "nl").is_ok());
        }
    }

    #[test]
    fn test_unknown_language_falls_back_to_default() {
        let lib = library();
        let fallback = lib
            .select(CampaignType::ReviewRequest, "de")
            .expect("fallback should not fail");
        let default = lib
            .select(CampaignType::ReviewRequest, "nl")
            .expect("default should exist");
        assert_eq!(fallback, default);
    }

    #[test]
    fn test_render_substitutes_variables() {
        let lib = library();
        let script = lib
            .render(CampaignType::ReviewRequest, "nl", &ctx())
            .expect("render should succeed");

        assert!(script.contains("Anna"));
        assert!(script.contains("Salon Zuid"));
        assert!(script.contains("knippen"));
        assert!(!script.contains("{{"));
    }

    #[test]
    fn test_render_without_customer_name() {
        let lib = library();
        let script = lib
            .render(
                CampaignType::Reactivation,
                "en",
                &ScriptContext {
                    customer_name: None,
                    tenant_name: "Salon Zuid".to_string(),
                    service: None,
                },
            )
            .expect("render should succeed");

        assert!(script.starts_with("Good afternoon,"));
        assert!(!script.contains("{%"));
    }

    #[test]
    fn test_missing_campaign_is_configuration_error() {
        let yaml = r#"
default_language: nl
scripts:
  REVIEW_REQUEST:
    nl: "tekst"
"#;
        let err = ScriptLibrary::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, ScriptError::MissingCampaign(_)));
    }

    #[test]
    fn test_missing_default_language_template_is_rejected() {
        let yaml = r#"
default_language: nl
scripts:
  REVIEW_REQUEST:
    en: "text"
  REACTIVATION:
    nl: "tekst"
  FOLLOW_UP:
    nl: "tekst"
  PROMOTIONAL:
    nl: "tekst"
  MISSED_CALL_CALLBACK:
    nl: "tekst"
"#;
        let err = ScriptLibrary::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, ScriptError::MissingDefaultTemplate { .. }));
    }
}
