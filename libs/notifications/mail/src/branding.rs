//! Branding values injected into every template.

use core_config::{env_or_default, env_required, ConfigError, FromEnv};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Process-wide branding defaults
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrandingConfig {
    pub app_name: String,
    pub app_owner: String,
    pub contact_email: String,
    pub logo_url: String,
    pub primary_color: String,
    pub primary_shade_color: String,
    pub primary_foreground_color: String,
}

impl BrandingConfig {
    pub fn new(
        app_name: impl Into<String>,
        app_owner: impl Into<String>,
        contact_email: impl Into<String>,
    ) -> Self {
        Self {
            app_name: app_name.into(),
            app_owner: app_owner.into(),
            contact_email: contact_email.into(),
            logo_url: String::new(),
            primary_color: "#2563eb".to_string(),
            primary_shade_color: "#1d4ed8".to_string(),
            primary_foreground_color: "#ffffff".to_string(),
        }
    }

    /// Effective branding: `overrides` replace configured values field by field.
    pub fn merged(&self, overrides: Option<&BrandingOverride>) -> BrandingConfig {
        let Some(o) = overrides else {
            return self.clone();
        };

        let pick = |value: &Option<String>, default: &String| {
            value.clone().unwrap_or_else(|| default.clone())
        };

        BrandingConfig {
            app_name: pick(&o.app_name, &self.app_name),
            app_owner: pick(&o.app_owner, &self.app_owner),
            contact_email: pick(&o.contact_email, &self.contact_email),
            logo_url: pick(&o.logo_url, &self.logo_url),
            primary_color: pick(&o.primary_color, &self.primary_color),
            primary_shade_color: pick(&o.primary_shade_color, &self.primary_shade_color),
            primary_foreground_color: pick(
                &o.primary_foreground_color,
                &self.primary_foreground_color,
            ),
        }
    }

    /// Template variables contributed by branding
    pub fn to_variables(&self) -> BTreeMap<String, String> {
        [
            ("app_name", &self.app_name),
            ("app_owner", &self.app_owner),
            ("contact_email", &self.contact_email),
            ("logo_url", &self.logo_url),
            ("primary_color", &self.primary_color),
            ("primary_shade_color", &self.primary_shade_color),
            ("primary_foreground_color", &self.primary_foreground_color),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
    }
}

impl FromEnv for BrandingConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            app_name: env_required("APP_NAME")?,
            app_owner: env_required("APP_OWNER")?,
            contact_email: env_required("CONTACT_EMAIL")?,
            logo_url: env_or_default("LOGO_URL", ""),
            primary_color: env_or_default("PRIMARY_COLOR", "#2563eb"),
            primary_shade_color: env_or_default("PRIMARY_SHADE_COLOR", "#1d4ed8"),
            primary_foreground_color: env_or_default("PRIMARY_FOREGROUND_COLOR", "#ffffff"),
        })
    }
}

/// Per-request branding; only the supplied fields override the defaults
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrandingOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logo_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_shade_color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_foreground_color: Option<String>,
}
