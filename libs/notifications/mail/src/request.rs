//! Inbound mail request model and payload validation.

use crate::branding::BrandingOverride;
use crate::error::MailError;
use lettre::Address;
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Registered templates
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
    strum::EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TemplateName {
    EmailVerification,
    EmailChangeVerification,
    ForgotPasswordVerification,
}

impl TemplateName {
    /// Asset base name, `<name>.html` / `<name>.json`
    pub fn asset_name(&self) -> &str {
        self.as_ref()
    }

    /// Fixed subject line
    pub fn subject(&self) -> &'static str {
        match self {
            TemplateName::EmailVerification => "Verify your email address",
            TemplateName::EmailChangeVerification => "Confirm your new email address",
            TemplateName::ForgotPasswordVerification => "Reset your password",
        }
    }

    /// Variables a request must supply
    pub fn required_variables(&self) -> &'static [&'static str] {
        match self {
            TemplateName::EmailVerification
            | TemplateName::EmailChangeVerification
            | TemplateName::ForgotPasswordVerification => &["username", "verification_code"],
        }
    }
}

const TEMPLATE_NAME: &str = "template_name";
const RECIPIENT: &str = "recipient";
const BRANDING: &str = "branding";
const LEGACY_BRANDING: &str = "branding_config";

/// A validated mail job. Construct with [`MailRequest::parse`] or [`MailRequest::new`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailRequest {
    template_name: TemplateName,
    recipient: Address,
    variables: BTreeMap<String, String>,
    branding: Option<BrandingOverride>,
}

impl MailRequest {
    /// Build a request from typed parts, enforcing the template's required variables.
    pub fn new(
        template_name: TemplateName,
        recipient: Address,
        variables: BTreeMap<String, String>,
        branding: Option<BrandingOverride>,
    ) -> Result<Self, MailError> {
        if let Some(missing) = template_name
            .required_variables()
            .iter()
            .find(|key| !variables.contains_key(**key))
        {
            return Err(MailError::MissingVariable {
                template: template_name.to_string(),
                variable: missing.to_string(),
            });
        }

        Ok(Self {
            template_name,
            recipient,
            variables,
            branding,
        })
    }

    /// Parse and validate a raw queue payload.
    pub fn parse(payload: &[u8]) -> Result<Self, MailError> {
        let value: Value = serde_json::from_slice(payload)
            .map_err(|e| MailError::MalformedPayload(format!("not valid JSON: {e}")))?;

        let Value::Object(mut fields) = value else {
            return Err(MailError::MalformedPayload(
                "expected a JSON object".to_string(),
            ));
        };

        let template_name = match fields.remove(TEMPLATE_NAME) {
            Some(Value::String(name)) => TemplateName::from_str(&name)
                .map_err(|_| MailError::UnknownTemplate(name.clone()))?,
            _ => {
                return Err(MailError::MalformedPayload(
                    "template_name is missing or not a string".to_string(),
                ))
            }
        };

        let recipient = match fields.remove(RECIPIENT) {
            Some(Value::String(recipient)) => parse_recipient(&recipient)?,
            _ => {
                return Err(MailError::MalformedPayload(
                    "recipient is missing or not a string".to_string(),
                ))
            }
        };

        let branding = parse_branding(&mut fields)?;
        let variables = parse_variables(fields)?;

        Self::new(template_name, recipient, variables, branding)
    }

    pub fn template_name(&self) -> TemplateName {
        self.template_name
    }

    pub fn recipient(&self) -> &Address {
        &self.recipient
    }

    /// Domain part of the recipient, the only part of it that is logged
    pub fn recipient_domain(&self) -> &str {
        self.recipient.domain()
    }

    pub fn variables(&self) -> &BTreeMap<String, String> {
        &self.variables
    }

    pub fn branding(&self) -> Option<&BrandingOverride> {
        self.branding.as_ref()
    }
}

/// Surrounding whitespace is rejected rather than trimmed so the address serializes
/// back exactly as received.
fn parse_recipient(recipient: &str) -> Result<Address, MailError> {
    if recipient.trim() != recipient {
        return Err(MailError::InvalidRecipient(
            "surrounding whitespace".to_string(),
        ));
    }
    Address::from_str(recipient).map_err(|e| MailError::InvalidRecipient(e.to_string()))
}

fn parse_branding(fields: &mut Map<String, Value>) -> Result<Option<BrandingOverride>, MailError> {
    let current = fields.remove(BRANDING).filter(|v| !v.is_null());
    let legacy = fields.remove(LEGACY_BRANDING).filter(|v| !v.is_null());

    match current.or(legacy) {
        None => Ok(None),
        Some(value @ Value::Object(_)) => serde_json::from_value(value)
            .map(Some)
            .map_err(|e| MailError::MalformedPayload(format!("invalid branding: {e}"))),
        Some(_) => Err(MailError::MalformedPayload(
            "branding must be an object".to_string(),
        )),
    }
}

fn parse_variables(fields: Map<String, Value>) -> Result<BTreeMap<String, String>, MailError> {
    fields
        .into_iter()
        .map(|(key, value)| match value {
            Value::String(s) => Ok((key, s)),
            _ => Err(MailError::MalformedPayload(format!(
                "variable '{key}' must be a string"
            ))),
        })
        .collect()
}

impl Serialize for MailRequest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let extra = usize::from(self.branding.is_some());
        let mut map = serializer.serialize_map(Some(2 + self.variables.len() + extra))?;
        map.serialize_entry(TEMPLATE_NAME, &self.template_name)?;
        map.serialize_entry(RECIPIENT, AsRef::<str>::as_ref(&self.recipient))?;
        for (key, value) in &self.variables {
            map.serialize_entry(key, value)?;
        }
        if let Some(branding) = &self.branding {
            map.serialize_entry(BRANDING, branding)?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use strum::IntoEnumIterator;

    fn parse(value: Value) -> Result<MailRequest, MailError> {
        MailRequest::parse(value.to_string().as_bytes())
    }

    fn verification() -> Value {
        json!({
            "template_name": "email_verification",
            "recipient": "user@example.com",
            "username": "John Doe",
            "verification_code": "123456"
        })
    }

    #[test]
    fn test_parse_valid_payload() {
        let request = parse(verification()).unwrap();
        assert_eq!(request.template_name(), TemplateName::EmailVerification);
        assert_eq!(request.recipient().to_string(), "user@example.com");
        assert_eq!(request.recipient_domain(), "example.com");
        assert_eq!(request.variables()["username"], "John Doe");
        assert_eq!(request.variables()["verification_code"], "123456");
        assert!(request.branding().is_none());
    }

    #[test]
    fn test_round_trip_preserves_fields() {
        let mut payload = verification();
        payload["branding"] = json!({ "app_name": "Globex" });
        payload["extra"] = json!("kept");

        let request = parse(payload.clone()).unwrap();
        let serialized = serde_json::to_value(&request).unwrap();
        assert_eq!(serialized, payload);
        assert_eq!(parse(serialized).unwrap(), request);
    }

    #[test]
    fn test_unknown_template_beats_other_errors() {
        let request = parse(json!({
            "template_name": "invoice_receipt",
            "recipient": "not an address",
            "count": 3
        }));
        assert_eq!(
            request.unwrap_err(),
            MailError::UnknownTemplate("invoice_receipt".into())
        );
    }

    #[test]
    fn test_every_registered_name_parses() {
        for name in TemplateName::iter() {
            let mut payload = verification();
            payload["template_name"] = json!(name.to_string());
            assert_eq!(parse(payload).unwrap().template_name(), name);
        }
    }

    #[test]
    fn test_malformed_payloads() {
        let cases = [
            MailRequest::parse(b"not json"),
            MailRequest::parse(b"[1, 2, 3]"),
            parse(json!({ "recipient": "user@example.com" })),
            parse(json!({ "template_name": 7, "recipient": "user@example.com" })),
            parse(json!({ "template_name": "email_verification" })),
        ];
        for case in cases {
            assert!(matches!(case, Err(MailError::MalformedPayload(_))), "{case:?}");
        }
    }

    #[test]
    fn test_non_string_variable_is_malformed() {
        let mut payload = verification();
        payload["verification_code"] = json!(123456);
        assert!(matches!(
            parse(payload),
            Err(MailError::MalformedPayload(msg)) if msg.contains("verification_code")
        ));
    }

    #[test]
    fn test_invalid_recipient() {
        let mut payload = verification();
        payload["recipient"] = json!("user-at-example.com");
        assert!(matches!(parse(payload), Err(MailError::InvalidRecipient(_))));
    }

    #[test]
    fn test_invalid_recipient_error_hides_address() {
        let mut payload = verification();
        payload["recipient"] = json!("secret-person@");
        let err = parse(payload).unwrap_err();
        assert!(!err.to_string().contains("secret-person"));
    }

    #[test]
    fn test_missing_variable() {
        let mut payload = verification();
        payload.as_object_mut().unwrap().remove("verification_code");
        assert_eq!(
            parse(payload).unwrap_err(),
            MailError::MissingVariable {
                template: "email_verification".into(),
                variable: "verification_code".into(),
            }
        );
    }

    #[test]
    fn test_legacy_branding_key() {
        let mut payload = verification();
        payload["branding_config"] = json!({ "app_name": "Legacy" });
        let request = parse(payload).unwrap();
        assert_eq!(
            request.branding().and_then(|b| b.app_name.as_deref()),
            Some("Legacy")
        );
        assert!(!request.variables().contains_key("branding_config"));
    }

    #[test]
    fn test_branding_must_be_object_of_strings() {
        let mut payload = verification();
        payload["branding"] = json!("blue");
        assert!(matches!(parse(payload), Err(MailError::MalformedPayload(_))));

        let mut payload = verification();
        payload["branding"] = json!({ "primary_color": 255 });
        assert!(matches!(parse(payload), Err(MailError::MalformedPayload(_))));
    }

    #[test]
    fn test_null_branding_is_absent() {
        let mut payload = verification();
        payload["branding"] = Value::Null;
        assert!(parse(payload).unwrap().branding().is_none());
    }

    #[test]
    fn test_null_branding_does_not_hide_legacy_key() {
        let mut payload = verification();
        payload["branding"] = Value::Null;
        payload["branding_config"] = json!({ "app_name": "Legacy" });

        let request = parse(payload).unwrap();
        assert_eq!(
            request.branding().and_then(|b| b.app_name.as_deref()),
            Some("Legacy")
        );
    }

    #[test]
    fn test_padded_recipient_is_rejected() {
        for padded in [" user@example.com ", "user@example.com\n", "\tuser@example.com"] {
            let mut payload = verification();
            payload["recipient"] = json!(padded);
            assert_eq!(
                parse(payload).unwrap_err(),
                MailError::InvalidRecipient("surrounding whitespace".into())
            );
        }
    }

    #[test]
    fn test_serialized_recipient_matches_input() {
        let request = parse(verification()).unwrap();
        let serialized = serde_json::to_value(&request).unwrap();
        assert_eq!(serialized["recipient"], verification()["recipient"]);
    }

    #[test]
    fn test_subjects_are_fixed() {
        assert_eq!(
            TemplateName::EmailVerification.subject(),
            "Verify your email address"
        );
        for name in TemplateName::iter() {
            assert!(!name.subject().is_empty());
            assert_eq!(
                name.required_variables(),
                &["username", "verification_code"]
            );
        }
    }
}
