//! Resource attached to every exported span, metric and log record.

use opentelemetry::{Key, KeyValue};
use opentelemetry_sdk::Resource;

use crate::config::Settings;
use crate::error::{InitStage, ObservabilityError};

pub const SERVICE_NAME: &str = "service.name";
pub const SERVICE_VERSION: &str = "service.version";
pub const DEPLOYMENT_ENVIRONMENT: &str = "deployment.environment";

/// Immutable service identity plus custom attributes.
///
/// Built once per provider and shared by the trace, metric and log
/// pipelines. The service identity keys always win over a custom attribute
/// with the same key.
#[derive(Debug, Clone)]
pub struct ResourceDescriptor {
    resource: Resource,
}

impl ResourceDescriptor {
    pub fn from_settings(settings: &Settings) -> Result<Self, ObservabilityError> {
        let service = &settings.service;
        if service.name.trim().is_empty() {
            return Err(ObservabilityError::init(
                InitStage::Resource,
                "service name must not be empty",
            ));
        }

        let custom = settings
            .resource_attributes
            .iter()
            .filter(|(key, _)| !key.trim().is_empty())
            .map(|(key, value)| KeyValue::new(key.clone(), value.clone()));

        let identity = [
            KeyValue::new(SERVICE_NAME, service.name.clone()),
            KeyValue::new(SERVICE_VERSION, service.version.clone()),
            KeyValue::new(DEPLOYMENT_ENVIRONMENT, service.environment.clone()),
        ];

        let resource = Resource::builder()
            .with_attributes(custom)
            .with_attributes(identity)
            .build();

        Ok(Self { resource })
    }

    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    /// String form of a resource attribute, if present.
    pub fn get(&self, key: &str) -> Option<String> {
        self.resource
            .get(&Key::from(key.to_string()))
            .map(|value| value.as_str().into_owned())
    }

    pub fn service_name(&self) -> Option<String> {
        self.get(SERVICE_NAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_contains_identity_and_custom_attributes() {
        let settings = Settings::new("orders")
            .with_service_info("orders", "2.3.0", "production")
            .with_resource_attribute("team", "platform")
            .with_resource_attribute("shard", 7);

        let descriptor = ResourceDescriptor::from_settings(&settings).unwrap();

        assert_eq!(descriptor.service_name().as_deref(), Some("orders"));
        assert_eq!(descriptor.get(SERVICE_VERSION).as_deref(), Some("2.3.0"));
        assert_eq!(descriptor.get(DEPLOYMENT_ENVIRONMENT).as_deref(), Some("production"));
        assert_eq!(descriptor.get("team").as_deref(), Some("platform"));
        assert_eq!(descriptor.get("shard").as_deref(), Some("7"));
    }

    #[test]
    fn test_identity_wins_over_custom_attribute() {
        let settings = Settings::new("real-name").with_resource_attribute(SERVICE_NAME, "spoofed");

        let descriptor = ResourceDescriptor::from_settings(&settings).unwrap();
        assert_eq!(descriptor.service_name().as_deref(), Some("real-name"));
    }

    #[test]
    fn test_empty_service_name_is_rejected() {
        let settings = Settings::new("  ");

        let err = ResourceDescriptor::from_settings(&settings).unwrap_err();
        assert_eq!(err.stage(), Some(InitStage::Resource));
    }
}
