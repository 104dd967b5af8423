//! Fully-resolved input for provisioning one instance.

use serde_json::{Map, Value};
use stratos_templates::RenderedJobInstance;

use crate::network::NetworkReservation;
use crate::types::InstanceIdentity;

/// Desired state of one instance, resolved by the deployment planner.
#[derive(Debug, Clone, PartialEq)]
pub struct InstancePlan {
    /// Which instance this is.
    pub instance: InstanceIdentity,
    /// Base image to boot.
    pub stemcell_cid: String,
    /// VM type cloud properties.
    pub cloud_properties: Map<String, Value>,
    /// Env overrides, deep-merged over the configured defaults.
    pub env: Map<String, Value>,
    /// Resolved network reservations.
    pub network_reservations: Vec<NetworkReservation>,
    /// PEM bundle of trusted CA certificates.
    pub trusted_certs: String,
    /// Extra fields for the instance's durable spec (for example `vm_type`).
    pub apply_spec: Option<Map<String, Value>>,
    /// Rendered job templates, when the instance has jobs.
    pub rendered_templates: Option<RenderedJobInstance>,
}

impl InstancePlan {
    /// A plan with no networks, env, or templates.
    #[must_use]
    pub fn new(instance: InstanceIdentity, stemcell_cid: impl Into<String>) -> Self {
        Self {
            instance,
            stemcell_cid: stemcell_cid.into(),
            cloud_properties: Map::new(),
            env: Map::new(),
            network_reservations: Vec::new(),
            trusted_certs: String::new(),
            apply_spec: None,
            rendered_templates: None,
        }
    }

    /// Set the VM type cloud properties.
    #[must_use]
    pub fn with_cloud_properties(mut self, cloud_properties: Map<String, Value>) -> Self {
        self.cloud_properties = cloud_properties;
        self
    }

    /// Set the env overrides.
    #[must_use]
    pub fn with_env(mut self, env: Map<String, Value>) -> Self {
        self.env = env;
        self
    }

    /// Add a network reservation.
    #[must_use]
    pub fn with_network(mut self, reservation: NetworkReservation) -> Self {
        self.network_reservations.push(reservation);
        self
    }

    /// Set the trusted certificates.
    #[must_use]
    pub fn with_trusted_certs(mut self, trusted_certs: impl Into<String>) -> Self {
        self.trusted_certs = trusted_certs.into();
        self
    }

    /// Set the extra spec fields.
    #[must_use]
    pub fn with_apply_spec(mut self, apply_spec: Map<String, Value>) -> Self {
        self.apply_spec = Some(apply_spec);
        self
    }

    /// Set the rendered templates.
    #[must_use]
    pub fn with_rendered_templates(mut self, rendered: RenderedJobInstance) -> Self {
        self.rendered_templates = Some(rendered);
        self
    }
}
