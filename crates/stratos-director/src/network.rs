//! Network settings passed to the cloud driver and the agent.

use std::collections::BTreeMap;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// How an address was reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationKind {
    /// Address chosen by the infrastructure at boot.
    #[default]
    Dynamic,
    /// Address allocated from a manual subnet.
    Manual,
    /// Externally routed virtual IP.
    Vip,
}

/// A resolved network reservation for one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkReservation {
    /// Network name from the deployment.
    pub network_name: String,
    /// Reservation kind.
    #[serde(default)]
    pub kind: ReservationKind,
    /// Reserved address; absent for dynamic networks.
    pub ip: Option<IpAddr>,
    /// Subnet mask.
    pub netmask: Option<String>,
    /// Gateway address.
    pub gateway: Option<IpAddr>,
    /// DNS servers.
    #[serde(default)]
    pub dns: Vec<IpAddr>,
    /// Infrastructure-specific subnet properties.
    #[serde(default)]
    pub cloud_properties: Map<String, Value>,
    /// Properties (`dns`, `gateway`) this network is the default for.
    #[serde(default)]
    pub default_for: Vec<String>,
}

impl NetworkReservation {
    /// A dynamic reservation on the named network.
    #[must_use]
    pub fn dynamic(network_name: impl Into<String>) -> Self {
        Self {
            network_name: network_name.into(),
            kind: ReservationKind::Dynamic,
            ip: None,
            netmask: None,
            gateway: None,
            dns: Vec::new(),
            cloud_properties: Map::new(),
            default_for: Vec::new(),
        }
    }

    /// A manual reservation of a static address.
    #[must_use]
    pub fn manual(network_name: impl Into<String>, ip: IpAddr, netmask: impl Into<String>) -> Self {
        Self {
            kind: ReservationKind::Manual,
            ip: Some(ip),
            netmask: Some(netmask.into()),
            ..Self::dynamic(network_name)
        }
    }

    /// Set the gateway.
    #[must_use]
    pub const fn with_gateway(mut self, gateway: IpAddr) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Set the DNS servers.
    #[must_use]
    pub fn with_dns(mut self, dns: Vec<IpAddr>) -> Self {
        self.dns = dns;
        self
    }

    /// Mark this network as the default for the given properties.
    #[must_use]
    pub fn with_default_for<I, S>(mut self, properties: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.default_for = properties.into_iter().map(Into::into).collect();
        self
    }
}

/// Settings for a single network as the agent sees them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSetting {
    /// `dynamic` or `vip`; omitted for manual networks.
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<IpAddr>,
    /// Subnet mask.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub netmask: Option<String>,
    /// Gateway.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<IpAddr>,
    /// DNS servers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns: Vec<IpAddr>,
    /// Subnet cloud properties.
    #[serde(default)]
    pub cloud_properties: Map<String, Value>,
    /// Properties this network is the default for.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub default: Vec<String>,
}

impl From<&NetworkReservation> for NetworkSetting {
    fn from(reservation: &NetworkReservation) -> Self {
        let kind = match reservation.kind {
            ReservationKind::Dynamic => Some("dynamic".to_owned()),
            ReservationKind::Vip => Some("vip".to_owned()),
            ReservationKind::Manual => None,
        };

        Self {
            kind,
            ip: reservation.ip,
            netmask: reservation.netmask.clone(),
            gateway: reservation.gateway,
            dns: reservation.dns.clone(),
            cloud_properties: reservation.cloud_properties.clone(),
            default: reservation.default_for.clone(),
        }
    }
}

/// Name-keyed network settings for one instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NetworkSettings(BTreeMap<String, NetworkSetting>);

impl NetworkSettings {
    /// Build settings from resolved reservations. A later reservation on the
    /// same network replaces an earlier one.
    #[must_use]
    pub fn from_reservations(reservations: &[NetworkReservation]) -> Self {
        Self(
            reservations
                .iter()
                .map(|r| (r.network_name.clone(), NetworkSetting::from(r)))
                .collect(),
        )
    }

    /// Every configured address, in network-name order.
    #[must_use]
    pub fn ips(&self) -> Vec<IpAddr> {
        self.0.values().filter_map(|setting| setting.ip).collect()
    }

    /// Settings for a network.
    #[must_use]
    pub fn get(&self, network_name: &str) -> Option<&NetworkSetting> {
        self.0.get(network_name)
    }

    /// Number of networks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no networks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// JSON form sent to the driver and the agent.
    #[must_use]
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
