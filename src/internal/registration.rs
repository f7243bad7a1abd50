/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The entity model: providers, delivery points, notifications and per-push
//! results.
//!
//! A [`PushServiceProvider`] holds the vendor-side credentials for one
//! application; a [`DeliveryPoint`] is one endpoint on one device. Both split
//! their attributes into identity-contributing `fixed_data` and mutable
//! `volatile_data`; the name of an entity is a stable digest of the fixed
//! half, so two entities with identical fixed data are the same entity and
//! credential rotation never changes a name.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::PushError;

pub const ATTR_SERVICE: &str = "service";
pub const ATTR_SUBSCRIBER: &str = "subscriber";
pub const ATTR_PUSH_SERVICE_TYPE: &str = "pushservicetype";

fn fixed_data_digest(service_type: Option<&str>, fixed: &BTreeMap<String, String>) -> String {
    let mut hash = Sha256::new();
    for (k, v) in fixed {
        hash.update(k.as_bytes());
        hash.update(b"=");
        hash.update(v.as_bytes());
        hash.update(b"\n");
    }
    format!(
        "{}:{}",
        service_type.unwrap_or("unknown"),
        hex::encode(hash.finalize())
    )
}

/// Vendor-side credentials for one (service, vendor) pair.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushServiceProvider {
    pub fixed_data: BTreeMap<String, String>,
    pub volatile_data: BTreeMap<String, String>,
}

impl PushServiceProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(&self) -> String {
        fixed_data_digest(self.push_service_type(), &self.fixed_data)
    }

    pub fn push_service_type(&self) -> Option<&str> {
        self.fixed_data.get(ATTR_PUSH_SERVICE_TYPE).map(String::as_str)
    }

    pub fn service(&self) -> Option<&str> {
        self.fixed_data.get(ATTR_SERVICE).map(String::as_str)
    }
}

/// One delivery endpoint on one device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryPoint {
    pub fixed_data: BTreeMap<String, String>,
    pub volatile_data: BTreeMap<String, String>,
}

impl DeliveryPoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(&self) -> String {
        fixed_data_digest(self.push_service_type(), &self.fixed_data)
    }

    pub fn push_service_type(&self) -> Option<&str> {
        self.fixed_data.get(ATTR_PUSH_SERVICE_TYPE).map(String::as_str)
    }

    pub fn service(&self) -> Option<&str> {
        self.fixed_data.get(ATTR_SERVICE).map(String::as_str)
    }

    pub fn subscriber(&self) -> Option<&str> {
        self.fixed_data.get(ATTR_SUBSCRIBER).map(String::as_str)
    }
}

/// The message to deliver, a flat string map under the submitter's control.
/// `Clone` is deep; per-delivery-point substitutions always mutate a clone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub data: BTreeMap<String, String>,
}

impl Notification {
    pub fn new() -> Self {
        Self::default()
    }
}

/// The outcome of one delivery attempt, as reported by an adapter.
#[derive(Debug)]
pub struct PushResult {
    pub provider: Option<PushServiceProvider>,
    pub destination: Option<DeliveryPoint>,
    pub content: Option<Notification>,
    pub msg_id: Option<String>,
    pub err: Option<PushError>,
}

impl PushResult {
    pub fn is_error(&self) -> bool {
        self.err.is_some()
    }
}

impl std::fmt::Display for PushResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let provider = self.provider.as_ref().map_or_else(|| "Unknown".to_string(), |p| p.name());
        let destination = self
            .destination
            .as_ref()
            .map_or_else(|| "Unknown".to_string(), |d| d.name());
        match &self.err {
            None => write!(
                f,
                "PushServiceProvider={} DeliveryPoint={} MsgId={} Success!",
                provider,
                destination,
                self.msg_id.as_deref().unwrap_or("")
            ),
            Some(err) => write!(
                f,
                "Failed PushServiceProvider={} DeliveryPoint={} {}",
                provider, destination, err
            ),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn provider(sender: &str) -> PushServiceProvider {
        let mut psp = PushServiceProvider::new();
        psp.fixed_data.insert(ATTR_PUSH_SERVICE_TYPE.into(), "c2dm".into());
        psp.fixed_data.insert(ATTR_SERVICE.into(), "myservice".into());
        psp.fixed_data.insert("senderid".into(), sender.into());
        psp.volatile_data.insert("authtoken".into(), "tok-1".into());
        psp
    }

    #[test]
    fn name_is_stable_over_fixed_data() {
        let a = provider("sender@example.com");
        let b = provider("sender@example.com");
        assert_eq!(a.name(), b.name());
        let c = provider("other@example.com");
        assert_ne!(a.name(), c.name());
    }

    #[test]
    fn volatile_mutation_never_changes_the_name() {
        let mut psp = provider("sender@example.com");
        let before = psp.name();
        psp.volatile_data.insert("authtoken".into(), "tok-2".into());
        assert_eq!(before, psp.name());
    }

    #[test]
    fn name_carries_the_service_type_prefix() {
        let psp = provider("sender@example.com");
        assert!(psp.name().starts_with("c2dm:"));
    }

    #[test]
    fn notification_clone_is_deep() {
        let mut original = Notification::new();
        original.data.insert("msg".into(), "hello".into());
        let mut copy = original.clone();
        copy.data.insert("msg".into(), "mutated".into());
        copy.data.insert("extra".into(), "1".into());
        assert_eq!(original.data.get("msg").unwrap(), "hello");
        assert!(!original.data.contains_key("extra"));
    }

    #[test]
    fn entity_construction_round_trips_through_serialization() {
        let psp = provider("sender@example.com");
        let encoded = serde_json::to_string(&psp).unwrap();
        let decoded: PushServiceProvider = serde_json::from_str(&encoded).unwrap();
        assert_eq!(psp.fixed_data, decoded.fixed_data);
        assert_eq!(psp.name(), decoded.name());
    }
}
