/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The adapter contract and the process-wide adapter registry.
//!
//! Each vendor protocol is one [`PushServiceType`] implementation, registered
//! by name on a [`PushServiceManager`] at startup.

use std::collections::HashMap;
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};

use crate::error::{PushError, Result};
use crate::internal::registration::{
    DeliveryPoint, Notification, PushResult, PushServiceProvider, ATTR_PUSH_SERVICE_TYPE,
};

/// One vendor protocol backend.
///
/// The `push` method is a stream: it drains `dp_chan` until the sender side
/// disconnects, emits zero or one [`PushResult`] per delivery point on
/// `res_chan`, and closes `res_chan` (by dropping the sender) once the input
/// is drained and all in-flight work has settled. Nothing may be sent on
/// `res_chan` after `push` returns; events that arrive later go to the
/// channel registered with [`PushServiceType::set_error_report_chan`].
/// Parallelism inside the adapter is its own business.
pub trait PushServiceType: Send + Sync {
    /// Stable adapter identifier; keys the registry.
    fn name(&self) -> &'static str;

    /// Populates the provider's fixed and volatile data from an input map,
    /// failing with an error that names the first missing key.
    fn build_push_service_provider_from_map(
        &self,
        kv: &HashMap<String, String>,
        provider: &mut PushServiceProvider,
    ) -> Result<()>;

    fn build_delivery_point_from_map(
        &self,
        kv: &HashMap<String, String>,
        delivery_point: &mut DeliveryPoint,
    ) -> Result<()>;

    fn push(
        &self,
        provider: &PushServiceProvider,
        dp_chan: Receiver<DeliveryPoint>,
        res_chan: Sender<PushResult>,
        content: &Notification,
    );

    /// Serializes the notification with a placeholder delivery point. Makes
    /// no network or database calls.
    fn preview(&self, content: &Notification) -> Result<Vec<u8>>;

    /// Long-lived out-of-band channel for events that arise without an active
    /// `push` call.
    fn set_error_report_chan(&self, chan: Sender<PushError>);

    /// Releases pooled resources.
    fn finalize(&self);
}

/// Verifies that a (provider, delivery point) pair belongs to the adapter
/// asking. Every adapter runs this before touching a delivery point.
pub fn check_compatibility(
    provider: &PushServiceProvider,
    destination: &DeliveryPoint,
    service_type: &str,
) -> Result<()> {
    let provider_type = provider.push_service_type().unwrap_or_default();
    let destination_type = destination.push_service_type().unwrap_or_default();
    if provider_type == service_type && destination_type == service_type {
        Ok(())
    } else {
        Err(PushError::Incompatible {
            provider_type: provider_type.to_string(),
            destination_type: destination_type.to_string(),
            service_type: service_type.to_string(),
        })
    }
}

/// Registry of protocol adapters, populated once at startup.
#[derive(Default)]
pub struct PushServiceManager {
    services: HashMap<&'static str, Arc<dyn PushServiceType>>,
}

impl PushServiceManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, service: Arc<dyn PushServiceType>) {
        self.services.insert(service.name(), service);
    }

    pub fn get(&self, name: &str) -> Result<&Arc<dyn PushServiceType>> {
        self.services
            .get(name)
            .ok_or_else(|| PushError::UnknownServiceType(name.to_string()))
    }

    fn service_for_type(&self, service_type: Option<&str>) -> Result<&Arc<dyn PushServiceType>> {
        match service_type {
            Some(name) => self.get(name),
            None => Err(PushError::MissingKey {
                key: ATTR_PUSH_SERVICE_TYPE,
            }),
        }
    }

    /// Builds a provider from an input map, dispatching on the map's
    /// `pushservicetype` key.
    pub fn build_push_service_provider_from_map(
        &self,
        kv: &HashMap<String, String>,
    ) -> Result<PushServiceProvider> {
        let service = self.service_for_type(kv.get(ATTR_PUSH_SERVICE_TYPE).map(String::as_str))?;
        let mut provider = PushServiceProvider::new();
        provider
            .fixed_data
            .insert(ATTR_PUSH_SERVICE_TYPE.to_string(), service.name().to_string());
        service.build_push_service_provider_from_map(kv, &mut provider)?;
        Ok(provider)
    }

    pub fn build_delivery_point_from_map(
        &self,
        kv: &HashMap<String, String>,
    ) -> Result<DeliveryPoint> {
        let service = self.service_for_type(kv.get(ATTR_PUSH_SERVICE_TYPE).map(String::as_str))?;
        let mut delivery_point = DeliveryPoint::new();
        delivery_point
            .fixed_data
            .insert(ATTR_PUSH_SERVICE_TYPE.to_string(), service.name().to_string());
        service.build_delivery_point_from_map(kv, &mut delivery_point)?;
        Ok(delivery_point)
    }

    /// Runs the provider's adapter over the delivery point stream. An unknown
    /// adapter name yields a single error result; the result channel closes
    /// either way.
    pub fn push(
        &self,
        provider: &PushServiceProvider,
        dp_chan: Receiver<DeliveryPoint>,
        res_chan: Sender<PushResult>,
        content: &Notification,
    ) {
        match self.service_for_type(provider.push_service_type()) {
            Ok(service) => service.push(provider, dp_chan, res_chan, content),
            Err(err) => {
                let _ = res_chan.send(PushResult {
                    provider: Some(provider.clone()),
                    destination: None,
                    content: Some(content.clone()),
                    msg_id: None,
                    err: Some(err),
                });
            }
        }
    }

    pub fn preview(&self, service_type: &str, content: &Notification) -> Result<Vec<u8>> {
        self.get(service_type)?.preview(content)
    }

    /// Hands every registered adapter a clone of the out-of-band error
    /// channel.
    pub fn set_error_report_chan(&self, chan: &Sender<PushError>) {
        for service in self.services.values() {
            service.set_error_report_chan(chan.clone());
        }
    }

    pub fn finalize(&self) {
        for service in self.services.values() {
            service.finalize();
        }
    }
}
