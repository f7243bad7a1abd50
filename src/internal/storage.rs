/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The subscription database interface the engine consumes.
//!
//! The concrete store lives outside this crate; the engine only needs these
//! eight synchronous operations. Providers and delivery points are persisted
//! as their fixed + volatile maps, keyed by the fixed-data digest; cache
//! flushing on shutdown is the store's concern.

use crate::error::Result;
use crate::internal::registration::{DeliveryPoint, PushServiceProvider};

/// One row of a subscriber lookup. Either half may be absent when the store
/// holds a dangling reference; the engine reports those rather than failing
/// the whole submission.
#[derive(Debug, Clone, Default)]
pub struct ProviderDeliveryPair {
    pub provider: Option<PushServiceProvider>,
    pub delivery_point: Option<DeliveryPoint>,
}

#[cfg_attr(test, mockall::automock)]
pub trait PushDatabase: Send + Sync {
    fn add_push_service_provider_to_service(
        &self,
        service: &str,
        provider: &PushServiceProvider,
    ) -> Result<()>;

    fn remove_push_service_provider_from_service(
        &self,
        service: &str,
        provider: &PushServiceProvider,
    ) -> Result<()>;

    /// Registers the delivery point under (service, subscriber) and returns
    /// the provider that will serve it.
    fn add_delivery_point_to_service(
        &self,
        service: &str,
        subscriber: &str,
        delivery_point: &DeliveryPoint,
    ) -> Result<PushServiceProvider>;

    fn remove_delivery_point_from_service(
        &self,
        service: &str,
        subscriber: &str,
        delivery_point: &DeliveryPoint,
    ) -> Result<()>;

    fn get_push_service_provider_delivery_point_pairs(
        &self,
        service: &str,
        subscriber: &str,
    ) -> Result<Vec<ProviderDeliveryPair>>;

    fn modify_push_service_provider(&self, provider: &PushServiceProvider) -> Result<()>;

    fn modify_delivery_point(&self, delivery_point: &DeliveryPoint) -> Result<()>;

    fn flush_cache(&self) -> Result<()>;
}
