/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The typed outcome vocabulary shared by the protocol adapters and the
//! reconciler.
//!
//! Adapters normalize every vendor response into one of these variants; the
//! reconciler ([`crate::PushBackEnd`]) is their exhaustive matcher. Adapters
//! must not invent new tags without extending the reconciler.

use std::time::Duration;

use crate::internal::registration::{DeliveryPoint, Notification, PushServiceProvider};

#[derive(Debug, thiserror::Error)]
pub enum PushError {
    /// Transient vendor failure. `after == None` means "use the reconciler's
    /// default delay"; a concrete value overrides it.
    #[error("transient failure, retry requested for {}", destination.name())]
    Retry {
        provider: PushServiceProvider,
        destination: DeliveryPoint,
        content: Notification,
        after: Option<Duration>,
    },

    /// The provider's credentials are no longer accepted by the vendor.
    #[error("push service provider {} rejected: {}", provider.name(), reason)]
    InvalidProvider {
        provider: PushServiceProvider,
        reason: String,
    },

    /// The endpoint is malformed or rejected, but not known to be gone.
    #[error("invalid delivery point {}: {}", destination.name(), reason)]
    InvalidDeliveryPoint {
        provider: PushServiceProvider,
        destination: DeliveryPoint,
        reason: String,
    },

    /// The endpoint no longer exists on the vendor side and must be removed
    /// from the subscription database.
    #[error("delivery point {} is no longer registered", destination.name())]
    Unregistered {
        provider: PushServiceProvider,
        destination: DeliveryPoint,
    },

    #[error("quota exceeded for push service provider {}", provider.name())]
    QuotaExceeded { provider: PushServiceProvider },

    #[error("device quota exceeded for {}", destination.name())]
    DeviceQuotaExceeded {
        provider: PushServiceProvider,
        destination: DeliveryPoint,
    },

    #[error("notification exceeds the vendor limit of {limit} bytes")]
    NotificationTooBig { limit: usize },

    /// The provider and delivery point belong to different adapters.
    #[error("incompatible pair: provider={provider_type} destination={destination_type} adapter={service_type}")]
    Incompatible {
        provider_type: String,
        destination_type: String,
        service_type: String,
    },

    /// Credentials rotated mid-exchange. The carried snapshots hold the new
    /// VolatileData; the reconciler persists them, then recurses on `inner`.
    #[error("credential refresh observed")]
    RefreshData {
        provider: Option<PushServiceProvider>,
        destination: Option<DeliveryPoint>,
        inner: Option<Box<PushError>>,
    },

    /// Side-effect request: persist the provider's current data.
    #[error("push service provider {} requests an update", provider.name())]
    UpdateProvider { provider: PushServiceProvider },

    /// Side-effect request: persist the delivery point's current data.
    #[error("delivery point {} requests an update", destination.name())]
    UpdateDeliveryPoint { destination: DeliveryPoint },

    /// Side-effect request: the registration is invalid and must be dropped.
    #[error("invalid registration for {}", destination.name())]
    RemoveInvalidRegistration {
        provider: PushServiceProvider,
        destination: DeliveryPoint,
    },

    /// Side-effect request: the subscriber asked the vendor to unsubscribe.
    #[error("unsubscribe requested for {}", destination.name())]
    Unsubscribe {
        provider: PushServiceProvider,
        destination: DeliveryPoint,
    },

    /// Logged at info level; no database effect.
    #[error("{0}")]
    Info(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("connection error: {0}")]
    Connection(String),

    /// A build-from-map constructor was handed a map without a required key.
    #[error("missing required key: {key}")]
    MissingKey { key: &'static str },

    #[error("unknown push service type: {0}")]
    UnknownServiceType(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("error parsing JSON data: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = PushError> = std::result::Result<T, E>;
