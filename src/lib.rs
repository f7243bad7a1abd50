/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

#![warn(rust_2018_idioms)]
//! # Push delivery gateway
//!
//! A multi-protocol mobile push gateway core. Application servers submit a
//! notification addressed by (service, subscriber); this crate resolves each
//! subscriber to its device endpoints through a pluggable subscription
//! database, dispatches every endpoint through the matching vendor protocol
//! adapter, and asynchronously reconciles whatever comes back (credential
//! rotations, dead registrations, transient failures, unsubscribe signals)
//! against that database.
//!
//! ## Moving parts
//!
//! - [`PushServiceProvider`] / [`DeliveryPoint`]: credential bundle and
//!   device endpoint, persisted as fixed + volatile attribute maps and named
//!   by a stable digest of the fixed half.
//! - [`PushServiceType`]: the adapter contract. Two backends ship here:
//!   Google's legacy cloud-to-device HTTP endpoint ([`C2dmService`]) and
//!   Apple's binary push gateway ([`ApnsService`]).
//! - [`PushServiceManager`]: the adapter registry, populated at startup.
//! - [`PushBackEnd`]: the dispatch engine. One submission fans out into one
//!   delivery point stream per provider touched, each drained by its adapter
//!   concurrently; results feed the reconciler, which mutates the database,
//!   schedules bounded-backoff retries, and appends response lines to the
//!   caller's [`ResponseHandler`].
//!
//! The delivery contract is at-most-once with best-effort retry: nothing is
//! persisted across restarts and no ordering is promised between
//! notifications to the same device.
//!
//! ## Wiring it up
//!
//! ```no_run
//! use std::sync::Arc;
//! use push_gateway::{
//!     ApnsService, C2dmService, GatewayConfig, PushBackEnd, PushServiceManager,
//! };
//!
//! # fn open_database() -> Arc<dyn push_gateway::PushDatabase> { unimplemented!() }
//! let config = GatewayConfig::default();
//! let mut psm = PushServiceManager::new();
//! psm.register(Arc::new(C2dmService::new(&config)));
//! psm.register(Arc::new(ApnsService::new(&config)));
//! let backend = PushBackEnd::new(Arc::new(psm), open_database(), config.retry.clone());
//! ```

mod error;
// All implementation detail lives in the `internal` module.
mod internal;

pub use error::{PushError, Result};
pub use internal::apns::{ApnsConnector, ApnsService, ApnsStream};
pub use internal::backend::PushBackEnd;
pub use internal::c2dm::C2dmService;
pub use internal::config::{GatewayConfig, RetryPolicy};
pub use internal::registration::{
    DeliveryPoint, Notification, PushResult, PushServiceProvider,
};
pub use internal::report::{
    NullResponseHandler, ResponseDetails, ResponseHandler, ResultCode,
};
pub use internal::service::{PushServiceManager, PushServiceType};
pub use internal::storage::{ProviderDeliveryPair, PushDatabase};
