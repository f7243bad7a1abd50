/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The API response sink.
//!
//! The frontend's HTTP handler has usually returned long before a push
//! settles, so the engine never reports outcomes synchronously; it appends
//! [`ResponseDetails`] lines to whatever [`ResponseHandler`] the caller
//! supplied.

/// The closed set of per-line result codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ResultCode {
    Success = 0,
    ErrorGeneric = 1,
    ErrorDatabase = 2,
    ErrorNoDevice = 3,
    ErrorNoPushServiceProvider = 4,
    ErrorNoDeliveryPoint = 5,
    ErrorBadDeliveryPoint = 6,
    ErrorFailedRetry = 7,
    UpdatePushServiceProvider = 8,
    UpdateDeliveryPoint = 9,
    RemoveInvalidReg = 10,
    UpdateUnsubscribe = 11,
}

impl ResultCode {
    pub fn code(self) -> i32 {
        self as i32
    }
}

/// One line of the accumulated API response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseDetails {
    pub request_id: Option<String>,
    pub service: Option<String>,
    pub subscriber: Option<String>,
    pub push_service_provider: Option<String>,
    pub delivery_point: Option<String>,
    pub message_id: Option<String>,
    pub code: ResultCode,
}

impl ResponseDetails {
    pub fn new(code: ResultCode) -> Self {
        Self {
            request_id: None,
            service: None,
            subscriber: None,
            push_service_provider: None,
            delivery_point: None,
            message_id: None,
            code,
        }
    }
}

/// Accumulates response lines for one API request.
pub trait ResponseHandler: Send + Sync {
    fn add_details(&self, details: ResponseDetails);
}

/// Sink for events with no originating API request (the out-of-band error
/// drain).
pub struct NullResponseHandler;

impl ResponseHandler for NullResponseHandler {
    fn add_details(&self, _details: ResponseDetails) {}
}
