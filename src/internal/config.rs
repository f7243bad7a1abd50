/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Configuration for the gateway: vendor endpoints, transport timeouts and
//! the retry policy.

use std::time::Duration;

use url::Url;

pub const DEFAULT_C2DM_SUBMIT_URL: &str = "https://android.apis.google.com/c2dm/send";
pub const DEFAULT_APNS_PRODUCTION_HOST: &str = "gateway.push.apple.com:2195";
pub const DEFAULT_APNS_SANDBOX_HOST: &str = "gateway.sandbox.push.apple.com:2195";

const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_APNS_QUIESCE_WINDOW: Duration = Duration::from_secs(2);

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    /// Submission endpoint for the C2DM adapter.
    pub c2dm_submit_url: Url,

    /// Request timeout for the HTTP-based adapters.
    pub http_timeout: Duration,

    /// host:port of the production APNS binary gateway.
    pub apns_production_host: String,

    /// host:port of the sandbox APNS binary gateway.
    pub apns_sandbox_host: String,

    /// How long after the last send an unanswered APNS notification is
    /// declared delivered.
    pub apns_quiesce_window: Duration,

    pub retry: RetryPolicy,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            c2dm_submit_url: Url::parse(DEFAULT_C2DM_SUBMIT_URL).expect("default C2DM URL"),
            http_timeout: DEFAULT_HTTP_TIMEOUT,
            apns_production_host: DEFAULT_APNS_PRODUCTION_HOST.to_string(),
            apns_sandbox_host: DEFAULT_APNS_SANDBOX_HOST.to_string(),
            apns_quiesce_window: DEFAULT_APNS_QUIESCE_WINDOW,
            retry: RetryPolicy::default(),
        }
    }
}

/// Exponential backoff for transient delivery failures. The delay starts at
/// `initial`, doubles on every attempt and the retry is abandoned once the
/// next delay would exceed `ceiling`.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub ceiling: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(5),
            ceiling: Duration::from_secs(60),
        }
    }
}
