/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The C2DM adapter: one authenticated form-encoded POST per delivery point.
//!
//! The vendor answers with a `key=value` body. A response may also carry an
//! `Update-Client-Auth` header rotating the provider's auth token; when that
//! happens the rotated credentials ride along with the outcome in a
//! [`PushError::RefreshData`] wrapper so the reconciler persists them even if
//! the delivery itself failed.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use crossbeam_channel::{Receiver, Sender};
use reqwest::header::AUTHORIZATION;
use sha2::{Digest, Sha256};
use url::form_urlencoded;

use crate::error::{PushError, Result};
use crate::internal::config::GatewayConfig;
use crate::internal::registration::{
    DeliveryPoint, Notification, PushResult, PushServiceProvider,
};
use crate::internal::service::{check_compatibility, PushServiceType};

const SERVICE_NAME: &str = "c2dm";
const UPDATE_CLIENT_AUTH: &str = "Update-Client-Auth";

pub struct C2dmService {
    submit_url: url::Url,
    client: reqwest::blocking::Client,
}

impl C2dmService {
    pub fn new(config: &GatewayConfig) -> Self {
        let client = reqwest::blocking::ClientBuilder::new()
            .timeout(config.http_timeout)
            .build()
            .expect("Failed to initialize reqwest::Client");
        Self {
            submit_url: config.c2dm_submit_url.clone(),
            client,
        }
    }

    /// The vendor-side dedup token: the submitter's `id` key verbatim, or a
    /// digest salted with the pair of entity names and the current time.
    fn collapse_key(
        provider: &PushServiceProvider,
        destination: &DeliveryPoint,
        content: &Notification,
    ) -> String {
        if let Some(id) = content.data.get("id") {
            return id.clone();
        }
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let mut hash = Sha256::new();
        hash.update(
            format!(
                "{}-{}-{}-{}-{}",
                destination.name(),
                provider.name(),
                now.as_secs(),
                now.subsec_nanos(),
                content.data.get("msg").map(String::as_str).unwrap_or("")
            )
            .as_bytes(),
        );
        hex::encode(hash.finalize())
    }

    fn form_params(regid: &str, collapse_key: &str, content: &Notification) -> Vec<(String, String)> {
        let mut params = vec![
            ("registration_id".to_string(), regid.to_string()),
            ("collapse_key".to_string(), collapse_key.to_string()),
        ];
        for (k, v) in &content.data {
            if k == "id" {
                continue;
            }
            params.push((format!("data.{}", k), v.clone()));
        }
        params
    }

    /// One delivery attempt. Mutates the working copy of the provider when
    /// the vendor rotates the auth token, so later deliveries in the same
    /// drain use the new credentials.
    fn push_one(
        &self,
        provider: &mut PushServiceProvider,
        destination: &DeliveryPoint,
        content: &Notification,
    ) -> (Option<String>, Option<PushError>) {
        if let Err(err) = check_compatibility(provider, destination, SERVICE_NAME) {
            return (None, Some(err));
        }
        let regid = destination
            .fixed_data
            .get("regid")
            .map(String::as_str)
            .unwrap_or_default();
        if regid.is_empty() {
            return (
                None,
                Some(PushError::InvalidDeliveryPoint {
                    provider: provider.clone(),
                    destination: destination.clone(),
                    reason: "empty registration id".to_string(),
                }),
            );
        }

        let collapse_key = Self::collapse_key(provider, destination, content);
        let params = Self::form_params(regid, &collapse_key, content);
        let authtoken = provider
            .volatile_data
            .get("authtoken")
            .cloned()
            .unwrap_or_default();

        let response = match self
            .client
            .post(self.submit_url.clone())
            .header(AUTHORIZATION, format!("GoogleLogin auth={}", authtoken))
            .form(&params)
            .send()
        {
            Ok(response) => response,
            Err(err) => return (None, Some(err.into())),
        };

        let mut refreshed = false;
        if let Some(new_token) = response
            .headers()
            .get(UPDATE_CLIENT_AUTH)
            .and_then(|v| v.to_str().ok())
        {
            if !new_token.is_empty() && new_token != authtoken {
                provider
                    .volatile_data
                    .insert("authtoken".to_string(), new_token.to_string());
                refreshed = true;
            }
        }

        let wrap = |err: Option<PushError>| -> Option<PushError> {
            if refreshed {
                Some(PushError::RefreshData {
                    provider: Some(provider.clone()),
                    destination: None,
                    inner: err.map(Box::new),
                })
            } else {
                err
            }
        };

        match response.status().as_u16() {
            503 => {
                return (
                    None,
                    wrap(Some(PushError::Retry {
                        provider: provider.clone(),
                        destination: destination.clone(),
                        content: content.clone(),
                        after: None,
                    })),
                );
            }
            401 => {
                return (
                    None,
                    Some(PushError::InvalidProvider {
                        provider: provider.clone(),
                        reason: "invalid auth token".to_string(),
                    }),
                );
            }
            _ => {}
        }

        let body = match response.text() {
            Ok(body) => body.replace(['\r', '\n'], ""),
            Err(err) => return (None, wrap(Some(err.into()))),
        };

        if let Some(id) = body.strip_prefix("id=") {
            let msg_id = format!("c2dm:{}-{}", provider.name(), id);
            return (Some(msg_id), wrap(None));
        }

        let err = if let Some(raw) = body.strip_prefix("Error=") {
            match raw {
                "QuotaExceeded" => PushError::QuotaExceeded {
                    provider: provider.clone(),
                },
                "InvalidRegistration" => PushError::InvalidDeliveryPoint {
                    provider: provider.clone(),
                    destination: destination.clone(),
                    reason: "InvalidRegistration".to_string(),
                },
                "NotRegistered" => PushError::Unregistered {
                    provider: provider.clone(),
                    destination: destination.clone(),
                },
                "MessageTooBig" => PushError::NotificationTooBig { limit: 1024 },
                "DeviceQuotaExceeded" => PushError::DeviceQuotaExceeded {
                    provider: provider.clone(),
                    destination: destination.clone(),
                },
                other => PushError::Connection(format!("unknown error from c2dm: {}", other)),
            }
        } else {
            PushError::Connection(format!("unparseable response from c2dm: {}", body))
        };
        (None, wrap(Some(err)))
    }
}

impl PushServiceType for C2dmService {
    fn name(&self) -> &'static str {
        SERVICE_NAME
    }

    fn build_push_service_provider_from_map(
        &self,
        kv: &HashMap<String, String>,
        provider: &mut PushServiceProvider,
    ) -> Result<()> {
        for key in ["service", "senderid"] {
            match kv.get(key) {
                Some(value) => {
                    provider.fixed_data.insert(key.to_string(), value.clone());
                }
                None => return Err(PushError::MissingKey { key }),
            }
        }
        match kv.get("authtoken") {
            Some(value) => {
                provider
                    .volatile_data
                    .insert("authtoken".to_string(), value.clone());
                Ok(())
            }
            None => Err(PushError::MissingKey { key: "authtoken" }),
        }
    }

    fn build_delivery_point_from_map(
        &self,
        kv: &HashMap<String, String>,
        delivery_point: &mut DeliveryPoint,
    ) -> Result<()> {
        for key in ["service", "subscriber", "account", "regid"] {
            match kv.get(key) {
                Some(value) => {
                    delivery_point
                        .fixed_data
                        .insert(key.to_string(), value.clone());
                }
                None => return Err(PushError::MissingKey { key }),
            }
        }
        Ok(())
    }

    fn push(
        &self,
        provider: &PushServiceProvider,
        dp_chan: Receiver<DeliveryPoint>,
        res_chan: Sender<PushResult>,
        content: &Notification,
    ) {
        // Working copy; auth rotation updates it for the rest of the drain.
        let mut provider = provider.clone();
        for destination in dp_chan.iter() {
            let (msg_id, err) = self.push_one(&mut provider, &destination, content);
            let _ = res_chan.send(PushResult {
                provider: Some(provider.clone()),
                destination: Some(destination),
                content: Some(content.clone()),
                msg_id,
                err,
            });
        }
    }

    fn preview(&self, content: &Notification) -> Result<Vec<u8>> {
        let collapse_key = content
            .data
            .get("id")
            .cloned()
            .unwrap_or_else(|| "placeholder".to_string());
        let params = Self::form_params("placeholder", &collapse_key, content);
        let mut body = form_urlencoded::Serializer::new(String::new());
        for (k, v) in &params {
            body.append_pair(k, v);
        }
        Ok(body.finish().into_bytes())
    }

    fn set_error_report_chan(&self, _chan: Sender<PushError>) {}

    fn finalize(&self) {}
}
