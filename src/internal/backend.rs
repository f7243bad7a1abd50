/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The dispatch engine and the reconciler.
//!
//! [`PushBackEnd::push`] resolves subscribers against the subscription
//! database, shards the resulting delivery points by provider, and runs one
//! adapter stream plus one result collector per provider touched. The
//! collector funnels every failed result into the reconciler
//! ([`PushBackEnd::fix_error`]), which turns each typed outcome into a
//! database mutation, a delayed re-push, or a response detail.
//!
//! Plumbing per (submission, provider): the engine owns the delivery point
//! channel's sender and is the only writer; the adapter is the only reader
//! and the only writer of the result channel; the collector drains results
//! until the adapter closes its side. Both worker threads are joined before
//! `push` returns.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};

use crate::error::{PushError, Result};
use crate::internal::config::RetryPolicy;
use crate::internal::registration::{
    DeliveryPoint, Notification, PushResult, PushServiceProvider,
};
use crate::internal::report::{NullResponseHandler, ResponseDetails, ResponseHandler, ResultCode};
use crate::internal::service::PushServiceManager;
use crate::internal::storage::{ProviderDeliveryPair, PushDatabase};

pub struct PushBackEnd {
    psm: Arc<PushServiceManager>,
    db: Arc<dyn PushDatabase>,
    retry: RetryPolicy,
    err_tx: Mutex<Option<Sender<PushError>>>,
    drain: Mutex<Option<JoinHandle<()>>>,
    // Backref to the owning Arc, for the threads the engine spawns.
    this: Mutex<Weak<PushBackEnd>>,
}

impl PushBackEnd {
    /// Wires the adapters' out-of-band error channel into a background drain
    /// and returns the shared engine handle.
    pub fn new(
        psm: Arc<PushServiceManager>,
        db: Arc<dyn PushDatabase>,
        retry: RetryPolicy,
    ) -> Arc<Self> {
        let (err_tx, err_rx) = unbounded();
        psm.set_error_report_chan(&err_tx);
        let backend = Arc::new(Self {
            psm,
            db,
            retry,
            err_tx: Mutex::new(Some(err_tx)),
            drain: Mutex::new(None),
            this: Mutex::new(Weak::new()),
        });
        *backend.this.lock().unwrap() = Arc::downgrade(&backend);
        let weak = Arc::downgrade(&backend);
        let handle = thread::spawn(move || Self::process_error(weak, err_rx));
        *backend.drain.lock().unwrap() = Some(handle);
        backend
    }

    /// Flushes the store, releases the adapters and stops the error drain.
    pub fn finalize(&self) {
        if let Err(err) = self.db.flush_cache() {
            log::error!("Failed to flush the subscription database: {}", err);
        }
        self.psm.finalize();
        drop(self.err_tx.lock().unwrap().take());
        if let Some(handle) = self.drain.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    pub fn add_push_service_provider(
        &self,
        service: &str,
        provider: &PushServiceProvider,
    ) -> Result<()> {
        self.db.add_push_service_provider_to_service(service, provider)
    }

    pub fn remove_push_service_provider(
        &self,
        service: &str,
        provider: &PushServiceProvider,
    ) -> Result<()> {
        self.db
            .remove_push_service_provider_from_service(service, provider)
    }

    pub fn subscribe(
        &self,
        service: &str,
        subscriber: &str,
        delivery_point: &DeliveryPoint,
    ) -> Result<PushServiceProvider> {
        self.db
            .add_delivery_point_to_service(service, subscriber, delivery_point)
    }

    pub fn unsubscribe(
        &self,
        service: &str,
        subscriber: &str,
        delivery_point: &DeliveryPoint,
    ) -> Result<()> {
        self.db
            .remove_delivery_point_from_service(service, subscriber, delivery_point)
    }

    pub fn number_of_delivery_points(&self, service: &str, subscriber: &str) -> usize {
        match self
            .db
            .get_push_service_provider_delivery_point_pairs(service, subscriber)
        {
            Ok(pairs) => pairs.len(),
            Err(err) => {
                log::error!(
                    "Query=NumberOfDeliveryPoints Service={} Subscriber={} Failed: Database Error {}",
                    service,
                    subscriber,
                    err
                );
                0
            }
        }
    }

    pub fn preview(&self, service_type: &str, content: &Notification) -> Result<Vec<u8>> {
        self.psm.preview(service_type, content)
    }

    pub fn push(
        &self,
        req_id: &str,
        service: &str,
        subscribers: &[String],
        content: &Notification,
        per_dp: Option<&HashMap<String, Vec<String>>>,
        handler: &Arc<dyn ResponseHandler>,
    ) {
        self.push_impl(
            req_id,
            service,
            subscribers,
            content,
            per_dp,
            None,
            Duration::ZERO,
            handler,
        );
    }

    /// Drains the out-of-band channel: events that arrive with no originating
    /// API request are reconciled against a null handler and logged.
    fn process_error(weak: Weak<PushBackEnd>, err_rx: Receiver<PushError>) {
        let handler: Arc<dyn ResponseHandler> = Arc::new(NullResponseHandler);
        for event in err_rx.iter() {
            let Some(backend) = weak.upgrade() else { break };
            match backend.fix_error("background", event, Duration::ZERO, &handler) {
                None => {}
                Some(PushError::Info(msg)) => log::info!("{}", msg),
                Some(err) => log::error!("Error: {}", err),
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn push_impl(
        &self,
        req_id: &str,
        service: &str,
        subscribers: &[String],
        content: &Notification,
        per_dp: Option<&HashMap<String, Vec<String>>>,
        injected: Option<(PushServiceProvider, DeliveryPoint)>,
        after: Duration,
        handler: &Arc<dyn ResponseHandler>,
    ) {
        let mut dp_chans: HashMap<String, Sender<DeliveryPoint>> = HashMap::new();
        let mut joins: Vec<JoinHandle<()>> = Vec::new();

        for subscriber in subscribers {
            let mut dpidx = 0usize;
            let pairs = if let Some((provider, delivery_point)) = injected.clone() {
                vec![ProviderDeliveryPair {
                    provider: Some(provider),
                    delivery_point: Some(delivery_point),
                }]
            } else {
                match self
                    .db
                    .get_push_service_provider_delivery_point_pairs(service, subscriber)
                {
                    Ok(pairs) => pairs,
                    Err(err) => {
                        log::error!(
                            "RequestID={} Service={} Subscriber={} Failed: Database Error {}",
                            req_id,
                            service,
                            subscriber,
                            err
                        );
                        handler.add_details(ResponseDetails {
                            request_id: Some(req_id.to_string()),
                            service: Some(service.to_string()),
                            subscriber: Some(subscriber.clone()),
                            ..ResponseDetails::new(ResultCode::ErrorDatabase)
                        });
                        continue;
                    }
                }
            };

            if pairs.is_empty() {
                log::error!(
                    "RequestID={} Service={} Subscriber={} Failed: No device",
                    req_id,
                    service,
                    subscriber
                );
                handler.add_details(ResponseDetails {
                    request_id: Some(req_id.to_string()),
                    service: Some(service.to_string()),
                    subscriber: Some(subscriber.clone()),
                    ..ResponseDetails::new(ResultCode::ErrorNoDevice)
                });
                continue;
            }

            for pair in pairs {
                let Some(provider) = pair.provider else {
                    log::error!(
                        "RequestID={} Service={} Subscriber={} Failed once: no Push Service Provider",
                        req_id,
                        service,
                        subscriber
                    );
                    handler.add_details(ResponseDetails {
                        request_id: Some(req_id.to_string()),
                        service: Some(service.to_string()),
                        subscriber: Some(subscriber.clone()),
                        ..ResponseDetails::new(ResultCode::ErrorNoPushServiceProvider)
                    });
                    continue;
                };
                let Some(delivery_point) = pair.delivery_point else {
                    log::error!(
                        "RequestID={} Service={} Subscriber={} Failed once: no Delivery Point",
                        req_id,
                        service,
                        subscriber
                    );
                    handler.add_details(ResponseDetails {
                        request_id: Some(req_id.to_string()),
                        service: Some(service.to_string()),
                        subscriber: Some(subscriber.clone()),
                        ..ResponseDetails::new(ResultCode::ErrorNoDeliveryPoint)
                    });
                    continue;
                };

                let provider_name = provider.name();
                if !dp_chans.contains_key(&provider_name) {
                    // Rendezvous pair per provider: the engine is the only
                    // writer of dp_tx, the adapter the only writer of res_tx.
                    let (dp_tx, dp_rx) = bounded::<DeliveryPoint>(0);
                    let (res_tx, res_rx) = bounded::<PushResult>(0);
                    let mut note = content.clone();
                    if let Some(per_dp) = per_dp {
                        if !per_dp.is_empty() {
                            for (key, values) in per_dp {
                                if !values.is_empty() {
                                    note.data.insert(
                                        key.clone(),
                                        values[dpidx % values.len()].clone(),
                                    );
                                }
                            }
                            dpidx += 1;
                        }
                    }
                    let psm = Arc::clone(&self.psm);
                    let adapter_provider = provider.clone();
                    joins.push(thread::spawn(move || {
                        psm.push(&adapter_provider, dp_rx, res_tx, &note);
                    }));
                    let backend = self
                        .this
                        .lock()
                        .unwrap()
                        .upgrade()
                        .expect("engine handle alive while pushing");
                    let req_id = req_id.to_string();
                    let service = service.to_string();
                    let handler = Arc::clone(handler);
                    joins.push(thread::spawn(move || {
                        backend.collect_result(&req_id, &service, res_rx, after, &handler);
                    }));
                    dp_chans.insert(provider_name.clone(), dp_tx);
                }
                if let Some(dp_tx) = dp_chans.get(&provider_name) {
                    if dp_tx.send(delivery_point).is_err() {
                        log::warn!(
                            "RequestID={} Service={} Subscriber={} adapter stopped reading delivery points",
                            req_id,
                            service,
                            subscriber
                        );
                    }
                }
            }
        }

        // Closing every delivery point channel tells the adapters to finish;
        // the adapters in turn close their result channels and the
        // collectors drain out.
        drop(dp_chans);
        for join in joins {
            let _ = join.join();
        }
    }

    fn collect_result(
        &self,
        req_id: &str,
        service: &str,
        res_chan: Receiver<PushResult>,
        after: Duration,
        handler: &Arc<dyn ResponseHandler>,
    ) {
        for result in res_chan.iter() {
            let PushResult {
                provider,
                destination,
                content: _,
                msg_id,
                err,
            } = result;

            let mut subscriber = None;
            if let (Some(_), Some(destination)) = (&provider, &destination) {
                match destination.subscriber() {
                    Some(sub) => subscriber = Some(sub.to_string()),
                    None => {
                        log::error!(
                            "RequestID={} DeliveryPoint={} Bad Delivery Point: no subscriber",
                            req_id,
                            destination.name()
                        );
                        handler.add_details(ResponseDetails {
                            request_id: Some(req_id.to_string()),
                            delivery_point: Some(destination.name()),
                            ..ResponseDetails::new(ResultCode::ErrorBadDeliveryPoint)
                        });
                        continue;
                    }
                }
            }
            let provider_name = provider.as_ref().map(|p| p.name());
            let destination_name = destination.as_ref().map(|d| d.name());

            match err {
                None => {
                    log::info!(
                        "RequestID={} Service={} Subscriber={} PushServiceProvider={} DeliveryPoint={} MsgId={} Success!",
                        req_id,
                        service,
                        subscriber.as_deref().unwrap_or(""),
                        provider_name.as_deref().unwrap_or("Unknown"),
                        destination_name.as_deref().unwrap_or("Unknown"),
                        msg_id.as_deref().unwrap_or("")
                    );
                    handler.add_details(ResponseDetails {
                        request_id: Some(req_id.to_string()),
                        service: Some(service.to_string()),
                        subscriber,
                        push_service_provider: provider_name,
                        delivery_point: destination_name,
                        message_id: msg_id,
                        ..ResponseDetails::new(ResultCode::Success)
                    });
                }
                Some(err) => match self.fix_error(req_id, err, after, handler) {
                    None => {
                        // The event was consumed. A message id means the
                        // delivery itself went through and only bookkeeping
                        // rode along, so the success line is still owed.
                        if let Some(message_id) = msg_id {
                            handler.add_details(ResponseDetails {
                                request_id: Some(req_id.to_string()),
                                service: Some(service.to_string()),
                                subscriber,
                                push_service_provider: provider_name,
                                delivery_point: destination_name,
                                message_id: Some(message_id),
                                ..ResponseDetails::new(ResultCode::Success)
                            });
                        }
                    }
                    Some(err) => {
                        log::error!(
                            "RequestID={} Service={} Subscriber={} PushServiceProvider={} DeliveryPoint={} Failed: {}",
                            req_id,
                            service,
                            subscriber.as_deref().unwrap_or(""),
                            provider_name.as_deref().unwrap_or("Unknown"),
                            destination_name.as_deref().unwrap_or("Unknown"),
                            err
                        );
                        handler.add_details(ResponseDetails {
                            request_id: Some(req_id.to_string()),
                            service: Some(service.to_string()),
                            subscriber,
                            push_service_provider: provider_name,
                            delivery_point: destination_name,
                            ..ResponseDetails::new(ResultCode::ErrorGeneric)
                        });
                    }
                },
            }
        }
    }

    /// Reconciles one typed outcome. Returns `None` when the event was
    /// consumed (mutation performed, retry scheduled, or dropped as
    /// unactionable); anything returned surfaces as a generic failure.
    fn fix_error(
        &self,
        req_id: &str,
        event: PushError,
        after: Duration,
        handler: &Arc<dyn ResponseHandler>,
    ) -> Option<PushError> {
        match event {
            PushError::Retry {
                provider,
                destination,
                content,
                after: requested,
            } => {
                let Some(service) = provider.service().map(str::to_string) else {
                    return None;
                };
                let Some(subscriber) = destination.subscriber().map(str::to_string) else {
                    return None;
                };
                let provider_name = provider.name();
                let destination_name = destination.name();
                let delay = match requested {
                    Some(delay) => delay,
                    None if after < self.retry.initial => self.retry.initial,
                    None => after,
                };
                if delay > self.retry.ceiling {
                    log::error!(
                        "RequestID={} Service={} Subscriber={} PushServiceProvider={} DeliveryPoint={} Failed after retry",
                        req_id,
                        service,
                        subscriber,
                        provider_name,
                        destination_name
                    );
                    handler.add_details(ResponseDetails {
                        request_id: Some(req_id.to_string()),
                        service: Some(service),
                        subscriber: Some(subscriber),
                        push_service_provider: Some(provider_name),
                        delivery_point: Some(destination_name),
                        ..ResponseDetails::new(ResultCode::ErrorFailedRetry)
                    });
                    return None;
                }
                log::info!(
                    "RequestID={} Service={} Subscriber={} PushServiceProvider={} DeliveryPoint={} Retry after {:?}",
                    req_id,
                    service,
                    subscriber,
                    provider_name,
                    destination_name,
                    delay
                );
                let Some(backend) = self.this.lock().unwrap().upgrade() else {
                    return None;
                };
                let req_id = req_id.to_string();
                let handler = Arc::clone(handler);
                thread::spawn(move || {
                    thread::sleep(delay);
                    let subscribers = [subscriber];
                    backend.push_impl(
                        &req_id,
                        &service,
                        &subscribers,
                        &content,
                        None,
                        Some((provider, destination)),
                        delay * 2,
                        &handler,
                    );
                });
                None
            }
            PushError::UpdateProvider { provider } => {
                let Some(service) = provider.service().map(str::to_string) else {
                    return None;
                };
                self.persist_provider(req_id, &service, &provider, handler);
                None
            }
            PushError::UpdateDeliveryPoint { destination } => {
                if destination.subscriber().is_none() {
                    return None;
                }
                self.persist_delivery_point(req_id, &destination, handler);
                None
            }
            PushError::RemoveInvalidRegistration {
                provider,
                destination,
            }
            | PushError::Unregistered {
                provider,
                destination,
            } => {
                self.remove_registration(
                    req_id,
                    &provider,
                    &destination,
                    ResultCode::RemoveInvalidReg,
                    handler,
                );
                None
            }
            PushError::Unsubscribe {
                provider,
                destination,
            } => {
                self.remove_registration(
                    req_id,
                    &provider,
                    &destination,
                    ResultCode::UpdateUnsubscribe,
                    handler,
                );
                None
            }
            PushError::RefreshData {
                provider,
                destination,
                inner,
            } => {
                if let Some(provider) = provider {
                    if let Some(service) = provider.service().map(str::to_string) {
                        self.persist_provider(req_id, &service, &provider, handler);
                    }
                }
                if let Some(destination) = destination {
                    if destination.subscriber().is_some() {
                        self.persist_delivery_point(req_id, &destination, handler);
                    }
                }
                match inner {
                    Some(inner) => self.fix_error(req_id, *inner, after, handler),
                    None => None,
                }
            }
            other => Some(other),
        }
    }

    fn persist_provider(
        &self,
        req_id: &str,
        service: &str,
        provider: &PushServiceProvider,
        handler: &Arc<dyn ResponseHandler>,
    ) {
        let provider_name = provider.name();
        match self.db.modify_push_service_provider(provider) {
            Ok(()) => log::info!(
                "RequestID={} Service={} PushServiceProvider={} Update Success",
                req_id,
                service,
                provider_name
            ),
            Err(err) => log::error!(
                "RequestID={} Service={} PushServiceProvider={} Update Failed: {}",
                req_id,
                service,
                provider_name,
                err
            ),
        }
        handler.add_details(ResponseDetails {
            request_id: Some(req_id.to_string()),
            service: Some(service.to_string()),
            push_service_provider: Some(provider_name),
            ..ResponseDetails::new(ResultCode::UpdatePushServiceProvider)
        });
    }

    fn persist_delivery_point(
        &self,
        req_id: &str,
        destination: &DeliveryPoint,
        handler: &Arc<dyn ResponseHandler>,
    ) {
        let destination_name = destination.name();
        let subscriber = destination.subscriber().unwrap_or_default().to_string();
        match self.db.modify_delivery_point(destination) {
            Ok(()) => log::info!(
                "RequestID={} Subscriber={} DeliveryPoint={} Update Success",
                req_id,
                subscriber,
                destination_name
            ),
            Err(err) => log::error!(
                "RequestID={} Subscriber={} DeliveryPoint={} Update Failed: {}",
                req_id,
                subscriber,
                destination_name,
                err
            ),
        }
        handler.add_details(ResponseDetails {
            request_id: Some(req_id.to_string()),
            subscriber: Some(subscriber),
            delivery_point: Some(destination_name),
            ..ResponseDetails::new(ResultCode::UpdateDeliveryPoint)
        });
    }

    fn remove_registration(
        &self,
        req_id: &str,
        provider: &PushServiceProvider,
        destination: &DeliveryPoint,
        code: ResultCode,
        handler: &Arc<dyn ResponseHandler>,
    ) {
        let Some(service) = provider.service().map(str::to_string) else {
            return;
        };
        let Some(subscriber) = destination.subscriber().map(str::to_string) else {
            return;
        };
        let destination_name = destination.name();
        match self.unsubscribe(&service, &subscriber, destination) {
            Ok(()) => log::info!(
                "RequestID={} Service={} Subscriber={} DeliveryPoint={} Removed",
                req_id,
                service,
                subscriber,
                destination_name
            ),
            Err(err) => log::error!(
                "RequestID={} Service={} Subscriber={} DeliveryPoint={} Removal failed: {}",
                req_id,
                service,
                subscriber,
                destination_name,
                err
            ),
        }
        handler.add_details(ResponseDetails {
            request_id: Some(req_id.to_string()),
            service: Some(service),
            subscriber: Some(subscriber),
            delivery_point: Some(destination_name),
            ..ResponseDetails::new(code)
        });
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::internal::service::PushServiceType;
    use crate::internal::storage::MockPushDatabase;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    type Outcome =
        fn(&PushServiceProvider, &DeliveryPoint, &Notification) -> (Option<String>, Option<PushError>);

    /// Test adapter: applies a fixed outcome function to every delivery
    /// point and records what it saw.
    struct ScriptedService {
        service_name: &'static str,
        outcome: Outcome,
        calls: AtomicUsize,
        seen: Mutex<Vec<Notification>>,
        err_chan: Mutex<Option<Sender<PushError>>>,
    }

    impl ScriptedService {
        fn new(service_name: &'static str, outcome: Outcome) -> Arc<Self> {
            Arc::new(Self {
                service_name,
                outcome,
                calls: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
                err_chan: Mutex::new(None),
            })
        }

        fn report(&self, err: PushError) {
            self.err_chan
                .lock()
                .unwrap()
                .as_ref()
                .expect("error report channel not wired")
                .send(err)
                .unwrap();
        }
    }

    impl PushServiceType for ScriptedService {
        fn name(&self) -> &'static str {
            self.service_name
        }

        fn build_push_service_provider_from_map(
            &self,
            kv: &HashMap<String, String>,
            provider: &mut PushServiceProvider,
        ) -> crate::error::Result<()> {
            for (k, v) in kv {
                provider.fixed_data.insert(k.clone(), v.clone());
            }
            Ok(())
        }

        fn build_delivery_point_from_map(
            &self,
            kv: &HashMap<String, String>,
            delivery_point: &mut DeliveryPoint,
        ) -> crate::error::Result<()> {
            for (k, v) in kv {
                delivery_point.fixed_data.insert(k.clone(), v.clone());
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
            for destination in dp_chan.iter() {
                self.calls.fetch_add(1, Ordering::SeqCst);
                self.seen.lock().unwrap().push(content.clone());
                let (msg_id, err) = (self.outcome)(provider, &destination, content);
                let _ = res_chan.send(PushResult {
                    provider: Some(provider.clone()),
                    destination: Some(destination),
                    content: Some(content.clone()),
                    msg_id,
                    err,
                });
            }
        }

        fn preview(&self, _content: &Notification) -> crate::error::Result<Vec<u8>> {
            Ok(Vec::new())
        }

        fn set_error_report_chan(&self, chan: Sender<PushError>) {
            *self.err_chan.lock().unwrap() = Some(chan);
        }

        fn finalize(&self) {
            *self.err_chan.lock().unwrap() = None;
        }
    }

    #[derive(Default)]
    struct CollectingHandler {
        details: Mutex<Vec<ResponseDetails>>,
    }

    impl ResponseHandler for CollectingHandler {
        fn add_details(&self, details: ResponseDetails) {
            self.details.lock().unwrap().push(details);
        }
    }

    impl CollectingHandler {
        fn codes(&self) -> Vec<ResultCode> {
            self.details.lock().unwrap().iter().map(|d| d.code).collect()
        }

        fn wait_for(&self, code: ResultCode, timeout: Duration) -> bool {
            let deadline = Instant::now() + timeout;
            while Instant::now() < deadline {
                if self.codes().contains(&code) {
                    return true;
                }
                thread::sleep(Duration::from_millis(5));
            }
            false
        }
    }

    fn test_provider(service_type: &str) -> PushServiceProvider {
        let mut psp = PushServiceProvider::new();
        psp.fixed_data
            .insert("pushservicetype".to_string(), service_type.to_string());
        psp.fixed_data
            .insert("service".to_string(), "myservice".to_string());
        psp.volatile_data
            .insert("authtoken".to_string(), "tok-1".to_string());
        psp
    }

    fn test_delivery_point(service_type: &str, subscriber: &str) -> DeliveryPoint {
        let mut dp = DeliveryPoint::new();
        dp.fixed_data
            .insert("pushservicetype".to_string(), service_type.to_string());
        dp.fixed_data
            .insert("service".to_string(), "myservice".to_string());
        dp.fixed_data
            .insert("subscriber".to_string(), subscriber.to_string());
        dp
    }

    fn pair(service_type: &str, subscriber: &str) -> ProviderDeliveryPair {
        ProviderDeliveryPair {
            provider: Some(test_provider(service_type)),
            delivery_point: Some(test_delivery_point(service_type, subscriber)),
        }
    }

    fn message(text: &str) -> Notification {
        let mut content = Notification::new();
        content.data.insert("msg".to_string(), text.to_string());
        content
    }

    fn backend_with(
        services: Vec<Arc<ScriptedService>>,
        db: MockPushDatabase,
        retry: RetryPolicy,
    ) -> Arc<PushBackEnd> {
        let mut psm = PushServiceManager::new();
        for service in services {
            psm.register(service);
        }
        PushBackEnd::new(Arc::new(psm), Arc::new(db), retry)
    }

    fn succeed(
        provider: &PushServiceProvider,
        _destination: &DeliveryPoint,
        _content: &Notification,
    ) -> (Option<String>, Option<PushError>) {
        (Some(format!("mock:{}-1", provider.name())), None)
    }

    #[test]
    fn successful_delivery_reports_one_success_line() {
        let service = ScriptedService::new("mock", succeed);
        let mut db = MockPushDatabase::new();
        db.expect_get_push_service_provider_delivery_point_pairs()
            .times(1)
            .returning(|_, _| Ok(vec![pair("mock", "alice")]));
        let backend = backend_with(vec![service.clone()], db, RetryPolicy::default());
        let handler = Arc::new(CollectingHandler::default());
        let handler_dyn: Arc<dyn ResponseHandler> = handler.clone();

        backend.push(
            "req-1",
            "myservice",
            &["alice".to_string()],
            &message("hi"),
            None,
            &handler_dyn,
        );

        let details = handler.details.lock().unwrap();
        assert_eq!(details.len(), 1);
        assert_eq!(details[0].code, ResultCode::Success);
        assert!(details[0].message_id.as_deref().unwrap().starts_with("mock:"));
        assert_eq!(details[0].subscriber.as_deref(), Some("alice"));
        assert_eq!(service.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn database_failure_reports_and_continues() {
        let service = ScriptedService::new("mock", succeed);
        let mut db = MockPushDatabase::new();
        let mut lookups: VecDeque<crate::error::Result<Vec<ProviderDeliveryPair>>> =
            VecDeque::from([
                Err(PushError::Database("boom".to_string())),
                Ok(vec![pair("mock", "bob")]),
            ]);
        db.expect_get_push_service_provider_delivery_point_pairs()
            .times(2)
            .returning(move |_, _| lookups.pop_front().unwrap());
        let backend = backend_with(vec![service], db, RetryPolicy::default());
        let handler = Arc::new(CollectingHandler::default());
        let handler_dyn: Arc<dyn ResponseHandler> = handler.clone();

        backend.push(
            "req-1",
            "myservice",
            &["alice".to_string(), "bob".to_string()],
            &message("hi"),
            None,
            &handler_dyn,
        );

        let codes = handler.codes();
        assert!(codes.contains(&ResultCode::ErrorDatabase));
        assert!(codes.contains(&ResultCode::Success));
    }

    #[test]
    fn subscriber_without_devices_reports_no_device() {
        let service = ScriptedService::new("mock", succeed);
        let mut db = MockPushDatabase::new();
        db.expect_get_push_service_provider_delivery_point_pairs()
            .returning(|_, _| Ok(vec![]));
        let backend = backend_with(vec![service], db, RetryPolicy::default());
        let handler = Arc::new(CollectingHandler::default());
        let handler_dyn: Arc<dyn ResponseHandler> = handler.clone();

        backend.push(
            "req-1",
            "myservice",
            &["alice".to_string()],
            &message("hi"),
            None,
            &handler_dyn,
        );
        assert_eq!(handler.codes(), vec![ResultCode::ErrorNoDevice]);
    }

    #[test]
    fn dangling_pair_halves_are_reported_individually() {
        let service = ScriptedService::new("mock", succeed);
        let mut db = MockPushDatabase::new();
        db.expect_get_push_service_provider_delivery_point_pairs()
            .returning(|_, _| {
                Ok(vec![
                    ProviderDeliveryPair {
                        provider: None,
                        delivery_point: Some(test_delivery_point("mock", "alice")),
                    },
                    ProviderDeliveryPair {
                        provider: Some(test_provider("mock")),
                        delivery_point: None,
                    },
                ])
            });
        let backend = backend_with(vec![service], db, RetryPolicy::default());
        let handler = Arc::new(CollectingHandler::default());
        let handler_dyn: Arc<dyn ResponseHandler> = handler.clone();

        backend.push(
            "req-1",
            "myservice",
            &["alice".to_string()],
            &message("hi"),
            None,
            &handler_dyn,
        );
        let codes = handler.codes();
        assert!(codes.contains(&ResultCode::ErrorNoPushServiceProvider));
        assert!(codes.contains(&ResultCode::ErrorNoDeliveryPoint));
    }

    #[test]
    fn unregistered_endpoint_is_removed_exactly_once() {
        let service = ScriptedService::new("mock", |provider, destination, _| {
            (
                None,
                Some(PushError::Unregistered {
                    provider: provider.clone(),
                    destination: destination.clone(),
                }),
            )
        });
        let mut db = MockPushDatabase::new();
        db.expect_get_push_service_provider_delivery_point_pairs()
            .returning(|_, _| Ok(vec![pair("mock", "alice")]));
        db.expect_remove_delivery_point_from_service()
            .times(1)
            .withf(|service, subscriber, _| service == "myservice" && subscriber == "alice")
            .returning(|_, _, _| Ok(()));
        let backend = backend_with(vec![service], db, RetryPolicy::default());
        let handler = Arc::new(CollectingHandler::default());
        let handler_dyn: Arc<dyn ResponseHandler> = handler.clone();

        backend.push(
            "req-1",
            "myservice",
            &["alice".to_string()],
            &message("hi"),
            None,
            &handler_dyn,
        );
        assert_eq!(handler.codes(), vec![ResultCode::RemoveInvalidReg]);
    }

    #[test]
    fn credential_refresh_is_persisted_and_success_still_reported() {
        let service = ScriptedService::new("mock", |provider, _, _| {
            let mut rotated = provider.clone();
            rotated
                .volatile_data
                .insert("authtoken".to_string(), "tok-2".to_string());
            (
                Some(format!("mock:{}-7", provider.name())),
                Some(PushError::RefreshData {
                    provider: Some(rotated),
                    destination: None,
                    inner: None,
                }),
            )
        });
        let mut db = MockPushDatabase::new();
        db.expect_get_push_service_provider_delivery_point_pairs()
            .returning(|_, _| Ok(vec![pair("mock", "alice")]));
        db.expect_modify_push_service_provider()
            .times(1)
            .withf(|provider| provider.volatile_data.get("authtoken").map(String::as_str) == Some("tok-2"))
            .returning(|_| Ok(()));
        let backend = backend_with(vec![service], db, RetryPolicy::default());
        let handler = Arc::new(CollectingHandler::default());
        let handler_dyn: Arc<dyn ResponseHandler> = handler.clone();

        backend.push(
            "req-1",
            "myservice",
            &["alice".to_string()],
            &message("hi"),
            None,
            &handler_dyn,
        );
        assert_eq!(
            handler.codes(),
            vec![ResultCode::UpdatePushServiceProvider, ResultCode::Success]
        );
        let details = handler.details.lock().unwrap();
        assert!(details[1].message_id.as_deref().unwrap().ends_with("-7"));
    }

    #[test]
    fn transient_failures_double_until_the_ceiling() {
        let service = ScriptedService::new("mock", |provider, destination, content| {
            (
                None,
                Some(PushError::Retry {
                    provider: provider.clone(),
                    destination: destination.clone(),
                    content: content.clone(),
                    after: None,
                }),
            )
        });
        let mut db = MockPushDatabase::new();
        // Only the first attempt consults the store; retries carry the
        // injected pair.
        db.expect_get_push_service_provider_delivery_point_pairs()
            .times(1)
            .returning(|_, _| Ok(vec![pair("mock", "alice")]));
        let retry = RetryPolicy {
            initial: Duration::from_millis(5),
            ceiling: Duration::from_millis(60),
        };
        let backend = backend_with(vec![service.clone()], db, retry);
        let handler = Arc::new(CollectingHandler::default());
        let handler_dyn: Arc<dyn ResponseHandler> = handler.clone();

        backend.push(
            "req-1",
            "myservice",
            &["alice".to_string()],
            &message("hi"),
            None,
            &handler_dyn,
        );
        assert!(handler.wait_for(ResultCode::ErrorFailedRetry, Duration::from_secs(5)));
        // Delays 5, 10, 20 and 40ms fire; the next doubling crosses the
        // ceiling and is abandoned.
        assert_eq!(service.calls.load(Ordering::SeqCst), 5);
        assert_eq!(
            handler
                .codes()
                .iter()
                .filter(|c| **c == ResultCode::ErrorFailedRetry)
                .count(),
            1
        );
    }

    #[test]
    fn injected_pair_skips_the_database() {
        let service = ScriptedService::new("mock", succeed);
        // No lookup expectation: consulting the store here would fail the
        // test.
        let db = MockPushDatabase::new();
        let backend = backend_with(vec![service.clone()], db, RetryPolicy::default());
        let handler = Arc::new(CollectingHandler::default());
        let handler_dyn: Arc<dyn ResponseHandler> = handler.clone();

        backend.push_impl(
            "req-1",
            "myservice",
            &["alice".to_string()],
            &message("hi"),
            None,
            Some((test_provider("mock"), test_delivery_point("mock", "alice"))),
            Duration::ZERO,
            &handler_dyn,
        );
        assert_eq!(handler.codes(), vec![ResultCode::Success]);
        assert_eq!(service.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn per_delivery_point_values_round_robin_across_providers() {
        let first = ScriptedService::new("mock1", succeed);
        let second = ScriptedService::new("mock2", succeed);
        let mut db = MockPushDatabase::new();
        db.expect_get_push_service_provider_delivery_point_pairs()
            .returning(|_, _| {
                Ok(vec![pair("mock1", "alice"), pair("mock2", "alice")])
            });
        let backend = backend_with(vec![first.clone(), second.clone()], db, RetryPolicy::default());
        let handler = Arc::new(CollectingHandler::default());
        let handler_dyn: Arc<dyn ResponseHandler> = handler.clone();

        let per_dp = HashMap::from([(
            "uid".to_string(),
            vec!["u-1".to_string(), "u-2".to_string()],
        )]);
        backend.push(
            "req-1",
            "myservice",
            &["alice".to_string()],
            &message("hi"),
            Some(&per_dp),
            &handler_dyn,
        );

        let seen_first = first.seen.lock().unwrap();
        let seen_second = second.seen.lock().unwrap();
        assert_eq!(seen_first[0].data.get("uid").unwrap(), "u-1");
        assert_eq!(seen_second[0].data.get("uid").unwrap(), "u-2");
    }

    #[test]
    fn out_of_band_events_reach_the_reconciler() {
        let service = ScriptedService::new("mock", succeed);
        let mut db = MockPushDatabase::new();
        let (probe_tx, probe_rx) = unbounded();
        db.expect_modify_push_service_provider()
            .times(1)
            .returning(move |_| {
                probe_tx.send(()).unwrap();
                Ok(())
            });
        let _backend = backend_with(vec![service.clone()], db, RetryPolicy::default());

        service.report(PushError::UpdateProvider {
            provider: test_provider("mock"),
        });
        assert!(probe_rx.recv_timeout(Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn finalize_flushes_and_stops_the_drain() {
        let service = ScriptedService::new("mock", succeed);
        let mut db = MockPushDatabase::new();
        db.expect_flush_cache().times(1).returning(|| Ok(()));
        let backend = backend_with(vec![service], db, RetryPolicy::default());
        backend.finalize();
    }

    #[test]
    fn subscription_plumbing_delegates_to_the_store() {
        let service = ScriptedService::new("mock", succeed);
        let mut db = MockPushDatabase::new();
        db.expect_add_delivery_point_to_service()
            .times(1)
            .returning(|_, _, _| Ok(test_provider("mock")));
        db.expect_get_push_service_provider_delivery_point_pairs()
            .times(1)
            .returning(|_, _| Ok(vec![pair("mock", "alice")]));
        let backend = backend_with(vec![service], db, RetryPolicy::default());

        let provider = backend
            .subscribe("myservice", "alice", &test_delivery_point("mock", "alice"))
            .unwrap();
        assert_eq!(provider.push_service_type(), Some("mock"));
        assert_eq!(backend.number_of_delivery_points("myservice", "alice"), 1);
    }
}
