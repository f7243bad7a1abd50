/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The APNS adapter: a long-lived TLS socket per provider speaking the
//! binary framed protocol.
//!
//! The vendor acknowledges nothing on success; it only writes a 6-byte error
//! frame and then drops the socket. Correlation therefore runs on
//! notification ids: every send is held in an in-flight map until either an
//! error frame names it (everything before the named id was delivered,
//! everything after must be resent on a fresh connection) or the connection
//! has been quiet long enough that the whole map is declared delivered.
//!
//! Error frames that arrive after their originating `push` call has returned
//! are routed to the adapter's error-report channel.

pub mod frame;

use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use crate::error::{PushError, Result};
use crate::internal::config::GatewayConfig;
use crate::internal::registration::{
    DeliveryPoint, Notification, PushResult, PushServiceProvider,
};
use crate::internal::service::{check_compatibility, PushServiceType};

const SERVICE_NAME: &str = "apns";
const POLL_INTERVAL: Duration = Duration::from_millis(20);
const READ_POLL_TIMEOUT: Duration = Duration::from_millis(10);
const MAX_IN_FLIGHT: usize = 8192;
const DEFAULT_TTL_SECS: u64 = 3600;

/// The transport under the adapter: a duplex byte stream that supports read
/// polling. Production uses a client-authenticated TLS socket; tests run the
/// same worker over loopback TCP.
pub trait ApnsStream: Read + Write + Send {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()>;
}

impl ApnsStream for TcpStream {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }
}

impl ApnsStream for native_tls::TlsStream<TcpStream> {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()> {
        self.get_ref().set_read_timeout(timeout)
    }
}

/// Opens a fresh vendor connection for a provider.
pub trait ApnsConnector: Send + Sync {
    fn connect(&self, provider: &PushServiceProvider) -> Result<Box<dyn ApnsStream>>;
}

/// The production connector: TLS with the provider's client certificate,
/// against the sandbox or production gateway per the provider's flag.
pub struct TlsApnsConnector {
    production_host: String,
    sandbox_host: String,
}

impl TlsApnsConnector {
    pub fn new(config: &GatewayConfig) -> Self {
        Self {
            production_host: config.apns_production_host.clone(),
            sandbox_host: config.apns_sandbox_host.clone(),
        }
    }
}

impl ApnsConnector for TlsApnsConnector {
    fn connect(&self, provider: &PushServiceProvider) -> Result<Box<dyn ApnsStream>> {
        let sandbox = provider.fixed_data.get("sandbox").map(String::as_str) == Some("true");
        let host = if sandbox {
            &self.sandbox_host
        } else {
            &self.production_host
        };
        let cert_path = provider
            .fixed_data
            .get("cert")
            .ok_or(PushError::MissingKey { key: "cert" })?;
        let key_path = provider
            .fixed_data
            .get("key")
            .ok_or(PushError::MissingKey { key: "key" })?;
        let cert_pem = std::fs::read(cert_path)?;
        let key_pem = std::fs::read(key_path)?;
        let identity = native_tls::Identity::from_pkcs8(&cert_pem, &key_pem)
            .map_err(|e| PushError::Connection(format!("bad client certificate: {}", e)))?;
        let connector = native_tls::TlsConnector::builder()
            .identity(identity)
            .build()
            .map_err(|e| PushError::Connection(format!("TLS setup failed: {}", e)))?;
        let tcp = TcpStream::connect(host.as_str())?;
        let domain = host.rsplit_once(':').map(|(h, _)| h).unwrap_or(host);
        let stream = connector
            .connect(domain, tcp)
            .map_err(|e| PushError::Connection(format!("TLS handshake failed: {}", e)))?;
        Ok(Box::new(stream))
    }
}

/// One queued send, carried from `push` to the connection worker. The reply
/// sender resolves the originating `push` call's wait.
struct SendRequest {
    destination: DeliveryPoint,
    content: Notification,
    token: Vec<u8>,
    payload: Vec<u8>,
    expiry: u32,
    reply: Sender<PushResult>,
}

struct WorkerHandle {
    cmd_tx: Sender<SendRequest>,
    join: JoinHandle<()>,
}

pub struct ApnsService {
    connector: Arc<dyn ApnsConnector>,
    quiesce_window: Duration,
    workers: Mutex<HashMap<String, WorkerHandle>>,
    err_chan: Mutex<Option<Sender<PushError>>>,
}

impl ApnsService {
    pub fn new(config: &GatewayConfig) -> Self {
        Self::with_connector(
            Arc::new(TlsApnsConnector::new(config)),
            config.apns_quiesce_window,
        )
    }

    pub fn with_connector(connector: Arc<dyn ApnsConnector>, quiesce_window: Duration) -> Self {
        Self {
            connector,
            quiesce_window,
            workers: Mutex::new(HashMap::new()),
            err_chan: Mutex::new(None),
        }
    }

    fn worker_for(&self, provider: &PushServiceProvider) -> Sender<SendRequest> {
        let mut workers = self.workers.lock().unwrap();
        if let Some(handle) = workers.get(&provider.name()) {
            return handle.cmd_tx.clone();
        }
        let (cmd_tx, cmd_rx) = unbounded();
        let worker = ConnectionWorker {
            provider: provider.clone(),
            connector: Arc::clone(&self.connector),
            quiesce_window: self.quiesce_window,
            err_chan: self.err_chan.lock().unwrap().clone(),
            cmd_rx,
            stream: None,
            next_id: 1,
            in_flight: BTreeMap::new(),
            last_send: None,
            partial: Vec::new(),
        };
        let join = thread::spawn(move || worker.run());
        workers.insert(
            provider.name(),
            WorkerHandle {
                cmd_tx: cmd_tx.clone(),
                join,
            },
        );
        cmd_tx
    }
}

fn expiry_for(content: &Notification) -> u32 {
    let ttl = content
        .data
        .get("ttl")
        .and_then(|t| t.parse::<u64>().ok())
        .unwrap_or(DEFAULT_TTL_SECS);
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    (now + ttl).min(u32::MAX as u64) as u32
}

impl PushServiceType for ApnsService {
    fn name(&self) -> &'static str {
        SERVICE_NAME
    }

    fn build_push_service_provider_from_map(
        &self,
        kv: &HashMap<String, String>,
        provider: &mut PushServiceProvider,
    ) -> Result<()> {
        for key in ["service", "cert", "key"] {
            match kv.get(key) {
                Some(value) => {
                    provider.fixed_data.insert(key.to_string(), value.clone());
                }
                None => return Err(PushError::MissingKey { key }),
            }
        }
        if let Some(sandbox) = kv.get("sandbox") {
            provider
                .fixed_data
                .insert("sandbox".to_string(), sandbox.clone());
        }
        Ok(())
    }

    fn build_delivery_point_from_map(
        &self,
        kv: &HashMap<String, String>,
        delivery_point: &mut DeliveryPoint,
    ) -> Result<()> {
        for key in ["service", "subscriber", "devtoken"] {
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
        let payload = match frame::notification_payload(content) {
            Ok(payload) => payload,
            Err(err) => {
                // Can't serialize anything; fail every delivery point alike.
                let msg = err.to_string();
                for destination in dp_chan.iter() {
                    let _ = res_chan.send(PushResult {
                        provider: Some(provider.clone()),
                        destination: Some(destination),
                        content: Some(content.clone()),
                        msg_id: None,
                        err: Some(PushError::Connection(msg.clone())),
                    });
                }
                return;
            }
        };
        let expiry = expiry_for(content);
        let (reply_tx, reply_rx) = unbounded();
        let mut cmd_tx: Option<Sender<SendRequest>> = None;
        let mut submitted = 0usize;

        for destination in dp_chan.iter() {
            let fail = |err: PushError| PushResult {
                provider: Some(provider.clone()),
                destination: Some(destination.clone()),
                content: Some(content.clone()),
                msg_id: None,
                err: Some(err),
            };
            if let Err(err) = check_compatibility(provider, &destination, SERVICE_NAME) {
                let _ = res_chan.send(fail(err));
                continue;
            }
            let token_hex = destination
                .fixed_data
                .get("devtoken")
                .map(String::as_str)
                .unwrap_or_default();
            let token = match hex::decode(token_hex) {
                Ok(token) if !token.is_empty() => token,
                _ => {
                    let _ = res_chan.send(fail(PushError::InvalidDeliveryPoint {
                        provider: provider.clone(),
                        destination: destination.clone(),
                        reason: "malformed device token".to_string(),
                    }));
                    continue;
                }
            };
            if payload.len() > frame::MAX_ITEM_LEN {
                let _ = res_chan.send(fail(PushError::NotificationTooBig {
                    limit: frame::MAX_ITEM_LEN,
                }));
                continue;
            }
            let sender = cmd_tx.get_or_insert_with(|| self.worker_for(provider));
            let request = SendRequest {
                destination: destination.clone(),
                content: content.clone(),
                token,
                payload: payload.clone(),
                expiry,
                reply: reply_tx.clone(),
            };
            if sender.send(request).is_err() {
                let _ = res_chan.send(fail(PushError::Connection(
                    "connection worker unavailable".to_string(),
                )));
                continue;
            }
            submitted += 1;
        }

        // Wait for every submitted delivery point to settle, then close the
        // result stream by returning.
        drop(reply_tx);
        for _ in 0..submitted {
            match reply_rx.recv() {
                Ok(result) => {
                    let _ = res_chan.send(result);
                }
                Err(_) => break,
            }
        }
    }

    fn preview(&self, content: &Notification) -> Result<Vec<u8>> {
        frame::notification_payload(content)
    }

    fn set_error_report_chan(&self, chan: Sender<PushError>) {
        *self.err_chan.lock().unwrap() = Some(chan);
    }

    fn finalize(&self) {
        *self.err_chan.lock().unwrap() = None;
        let mut workers = self.workers.lock().unwrap();
        for (_, handle) in workers.drain() {
            drop(handle.cmd_tx);
            let _ = handle.join.join();
        }
    }
}

enum ReadOutcome {
    Nothing,
    Dropped,
    Frame([u8; frame::ERROR_FRAME_LEN]),
}

/// Owns one vendor connection. Single-threaded: commands, socket polling and
/// quiescence checks all interleave on this worker's loop.
struct ConnectionWorker {
    provider: PushServiceProvider,
    connector: Arc<dyn ApnsConnector>,
    quiesce_window: Duration,
    err_chan: Option<Sender<PushError>>,
    cmd_rx: Receiver<SendRequest>,
    stream: Option<Box<dyn ApnsStream>>,
    next_id: u32,
    in_flight: BTreeMap<u32, SendRequest>,
    last_send: Option<Instant>,
    partial: Vec<u8>,
}

impl ConnectionWorker {
    fn run(mut self) {
        loop {
            match self.cmd_rx.recv_timeout(POLL_INTERVAL) {
                Ok(request) => self.submit(request),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            self.poll_socket();
            self.check_quiescence();
        }
        // Adapter finalized; settle whatever is still outstanding.
        while !self.in_flight.is_empty() {
            self.poll_socket();
            self.check_quiescence();
            thread::sleep(POLL_INTERVAL);
        }
    }

    fn submit(&mut self, request: SendRequest) {
        // The in-flight map is bounded; the oldest entries have survived the
        // most subsequent sends, so age them out as delivered.
        while self.in_flight.len() >= MAX_IN_FLIGHT {
            if let Some((id, evicted)) = self.in_flight.pop_first() {
                let _ = evicted.reply.send(self.success_result(id, &evicted));
            }
        }
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        match frame::encode_notification(&request.token, &request.payload, id, request.expiry) {
            Ok(bytes) => self.write_frame(id, request, &bytes),
            Err(err) => {
                let result = self.error_result(&request, err);
                let _ = request.reply.send(result);
            }
        }
    }

    fn write_frame(&mut self, id: u32, request: SendRequest, bytes: &[u8]) {
        for attempt in 0..2 {
            if self.stream.is_none() {
                match self.connector.connect(&self.provider) {
                    Ok(stream) => self.stream = Some(stream),
                    Err(err) => {
                        log::warn!(
                            "PushServiceProvider={} APNS connect failed: {}",
                            self.provider.name(),
                            err
                        );
                        let result = self.retry_result(&request);
                        let _ = request.reply.send(result);
                        return;
                    }
                }
            }
            match self.stream.as_mut().expect("stream just opened").write_all(bytes) {
                Ok(()) => {
                    self.in_flight.insert(id, request);
                    self.last_send = Some(Instant::now());
                    return;
                }
                Err(err) => {
                    self.stream = None;
                    self.partial.clear();
                    if attempt == 1 {
                        log::warn!(
                            "PushServiceProvider={} APNS write failed: {}",
                            self.provider.name(),
                            err
                        );
                        let result = self.retry_result(&request);
                        let _ = request.reply.send(result);
                        return;
                    }
                }
            }
        }
    }

    fn poll_socket(&mut self) {
        let outcome = {
            let Some(stream) = self.stream.as_mut() else {
                return;
            };
            let _ = stream.set_read_timeout(Some(READ_POLL_TIMEOUT));
            let mut outcome = ReadOutcome::Nothing;
            let mut buf = [0u8; frame::ERROR_FRAME_LEN];
            loop {
                let needed = frame::ERROR_FRAME_LEN - self.partial.len();
                match stream.read(&mut buf[..needed]) {
                    Ok(0) => {
                        outcome = ReadOutcome::Dropped;
                        break;
                    }
                    Ok(n) => {
                        self.partial.extend_from_slice(&buf[..n]);
                        if self.partial.len() == frame::ERROR_FRAME_LEN {
                            let mut full = [0u8; frame::ERROR_FRAME_LEN];
                            full.copy_from_slice(&self.partial);
                            self.partial.clear();
                            outcome = ReadOutcome::Frame(full);
                            break;
                        }
                    }
                    Err(e)
                        if matches!(
                            e.kind(),
                            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                        ) =>
                    {
                        break;
                    }
                    Err(_) => {
                        outcome = ReadOutcome::Dropped;
                        break;
                    }
                }
            }
            outcome
        };
        match outcome {
            ReadOutcome::Nothing => {}
            ReadOutcome::Dropped => self.handle_connection_drop(),
            ReadOutcome::Frame(buf) => self.handle_error_frame(buf),
        }
    }

    /// An error frame is terminal for the connection: everything before the
    /// named id was delivered, the named id failed with the mapped error, and
    /// everything after it must go out again on a fresh connection.
    fn handle_error_frame(&mut self, buf: [u8; frame::ERROR_FRAME_LEN]) {
        self.stream = None;
        self.partial.clear();
        let error_frame = match frame::decode_error_frame(&buf) {
            Ok(error_frame) => error_frame,
            Err(err) => {
                self.report(PushError::Info(format!(
                    "garbled vendor response frame: {}",
                    err
                )));
                self.handle_connection_drop();
                return;
            }
        };
        self.last_send = None;
        let in_flight = std::mem::take(&mut self.in_flight);
        let mut known = false;
        let mut resend = Vec::new();
        for (id, request) in in_flight {
            if id < error_frame.id {
                let result = self.success_result(id, &request);
                let _ = request.reply.send(result);
            } else if id == error_frame.id {
                known = true;
                let result = match frame::status_to_error(
                    error_frame.status,
                    &self.provider,
                    &request.destination,
                    &request.content,
                ) {
                    Some(err) => self.error_result(&request, err),
                    None => self.success_result(id, &request),
                };
                let _ = request.reply.send(result);
            } else {
                resend.push(request);
            }
        }
        if !known {
            self.report(PushError::Info(format!(
                "apns error frame (status {}) for unknown or expired notification id {}",
                error_frame.status, error_frame.id
            )));
        }
        for request in resend {
            self.submit(request);
        }
    }

    /// Silent teardown: nothing was reported failed, so resend everything
    /// that was never acknowledged.
    fn handle_connection_drop(&mut self) {
        self.stream = None;
        self.partial.clear();
        self.last_send = None;
        let in_flight = std::mem::take(&mut self.in_flight);
        for (_, request) in in_flight {
            self.submit(request);
        }
    }

    fn check_quiescence(&mut self) {
        if self.in_flight.is_empty() {
            return;
        }
        let Some(last_send) = self.last_send else {
            return;
        };
        if last_send.elapsed() < self.quiesce_window {
            return;
        }
        self.last_send = None;
        let in_flight = std::mem::take(&mut self.in_flight);
        for (id, request) in in_flight {
            let result = self.success_result(id, &request);
            let _ = request.reply.send(result);
        }
    }

    fn success_result(&self, id: u32, request: &SendRequest) -> PushResult {
        PushResult {
            provider: Some(self.provider.clone()),
            destination: Some(request.destination.clone()),
            content: Some(request.content.clone()),
            msg_id: Some(format!("apns:{}-{}", self.provider.name(), id)),
            err: None,
        }
    }

    fn error_result(&self, request: &SendRequest, err: PushError) -> PushResult {
        PushResult {
            provider: Some(self.provider.clone()),
            destination: Some(request.destination.clone()),
            content: Some(request.content.clone()),
            msg_id: None,
            err: Some(err),
        }
    }

    fn retry_result(&self, request: &SendRequest) -> PushResult {
        self.error_result(
            request,
            PushError::Retry {
                provider: self.provider.clone(),
                destination: request.destination.clone(),
                content: request.content.clone(),
                after: None,
            },
        )
    }

    fn report(&self, err: PushError) {
        match &self.err_chan {
            Some(chan) => {
                let _ = chan.send(err);
            }
            None => log::warn!(
                "PushServiceProvider={} dropped out-of-band report: {}",
                self.provider.name(),
                err
            ),
        }
    }
}
