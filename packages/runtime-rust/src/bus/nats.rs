//! NATS transport, available with the `nats` feature.
//!
//! For every registered subject `s` a started connection subscribes to
//! `{prefix}call.s` and `{prefix}queue.s` in a queue group, and to
//! `{prefix}event.s` as a plain subscription. Each inbound message is
//! served on the host's detached pool.
//!
//! Settings: `url`/`server`, `user`/`username`, `pass`/`password`, `group`.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_nats::{Client, ConnectOptions, Message, Subscriber};
use async_trait::async_trait;
use bytes::Bytes;
use corebus_core::envelope::{decode_request, encode_response};
use corebus_core::{subject as make_subject, Map, Res, ResponseEnvelope, SubjectKind};
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use super::config::{BusConfig, BusInstance};
use super::connection::{Connection, Driver, ServiceStats, StatsRecorder};
use crate::error::{InvocationError, TransportError};
use crate::meta::Meta;
use crate::registry::Host;

const DEFAULT_URL: &str = "nats://127.0.0.1:4222";

/// Driver for [`NatsConnection`].
#[derive(Debug, Clone, Copy, Default)]
pub struct NatsDriver;

#[async_trait]
impl Driver for NatsDriver {
    async fn connect(&self, instance: BusInstance) -> Result<Arc<dyn Connection>, TransportError> {
        Ok(Arc::new(NatsConnection::new(instance)))
    }
}

/// A connection to a NATS server.
pub struct NatsConnection {
    name: String,
    config: BusConfig,
    host: Arc<dyn Host>,
    client: Mutex<Option<Client>>,
    subjects: Mutex<BTreeSet<String>>,
    workers: Mutex<Option<Vec<JoinHandle<()>>>>,
    stats: Arc<StatsRecorder>,
}

impl NatsConnection {
    #[must_use]
    pub fn new(instance: BusInstance) -> Self {
        Self {
            name: instance.name,
            config: instance.config,
            host: instance.host,
            client: Mutex::new(None),
            subjects: Mutex::new(BTreeSet::new()),
            workers: Mutex::new(None),
            stats: Arc::new(StatsRecorder::new()),
        }
    }

    fn client(&self) -> Result<Client, TransportError> {
        self.client.lock().clone().ok_or(TransportError::NotConnected)
    }

    fn group(&self, subject: &str) -> String {
        self.config
            .setting_str(&["group"])
            .map_or_else(|| subject.to_string(), str::to_string)
    }

    async fn subscribe(
        &self,
        client: &Client,
        kind: SubjectKind,
        name: &str,
    ) -> Result<Subscriber, TransportError> {
        let subject = make_subject(&self.config.prefix, kind, name);
        let result = if kind.is_load_shared() {
            client.queue_subscribe(subject, self.group(name)).await
        } else {
            client.subscribe(subject).await
        };
        result.map_err(|e| TransportError::Io(e.to_string()))
    }

    fn spawn_worker(&self, client: Client, kind: SubjectKind, name: String, mut sub: Subscriber) -> JoinHandle<()> {
        let host = Arc::clone(&self.host);
        let stats = Arc::clone(&self.stats);
        tokio::spawn(async move {
            while let Some(msg) = sub.next().await {
                let client = client.clone();
                let served = Arc::clone(&host);
                let stats = Arc::clone(&stats);
                let name = name.clone();
                host.detach(Box::pin(async move {
                    handle(served, client, stats, kind, name, msg).await;
                }));
            }
        })
    }
}

async fn handle(
    host: Arc<dyn Host>,
    client: Client,
    stats: Arc<StatsRecorder>,
    kind: SubjectKind,
    name: String,
    msg: Message,
) {
    let started = Instant::now();
    let (payload, res) = match decode_request(&msg.payload) {
        Ok(req) => {
            let meta = Arc::new(Meta::from_metadata(req.metadata));
            host.serve(meta, name.clone(), req.payload)
                .await
                .unwrap_or_else(|| (Map::new(), InvocationError::NotFound(name.clone()).into()))
        }
        Err(e) => {
            if kind != SubjectKind::Call {
                tracing::warn!(subject = %msg.subject, error = %e, "dropping undecodable message");
            }
            (Map::new(), Res::from(InvocationError::Protocol(e)))
        }
    };
    stats.record(&name, started, res.is_ok());

    if kind != SubjectKind::Call {
        if res.is_fail() {
            tracing::warn!(service = %name, state = %res.state, "detached delivery failed");
        }
        return;
    }
    let Some(reply) = msg.reply else {
        tracing::warn!(subject = %msg.subject, "call without reply subject");
        return;
    };
    match encode_response(&ResponseEnvelope::new(payload, &res)) {
        Ok(bytes) => {
            if let Err(e) = client.publish(reply, Bytes::from(bytes)).await {
                tracing::warn!(service = %name, error = %e, "failed to send reply");
            }
        }
        Err(e) => tracing::warn!(service = %name, error = %e, "failed to encode reply"),
    }
}

#[async_trait]
impl Connection for NatsConnection {
    async fn open(&self) -> Result<(), TransportError> {
        let url = self
            .config
            .setting_str(&["url", "server"])
            .unwrap_or(DEFAULT_URL)
            .to_string();
        let mut options = ConnectOptions::new().name(self.name.as_str());
        if let (Some(user), Some(pass)) = (
            self.config.setting_str(&["user", "username"]),
            self.config.setting_str(&["pass", "password"]),
        ) {
            options = options.user_and_password(user.to_string(), pass.to_string());
        }

        let client = options
            .connect(url.as_str())
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        tracing::info!(bus = %self.name, url = %url, "connected to nats");
        *self.client.lock() = Some(client);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if let Some(workers) = self.workers.lock().take() {
            for worker in workers {
                worker.abort();
            }
        }
        let client = self.client.lock().take();
        if let Some(client) = client {
            client
                .flush()
                .await
                .map_err(|e| TransportError::Io(e.to_string()))?;
        }
        Ok(())
    }

    async fn register(&self, subject: &str) -> Result<(), TransportError> {
        if subject.is_empty() {
            return Err(TransportError::InvalidSubject);
        }
        if self.workers.lock().is_some() {
            return Err(TransportError::AlreadyRunning);
        }
        self.subjects.lock().insert(subject.to_string());
        Ok(())
    }

    async fn start(&self) -> Result<(), TransportError> {
        if self.workers.lock().is_some() {
            return Err(TransportError::AlreadyRunning);
        }
        let client = self.client()?;
        let subjects: Vec<String> = self.subjects.lock().iter().cloned().collect();

        let mut workers = Vec::with_capacity(subjects.len() * SubjectKind::ALL.len());
        for name in subjects {
            for kind in SubjectKind::ALL {
                let sub = match self.subscribe(&client, kind, &name).await {
                    Ok(sub) => sub,
                    Err(e) => {
                        for worker in workers {
                            worker.abort();
                        }
                        return Err(e);
                    }
                };
                workers.push(self.spawn_worker(client.clone(), kind, name.clone(), sub));
            }
        }
        *self.workers.lock() = Some(workers);
        Ok(())
    }

    async fn stop(&self) -> Result<(), TransportError> {
        let workers = self.workers.lock().take().ok_or(TransportError::NotRunning)?;
        // Dropping a subscriber unsubscribes it.
        for worker in workers {
            worker.abort();
        }
        Ok(())
    }

    async fn request(&self, subject: &str, data: Bytes, timeout: Duration) -> Result<Bytes, InvocationError> {
        let client = self.client()?;
        match tokio::time::timeout(timeout, client.request(subject.to_string(), data)).await {
            Ok(Ok(msg)) => Ok(msg.payload),
            Ok(Err(e)) => Err(TransportError::Io(e.to_string()).into()),
            Err(_) => Err(TransportError::Timeout(timeout).into()),
        }
    }

    async fn publish(&self, subject: &str, data: Bytes) -> Result<(), InvocationError> {
        let client = self.client()?;
        client
            .publish(subject.to_string(), data)
            .await
            .map_err(|e| InvocationError::from(TransportError::Io(e.to_string())))
    }

    async fn enqueue(&self, subject: &str, data: Bytes) -> Result<(), InvocationError> {
        // Queue delivery is decided by the subscribers' queue group.
        self.publish(subject, data).await
    }

    fn stats(&self) -> Vec<ServiceStats> {
        self.stats.snapshot()
    }
}
