//! In-process transport, registered as the `default` driver.
//!
//! Requests are served by the local registry under the caller's timeout;
//! publish and enqueue decode up front and run the handler on the detached
//! pool. Nothing touches the network.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use corebus_core::envelope::{decode_request, encode_response};
use corebus_core::{parse_subject, Map, ResponseEnvelope, SubjectKind};
use parking_lot::Mutex;

use super::config::BusInstance;
use super::connection::{Connection, Driver, ServiceStats, StatsRecorder};
use crate::error::{InvocationError, TransportError};
use crate::meta::Meta;
use crate::registry::Host;

/// Driver for [`InprocConnection`].
#[derive(Debug, Clone, Copy, Default)]
pub struct InprocDriver;

#[async_trait]
impl Driver for InprocDriver {
    async fn connect(&self, instance: BusInstance) -> Result<Arc<dyn Connection>, TransportError> {
        Ok(Arc::new(InprocConnection::new(instance)))
    }
}

#[derive(Debug, Default)]
struct State {
    open: bool,
    running: bool,
    subjects: BTreeSet<String>,
}

/// A loopback connection that serves registered Services from the host.
pub struct InprocConnection {
    name: String,
    prefix: String,
    host: Arc<dyn Host>,
    state: Mutex<State>,
    stats: Arc<StatsRecorder>,
}

impl InprocConnection {
    #[must_use]
    pub fn new(instance: BusInstance) -> Self {
        Self {
            name: instance.name,
            prefix: instance.config.prefix,
            host: instance.host,
            state: Mutex::new(State::default()),
            stats: Arc::new(StatsRecorder::new()),
        }
    }

    /// Checks the connection can take traffic for `subject` and returns the
    /// service name plus whether it is served here.
    fn accept(&self, subject: &str, expected: SubjectKind) -> Result<(String, bool), TransportError> {
        let state = self.state.lock();
        if !state.open {
            return Err(TransportError::NotConnected);
        }
        if !state.running {
            return Err(TransportError::NotRunning);
        }
        match parse_subject(&self.prefix, subject) {
            Some((kind, name)) if kind == expected => {
                Ok((name.to_string(), state.subjects.contains(name)))
            }
            _ => Err(TransportError::InvalidSubject),
        }
    }

    fn deliver(&self, subject: &str, kind: SubjectKind, data: &Bytes) -> Result<(), InvocationError> {
        let (name, served) = self.accept(subject, kind)?;
        let req = decode_request(data)?;
        if !served {
            tracing::debug!(bus = %self.name, subject, "no subscriber, message dropped");
            return Ok(());
        }

        let host = Arc::clone(&self.host);
        let stats = Arc::clone(&self.stats);
        self.host.detach(Box::pin(async move {
            let started = Instant::now();
            let meta = Arc::new(Meta::from_metadata(req.metadata));
            let ok = match host.serve(meta, name.clone(), req.payload).await {
                Some((_, res)) if res.is_fail() => {
                    tracing::warn!(service = %name, state = %res.state, "detached delivery failed");
                    false
                }
                Some(_) => true,
                None => false,
            };
            stats.record(&name, started, ok);
        }));
        Ok(())
    }
}

#[async_trait]
impl Connection for InprocConnection {
    async fn open(&self) -> Result<(), TransportError> {
        self.state.lock().open = true;
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.open = false;
        state.running = false;
        Ok(())
    }

    async fn register(&self, subject: &str) -> Result<(), TransportError> {
        if subject.is_empty() {
            return Err(TransportError::InvalidSubject);
        }
        let mut state = self.state.lock();
        if state.running {
            return Err(TransportError::AlreadyRunning);
        }
        state.subjects.insert(subject.to_string());
        Ok(())
    }

    async fn start(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(TransportError::NotConnected);
        }
        if state.running {
            return Err(TransportError::AlreadyRunning);
        }
        state.running = true;
        Ok(())
    }

    async fn stop(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if !state.running {
            return Err(TransportError::NotRunning);
        }
        state.running = false;
        Ok(())
    }

    async fn request(&self, subject: &str, data: Bytes, timeout: Duration) -> Result<Bytes, InvocationError> {
        let (name, served) = self.accept(subject, SubjectKind::Call)?;
        let req = decode_request(&data)?;
        let started = Instant::now();

        let (payload, res) = if served {
            let meta = Arc::new(Meta::from_metadata(req.metadata));
            let call = Arc::clone(&self.host).serve(meta, name.clone(), req.payload);
            match tokio::time::timeout(timeout, call).await {
                Ok(Some(out)) => out,
                Ok(None) => (Map::new(), InvocationError::NotFound(name.clone()).into()),
                Err(_) => {
                    self.stats.record(&name, started, false);
                    return Err(TransportError::Timeout(timeout).into());
                }
            }
        } else {
            (Map::new(), InvocationError::NotFound(name.clone()).into())
        };

        self.stats.record(&name, started, res.is_ok());
        let bytes = encode_response(&ResponseEnvelope::new(payload, &res))?;
        Ok(Bytes::from(bytes))
    }

    async fn publish(&self, subject: &str, data: Bytes) -> Result<(), InvocationError> {
        self.deliver(subject, SubjectKind::Event, &data)
    }

    async fn enqueue(&self, subject: &str, data: Bytes) -> Result<(), InvocationError> {
        self.deliver(subject, SubjectKind::Queue, &data)
    }

    fn stats(&self) -> Vec<ServiceStats> {
        self.stats.snapshot()
    }
}
