//! Producer-facing telemetry API
//!
//! [`Telemetry`] ties the pieces together for one application: a
//! durable queue that [`track`](Telemetry::track) appends to, and a
//! scheduler that drains it to the collector in the background.
//!
//! ```rust,no_run
//! use beacon_core::{Config, Telemetry};
//! use serde_json::{json, Map};
//!
//! # async fn run() -> beacon_core::Result<()> {
//! let config = Config::load()?;
//! let telemetry = Telemetry::open(&config)?;
//! telemetry.start()?;
//!
//! let mut payload = Map::new();
//! payload.insert("screen".to_string(), json!("settings"));
//! telemetry.track("page_view", payload)?;
//! # Ok(())
//! # }
//! ```

use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tokio_util::task::TaskTracker;

use crate::config::{AppConfig, Config, DispatchConfig};
use crate::dispatch::{DispatchAttempt, DispatchProgress, Dispatcher};
use crate::error::{Error, Result};
use crate::lock::LockManager;
use crate::queue::{Event, EventQueue};
use crate::reachability::{ConnectionMonitor, ReachabilityProbe};
use crate::scheduler::{timer_runtime, DispatchScheduler, SchedulerState};
use crate::store::{DurableStore, SqliteBackend};
use crate::transport::{HttpTransport, Transport};

/// Payload key carrying the application identity
const APP_KEY: &str = "_app";

/// Collection recorded once by [`Telemetry::start`]
pub const LOAD_COLLECTION: &str = "load";

/// Buffered event delivery for one application
pub struct Telemetry<T = HttpTransport, P = Arc<ConnectionMonitor>> {
    app_id: String,
    initial_delay: Duration,
    scheduler: DispatchScheduler<T, P>,
    context: RwLock<Map<String, Value>>,
    direct_sends: TaskTracker,
}

impl Telemetry {
    /// Open the on-disk store and HTTP transport described by `config`
    ///
    /// Fails with [`Error::Config`] when the app id or write key is
    /// missing. The returned instance reports reachable until the host
    /// feeds connection updates into [`Telemetry::connection`].
    pub fn open(config: &Config) -> Result<Self> {
        config.app.validate()?;

        let path = config.store_path();
        tracing::info!(path = %path.display(), "Opening event store");
        let backend = SqliteBackend::open(&path)?;
        let store = Arc::new(DurableStore::new(Arc::new(backend)));

        let transport = HttpTransport::new(&config.app, config.dispatch.timeout())?;
        Self::with_parts(
            &config.app,
            &config.dispatch,
            store,
            transport,
            Arc::new(ConnectionMonitor::new()),
        )
    }

    /// Connection state consulted before each dispatch
    pub fn connection(&self) -> &ConnectionMonitor {
        self.dispatcher().probe()
    }
}

impl<T, P> Telemetry<T, P>
where
    T: Transport + 'static,
    P: ReachabilityProbe + 'static,
{
    /// Assemble from explicit parts
    pub fn with_parts(
        app: &AppConfig,
        dispatch: &DispatchConfig,
        store: Arc<DurableStore>,
        transport: T,
        probe: P,
    ) -> Result<Self> {
        app.validate()?;
        let app_id = app.require_app_id()?.to_string();

        let dispatcher = Dispatcher::new(
            EventQueue::new(store.clone(), &app_id),
            Arc::new(LockManager::new(store)),
            transport,
            probe,
            &app_id,
        );
        let scheduler = DispatchScheduler::new(Arc::new(dispatcher), dispatch.interval());

        let mut app_context = Map::new();
        app_context.insert("app_id".to_string(), Value::String(app_id.clone()));
        let mut context = Map::new();
        context.insert(APP_KEY.to_string(), Value::Object(app_context));

        Ok(Self {
            app_id,
            initial_delay: dispatch.initial_delay(),
            scheduler,
            context: RwLock::new(context),
            direct_sends: TaskTracker::new(),
        })
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn dispatcher(&self) -> &Dispatcher<T, P> {
        self.scheduler.dispatcher()
    }

    pub fn scheduler(&self) -> &DispatchScheduler<T, P> {
        &self.scheduler
    }

    /// Record an event for later delivery
    ///
    /// Returns once the event is persisted; never waits on the network.
    /// With periodic dispatch disabled the event is instead handed to a
    /// background send and not stored at all.
    pub fn track(&self, collection: &str, payload: Map<String, Value>) -> Result<()> {
        let payload = self.with_context(payload);

        if self.scheduler.interval().is_none() {
            return self.send_direct(collection, payload);
        }

        self.dispatcher().queue().enqueue(collection, payload)?;
        Ok(())
    }

    /// Merge a property into every subsequently tracked payload
    ///
    /// Context properties replace caller keys of the same name. `_app`
    /// cannot be overridden.
    pub fn set_context(&self, key: impl Into<String>, value: Value) {
        let key = key.into();
        if key == APP_KEY {
            tracing::warn!("Ignoring attempt to override {} context", APP_KEY);
            return;
        }
        self.context
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, value);
    }

    /// Record the `load` event and arm the dispatch timer
    ///
    /// Outside a Tokio runtime this fails with [`Error::Config`] before
    /// anything is recorded.
    pub fn start(&self) -> Result<()> {
        timer_runtime()?;
        self.track(LOAD_COLLECTION, Map::new())?;
        self.scheduler
            .start(self.scheduler.interval(), self.initial_delay)
    }

    pub fn stop(&self) {
        self.scheduler.stop();
    }

    /// Run one dispatch attempt now
    pub async fn dispatch_now(&self) -> DispatchAttempt {
        self.scheduler.dispatch_now().await
    }

    /// Current periodic interval; `None` means events are sent directly
    pub fn dispatch_interval(&self) -> Option<Duration> {
        self.scheduler.interval()
    }

    /// Change the periodic interval; zero or negative switches to direct sends
    pub fn set_dispatch_interval(&self, secs: i64) -> Result<()> {
        self.scheduler.set_interval(secs)
    }

    /// Wait for direct sends started by earlier `track` calls
    pub async fn drain_direct_sends(&self) {
        self.direct_sends.close();
        self.direct_sends.wait().await;
        self.direct_sends.reopen();
    }

    pub fn state(&self) -> SchedulerState {
        self.scheduler.state()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DispatchProgress> {
        self.dispatcher().subscribe()
    }

    fn with_context(&self, mut payload: Map<String, Value>) -> Map<String, Value> {
        let context = self.context.read().unwrap_or_else(|e| e.into_inner());
        for (key, value) in context.iter() {
            payload.insert(key.clone(), value.clone());
        }
        payload
    }

    fn send_direct(&self, collection: &str, payload: Map<String, Value>) -> Result<()> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|_| Error::Config("direct send requires a Tokio runtime".to_string()))?;

        let dispatcher = Arc::clone(self.scheduler.dispatcher());
        let collection = collection.to_string();
        let event = Event::new(payload);
        tracing::debug!(collection = %collection, "Sending event directly");

        self.direct_sends.spawn_on(
            async move {
                // Failures are logged by the dispatcher and dropped
                let _ = dispatcher.send_direct(&collection, event).await;
            },
            &handle,
        );
        Ok(())
    }
}
