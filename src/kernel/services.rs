//! Declarative service orchestration
//!
//! Services are long-running children started through the [`ProcessManager`]
//! under the process id `svc:<id>`. The manager orders startup by dependency,
//! restarts crashed services with bounded backoff, and annotates each one
//! with the result of its periodic health probe. Health and liveness are
//! separate loops: a failing probe never restarts anything.

use super::bus::{EventBus, KernelEvent};
use super::health::{HealthCheckConfig, HealthProber, HealthStatus};
use super::process::{ProcessError, ProcessEvent, ProcessManager, ProcessOptions};
use super::store::now_millis;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const SERVICE_PROCESS_PREFIX: &str = "svc:";

/// How long a stop waits for the process to go away
pub const STOP_TIMEOUT: Duration = Duration::from_secs(10);

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Service not registered: {0}")]
    NotFound(String),

    #[error("Service '{0}' is active and cannot be re-registered")]
    AlreadyActive(String),

    #[error("Service '{service}' depends on unregistered service '{dependency}'")]
    UnknownDependency { service: String, dependency: String },

    #[error("Cyclic dependency among services: {}", .0.join(", "))]
    CyclicDependency(Vec<String>),

    #[error("Dependency '{dependency}' of service '{service}' is not running")]
    DependencyNotRunning { service: String, dependency: String },

    #[error("Failed to start service '{id}': {source}")]
    Spawn {
        id: String,
        #[source]
        source: ProcessError,
    },
}

pub type Result<T> = std::result::Result<T, ServiceError>;

/// Automatic restart after an unplanned exit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestartPolicy {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub max_attempts: u32,
    /// Delay before attempt N is `backoff_ms[min(N, len - 1)]`. Empty means
    /// restart immediately.
    #[serde(default)]
    pub backoff_ms: Vec<u64>,
}

fn default_true() -> bool {
    true
}

impl RestartPolicy {
    pub fn new(max_attempts: u32, backoff_ms: impl Into<Vec<u64>>) -> Self {
        Self {
            enabled: true,
            max_attempts,
            backoff_ms: backoff_ms.into(),
        }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let Some(last) = self.backoff_ms.len().checked_sub(1) else {
            return Duration::ZERO;
        };
        let index = (attempt as usize).min(last);
        Duration::from_millis(self.backoff_ms[index])
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDefinition {
    pub id: String,
    pub command: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub options: ProcessOptions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheckConfig>,
    #[serde(default, alias = "restartPolicy", skip_serializing_if = "Option::is_none")]
    pub restart: Option<RestartPolicy>,
}

impl ServiceDefinition {
    pub fn new<I, S>(id: impl Into<String>, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.into(),
            command: command.into_iter().map(Into::into).collect(),
            dependencies: Vec::new(),
            options: ProcessOptions::default(),
            health_check: None,
            restart: None,
        }
    }

    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.dependencies.push(id.into());
        self
    }

    pub fn options(mut self, options: ProcessOptions) -> Self {
        self.options = options;
        self
    }

    pub fn health_check(mut self, config: HealthCheckConfig) -> Self {
        self.health_check = Some(config);
        self
    }

    pub fn restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.restart = Some(policy);
        self
    }

    pub fn process_id(&self) -> String {
        format!("{}{}", SERVICE_PROCESS_PREFIX, self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Pending,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl ServiceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceState::Pending => "pending",
            ServiceState::Starting => "starting",
            ServiceState::Running => "running",
            ServiceState::Stopping => "stopping",
            ServiceState::Stopped => "stopped",
            ServiceState::Failed => "failed",
        }
    }

    /// Starting or running
    pub fn is_running(&self) -> bool {
        matches!(self, ServiceState::Starting | ServiceState::Running)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub id: String,
    pub state: ServiceState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub restart_count: u32,
    /// Unix milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_start_time: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_exit_code: Option<i32>,
    pub health_status: HealthStatus,
}

impl ServiceStatus {
    fn pending(id: &str) -> Self {
        Self {
            id: id.to_string(),
            state: ServiceState::Pending,
            pid: None,
            restart_count: 0,
            last_start_time: None,
            last_exit_code: None,
            health_status: HealthStatus::Unknown,
        }
    }
}

/// Lifecycle notifications
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServiceEvent {
    Starting { id: String },
    Started { id: String, pid: Option<u32> },
    Failed { id: String, error: String },
    Stopped { id: String },
    Exited { id: String, exit_code: i32 },
    HealthChanged { id: String, health_status: HealthStatus },
    RestartScheduled { id: String, attempt: u32, delay_ms: u64 },
    RestartExhausted { id: String, attempts: u32 },
}

impl ServiceEvent {
    pub fn id(&self) -> &str {
        match self {
            ServiceEvent::Starting { id }
            | ServiceEvent::Started { id, .. }
            | ServiceEvent::Failed { id, .. }
            | ServiceEvent::Stopped { id }
            | ServiceEvent::Exited { id, .. }
            | ServiceEvent::HealthChanged { id, .. }
            | ServiceEvent::RestartScheduled { id, .. }
            | ServiceEvent::RestartExhausted { id, .. } => id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ServiceEvent::Starting { .. } => "starting",
            ServiceEvent::Started { .. } => "started",
            ServiceEvent::Failed { .. } => "failed",
            ServiceEvent::Stopped { .. } => "stopped",
            ServiceEvent::Exited { .. } => "exited",
            ServiceEvent::HealthChanged { .. } => "health_changed",
            ServiceEvent::RestartScheduled { .. } => "restart_scheduled",
            ServiceEvent::RestartExhausted { .. } => "restart_exhausted",
        }
    }

    /// Bus topic, `kairo.service.<name>`
    pub fn topic(&self) -> String {
        format!("kairo.service.{}", self.name())
    }

    /// Event fields without the tag
    pub fn data(&self) -> serde_json::Value {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(mut map)) => {
                map.remove("event");
                serde_json::Value::Object(map)
            }
            _ => serde_json::json!({ "id": self.id() }),
        }
    }
}

/// Order services so each comes after all of its dependencies.
///
/// Kahn's algorithm; among services that are ready at the same time the one
/// registered first goes first.
pub fn resolve_start_order(defs: &[ServiceDefinition]) -> Result<Vec<String>> {
    let index: HashMap<&str, usize> = defs
        .iter()
        .enumerate()
        .map(|(i, d)| (d.id.as_str(), i))
        .collect();

    let mut in_degree = vec![0usize; defs.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); defs.len()];
    for (i, def) in defs.iter().enumerate() {
        for dep in &def.dependencies {
            let Some(&d) = index.get(dep.as_str()) else {
                return Err(ServiceError::UnknownDependency {
                    service: def.id.clone(),
                    dependency: dep.clone(),
                });
            };
            in_degree[i] += 1;
            dependents[d].push(i);
        }
    }

    let mut ready: BTreeSet<usize> = (0..defs.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(defs.len());
    while let Some(current) = ready.pop_first() {
        order.push(current);
        for &next in &dependents[current] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.insert(next);
            }
        }
    }

    if order.len() != defs.len() {
        let placed: HashSet<usize> = order.iter().copied().collect();
        let unresolved = (0..defs.len())
            .filter(|i| !placed.contains(i))
            .map(|i| defs[i].id.clone())
            .collect();
        return Err(ServiceError::CyclicDependency(unresolved));
    }

    Ok(order.into_iter().map(|i| defs[i].id.clone()).collect())
}

struct ServiceEntry {
    definition: ServiceDefinition,
    status: ServiceStatus,
    restart_attempts: u32,
    health_task: Option<CancellationToken>,
    pending_restart: Option<CancellationToken>,
    /// Serializes start/stop/exit handling of this one service
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl ServiceEntry {
    fn new(definition: ServiceDefinition) -> Self {
        Self {
            status: ServiceStatus::pending(&definition.id),
            definition,
            restart_attempts: 0,
            health_task: None,
            pending_restart: None,
            lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    fn stop_health_check(&mut self) {
        if let Some(token) = self.health_task.take() {
            token.cancel();
        }
    }

    fn cancel_restart(&mut self) {
        if let Some(token) = self.pending_restart.take() {
            token.cancel();
        }
    }
}

#[derive(Default)]
struct Registry {
    /// Registration order
    order: Vec<String>,
    entries: HashMap<String, ServiceEntry>,
}

struct Inner {
    processes: ProcessManager,
    registry: Mutex<Registry>,
    events: broadcast::Sender<ServiceEvent>,
    prober: HealthProber,
    closed: CancellationToken,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

/// Service registry and orchestrator
#[derive(Clone)]
pub struct ServiceManager {
    inner: Arc<Inner>,
}

impl ServiceManager {
    /// Must be called from within a Tokio runtime: it starts listening for
    /// process exits right away.
    pub fn new(processes: ProcessManager) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let inner = Arc::new(Inner {
            processes,
            registry: Mutex::new(Registry::default()),
            events,
            prober: HealthProber::new(),
            closed: CancellationToken::new(),
        });
        spawn_exit_listener(&inner);
        Self { inner }
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.inner.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: ServiceEvent) {
        debug!(service = %event.id(), "Service event: {}", event.name());
        let _ = self.inner.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.inner.events.subscribe()
    }

    /// Store a definition with a fresh `pending` status
    pub fn register_service(&self, definition: ServiceDefinition) -> Result<()> {
        let mut registry = self.registry();
        let id = definition.id.clone();
        if let Some(existing) = registry.entries.get_mut(&id) {
            if existing.status.state.is_running() || existing.status.state == ServiceState::Stopping {
                return Err(ServiceError::AlreadyActive(id));
            }
            existing.stop_health_check();
            existing.cancel_restart();
        } else {
            registry.order.push(id.clone());
        }
        info!("Registered service '{}'", id);
        registry.entries.insert(id, ServiceEntry::new(definition));
        Ok(())
    }

    pub fn definitions(&self) -> Vec<ServiceDefinition> {
        let registry = self.registry();
        registry
            .order
            .iter()
            .filter_map(|id| registry.entries.get(id))
            .map(|e| e.definition.clone())
            .collect()
    }

    pub fn get_service_status(&self, id: &str) -> Option<ServiceStatus> {
        self.registry().entries.get(id).map(|e| e.status.clone())
    }

    /// Statuses in registration order
    pub fn list_services(&self) -> Vec<ServiceStatus> {
        let registry = self.registry();
        registry
            .order
            .iter()
            .filter_map(|id| registry.entries.get(id))
            .map(|e| e.status.clone())
            .collect()
    }

    /// Current dependency order of every registered service
    pub fn start_order(&self) -> Result<Vec<String>> {
        resolve_start_order(&self.definitions())
    }

    /// Start every service in dependency order.
    ///
    /// A cycle or unknown dependency fails before anything starts. A service
    /// that fails to start is logged and reflected in its status; the rest
    /// are still attempted.
    pub async fn start_all(&self) -> Result<Vec<String>> {
        let order = self.start_order()?;
        info!("Starting services: {}", order.join(" -> "));
        for id in &order {
            if let Err(e) = self.start_one(id).await {
                error!("{}", e);
            }
        }
        Ok(order)
    }

    /// Stop every service in reverse dependency order
    pub async fn stop_all(&self) {
        let mut order = self.start_order().unwrap_or_else(|e| {
            warn!("Stopping services in registration order: {}", e);
            self.registry().order.clone()
        });
        order.reverse();
        for id in order {
            if let Err(e) = self.stop_service(&id).await {
                warn!("Failed to stop service '{}': {}", id, e);
            }
        }
    }

    /// Start `id`, first starting any dependency that is not running
    pub async fn start_service(&self, id: &str) -> Result<()> {
        let chain = self.dependency_chain(id)?;
        for dep in chain.iter().filter(|dep| dep.as_str() != id) {
            let running = self
                .get_service_status(dep)
                .is_some_and(|s| s.state == ServiceState::Running);
            if !running {
                warn!("Dependency '{}' of service '{}' not running, starting it", dep, id);
                self.start_one(dep).await?;
            }
        }
        self.start_one(id).await
    }

    /// `id` and its transitive dependencies, dependencies first
    fn dependency_chain(&self, id: &str) -> Result<Vec<String>> {
        let defs = self.definitions();
        let by_id: HashMap<&str, &ServiceDefinition> =
            defs.iter().map(|d| (d.id.as_str(), d)).collect();
        if !by_id.contains_key(id) {
            return Err(ServiceError::NotFound(id.to_string()));
        }

        let mut needed: HashSet<&str> = HashSet::new();
        let mut queue = VecDeque::from([id]);
        while let Some(current) = queue.pop_front() {
            if !needed.insert(current) {
                continue;
            }
            let Some(def) = by_id.get(current) else {
                continue;
            };
            for dep in &def.dependencies {
                if !by_id.contains_key(dep.as_str()) {
                    return Err(ServiceError::UnknownDependency {
                        service: current.to_string(),
                        dependency: dep.clone(),
                    });
                }
                queue.push_back(dep.as_str());
            }
        }

        let subset: Vec<ServiceDefinition> = defs
            .iter()
            .filter(|d| needed.contains(d.id.as_str()))
            .cloned()
            .collect();
        resolve_start_order(&subset)
    }

    fn entry_lock(&self, id: &str) -> Result<Arc<tokio::sync::Mutex<()>>> {
        self.registry()
            .entries
            .get(id)
            .map(|e| Arc::clone(&e.lock))
            .ok_or_else(|| ServiceError::NotFound(id.to_string()))
    }

    /// Start one service whose dependencies must already be running
    async fn start_one(&self, id: &str) -> Result<()> {
        let lock = self.entry_lock(id)?;
        let _guard = lock.lock().await;

        let definition = {
            let mut registry = self.registry();
            let Registry { entries, .. } = &mut *registry;

            let Some(entry) = entries.get(id) else {
                return Err(ServiceError::NotFound(id.to_string()));
            };
            if entry.status.state.is_running() {
                return Ok(());
            }
            let missing = entry.definition.dependencies.iter().find(|dep| {
                entries
                    .get(dep.as_str())
                    .is_none_or(|d| d.status.state != ServiceState::Running)
            });
            if let Some(dep) = missing {
                return Err(ServiceError::DependencyNotRunning {
                    service: id.to_string(),
                    dependency: dep.clone(),
                });
            }

            let Some(entry) = entries.get_mut(id) else {
                return Err(ServiceError::NotFound(id.to_string()));
            };
            entry.cancel_restart();
            entry.status.state = ServiceState::Starting;
            entry.status.last_start_time = Some(now_millis());
            entry.definition.clone()
        };
        self.emit(ServiceEvent::Starting { id: id.to_string() });

        let spawned = self.inner.processes.spawn(
            &definition.process_id(),
            &definition.command,
            definition.options.clone(),
            None,
        );

        let mut registry = self.registry();
        let Some(entry) = registry.entries.get_mut(id) else {
            return Err(ServiceError::NotFound(id.to_string()));
        };
        match spawned {
            Ok(pid) => {
                entry.status.state = ServiceState::Running;
                entry.status.pid = pid;
                entry.status.health_status = HealthStatus::Unknown;
                info!("Service '{}' started (PID {:?})", id, pid);
                if let Some(ref config) = definition.health_check {
                    entry.stop_health_check();
                    entry.health_task = Some(self.spawn_health_check(id, config.clone()));
                }
                drop(registry);
                self.emit(ServiceEvent::Started {
                    id: id.to_string(),
                    pid,
                });
                Ok(())
            }
            Err(source) => {
                entry.status.state = ServiceState::Failed;
                entry.status.pid = None;
                drop(registry);
                error!("Service '{}' failed to start: {}", id, source);
                self.emit(ServiceEvent::Failed {
                    id: id.to_string(),
                    error: source.to_string(),
                });
                Err(ServiceError::Spawn {
                    id: id.to_string(),
                    source,
                })
            }
        }
    }

    /// Stop a service and wait (bounded) for its process to exit.
    ///
    /// Stopping a failed service marks it stopped and cancels any pending
    /// restart.
    pub async fn stop_service(&self, id: &str) -> Result<()> {
        let lock = self.entry_lock(id)?;
        let _guard = lock.lock().await;

        let process_id = {
            let mut registry = self.registry();
            let Some(entry) = registry.entries.get_mut(id) else {
                return Err(ServiceError::NotFound(id.to_string()));
            };
            entry.cancel_restart();
            entry.stop_health_check();
            match entry.status.state {
                ServiceState::Starting | ServiceState::Running => {
                    entry.status.state = ServiceState::Stopping;
                    entry.definition.process_id()
                }
                ServiceState::Failed => {
                    entry.status.state = ServiceState::Stopped;
                    drop(registry);
                    info!("Service '{}' stopped (was failed)", id);
                    self.emit(ServiceEvent::Stopped { id: id.to_string() });
                    return Ok(());
                }
                ServiceState::Pending | ServiceState::Stopping | ServiceState::Stopped => {
                    return Ok(());
                }
            }
        };

        info!("Stopping service '{}'", id);
        let watcher = self.inner.processes.exit_watcher(&process_id).ok();
        match self.inner.processes.kill(&process_id) {
            Ok(_) => {
                if let Some(watcher) = watcher {
                    if tokio::time::timeout(STOP_TIMEOUT, watcher.wait())
                        .await
                        .is_err()
                    {
                        warn!("Service '{}' did not exit within {:?}", id, STOP_TIMEOUT);
                    }
                }
            }
            Err(e) => warn!("Failed to kill service '{}': {}", id, e),
        }

        if let Some(entry) = self.registry().entries.get_mut(id) {
            entry.status.state = ServiceState::Stopped;
            entry.status.pid = None;
        }
        info!("Service '{}' stopped", id);
        self.emit(ServiceEvent::Stopped { id: id.to_string() });
        Ok(())
    }

    /// Stop, reset restart accounting, start again
    pub async fn restart_service(&self, id: &str) -> Result<()> {
        self.stop_service(id).await?;
        if let Some(entry) = self.registry().entries.get_mut(id) {
            entry.restart_attempts = 0;
            entry.status.restart_count = 0;
        }
        self.start_service(id).await
    }

    async fn handle_exit(&self, id: &str, pid: Option<u32>, code: i32) {
        let Ok(lock) = self.entry_lock(id) else {
            return;
        };
        let _guard = lock.lock().await;

        let mut events = Vec::new();
        let scheduled = {
            let mut registry = self.registry();
            let Some(entry) = registry.entries.get_mut(id) else {
                return;
            };
            // Deliberate stops and exits of an older instance are not crashes
            if entry.status.state != ServiceState::Running || entry.status.pid != pid {
                debug!(
                    "Ignoring exit of '{}' (state {}, pid {:?})",
                    id,
                    entry.status.state.as_str(),
                    pid
                );
                return;
            }

            entry.status.state = ServiceState::Failed;
            entry.status.last_exit_code = Some(code);
            entry.status.pid = None;
            entry.stop_health_check();
            warn!("Service '{}' exited (code {})", id, code);
            events.push(ServiceEvent::Exited {
                id: id.to_string(),
                exit_code: code,
            });
            if entry.status.health_status != HealthStatus::Unhealthy {
                entry.status.health_status = HealthStatus::Unhealthy;
                events.push(ServiceEvent::HealthChanged {
                    id: id.to_string(),
                    health_status: HealthStatus::Unhealthy,
                });
            }

            match entry.definition.restart.clone().filter(|p| p.enabled) {
                None => None,
                Some(policy) if entry.restart_attempts >= policy.max_attempts => {
                    error!(
                        "Service '{}' reached max restart attempts ({})",
                        id, policy.max_attempts
                    );
                    events.push(ServiceEvent::RestartExhausted {
                        id: id.to_string(),
                        attempts: entry.restart_attempts,
                    });
                    None
                }
                Some(policy) => {
                    let attempt = entry.restart_attempts;
                    let delay = policy.delay_for(attempt);
                    entry.restart_attempts = attempt + 1;
                    entry.status.restart_count = attempt + 1;
                    let token = CancellationToken::new();
                    entry.pending_restart = Some(token.clone());
                    info!(
                        "Restarting service '{}' in {:?} (attempt {}/{})",
                        id,
                        delay,
                        attempt + 1,
                        policy.max_attempts
                    );
                    events.push(ServiceEvent::RestartScheduled {
                        id: id.to_string(),
                        attempt: attempt + 1,
                        delay_ms: delay.as_millis() as u64,
                    });
                    Some((delay, token))
                }
            }
        };

        for event in events {
            self.emit(event);
        }

        if let Some((delay, token)) = scheduled {
            let manager = self.clone();
            let id = id.to_string();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = token.cancelled() => return,
                }
                manager.restart_after_backoff(&id, &token).await;
            });
        }
    }

    async fn restart_after_backoff(&self, id: &str, token: &CancellationToken) {
        // A manual stop in the meantime cancels the restart
        let still_failed = !token.is_cancelled()
            && self
                .get_service_status(id)
                .is_some_and(|s| s.state == ServiceState::Failed);
        if !still_failed {
            debug!("Scheduled restart of '{}' cancelled", id);
            return;
        }
        if let Err(e) = self.start_service(id).await {
            error!("Automatic restart of '{}' failed: {}", id, e);
        }
    }

    fn spawn_health_check(&self, id: &str, config: HealthCheckConfig) -> CancellationToken {
        let token = CancellationToken::new();
        let cancel = token.clone();
        let weak = Arc::downgrade(&self.inner);
        let prober = self.inner.prober.clone();
        let id = id.to_string();

        tokio::spawn(async move {
            let interval = config.interval();
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let healthy = prober.probe(&config).await;
                if cancel.is_cancelled() {
                    break;
                }
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                ServiceManager { inner }.record_health(&id, HealthStatus::from(healthy));
            }
            debug!("Health check for '{}' stopped", id);
        });

        token
    }

    fn record_health(&self, id: &str, health: HealthStatus) {
        let changed = {
            let mut registry = self.registry();
            match registry.entries.get_mut(id) {
                Some(entry) if entry.status.health_status != health => {
                    entry.status.health_status = health;
                    true
                }
                _ => false,
            }
        };
        if changed {
            info!("Service '{}' is now {}", id, health.as_str());
            self.emit(ServiceEvent::HealthChanged {
                id: id.to_string(),
                health_status: health,
            });
        }
    }

    /// Republish every service event on `bus` as `kairo.service.<event>`
    pub fn bridge_to_bus(&self, bus: Arc<dyn EventBus>) -> JoinHandle<()> {
        let mut rx = self.subscribe();
        let closed = self.inner.closed.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = closed.cancelled() => break,
                    event = rx.recv() => event,
                };
                match event {
                    Ok(event) => {
                        bus.publish(KernelEvent::new(
                            event.topic(),
                            "kernel:services",
                            event.data(),
                        ));
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Service event bridge lagged, {} events dropped", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

fn spawn_exit_listener(inner: &Arc<Inner>) {
    let mut rx = inner.processes.subscribe();
    let closed = inner.closed.clone();
    let weak: Weak<Inner> = Arc::downgrade(inner);

    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = closed.cancelled() => break,
                event = rx.recv() => event,
            };
            let Some(event) = event else {
                break;
            };
            let ProcessEvent::Exit { id, pid, code } = event else {
                continue;
            };
            let Some(service_id) = id.strip_prefix(SERVICE_PROCESS_PREFIX) else {
                continue;
            };
            let Some(inner) = weak.upgrade() else {
                break;
            };
            let manager = ServiceManager { inner };
            let service_id = service_id.to_string();
            tokio::spawn(async move {
                manager.handle_exit(&service_id, pid, code).await;
            });
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::store::MemoryProcessStore;

    fn manager() -> ServiceManager {
        ServiceManager::new(ProcessManager::new(Arc::new(MemoryProcessStore::new())))
    }

    fn sleeper(id: &str) -> ServiceDefinition {
        ServiceDefinition::new(id, ["sleep", "30"])
    }

    async fn next_matching<F>(rx: &mut broadcast::Receiver<ServiceEvent>, pred: F) -> ServiceEvent
    where
        F: Fn(&ServiceEvent) -> bool,
    {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
                .await
                .expect("timed out waiting for service event")
                .expect("service event channel closed");
            if pred(&event) {
                return event;
            }
        }
    }

    #[test]
    fn test_start_order_respects_dependencies() {
        let defs = vec![
            ServiceDefinition::new("c", ["true"]).depends_on("a").depends_on("b"),
            ServiceDefinition::new("b", ["true"]).depends_on("a"),
            ServiceDefinition::new("a", ["true"]),
        ];
        assert_eq!(resolve_start_order(&defs).unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_start_order_ties_follow_registration() {
        let defs = vec![
            ServiceDefinition::new("x", ["true"]),
            ServiceDefinition::new("y", ["true"]),
            ServiceDefinition::new("z", ["true"]).depends_on("y"),
            ServiceDefinition::new("w", ["true"]),
        ];
        assert_eq!(resolve_start_order(&defs).unwrap(), vec!["x", "y", "w", "z"]);
    }

    #[test]
    fn test_cycle_names_all_members() {
        let defs = vec![
            ServiceDefinition::new("x", ["true"]).depends_on("y"),
            ServiceDefinition::new("y", ["true"]).depends_on("x"),
            ServiceDefinition::new("free", ["true"]),
        ];
        match resolve_start_order(&defs) {
            Err(ServiceError::CyclicDependency(ids)) => assert_eq!(ids, vec!["x", "y"]),
            other => panic!("expected cycle, got {:?}", other),
        }

        let selfish = vec![ServiceDefinition::new("s", ["true"]).depends_on("s")];
        assert!(matches!(
            resolve_start_order(&selfish),
            Err(ServiceError::CyclicDependency(_))
        ));
    }

    #[test]
    fn test_unknown_dependency() {
        let defs = vec![ServiceDefinition::new("a", ["true"]).depends_on("ghost")];
        assert!(matches!(
            resolve_start_order(&defs),
            Err(ServiceError::UnknownDependency { .. })
        ));
    }

    #[test]
    fn test_backoff_schedule() {
        let policy = RestartPolicy::new(5, vec![100, 200, 400]);
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(9), Duration::from_millis(400));
        assert_eq!(RestartPolicy::new(1, vec![]).delay_for(3), Duration::ZERO);
    }

    #[test]
    fn test_definition_wire_shape() {
        let def: ServiceDefinition = serde_json::from_value(serde_json::json!({
            "id": "db",
            "command": ["postgres"],
            "healthCheck": {"type": "tcp", "target": "5432", "intervalMs": 1000},
            "restartPolicy": {"maxAttempts": 3, "backoffMs": [100]}
        }))
        .unwrap();
        assert!(def.dependencies.is_empty());
        assert!(def.restart.as_ref().unwrap().enabled);
        assert_eq!(def.process_id(), "svc:db");
    }

    #[test]
    fn test_event_topics_and_data() {
        let event = ServiceEvent::HealthChanged {
            id: "db".into(),
            health_status: HealthStatus::Healthy,
        };
        assert_eq!(event.topic(), "kairo.service.health_changed");
        assert_eq!(
            event.data(),
            serde_json::json!({"id": "db", "healthStatus": "healthy"})
        );
    }

    #[tokio::test]
    async fn test_start_all_and_stop_all() {
        let services = manager();
        services.register_service(sleeper("a")).unwrap();
        services.register_service(sleeper("b").depends_on("a")).unwrap();
        services
            .register_service(sleeper("c").depends_on("a").depends_on("b"))
            .unwrap();
        assert_eq!(
            services.get_service_status("a").unwrap().state,
            ServiceState::Pending
        );

        let order = services.start_all().await.unwrap();
        assert_eq!(order, vec!["a", "b", "c"]);
        for status in services.list_services() {
            assert_eq!(status.state, ServiceState::Running);
            assert!(status.pid.is_some());
            assert!(status.last_start_time.is_some());
        }

        services.stop_all().await;
        for status in services.list_services() {
            assert_eq!(status.state, ServiceState::Stopped);
            assert!(status.pid.is_none());
        }
    }

    #[tokio::test]
    async fn test_start_all_with_cycle_starts_nothing() {
        let services = manager();
        services.register_service(sleeper("x").depends_on("y")).unwrap();
        services.register_service(sleeper("y").depends_on("x")).unwrap();
        let err = services.start_all().await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains('x') && message.contains('y'));
        assert_eq!(
            services.get_service_status("x").unwrap().state,
            ServiceState::Pending
        );
    }

    #[tokio::test]
    async fn test_start_service_brings_up_dependencies() {
        let services = manager();
        services.register_service(sleeper("db")).unwrap();
        services.register_service(sleeper("api").depends_on("db")).unwrap();

        services.start_service("api").await.unwrap();
        assert_eq!(
            services.get_service_status("db").unwrap().state,
            ServiceState::Running
        );
        services.stop_all().await;
    }

    #[tokio::test]
    async fn test_failed_spawn_marks_failed() {
        let services = manager();
        let mut rx = services.subscribe();
        services
            .register_service(ServiceDefinition::new("broken", ["/no/such/binary"]))
            .unwrap();
        assert!(services.start_service("broken").await.is_err());
        assert_eq!(
            services.get_service_status("broken").unwrap().state,
            ServiceState::Failed
        );
        let event = next_matching(&mut rx, |e| matches!(e, ServiceEvent::Failed { .. })).await;
        assert_eq!(event.id(), "broken");
    }

    #[tokio::test]
    async fn test_crash_without_policy_is_failed() {
        let services = manager();
        let mut rx = services.subscribe();
        services
            .register_service(ServiceDefinition::new("crash", ["sh", "-c", "exit 7"]))
            .unwrap();
        services.start_service("crash").await.unwrap();

        let event = next_matching(&mut rx, |e| matches!(e, ServiceEvent::Exited { .. })).await;
        assert_eq!(
            event,
            ServiceEvent::Exited {
                id: "crash".into(),
                exit_code: 7
            }
        );
        let status = services.get_service_status("crash").unwrap();
        assert_eq!(status.state, ServiceState::Failed);
        assert_eq!(status.last_exit_code, Some(7));
        assert_eq!(status.health_status, HealthStatus::Unhealthy);
        assert_eq!(status.restart_count, 0);
    }

    #[tokio::test]
    async fn test_restart_is_bounded() {
        let services = manager();
        let mut rx = services.subscribe();
        services
            .register_service(
                ServiceDefinition::new("flaky", ["sh", "-c", "exit 1"])
                    .restart_policy(RestartPolicy::new(3, vec![10, 20])),
            )
            .unwrap();
        services.start_service("flaky").await.unwrap();

        let event = next_matching(&mut rx, |e| {
            matches!(e, ServiceEvent::RestartExhausted { .. })
        })
        .await;
        assert_eq!(
            event,
            ServiceEvent::RestartExhausted {
                id: "flaky".into(),
                attempts: 3
            }
        );

        tokio::time::sleep(Duration::from_millis(300)).await;
        let status = services.get_service_status("flaky").unwrap();
        assert_eq!(status.restart_count, 3);
        assert_eq!(status.state, ServiceState::Failed);

        let mut starts = 0;
        let mut exhausted = 0;
        while let Ok(event) = rx.try_recv() {
            match event {
                ServiceEvent::Starting { .. } => starts += 1,
                ServiceEvent::RestartExhausted { .. } => exhausted += 1,
                _ => {}
            }
        }
        assert_eq!(starts, 0);
        assert_eq!(exhausted, 0);

        // Manual restart resets the budget, so it is spent in full again
        services.restart_service("flaky").await.unwrap();
        let event = next_matching(&mut rx, |e| {
            matches!(e, ServiceEvent::RestartExhausted { .. })
        })
        .await;
        assert_eq!(
            event,
            ServiceEvent::RestartExhausted {
                id: "flaky".into(),
                attempts: 3
            }
        );
        services.stop_service("flaky").await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_cancels_pending_restart() {
        let services = manager();
        let mut rx = services.subscribe();
        services
            .register_service(
                ServiceDefinition::new("slow", ["sh", "-c", "exit 1"])
                    .restart_policy(RestartPolicy::new(5, vec![60_000])),
            )
            .unwrap();
        services.start_service("slow").await.unwrap();
        next_matching(&mut rx, |e| {
            matches!(e, ServiceEvent::RestartScheduled { .. })
        })
        .await;

        services.stop_service("slow").await.unwrap();
        let status = services.get_service_status("slow").unwrap();
        assert_eq!(status.state, ServiceState::Stopped);
        assert_eq!(status.restart_count, 1);
    }

    #[tokio::test]
    async fn test_deliberate_stop_is_not_a_crash() {
        let services = manager();
        let mut rx = services.subscribe();
        services
            .register_service(sleeper("calm").restart_policy(RestartPolicy::new(3, vec![10])))
            .unwrap();
        services.start_service("calm").await.unwrap();
        services.stop_service("calm").await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        while let Ok(event) = rx.try_recv() {
            assert!(!matches!(
                event,
                ServiceEvent::Exited { .. } | ServiceEvent::RestartScheduled { .. }
            ));
        }
        assert_eq!(
            services.get_service_status("calm").unwrap().state,
            ServiceState::Stopped
        );
    }

    #[tokio::test]
    async fn test_file_health_check_tracks_file() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("healthy");
        let services = manager();
        let mut rx = services.subscribe();
        services
            .register_service(
                sleeper("checked")
                    .health_check(HealthCheckConfig::file(marker.display().to_string(), 200)),
            )
            .unwrap();
        services.start_service("checked").await.unwrap();
        assert_eq!(
            services.get_service_status("checked").unwrap().health_status,
            HealthStatus::Unknown
        );

        let event = next_matching(&mut rx, |e| matches!(e, ServiceEvent::HealthChanged { .. })).await;
        assert_eq!(
            event,
            ServiceEvent::HealthChanged {
                id: "checked".into(),
                health_status: HealthStatus::Unhealthy
            }
        );

        std::fs::write(&marker, b"ok").unwrap();
        next_matching(&mut rx, |e| {
            matches!(
                e,
                ServiceEvent::HealthChanged {
                    health_status: HealthStatus::Healthy,
                    ..
                }
            )
        })
        .await;
        assert_eq!(
            services.get_service_status("checked").unwrap().health_status,
            HealthStatus::Healthy
        );

        std::fs::remove_file(&marker).unwrap();
        next_matching(&mut rx, |e| {
            matches!(
                e,
                ServiceEvent::HealthChanged {
                    health_status: HealthStatus::Unhealthy,
                    ..
                }
            )
        })
        .await;

        // Health never changes the lifecycle state
        assert_eq!(
            services.get_service_status("checked").unwrap().state,
            ServiceState::Running
        );
        services.stop_service("checked").await.unwrap();
    }

    #[tokio::test]
    async fn test_bridge_publishes_service_topics() {
        use crate::kernel::bus::InMemoryBus;

        let bus = Arc::new(InMemoryBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe(
            "kairo.service.*",
            Arc::new(move |e: &KernelEvent| sink.lock().unwrap().push(e.event_type.clone())),
        )
        .unwrap();

        let services = manager();
        let _bridge = services.bridge_to_bus(bus);
        services.register_service(sleeper("bridged")).unwrap();
        services.start_service("bridged").await.unwrap();
        services.stop_service("bridged").await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                "kairo.service.starting",
                "kairo.service.started",
                "kairo.service.stopped"
            ]
        );
    }

    #[tokio::test]
    async fn test_reregister_active_service_is_rejected() {
        let services = manager();
        services.register_service(sleeper("one")).unwrap();
        services.start_service("one").await.unwrap();
        assert!(matches!(
            services.register_service(sleeper("one")),
            Err(ServiceError::AlreadyActive(_))
        ));
        services.stop_service("one").await.unwrap();
        services.register_service(sleeper("one")).unwrap();
        assert_eq!(services.list_services().len(), 1);
    }
}
