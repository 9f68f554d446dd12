use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::process::{Child, Command};
use tokio::time::sleep;

use crate::config::EngineConfig;
use crate::error::EngineError;

/// Grace period between SIGTERM and SIGKILL when stopping a service.
const STOP_GRACE: Duration = Duration::from_secs(5);
/// Overall budget for a restart to become healthy.
const RESTART_DEADLINE: Duration = Duration::from_secs(60);

/// The local model services sharing the single GPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    Llm,
    Image,
    Vision,
    Vlm,
}

impl ServiceKind {
    pub fn all() -> [ServiceKind; 4] {
        [
            ServiceKind::Llm,
            ServiceKind::Image,
            ServiceKind::Vision,
            ServiceKind::Vlm,
        ]
    }

    pub fn name(self) -> &'static str {
        match self {
            ServiceKind::Llm => "llm",
            ServiceKind::Image => "image",
            ServiceKind::Vision => "vision",
            ServiceKind::Vlm => "vlm",
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            ServiceKind::Llm => 8003,
            ServiceKind::Image => 8001,
            ServiceKind::Vision => 8002,
            ServiceKind::Vlm => 8004,
        }
    }

    fn url_env_var(self) -> &'static str {
        match self {
            ServiceKind::Llm => "LLM_URL",
            ServiceKind::Image => "IMAGE_URL",
            ServiceKind::Vision => "VISION_URL",
            ServiceKind::Vlm => "VLM_URL",
        }
    }

    /// The heavyweight services that must be evicted before this one can own
    /// the GPU. Vision is light enough to coexist.
    fn conflicting(self) -> Vec<ServiceKind> {
        match self {
            ServiceKind::Llm => vec![ServiceKind::Image, ServiceKind::Vlm],
            ServiceKind::Image => vec![ServiceKind::Llm, ServiceKind::Vlm],
            ServiceKind::Vlm => vec![ServiceKind::Llm, ServiceKind::Image],
            ServiceKind::Vision => vec![ServiceKind::Llm, ServiceKind::Image],
        }
    }
}

impl std::fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// How to launch a service when it needs an auto-restart. Services without a
/// command are externally managed and can only be health-checked.
#[derive(Debug, Clone)]
pub struct ServiceCommand {
    pub program: String,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Default)]
struct ServiceState {
    intended_running: bool,
    last_healthy_at: Option<DateTime<Utc>>,
    needs_restart: bool,
    pid: Option<u32>,
    port: Option<u16>,
}

/// Snapshot of one service for status output.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub service: ServiceKind,
    pub url: String,
    pub healthy: bool,
    pub stop_locked: bool,
    pub pid: Option<u32>,
    pub last_healthy_at: Option<DateTime<Utc>>,
}

/// Serialises access to the single accelerator. Only one heavy model may be
/// resident; switching modes stops the conflicting services, waits for VRAM
/// to drain, and ensures the target is alive before running the operation
/// while still holding the lock.
pub struct GpuCoordinator {
    /// Tokio's mutex queues waiters in FIFO order, which gives the required
    /// hand-off ordering for free.
    lock: tokio::sync::Mutex<()>,
    services: std::sync::Mutex<HashMap<ServiceKind, ServiceState>>,
    children: tokio::sync::Mutex<HashMap<ServiceKind, Child>>,
    launch_commands: std::sync::Mutex<HashMap<ServiceKind, ServiceCommand>>,
    services_dir: PathBuf,
    cleanup_delay: Duration,
    health_timeout: Duration,
    /// When false the coordinator only provides the lock: no probes, no
    /// process management. Used in mock mode and tests.
    manage_services: bool,
    client: reqwest::Client,
}

impl GpuCoordinator {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            lock: tokio::sync::Mutex::new(()),
            services: std::sync::Mutex::new(HashMap::new()),
            children: tokio::sync::Mutex::new(HashMap::new()),
            launch_commands: std::sync::Mutex::new(HashMap::new()),
            services_dir: config.services_dir.clone(),
            cleanup_delay: Duration::from_millis(config.gpu_cleanup_delay_ms),
            health_timeout: Duration::from_millis(config.health_check_timeout_ms),
            manage_services: true,
            client: reqwest::Client::new(),
        }
    }

    /// A lock-only coordinator for mock providers: operations still serialise
    /// but no service is probed, started or stopped.
    pub fn disabled(config: &EngineConfig) -> Self {
        Self {
            manage_services: false,
            ..Self::new(config)
        }
    }

    pub fn set_launch_command(&self, kind: ServiceKind, command: ServiceCommand) {
        self.launch_commands
            .lock()
            .expect("launch command registry poisoned")
            .insert(kind, command);
    }

    /// Resolve the service base URL: port file first, env var fallback, then
    /// the default port on localhost.
    pub fn resolve_url(&self, kind: ServiceKind) -> String {
        let port_file = self.port_file_path(kind);
        if let Ok(contents) = std::fs::read_to_string(&port_file) {
            if let Ok(port) = contents.trim().parse::<u16>() {
                self.with_state(kind, |state| state.port = Some(port));
                return format!("http://127.0.0.1:{port}");
            }
        }

        if let Some(url) = crate::config::non_empty_env(kind.url_env_var()) {
            return url.trim_end_matches('/').to_string();
        }

        format!("http://127.0.0.1:{}", kind.default_port())
    }

    pub fn port_file_path(&self, kind: ServiceKind) -> PathBuf {
        self.services_dir.join(format!(".{}.port", kind.name()))
    }

    pub fn stop_lock_path(&self, kind: ServiceKind) -> PathBuf {
        self.services_dir.join(format!(".{}.STOP_LOCK", kind.name()))
    }

    /// An operator-placed marker that forbids auto-restart of the service.
    pub fn stop_locked(&self, kind: ServiceKind) -> bool {
        self.stop_lock_path(kind).exists()
    }

    pub fn write_stop_lock(&self, kind: ServiceKind) -> Result<(), EngineError> {
        std::fs::create_dir_all(&self.services_dir)?;
        std::fs::write(self.stop_lock_path(kind), b"stopped by operator\n")?;
        Ok(())
    }

    pub fn clear_stop_lock(&self, kind: ServiceKind) -> Result<(), EngineError> {
        let path = self.stop_lock_path(kind);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    fn with_state<T>(&self, kind: ServiceKind, f: impl FnOnce(&mut ServiceState) -> T) -> T {
        let mut services = self.services.lock().expect("service registry poisoned");
        f(services.entry(kind).or_default())
    }

    /// GET {url}/health. Services may be busy loading weights, hence the long
    /// timeout.
    pub async fn check_health(&self, kind: ServiceKind) -> Result<(), EngineError> {
        let url = format!("{}/health", self.resolve_url(kind).trim_end_matches('/'));
        let response = self
            .client
            .get(&url)
            .timeout(self.health_timeout)
            .send()
            .await
            .map_err(|e| EngineError::unavailable(format!("{kind} health probe: {e}")))?;

        if !response.status().is_success() {
            return Err(EngineError::unavailable(format!(
                "{kind} health probe returned {}",
                response.status()
            )));
        }

        self.with_state(kind, |state| {
            state.last_healthy_at = Some(Utc::now());
            state.needs_restart = false;
        });
        Ok(())
    }

    /// Make sure the service answers its health probe, auto-starting it when
    /// allowed. STOP_LOCK always wins.
    pub async fn ensure_running(&self, kind: ServiceKind) -> Result<(), EngineError> {
        if self.check_health(kind).await.is_ok() {
            self.with_state(kind, |state| state.intended_running = true);
            return Ok(());
        }

        if self.stop_locked(kind) {
            return Err(EngineError::unavailable(format!(
                "{kind} is stop-locked by an operator"
            )));
        }

        self.with_state(kind, |state| state.needs_restart = true);
        self.restart(kind).await
    }

    /// Start (or re-start) the service and poll /health with exponential
    /// back-off until healthy or the restart deadline passes.
    pub async fn restart(&self, kind: ServiceKind) -> Result<(), EngineError> {
        if self.stop_locked(kind) {
            return Err(EngineError::unavailable(format!(
                "{kind} is stop-locked by an operator"
            )));
        }

        let command = {
            let commands = self
                .launch_commands
                .lock()
                .expect("launch command registry poisoned");
            commands.get(&kind).cloned()
        };

        if let Some(command) = command {
            self.stop_service(kind).await?;
            tracing::info!(service = %kind, program = %command.program, "starting service");
            let child = Command::new(&command.program)
                .args(&command.args)
                .spawn()
                .map_err(|e| {
                    EngineError::unavailable(format!("failed to spawn {kind} service: {e}"))
                })?;
            self.with_state(kind, |state| {
                state.pid = child.id();
                state.intended_running = true;
            });
            self.children
                .lock()
                .await
                .insert(kind, child);
        } else {
            tracing::warn!(service = %kind, "no launch command registered; waiting for external restart");
        }

        let deadline = tokio::time::Instant::now() + RESTART_DEADLINE;
        let mut delay = Duration::from_millis(500);
        loop {
            if self.check_health(kind).await.is_ok() {
                tracing::info!(service = %kind, "service healthy");
                return Ok(());
            }
            if tokio::time::Instant::now() + delay > deadline {
                return Err(EngineError::unavailable(format!(
                    "{kind} did not become healthy within {}s",
                    RESTART_DEADLINE.as_secs()
                )));
            }
            sleep(delay).await;
            delay = (delay * 2).min(Duration::from_secs(8));
        }
    }

    /// SIGTERM, a grace period, then SIGKILL. Only processes this coordinator
    /// spawned can be stopped; externally managed services are left alone.
    pub async fn stop_service(&self, kind: ServiceKind) -> Result<(), EngineError> {
        let child = self.children.lock().await.remove(&kind);
        let Some(mut child) = child else {
            return Ok(());
        };

        if let Some(pid) = child.id() {
            tracing::info!(service = %kind, pid, "stopping service");
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }

        tokio::select! {
            _ = child.wait() => {}
            _ = sleep(STOP_GRACE) => {
                tracing::warn!(service = %kind, "grace period expired, killing");
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }

        self.with_state(kind, |state| {
            state.intended_running = false;
            state.pid = None;
        });
        Ok(())
    }

    /// Hold the GPU for an arbitrary operation without mode preparation.
    pub async fn with_gpu_lock<T, F, Fut>(&self, op: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = self.lock.lock().await;
        op().await
    }

    pub async fn with_llm_operation<T, F, Fut>(&self, op: F) -> Result<T, EngineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        self.with_mode(ServiceKind::Llm, op).await
    }

    pub async fn with_image_gen_operation<T, F, Fut>(&self, op: F) -> Result<T, EngineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        self.with_mode(ServiceKind::Image, op).await
    }

    pub async fn with_vlm_operation<T, F, Fut>(&self, op: F) -> Result<T, EngineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        self.with_mode(ServiceKind::Vlm, op).await
    }

    async fn with_mode<T, F, Fut>(&self, target: ServiceKind, op: F) -> Result<T, EngineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        let _guard = self.lock.lock().await;

        if self.manage_services {
            self.prepare_mode(target).await?;
        }

        op().await
    }

    /// Evict conflicting services, wait for VRAM to drain, bring up the
    /// target. Runs with the GPU lock held.
    async fn prepare_mode(&self, target: ServiceKind) -> Result<(), EngineError> {
        let mut stopped_any = false;
        for conflicting in target.conflicting() {
            let had_child = self.children.lock().await.contains_key(&conflicting);
            self.stop_service(conflicting).await?;
            stopped_any |= had_child;
        }

        if stopped_any {
            sleep(self.cleanup_delay).await;
        }

        self.ensure_running(target).await
    }

    /// Retry wrapper for transient provider failures: restart the service
    /// once and retry the operation; a second failure surfaces as
    /// ServiceUnavailable.
    pub async fn run_with_recovery<T, F, Fut>(
        &self,
        kind: ServiceKind,
        op: F,
    ) -> Result<T, EngineError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        match op().await {
            Ok(value) => Ok(value),
            Err(err) if err.is_transient() && self.manage_services => {
                tracing::warn!(service = %kind, error = %err, "transient failure, restarting once");
                self.restart(kind).await?;
                op().await.map_err(|second| {
                    EngineError::unavailable(format!("{kind} failed after restart: {second}"))
                })
            }
            Err(err) => Err(err),
        }
    }

    /// Status snapshot for every known service.
    pub async fn status(&self) -> Vec<ServiceStatus> {
        let mut out = Vec::new();
        for kind in ServiceKind::all() {
            let healthy = self.check_health(kind).await.is_ok();
            let (pid, last_healthy_at) =
                self.with_state(kind, |state| (state.pid, state.last_healthy_at));
            out.push(ServiceStatus {
                service: kind,
                url: self.resolve_url(kind),
                healthy,
                stop_locked: self.stop_locked(kind),
                pid,
                last_healthy_at,
            });
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn test_config(dir: &std::path::Path) -> EngineConfig {
        EngineConfig {
            services_dir: dir.to_path_buf(),
            gpu_cleanup_delay_ms: 2_000,
            health_check_timeout_ms: 500,
            ..EngineConfig::default()
        }
    }

    #[test]
    fn port_file_wins_over_default() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = GpuCoordinator::disabled(&test_config(dir.path()));

        assert_eq!(
            coordinator.resolve_url(ServiceKind::Llm),
            "http://127.0.0.1:8003"
        );

        std::fs::write(coordinator.port_file_path(ServiceKind::Llm), "9999\n").unwrap();
        assert_eq!(
            coordinator.resolve_url(ServiceKind::Llm),
            "http://127.0.0.1:9999"
        );
    }

    #[test]
    fn stop_lock_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = GpuCoordinator::disabled(&test_config(dir.path()));

        assert!(!coordinator.stop_locked(ServiceKind::Image));
        coordinator.write_stop_lock(ServiceKind::Image).unwrap();
        assert!(coordinator.stop_locked(ServiceKind::Image));
        coordinator.clear_stop_lock(ServiceKind::Image).unwrap();
        assert!(!coordinator.stop_locked(ServiceKind::Image));
    }

    #[tokio::test]
    async fn restart_refuses_when_stop_locked() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = GpuCoordinator::new(&test_config(dir.path()));
        coordinator.write_stop_lock(ServiceKind::Vlm).unwrap();

        let err = coordinator.restart(ServiceKind::Vlm).await.unwrap_err();
        assert!(matches!(err, EngineError::ServiceUnavailable(_)));
    }

    #[tokio::test]
    async fn lock_serialises_operations() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = Arc::new(GpuCoordinator::disabled(&test_config(dir.path())));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let coordinator = coordinator.clone();
            let in_flight = in_flight.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                coordinator
                    .with_vlm_operation(|| async {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        Ok::<_, EngineError>(())
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn recovery_does_not_retry_permanent_errors() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = GpuCoordinator::new(&test_config(dir.path()));
        let calls = AtomicUsize::new(0);

        let result: Result<(), _> = coordinator
            .run_with_recovery(ServiceKind::Llm, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(EngineError::invalid("bad dimension")) }
            })
            .await;

        assert!(matches!(result, Err(EngineError::InvalidArgument(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
