// In-memory collaborators for unit tests.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::InstallLayout;
use crate::health::HealthStrategy;
use crate::installation::{
    BuildOptions, CertificateIssuer, CommandOutput, ConfigGenerator, ContainerRuntime,
    EngineInit, EngineStatus, Identity, IdentityProvider, SecretsEngine, ServiceState,
    TeardownOptions,
};

// ----------------------------------------------------------------------------
// Container runtime
// ----------------------------------------------------------------------------

#[derive(Default)]
struct RuntimeState {
    states: HashMap<String, ServiceState>,
    exec_exit: HashMap<String, i32>,
    fail_start: HashSet<String>,
    started: Vec<String>,
    ops: Vec<String>,
    teardowns: Vec<TeardownOptions>,
    builds: Vec<BuildOptions>,
    unreachable: bool,
    fail_build: bool,
    fail_teardown: bool,
    engine: Option<Arc<FakeSecretsEngine>>,
}

/// Every started service reports `Running` until told otherwise.
#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<RuntimeState>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RuntimeState> {
        self.state.lock().unwrap()
    }

    pub fn set_state(&self, service: &str, state: ServiceState) {
        self.lock().states.insert(service.to_string(), state);
    }

    pub fn set_exec_exit(&self, service: &str, code: i32) {
        self.lock().exec_exit.insert(service.to_string(), code);
    }

    pub fn fail_start(&self, service: &str) {
        self.lock().fail_start.insert(service.to_string());
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    pub fn fail_build(&self) {
        self.lock().fail_build = true;
    }

    pub fn fail_teardown(&self) {
        self.lock().fail_teardown = true;
    }

    /// Stopping the deployment seals `engine`; removing volumes wipes it.
    pub fn attach_engine(&self, engine: Arc<FakeSecretsEngine>) {
        self.lock().engine = Some(engine);
    }

    /// Services passed to `start_service`, in call order.
    pub fn started(&self) -> Vec<String> {
        self.lock().started.clone()
    }

    /// Coarse operation log: `ping`, `network`, `build`, `start:<svc>`, `start-all`, `down`.
    pub fn ops(&self) -> Vec<String> {
        self.lock().ops.clone()
    }

    pub fn teardowns(&self) -> Vec<TeardownOptions> {
        self.lock().teardowns.clone()
    }

    pub fn builds(&self) -> Vec<BuildOptions> {
        self.lock().builds.clone()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn ping(&self) -> Result<()> {
        let mut s = self.lock();
        s.ops.push("ping".to_string());
        if s.unreachable {
            anyhow::bail!("Cannot connect to the Docker daemon");
        }
        Ok(())
    }

    async fn ensure_network(&self) -> Result<()> {
        self.lock().ops.push("network".to_string());
        Ok(())
    }

    async fn build(&self, opts: BuildOptions) -> Result<()> {
        let mut s = self.lock();
        s.ops.push("build".to_string());
        s.builds.push(opts);
        if s.fail_build {
            anyhow::bail!("image build failed: base image not found");
        }
        Ok(())
    }

    async fn start_service(&self, service: &str) -> Result<()> {
        let mut s = self.lock();
        s.ops.push(format!("start:{}", service));
        s.started.push(service.to_string());
        if s.fail_start.contains(service) {
            anyhow::bail!("container {} exited immediately", service);
        }
        s.states.insert(service.to_string(), ServiceState::Running);
        Ok(())
    }

    async fn start_all(&self) -> Result<()> {
        self.lock().ops.push("start-all".to_string());
        Ok(())
    }

    async fn remove_deployment(&self, opts: TeardownOptions) -> Result<()> {
        let mut s = self.lock();
        s.ops.push("down".to_string());
        s.teardowns.push(opts);
        if s.fail_teardown {
            anyhow::bail!("compose down failed");
        }
        s.states.clear();
        if let Some(engine) = s.engine.clone() {
            drop(s);
            if opts.remove_volumes {
                engine.reset();
            } else {
                engine.seal();
            }
        }
        Ok(())
    }

    async fn service_state(&self, service: &str) -> Result<ServiceState> {
        Ok(self
            .lock()
            .states
            .get(service)
            .copied()
            .unwrap_or(ServiceState::Missing))
    }

    async fn exec(&self, service: &str, _args: &[String]) -> Result<CommandOutput> {
        let code = self.lock().exec_exit.get(service).copied().unwrap_or(0);
        Ok(CommandOutput {
            exit_code: Some(code),
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 0,
        })
    }
}

// ----------------------------------------------------------------------------
// Secrets engine
// ----------------------------------------------------------------------------

#[derive(Default)]
struct EngineState {
    init: Option<EngineInit>,
    threshold: usize,
    sealed: bool,
    progress: HashSet<String>,
    data: BTreeMap<(String, String), String>,
    unreachable: bool,
}

/// A freshly initialized engine starts unsealed; `seal()` seals it again.
#[derive(Default)]
pub struct FakeSecretsEngine {
    state: Mutex<EngineState>,
}

impl FakeSecretsEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EngineState> {
        self.state.lock().unwrap()
    }

    /// Storage wiped: uninitialized, no data.
    pub fn reset(&self) {
        let unreachable = self.lock().unreachable;
        *self.lock() = EngineState {
            unreachable,
            ..EngineState::default()
        };
    }

    pub fn seal(&self) {
        let mut s = self.lock();
        s.sealed = true;
        s.progress.clear();
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    fn check_access(s: &EngineState, token: &str) -> Result<()> {
        if s.unreachable {
            anyhow::bail!("connection refused");
        }
        if s.sealed {
            anyhow::bail!("secrets engine is sealed");
        }
        match &s.init {
            Some(init) if init.root_token == token => Ok(()),
            Some(_) => anyhow::bail!("permission denied"),
            None => anyhow::bail!("secrets engine is not initialized"),
        }
    }
}

#[async_trait]
impl SecretsEngine for FakeSecretsEngine {
    async fn status(&self) -> Result<EngineStatus> {
        let s = self.lock();
        if s.unreachable {
            anyhow::bail!("connection refused");
        }
        Ok(EngineStatus {
            initialized: s.init.is_some(),
            sealed: s.sealed,
        })
    }

    async fn init(&self, shares: u8, threshold: u8) -> Result<EngineInit> {
        let mut s = self.lock();
        if s.unreachable {
            anyhow::bail!("connection refused");
        }
        if s.init.is_some() {
            anyhow::bail!("already initialized");
        }
        let id = uuid::Uuid::new_v4().simple().to_string();
        let init = EngineInit {
            unseal_keys: (0..shares).map(|i| format!("key-{}-{}", id, i)).collect(),
            root_token: format!("root-{}", id),
        };
        s.init = Some(init.clone());
        s.threshold = threshold as usize;
        s.sealed = false;
        Ok(init)
    }

    async fn unseal(&self, key: &str) -> Result<bool> {
        let mut s = self.lock();
        if s.unreachable {
            anyhow::bail!("connection refused");
        }
        if !s.sealed {
            return Ok(false);
        }
        let valid = s
            .init
            .as_ref()
            .map(|i| i.unseal_keys.iter().any(|k| k == key))
            .unwrap_or(false);
        if !valid {
            anyhow::bail!("invalid unseal key");
        }
        s.progress.insert(key.to_string());
        if s.progress.len() >= s.threshold {
            s.sealed = false;
            s.progress.clear();
        }
        Ok(s.sealed)
    }

    async fn read(&self, token: &str, path: &str, key: &str) -> Result<Option<String>> {
        let s = self.lock();
        Self::check_access(&s, token)?;
        Ok(s.data.get(&(path.to_string(), key.to_string())).cloned())
    }

    async fn write(&self, token: &str, path: &str, key: &str, value: &str) -> Result<()> {
        let mut s = self.lock();
        Self::check_access(&s, token)?;
        s.data
            .insert((path.to_string(), key.to_string()), value.to_string());
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Identity provider
// ----------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeIdentity {
    identities: Mutex<Vec<Identity>>,
    fail: Mutex<bool>,
}

impl FakeIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_create(&self) {
        *self.fail.lock().unwrap() = true;
    }

    pub fn identities(&self) -> Vec<Identity> {
        self.identities.lock().unwrap().clone()
    }
}

#[async_trait]
impl IdentityProvider for FakeIdentity {
    async fn create_identity(&self, username: &str, email: &str) -> Result<String> {
        if *self.fail.lock().unwrap() {
            anyhow::bail!("identity provider returned 500");
        }
        let mut ids = self.identities.lock().unwrap();
        if let Some(existing) = ids.iter().find(|i| i.username == username) {
            return Ok(existing.id.clone());
        }
        let id = uuid::Uuid::new_v4().to_string();
        ids.push(Identity {
            id: id.clone(),
            username: username.to_string(),
            email: Some(email.to_string()),
        });
        Ok(id)
    }

    async fn list_identities(&self) -> Result<Vec<Identity>> {
        Ok(self.identities())
    }

    async fn delete_identity(&self, id: &str) -> Result<()> {
        self.identities.lock().unwrap().retain(|i| i.id != id);
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Generators
// ----------------------------------------------------------------------------

/// Writes a minimal compose file listing the variables it was given.
#[derive(Default)]
pub struct FakeGenerator {
    fail: Mutex<bool>,
    calls: Mutex<Vec<BTreeMap<String, String>>>,
}

impl FakeGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self) {
        *self.fail.lock().unwrap() = true;
    }

    pub fn calls(&self) -> Vec<BTreeMap<String, String>> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ConfigGenerator for FakeGenerator {
    async fn generate(&self, layout: &InstallLayout, vars: &BTreeMap<String, String>) -> Result<()> {
        self.calls.lock().unwrap().push(vars.clone());
        if *self.fail.lock().unwrap() {
            anyhow::bail!("template references undefined placeholder ${{MISSING}}");
        }
        std::fs::create_dir_all(&layout.config_dir)?;
        let body: String = vars
            .iter()
            .map(|(k, v)| format!("# {}={}\n", k, v))
            .collect();
        std::fs::write(&layout.compose_file, format!("{}services: {{}}\n", body))?;
        std::fs::write(&layout.env_file, crate::installation::generate::render_env_file(vars))?;
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeIssuer {
    issued: AtomicU32,
}

impl FakeIssuer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn issued(&self) -> u32 {
        self.issued.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CertificateIssuer for FakeIssuer {
    async fn ensure_certificate(&self, certs_dir: &Path, hostname: &str) -> Result<()> {
        let cert = certs_dir.join(crate::installation::generate::CERT_FILE);
        if cert.exists() {
            return Ok(());
        }
        std::fs::create_dir_all(certs_dir)?;
        std::fs::write(&cert, format!("CERT {}", hostname))?;
        std::fs::write(
            certs_dir.join(crate::installation::generate::KEY_FILE),
            "KEY",
        )?;
        self.issued.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Health
// ----------------------------------------------------------------------------

/// Probe that fails until its n-th call (or forever).
#[derive(Clone)]
pub struct ScriptedProbe {
    ready_at: Option<u32>,
    calls: Arc<AtomicU32>,
}

impl ScriptedProbe {
    pub fn healthy_after(n: u32) -> Self {
        Self {
            ready_at: Some(n),
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn never() -> Self {
        Self {
            ready_at: None,
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthStrategy for ScriptedProbe {
    fn describe(&self) -> String {
        "scripted".to_string()
    }

    async fn probe(&self) -> Result<()> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        match self.ready_at {
            Some(at) if n >= at => Ok(()),
            _ => anyhow::bail!("scripted probe not ready (attempt {})", n),
        }
    }
}
