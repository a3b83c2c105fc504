use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use thiserror::Error;

use crate::context::ModuleCtx;
use crate::contracts::Module;
use crate::supervise::panic_message;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("module '{0}' not found")]
    NotFound(String),
}

/// Failure of a single wrapped lifecycle call.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("module '{module}' {phase} panicked: {reason}")]
    Panicked {
        module: String,
        phase: Phase,
        reason: String,
    },
    #[error("module '{module}' {phase} failed: {source}")]
    Failed {
        module: String,
        phase: Phase,
        #[source]
        source: anyhow::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Exit,
    Clean,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Phase::Init => "init",
            Phase::Exit => "exit",
            Phase::Clean => "clean",
        })
    }
}

/// Outcome of a whole lifecycle phase.
#[derive(Debug, Default)]
pub struct PhaseSummary {
    pub success: usize,
    pub failed: Vec<String>,
    pub errors: Vec<LifecycleError>,
}

impl PhaseSummary {
    pub fn fail(&self) -> usize {
        self.failed.len()
    }

    pub fn is_ok(&self) -> bool {
        self.failed.is_empty()
    }

    fn record(&mut self, uid: &str, res: Result<(), LifecycleError>) {
        match res {
            Ok(()) => self.success += 1,
            Err(e) => {
                self.failed.push(uid.to_string());
                self.errors.push(e);
            }
        }
    }
}

/// Summary returned by [`ModuleRegistry::init_all`].
pub type InitSummary = PhaseSummary;

pub struct ModuleEntry {
    uid: String,
    module: Arc<dyn Module>,
}

impl std::fmt::Debug for ModuleEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleEntry").field("uid", &self.uid).finish()
    }
}

impl ModuleEntry {
    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn module(&self) -> &Arc<dyn Module> {
        &self.module
    }

    pub async fn init(&self, ctx: &ModuleCtx) -> Result<(), LifecycleError> {
        self.run_phase(Phase::Init, ctx).await
    }

    pub async fn exit(&self, ctx: &ModuleCtx) -> Result<(), LifecycleError> {
        self.run_phase(Phase::Exit, ctx).await
    }

    pub async fn clean(&self, ctx: &ModuleCtx) -> Result<(), LifecycleError> {
        self.run_phase(Phase::Clean, ctx).await
    }

    /// Run one lifecycle method with panics turned into [`LifecycleError::Panicked`].
    pub async fn run_phase(&self, phase: Phase, ctx: &ModuleCtx) -> Result<(), LifecycleError> {
        let ctx = ctx.for_module(&self.uid);
        let module = &self.module;
        let call = async {
            match phase {
                Phase::Init => module.init(&ctx).await,
                Phase::Exit => module.exit(&ctx).await,
                Phase::Clean => module.clean(&ctx).await,
            }
        };

        match AssertUnwindSafe(call).catch_unwind().await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(source)) => Err(LifecycleError::Failed {
                module: self.uid.clone(),
                phase,
                source,
            }),
            Err(panic) => Err(LifecycleError::Panicked {
                module: self.uid.clone(),
                phase,
                reason: panic_message(&*panic),
            }),
        }
    }
}

/// Insertion-ordered set of modules.
///
/// Mutated only while registering (`&mut self`); read-only once shared.
#[derive(Default)]
pub struct ModuleRegistry {
    modules: Vec<ModuleEntry>,
    uids: HashSet<String>,
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("modules", &self.uids())
            .finish()
    }
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a module.
    ///
    /// # Panics
    /// On an empty or already registered uid.
    pub fn register(&mut self, module: Arc<dyn Module>) {
        let uid = module.uid();
        if uid.is_empty() {
            panic!("module uid must not be empty");
        }
        if !self.uids.insert(uid.clone()) {
            panic!("module uid: {uid} already be registered");
        }
        tracing::debug!(module = %uid, "module registered");
        self.modules.push(ModuleEntry { uid, module });
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn modules(&self) -> &[ModuleEntry] {
        &self.modules
    }

    /// Uids in registration (init) order.
    pub fn uids(&self) -> Vec<&str> {
        self.modules.iter().map(|m| m.uid.as_str()).collect()
    }

    pub fn get(&self, uid: &str) -> Result<Arc<dyn Module>, RegistryError> {
        self.modules
            .iter()
            .find(|e| e.uid == uid)
            .map(|e| e.module.clone())
            .ok_or_else(|| RegistryError::NotFound(uid.to_string()))
    }

    /// Init every module in registration order, continuing past failures.
    pub async fn init_all(&self, ctx: &ModuleCtx) -> InitSummary {
        tracing::info!("Phase: init");
        let mut summary = PhaseSummary::default();

        for entry in &self.modules {
            let res = entry.init(ctx).await;
            match &res {
                Ok(()) => tracing::info!(module = %entry.uid, "module init success"),
                Err(e) => tracing::error!(module = %entry.uid, error = %e, "module init fail"),
            }
            summary.record(&entry.uid, res);
        }

        tracing::info!(
            success = summary.success,
            fail = summary.fail(),
            fail_modules = ?summary.failed,
            "modules init finished"
        );
        summary
    }

    /// Exit every module in reverse order, continuing past failures.
    pub async fn exit_all(&self, ctx: &ModuleCtx) -> PhaseSummary {
        tracing::info!("Phase: exit");
        self.reverse_phase(Phase::Exit, ctx).await
    }

    /// Clean every module in reverse order, continuing past failures.
    pub async fn clean_all(&self, ctx: &ModuleCtx) -> PhaseSummary {
        tracing::info!("Phase: clean");
        self.reverse_phase(Phase::Clean, ctx).await
    }

    /// `exit_all` then `clean_all`.
    pub async fn shutdown_all(&self, ctx: &ModuleCtx) -> (PhaseSummary, PhaseSummary) {
        let exit = self.exit_all(ctx).await;
        let clean = self.clean_all(ctx).await;
        (exit, clean)
    }

    async fn reverse_phase(&self, phase: Phase, ctx: &ModuleCtx) -> PhaseSummary {
        let mut summary = PhaseSummary::default();
        for entry in self.modules.iter().rev() {
            let res = entry.run_phase(phase, ctx).await;
            match &res {
                Ok(()) => tracing::info!(module = %entry.uid, %phase, "module {phase} success"),
                Err(e) => tracing::warn!(module = %entry.uid, error = %e, "module {phase} fail"),
            }
            summary.record(&entry.uid, res);
        }
        summary
    }
}
