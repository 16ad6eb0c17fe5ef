//! Composition root: wires the store, modules, mediators, guardian, queue,
//! and transport together, then runs the two forever-drivers plus the
//! periodic tasks and the operator HTTP surface.

mod drivers;
mod reactive;
mod server;

use std::sync::Arc;

use tokio::sync::{RwLock, mpsc, watch};
use tracing::{info, warn};

use vigil_agent::AgentCycle;
use vigil_config::AppConfig;
use vigil_guard::MemoryGuardian;
use vigil_llm::{ChatClient, Mediator, ModelPolicy, ToolRegistry};
use vigil_modules::ModuleRegistry;
use vigil_router::Queue;
use vigil_store::Store;
use vigil_transport::{Notifier, Transport};

pub use drivers::LoopStatus;
pub use reactive::handle_action;
pub use server::serve_operator;

/// Why the runtime stopped; maps one-to-one onto process exit codes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// 0: clean shutdown.
    Clean,
    /// 1: fatal startup error.
    FatalStartup(String),
    /// 2: irrecoverable cycle failure loop (≥3 consecutive crashes).
    CycleFailureLoop,
    /// 3: the memory guardian asked for a graceful restart.
    MemoryRestart,
}

impl ExitReason {
    pub fn code(&self) -> i32 {
        match self {
            ExitReason::Clean => 0,
            ExitReason::FatalStartup(_) => 1,
            ExitReason::CycleFailureLoop => 2,
            ExitReason::MemoryRestart => 3,
        }
    }
}

/// Everything the composition root injects.  Constructors receive this
/// record instead of reaching for globals.
pub struct Services {
    pub config: AppConfig,
    pub store: Arc<Store>,
    pub modules: Arc<ModuleRegistry>,
    pub transport: Arc<dyn Transport>,
    pub notifier: Notifier,
    /// One chat client per driver path, isolating their context caches.
    pub proactive_client: Arc<dyn ChatClient>,
    pub reactive_client: Arc<dyn ChatClient>,
    /// Tools the reactive tool loop may execute.  Empty is fine.
    pub tools: Arc<ToolRegistry>,
}

/// Run until shutdown is signalled or a fatal condition surfaces.
pub async fn run(services: Services, shutdown: watch::Receiver<bool>) -> ExitReason {
    let Services {
        config,
        store,
        modules,
        transport,
        notifier,
        proactive_client,
        reactive_client,
        tools,
    } = services;

    let policy = ModelPolicy::new(
        config.llm.cheap_model.clone(),
        config.llm.expensive_model.clone(),
    )
    .with_expensive_types(modules.expensive_signal_types());

    let chat_timeout = std::time::Duration::from_secs(config.llm.chat_timeout_secs);
    let tool_timeout = std::time::Duration::from_secs(config.llm.tool_timeout_secs);

    let proactive_mediator = Mediator::new(
        proactive_client,
        policy.clone(),
        "proactive",
        chat_timeout,
        tool_timeout,
        config.llm.max_tool_rounds,
    );
    let reactive_mediator = Arc::new(Mediator::new(
        reactive_client,
        policy,
        "reactive",
        chat_timeout,
        tool_timeout,
        config.llm.max_tool_rounds,
    ));

    let guardian = MemoryGuardian::new(&config.memory);
    let cycle = AgentCycle::new(
        config.clone(),
        store.clone(),
        modules.clone(),
        proactive_mediator,
        guardian,
        notifier.clone(),
        transport.clone(),
    );

    let queue = Queue::new(config.queue.max_concurrent, config.queue.max_queue_per_user);
    let status = Arc::new(RwLock::new(LoopStatus::default()));
    let (trigger_tx, trigger_rx) = mpsc::channel::<()>(1);

    // Operator surface (skipped entirely without a shared secret).
    if !config.server.secret.is_empty() {
        let server_shutdown = shutdown.clone();
        let app_state = server::AppState {
            store: store.clone(),
            status: status.clone(),
            trigger_tx: trigger_tx.clone(),
            secret: config.server.secret.clone(),
            module_routes: Arc::new(modules.api_routes()),
        };
        let bind = format!("{}:{}", config.server.bind, config.server.port);
        tokio::spawn(async move {
            if let Err(err) = serve_operator(app_state, &bind, server_shutdown).await {
                warn!(%err, "operator surface stopped");
            }
        });
    } else {
        info!("operator surface disabled (no shared secret configured)");
    }

    // Reactive driver: inbound messages → debounce → router → queue.
    {
        let reactive = reactive::ReactiveDriver {
            config: config.clone(),
            store: store.clone(),
            modules: modules.clone(),
            transport: transport.clone(),
            mediator: reactive_mediator.clone(),
            tools: tools.clone(),
            queue: queue.clone(),
        };
        let reactive_shutdown = shutdown.clone();
        tokio::spawn(async move {
            reactive.run(reactive_shutdown).await;
        });
    }

    // Periodic tasks: experiment checks (30 min) and weekly maintenance.
    drivers::spawn_periodic_tasks(
        store.clone(),
        transport.clone(),
        config.clone(),
        shutdown.clone(),
    );

    // The proactive driver runs on this task and decides the exit reason.
    let reason = drivers::run_proactive_driver(cycle, status, trigger_rx, shutdown).await;

    // Graceful teardown: stop intake, drain briefly, kill LLM children.
    if !queue.drain(10_000).await {
        warn!("queue did not drain before shutdown deadline");
    }
    reactive_mediator.shutdown().await;

    info!(reason = ?reason, "runtime stopped");
    reason
}
