//! Long-running operation registry.
//!
//! Operations are server-side handles to background work: a uuid, a
//! state machine, optional lifecycle hooks and a completion signal.
//! The registry is in-memory; when clustering is enabled each created
//! operation also gets a replicated `(uuid, cluster_id)` row so any
//! node can discover which peer owns it and forward there.
//!
//! Lifecycle: `pending` → `running` → `success` | `failure`, with
//! `running` → `cancelling` → `cancelled` (or back to `running` when
//! the cancel hook fails).  Terminal states are stable: the operation
//! becomes read-only, hooks are dropped, the done channel fires
//! exactly once, and after a 5-second grace the registry entry and the
//! replicated row are removed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::response::Response;
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error};
use uuid::Uuid;

use crate::cluster::driver::ClusterDb;
use crate::errors::ClusterError;
use crate::metrics::OPERATIONS_STARTED_TOTAL;
use crate::AppState;

/// Grace period between an operation reaching a terminal state and its
/// removal from the registry and the replicated index.
const EXPIRY_GRACE: Duration = Duration::from_secs(5);

/// Hook driving the operation's actual work.
pub type RunHook =
    Arc<dyn Fn(Arc<Operation>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Hook asked to stop the operation's work.
pub type CancelHook =
    Arc<dyn Fn(Arc<Operation>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Hook serving an interactive websocket attached to the operation.
pub type ConnectHook =
    Arc<dyn Fn(Arc<Operation>, WebSocketUpgrade) -> Response + Send + Sync>;

/// Operation classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpClass {
    Task,
    Websocket,
    Token,
    Proxy,
}

impl OpClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpClass::Task => "task",
            OpClass::Websocket => "websocket",
            OpClass::Token => "token",
            OpClass::Proxy => "proxy",
        }
    }
}

/// Operation states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpStatus {
    Pending,
    Running,
    Success,
    Failure,
    Cancelling,
    Cancelled,
}

impl OpStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpStatus::Pending => "pending",
            OpStatus::Running => "running",
            OpStatus::Success => "success",
            OpStatus::Failure => "failure",
            OpStatus::Cancelling => "cancelling",
            OpStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, OpStatus::Success | OpStatus::Failure | OpStatus::Cancelled)
    }
}

/// What callers see when an operation is rendered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationView {
    pub id: String,
    pub class: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: String,
    pub resources: Option<HashMap<String, Vec<String>>>,
    pub metadata: serde_json::Value,
    pub may_cancel: bool,
    pub err: String,
}

/// Everything needed to create an operation.
#[derive(Default)]
pub struct OperationSpec {
    pub class: Option<OpClass>,
    pub resources: Option<HashMap<String, Vec<String>>>,
    pub metadata: Option<serde_json::Value>,
    pub on_run: Option<RunHook>,
    pub on_cancel: Option<CancelHook>,
    pub on_connect: Option<ConnectHook>,
}

struct OpInner {
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    status: OpStatus,
    resources: Option<HashMap<String, Vec<String>>>,
    metadata: serde_json::Value,
    err: String,
    readonly: bool,
    on_run: Option<RunHook>,
    on_cancel: Option<CancelHook>,
    on_connect: Option<ConnectHook>,
}

/// A single long-running operation.
pub struct Operation {
    id: String,
    class: OpClass,
    url: String,
    app: Weak<AppState>,
    inner: Mutex<OpInner>,
    done: watch::Sender<bool>,
}

impl Operation {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn class(&self) -> OpClass {
        self.class
    }

    pub fn status(&self) -> OpStatus {
        self.inner.lock().expect("operation lock poisoned").status
    }

    fn may_cancel_locked(&self, inner: &OpInner) -> bool {
        inner.on_cancel.is_some() || self.class == OpClass::Token
    }

    /// Render the operation for API responses, resources expanded to
    /// their URLs.
    pub fn render(&self) -> OperationView {
        let inner = self.inner.lock().expect("operation lock poisoned");

        let resources = inner.resources.as_ref().map(|resources| {
            resources
                .iter()
                .map(|(kind, ids)| {
                    let urls = ids.iter().map(|id| format!("/1.0/{kind}/{id}")).collect();
                    (kind.clone(), urls)
                })
                .collect()
        });

        OperationView {
            id: self.id.clone(),
            class: self.class.as_str().to_string(),
            created_at: inner.created_at,
            updated_at: inner.updated_at,
            status: inner.status.as_str().to_string(),
            resources,
            metadata: inner.metadata.clone(),
            may_cancel: self.may_cancel_locked(&inner),
            err: inner.err.clone(),
        }
    }

    /// Move `pending` → `running` and schedule the run hook.
    pub fn run(self: &Arc<Self>) -> Result<(), ClusterError> {
        let hook = {
            let mut inner = self.inner.lock().expect("operation lock poisoned");
            if inner.status != OpStatus::Pending {
                return Err(ClusterError::BadRequest(
                    "only pending operations can be started".into(),
                ));
            }
            inner.status = OpStatus::Running;
            inner.updated_at = Utc::now();
            inner.on_run.clone()
        };

        if let Some(hook) = hook {
            let op = self.clone();
            tokio::spawn(async move {
                match hook(op.clone()).await {
                    Ok(()) => {
                        op.complete(OpStatus::Success, None);
                        debug!("success for {} operation: {}", op.class.as_str(), op.id);
                    }
                    Err(err) => {
                        op.complete(OpStatus::Failure, Some(err.to_string()));
                        debug!(
                            "failure for {} operation: {}: {err}",
                            op.class.as_str(),
                            op.id
                        );
                    }
                }
            });
        }

        metrics::counter!(OPERATIONS_STARTED_TOTAL).increment(1);
        debug!("started {} operation: {}", self.class.as_str(), self.id);
        self.send_event();
        Ok(())
    }

    /// Move `running` → `cancelling` and schedule the cancel hook; the
    /// hook failing restores `running`.
    pub fn cancel(self: &Arc<Self>) -> Result<(), ClusterError> {
        let hook = {
            let mut inner = self.inner.lock().expect("operation lock poisoned");
            if inner.status != OpStatus::Running {
                return Err(ClusterError::BadRequest(
                    "only running operations can be cancelled".into(),
                ));
            }
            if !self.may_cancel_locked(&inner) {
                return Err(ClusterError::BadRequest(
                    "this operation can't be cancelled".into(),
                ));
            }
            inner.status = OpStatus::Cancelling;
            inner.updated_at = Utc::now();
            inner.on_cancel.clone()
        };

        debug!("cancelling {} operation: {}", self.class.as_str(), self.id);
        self.send_event();

        match hook {
            Some(hook) => {
                let op = self.clone();
                tokio::spawn(async move {
                    match hook(op.clone()).await {
                        Ok(()) => {
                            op.complete(OpStatus::Cancelled, None);
                            debug!("cancelled {} operation: {}", op.class.as_str(), op.id);
                        }
                        Err(err) => {
                            // The work is still going; restore the state
                            // it was in.
                            let mut inner =
                                op.inner.lock().expect("operation lock poisoned");
                            inner.status = OpStatus::Running;
                            inner.updated_at = Utc::now();
                            drop(inner);
                            debug!(
                                "failed to cancel {} operation: {}: {err}",
                                op.class.as_str(),
                                op.id
                            );
                            op.send_event();
                        }
                    }
                });
            }
            None => {
                self.complete(OpStatus::Cancelled, None);
                debug!("cancelled {} operation: {}", self.class.as_str(), self.id);
            }
        }

        Ok(())
    }

    /// Dispatch an interactive websocket to the connect hook.
    pub fn connect(
        self: &Arc<Self>,
        upgrade: WebSocketUpgrade,
    ) -> Result<Response, ClusterError> {
        let hook = {
            let inner = self.inner.lock().expect("operation lock poisoned");
            if self.class != OpClass::Websocket {
                return Err(ClusterError::BadRequest(
                    "only websocket operations can be connected".into(),
                ));
            }
            if inner.status != OpStatus::Running {
                return Err(ClusterError::BadRequest(
                    "only running operations can be connected".into(),
                ));
            }
            inner.on_connect.clone()
        };

        let hook = hook.ok_or_else(|| {
            ClusterError::BadRequest("operation has no connect hook".into())
        })?;
        debug!("connected {} operation: {}", self.class.as_str(), self.id);
        Ok(hook(self.clone(), upgrade))
    }

    /// Wait until the operation reaches a terminal state or the timer
    /// fires; returns whether it is final.
    pub async fn wait_final(&self, timeout: Option<Duration>) -> bool {
        if self.status().is_final() {
            return true;
        }

        let mut rx = self.done.subscribe();
        let wait = rx.wait_for(|done| *done);
        match timeout {
            None => {
                let _ = wait.await;
            }
            Some(timeout) => {
                let _ = tokio::time::timeout(timeout, wait).await;
            }
        }
        self.status().is_final()
    }

    fn complete(self: &Arc<Self>, status: OpStatus, err: Option<String>) {
        {
            let mut inner = self.inner.lock().expect("operation lock poisoned");
            if inner.readonly {
                return;
            }
            inner.status = status;
            inner.updated_at = Utc::now();
            if let Some(err) = err {
                inner.err = err;
            }
        }
        self.done_and_expire();
        self.send_event();
    }

    /// Terminal-state bookkeeping: freeze the record, drop the hooks,
    /// fire the done signal once, and schedule removal after the grace
    /// period.
    fn done_and_expire(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock().expect("operation lock poisoned");
            if inner.readonly {
                return;
            }
            inner.readonly = true;
            inner.on_run = None;
            inner.on_cancel = None;
            inner.on_connect = None;
        }
        let _ = self.done.send(true);

        let id = self.id.clone();
        let app = self.app.clone();
        tokio::spawn(async move {
            tokio::time::sleep(EXPIRY_GRACE).await;

            let Some(app) = app.upgrade() else { return };
            if app.operations.remove(&id).is_none() {
                return;
            }

            if let Some(runtime) = app.cluster() {
                let db = ClusterDb::new(runtime);
                if let Err(err) = db
                    .execute(
                        "DELETE FROM operations WHERE uuid = ?",
                        &[id.clone().into()],
                    )
                    .await
                {
                    error!("failed to remove operation {id} from cluster db: {err}");
                }
            }
        });
    }

    fn send_event(&self) {
        if let Some(app) = self.app.upgrade() {
            if let Ok(view) = serde_json::to_value(self.render()) {
                app.events.send("operation", view);
            }
        }
    }
}

/// Thread-safe uuid → operation map.
pub struct OperationRegistry {
    ops: Mutex<HashMap<String, Arc<Operation>>>,
}

impl Default for OperationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self {
            ops: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<Operation>> {
        self.ops
            .lock()
            .expect("operations lock poisoned")
            .get(id)
            .cloned()
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Operation>> {
        self.ops
            .lock()
            .expect("operations lock poisoned")
            .remove(id)
    }

    pub fn all(&self) -> Vec<Arc<Operation>> {
        self.ops
            .lock()
            .expect("operations lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    fn insert(&self, op: Arc<Operation>) {
        self.ops
            .lock()
            .expect("operations lock poisoned")
            .insert(op.id.clone(), op);
    }
}

/// Create an operation, enforcing the per-class hook invariants, and
/// publish its ownership row when clustering is enabled.
pub async fn operation_create(
    app: &Arc<AppState>,
    spec: OperationSpec,
) -> Result<Arc<Operation>, ClusterError> {
    let class = spec
        .class
        .ok_or_else(|| ClusterError::BadRequest("operation class is required".into()))?;

    if class != OpClass::Websocket && spec.on_connect.is_some() {
        return Err(ClusterError::BadRequest(
            "only websocket operations can have a connect hook".into(),
        ));
    }
    if class == OpClass::Websocket && spec.on_connect.is_none() {
        return Err(ClusterError::BadRequest(
            "websocket operations must have a connect hook".into(),
        ));
    }
    if class == OpClass::Token && spec.on_run.is_some() {
        return Err(ClusterError::BadRequest(
            "token operations can't have a run hook".into(),
        ));
    }
    if class == OpClass::Token && spec.on_cancel.is_some() {
        return Err(ClusterError::BadRequest(
            "token operations can't have a cancel hook".into(),
        ));
    }

    let id = Uuid::new_v4().to_string();
    let now = Utc::now();
    let (done, _) = watch::channel(false);

    let op = Arc::new(Operation {
        url: format!("/1.0/operations/{id}"),
        id,
        class,
        app: Arc::downgrade(app),
        inner: Mutex::new(OpInner {
            created_at: now,
            updated_at: now,
            status: OpStatus::Pending,
            resources: spec.resources,
            metadata: spec.metadata.unwrap_or(serde_json::Value::Null),
            err: String::new(),
            readonly: false,
            on_run: spec.on_run,
            on_cancel: spec.on_cancel,
            on_connect: spec.on_connect,
        }),
        done,
    });

    app.operations.insert(op.clone());

    if let Some(runtime) = app.cluster() {
        let cluster_id = runtime.my_cluster_id().await?;
        let db = ClusterDb::new(runtime);
        if let Err(err) = db
            .execute(
                "INSERT INTO operations (uuid, cluster_id) VALUES (?, ?)",
                &[op.id.clone().into(), cluster_id.into()],
            )
            .await
        {
            app.operations.remove(&op.id);
            return Err(err);
        }
    }

    op.send_event();
    Ok(op)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::events::EventBus;
    use crate::tls::TlsIdentity;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn app() -> Arc<AppState> {
        Arc::new(AppState {
            config: Config::default(),
            identity: TlsIdentity {
                cert_pem: String::new(),
                key_pem: String::new(),
            },
            cluster: std::sync::RwLock::new(None),
            operations: OperationRegistry::new(),
            events: EventBus::new(),
        })
    }

    fn task_spec() -> OperationSpec {
        OperationSpec {
            class: Some(OpClass::Task),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_task_success_lifecycle() {
        let app = app();
        let op = operation_create(
            &app,
            OperationSpec {
                class: Some(OpClass::Task),
                on_run: Some(Arc::new(|_op| Box::pin(async { Ok(()) }))),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(op.status(), OpStatus::Pending);
        op.run().unwrap();
        assert!(op.wait_final(Some(Duration::from_secs(5))).await);
        assert_eq!(op.status(), OpStatus::Success);

        // Terminal states are stable.
        assert!(op.run().is_err());
        assert!(op.cancel().is_err());
    }

    #[tokio::test]
    async fn test_failed_run_records_error() {
        let app = app();
        let op = operation_create(
            &app,
            OperationSpec {
                class: Some(OpClass::Task),
                on_run: Some(Arc::new(|_op| {
                    Box::pin(async { Err(anyhow::anyhow!("disk on fire")) })
                })),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        op.run().unwrap();
        assert!(op.wait_final(Some(Duration::from_secs(5))).await);
        assert_eq!(op.status(), OpStatus::Failure);
        assert!(op.render().err.contains("disk on fire"));
    }

    #[tokio::test]
    async fn test_class_invariants() {
        let app = app();

        // Websocket requires a connect hook.
        let err = operation_create(
            &app,
            OperationSpec {
                class: Some(OpClass::Websocket),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("connect hook"));

        // Token forbids run and cancel hooks.
        let err = operation_create(
            &app,
            OperationSpec {
                class: Some(OpClass::Token),
                on_run: Some(Arc::new(|_op| Box::pin(async { Ok(()) }))),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("run hook"));

        // Connect hooks are websocket-only.
        let err = operation_create(
            &app,
            OperationSpec {
                class: Some(OpClass::Task),
                on_connect: Some(Arc::new(|_op, _upgrade| {
                    unreachable!("never invoked in this test")
                })),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("websocket operations"));
    }

    #[tokio::test]
    async fn test_token_cancel_without_hook() {
        let app = app();
        let op = operation_create(
            &app,
            OperationSpec {
                class: Some(OpClass::Token),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        op.run().unwrap();
        assert_eq!(op.status(), OpStatus::Running);
        op.cancel().unwrap();
        assert!(op.wait_final(Some(Duration::from_secs(5))).await);
        assert_eq!(op.status(), OpStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_plain_task_cannot_cancel() {
        let app = app();
        let op = operation_create(&app, task_spec()).await.unwrap();
        op.run().unwrap();
        let err = op.cancel().unwrap_err();
        assert!(err.to_string().contains("can't be cancelled"));
    }

    #[tokio::test]
    async fn test_failing_cancel_restores_running() {
        let app = app();
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();

        let op = operation_create(
            &app,
            OperationSpec {
                class: Some(OpClass::Task),
                on_run: Some(Arc::new(|_op| {
                    Box::pin(async {
                        // Simulates work that outlives the test.
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                        Ok(())
                    })
                })),
                on_cancel: Some(Arc::new(move |_op| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Box::pin(async { Err(anyhow::anyhow!("cannot stop")) })
                })),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        op.run().unwrap();
        op.cancel().unwrap();

        // Wait for the cancel hook to fail and the state to restore.
        for _ in 0..100 {
            if op.status() == OpStatus::Running && attempts.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(op.status(), OpStatus::Running);

        // A restored operation can be cancelled again.
        op.cancel().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_removes_registry_entry() {
        let app = app();
        let op = operation_create(&app, task_spec()).await.unwrap();
        let id = op.id().to_string();

        op.run().unwrap();
        // No run hook: completes only via cancel; plain tasks can't
        // cancel, so drive it terminal through the internal path.
        op.complete(OpStatus::Success, None);
        assert!(app.operations.get(&id).is_some());

        // Let the 5-second grace elapse (auto-advanced virtual time).
        tokio::time::sleep(EXPIRY_GRACE + Duration::from_secs(1)).await;
        assert!(app.operations.get(&id).is_none());
    }

    #[tokio::test]
    async fn test_render_resources_as_urls() {
        let app = app();
        let mut resources = HashMap::new();
        resources.insert("containers".to_string(), vec!["c1".to_string()]);

        let op = operation_create(
            &app,
            OperationSpec {
                class: Some(OpClass::Task),
                resources: Some(resources),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let view = op.render();
        assert_eq!(
            view.resources.unwrap()["containers"],
            vec!["/1.0/containers/c1"]
        );
        assert_eq!(view.status, "pending");
        assert_eq!(view.class, "task");
    }
}
