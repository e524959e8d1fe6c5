//! The scheduler demo service: hosts `Scheduler.CreateTrigger`,
//! `Scheduler.DeleteTrigger` and `Scheduler.ListTriggers`. Each trigger gets
//! its own module under the service root, armed with a `SafeCron` or
//! `SafeAfter` timer (re-issuable under a stable slot keyed by the module
//! id) that fires an `AsyncCall` to `Dispatcher.Deliver` when due.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use node_core::error::{CoreError, Result};
use node_core::service::module::ModuleId;
use node_core::node::ServiceFactory;
use node_core::service::{Service, ServiceContext};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerSchedule {
    Cron { expression: String },
    After { delay_ms: u64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTriggerRequest {
    pub id: String,
    pub schedule: TriggerSchedule,
    /// Opaque payload handed verbatim to `Dispatcher.Deliver` when the
    /// trigger fires.
    pub dispatch: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteTriggerRequest {
    pub id: String,
}

struct TriggerHooks;
impl node_core::service::module::ModuleHooks for TriggerHooks {}

/// Maps a trigger's user-facing id to the module that owns its timer. Shared
/// across handler invocations; guarded by a plain mutex since every access
/// happens on this service's own single-threaded loop and contention is
/// never a concern, only the `Send` bound on the closures needs satisfying.
#[derive(Default)]
struct TriggerRegistry {
    by_id: HashMap<String, ModuleId>,
}

pub fn factory() -> ServiceFactory {
    Box::new(move |service: &Service, _ctx: &ServiceContext| {
        let registry = Arc::new(Mutex::new(TriggerRegistry::default()));

        let reg = Arc::clone(&registry);
        service.register(
            "Scheduler.CreateTrigger",
            Arc::new(move |handle, args: serde_json::Value| {
                let reg = Arc::clone(&reg);
                async move {
                    let request: CreateTriggerRequest =
                        serde_json::from_value(args).map_err(|e| CoreError::Handler(e.to_string()))?;

                    if reg.lock().unwrap().by_id.contains_key(&request.id) {
                        return Err(CoreError::Handler(format!("trigger {} already exists", request.id)));
                    }

                    let module = handle
                        .add_module(handle.root(), None, Box::new(TriggerHooks))
                        .map_err(|e| CoreError::Handler(e.to_string()))?;

                    let dispatch = request.dispatch.clone();
                    let callback = Arc::new(move |h: &node_core::service::tree::LoopHandle| {
                        let dispatch = dispatch.clone();
                        let result = h.async_call(
                            "Dispatcher.Deliver",
                            dispatch,
                            Duration::from_secs(15),
                            Box::new(|_h, result| {
                                if let Err(e) = result {
                                    warn!(error = %e, "dispatcher rejected triggered delivery");
                                }
                            }),
                        );
                        if let Err(e) = result {
                            warn!(error = %e, "failed to fire trigger");
                        }
                    });

                    match &request.schedule {
                        | TriggerSchedule::After { delay_ms } => {
                            handle.safe_after(module, module.0, Duration::from_millis(*delay_ms), callback);
                        },
                        | TriggerSchedule::Cron { expression } => {
                            let schedule = cron::Schedule::from_str(expression)
                                .map_err(|e| CoreError::Handler(format!("invalid cron expression: {e}")))?;
                            handle
                                .safe_cron(module, module.0, schedule, callback)
                                .map_err(|e| CoreError::Handler(e.to_string()))?;
                        },
                    }

                    reg.lock().unwrap().by_id.insert(request.id.clone(), module);
                    info!(trigger = %request.id, "trigger created");
                    Ok(serde_json::Value::Null)
                }
            }),
            false,
        );

        let reg = Arc::clone(&registry);
        service.register(
            "Scheduler.DeleteTrigger",
            Arc::new(move |handle, args: serde_json::Value| {
                let reg = Arc::clone(&reg);
                async move {
                    let request: DeleteTriggerRequest =
                        serde_json::from_value(args).map_err(|e| CoreError::Handler(e.to_string()))?;

                    let module = reg
                        .lock()
                        .unwrap()
                        .by_id
                        .remove(&request.id)
                        .ok_or_else(|| CoreError::Handler(format!("no such trigger: {}", request.id)))?;

                    handle.release_module(module).map_err(|e| CoreError::Handler(e.to_string()))?;
                    info!(trigger = %request.id, "trigger deleted");
                    Ok(serde_json::Value::Null)
                }
            }),
            false,
        );

        let reg = Arc::clone(&registry);
        service.register(
            "Scheduler.ListTriggers",
            Arc::new(move |_handle, _args: serde_json::Value| {
                let reg = Arc::clone(&reg);
                async move {
                    let ids: Vec<String> = reg.lock().unwrap().by_id.keys().cloned().collect();
                    Ok(serde_json::to_value(ids).unwrap())
                }
            }),
            false,
        );
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_trigger_request_round_trips_through_json() {
        let req = CreateTriggerRequest {
            id: "daily-report".to_owned(),
            schedule: TriggerSchedule::Cron {
                expression: "0 0 9 * * * *".to_owned(),
            },
            dispatch: serde_json::json!({"url": "https://example.com/hook"}),
        };
        let value = serde_json::to_value(&req).unwrap();
        let back: CreateTriggerRequest = serde_json::from_value(value).unwrap();
        assert_eq!(back.id, req.id);
    }

    #[tokio::test]
    async fn creating_then_deleting_a_trigger_round_trips_through_the_service() {
        use node_core::cluster::{Cluster, RoundRobin};

        let (service, handle) = Service::new("Scheduler", 2);
        let ctx = ServiceContext::new(
            "Scheduler",
            std::sync::Arc::new(node_core::config::ConfigLoader::from_path(&None)),
            node_core::shutdown::Shutdown::default(),
        );
        (factory())(&service, &ctx);
        service.seal_handlers();

        let cluster = Cluster::new(1, std::sync::Arc::new(RoundRobin::default()));
        cluster.register_local("Scheduler", handle);
        tokio::spawn(service.run());

        cluster
            .dispatch_local(
                "Scheduler.CreateTrigger",
                serde_json::to_value(CreateTriggerRequest {
                    id: "t1".to_owned(),
                    schedule: TriggerSchedule::After { delay_ms: 60_000 },
                    dispatch: serde_json::Value::Null,
                })
                .unwrap(),
                false,
            )
            .await
            .unwrap();

        let listed = cluster
            .dispatch_local("Scheduler.ListTriggers", serde_json::Value::Null, false)
            .await
            .unwrap();
        assert_eq!(listed, serde_json::json!(["t1"]));

        cluster
            .dispatch_local(
                "Scheduler.DeleteTrigger",
                serde_json::to_value(DeleteTriggerRequest { id: "t1".to_owned() }).unwrap(),
                false,
            )
            .await
            .unwrap();
    }
}
