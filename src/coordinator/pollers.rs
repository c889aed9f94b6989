//! # Pollers
//!
//! Time only enters the engine here. Delay timers (pauses, retries,
//! scheduled starts) and SLA deadlines live in storage rather than in
//! process timers, so they survive a restart; these loops scan the stores
//! on a fixed interval and push whatever came due through the coordinator's
//! normal lock-fold-persist path. Ticks never overlap: the next scan starts
//! only after the previous one finished.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error};

use super::Coordinator;

/// Scan the delay store and fire every due timer. Also sweeps expired
/// multiple-condition windows, which share the same clock-driven nature.
pub async fn run_delay_poller(coordinator: Arc<Coordinator>) {
    let period = Duration::from_millis(coordinator.config.orchestrator.delay_poll_interval_ms);
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match coordinator.fire_due_delays().await {
                    Ok(0) => {}
                    Ok(fired) => debug!(fired, "fired due execution delays"),
                    Err(error) => error!(error = %error, "delay poll failed"),
                }
                match coordinator.trigger_service.purge_expired_windows().await {
                    Ok(0) => {}
                    Ok(purged) => debug!(purged, "dropped expired multiple-condition windows"),
                    Err(error) => error!(error = %error, "multiple-condition window sweep failed"),
                }
            }
            _ = coordinator.shutdown.cancelled() => break,
        }
    }
}

/// Scan the SLA monitor store and re-check every execution whose deadline
/// passed.
pub async fn run_sla_poller(coordinator: Arc<Coordinator>) {
    let period = Duration::from_millis(coordinator.config.orchestrator.sla_poll_interval_ms);
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match coordinator.fire_expired_sla_monitors().await {
                    Ok(0) => {}
                    Ok(fired) => debug!(fired, "evaluated expired sla deadlines"),
                    Err(error) => error!(error = %error, "sla poll failed"),
                }
            }
            _ = coordinator.shutdown.cancelled() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::Utc;

    use crate::config::WeirConfig;
    use crate::coordinator::{CoordinatorQueues, CoordinatorStores};
    use crate::messaging::MessageQueue;
    use crate::models::execution::Execution;
    use crate::models::flow::{Flow, RunnableDef, Sla, SlaBehavior, TaskDef, TaskKind};
    use crate::models::state::StateKind;
    use crate::models::JsonMap;
    use crate::orchestration::service::WorkerGroupRegistry;
    use crate::storage::{
        DelayType, ExecutionDelay, ExecutionDelayStorage, ExecutionRepository, FlowStore,
        SlaMonitor, SlaMonitorStorage,
    };

    fn runnable(id: &str) -> TaskDef {
        TaskDef {
            id: id.to_string(),
            kind: TaskKind::Runnable(RunnableDef {
                plugin: "noop".to_string(),
                params: serde_json::Value::Null,
            }),
            retry: None,
            allow_failure: false,
            allow_warning: false,
            worker_group: None,
        }
    }

    fn flow(sla: Vec<Sla>) -> Flow {
        Flow {
            tenant: "main".to_string(),
            namespace: "dev".to_string(),
            id: "etl".to_string(),
            revision: 1,
            tasks: vec![runnable("extract")],
            errors: vec![],
            finally_tasks: vec![],
            listeners: vec![],
            after_execution: vec![],
            outputs: vec![],
            retry: None,
            concurrency: None,
            sla,
            triggers: vec![],
            disabled: false,
        }
    }

    fn coordinator(flows: Vec<Flow>) -> Arc<Coordinator> {
        let mut config = WeirConfig::default();
        config.orchestrator.delay_poll_interval_ms = 20;
        config.orchestrator.sla_poll_interval_ms = 20;
        let flow_store = Arc::new(FlowStore::with_flows(flows));
        Arc::new(Coordinator::new(
            config,
            CoordinatorQueues::in_memory(64),
            CoordinatorStores::in_memory(flow_store),
            Arc::new(WorkerGroupRegistry::new()),
        ))
    }

    #[tokio::test]
    async fn test_delay_poller_wakes_a_due_execution() {
        let etl = flow(vec![]);
        let coordinator = coordinator(vec![etl.clone()]);
        let execution = Execution::create(&etl, JsonMap::new(), vec![]);
        drop(
            coordinator
                .stores()
                .executions
                .lock_or_insert(&execution)
                .await
                .unwrap(),
        );
        coordinator
            .stores()
            .delays
            .save(ExecutionDelay {
                execution_id: execution.id,
                task_run_id: None,
                date: Utc::now() - chrono::Duration::seconds(1),
                state: StateKind::Running,
                delay_type: DelayType::ResumeFlow,
            })
            .await
            .unwrap();

        let handle = tokio::spawn(run_delay_poller(Arc::clone(&coordinator)));

        let woken = tokio::time::timeout(
            Duration::from_secs(2),
            coordinator.queues().execution.receive(),
        )
        .await
        .expect("poller fired the delay")
        .expect("queue open");
        assert_eq!(woken.id, execution.id);
        assert_eq!(woken.state.current, StateKind::Running);

        coordinator.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_sla_poller_fails_an_overdue_execution() {
        let etl = flow(vec![Sla::MaxDuration {
            id: "max-runtime".to_string(),
            duration_ms: 10,
            behavior: SlaBehavior::Fail,
            labels: vec![],
        }]);
        let coordinator = coordinator(vec![etl.clone()]);
        let execution = Execution::create(&etl, JsonMap::new(), vec![]).with_state(StateKind::Running);
        drop(
            coordinator
                .stores()
                .executions
                .lock_or_insert(&execution)
                .await
                .unwrap(),
        );
        coordinator
            .stores()
            .sla_monitors
            .save(SlaMonitor {
                execution_id: execution.id,
                sla_id: "max-runtime".to_string(),
                deadline: Utc::now() - chrono::Duration::seconds(1),
            })
            .await
            .unwrap();
        // let the wall clock pass the deadline
        tokio::time::sleep(Duration::from_millis(30)).await;

        let handle = tokio::spawn(run_sla_poller(Arc::clone(&coordinator)));

        let failed = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let row = coordinator
                    .stores()
                    .executions
                    .find(execution.id)
                    .await
                    .unwrap()
                    .expect("execution row");
                if row.state.is_terminated() {
                    return row;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("sla poller converged the execution");
        assert_eq!(failed.state.current, StateKind::Failed);

        coordinator.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_pollers_stop_on_shutdown() {
        let coordinator = coordinator(vec![]);
        let delay = tokio::spawn(run_delay_poller(Arc::clone(&coordinator)));
        let sla = tokio::spawn(run_sla_poller(Arc::clone(&coordinator)));

        coordinator.shutdown();
        tokio::time::timeout(Duration::from_secs(1), delay)
            .await
            .expect("delay poller stopped")
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), sla)
            .await
            .expect("sla poller stopped")
            .unwrap();
    }
}
