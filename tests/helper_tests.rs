//! Execute jobs against an in-process helper

mod common;

use std::sync::Arc;
use std::time::Duration;

use authbroker::backend::StaticBackend;
use authbroker::helper::HandlerTable;
use authbroker::reply::ErrorCode;
use authbroker::{
    ActionReply, AuthStatus, ExecutionMode, JobEvent, KillVerbosity, PolicyBackend, VariantMap,
};
use common::{run_collecting, TestBackend, TestHelper, HELPER_ID};
use serde_json::json;
use uuid::Uuid;

#[tokio::test(flavor = "multi_thread")]
async fn test_basic_action_execution() {
    let helper = TestHelper::start().await;
    let broker = helper.broker();
    let action = helper.action(&broker, "standardaction");

    assert!(broker.is_valid(&action));
    assert_eq!(broker.status(&action), AuthStatus::AuthRequired);

    let result = broker.execute(&action, ExecutionMode::Execute).exec().await;
    assert!(result.succeeded(), "{}", result.error_text);
    assert!(result.data.is_empty());

    helper.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_execute_job_signals() {
    let helper = TestHelper::start().await;
    let broker = helper.broker();
    let action = helper.action(&broker, "longaction");
    assert_eq!(broker.status(&action), AuthStatus::AuthRequired);

    let job = broker.execute(&action, ExecutionMode::Execute);
    let events = run_collecting(&job).await;

    let results: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, JobEvent::Result(_)))
        .collect();
    assert_eq!(results.len(), 1);

    let statuses: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            JobEvent::StatusChanged(status) => Some(*status),
            _ => None,
        })
        .collect();
    assert_eq!(statuses, vec![AuthStatus::Authorized]);

    let percents: Vec<u32> = events
        .iter()
        .filter_map(|e| match e {
            JobEvent::PercentChanged(p) => Some(*p),
            _ => None,
        })
        .collect();
    assert_eq!(percents, (1..=100).collect::<Vec<u32>>());

    let data: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            JobEvent::NewData(data) => Some(data.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(data.len(), 1);
    assert_eq!(data[0]["Answer"], json!(42));

    // Progress is delivered before the result
    assert!(matches!(events.last(), Some(JobEvent::Result(_))));
    assert_eq!(job.percent(), 100);
    assert_eq!(job.error(), 0);
    assert!(job.data().is_empty());
    assert!(job.completed_at().is_some());

    helper.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_two_calls() {
    let helper = TestHelper::start().await;
    let broker = helper.broker();
    let action = helper.action(&broker, "standardaction");

    assert!(broker.execute(&action, ExecutionMode::Execute).exec().await.succeeded());
    assert!(broker.execute(&action, ExecutionMode::Execute).exec().await.succeeded());

    helper.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_action_data_round_trip() {
    let helper = TestHelper::start().await;
    let broker = helper.broker();
    let mut action = helper.action(&broker, "echoaction");

    let mut args = VariantMap::new();
    for _ in 0..150 {
        let id = Uuid::new_v4();
        args.insert(id.to_string(), json!(id.as_u128() as u32));
    }
    action.set_arguments(args.clone());

    let result = broker.execute(&action, ExecutionMode::Execute).exec().await;
    assert!(result.succeeded(), "{}", result.error_text);
    assert_eq!(result.data, args);

    helper.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_helper_failure() {
    let helper = TestHelper::start().await;
    let broker = helper.broker();

    let failing = helper.action(&broker, "failingaction");
    let result = broker.execute(&failing, ExecutionMode::Execute).exec().await;
    assert!(!result.succeeded());
    assert_eq!(result.error, -1);

    let standard = helper
        .action(&broker, "standardaction")
        .with_argument("fail", true);
    let result = broker.execute(&standard, ExecutionMode::Execute).exec().await;
    assert!(!result.succeeded());

    helper.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_busy_helper_rejects_second_request() {
    let helper = TestHelper::start().await;
    let broker = helper.broker();
    let long = helper.action(&broker, "longaction");
    let standard = helper.action(&broker, "standardaction");

    let first = broker.execute(&long, ExecutionMode::Execute);
    let mut rx = first.subscribe();
    first.start();
    // Wait until the helper is working on it
    loop {
        if let JobEvent::PercentChanged(_) = rx.recv().await.unwrap() {
            break;
        }
    }

    let second = broker.execute(&standard, ExecutionMode::Execute).exec().await;
    assert_eq!(second.error, ErrorCode::HelperBusy.code());

    assert!(first.wait().await.succeeded());
    helper.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_forged_caller_is_denied() {
    let helper = TestHelper::start().await;
    let impostor = Arc::new(TestBackend::with_caller_id(b"someone else"));
    let broker = helper.broker_with(impostor);
    let action = helper.action(&broker, "standardaction");

    let result = broker.execute(&action, ExecutionMode::Execute).exec().await;
    assert_eq!(result.error, ErrorCode::AuthorizationDenied.code());

    let name = format!("{}.standardaction", HELPER_ID);
    assert_eq!(helper.backend.action_status(&name), AuthStatus::Denied);

    helper.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_process_id_verification_over_socket() {
    let name = format!("{}.standardaction", HELPER_ID);
    let policy = Arc::new(StaticBackend::new().with_rule(name.as_str(), AuthStatus::Authorized));
    let helper = TestHelper::start_with_policy(
        policy.clone(),
        Arc::new(TestBackend::new()),
        Some(common::test_handlers()),
    )
    .await;

    // Presents this process id, which is what the socket peer reports
    let genuine = helper.broker_with(policy.clone());
    let action = helper.action(&genuine, "standardaction");
    let result = genuine.execute(&action, ExecutionMode::Execute).exec().await;
    assert!(result.succeeded(), "{}", result.error_text);

    // Claims to be pid 1; the policy alone would allow the action
    let foreign = helper.broker_with(Arc::new(TestBackend::with_caller_id(b"1")));
    let action = helper.action(&foreign, "standardaction");
    let result = foreign.execute(&action, ExecutionMode::Execute).exec().await;
    assert_eq!(result.error, ErrorCode::AuthorizationDenied.code());

    helper.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_kill_stops_long_action() {
    let helper = TestHelper::start().await;
    let broker = helper.broker();
    let action = helper.action(&broker, "longaction");

    let job = broker.execute(&action, ExecutionMode::Execute);
    let mut rx = job.subscribe();
    job.start();
    loop {
        if let JobEvent::PercentChanged(_) = rx.recv().await.unwrap() {
            break;
        }
    }

    assert!(job.kill(KillVerbosity::EmitResult));
    let result = job.wait().await;
    assert_eq!(result.error, ErrorCode::Killed.code());

    // The helper honours the stop request and becomes idle well before 2s
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while helper.dispatcher.is_busy() {
        assert!(tokio::time::Instant::now() < deadline, "helper never stopped");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // A later request runs normally
    let standard = helper.action(&broker, "standardaction");
    assert!(broker.execute(&standard, ExecutionMode::Execute).exec().await.succeeded());

    helper.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_quiet_kill_emits_no_result() {
    let helper = TestHelper::start().await;
    let broker = helper.broker();
    let action = helper.action(&broker, "longaction");

    let job = broker.execute(&action, ExecutionMode::Execute);
    let mut rx = job.subscribe();
    job.start();
    job.kill(KillVerbosity::Quietly);
    assert_eq!(job.wait().await.error, ErrorCode::Killed.code());

    tokio::time::sleep(Duration::from_millis(200)).await;
    while let Ok(event) = rx.try_recv() {
        assert!(!matches!(event, JobEvent::Result(_)));
    }

    helper.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_helper_without_responder() {
    let helper = TestHelper::start_with(None).await;
    let broker = helper.broker();
    let action = helper.action(&broker, "standardaction");

    let result = broker.execute(&action, ExecutionMode::Execute).exec().await;
    assert_eq!(result.error, ErrorCode::NoResponder.code());

    helper.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_handler_is_no_such_action() {
    let helper = TestHelper::start().await;
    let broker = helper.broker();
    let action = helper.action(&broker, "notimplemented");

    let result = broker.execute(&action, ExecutionMode::Execute).exec().await;
    assert_eq!(result.error, ErrorCode::NoSuchAction.code());

    helper.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_progress_from_custom_handler() {
    let handlers = HandlerTable::new().register("count", |ctx, _| {
        for step in [10, 10, 20, 30] {
            ctx.progress_step(step);
        }
        let mut reply = ActionReply::success_reply();
        reply.add_data("caller_uid", ctx.caller_uid());
        reply
    });
    let helper = TestHelper::start_with(Some(handlers)).await;
    let broker = helper.broker();
    let action = helper.action(&broker, "count");

    let job = broker.execute(&action, ExecutionMode::Execute);
    let events = run_collecting(&job).await;
    let percents: Vec<u32> = events
        .iter()
        .filter_map(|e| match e {
            JobEvent::PercentChanged(p) => Some(*p),
            _ => None,
        })
        .collect();
    assert_eq!(percents, vec![10, 20, 30]);
    assert!(job.data()["caller_uid"].is_u64());

    helper.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_action_timeout() {
    let handlers = HandlerTable::new().register("slow", |_, _| {
        std::thread::sleep(Duration::from_millis(500));
        ActionReply::success_reply()
    });
    let helper = TestHelper::start_with(Some(handlers)).await;
    let broker = helper.broker();
    let mut action = helper.action(&broker, "slow");
    action.set_timeout(50);

    let result = broker.execute(&action, ExecutionMode::Execute).exec().await;
    assert_eq!(result.error, ErrorCode::Transport.code());
    assert!(result.error_text.contains("no reply"));

    helper.stop().await;
}
