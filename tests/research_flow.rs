//! End-to-end research workflow against scripted collaborators

mod common;

use common::{orchestrator, orchestrator_with_store, ScriptedModel, GREETING_REPLY};
use deep_research::research::SessionStore;
use deep_research::research::{Confirmation, Stage, StartRequest};
use deep_research::ResearchError;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

fn start(topic: &str) -> StartRequest {
    StartRequest {
        topic: topic.to_string(),
        locale: None,
    }
}

fn confirm(session_id: Uuid) -> Confirmation {
    Confirmation {
        session_id,
        user_confirm: "confirm".to_string(),
        message: None,
    }
}

#[tokio::test]
async fn test_simple_greeting_answered_directly() {
    let model = Arc::new(ScriptedModel::new());
    let orchestrator = orchestrator(model.clone());

    let status = orchestrator.start_session(start("你好")).await.unwrap();

    assert_eq!(status.status, "completed");
    assert_eq!(status.stage, Stage::End);
    assert!(!status.need_plan);
    assert_eq!(status.message.as_deref(), Some(GREETING_REPLY));
    assert!(status.current_plan.is_none());
    assert!(status.step_results.is_empty());
    assert_eq!(model.count("plan"), 0);
}

#[tokio::test]
async fn test_complex_topic_confirmed_plan_produces_report() {
    let model = Arc::new(ScriptedModel::new());
    let orchestrator = orchestrator(model.clone());

    let proposed = orchestrator
        .start_session(start("2024年新能源汽车市场分析"))
        .await
        .unwrap();
    assert_eq!(proposed.status, "awaiting_confirmation");
    assert!(proposed.need_plan);
    assert_eq!(proposed.plan_iterations, 1);
    let plan = proposed.current_plan.clone().unwrap();
    assert!(!plan.steps.is_empty());
    assert!(proposed.message.unwrap().contains("Plan v1"));

    let done = orchestrator.resume(confirm(proposed.session_id)).await.unwrap();

    assert_eq!(done.status, "completed");
    assert_eq!(done.step_results.len(), 2);
    assert!(done.step_results.iter().all(|r| !r.is_error()));
    assert_eq!(model.count("report"), 2);

    let step = done
        .step_results
        .iter()
        .find(|r| r.step_index == 0)
        .unwrap();
    assert_eq!(step.title, "市场现状 v1");
    assert_eq!(step.images, vec!["https://img.example.com/step1.png"]);
    assert!(step.sources.contains(&"https://example.com/step1".to_string()));

    let report = done.research_summary.unwrap();
    assert!(report.starts_with("# 研究报告: Plan v1"));
    assert!(report.contains("## 背景与研究动机"));
    assert!(report.contains("## 市场现状 v1"));
    assert!(report.contains("## 技术趋势 v1"));
    assert!(!report.contains("政策环境"));
    assert!(report.contains("## 结论"));
    assert!(report.contains("## 参考资料"));
    assert!(report.contains("https://example.com/step2"));
    assert!(report.contains("研究完成时间"));
}

#[tokio::test]
async fn test_modify_produces_new_plan_before_confirm() {
    let model = Arc::new(ScriptedModel::new());
    let orchestrator = orchestrator(model.clone());

    let first = orchestrator.start_session(start("量子计算的商业化前景")).await.unwrap();
    assert_eq!(first.current_plan.as_ref().unwrap().title, "Plan v1");

    let revised = orchestrator
        .resume(Confirmation {
            session_id: first.session_id,
            user_confirm: "modify".to_string(),
            message: Some("请重点关注金融行业".to_string()),
        })
        .await
        .unwrap();

    assert_eq!(revised.status, "awaiting_confirmation");
    assert_eq!(revised.plan_iterations, 2);
    let second_plan = revised.current_plan.clone().unwrap();
    assert_eq!(second_plan.title, "Plan v2");
    assert_ne!(Some(second_plan), first.current_plan);

    let done = orchestrator.resume(confirm(first.session_id)).await.unwrap();
    assert_eq!(done.status, "completed");
    assert!(done.research_summary.unwrap().contains("Plan v2"));
    assert!(done.step_results.iter().all(|r| r.title.ends_with("v2")));
    assert_eq!(model.count("plan"), 2);
}

#[tokio::test]
async fn test_failed_merges_fall_back_to_raw_findings() {
    let model = Arc::new(ScriptedModel::with_failing_reports());
    let orchestrator = orchestrator(model.clone());

    let proposed = orchestrator.start_session(start("固态电池")).await.unwrap();
    let done = orchestrator.resume(confirm(proposed.session_id)).await.unwrap();

    assert_eq!(done.status, "completed");
    let report = done.research_summary.unwrap();
    assert!(report.contains("## 市场现状 v1"));
    assert!(report.contains("据 [来源](https://example.com/step1)"));
}

#[tokio::test]
async fn test_malformed_plan_is_decode_error() {
    let model = Arc::new(ScriptedModel::with_malformed_plan());
    let orchestrator = orchestrator(model);

    let err = orchestrator.start_session(start("芯片供应链")).await.unwrap_err();
    assert_eq!(err.kind(), "plan_decode");
}

#[tokio::test]
async fn test_invalid_confirmation_keeps_session_waiting() {
    let orchestrator = orchestrator(Arc::new(ScriptedModel::new()));
    let proposed = orchestrator.start_session(start("低空经济")).await.unwrap();

    let err = orchestrator
        .resume(Confirmation {
            session_id: proposed.session_id,
            user_confirm: "maybe".to_string(),
            message: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ResearchError::InvalidConfirmation(_)));

    let status = orchestrator.status(proposed.session_id).await.unwrap();
    assert_eq!(status.status, "awaiting_confirmation");
}

#[tokio::test]
async fn test_resume_after_completion_is_invalid_transition() {
    let orchestrator = orchestrator(Arc::new(ScriptedModel::new()));
    let answered = orchestrator.start_session(start("你好")).await.unwrap();

    let err = orchestrator.resume(confirm(answered.session_id)).await.unwrap_err();
    assert!(matches!(err, ResearchError::InvalidTransition { .. }));
}

#[tokio::test]
async fn test_unknown_session() {
    let orchestrator = orchestrator(Arc::new(ScriptedModel::new()));
    let id = Uuid::new_v4();

    assert!(matches!(
        orchestrator.status(id).await,
        Err(ResearchError::SessionNotFound(_))
    ));
    assert!(matches!(
        orchestrator.resume(confirm(id)).await,
        Err(ResearchError::SessionNotFound(_))
    ));
}

#[tokio::test]
async fn test_cancel_waiting_session() {
    let orchestrator = orchestrator(Arc::new(ScriptedModel::new()));
    let proposed = orchestrator.start_session(start("储能行业")).await.unwrap();

    let cancelled = orchestrator.cancel(proposed.session_id).await.unwrap();
    assert_eq!(cancelled.status, "cancelled");
    assert_eq!(cancelled.stage, Stage::End);

    assert!(matches!(
        orchestrator.resume(confirm(proposed.session_id)).await,
        Err(ResearchError::InvalidTransition { .. })
    ));
    assert!(matches!(
        orchestrator.cancel(proposed.session_id).await,
        Err(ResearchError::InvalidTransition { .. })
    ));
}

#[tokio::test]
async fn test_detached_resume_completes_in_background() {
    let orchestrator = orchestrator(Arc::new(ScriptedModel::new()));
    let proposed = orchestrator.start_session(start("人形机器人")).await.unwrap();

    let accepted = orchestrator
        .resume_detached(confirm(proposed.session_id))
        .await
        .unwrap();
    assert_eq!(accepted.status, "researching");

    let mut status = accepted;
    for _ in 0..100 {
        status = orchestrator.status(proposed.session_id).await.unwrap();
        if status.status == "completed" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert_eq!(status.status, "completed");
    assert!(status.research_summary.is_some());
}

#[tokio::test]
async fn test_empty_topic_rejected() {
    let orchestrator = orchestrator(Arc::new(ScriptedModel::new()));
    let err = orchestrator.start_session(start("   ")).await.unwrap_err();
    assert_eq!(err.kind(), "invalid_request");
}

#[tokio::test]
async fn test_failed_step_recorded_while_other_step_completes() {
    let model = Arc::new(ScriptedModel::with_failing_step(1));
    let orchestrator = orchestrator(model.clone());

    let proposed = orchestrator.start_session(start("钠离子电池")).await.unwrap();
    let done = orchestrator.resume(confirm(proposed.session_id)).await.unwrap();

    assert_eq!(done.status, "completed");
    assert_eq!(done.step_results.len(), 2);

    let failed = done.step_results.iter().find(|r| r.step_index == 0).unwrap();
    assert!(failed.is_error());
    assert!(failed.result_markdown.starts_with("研究失败"));

    let succeeded = done.step_results.iter().find(|r| r.step_index == 1).unwrap();
    assert!(!succeeded.is_error());

    // One delivered step, one report increment
    assert_eq!(model.count("report"), 1);
    let report = done.research_summary.unwrap();
    assert!(report.contains("## 技术趋势 v1"));
    assert!(!report.contains("## 市场现状 v1"));
}

#[tokio::test]
async fn test_cancel_during_research() {
    let model = Arc::new(ScriptedModel::with_slow_research(Duration::from_secs(30)));
    let orchestrator = orchestrator(model.clone());
    let proposed = orchestrator.start_session(start("深海采矿")).await.unwrap();

    let accepted = orchestrator
        .resume_detached(confirm(proposed.session_id))
        .await
        .unwrap();
    assert_eq!(accepted.status, "researching");

    tokio::time::sleep(Duration::from_millis(50)).await;
    orchestrator.cancel(proposed.session_id).await.unwrap();

    let mut status = accepted;
    for _ in 0..100 {
        status = orchestrator.status(proposed.session_id).await.unwrap();
        if status.status == "cancelled" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert_eq!(status.status, "cancelled");
    assert_eq!(status.stage, Stage::End);
    assert!(status.research_summary.is_none());
    assert_eq!(model.count("report"), 0);
}

#[tokio::test]
async fn test_modify_without_message_replans_without_empty_feedback() {
    let (orchestrator, store) = orchestrator_with_store(Arc::new(ScriptedModel::new()));
    let first = orchestrator.start_session(start("城市更新")).await.unwrap();

    let revised = orchestrator
        .resume(Confirmation {
            session_id: first.session_id,
            user_confirm: "modify".to_string(),
            message: Some("  ".to_string()),
        })
        .await
        .unwrap();
    assert_eq!(revised.status, "awaiting_confirmation");
    assert_eq!(revised.plan_iterations, 2);

    let state = store.load(first.session_id).await.unwrap().unwrap();
    assert!(state
        .history()
        .iter()
        .all(|m| m.name.as_deref() != Some("feedback")));
}
