use super::*;
use crate::app::Settings;
use crate::cron::RecordingCronGateway;
use crate::engine::claim::Claimed;
use crate::storage::{StepStatus, Store};
use chrono::{Duration as ChronoDuration, Utc};
use std::path::Path;

const SINGLE_YAML: &str = r#"
id: solo
steps:
  - id: plan
    agent: p
    input: "Plan ${TASK}"
    outputs: [SUMMARY]
"#;

const LOOP_YAML: &str = r#"
id: farm
steps:
  - id: plan
    agent: p
    outputs: [STORIES_JSON]
  - id: build
    agent: d
    type: loop
    outputs: [RESULT]
    loop:
      source: plan
      workers: 2
"#;

async fn engine() -> Engine {
    let store = Store::open_in_memory().await.expect("in-memory store");
    Engine::new(store, Settings::default())
}

fn write_spec(dir: &Path, yaml: &str) -> WorkflowSpec {
    let spec = WorkflowSpec::from_yaml(yaml).expect("valid spec");
    std::fs::create_dir_all(dir).unwrap();
    std::fs::write(dir.join(format!("{}.yaml", spec.id)), yaml).unwrap();
    spec
}

fn claimed_unit(claim: Option<Claimed>) -> String {
    match claim {
        Some(Claimed::Step { step_id, .. }) => step_id,
        Some(Claimed::Story { story_id, .. }) => story_id,
        None => panic!("expected a claim"),
    }
}

/// Seed a loop run with two stories pending.
async fn seed_loop_run(engine: &Engine, spec: &WorkflowSpec, now: chrono::DateTime<Utc>) -> String {
    let run = engine.start_run(spec, "t", now).await.unwrap();
    let plan = claimed_unit(engine.claim("p", now).await.unwrap());
    engine
        .complete(
            &plan,
            r#"STORIES_JSON: [{"story_id":"a","title":"A","input":"do A"},{"story_id":"b","title":"B","input":"do B"}]"#,
            now,
        )
        .await
        .unwrap();
    run.id
}

// S5: a claimed-and-forgotten step is reset once the role timeout passes.
#[tokio::test]
async fn stuck_step_is_reset_with_abandon_count() {
    let engine = engine().await;
    let gateway = RecordingCronGateway::default();
    let dir = tempfile::tempdir().unwrap();
    let spec = write_spec(dir.path(), SINGLE_YAML);
    let t0 = Utc::now();
    engine.start_run(&spec, "t", t0).await.unwrap();
    let unit = claimed_unit(engine.claim("p", t0).await.unwrap());

    let medic = Medic::new(&engine, &gateway, dir.path().to_path_buf());
    // 36 minutes: past max_role_timeout (30m) + grace (5m)
    let report = medic.run_pass(t0 + ChronoDuration::minutes(36)).await.unwrap();

    let finding = report
        .findings
        .iter()
        .find(|f| f.check == CheckKind::StuckStep)
        .expect("stuck step finding");
    assert!(finding.remediated);
    assert_eq!(finding.severity, Severity::Critical);
    let step = engine.store().step(&unit).await.unwrap().unwrap();
    assert_eq!(step.status, StepStatus::Pending);
    assert_eq!(step.abandoned_count, 1);
    assert_eq!(step.retry_count, 0);
}

#[tokio::test]
async fn claimed_but_stuck_takes_the_faster_path() {
    let engine = engine().await;
    let gateway = RecordingCronGateway::default();
    let dir = tempfile::tempdir().unwrap();
    let spec = write_spec(dir.path(), SINGLE_YAML);
    let t0 = Utc::now();
    engine.start_run(&spec, "t", t0).await.unwrap();
    let unit = claimed_unit(engine.claim("p", t0).await.unwrap());

    let medic = Medic::new(&engine, &gateway, dir.path().to_path_buf());
    // 15 minutes: past the 10m suspicion threshold, below the 30m timeout
    let report = medic.run_pass(t0 + ChronoDuration::minutes(15)).await.unwrap();

    assert!(report
        .findings
        .iter()
        .any(|f| f.check == CheckKind::ClaimedButStuck && f.remediated));
    let step = engine.store().step(&unit).await.unwrap().unwrap();
    assert_eq!(step.status, StepStatus::Pending);
}

#[tokio::test]
async fn fresh_claims_are_left_alone() {
    let engine = engine().await;
    let gateway = RecordingCronGateway::default();
    let dir = tempfile::tempdir().unwrap();
    let spec = write_spec(dir.path(), SINGLE_YAML);
    let t0 = Utc::now();
    engine.start_run(&spec, "t", t0).await.unwrap();
    let unit = claimed_unit(engine.claim("p", t0).await.unwrap());

    let medic = Medic::new(&engine, &gateway, dir.path().to_path_buf());
    let report = medic.run_pass(t0 + ChronoDuration::minutes(5)).await.unwrap();

    assert!(report.findings.is_empty(), "{:?}", report.findings);
    let step = engine.store().step(&unit).await.unwrap().unwrap();
    assert_eq!(step.status, StepStatus::Running);
}

// S6: after five abandons the story is skipped and the loop progresses.
#[tokio::test]
async fn orphaned_story_is_skipped_after_five_abandons() {
    let engine = engine().await;
    let gateway = RecordingCronGateway::default();
    let dir = tempfile::tempdir().unwrap();
    let spec = write_spec(dir.path(), LOOP_YAML);
    let mut now = Utc::now();
    let run_id = seed_loop_run(&engine, &spec, now).await;
    let medic = Medic::new(&engine, &gateway, dir.path().to_path_buf());

    // story b completes normally; story a keeps getting orphaned
    let a = claimed_unit(engine.claim("d", now).await.unwrap());
    let b = claimed_unit(engine.claim("d", now).await.unwrap());
    engine.complete(&b, "RESULT: ok", now).await.unwrap();

    for cycle in 1..=5 {
        now += ChronoDuration::minutes(31);
        let report = medic.run_pass(now).await.unwrap();
        assert!(
            report.findings.iter().any(|f| f.check == CheckKind::OrphanedStory),
            "cycle {cycle}: {:?}",
            report.findings
        );
        if cycle < 5 {
            let reclaimed = claimed_unit(engine.claim("d", now).await.unwrap());
            assert_eq!(reclaimed, a);
        }
    }

    let story = engine.store().story(&a).await.unwrap().unwrap();
    assert_eq!(story.status, crate::storage::StoryStatus::Skipped);
    assert_eq!(story.abandoned_count, 5);
    // skipping the last open story completes the loop and the run
    let run = engine.store().run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.status, crate::storage::RunStatus::Done);
}

#[tokio::test]
async fn dead_run_is_failed() {
    let engine = engine().await;
    let gateway = RecordingCronGateway::default();
    let dir = tempfile::tempdir().unwrap();
    let spec = write_spec(dir.path(), SINGLE_YAML);
    let t0 = Utc::now();
    let run = engine.start_run(&spec, "t", t0).await.unwrap();
    // crash leftover: every step finished but the run was never closed out
    engine
        .store()
        .execute_raw("UPDATE steps SET status = 'done'")
        .await
        .unwrap();

    let medic = Medic::new(&engine, &gateway, dir.path().to_path_buf());
    let report = medic.run_pass(t0 + ChronoDuration::minutes(1)).await.unwrap();

    assert!(report
        .findings
        .iter()
        .any(|f| f.check == CheckKind::DeadRun && f.remediated));
    let run = engine.store().run(&run.id).await.unwrap().unwrap();
    assert_eq!(run.status, crate::storage::RunStatus::Failed);
}

#[tokio::test]
async fn stalled_run_alerts_but_never_acts() {
    let engine = engine().await;
    let gateway = RecordingCronGateway::default();
    let dir = tempfile::tempdir().unwrap();
    let spec = write_spec(dir.path(), SINGLE_YAML);
    let t0 = Utc::now();
    let run = engine.start_run(&spec, "t", t0).await.unwrap();

    let medic = Medic::new(&engine, &gateway, dir.path().to_path_buf());
    // pending (unclaimed) step, no transitions for > 2 x 30m
    let report = medic.run_pass(t0 + ChronoDuration::minutes(61)).await.unwrap();

    let finding = report
        .findings
        .iter()
        .find(|f| f.check == CheckKind::StalledRun)
        .expect("stalled run finding");
    assert!(!finding.remediated);
    assert_eq!(finding.action, "none");
    let run = engine.store().run(&run.id).await.unwrap().unwrap();
    assert_eq!(run.status, crate::storage::RunStatus::Running);
}

#[tokio::test]
async fn orphaned_cron_jobs_are_deleted() {
    let engine = engine().await;
    let gateway = RecordingCronGateway::default();
    let dir = tempfile::tempdir().unwrap();
    gateway
        .create_job(crate::cron::CronJobSpec {
            name: "setfarm/ghost/ghost/planner".into(),
            interval_ms: 300_000,
            anchor_ms: 0,
            agent_id: "ghost/planner".into(),
            payload: "poll".into(),
            enabled: true,
        })
        .await
        .unwrap();

    let medic = Medic::new(&engine, &gateway, dir.path().to_path_buf());
    let report = medic.run_pass(Utc::now()).await.unwrap();

    assert!(report
        .findings
        .iter()
        .any(|f| f.check == CheckKind::OrphanedCrons && f.remediated));
    assert!(gateway.jobs().is_empty());
}

#[tokio::test]
async fn stalled_crons_are_recreated_with_cooldown() {
    let engine = engine().await;
    let gateway = RecordingCronGateway::default();
    let dir = tempfile::tempdir().unwrap();
    let spec = write_spec(dir.path(), LOOP_YAML);
    let t0 = Utc::now();
    seed_loop_run(&engine, &spec, t0).await;
    let medic = Medic::new(&engine, &gateway, dir.path().to_path_buf());

    // 13 minutes without any claim: restore creates jobs, stall check
    // recycles them
    let now = t0 + ChronoDuration::minutes(13);
    let report = medic.run_pass(now).await.unwrap();
    assert!(report
        .findings
        .iter()
        .any(|f| f.check == CheckKind::StalledCrons && f.remediated));
    assert!(!gateway.jobs().is_empty());

    // within the 15m cooldown no second restart happens
    let report = medic.run_pass(now + ChronoDuration::minutes(5)).await.unwrap();
    assert!(!report
        .findings
        .iter()
        .any(|f| f.check == CheckKind::StalledCrons));
}

#[tokio::test]
async fn failed_run_with_pending_stories_is_resumed_at_most_thrice() {
    let engine = engine().await;
    let gateway = RecordingCronGateway::default();
    let dir = tempfile::tempdir().unwrap();
    let spec = write_spec(dir.path(), LOOP_YAML);
    let mut now = Utc::now();
    let run_id = seed_loop_run(&engine, &spec, now).await;
    let medic = Medic::new(&engine, &gateway, dir.path().to_path_buf());

    // burn story a's budget so the loop and the run fail while b pends
    for _ in 0..3 {
        let a = claimed_unit(engine.claim("d", now).await.unwrap());
        engine.fail(&a, "boom", now).await.unwrap();
    }
    assert_eq!(
        engine.store().run(&run_id).await.unwrap().unwrap().status,
        crate::storage::RunStatus::Failed
    );

    now += ChronoDuration::minutes(1);
    let report = medic.run_pass(now).await.unwrap();
    assert!(report
        .findings
        .iter()
        .any(|f| f.check == CheckKind::FailedRunResumable && f.remediated));
    let run = engine.store().run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.status, crate::storage::RunStatus::Running);
    assert_eq!(run.meta_u32("resume_count"), 1);

    // bound: a run that already used its three resumes is left failed
    engine
        .store()
        .set_run_meta(&run_id, "resume_count", serde_json::json!(3), now)
        .await
        .unwrap();
    engine
        .store()
        .mark_run_failed(&run_id, "failed again", now)
        .await
        .unwrap();
    now += ChronoDuration::minutes(20);
    let report = medic.run_pass(now).await.unwrap();
    let finding = report
        .findings
        .iter()
        .find(|f| f.check == CheckKind::FailedRunResumable)
        .expect("bound finding");
    assert!(!finding.remediated);
    assert_eq!(finding.action, "none");
    assert_eq!(
        engine.store().run(&run_id).await.unwrap().unwrap().status,
        crate::storage::RunStatus::Failed
    );
}

#[tokio::test]
async fn gateway_outage_degrades_to_a_warning() {
    let engine = engine().await;
    let gateway = RecordingCronGateway::default();
    gateway.fail_all(true);
    let dir = tempfile::tempdir().unwrap();

    let medic = Medic::new(&engine, &gateway, dir.path().to_path_buf());
    let report = medic.run_pass(Utc::now()).await.unwrap();

    assert!(report
        .findings
        .iter()
        .any(|f| f.check == CheckKind::GatewayUnreachable));
    // the pass still records its audit row
    let checks = engine.store().medic_checks(1).await.unwrap();
    assert_eq!(checks.len(), 1);
}

#[tokio::test]
async fn restore_creates_jobs_for_running_workflows() {
    let engine = engine().await;
    let gateway = RecordingCronGateway::default();
    let dir = tempfile::tempdir().unwrap();
    let spec = write_spec(dir.path(), SINGLE_YAML);
    engine.start_run(&spec, "t", Utc::now()).await.unwrap();

    let medic = Medic::new(&engine, &gateway, dir.path().to_path_buf());
    let created = medic.restore_cron_jobs().await.unwrap();
    assert_eq!(created, 1);
    assert!(gateway.jobs()[0].name.starts_with("setfarm/solo/"));
}
