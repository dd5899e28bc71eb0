//! End-to-end tests for the rebuild and hot update pipeline
//!
//! Each test drives a session over a temporary project, collects the update
//! messages it pushes and applies them to an in-memory framework host.

mod common;

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use common::{drain, out, CommentHost, Fixture};
use jasmine_hmr::host::{ApplyOutcome, HostAgent, RunOrder};
use jasmine_hmr::mutator::count_tagged;
use jasmine_hmr::reporter::{self, ConsoleReporter};
use jasmine_hmr::watcher::WatchEvent;
use jasmine_hmr::{HmrSession, HostMessage, UpdateKind};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;

const FAST: &str = r#"{"debounceMs": 0}"#;

fn agent() -> HostAgent<CommentHost> {
    HostAgent::new(
        CommentHost::default(),
        RunOrder {
            random: false,
            seed: Some(1),
        },
    )
}

/// Build everything and load every output into the host, like a first page load
async fn boot(session: &HmrSession, agent: &mut HostAgent<CommentHost>) {
    session.initial_build().await.unwrap();
    for file in session.all_files() {
        let output = session.project().output_path(file);
        let content = fs::read_to_string(&output).unwrap();
        agent.load(&output.to_string_lossy(), Some(&content));
    }
}

fn math_project(fx: &Fixture) -> (PathBuf, PathBuf, PathBuf, PathBuf) {
    let c = fx.write("src/c.ts", "export const c = 1;");
    let b = fx.write("src/b.ts", "import { c } from './c';\nexport const b = c + 1;");
    let a = fx.write("src/a.ts", "import { b } from './b';\nexport const a = b + 1;");
    let spec = fx.write(
        "spec/a.spec.ts",
        "// suite:A\n// spec:computes a\n// spec:is positive\nimport { a } from '../src/a';",
    );
    fx.write("spec/other.spec.ts", "// suite:Other\n// spec:stays");
    (a, b, c, spec)
}

mod rebuild_flow {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_leaf_change_updates_every_dependent_and_reruns_its_specs() {
        let fx = Fixture::new();
        let (a, b, c, spec) = math_project(&fx);
        let session = fx.session(FAST);
        let mut host = agent();
        boot(&session, &mut host).await;
        let project = session.project().clone();

        fx.write("src/c.ts", "export const c = 2;");
        session.scheduler().queue_change(c.clone(), jasmine_hmr::ChangeKind::Modified).await.unwrap();

        let sent = drain(session.bridge());
        let paths: Vec<String> = sent.iter().map(|m| m.path.clone()).collect();
        assert_eq!(
            paths,
            vec![out(&project, &c), out(&project, &b), out(&project, &a), out(&project, &spec)]
        );
        assert!(sent.iter().all(|m| m.kind == UpdateKind::Update));
        assert_eq!(sent[0].affected_tests, Some(vec![out(&project, &spec)]));

        let mut rerun = Vec::new();
        for message in &sent {
            let applied = host.apply(message);
            assert_eq!(applied.reply, HostMessage::Ready);
            rerun.extend(applied.rerun);
        }
        assert!(rerun.contains(&"computes a".to_string()));
        assert!(!rerun.contains(&"stays".to_string()));

        let other = out(&project, &fx.path("spec/other.spec.ts"));
        assert_eq!(count_tagged(&host.host().root, &other), 2);
        assert_eq!(count_tagged(&host.host().root, &out(&project, &spec)), 3);
    }

    #[tokio::test]
    async fn test_spec_edit_is_a_test_update_of_one_file() {
        let fx = Fixture::new();
        let (_, _, _, spec) = math_project(&fx);
        let mut session = fx.session(FAST);
        let mut host = agent();
        boot(&session, &mut host).await;

        fx.write("spec/a.spec.ts", "// suite:A\n// spec:computes a\nimport { a } from '../src/a';");
        session.handle_event(WatchEvent::Change(spec.clone()));
        session.scheduler().idle().await;

        let sent = drain(session.bridge());
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, UpdateKind::TestUpdate);

        let applied = host.apply(&sent[0]);
        assert_eq!(applied.rerun, vec!["computes a".to_string()]);
        assert!(matches!(applied.outcome, ApplyOutcome::Swapped(r) if r.detached == 3 && r.tagged == 2));
    }

    #[tokio::test]
    async fn test_burst_of_changes_is_coalesced() {
        let fx = Fixture::new();
        let (a, b, c, _) = math_project(&fx);
        let mut session = fx.session(r#"{"debounceMs": 20}"#);
        session.initial_build().await.unwrap();

        for path in [&c, &b, &a, &c] {
            session.handle_event(WatchEvent::Change(path.clone()));
        }
        session.scheduler().idle().await;

        let status = session.scheduler().status();
        assert_eq!(status.passes, 1);
        assert_eq!(status.builds, 1);
        assert_eq!(drain(session.bridge()).len(), 4);
    }

    #[tokio::test]
    async fn test_syntax_error_in_module_surfaces_as_host_error() {
        let fx = Fixture::new();
        let (_, _, _, spec) = math_project(&fx);
        let mut session = fx.session(FAST);
        let mut host = agent();
        boot(&session, &mut host).await;

        fx.write("spec/a.spec.ts", "// suite:A\n// throw");
        session.handle_event(WatchEvent::Change(spec.clone()));
        session.scheduler().idle().await;

        let sent = drain(session.bridge());
        let applied = host.apply(&sent[0]);
        assert!(matches!(applied.reply, HostMessage::Error { .. }));
        assert_eq!(count_tagged(&host.host().root, &sent[0].path), 0);
    }
}

mod policies {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_critical_change_reloads_under_smart_policy() {
        let fx = Fixture::new();
        let boot_file = fx.write("src/bootstrap.ts", "globalThis.ready = true;");
        let mut session = fx.session(r#"{"debounceMs": 0, "critical": ["src/bootstrap.ts"]}"#);

        session.handle_event(WatchEvent::Change(boot_file));
        session.scheduler().idle().await;
        assert_eq!(drain(session.bridge())[0].kind, UpdateKind::FullReload);
    }

    #[tokio::test]
    async fn test_never_reload_keeps_critical_changes_incremental() {
        let fx = Fixture::new();
        let boot_file = fx.write("src/bootstrap.ts", "globalThis.ready = true;");
        let mut session = fx.session(
            r#"{"debounceMs": 0, "critical": ["src/bootstrap.ts"], "reloadPolicy": "never-reload"}"#,
        );

        session.handle_event(WatchEvent::Change(boot_file));
        session.scheduler().idle().await;
        assert_eq!(drain(session.bridge())[0].kind, UpdateKind::Update);
    }

    #[tokio::test]
    async fn test_always_reload_never_applies_to_specs() {
        let fx = Fixture::new();
        let spec = fx.write("spec/x.spec.ts", "// spec:x");
        let mut session = fx.session(r#"{"debounceMs": 0, "reloadPolicy": "always-reload"}"#);

        session.handle_event(WatchEvent::Change(spec));
        session.scheduler().idle().await;
        assert_eq!(drain(session.bridge())[0].kind, UpdateKind::TestUpdate);
    }

    #[tokio::test]
    async fn test_full_reload_rebuilds_the_host_tree() {
        let fx = Fixture::new();
        let (_, _, _, _) = math_project(&fx);
        let boot_file = fx.write("src/bootstrap.ts", "// suite:Boot\n// spec:boots");
        let mut session = fx.session(r#"{"debounceMs": 0, "critical": ["src/bootstrap.ts"]}"#);
        let mut host = agent();
        boot(&session, &mut host).await;

        session.handle_event(WatchEvent::Change(boot_file));
        session.scheduler().idle().await;
        let sent = drain(session.bridge());
        let applied = host.apply(&sent[0]);
        assert!(matches!(applied.outcome, ApplyOutcome::Reloaded { .. }));
        assert!(applied.rerun.contains(&"stays".to_string()));
        assert!(applied.rerun.contains(&"boots".to_string()));
    }
}

mod removals {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_removed_spec_is_detached_in_host() {
        let fx = Fixture::new();
        let (_, _, _, spec) = math_project(&fx);
        let mut session = fx.session(FAST);
        let mut host = agent();
        boot(&session, &mut host).await;

        fs::remove_file(&spec).unwrap();
        session.handle_event(WatchEvent::Unlink(spec.clone()));
        let sent = drain(session.bridge());
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, UpdateKind::TestUpdate);
        assert_eq!(sent[0].content, None);

        let applied = host.apply(&sent[0]);
        assert_eq!(applied.outcome, ApplyOutcome::Removed { files: 1, detached: 3 });
        assert_eq!(count_tagged(&host.host().root, &sent[0].path), 0);
    }

    #[tokio::test]
    async fn test_critical_removal_reloads_host_without_the_deleted_module() {
        let fx = Fixture::new();
        math_project(&fx);
        let boot_file = fx.write("src/bootstrap.ts", "// suite:Boot\n// spec:boots");
        let mut session = fx.session(r#"{"debounceMs": 0, "critical": ["src/bootstrap.ts"]}"#);
        let mut host = agent();
        boot(&session, &mut host).await;
        let project = session.project().clone();
        let boot_out = out(&project, &boot_file);
        assert_eq!(count_tagged(&host.host().root, &boot_out), 2);

        fs::remove_file(&boot_file).unwrap();
        session.handle_event(WatchEvent::Unlink(boot_file.clone()));
        let sent = drain(session.bridge());
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, UpdateKind::FullReload);
        assert_eq!(sent[0].content, None);

        let applied = host.apply(&sent[0]);
        assert!(matches!(applied.outcome, ApplyOutcome::Reloaded { .. }));
        assert_eq!(count_tagged(&host.host().root, &boot_out), 0);
        assert!(!applied.rerun.contains(&"boots".to_string()));
        assert!(applied.rerun.contains(&"stays".to_string()));
        assert_eq!(count_tagged(&host.host().root, &out(&project, &fx.path("spec/a.spec.ts"))), 3);
    }

    #[tokio::test]
    async fn test_removed_source_queues_its_importers() {
        let fx = Fixture::new();
        let (a, b, c, _) = math_project(&fx);
        let mut session = fx.session(FAST);
        session.initial_build().await.unwrap();

        fs::remove_file(&c).unwrap();
        session.handle_event(WatchEvent::Unlink(c.clone()));
        let removal = drain(session.bridge());
        assert_eq!(removal.len(), 1);
        assert_eq!(removal[0].kind, UpdateKind::Update);

        session.scheduler().idle().await;
        let rebuilt: Vec<String> = drain(session.bridge()).into_iter().map(|m| m.path).collect();
        let project = session.project().clone();
        assert!(rebuilt.contains(&out(&project, &b)));
        assert!(rebuilt.contains(&out(&project, &a)));
        assert!(!session.all_files().contains(&c));
        assert!(session.graph().lock().is_symmetric());
        assert!(session.graph().lock().dependencies_of(&b).is_empty());
    }

    #[tokio::test]
    async fn test_delete_between_queue_and_drain_is_skipped() {
        let fx = Fixture::new();
        let (_, _, c, _) = math_project(&fx);
        let session = fx.session(r#"{"debounceMs": 30}"#);

        let ticket = session.scheduler().enqueue(c.clone(), jasmine_hmr::ChangeKind::Modified);
        fs::remove_file(&c).unwrap();
        session.scheduler().wait_settled(ticket).await.unwrap();

        assert!(drain(session.bridge()).is_empty());
        assert_eq!(session.scheduler().status().builds, 0);
    }
}

mod reporting {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_host_events_reach_the_reporter_in_order() {
        let fx = Fixture::new();
        let session = fx.session(FAST);
        let console = Arc::new(Mutex::new(ConsoleReporter::new(false)));
        reporter::attach(session.bridge(), console.clone());

        let frames = [
            r#"{"type":"started","result":{"totalSpecsDefined":2}}"#,
            r#"{"type":"specDone","result":{"id":"spec0","fullName":"A computes a","status":"passed"}}"#,
            r#"{"type":"specDone","result":{"id":"spec1","fullName":"A is positive","status":"failed","failedExpectations":[{"message":"Expected -1 to be positive."}]}}"#,
            r#"{"type":"done","result":{"overallStatus":"failed"}}"#,
            r#"{"type":"hmr:error","error":"ReferenceError: a is not defined"}"#,
        ];
        for frame in frames {
            session.bridge().deliver(frame).unwrap();
        }

        let console = console.lock();
        let run = &console.runs()[0];
        assert_eq!((run.total, run.passed, run.failed), (2, 1, 1));
        assert_eq!(run.failures[0].0, "A is positive");
        assert_eq!(console.hmr_errors.len(), 1);
    }
}
