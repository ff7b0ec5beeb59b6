use std::sync::Arc;

use tracing_test::traced_test;
use ts_process::config::Settings;
use ts_process::incident::{Incident, IncidentType, InMemorySignalProvider};
use ts_process::processing::labels::LabelType;
use ts_process::{fingerprint, Project};

fn project(dir: &tempfile::TempDir) -> Project {
    Project::open(Settings::for_project("logged", dir.path())).unwrap()
}

fn empty_incident(name: &str) -> Incident {
    Incident::new(name, IncidentType::Rwg, Arc::new(InMemorySignalProvider::new()))
}

#[test]
#[traced_test]
fn test_dangling_index_entry_is_logged_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let mut project = project(&dir);
    project.add_incident(empty_incident("I1")).unwrap();

    // attributed to I1 but never stored
    project
        .tracker()
        .register("I1", fingerprint("S1", "I1", &[]))
        .unwrap();
    project.tracker().flush().unwrap();

    assert_eq!(project.remove_incident("I1").unwrap(), 0);
    assert!(logs_contain("references missing cache entry"));
    assert!(!project.tracker().is_tracking("I1"));
}

#[test]
#[traced_test]
fn test_repeated_tracking_warns() {
    let dir = tempfile::tempdir().unwrap();
    let project = project(&dir);
    assert!(project.tracker().start_tracking("I1").unwrap());
    assert!(!project.tracker().start_tracking("I1").unwrap());
    assert!(logs_contain("already being tracked"));
}

#[test]
#[traced_test]
fn test_label_redefinition_warns() {
    let dir = tempfile::tempdir().unwrap();
    let project = project(&dir);
    project
        .add_processing_label("lp", LabelType::LowpassFilter, [("fc", 5.0), ("N", 4.0)])
        .unwrap();
    project
        .add_processing_label("lp", LabelType::LowpassFilter, [("fc", 2.0), ("N", 4.0)])
        .unwrap();
    assert!(logs_contain("Processing label redefined"));
    assert_eq!(project.list_of_processing_labels().len(), 1);
}

#[test]
#[traced_test]
fn test_close_is_logged_after_flush() {
    let dir = tempfile::tempdir().unwrap();
    let mut project = project(&dir);
    project.add_incident(empty_incident("I1")).unwrap();
    project
        .tracker()
        .register("I1", fingerprint("S1", "I1", &[]))
        .unwrap();

    project.close().unwrap();
    assert!(logs_contain("Flushed incident index"));
    assert!(logs_contain("Closed result store"));
}

#[test]
#[traced_test]
fn test_purge_drops_index_entry_before_compaction() {
    let dir = tempfile::tempdir().unwrap();
    let mut project = project(&dir);
    project.add_incident(empty_incident("I1")).unwrap();
    let key = fingerprint("S1", "I1", &[]);
    project.store().put(&key, vec![1, 2, 3]).unwrap();
    project.tracker().register("I1", key).unwrap();
    project.tracker().flush().unwrap();

    assert_eq!(project.remove_incident("I1").unwrap(), 1);
    assert!(project.store().incident_names(project.tracker().name()).unwrap().is_empty());
    logs_assert(|lines: &[&str]| {
        let index = lines
            .iter()
            .position(|line| line.contains("Removed incident from index"))
            .ok_or("index removal not logged")?;
        let compaction = lines
            .iter()
            .position(|line| line.contains("Reclaimed free pages"))
            .ok_or("compaction not logged")?;
        if index < compaction {
            Ok(())
        } else {
            Err(format!("compaction at line {} ran before index removal at line {}", compaction, index))
        }
    });
}
