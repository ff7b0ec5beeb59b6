use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ts_process::config::Settings;
use ts_process::incident::{Incident, IncidentType, InMemorySignalProvider};
use ts_process::processing::kernels::{DefaultKernels, ResponseSpectrum, SignalKernels, Spectrum};
use ts_process::processing::labels::{LabelType, ProcessingLabel};
use ts_process::signal::{Component, MotionKind, Orientation, RawSignal};
use ts_process::station::Station;
use ts_process::{fingerprint, AppResult, Project, TsError};

/// Delegates to the default kernels and counts pipeline steps.
#[derive(Default)]
struct CountingKernels {
    applied: AtomicUsize,
    delay: Option<Duration>,
}

impl CountingKernels {
    fn slow(delay: Duration) -> Self {
        Self {
            applied: AtomicUsize::new(0),
            delay: Some(delay),
        }
    }

    fn count(&self) -> usize {
        self.applied.load(Ordering::SeqCst)
    }
}

impl SignalKernels for CountingKernels {
    fn apply(&self, label: &ProcessingLabel, signal: RawSignal) -> AppResult<RawSignal> {
        self.applied.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        DefaultKernels.apply(label, signal)
    }

    fn frequency_spectrum(&self, samples: &[f64], dt: f64) -> Spectrum {
        DefaultKernels.frequency_spectrum(samples, dt)
    }

    fn response_spectrum(&self, acceleration: &[f64], dt: f64) -> ResponseSpectrum {
        DefaultKernels.response_spectrum(acceleration, dt)
    }
}

fn recording(seed: f64) -> RawSignal {
    let samples: Vec<f64> = (0..1024)
        .map(|i| {
            let t = i as f64 * 0.01;
            (2.0 * std::f64::consts::PI * 1.5 * t).sin() + 0.3 * (seed * t).cos()
        })
        .collect();
    RawSignal {
        dt: 0.01,
        kind: MotionKind::Acceleration,
        h1: Component::new(Orientation::Azimuth(0.0), samples.clone()),
        h2: Component::new(Orientation::Azimuth(90.0), samples.iter().map(|v| -v).collect()),
        ver: Component::new(Orientation::Up, samples),
    }
}

fn incident(name: &str, seed: f64) -> Incident {
    let provider = InMemorySignalProvider::new().with_signal("S1", recording(seed));
    Incident::new(name, IncidentType::Hercules, Arc::new(provider))
}

fn open(dir: &tempfile::TempDir, kernels: Arc<CountingKernels>, buffer: usize) -> Project {
    let mut settings = Settings::for_project("scenario", dir.path());
    settings.tracker.buffer_capacity = buffer;
    let mut project = Project::open_with_kernels(settings, kernels).unwrap();
    project.add_station(Station::new("S1", 33.93, -117.95, 0.0).unwrap());
    project
        .add_processing_label(
            "bp40",
            LabelType::BandpassFilter,
            [("fcs", 0.1), ("fce", 40.0), ("N", 4.0)],
        )
        .unwrap();
    project
        .add_processing_label(
            "bp25",
            LabelType::BandpassFilter,
            [("fcs", 0.1), ("fce", 25.0), ("N", 4.0)],
        )
        .unwrap();
    project
}

fn station(project: &Project) -> Station {
    project.stations()[0].clone()
}

#[test]
fn test_end_to_end_hit_miss_and_purge() {
    let dir = tempfile::tempdir().unwrap();
    let kernels = Arc::new(CountingKernels::default());
    let mut project = open(&dir, Arc::clone(&kernels), 3);
    project.add_incident(incident("I1", 3.0)).unwrap();
    project.add_incident(incident("I2", 7.0)).unwrap();
    let s1 = station(&project);

    // I2's unrelated record, registered first
    let i2 = project.incident("I2").unwrap().clone();
    let i2_record = project.resolver().get_record(&s1, &i2, &["bp40"]).unwrap().unwrap();
    let fp_i2 = project.resolver().fingerprint_for(&s1, &i2, &["bp40"]).unwrap();
    assert_eq!(kernels.count(), 1);

    // miss, compute, store
    let i1 = project.incident("I1").unwrap().clone();
    let first = project.resolver().get_record(&s1, &i1, &["bp40"]).unwrap().unwrap();
    assert_eq!(kernels.count(), 2);

    // hit, zero recomputation, byte-equal
    let again = project.resolver().get_record(&s1, &i1, &["bp40"]).unwrap().unwrap();
    assert_eq!(kernels.count(), 2);
    assert_eq!(first.to_bytes().unwrap(), again.to_bytes().unwrap());

    // different cutoff: distinct fingerprint and value
    let narrow = project.resolver().get_record(&s1, &i1, &["bp25"]).unwrap().unwrap();
    assert_eq!(kernels.count(), 3);
    assert_ne!(narrow.velocity.h1.values, first.velocity.h1.values);

    let fp_40 = project.resolver().fingerprint_for(&s1, &i1, &["bp40"]).unwrap();
    let fp_25 = project.resolver().fingerprint_for(&s1, &i1, &["bp25"]).unwrap();
    assert_ne!(fp_40, fp_25);
    assert_eq!(project.store().len().unwrap(), 3);

    assert_eq!(project.remove_incident("I1").unwrap(), 2);
    assert!(project.store().get(&fp_40).unwrap().is_none());
    assert!(project.store().get(&fp_25).unwrap().is_none());
    assert!(!project.list_of_incidents().contains(&"I1"));

    let kept = project.store().get(&fp_i2).unwrap().unwrap();
    assert_eq!(*kept, i2_record.to_bytes().unwrap());
    project.resolver().get_record(&s1, &i2, &["bp40"]).unwrap();
    assert_eq!(kernels.count(), 3);

    project.close().unwrap();
}

#[test]
fn test_pipeline_order_is_part_of_identity() {
    let dir = tempfile::tempdir().unwrap();
    let kernels = Arc::new(CountingKernels::default());
    let mut project = open(&dir, Arc::clone(&kernels), 3);
    project
        .add_processing_label("x2", LabelType::Scale, [("factor", 2.0)])
        .unwrap();
    project.add_incident(incident("I1", 3.0)).unwrap();
    let s1 = station(&project);
    let i1 = project.incident("I1").unwrap().clone();

    let a = project.resolver().fingerprint_for(&s1, &i1, &["bp40", "x2"]).unwrap();
    let b = project.resolver().fingerprint_for(&s1, &i1, &["x2", "bp40"]).unwrap();
    assert_ne!(a, b);

    project.resolver().get_record(&s1, &i1, &["bp40", "x2"]).unwrap();
    project.resolver().get_record(&s1, &i1, &["x2", "bp40"]).unwrap();
    assert_eq!(kernels.count(), 4);
    assert_eq!(project.store().len().unwrap(), 2);
}

#[test]
fn test_redefinition_never_overwrites() {
    let dir = tempfile::tempdir().unwrap();
    let kernels = Arc::new(CountingKernels::default());
    let mut project = open(&dir, Arc::clone(&kernels), 3);
    project.add_incident(incident("I1", 3.0)).unwrap();
    let s1 = station(&project);
    let i1 = project.incident("I1").unwrap().clone();

    project.resolver().get_record(&s1, &i1, &["bp40"]).unwrap();
    let old_fp = project.resolver().fingerprint_for(&s1, &i1, &["bp40"]).unwrap();
    let old_bytes = project.store().get(&old_fp).unwrap().unwrap();

    project
        .add_processing_label(
            "bp40",
            LabelType::BandpassFilter,
            [("fcs", 0.2), ("fce", 40.0), ("N", 4.0)],
        )
        .unwrap();
    project.resolver().get_record(&s1, &i1, &["bp40"]).unwrap();
    let new_fp = project.resolver().fingerprint_for(&s1, &i1, &["bp40"]).unwrap();

    assert_ne!(old_fp, new_fp);
    assert_eq!(project.store().get(&old_fp).unwrap().unwrap(), old_bytes);
    assert_eq!(project.store().len().unwrap(), 2);
}

#[test]
fn test_buffer_eviction_flushes_oldest_incident() {
    let dir = tempfile::tempdir().unwrap();
    let kernels = Arc::new(CountingKernels::default());
    let mut project = open(&dir, kernels, 2);
    for (name, seed) in [("I1", 1.0), ("I2", 2.0), ("I3", 3.0)] {
        project.add_incident(incident(name, seed)).unwrap();
    }
    let s1 = station(&project);
    let tracker_name = project.settings().tracker_name();

    for name in ["I1", "I2"] {
        let inc = project.incident(name).unwrap().clone();
        project.resolver().get_record(&s1, &inc, &["bp40"]).unwrap();
    }
    let durable = project.store().get_nested_container(&tracker_name).unwrap();
    assert!(durable.values().all(|set| set.is_empty()));

    let i3 = project.incident("I3").unwrap().clone();
    project.resolver().get_record(&s1, &i3, &["bp40"]).unwrap();
    let durable = project.store().get_nested_container(&tracker_name).unwrap();
    assert_eq!(durable["I1"].len(), 1);
    assert!(durable["I2"].is_empty());
    assert_eq!(project.tracker().buffered_incidents().unwrap(), vec!["I2", "I3"]);

    assert_eq!(project.tracker().flush().unwrap(), 2);
    assert_eq!(project.tracker().flush().unwrap(), 0);
}

#[test]
fn test_reopened_project_hits_without_recomputation() {
    let dir = tempfile::tempdir().unwrap();
    let fp = {
        let kernels = Arc::new(CountingKernels::default());
        let mut project = open(&dir, kernels, 3);
        project.add_incident(incident("I1", 3.0)).unwrap();
        let s1 = station(&project);
        let i1 = project.incident("I1").unwrap().clone();
        project.resolver().get_record(&s1, &i1, &["bp40"]).unwrap();
        let fp = project.resolver().fingerprint_for(&s1, &i1, &["bp40"]).unwrap();
        // no explicit close: drop flushes the index
        fp
    };

    let kernels = Arc::new(CountingKernels::default());
    let mut project = open(&dir, Arc::clone(&kernels), 3);
    assert!(project.tracker().is_tracking("I1"));
    assert!(project.tracker().tracked_fingerprints("I1").unwrap().contains(&fp));

    project.add_incident(incident("I1", 3.0)).unwrap();
    let s1 = station(&project);
    let i1 = project.incident("I1").unwrap().clone();
    assert!(project.resolver().get_record(&s1, &i1, &["bp40"]).unwrap().is_some());
    assert_eq!(kernels.count(), 0);
}

#[test]
fn test_purge_incident_known_only_from_index() {
    let dir = tempfile::tempdir().unwrap();
    {
        let mut project = open(&dir, Arc::new(CountingKernels::default()), 3);
        project.add_incident(incident("I1", 3.0)).unwrap();
        let s1 = station(&project);
        let i1 = project.incident("I1").unwrap().clone();
        project.resolver().get_record(&s1, &i1, &["bp40"]).unwrap();
        project.close().unwrap();
    }

    let mut project = open(&dir, Arc::new(CountingKernels::default()), 3);
    assert!(project.list_of_incidents().is_empty());
    assert_eq!(project.remove_incident("I1").unwrap(), 1);
    assert!(project.store().is_empty().unwrap());
    assert!(!project.tracker().is_tracking("I1"));
    assert!(matches!(
        project.remove_incident("I1"),
        Err(TsError::UnknownIncident(_))
    ));
}

#[test]
fn test_concurrent_requests_compute_once() {
    let dir = tempfile::tempdir().unwrap();
    let kernels = Arc::new(CountingKernels::slow(Duration::from_millis(50)));
    let mut project = open(&dir, Arc::clone(&kernels), 3);
    project.add_incident(incident("I1", 3.0)).unwrap();
    let s1 = station(&project);
    let i1 = project.incident("I1").unwrap().clone();

    let records: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| scope.spawn(|| project.resolver().get_record(&s1, &i1, &["bp40"])))
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap().unwrap().unwrap())
            .collect()
    });

    assert_eq!(kernels.count(), 1);
    assert!(records.windows(2).all(|w| w[0] == w[1]));
    let stats = project.resolver().stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 7);
}

#[test]
fn test_closed_store_aborts_batch() {
    let dir = tempfile::tempdir().unwrap();
    let mut project = open(&dir, Arc::new(CountingKernels::default()), 3);
    project.add_incident(incident("I1", 3.0)).unwrap();
    let s1 = station(&project);
    let i1 = project.incident("I1").unwrap().clone();

    project.close().unwrap();
    assert!(!project.store().is_connected());

    let err = project.resolver().get_record(&s1, &i1, &["bp40"]).unwrap_err();
    assert!(matches!(err, TsError::StoreUnavailable(_)));
    assert!(err.is_batch_fatal());

    let err = project
        .extract_records(&["I1"], &[vec!["bp40"]], &[])
        .unwrap_err();
    assert!(err.is_batch_fatal());
}

#[test]
fn test_fingerprint_is_stable_across_sessions() {
    let labels = vec![ProcessingLabel::new(
        "bp40",
        LabelType::BandpassFilter,
        [("fcs", 0.1), ("fce", 40.0), ("N", 4.0)],
    )
    .unwrap()];
    let dir = tempfile::tempdir().unwrap();
    let project = open(&dir, Arc::new(CountingKernels::default()), 3);
    let s1 = station(&project);
    let inc = incident("I1", 3.0);

    assert_eq!(
        project.resolver().fingerprint_for(&s1, &inc, &["bp40"]).unwrap(),
        fingerprint("S1", "I1", &labels)
    );
}
