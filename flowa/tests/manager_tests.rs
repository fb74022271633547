//! Integration tests for the per-station Manager
//!
//! Each test builds a temporary standalone workdir and drives one station
//! through the workflow with mocked collaborators.

mod helpers;

use std::sync::Arc;

use flowa::archive::Archive;
use flowa::files::adjoint::read_two_column;
use flowa::models::Stage;
use flowa::{FlowError, Manager, ManagerError, ResetMode};
use flowa_common::StationCode;

use helpers::{files_with_extension, services, Fixture, MockMisfit, MockPicker, SYNTHETIC_NPTS};

fn bfz() -> StationCode {
    "NZ.BFZ.*.HH?".parse().unwrap()
}

#[tokio::test]
async fn test_flow_reaches_quantified_without_archive() {
    let fixture = Fixture::new(&[("2018p130600", &["BFZ"])]);
    let mut manager = Manager::new(
        Arc::new(fixture.config.clone()),
        services(MockPicker::on(&["N", "E", "Z"]), MockMisfit::new(0.5)),
        fixture.gather_sources("2018p130600", None),
    );

    manager.gather(&bfz(), false).await.unwrap();
    assert_eq!(manager.station().stage(), Stage::Gathered);
    assert_eq!(manager.stream().len(), 6);

    manager.flow(false).await.unwrap();
    let station = manager.station();
    // Nothing to persist into, so the crate stays quantified
    assert_eq!(station.stage(), Stage::Quantified);
    assert_eq!(station.number_windows(), 3);
    assert_eq!(station.misfit(), Some(1.5));
    assert!((station.time_offset().unwrap() + 20.0).abs() < 1e-6);

    let text = manager.to_string();
    assert!(text.starts_with("Manager [QUANTIFIED]"), "{}", text);
    assert!(text.contains("half duration:      0.6"));
}

#[tokio::test]
async fn test_soft_reset_keeps_event_hard_reset_resolves_again() {
    let fixture = Fixture::new(&[("2018p130600", &["BFZ"])]);
    let mut manager = Manager::new(
        Arc::new(fixture.config.clone()),
        services(MockPicker::on(&["Z"]), MockMisfit::new(1.0)),
        fixture.gather_sources("2018p130600", None),
    );
    manager.gather(&bfz(), false).await.unwrap();

    // The event file is gone, but the gatherer still has the event
    std::fs::remove_file(fixture.event_file("2018p130600")).unwrap();
    manager.reset(ResetMode::Soft);
    assert_eq!(manager.station().stage(), Stage::Empty);
    assert!(manager.gatherer().and_then(|g| g.cached_event()).is_some());
    manager.gather(&bfz(), false).await.unwrap();

    manager.reset(ResetMode::Hard);
    assert!(manager.gatherer().is_none());
    let err = manager.gather(&bfz(), false).await.unwrap_err();
    assert!(matches!(err, ManagerError::Gather(_)), "{}", err);
    assert_eq!(manager.station().stage(), Stage::Gathering);
}

#[tokio::test]
async fn test_gather_is_idempotent_unless_overwritten() {
    let fixture = Fixture::new(&[("2018p130600", &["BFZ"])]);
    let mut manager = Manager::new(
        Arc::new(fixture.config.clone()),
        services(MockPicker::on(&["Z"]), MockMisfit::new(1.0)),
        fixture.gather_sources("2018p130600", None),
    );
    manager.gather(&bfz(), false).await.unwrap();
    let before = manager.stream();

    std::fs::remove_dir_all(fixture.workdir().join("input/synthetics")).unwrap();
    manager.gather(&bfz(), false).await.unwrap();
    assert_eq!(manager.stream(), before);

    let err = manager.gather(&bfz(), true).await.unwrap_err();
    assert!(err.to_string().contains("No synthetic waveforms"), "{}", err);
}

#[tokio::test]
async fn test_unknown_station_keeps_partial_inputs() {
    let fixture = Fixture::new(&[("2018p130600", &["BFZ"])]);
    let mut manager = Manager::new(
        Arc::new(fixture.config.clone()),
        services(MockPicker::on(&["Z"]), MockMisfit::new(1.0)),
        fixture.gather_sources("2018p130600", None),
    );
    let code: StationCode = "NZ.KNZ.*.HH?".parse().unwrap();

    assert!(manager.gather(&code, false).await.is_err());
    let station = manager.station();
    assert_eq!(station.stage(), Stage::Gathering);
    assert!(station.event().is_some());
    assert!(station.inventory().is_some());
    assert!(station.synthetic().is_none());

    // Preprocessing a partial crate is refused
    let err = manager.preprocess().await.unwrap_err();
    assert!(matches!(err, FlowError::Manager(ManagerError::InvalidState(_))));
}

#[tokio::test]
async fn test_blank_adjoint_sources_for_unwindowed_components() {
    let fixture = Fixture::new(&[("2018p130600", &["BFZ"])]);
    let mut manager = Manager::new(
        Arc::new(fixture.config.clone()),
        services(MockPicker::on(&["Z"]), MockMisfit::new(2.0)),
        fixture.gather_sources("2018p130600", None),
    );
    manager.gather(&bfz(), false).await.unwrap();
    manager.flow(false).await.unwrap();
    assert_eq!(manager.station().number_windows(), 1);

    let adj_dir = fixture.adj_dir("2018p130600");
    let written = manager.write_adjsrcs(&adj_dir, true).unwrap();
    assert_eq!(written.len(), 3);

    let files = files_with_extension(&adj_dir, "adj");
    let names: Vec<String> = files
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["NZ.BFZ.BXE.adj", "NZ.BFZ.BXN.adj", "NZ.BFZ.BXZ.adj"]);

    let (z_times, z_data) = read_two_column(&adj_dir.join("NZ.BFZ.BXZ.adj")).unwrap();
    assert_eq!(z_data.len(), SYNTHETIC_NPTS);
    assert!((z_times[0] + 20.0).abs() < 1e-6);
    assert!(z_data.iter().any(|v| *v != 0.0));

    for blank in ["NZ.BFZ.BXN.adj", "NZ.BFZ.BXE.adj"] {
        let (times, data) = read_two_column(&adj_dir.join(blank)).unwrap();
        assert_eq!(times, z_times);
        assert!(data.iter().all(|v| *v == 0.0));
    }

    // Without blanks only the measured component is written
    let other = fixture.workdir().join("adj_only");
    assert_eq!(manager.write_adjsrcs(&other, false).unwrap().len(), 1);
}

#[tokio::test]
async fn test_preprocessed_synthetics_in_solver_format() {
    let fixture = Fixture::new(&[("2018p130600", &["BFZ"])]);
    let mut manager = Manager::new(
        Arc::new(fixture.config.clone()),
        services(MockPicker::on(&["Z"]), MockMisfit::new(1.0)),
        fixture.gather_sources("2018p130600", None),
    );
    manager.gather(&bfz(), false).await.unwrap();
    let out = fixture.workdir().join("sem_out");
    // Origin offset unknown until preprocessing
    assert!(manager.write_synthetics(&out, 'd').unwrap().is_empty());

    manager.preprocess().await.unwrap();
    let written = manager.write_synthetics(&out, 'd').unwrap();
    assert_eq!(written.len(), 3);
    assert_eq!(files_with_extension(&out, "semd").len(), 3);

    let (times, data) = read_two_column(&out.join("NZ.BFZ.BXZ.semd")).unwrap();
    assert_eq!(data.len(), SYNTHETIC_NPTS);
    assert!((times[0] + 20.0).abs() < 1e-6);
}

#[tokio::test]
async fn test_zero_windows_skips_measurement() {
    let fixture = Fixture::new(&[("2018p130600", &["BFZ"])]);
    let mut manager = Manager::new(
        Arc::new(fixture.config.clone()),
        services(MockPicker::on(&[]), MockMisfit::new(1.0)),
        fixture.gather_sources("2018p130600", None),
    );
    manager.gather(&bfz(), false).await.unwrap();

    let err = manager.flow(false).await.unwrap_err();
    assert!(
        matches!(&err, FlowError::Manager(ManagerError::NoWindows(code)) if code.contains("BFZ")),
        "{}",
        err
    );
    // The window stage completed; measurement never ran
    assert_eq!(manager.station().stage(), Stage::Windowed);
    assert_eq!(manager.station().number_windows(), 0);
    assert!(manager.station().misfit().is_none());
    assert!(manager
        .write_adjsrcs(&fixture.adj_dir("2018p130600"), true)
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_fixed_windows_reused_from_previous_step() {
    let fixture = Fixture::new(&[("2018p130600", &["BFZ"])]);
    let archive = Arc::new(
        Archive::open(&fixture.workdir().join("datasets/2018p130600.db"))
            .await
            .unwrap(),
    );

    let mut first = Manager::new(
        Arc::new(fixture.config.clone()),
        services(MockPicker::on(&["N", "Z"]), MockMisfit::new(1.0)),
        fixture.gather_sources("2018p130600", Some(Arc::clone(&archive))),
    );
    first.gather(&bfz(), false).await.unwrap();
    first.flow(false).await.unwrap();
    assert_eq!(first.station().stage(), Stage::Persisted);
    let first_windows = first.station().windows().unwrap().clone();
    drop(first);

    // Line-search step: the picker would find nothing, fixed windows are reused
    let mut config = fixture.config.clone();
    config.workflow.step_count = 1;
    let mut sources = fixture.gather_sources("2018p130600", Some(Arc::clone(&archive)));
    sources.step = config.step_tag();
    let mut second = Manager::new(
        Arc::new(config),
        services(MockPicker::on(&[]), MockMisfit::new(1.0)),
        sources,
    );
    second.gather(&bfz(), false).await.unwrap();
    second.preprocess().await.unwrap();
    second.window(true).await.unwrap();

    // Same component keys as the fresh pick it replays, E included
    let windows = second.station().windows().unwrap();
    assert!(windows.keys().eq(first_windows.keys()));
    assert_eq!(windows.len(), 3);
    assert!(windows["E"].is_empty());
    assert_eq!(windows["Z"][0].left, 10);
    assert_eq!(windows["Z"][0].right, 100);
    assert!(second.station().windowed().unwrap().fixed);

    second.measure().await.unwrap();
    assert_eq!(second.station().misfit(), Some(2.0));
}

#[tokio::test]
async fn test_fixed_windows_fall_back_to_picking() {
    let fixture = Fixture::new(&[("2018p130600", &["BFZ"])]);
    let archive = Arc::new(
        Archive::open(&fixture.workdir().join("datasets/2018p130600.db"))
            .await
            .unwrap(),
    );
    let mut manager = Manager::new(
        Arc::new(fixture.config.clone()),
        services(MockPicker::on(&["Z"]), MockMisfit::new(1.0)),
        fixture.gather_sources("2018p130600", Some(archive)),
    );
    manager.gather(&bfz(), false).await.unwrap();
    manager.preprocess().await.unwrap();
    manager.window(true).await.unwrap();

    let windowed = manager.station().windowed().unwrap();
    assert!(!windowed.fixed);
    assert_eq!(manager.station().number_windows(), 1);
}
