//! Resistance monitor against the simulated bench.

use std::sync::Arc;
use std::time::Duration;

use cryo_daq::error::DaqError;
use cryo_daq::instrument::{DriverReport, InstrumentModel, InstrumentRole, SimulatedBench};
use cryo_daq::safety::SafetyLimits;
use cryo_daq::station::Station;
use cryo_daq::sweep::{run_monitor, EmergencyStop, MonitorConfig, SweepKind};

fn station(bench: &SimulatedBench, meter_fails_at: Option<usize>) -> Station {
    let mut station = Station::new(SafetyLimits::default()).unwrap();
    let source = bench.instrument("k6221", InstrumentRole::CurrentSource);
    station
        .register(
            "k6221",
            InstrumentRole::CurrentSource,
            InstrumentModel::Keithley6221,
            Arc::new(source),
            DriverReport::direct(
                "k6221",
                InstrumentRole::CurrentSource,
                InstrumentModel::Keithley6221,
                "simulated",
            ),
        )
        .unwrap();
    let mut meter = bench.instrument("k2182a", InstrumentRole::Voltmeter);
    if let Some(index) = meter_fails_at {
        meter = meter.fail_read_at(index);
    }
    station
        .register(
            "k2182a",
            InstrumentRole::Voltmeter,
            InstrumentModel::Keithley2182a,
            Arc::new(meter),
            DriverReport::direct(
                "k2182a",
                InstrumentRole::Voltmeter,
                InstrumentModel::Keithley2182a,
                "simulated",
            ),
        )
        .unwrap();
    station
}

#[tokio::test(start_paused = true)]
async fn test_monitor_stops_at_point_count() {
    let bench = SimulatedBench::new(250.0);
    let station = station(&bench, None);
    let config = MonitorConfig {
        excitation_current: 2e-6,
        interval: Duration::from_secs(5),
        max_points: Some(4),
        ..MonitorConfig::default()
    };

    let result = run_monitor(&station, &config, &EmergencyStop::new())
        .await
        .unwrap();

    assert_eq!(result.kind(), SweepKind::Monitor);
    assert!(!result.cancelled());
    let rows = result.rows();
    assert_eq!(rows.len(), 4);
    for (i, row) in rows.iter().enumerate() {
        assert!((row.setpoint - 5.0 * i as f64).abs() < 1e-3, "elapsed {}", row.setpoint);
        assert!((row.measured - 5e-4).abs() < 1e-15);
        assert!((row.derived.unwrap() - 250.0).abs() < 1e-9);
    }
    assert_eq!(bench.output(InstrumentRole::CurrentSource), Some(0.0));
}

#[tokio::test(start_paused = true)]
async fn test_monitor_stops_before_duration_is_exceeded() {
    let bench = SimulatedBench::default();
    let station = station(&bench, None);
    let config = MonitorConfig {
        interval: Duration::from_secs(10),
        duration: Some(Duration::from_secs(35)),
        ..MonitorConfig::default()
    };

    let result = run_monitor(&station, &config, &EmergencyStop::new())
        .await
        .unwrap();

    // Readings at 0, 10, 20 and 30 s; a fifth would land past 35 s.
    assert_eq!(result.len(), 4);
    assert!(!result.cancelled());
}

#[tokio::test(start_paused = true)]
async fn test_monitor_without_bounds_ends_on_stop() {
    let bench = SimulatedBench::default();
    let station = Arc::new(station(&bench, None));
    let stop = EmergencyStop::new();
    let config = MonitorConfig::default();

    let task = {
        let station = station.clone();
        let stop = stop.clone();
        tokio::spawn(async move { run_monitor(&station, &config, &stop).await })
    };
    tokio::time::sleep(Duration::from_millis(2500)).await;
    stop.raise();

    let result = task.await.unwrap().unwrap();
    assert!(result.cancelled());
    assert_eq!(result.len(), 3);
    assert_eq!(bench.output(InstrumentRole::CurrentSource), Some(0.0));
}

#[tokio::test]
async fn test_monitor_read_failure_keeps_rows_and_parks_source() {
    let bench = SimulatedBench::default();
    let station = station(&bench, Some(2));
    let config = MonitorConfig {
        interval: Duration::ZERO,
        ..MonitorConfig::default()
    };

    let err = run_monitor(&station, &config, &EmergencyStop::new())
        .await
        .unwrap_err();

    assert!(matches!(
        err.source,
        DaqError::InstrumentCommunication { .. }
    ));
    assert_eq!(err.partial.len(), 2);
    assert_eq!(bench.output(InstrumentRole::CurrentSource), Some(0.0));
}

#[tokio::test]
async fn test_monitor_excitation_over_limit_commands_nothing() {
    let bench = SimulatedBench::default();
    let station = station(&bench, None);
    let config = MonitorConfig {
        excitation_current: 1.0,
        max_points: Some(1),
        ..MonitorConfig::default()
    };

    let err = run_monitor(&station, &config, &EmergencyStop::new())
        .await
        .unwrap_err();

    assert!(err.source.is_preflight());
    assert!(err.partial.is_empty());
    assert_eq!(bench.output(InstrumentRole::CurrentSource), None);
}
