//! End-to-end sweep runner tests against the simulated bench.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cryo_daq::error::{AppResult, DaqError};
use cryo_daq::instrument::{
    DriverReport, InstrumentDriver, InstrumentModel, InstrumentRole, InstrumentSetting,
    InstrumentStatus, SettingKind, SimulatedBench,
};
use cryo_daq::safety::{SafetyBound, SafetyLimits};
use cryo_daq::station::Station;
use cryo_daq::sweep::{
    DifferentialConfig, EmergencyStop, HallConfig, IvSweepConfig, SweepParameters,
    TemperatureSweepConfig,
};

const ROLES: [(&str, InstrumentRole, InstrumentModel); 6] = [
    ("k6221", InstrumentRole::CurrentSource, InstrumentModel::Keithley6221),
    ("k2182a", InstrumentRole::Voltmeter, InstrumentModel::Keithley2182a),
    ("k2636b", InstrumentRole::BiasSource, InstrumentModel::Keithley2636b),
    ("mfli", InstrumentRole::LockIn, InstrumentModel::ZurichMfli),
    ("ami430_z", InstrumentRole::MagnetZ, InstrumentModel::Ami430),
    ("ls372", InstrumentRole::TemperatureController, InstrumentModel::Lakeshore372),
];

/// Station with every role simulated except those in `replaced`.
fn station_with(
    bench: &SimulatedBench,
    limits: SafetyLimits,
    replaced: Vec<(InstrumentRole, Arc<dyn InstrumentDriver>)>,
) -> Station {
    let mut station = Station::new(limits).unwrap();
    for (name, role, model) in ROLES {
        let driver: Arc<dyn InstrumentDriver> = match replaced.iter().find(|(r, _)| *r == role) {
            Some((_, custom)) => custom.clone(),
            None => Arc::new(bench.instrument(name, role)),
        };
        station
            .register(
                name,
                role,
                model,
                driver,
                DriverReport::direct(name, role, model, "simulated"),
            )
            .unwrap();
    }
    station
}

/// Station with every role simulated, the voltmeter replaced by `meter`.
fn station_with_meter(
    bench: &SimulatedBench,
    limits: SafetyLimits,
    meter: Option<Arc<dyn InstrumentDriver>>,
) -> Station {
    let replaced = meter
        .map(|m| vec![(InstrumentRole::Voltmeter, m)])
        .unwrap_or_default();
    station_with(bench, limits, replaced)
}

fn station(bench: &SimulatedBench) -> Station {
    station_with_meter(bench, SafetyLimits::default(), None)
}

/// Adds an x magnet axis on the same bench.
fn add_x_axis(station: &mut Station, bench: &SimulatedBench) {
    let role = InstrumentRole::MagnetX;
    let model = InstrumentModel::Ami430;
    station
        .register(
            "ami430_x",
            role,
            model,
            Arc::new(bench.instrument("ami430_x", role)),
            DriverReport::direct("ami430_x", role, model, "simulated"),
        )
        .unwrap();
}

fn iv(points: usize) -> SweepParameters {
    let mut config = IvSweepConfig::new(-1e-6, 1e-6, points);
    config.settle_delay = Duration::ZERO;
    config.build().unwrap().into()
}

/// Voltmeter that raises the emergency stop after its n-th reading.
struct StopAfter {
    inner: Arc<dyn InstrumentDriver>,
    reads: AtomicUsize,
    after: usize,
    stop: EmergencyStop,
}

#[async_trait]
impl InstrumentDriver for StopAfter {
    async fn set_output(&self, value: f64) -> AppResult<()> {
        self.inner.set_output(value).await
    }

    async fn read_measurement(&self) -> AppResult<f64> {
        let value = self.inner.read_measurement().await?;
        if self.reads.fetch_add(1, Ordering::SeqCst) + 1 == self.after {
            self.stop.raise();
        }
        Ok(value)
    }

    async fn get_status(&self) -> AppResult<InstrumentStatus> {
        self.inner.get_status().await
    }

    fn supports_setting(&self, kind: SettingKind) -> bool {
        self.inner.supports_setting(kind)
    }

    async fn configure(&self, setting: InstrumentSetting) -> AppResult<()> {
        self.inner.configure(setting).await
    }
}

/// Source that can set and read but has no way to apply settings.
struct OutputOnly {
    inner: Arc<dyn InstrumentDriver>,
}

#[async_trait]
impl InstrumentDriver for OutputOnly {
    async fn set_output(&self, value: f64) -> AppResult<()> {
        self.inner.set_output(value).await
    }

    async fn read_measurement(&self) -> AppResult<f64> {
        self.inner.read_measurement().await
    }

    async fn get_status(&self) -> AppResult<InstrumentStatus> {
        self.inner.get_status().await
    }
}

#[tokio::test]
async fn test_iv_sweep_measures_every_setpoint() {
    let bench = SimulatedBench::new(250.0);
    let station = station(&bench);
    let params = iv(11);

    let result = station
        .run_sweep(&params, &EmergencyStop::new())
        .await
        .unwrap();

    assert_eq!(result.len(), 11);
    assert!(!result.cancelled());
    assert_eq!(result.setpoints(), params.setpoints());
    for row in result.rows() {
        assert!((row.measured - row.setpoint * 250.0).abs() < 1e-15);
        if row.setpoint.abs() > 1e-9 {
            let resistance = row.derived.unwrap();
            assert!((resistance - 250.0).abs() < 1e-6, "row {}: {}", row.index, resistance);
        }
    }
    // Source parked after the sweep.
    assert_eq!(bench.output(InstrumentRole::CurrentSource), Some(0.0));
    assert_eq!(
        bench.setting(InstrumentRole::CurrentSource, SettingKind::ComplianceVoltage),
        Some(10.0)
    );
    assert_eq!(
        bench.setting(InstrumentRole::CurrentSource, SettingKind::CurrentRange),
        None
    );
}

#[tokio::test]
async fn test_iv_range_and_compliance_reach_source() {
    let bench = SimulatedBench::default();
    let station = station(&bench);
    let mut config = IvSweepConfig::new(-1e-6, 1e-6, 3);
    config.settle_delay = Duration::ZERO;
    config.compliance_voltage = 1.0;
    config.current_range = Some(2e-6);
    let params: SweepParameters = config.build().unwrap().into();

    station.run_sweep(&params, &EmergencyStop::new()).await.unwrap();
    assert_eq!(
        bench.setting(InstrumentRole::CurrentSource, SettingKind::ComplianceVoltage),
        Some(1.0)
    );
    assert_eq!(
        bench.setting(InstrumentRole::CurrentSource, SettingKind::CurrentRange),
        Some(2e-6)
    );
}

#[tokio::test]
async fn test_source_without_settings_is_refused() {
    let bench = SimulatedBench::default();
    let source: Arc<dyn InstrumentDriver> = Arc::new(OutputOnly {
        inner: Arc::new(bench.instrument("k6221", InstrumentRole::CurrentSource)),
    });
    let station = station_with(
        &bench,
        SafetyLimits::default(),
        vec![(InstrumentRole::CurrentSource, source)],
    );

    let err = station
        .run_sweep(&iv(5), &EmergencyStop::new())
        .await
        .unwrap_err();
    assert!(err.partial.is_empty());
    assert!(err.source.is_preflight());
    assert!(matches!(
        err.source,
        DaqError::SettingUnsupported(ref message) if message.contains("k6221")
    ));
    assert_eq!(bench.output(InstrumentRole::CurrentSource), None);
}

#[tokio::test]
async fn test_noisy_readings_are_averaged() {
    let bench = SimulatedBench::new(100.0).with_noise(1e-6);
    let station = station(&bench);
    let mut config = IvSweepConfig::new(1e-6, 5e-6, 5);
    config.settle_delay = Duration::ZERO;
    config.averages = 8;
    let params: SweepParameters = config.build().unwrap().into();

    let result = station.run_sweep(&params, &EmergencyStop::new()).await.unwrap();
    let mut exact = 0;
    for row in result.rows() {
        let ideal = row.setpoint * 100.0;
        assert!((row.measured - ideal).abs() <= 1e-6, "row {}", row.index);
        if row.measured == ideal {
            exact += 1;
        }
    }
    assert!(exact < result.len());
}

#[tokio::test]
async fn test_bidirectional_sweep_returns_to_start() {
    let bench = SimulatedBench::default();
    let station = station(&bench);
    let mut config = IvSweepConfig::new(0.0, 1e-6, 5);
    config.settle_delay = Duration::ZERO;
    config.bidirectional = true;
    let params: SweepParameters = config.build().unwrap().into();

    let result = station.run_sweep(&params, &EmergencyStop::new()).await.unwrap();
    assert_eq!(result.len(), 10);
    assert_eq!(result.rows()[4].setpoint, 1e-6);
    assert_eq!(result.rows()[9].setpoint, 0.0);
}

#[tokio::test]
async fn test_read_fault_returns_partial_result() {
    let n = 10;
    for k in [0, 1, 4, 9] {
        let bench = SimulatedBench::default();
        let meter: Arc<dyn InstrumentDriver> = Arc::new(
            bench
                .instrument("k2182a", InstrumentRole::Voltmeter)
                .fail_read_at(k),
        );
        let station = station_with_meter(&bench, SafetyLimits::default(), Some(meter));

        let err = station
            .run_sweep(&iv(n), &EmergencyStop::new())
            .await
            .unwrap_err();

        assert_eq!(err.partial.len(), k, "fault at index {}", k);
        assert!(!err.partial.cancelled());
        assert!(matches!(
            err.source,
            DaqError::InstrumentCommunication { ref instrument, .. } if instrument == "k2182a"
        ));
        // Parked even though the sweep failed.
        assert_eq!(bench.output(InstrumentRole::CurrentSource), Some(0.0));
    }
}

#[tokio::test]
async fn test_cancel_between_setpoints() {
    let n = 10;
    for k in [0, 3, 8] {
        let bench = SimulatedBench::default();
        let stop = EmergencyStop::new();
        let meter: Arc<dyn InstrumentDriver> = Arc::new(StopAfter {
            inner: Arc::new(bench.instrument("k2182a", InstrumentRole::Voltmeter)),
            reads: AtomicUsize::new(0),
            after: k + 1,
            stop: stop.clone(),
        });
        let station = station_with_meter(&bench, SafetyLimits::default(), Some(meter));

        let result = station.run_sweep(&iv(n), &stop).await.unwrap();

        assert_eq!(result.len(), k + 1, "cancel after setpoint {}", k);
        assert!(result.cancelled());
        assert!(result.finished_at().is_some());
    }
}

#[tokio::test]
async fn test_raised_stop_before_start_yields_no_rows() {
    let bench = SimulatedBench::default();
    let station = station(&bench);
    let stop = EmergencyStop::new();
    stop.raise();

    let result = station.run_sweep(&iv(5), &stop).await.unwrap();
    assert!(result.is_empty());
    assert!(result.cancelled());
}

#[tokio::test]
async fn test_limit_violation_commands_nothing() {
    let bench = SimulatedBench::default();
    let limits = SafetyLimits {
        max_field: 1.0,
        ..SafetyLimits::default()
    };
    let station = station_with_meter(&bench, limits, None);
    let params: SweepParameters = HallConfig::new(0.0, 2.0, 5).build().unwrap().into();

    let err = station
        .run_sweep(&params, &EmergencyStop::new())
        .await
        .unwrap_err();

    assert!(err.partial.is_empty());
    assert!(matches!(
        err.source,
        DaqError::LimitExceeded {
            bound: SafetyBound::MaxField,
            ..
        }
    ));
    assert_eq!(bench.output(InstrumentRole::MagnetZ), None);
    assert_eq!(bench.output(InstrumentRole::CurrentSource), None);
}

#[tokio::test]
async fn test_held_field_axis_counts_toward_total_field() {
    let bench = SimulatedBench::default();
    let mut station = station(&bench);
    add_x_axis(&mut station, &bench);
    bench
        .instrument("ami430_x", InstrumentRole::MagnetX)
        .set_output(8.0)
        .await
        .unwrap();

    // 5 T on z alone is legal, but with 8 T held on x the total is 9.43 T.
    let mut config = HallConfig::new(0.0, 5.0, 6);
    config.measurement_delay = Duration::ZERO;
    let params: SweepParameters = config.build().unwrap().into();
    let err = station
        .run_sweep(&params, &EmergencyStop::new())
        .await
        .unwrap_err();

    assert!(err.partial.is_empty());
    assert!(matches!(
        err.source,
        DaqError::LimitExceeded {
            bound: SafetyBound::MaxField,
            ..
        }
    ));
    assert_eq!(bench.output(InstrumentRole::MagnetZ), None);
    assert_eq!(bench.output(InstrumentRole::CurrentSource), None);
    // The held axis is only read.
    assert_eq!(bench.output(InstrumentRole::MagnetX), Some(8.0));
}

#[tokio::test(start_paused = true)]
async fn test_held_field_axis_within_limit_is_accepted() {
    let bench = SimulatedBench::default();
    let mut station = station(&bench);
    add_x_axis(&mut station, &bench);
    bench
        .instrument("ami430_x", InstrumentRole::MagnetX)
        .set_output(3.0)
        .await
        .unwrap();

    let mut config = HallConfig::new(0.0, 5.0, 3);
    config.measurement_delay = Duration::ZERO;
    let params: SweepParameters = config.build().unwrap().into();
    let result = station.run_sweep(&params, &EmergencyStop::new()).await.unwrap();

    assert_eq!(result.len(), 3);
    assert_eq!(bench.output(InstrumentRole::MagnetZ), Some(5.0));
    assert_eq!(bench.output(InstrumentRole::MagnetX), Some(3.0));
}

#[tokio::test]
async fn test_held_field_axis_is_leased_during_sweep() {
    let bench = SimulatedBench::default();
    let mut station = station(&bench);
    add_x_axis(&mut station, &bench);
    let _x = station.acquire(&[InstrumentRole::MagnetX]).unwrap();

    let params: SweepParameters = HallConfig::new(0.0, 1.0, 3).build().unwrap().into();
    let err = station
        .run_sweep(&params, &EmergencyStop::new())
        .await
        .unwrap_err();
    assert!(matches!(err.source, DaqError::InstrumentBusy(ref name) if name == "ami430_x"));
}

#[tokio::test]
async fn test_busy_instrument_is_refused() {
    let bench = SimulatedBench::default();
    let station = station(&bench);
    let _lease = station.acquire(&[InstrumentRole::Voltmeter]).unwrap();

    let err = station
        .run_sweep(&iv(5), &EmergencyStop::new())
        .await
        .unwrap_err();
    assert!(matches!(err.source, DaqError::InstrumentBusy(ref name) if name == "k2182a"));
    assert_eq!(bench.output(InstrumentRole::CurrentSource), None);
}

#[tokio::test]
async fn test_fault_status_aborts_before_commanding() {
    let bench = SimulatedBench::default();
    let meter = Arc::new(
        bench
            .instrument("k2182a", InstrumentRole::Voltmeter)
            .with_fault_status(),
    );
    let station = station_with_meter(&bench, SafetyLimits::default(), Some(meter));

    let err = station
        .run_sweep(&iv(5), &EmergencyStop::new())
        .await
        .unwrap_err();
    assert!(err.partial.is_empty());
    assert!(matches!(err.source, DaqError::InstrumentFault(ref name) if name == "k2182a"));
}

#[tokio::test(start_paused = true)]
async fn test_hall_sweep_derives_hall_resistance() {
    let bench = SimulatedBench::new(100.0).with_hall_coefficient(10.0);
    let station = station(&bench);
    let mut config = HallConfig::new(-1.0, 1.0, 3);
    config.measurement_delay = Duration::from_secs(1);
    config.averages = 2;
    let params: SweepParameters = config.build().unwrap().into();

    let started = tokio::time::Instant::now();
    let result = station.run_sweep(&params, &EmergencyStop::new()).await.unwrap();

    let derived: Vec<f64> = result.rows().iter().map(|r| r.derived.unwrap()).collect();
    for (value, expected) in derived.iter().zip([90.0, 100.0, 110.0]) {
        assert!((value - expected).abs() < 1e-9, "{} != {}", value, expected);
    }
    // 3 x 1 s settle plus 3 T of travel at 0.1 T/min.
    let elapsed = started.elapsed().as_secs_f64();
    assert!(elapsed >= 3.0 + 1800.0 - 1e-6, "elapsed {}", elapsed);

    // Excitation parked, magnet left at field.
    assert_eq!(bench.output(InstrumentRole::CurrentSource), Some(0.0));
    assert_eq!(bench.output(InstrumentRole::MagnetZ), Some(1.0));
    assert_eq!(
        bench.setting(InstrumentRole::MagnetZ, SettingKind::RampRate),
        Some(0.1)
    );
}

#[tokio::test]
async fn test_differential_sweep_uses_lockin() {
    let bench = SimulatedBench::default();
    let station = station(&bench);
    let mut config = DifferentialConfig::new(-0.01, 0.01, 5);
    config.settle_delay = Duration::ZERO;
    config.frequency = 17.77;
    config.time_constant = 0.001;
    config.current_compliance = 1e-4;
    config.averages = 1;
    let params: SweepParameters = config.build().unwrap().into();

    let result = station.run_sweep(&params, &EmergencyStop::new()).await.unwrap();
    assert_eq!(result.len(), 5);
    for row in result.rows() {
        assert!((row.derived.unwrap() - 2.0).abs() < 1e-12);
    }
    assert_eq!(bench.output(InstrumentRole::BiasSource), Some(0.0));
    assert_eq!(bench.output(InstrumentRole::LockIn), Some(0.0));
    assert_eq!(bench.setting(InstrumentRole::LockIn, SettingKind::Frequency), Some(17.77));
    assert_eq!(bench.setting(InstrumentRole::LockIn, SettingKind::TimeConstant), Some(0.001));
    assert_eq!(
        bench.setting(InstrumentRole::BiasSource, SettingKind::ComplianceCurrent),
        Some(1e-4)
    );
}

#[tokio::test(start_paused = true)]
async fn test_temperature_sweep_leaves_loop_at_last_setpoint() {
    let bench = SimulatedBench::new(42.0);
    let station = station(&bench);
    let mut config = TemperatureSweepConfig::new(1.0, 3.0, 3);
    config.settle_time = Duration::from_secs(10);
    config.averages = 1;
    let params: SweepParameters = config.build().unwrap().into();

    let result = station.run_sweep(&params, &EmergencyStop::new()).await.unwrap();
    assert_eq!(result.len(), 3);
    for row in result.rows() {
        assert!((row.derived.unwrap() - 42.0).abs() < 1e-9);
    }
    assert_eq!(bench.output(InstrumentRole::TemperatureController), Some(3.0));
    assert_eq!(
        bench.setting(InstrumentRole::TemperatureController, SettingKind::RampRate),
        Some(1.0)
    );
}

#[tokio::test]
async fn test_concurrent_sweeps_on_shared_instrument() {
    let bench = SimulatedBench::default();
    let station = Arc::new(station(&bench));
    let mut slow = IvSweepConfig::new(-1e-6, 1e-6, 5);
    slow.settle_delay = Duration::from_millis(50);
    let slow: SweepParameters = slow.build().unwrap().into();

    let first = {
        let station = station.clone();
        tokio::spawn(async move { station.run_sweep(&slow, &EmergencyStop::new()).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    let second = station.run_sweep(&iv(3), &EmergencyStop::new()).await;

    assert!(matches!(
        second.unwrap_err().source,
        DaqError::InstrumentBusy(_)
    ));
    assert_eq!(first.await.unwrap().unwrap().len(), 5);
}
