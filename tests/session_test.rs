//! Run plans executed end to end: persistence, safe state and series.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::tempdir;

use cryo_daq::config::{StorageConfig, StorageFormat};
use cryo_daq::error::{AppResult, DaqError};
use cryo_daq::instrument::{
    DriverReport, InstrumentDriver, InstrumentModel, InstrumentRole, InstrumentSetting,
    InstrumentStatus, SettingKind, SimulatedBench,
};
use cryo_daq::plan::RunPlan;
use cryo_daq::safety::SafetyLimits;
use cryo_daq::session::run_plan;
use cryo_daq::station::Station;
use cryo_daq::sweep::EmergencyStop;

const IV_PLAN: &str = r#"
    [experiment]
    name = "cooldown 4"
    sample = "S17-B"

    [[sweeps]]
    kind = "iv"
    start_current = -1e-6
    stop_current = 1e-6
    num_points = 5
    settle_delay = "0s"

    [[sweeps]]
    kind = "iv"
    start_current = 0.0
    stop_current = 1e-6
    num_points = 3
    settle_delay = "0s"
"#;

/// Magnet that cannot be commanded.
struct StuckMagnet;

#[async_trait]
impl InstrumentDriver for StuckMagnet {
    async fn set_output(&self, _value: f64) -> AppResult<()> {
        Err(DaqError::communication("ami430_z", "power supply not responding"))
    }

    async fn read_measurement(&self) -> AppResult<f64> {
        Ok(0.0)
    }

    async fn get_status(&self) -> AppResult<InstrumentStatus> {
        Ok(InstrumentStatus::Ok)
    }
}

/// Voltmeter that raises the stop after its n-th reading.
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

fn register(
    station: &mut Station,
    name: &str,
    role: InstrumentRole,
    model: InstrumentModel,
    driver: Arc<dyn InstrumentDriver>,
) {
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

/// Source, voltmeter and the three magnet axes on one bench.
fn vector_station(bench: &SimulatedBench) -> Station {
    let mut station = Station::new(SafetyLimits::default()).unwrap();
    for (name, role, model) in [
        ("k6221", InstrumentRole::CurrentSource, InstrumentModel::Keithley6221),
        ("k2182a", InstrumentRole::Voltmeter, InstrumentModel::Keithley2182a),
        ("ami430_x", InstrumentRole::MagnetX, InstrumentModel::Ami430),
        ("ami430_y", InstrumentRole::MagnetY, InstrumentModel::Ami430),
        ("ami430_z", InstrumentRole::MagnetZ, InstrumentModel::Ami430),
    ] {
        register(&mut station, name, role, model, Arc::new(bench.instrument(name, role)));
    }
    station
}

fn json_storage(dir: &std::path::Path) -> StorageConfig {
    StorageConfig {
        output_dir: dir.to_path_buf(),
        format: StorageFormat::Json,
    }
}

fn read_json(path: &std::path::Path) -> serde_json::Value {
    serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
}

#[tokio::test]
async fn test_cancelled_sweep_is_saved_when_safe_state_fails() {
    let dir = tempdir().unwrap();
    let bench = SimulatedBench::default();
    let stop = EmergencyStop::new();
    let mut station = Station::new(SafetyLimits::default()).unwrap();
    register(
        &mut station,
        "k6221",
        InstrumentRole::CurrentSource,
        InstrumentModel::Keithley6221,
        Arc::new(bench.instrument("k6221", InstrumentRole::CurrentSource)),
    );
    register(
        &mut station,
        "k2182a",
        InstrumentRole::Voltmeter,
        InstrumentModel::Keithley2182a,
        Arc::new(StopAfter {
            inner: Arc::new(bench.instrument("k2182a", InstrumentRole::Voltmeter)),
            reads: AtomicUsize::new(0),
            after: 2,
            stop: stop.clone(),
        }),
    );
    register(
        &mut station,
        "ami430_z",
        InstrumentRole::MagnetZ,
        InstrumentModel::Ami430,
        Arc::new(StuckMagnet),
    );
    let plan = RunPlan::from_toml_str(IV_PLAN).unwrap();
    let summary = run_plan(&station, &plan, &json_storage(dir.path()), &stop)
        .await
        .unwrap();

    assert!(summary.cancelled);
    assert_eq!(summary.saved.len(), 1);
    let document = read_json(&summary.saved[0]);
    assert_eq!(document["metadata"]["cancelled"], true);
    assert_eq!(document["metadata"]["sample"], "S17-B");
    assert_eq!(document["rows"].as_array().unwrap().len(), 2);
    // The source still reached its safe output; the magnet never can.
    assert_eq!(bench.output(InstrumentRole::CurrentSource), Some(0.0));
    assert!(station.emergency_stop().await.is_err());
}

#[tokio::test]
async fn test_failed_sweep_is_saved_and_reported() {
    let dir = tempdir().unwrap();
    let bench = SimulatedBench::default();
    let mut station = Station::new(SafetyLimits::default()).unwrap();
    register(
        &mut station,
        "k6221",
        InstrumentRole::CurrentSource,
        InstrumentModel::Keithley6221,
        Arc::new(bench.instrument("k6221", InstrumentRole::CurrentSource)),
    );
    register(
        &mut station,
        "k2182a",
        InstrumentRole::Voltmeter,
        InstrumentModel::Keithley2182a,
        Arc::new(
            bench
                .instrument("k2182a", InstrumentRole::Voltmeter)
                .fail_read_at(3),
        ),
    );

    let plan = RunPlan::from_toml_str(IV_PLAN).unwrap();
    let err = run_plan(&station, &plan, &json_storage(dir.path()), &EmergencyStop::new())
        .await
        .unwrap_err();

    assert!(err.to_string().contains("sweep 0"));
    let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
    assert_eq!(files.len(), 1);
    let document = read_json(&files[0].as_ref().unwrap().path());
    assert_eq!(document["rows"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn test_rejected_sweep_writes_nothing() {
    let dir = tempdir().unwrap();
    let bench = SimulatedBench::default();
    let station = vector_station(&bench);
    let _held = station.acquire(&[InstrumentRole::Voltmeter]).unwrap();

    let plan = RunPlan::from_toml_str(IV_PLAN).unwrap();
    let err = run_plan(&station, &plan, &json_storage(dir.path()), &EmergencyStop::new())
        .await
        .unwrap_err();

    assert!(matches!(
        err.downcast_ref::<DaqError>(),
        Some(DaqError::InstrumentBusy(_))
    ));
    assert_eq!(std::fs::read_dir(dir.path()).map(|d| d.count()).unwrap_or(0), 0);
    assert_eq!(bench.output(InstrumentRole::CurrentSource), None);
}

#[tokio::test(start_paused = true)]
async fn test_angle_series_records_each_outer_point() {
    let dir = tempdir().unwrap();
    let bench = SimulatedBench::new(100.0);
    let station = vector_station(&bench);
    let plan = RunPlan::from_toml_str(
        r#"
        [[series]]
        [series.outer]
        kind = "field_angle"
        magnitude = 0.5
        plane = "xy"
        start_angle = 0.0
        stop_angle = 90.0
        num_points = 3
        settle = "10s"
        ramp_rate = 0.2

        [series.sweep]
        kind = "iv"
        start_current = 1e-6
        stop_current = 3e-6
        num_points = 3
        settle_delay = "0s"
        "#,
    )
    .unwrap();

    let summary = run_plan(&station, &plan, &json_storage(dir.path()), &EmergencyStop::new())
        .await
        .unwrap();

    assert!(!summary.cancelled);
    assert_eq!(summary.saved.len(), 3);
    for (index, path) in summary.saved.iter().enumerate() {
        let document = read_json(path);
        let series = &document["metadata"]["series"];
        assert_eq!(series["index"], index);
        assert_eq!(series["point"]["axis"], "field");
        let x = series["point"]["x"].as_f64().unwrap();
        let y = series["point"]["y"].as_f64().unwrap();
        assert!(((x * x + y * y).sqrt() - 0.5).abs() < 1e-12);
        assert_eq!(document["rows"].as_array().unwrap().len(), 3);
    }

    // Magnets left at the last point, ramp rate applied to every axis.
    let x = bench.output(InstrumentRole::MagnetX).unwrap();
    let y = bench.output(InstrumentRole::MagnetY).unwrap();
    assert!(x.abs() < 1e-12);
    assert!((y - 0.5).abs() < 1e-12);
    for role in [InstrumentRole::MagnetX, InstrumentRole::MagnetY, InstrumentRole::MagnetZ] {
        assert_eq!(bench.setting(role, SettingKind::RampRate), Some(0.2));
    }
}

#[tokio::test(start_paused = true)]
async fn test_temperature_series_waits_ramp_and_settle() {
    let dir = tempdir().unwrap();
    let bench = SimulatedBench::new(100.0);
    let mut station = vector_station(&bench);
    register(
        &mut station,
        "ls372",
        InstrumentRole::TemperatureController,
        InstrumentModel::Lakeshore372,
        Arc::new(bench.instrument("ls372", InstrumentRole::TemperatureController)),
    );
    let plan = RunPlan::from_toml_str(
        r#"
        [[series]]
        [series.outer]
        kind = "temperature"
        temperatures = [1.0, 2.0]
        settle = "30s"
        ramp_rate = 2.0

        [series.sweep]
        kind = "iv"
        start_current = 1e-6
        stop_current = 2e-6
        num_points = 2
        settle_delay = "0s"
        "#,
    )
    .unwrap();

    let started = tokio::time::Instant::now();
    let summary = run_plan(&station, &plan, &json_storage(dir.path()), &EmergencyStop::new())
        .await
        .unwrap();

    assert_eq!(summary.saved.len(), 2);
    // 0 K -> 1 K -> 2 K at 2 K/min is 60 s of ramp, plus two 30 s settles.
    let elapsed = started.elapsed().as_secs_f64();
    assert!(elapsed >= 120.0 - 1e-6, "elapsed {}", elapsed);
    assert_eq!(bench.output(InstrumentRole::TemperatureController), Some(2.0));
    assert_eq!(
        read_json(&summary.saved[1])["metadata"]["series"]["point"]["kelvin"],
        2.0
    );
}

#[tokio::test]
async fn test_field_series_without_needed_axis_is_rejected() {
    let dir = tempdir().unwrap();
    let bench = SimulatedBench::default();
    let mut station = Station::new(SafetyLimits::default()).unwrap();
    for (name, role, model) in [
        ("k6221", InstrumentRole::CurrentSource, InstrumentModel::Keithley6221),
        ("k2182a", InstrumentRole::Voltmeter, InstrumentModel::Keithley2182a),
        ("ami430_z", InstrumentRole::MagnetZ, InstrumentModel::Ami430),
    ] {
        register(&mut station, name, role, model, Arc::new(bench.instrument(name, role)));
    }
    let plan = RunPlan::from_toml_str(
        r#"
        [[series]]
        [series.outer]
        kind = "field_vectors"
        vectors = [[0.0, 0.0, 1.0], [0.5, 0.0, 1.0]]

        [series.sweep]
        kind = "iv"
        start_current = 1e-6
        stop_current = 2e-6
        num_points = 2
        "#,
    )
    .unwrap();

    let err = run_plan(&station, &plan, &json_storage(dir.path()), &EmergencyStop::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<DaqError>(),
        Some(DaqError::InstrumentNotConfigured(_))
    ));
    assert_eq!(bench.output(InstrumentRole::MagnetZ), None);
}

/// Magnet recording the largest total field seen after any command.
struct FieldTracker {
    inner: Arc<dyn InstrumentDriver>,
    bench: SimulatedBench,
    peak: Arc<std::sync::Mutex<f64>>,
}

#[async_trait]
impl InstrumentDriver for FieldTracker {
    async fn set_output(&self, value: f64) -> AppResult<()> {
        self.inner.set_output(value).await?;
        let magnitude = [
            InstrumentRole::MagnetX,
            InstrumentRole::MagnetY,
            InstrumentRole::MagnetZ,
        ]
        .iter()
        .map(|&role| self.bench.output(role).unwrap_or(0.0).powi(2))
        .sum::<f64>()
        .sqrt();
        let mut peak = self.peak.lock().unwrap();
        *peak = peak.max(magnitude);
        Ok(())
    }

    async fn read_measurement(&self) -> AppResult<f64> {
        self.inner.read_measurement().await
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

#[tokio::test(start_paused = true)]
async fn test_rotating_field_never_exceeds_endpoints() {
    let dir = tempdir().unwrap();
    let bench = SimulatedBench::default();
    let peak = Arc::new(std::sync::Mutex::new(0.0));
    let mut station = Station::new(SafetyLimits::default()).unwrap();
    for (name, role, model) in [
        ("k6221", InstrumentRole::CurrentSource, InstrumentModel::Keithley6221),
        ("k2182a", InstrumentRole::Voltmeter, InstrumentModel::Keithley2182a),
    ] {
        register(&mut station, name, role, model, Arc::new(bench.instrument(name, role)));
    }
    for (name, role) in [
        ("ami430_x", InstrumentRole::MagnetX),
        ("ami430_y", InstrumentRole::MagnetY),
        ("ami430_z", InstrumentRole::MagnetZ),
    ] {
        let tracker = FieldTracker {
            inner: Arc::new(bench.instrument(name, role)),
            bench: bench.clone(),
            peak: peak.clone(),
        };
        register(&mut station, name, role, InstrumentModel::Ami430, Arc::new(tracker));
    }
    let plan = RunPlan::from_toml_str(
        r#"
        [[series]]
        [series.outer]
        kind = "field_vectors"
        vectors = [[8.0, 0.0, 0.0], [0.0, 0.0, 8.0]]
        settle = "0s"
        ramp_rate = 1.0

        [series.sweep]
        kind = "iv"
        start_current = 1e-6
        stop_current = 2e-6
        num_points = 2
        settle_delay = "0s"
        "#,
    )
    .unwrap();

    let summary = run_plan(&station, &plan, &json_storage(dir.path()), &EmergencyStop::new())
        .await
        .unwrap();

    assert_eq!(summary.saved.len(), 2);
    assert_eq!(bench.output(InstrumentRole::MagnetX), Some(0.0));
    assert_eq!(bench.output(InstrumentRole::MagnetZ), Some(8.0));
    // Growing z before x came down would have reached 11.3 T.
    assert!(*peak.lock().unwrap() <= 8.0 + 1e-12);
}

#[tokio::test(start_paused = true)]
async fn test_stop_between_outer_points_ends_series() {
    let dir = tempdir().unwrap();
    let bench = SimulatedBench::default();
    let stop = EmergencyStop::new();
    let mut station = Station::new(SafetyLimits::default()).unwrap();
    register(
        &mut station,
        "k6221",
        InstrumentRole::CurrentSource,
        InstrumentModel::Keithley6221,
        Arc::new(bench.instrument("k6221", InstrumentRole::CurrentSource)),
    );
    register(
        &mut station,
        "k2182a",
        InstrumentRole::Voltmeter,
        InstrumentModel::Keithley2182a,
        Arc::new(StopAfter {
            inner: Arc::new(bench.instrument("k2182a", InstrumentRole::Voltmeter)),
            reads: AtomicUsize::new(0),
            after: 2,
            stop: stop.clone(),
        }),
    );
    register(
        &mut station,
        "ami430_z",
        InstrumentRole::MagnetZ,
        InstrumentModel::Ami430,
        Arc::new(bench.instrument("ami430_z", InstrumentRole::MagnetZ)),
    );
    let plan = RunPlan::from_toml_str(
        r#"
        [[series]]
        [series.outer]
        kind = "field_vectors"
        vectors = [[0.0, 0.0, 0.5], [0.0, 0.0, 1.0], [0.0, 0.0, 1.5]]
        settle = "5s"

        [series.sweep]
        kind = "iv"
        start_current = 1e-6
        stop_current = 2e-6
        num_points = 2
        settle_delay = "0s"
        "#,
    )
    .unwrap();

    let summary = run_plan(&station, &plan, &json_storage(dir.path()), &stop)
        .await
        .unwrap();

    // The first inner sweep completes on its second reading, then the
    // series stops before moving on and parks the magnet.
    assert!(summary.cancelled);
    assert_eq!(summary.saved.len(), 1);
    assert_eq!(bench.output(InstrumentRole::MagnetZ), Some(0.0));
}
