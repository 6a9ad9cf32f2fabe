use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use rmgr::{
    AppConfig, AppError, BackendError, BackendMode, RelayConfiguration, RelayController,
    ReloadPolicy, SysfsBackend,
};
use serde_json::json;

fn relays(value: serde_json::Value) -> RelayConfiguration {
    AppConfig::from_json(&value.to_string())
        .expect("valid config")
        .relays
}

fn pin_dir(root: &Path, pin: u32) -> PathBuf {
    root.join(format!("gpio{pin}"))
}

fn attr(root: &Path, pin: u32, name: &str) -> String {
    fs::read_to_string(pin_dir(root, pin).join(name))
        .unwrap()
        .trim()
        .to_string()
}

/// Creates `gpioN` whenever `N` is written to the export file, the way the
/// kernel does it.
struct FakeKernel {
    stop: Arc<AtomicBool>,
    worker: Option<thread::JoinHandle<()>>,
}

impl FakeKernel {
    fn spawn(root: &Path) -> Self {
        let root = root.to_path_buf();
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let worker = thread::spawn(move || {
            while !flag.load(Ordering::Relaxed) {
                if let Ok(raw) = fs::read_to_string(root.join("export")) {
                    if let Ok(pin) = raw.trim().parse::<u32>() {
                        let _ = fs::create_dir_all(pin_dir(&root, pin));
                    }
                }
                thread::sleep(Duration::from_millis(5));
            }
        });
        Self {
            stop,
            worker: Some(worker),
        }
    }
}

impl Drop for FakeKernel {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn controller(root: &Path, config: RelayConfiguration) -> RelayController<SysfsBackend> {
    RelayController::start(
        Arc::new(SysfsBackend::new(root)),
        config,
        ReloadPolicy::RetainUndeclared,
    )
}

#[test]
fn exports_missing_pin_and_drives_value() {
    let root = tempfile::tempdir().unwrap();
    let _kernel = FakeKernel::spawn(root.path());

    let ctl = controller(
        root.path(),
        relays(json!({
            "relays": { "1": { "pin": 24, "path": pin_dir(root.path(), 24), "active": "high" } }
        })),
    );
    assert_eq!(ctl.mode(), BackendMode::Path);

    assert_eq!(fs::read_to_string(root.path().join("export")).unwrap(), "24");
    assert_eq!(attr(root.path(), 24, "direction"), "out");
    assert_eq!(attr(root.path(), 24, "active_low"), "0");

    ctl.set_relay("1", false).unwrap();
    assert_eq!(attr(root.path(), 24, "value"), "0");
    assert!(!ctl.get_relay("1").unwrap());

    ctl.set_relay("1", true).unwrap();
    assert_eq!(attr(root.path(), 24, "value"), "1");
    assert!(ctl.get_relay("1").unwrap());
}

#[test]
fn active_low_pin_round_trips_logical_state() {
    let root = tempfile::tempdir().unwrap();
    fs::create_dir_all(pin_dir(root.path(), 5)).unwrap();

    let ctl = controller(
        root.path(),
        relays(json!({
            "relays": { "fan": { "pin": 5, "path": pin_dir(root.path(), 5), "active": "low" } }
        })),
    );
    assert_eq!(attr(root.path(), 5, "active_low"), "1");

    ctl.set_relay("fan", true).unwrap();
    assert_eq!(attr(root.path(), 5, "value"), "0");
    assert!(ctl.get_relay("fan").unwrap());

    ctl.set_relay("fan", false).unwrap();
    assert_eq!(attr(root.path(), 5, "value"), "1");
    assert!(!ctl.get_relay("fan").unwrap());
}

#[test]
fn existing_pin_directory_is_not_exported_again() {
    let root = tempfile::tempdir().unwrap();
    fs::create_dir_all(pin_dir(root.path(), 7)).unwrap();

    let ctl = controller(
        root.path(),
        relays(json!({
            "relays": { "1": { "pin": 7, "path": pin_dir(root.path(), 7) } }
        })),
    );

    assert!(!root.path().join("export").exists());
    assert_eq!(attr(root.path(), 7, "direction"), "out");
    ctl.set_relay("1", true).unwrap();
}

#[test]
fn garbage_in_value_file_is_reported() {
    let root = tempfile::tempdir().unwrap();
    fs::create_dir_all(pin_dir(root.path(), 3)).unwrap();
    let ctl = controller(
        root.path(),
        relays(json!({
            "relays": { "1": { "pin": 3, "path": pin_dir(root.path(), 3) } }
        })),
    );

    match ctl.get_relay("1") {
        Err(AppError::Backend(BackendError::Io { path, .. })) => {
            assert_eq!(path, pin_dir(root.path(), 3).join("value"))
        }
        other => panic!("unexpected {other:?}"),
    }

    fs::write(pin_dir(root.path(), 3).join("value"), "on\n").unwrap();
    match ctl.get_relay("1") {
        Err(AppError::Backend(BackendError::InvalidReading { value, .. })) => {
            assert_eq!(value, "on")
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn one_pin_failing_does_not_stop_the_rest() {
    let root = tempfile::tempdir().unwrap();
    fs::create_dir_all(pin_dir(root.path(), 1)).unwrap();

    // no kernel: pin 2 never appears after export
    let ctl = controller(
        root.path(),
        relays(json!({
            "relays": {
                "good": { "pin": 1, "path": pin_dir(root.path(), 1) },
                "gone": { "pin": 2, "path": pin_dir(root.path(), 2) }
            }
        })),
    );

    ctl.set_relay("good", true).unwrap();
    assert_eq!(attr(root.path(), 1, "value"), "1");
    assert!(matches!(
        ctl.set_relay("gone", true),
        Err(AppError::Backend(BackendError::Io { .. }))
    ));
}

#[test]
fn unknown_relay_and_foreign_addressing_are_rejected() {
    let root = tempfile::tempdir().unwrap();
    fs::create_dir_all(pin_dir(root.path(), 9)).unwrap();
    let ctl = controller(
        root.path(),
        relays(json!({
            "relays": { "1": { "pin": 9, "path": pin_dir(root.path(), 9) } }
        })),
    );

    assert!(matches!(ctl.set_relay("9", true), Err(AppError::UnknownRelay(_))));

    let result = ctl.replace(relays(json!({
        "relays": { "2": { "chip": "gpiochip0", "line": 4 } }
    })));
    assert!(matches!(result, Err(AppError::ConfigInvalid(_))));
    assert_eq!(ctl.version(), 1);
}

#[test]
fn reload_initializes_new_pins() {
    let root = tempfile::tempdir().unwrap();
    for pin in [10, 11] {
        fs::create_dir_all(pin_dir(root.path(), pin)).unwrap();
    }
    let ctl = controller(
        root.path(),
        relays(json!({
            "relays": { "1": { "pin": 10, "path": pin_dir(root.path(), 10) } }
        })),
    );

    let summary = ctl
        .replace(relays(json!({
            "relays": {
                "1": { "pin": 10, "path": pin_dir(root.path(), 10) },
                "2": { "pin": 11, "path": pin_dir(root.path(), 11), "active": "low" }
            }
        })))
        .unwrap();
    assert_eq!(summary.version, 2);
    assert!(summary.failures.is_empty());
    assert_eq!(attr(root.path(), 11, "active_low"), "1");

    ctl.set_relay("2", true).unwrap();
    assert_eq!(attr(root.path(), 11, "value"), "0");
}
