//! Driver registry selection: deterministic, keyed by (gen, app).

use shelly_exporter::drivers::DriverRegistry;
use shelly_exporter::shelly::DeviceInfo;

fn info(gen: i64, app: &str, model: &str) -> DeviceInfo {
    DeviceInfo {
        gen: Some(gen),
        app: Some(app.to_string()),
        model: Some(model.to_string()),
        ..Default::default()
    }
}

#[test]
fn test_gen_app_selects_unique_driver() {
    let registry = DriverRegistry::new();

    let cases = [
        (info(2, "Pro4PM", "SPSW-104PE16EU"), "pro4pm_gen2"),
        (info(4, "S1PMG4", "S4SW-001P16EU"), "s1pm_gen4"),
        (info(2, "PlugUS", "SNPL-00116US"), "plugus_gen2"),
        (info(3, "Dimmer0110VPMG3", "S3DM-0010WW"), "dimmer_0110vpm_g3"),
    ];

    for (device, expected) in cases {
        let driver = registry
            .best_driver(&device)
            .unwrap_or_else(|| panic!("no driver for {:?}", device));
        assert_eq!(driver.id(), expected);
    }
}

#[test]
fn test_selection_is_deterministic() {
    let registry = DriverRegistry::new();
    let device = info(2, "Pro4PM", "SPSW-104PE16EU");

    let first = registry.best_driver(&device).expect("driver");
    for _ in 0..10 {
        let again = registry.best_driver(&device).expect("driver");
        assert_eq!(again.id(), first.id());
    }
}

#[test]
fn test_unknown_device_selects_nothing() {
    let registry = DriverRegistry::new();

    assert!(registry.best_driver(&info(1, "Switch25", "SHSW-25")).is_none());
    assert!(registry.best_driver(&info(2, "Pro2PM", "SPSW-202XE16EU")).is_none());
    assert!(registry.best_driver(&DeviceInfo::default()).is_none());
}

#[test]
fn test_gen_alone_is_not_enough() {
    let registry = DriverRegistry::new();
    // Right generation, wrong app tag.
    assert!(registry.best_driver(&info(2, "SomethingElse", "X")).is_none());
    // Right app tag, wrong generation.
    assert!(registry.best_driver(&info(3, "Pro4PM", "X")).is_none());
}

#[test]
fn test_all_shipped_drivers_registered() {
    let registry = DriverRegistry::new();
    let ids: Vec<&str> = registry.drivers().iter().map(|d| d.id()).collect();
    assert_eq!(
        ids,
        ["pro4pm_gen2", "s1pm_gen4", "plugus_gen2", "dimmer_0110vpm_g3"]
    );
}
