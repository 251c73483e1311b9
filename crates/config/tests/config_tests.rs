// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use labwired_avr_config::{
    BoardManifest, BusKind, ChipKind, ClearPolarity, ManifestError, PartKind,
};

const OLED_BOARD: &str = r#"
name: "oled-demo"
chip: "atmega328p"
simulation:
  frequency_hz: 8000000
  aref_mv: 3300
parts:
  - id: "oled"
    type: "ssd1306"
    bus: "spi"
  - id: "rtc"
    type: "ds1338"
    bus: "i2c"
wiring:
  - { part: "oled", signal: "cs", port: "B", pin: 2 }
  - { part: "oled", signal: "dc", port: "b", pin: 1 }
  - { part: "oled", signal: "reset", port: "B", pin: 0 }
analog:
  - { channel: 0, millivolts: 1650 }
"#;

#[test]
fn test_board_manifest_parses() {
    let manifest = BoardManifest::from_yaml(OLED_BOARD).unwrap();
    assert_eq!(manifest.schema_version, "1.0");
    assert_eq!(manifest.chip, ChipKind::Atmega328p);
    assert_eq!(manifest.simulation.frequency_hz, Some(8_000_000));
    assert_eq!(manifest.simulation.vcc_mv, None);
    assert_eq!(manifest.parts.len(), 2);
    assert_eq!(manifest.parts[0].r#type, PartKind::Ssd1306);
    assert_eq!(manifest.parts[1].bus, Some(BusKind::Twi));
    assert_eq!(manifest.wires_for("oled").count(), 3);
    assert_eq!(manifest.wiring[1].port_letter(), Some('B'));
    assert_eq!(manifest.analog[0].millivolts, 1650);
}

#[test]
fn test_minimal_manifest_defaults() {
    let manifest = BoardManifest::from_yaml("name: bare\nchip: atmega32u4\n").unwrap();
    assert_eq!(manifest.chip, ChipKind::Atmega32u4);
    assert!(manifest.parts.is_empty());
    assert!(manifest.wiring.is_empty());
    assert_eq!(manifest.simulation.usb_clear_polarity, None);
}

#[test]
fn test_clear_polarity_aliases() {
    let yaml = "name: usb\nchip: atmega32u4\nsimulation:\n  usb_clear_polarity: zeroToClear\n";
    let manifest = BoardManifest::from_yaml(yaml).unwrap();
    assert_eq!(
        manifest.simulation.usb_clear_polarity,
        Some(ClearPolarity::WriteZeroToClear)
    );
    assert_eq!(ClearPolarity::default(), ClearPolarity::WriteOneToClear);
}

#[test]
fn test_wiring_to_unknown_part_rejected() {
    let yaml = r#"
name: "broken"
chip: "atmega328p"
wiring:
  - { part: "ghost", signal: "cs", port: "B", pin: 2 }
"#;
    let manifest: BoardManifest = serde_yaml::from_str(yaml).unwrap();
    assert_eq!(
        manifest.validate(),
        Err(ManifestError::UnknownPart("ghost".to_string()))
    );
    assert!(BoardManifest::from_yaml(yaml).is_err());
}

#[test]
fn test_invalid_pin_and_port_rejected() {
    let base = "name: b\nchip: atmega328p\nparts:\n  - { id: d, type: sh1106 }\n";
    let bad_pin = format!("{base}wiring:\n  - {{ part: d, signal: reset, port: C, pin: 9 }}\n");
    let manifest: BoardManifest = serde_yaml::from_str(&bad_pin).unwrap();
    assert!(matches!(
        manifest.validate(),
        Err(ManifestError::InvalidPin { pin: 9, .. })
    ));

    let bad_port = format!("{base}wiring:\n  - {{ part: d, signal: reset, port: C1, pin: 1 }}\n");
    let manifest: BoardManifest = serde_yaml::from_str(&bad_port).unwrap();
    assert!(matches!(
        manifest.validate(),
        Err(ManifestError::InvalidPort { .. })
    ));
}

#[test]
fn test_duplicate_part_rejected() {
    let yaml = "name: b\nchip: atmega328p\nparts:\n  - { id: x, type: ds1338 }\n  - { id: x, type: ssd1306 }\n";
    let manifest: BoardManifest = serde_yaml::from_str(yaml).unwrap();
    assert_eq!(
        manifest.validate(),
        Err(ManifestError::DuplicatePart("x".to_string()))
    );
}

#[test]
fn test_unknown_simulation_key_rejected() {
    let yaml = "name: b\nchip: atmega328p\nsimulation:\n  frequncy_hz: 1\n";
    assert!(BoardManifest::from_yaml(yaml).is_err());
}
