mod common;

use hda_host::{ErrorClass, HdaConfig, HdaError, StatusMode};

use common::{attach, reference_machine};

#[test]
fn partial_document_keeps_defaults() {
    let config = HdaConfig::from_json(include_str!("fixtures/interrupt_small_rings.json")).unwrap();
    assert_eq!(config.status_mode, StatusMode::Interrupt);
    assert_eq!(config.ring_entries, 16);
    assert_eq!(config.rirb_interrupt_count, 4);
    assert!(config.intentional_overrun);
    assert_eq!(config.position_tolerance_us, 500);

    let defaults = HdaConfig::default();
    assert_eq!(config.poll_interval_us, defaults.poll_interval_us);
    assert_eq!(config.codec_wake_delay_us, defaults.codec_wake_delay_us);
    assert_eq!(config.response_wait_frames, defaults.response_wait_frames);
}

#[test]
fn empty_document_is_the_default() {
    assert_eq!(HdaConfig::from_json("{}").unwrap(), HdaConfig::default());
}

#[test]
fn invalid_values_are_rejected() {
    let err = HdaConfig::from_json(include_str!("fixtures/bad_ring_size.json")).unwrap_err();
    assert!(matches!(err, HdaError::InvalidConfig(_)));
    assert_eq!(err.class(), ErrorClass::Config);

    let err = HdaConfig::from_json(r#"{ "status_mode": "sometimes" }"#).unwrap_err();
    assert!(matches!(err, HdaError::InvalidConfig(_)));
    let err = HdaConfig::from_json(r#"{ "stripe_lines": 3 }"#).unwrap_err();
    assert!(matches!(err, HdaError::InvalidConfig(_)));
}

#[test]
fn round_trips_through_json() {
    let config = HdaConfig {
        status_mode: StatusMode::Interrupt,
        ring_entries: 2,
        ..HdaConfig::default()
    };
    let json = serde_json::to_string(&config).unwrap();
    assert_eq!(HdaConfig::from_json(&json).unwrap(), config);
}

#[test]
fn loaded_config_drives_attach() {
    let config = HdaConfig::from_json(include_str!("fixtures/interrupt_small_rings.json")).unwrap();
    let machine = reference_machine();
    let controller = attach(&machine, config);
    assert_eq!(controller.rings().capacity(), 16);
    assert_eq!(controller.config().status_mode, StatusMode::Interrupt);
    assert_eq!(machine.controller().rirb().entries(), 16);
}
