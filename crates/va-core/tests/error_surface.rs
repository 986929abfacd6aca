use va_core::errors::{ErrorInfo, VaError};

fn sample_info(code: &str, message: &str) -> ErrorInfo {
    ErrorInfo::new(code, message)
        .with_context("stage", "SI")
        .with_context("pv", "SI-Glob:DI-DCCT:Current-Mon")
}

#[test]
fn numerical_error_surface() {
    let err = VaError::Numerical(sample_info("unstable-optics", "|cos mu| >= 1"));
    assert_eq!(err.info().code, "unstable-optics");
    assert!(err.info().context.contains_key("stage"));
    assert!(err.is_numerical());
}

#[test]
fn pv_error_surface() {
    let err = VaError::Pv(sample_info("read-only", "write rejected"));
    assert_eq!(err.info().code, "read-only");
    assert!(!err.is_numerical());
}

#[test]
fn transport_error_surface() {
    let err = VaError::Transport(sample_info("channel-closed", "peer hung up"));
    assert_eq!(err.info().code, "channel-closed");
}

#[test]
fn display_includes_context_and_hint() {
    let err = VaError::Config(
        ErrorInfo::new("unmapped-family", "family QX not in lattice")
            .with_context("device", "SI-Fam:PS-QX")
            .with_hint("check the power supply table"),
    );
    let rendered = err.to_string();
    assert_eq!(
        rendered,
        "config: [unmapped-family] family QX not in lattice (device=SI-Fam:PS-QX); \
         hint: check the power supply table"
    );

    let bare = VaError::numerical("closed-orbit", "no fixed point").to_string();
    assert_eq!(bare, "optics: [closed-orbit] no fixed point");
}

#[test]
fn errors_serialize_with_family_tag() {
    let err = VaError::Serde(sample_info("yaml_deserialize", "bad indent"));
    let json = serde_json::to_value(&err).expect("serialize");
    assert_eq!(json["family"], "Serde");
    assert_eq!(json["detail"]["code"], "yaml_deserialize");
    let back: VaError = serde_json::from_value(json).expect("deserialize");
    assert_eq!(back, err);
}

#[test]
fn context_can_be_added_after_construction() {
    let err = VaError::numerical("no-closed-orbit", "orbit hits the chamber")
        .with_context("step", "closed orbit");
    assert!(err.is_numerical());
    assert_eq!(err.info().context.get("step").map(String::as_str), Some("closed orbit"));
}
