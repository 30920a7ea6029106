use super::error::PriceCastError;
use super::logging;

#[test]
fn logging_init_accepts_levels() {
    // Should not panic
    logging::init("info");
    logging::init("debug");
    logging::init("warning");
    logging::init("bogus");
}

#[test]
fn transport_errors_are_classified() {
    assert!(PriceCastError::BusUnavailable("down".into()).is_transport_error());
    assert!(PriceCastError::ReconnectExhausted(3).is_transport_error());
    assert!(!PriceCastError::MalformedPayload("x".into()).is_transport_error());
    assert!(!PriceCastError::AlreadyRunning.is_transport_error());
}

#[test]
fn error_messages_are_readable() {
    let err = PriceCastError::ReconnectExhausted(5);
    assert_eq!(
        err.to_string(),
        "gave up reconnecting to the message bus after 5 attempts"
    );
}
