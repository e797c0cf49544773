use btbattery::logging::{LogContext, get_logger_with_context, min_level, parse_log_level};
use btbattery::model::UnitId;
use tracing::Level;

#[test]
fn parse_accepts_aliases() {
    assert_eq!(parse_log_level("warning").unwrap(), Level::WARN);
    assert_eq!(parse_log_level("CRITICAL").unwrap(), Level::ERROR);
    assert_eq!(parse_log_level("Debug").unwrap(), Level::DEBUG);
    assert!(parse_log_level("verbose").is_err());
}

#[test]
fn min_level_prefers_more_verbose() {
    assert_eq!(min_level(Level::INFO, Level::DEBUG), Level::DEBUG);
    assert_eq!(min_level(Level::ERROR, Level::WARN), Level::WARN);
}

#[test]
fn unit_context_is_kept() {
    let context = LogContext::new("link")
        .with_unit(UnitId(1))
        .with_address("AA:BB");
    let logger = get_logger_with_context(context);
    assert_eq!(logger.context().component, "link");
    assert_eq!(logger.context().unit, Some(UnitId(1)));
    // Logging without an installed subscriber must not panic
    logger.info("hello");
}
