use jaeger_nplusone::{logger::Logger, Config, JaegerClient, LoggingConfig};
use log::{Level, LevelFilter, Metadata};

mod my_test {
    use log::error;
    pub fn test_log() {
        error!("TEST");
    }
}

mod my_test_start_with {
    use log::error;
    pub fn test_log() {
        error!("TEST");
    }
}

mod in_the_my_test_middle {
    use log::error;
    pub fn test_log() {
        error!("TEST");
    }
}

mod ends_with_my_test {
    use log::error;
    pub fn test_log() {
        error!("TEST");
    }
}

#[test]
fn test_client_installs_logger() {
    let _client = JaegerClient::new(Config {
        logging_config: Some(LoggingConfig {
            level: Level::Warn,
            mod_filter: vec!["my_test"],
            ..LoggingConfig::default()
        }),
        ..Default::default()
    });

    assert_eq!(log::max_level(), LevelFilter::Warn);
    let logger = log::logger();
    assert!(logger.enabled(&Metadata::builder().level(Level::Error).build()));
    assert!(!logger.enabled(&Metadata::builder().level(Level::Info).build()));

    // A second logger cannot replace the first.
    assert!(Logger::init(LoggingConfig::default()).is_err());

    // All of these are filtered by module name and print nothing.
    my_test::test_log();
    my_test_start_with::test_log();
    ends_with_my_test::test_log();
    in_the_my_test_middle::test_log();
}
