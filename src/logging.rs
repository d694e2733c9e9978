//! log4rs setup shared by the binaries.
//!
//! Library code only uses the `log` macros; whoever owns `main` decides
//! where records go. Everything is written to stderr so stdout stays free
//! for protocol traffic and command output.

use std::str::FromStr;

use chrono::Local;
use gpu_orchestrator_config::LoggingConfig;
use log::LevelFilter;
use log4rs::append::console::{ConsoleAppender, Target};
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;

const PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S)} - {l} - {m}{n}";

pub fn setup_logging(config: &LoggingConfig) -> Result<(), Box<dyn std::error::Error>> {
    let level = LevelFilter::from_str(&config.level)?;

    let console = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new(PATTERN)))
        .build();

    let mut builder =
        Config::builder().appender(Appender::builder().build("stderr", Box::new(console)));
    let mut root = Root::builder().appender("stderr");

    if let Some(ref dir) = config.directory {
        std::fs::create_dir_all(dir)?;
        let timestamp = Local::now().format("%Y-%m-%d-%H_%M").to_string();
        let log_path = dir.join(format!("{timestamp}.log"));
        let file_appender = FileAppender::builder()
            .encoder(Box::new(PatternEncoder::new(PATTERN)))
            .build(log_path)?;
        builder = builder.appender(Appender::builder().build("file", Box::new(file_appender)));
        root = root.appender("file");
    }

    let config = builder.build(root.build(level))?;
    log4rs::init_config(config)?;

    Ok(())
}
