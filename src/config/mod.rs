mod settings;

pub use settings::{LogFormat, LoggingConfig, OtelConfig, RedisConfig, Settings, ShutdownSettings};
