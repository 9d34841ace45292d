use faceid_core::config::ConfigError;
use faceid_core::Config;
use std::fmt;
use std::str::FromStr;

/// Which message bus the daemon registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BusKind {
    #[default]
    Session,
    System,
}

impl FromStr for BusKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "session" => Ok(Self::Session),
            "system" => Ok(Self::System),
            other => Err(ConfigError::Invalid(format!(
                "FACEID_BUS must be 'session' or 'system', got {other:?}"
            ))),
        }
    }
}

impl fmt::Display for BusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Session => "session",
            Self::System => "system",
        })
    }
}

/// Daemon configuration: the pipeline config plus bus selection.
pub struct DaemonConfig {
    pub core: Config,
    pub bus: BusKind,
}

impl DaemonConfig {
    /// Load from `FACEID_CONFIG` / `FACEID_*` and `FACEID_BUS`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let core = Config::from_env()?;
        let bus = match std::env::var("FACEID_BUS") {
            Ok(v) => v.parse()?,
            Err(_) => BusKind::default(),
        };
        Ok(Self { core, bus })
    }
}
