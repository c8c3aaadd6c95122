use std::time::Duration;

use serde::{Deserialize, Serialize};

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};

/// Identity of the broker node this service runs on.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node name, also the owner encoded in locally created entity keys
    pub name: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: String::from("broker@localhost"),
        }
    }
}

/// Configuration for the periodic stats sweep.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SweepConfig {
    /// Delay between sweep passes; also the truncation grain applied to
    /// stats timestamps when comparing staleness
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Lower bound on rows examined per pass
    pub min_rows: usize,
    /// Fraction of the table examined per pass, before clamping
    pub min_ratio: f64,
    /// Inactivity window after which an owner's liveness is re-verified
    #[serde(with = "humantime_serde")]
    pub gc_timeout: Duration,
    /// Stats tables to sweep, by identifier
    pub tables: Vec<String>,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            min_rows: 50,
            min_ratio: 0.001,
            gc_timeout: Duration::from_secs(120),
            tables: vec![String::from("channels"), String::from("connections")],
        }
    }
}

/// Configuration for owner liveness verification.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LivenessConfig {
    /// Upper bound on a single remote status query
    #[serde(with = "humantime_serde")]
    pub check_timeout: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            check_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Configuration {
    /// Local node identity
    pub node: NodeConfig,
    /// Sweep scheduling and staleness parameters
    pub sweep: SweepConfig,
    /// Liveness verification parameters
    pub liveness: LivenessConfig,
}

impl Configuration {
    pub fn load() -> Result<Self, Box<figment::Error>> {
        let config = Figment::from(Serialized::defaults(Configuration::default()))
            .merge(Toml::file("statsreaper.toml"))
            .merge(Env::prefixed("STATSREAPER__").split("__"))
            .extract()
            .map_err(Box::new)?;

        Ok(config)
    }

    pub fn load_from_path(path: &std::path::Path) -> Result<Self, Box<figment::Error>> {
        let config = Figment::from(Serialized::defaults(Configuration::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("STATSREAPER__").split("__"))
            .extract()
            .map_err(Box::new)?;

        Ok(config)
    }
}
