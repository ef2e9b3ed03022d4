use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// The default configuration file name, looked for in the working
/// directory when no explicit path is given.
pub const DEFAULT_CONFIG_FILE: &str = "adaptor-config.properties";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("config line {line} is not a key=value pair: {text:?}")]
    Malformed { line: usize, text: String },
    #[error("required config key {0:?} is missing or empty")]
    Missing(String),
    #[error("config key {key:?} has invalid value {value:?}: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
}

/// A wall-clock time of day, as used by `adaptor.fullListingSchedule`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeOfDay {
    pub hour: u32,
    pub minute: u32,
    pub second: u32,
}

impl FromStr for TimeOfDay {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 3 {
            return Err(format!("{s:?} is not HH:MM:SS"));
        }
        let field = |idx: usize, max: u32| -> Result<u32, String> {
            let n: u32 = parts[idx]
                .parse()
                .map_err(|_| format!("{s:?} is not HH:MM:SS"))?;
            if n > max {
                return Err(format!("{s:?} is out of range"));
            }
            Ok(n)
        };
        Ok(TimeOfDay {
            hour: field(0, 23)?,
            minute: field(1, 59)?,
            second: field(2, 59)?,
        })
    }
}

impl std::fmt::Display for TimeOfDay {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            fmt,
            "{:02}:{:02}:{:02}",
            self.hour, self.minute, self.second
        )
    }
}

/// Layered key=value configuration.
///
/// Values come from three layers, strongest last: built-in defaults,
/// the properties file, and `-D key=value` command-line overrides.
/// Unknown keys are kept verbatim so repository code can read its own
/// settings through [`Config::value`].
#[derive(Debug, Clone)]
pub struct Config {
    values: BTreeMap<String, String>,
}

fn defaults() -> BTreeMap<String, String> {
    let hostname = gethostname::gethostname()
        .to_str()
        .unwrap_or("localhost")
        .to_string();
    [
        ("server.hostname", hostname.as_str()),
        ("server.port", "5678"),
        ("server.dashboardPort", "5679"),
        ("server.secure", "false"),
        ("server.maxWorkerThreads", "16"),
        ("server.queueCapacity", "160"),
        ("server.fullAccessHosts", ""),
        ("server.docIdPath", "/doc/"),
        ("server.heartbeatPath", "/heartbeat/"),
        ("feed.name", "adaptor"),
        ("feed.maxUrls", "5000"),
        ("feed.archiveDirectory", ""),
        ("feed.gzip", "false"),
        ("feed.fillerInRecord", "false"),
        ("feed.httpSsoAuthMethod", "false"),
        ("feed.crawlImmediatelyBitEnabled", ""),
        ("feed.noRecrawlBitEnabled", ""),
        ("docId.isUrl", "false"),
        ("gsa.hostname", ""),
        ("adaptor.markAllDocsAsPublic", "false"),
        ("adaptor.fullListingSchedule", "03:00:00"),
        ("adaptor.incrementalPollPeriodSecs", "900"),
        ("adaptor.docContentTimeoutSecs", "180"),
        ("adaptor.pushDocIdsOnStartup", "true"),
        ("journal.maxUniqueIds", "1000000"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

impl Config {
    /// Assemble configuration from the optional properties file plus
    /// command-line overrides.
    pub fn load(
        file: Option<&Path>,
        overrides: &BTreeMap<String, String>,
    ) -> Result<Self, ConfigError> {
        let mut values = defaults();
        if let Some(path) = file {
            let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.display().to_string(),
                source,
            })?;
            parse_properties(&text, &mut values)?;
        }
        for (key, value) in overrides {
            values.insert(key.clone(), value.clone());
        }
        Ok(Self { values })
    }

    /// A config built purely from defaults and the given overrides.
    pub fn of<I, K, V>(overrides: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut values = defaults();
        for (key, value) in overrides {
            values.insert(key.into(), value.into());
        }
        Self { values }
    }

    pub fn value(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// The value for a key that carries a built-in default. Panics on
    /// keys outside the defaults table, which is a programming error,
    /// not a configuration error.
    pub fn str_value(&self, key: &str) -> &str {
        match self.value(key) {
            Some(value) => value,
            None => panic!("config key {key:?} has no default"),
        }
    }

    pub fn require(&self, key: &str) -> Result<&str, ConfigError> {
        match self.value(key) {
            Some(value) if !value.is_empty() => Ok(value),
            _ => Err(ConfigError::Missing(key.to_string())),
        }
    }

    /// An optional string value: empty means absent.
    pub fn opt_value(&self, key: &str) -> Option<&str> {
        self.value(key).filter(|v| !v.is_empty())
    }

    pub fn u16_value(&self, key: &str) -> Result<u16, ConfigError> {
        self.parsed(key)
    }

    pub fn usize_value(&self, key: &str) -> Result<usize, ConfigError> {
        self.parsed(key)
    }

    pub fn u64_value(&self, key: &str) -> Result<u64, ConfigError> {
        self.parsed(key)
    }

    pub fn bool_value(&self, key: &str) -> Result<bool, ConfigError> {
        let raw = self.str_value(key);
        match raw {
            "true" => Ok(true),
            "false" => Ok(false),
            _ => Err(self.invalid(key, "expected true or false")),
        }
    }

    /// A boolean that may also be left unset (empty).
    pub fn opt_bool_value(&self, key: &str) -> Result<Option<bool>, ConfigError> {
        match self.str_value(key) {
            "" => Ok(None),
            "true" => Ok(Some(true)),
            "false" => Ok(Some(false)),
            _ => Err(self.invalid(key, "expected true, false or empty")),
        }
    }

    pub fn duration_secs(&self, key: &str) -> Result<Duration, ConfigError> {
        Ok(Duration::from_secs(self.parsed(key)?))
    }

    pub fn time_of_day(&self, key: &str) -> Result<TimeOfDay, ConfigError> {
        self.str_value(key)
            .parse()
            .map_err(|reason: String| self.invalid(key, &reason))
    }

    fn parsed<T: FromStr>(&self, key: &str) -> Result<T, ConfigError> {
        self.str_value(key)
            .parse()
            .map_err(|_| self.invalid(key, "not a number in range"))
    }

    fn invalid(&self, key: &str, reason: &str) -> ConfigError {
        ConfigError::Invalid {
            key: key.to_string(),
            value: self.str_value(key).to_string(),
            reason: reason.to_string(),
        }
    }

    /// Startup validation of everything the server cares about, so a
    /// bad deployment dies with one clear message instead of limping.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.require("gsa.hostname")?;
        self.u16_value("server.port")?;
        self.u16_value("server.dashboardPort")?;
        self.bool_value("server.secure")?;
        let workers = self.usize_value("server.maxWorkerThreads")?;
        if workers == 0 {
            return Err(self.invalid("server.maxWorkerThreads", "must be at least 1"));
        }
        self.usize_value("server.queueCapacity")?;
        let doc_path = self.str_value("server.docIdPath");
        if !doc_path.starts_with('/') || !doc_path.ends_with('/') {
            return Err(self.invalid("server.docIdPath", "must start and end with '/'"));
        }
        self.u64_value("feed.maxUrls").and_then(|n| {
            if n == 0 {
                Err(self.invalid("feed.maxUrls", "must be at least 1"))
            } else {
                Ok(n)
            }
        })?;
        self.bool_value("feed.gzip")?;
        self.bool_value("feed.fillerInRecord")?;
        self.bool_value("feed.httpSsoAuthMethod")?;
        self.opt_bool_value("feed.crawlImmediatelyBitEnabled")?;
        self.opt_bool_value("feed.noRecrawlBitEnabled")?;
        self.bool_value("docId.isUrl")?;
        self.bool_value("adaptor.markAllDocsAsPublic")?;
        self.bool_value("adaptor.pushDocIdsOnStartup")?;
        self.time_of_day("adaptor.fullListingSchedule")?;
        self.duration_secs("adaptor.incrementalPollPeriodSecs")?;
        self.duration_secs("adaptor.docContentTimeoutSecs")?;
        Ok(())
    }
}

fn parse_properties(
    text: &str,
    into: &mut BTreeMap<String, String>,
) -> Result<(), ConfigError> {
    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(ConfigError::Malformed {
                line: idx + 1,
                text: raw.to_string(),
            });
        };
        into.insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(())
}
