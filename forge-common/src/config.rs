// Copyright 2024-2025 Golem Cloud
//
// Licensed under the Golem Source License v1.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://license.golem.cloud/LICENSE
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::SafeDisplay;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use http::Uri;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub trait ConfigLoaderConfig: DeserializeOwned + Serialize + Default {}

impl<T: DeserializeOwned + Serialize + Default> ConfigLoaderConfig for T {}

/// Loads a service configuration from defaults, a TOML file and
/// `FORGE__`-prefixed environment variables, in increasing precedence.
pub struct ConfigLoader<T: ConfigLoaderConfig> {
    pub config_file_name: PathBuf,
    phantom: PhantomData<T>,
}

impl<T: ConfigLoaderConfig> ConfigLoader<T> {
    pub fn new(config_file_name: &Path) -> ConfigLoader<T> {
        ConfigLoader {
            config_file_name: config_file_name.to_path_buf(),
            phantom: PhantomData,
        }
    }

    pub fn figment(&self) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(T::default()))
            .merge(Toml::file(&self.config_file_name))
            .merge(Env::prefixed("FORGE__").split("__"))
    }

    pub fn load(&self) -> figment::Result<T> {
        self.figment().extract()
    }

    /// Loads the configuration, or dumps the defaults as TOML and returns
    /// `None` when invoked with `--dump-config`.
    pub fn load_or_dump_config(&self) -> Option<T> {
        if std::env::args().any(|arg| arg == "--dump-config") {
            let default = T::default();
            match toml::to_string(&default) {
                Ok(rendered) => println!("{rendered}"),
                Err(error) => eprintln!("Failed to render default config: {error}"),
            }
            None
        } else {
            match self.load() {
                Ok(config) => Some(config),
                Err(error) => {
                    eprintln!("Failed to load config: {error}");
                    None
                }
            }
        }
    }
}

/// Bounded retry policy shared by every outbound RPC.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub min_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    pub multiplier: f64,
    pub max_jitter_factor: Option<f64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            max_jitter_factor: Some(0.15),
        }
    }
}

impl RetryConfig {
    /// Streaming-style calls are not replayed; the sender owns ordering.
    pub fn streaming() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }
}

impl SafeDisplay for RetryConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "max attempts: {}", self.max_attempts);
        let _ = writeln!(&mut result, "min delay: {:?}", self.min_delay);
        let _ = writeln!(&mut result, "max delay: {:?}", self.max_delay);
        let _ = writeln!(&mut result, "multiplier: {}", self.multiplier);
        result
    }
}

/// Location and call policy of a remote Forge service.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RemoteServiceConfig {
    pub host: String,
    pub port: u16,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    pub retries: RetryConfig,
}

impl RemoteServiceConfig {
    pub fn uri(&self) -> Uri {
        Uri::builder()
            .scheme("http")
            .authority(format!("{}:{}", self.host, self.port).as_str())
            .path_and_query("/")
            .build()
            .expect("Failed to build service URI")
    }
}

impl Default for RemoteServiceConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 9701,
            connect_timeout: Duration::from_secs(10),
            retries: RetryConfig::default(),
        }
    }
}

impl SafeDisplay for RemoteServiceConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "host: {}", self.host);
        let _ = writeln!(&mut result, "port: {}", self.port);
        let _ = writeln!(&mut result, "connect timeout: {:?}", self.connect_timeout);
        let _ = writeln!(&mut result, "retries:");
        let _ = writeln!(&mut result, "{}", self.retries.to_safe_string_indented());
        result
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn retry_config_defaults_match_call_policy() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.min_delay, Duration::from_millis(100));
        assert_eq!(config.max_delay, Duration::from_secs(5));

        let streaming = RetryConfig::streaming();
        assert_eq!(streaming.max_attempts, 1);
    }

    #[test]
    fn remote_service_config_builds_uri() {
        let config = RemoteServiceConfig::default();
        assert_eq!(config.uri().to_string(), "http://localhost:9701/");
    }
}
