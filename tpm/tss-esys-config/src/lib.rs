// Copyright (c) Microsoft. All rights reserved.

#![deny(rust_2018_idioms)]
#![warn(clippy::all, clippy::pedantic)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::Error as _;
use serde::{Deserialize, Serialize};

use tss_esys::tcti::Conf;
use tss_esys::{EsysContext, Timeout};

const MAX_TIMEOUT_MS: u64 = 600_000;

const _: () = assert!(valid_timeout(default_timeout_ms()));

const fn default_timeout_ms() -> u64 {
    0
}

const fn valid_timeout(timeout_ms: u64) -> bool {
    timeout_ms <= MAX_TIMEOUT_MS
}

#[derive(Debug, Deserialize, PartialEq, Serialize)]
pub struct Config {
    /// Transport configuration, such as `device:/dev/tpmrm0` or `mssim:host=127.0.0.1,port=2321`.
    ///
    /// Empty probes the default devices and then a local simulator.
    #[serde(default, deserialize_with = "tcti", skip_serializing_if = "String::is_empty")]
    pub tcti: String,

    /// How long each `x_finish` call waits for a response. `0` blocks.
    #[serde(default = "default_timeout_ms", deserialize_with = "timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            tcti: String::new(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

fn tcti<'de, D>(de: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = String::deserialize(de)?;
    if value.parse::<Conf>().is_err() {
        return Err(D::Error::invalid_value(
            serde::de::Unexpected::Str(&value),
            &"a device or mssim TCTI configuration",
        ));
    }
    Ok(value)
}

fn timeout_ms<'de, D>(de: D) -> Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = u64::deserialize(de)?;
    if !valid_timeout(value) {
        return Err(D::Error::invalid_value(
            serde::de::Unexpected::Unsigned(value),
            &"a timeout of at most 600000 ms",
        ));
    }
    Ok(value)
}

impl Config {
    #[must_use]
    pub fn timeout(&self) -> Timeout {
        match self.timeout_ms {
            0 => Timeout::Block,
            ms => Timeout::After(Duration::from_millis(ms)),
        }
    }

    /// Opens the configured transport and returns a context ready for commands.
    pub fn connect(&self) -> Result<EsysContext, Error> {
        let mut context = EsysContext::new(&self.tcti).map_err(Error::Connect)?;
        context.set_timeout(self.timeout());
        log::debug!("connected to TPM via {:?}", self.tcti);
        Ok(context)
    }
}

#[derive(Debug)]
pub enum Error {
    ReadConfig(Option<PathBuf>, Box<dyn std::error::Error + Send + Sync>),
    Connect(tss_esys::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::ReadConfig(Some(path), _) => {
                write!(f, "could not read config from {}", path.display())
            }
            Error::ReadConfig(None, _) => f.write_str("could not read config"),
            Error::Connect(err) => write!(f, "could not connect to the TPM: {err}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::ReadConfig(_, err) => Some(&**err),
            Error::Connect(err) => Some(err),
        }
    }
}

/// Reads `config_path`, then applies every `*.toml` file in `config_directory_path` in name order.
pub fn read_config(config_path: PathBuf, config_directory_path: PathBuf) -> Result<Config, Error> {
    let base = read_toml(config_path)?;
    let patches = patch_files(&config_directory_path)
        .map_err(|err| Error::ReadConfig(Some(config_directory_path), Box::new(err)))?;

    let config = patches
        .into_iter()
        .try_fold(base, |mut config, patch_path| -> Result<toml::Value, Error> {
            log::debug!("applying config patch {}", patch_path.display());
            merge_toml(&mut config, read_toml(patch_path)?);
            Ok(config)
        })?;

    Config::deserialize(config).map_err(|err| Error::ReadConfig(None, Box::new(err)))
}

/// Regular `*.toml` files directly inside `dir`, sorted. A missing directory has none.
fn patch_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
        Err(err) => return Err(err),
    };

    let mut paths = vec![];
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_file() && path.extension().is_some_and(|ext| ext == "toml") {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

fn read_toml(path: PathBuf) -> Result<toml::Value, Error> {
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) => return Err(Error::ReadConfig(Some(path), Box::new(err))),
    };
    toml::from_str(&contents).map_err(|err| Error::ReadConfig(Some(path), Box::new(err)))
}

/// Tables merge key by key, arrays concatenate, anything else is replaced by the patch.
fn merge_toml(base: &mut toml::Value, patch: toml::Value) {
    match (base, patch) {
        (toml::Value::Table(base), toml::Value::Table(patch)) => {
            for (key, value) in patch {
                match base.get_mut(&key) {
                    Some(original) => merge_toml(original, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (toml::Value::Array(base), toml::Value::Array(patch)) => base.extend(patch),
        (base, patch) => *base = patch,
    }
}
