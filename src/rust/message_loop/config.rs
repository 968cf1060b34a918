// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::fail::Fail;
use ::std::{
    fs,
    ops::Index,
    str::FromStr,
};
use ::yaml_rust::{
    Yaml,
    YamlLoader,
};

//======================================================================================================================
// Constants
//======================================================================================================================

// Message loop options.
mod loop_config {
    pub const SECTION_NAME: &str = "message_loop";
    // Maximum number of passes made over the queues when discarding tasks at destruction.
    pub const TEARDOWN_MAX_PASSES: &str = "teardown_max_passes";
    // Number of readiness events an IO loop collects per wait.
    pub const IO_MAX_EVENTS: &str = "io_max_events";
    // Name of the thread running the loop.
    pub const THREAD_NAME: &str = "thread_name";
}

/// Default cap on destruction drain passes.
pub const DEFAULT_TEARDOWN_MAX_PASSES: usize = 100;

/// Default number of readiness events handled per epoll wait.
pub const DEFAULT_IO_MAX_EVENTS: usize = 32;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Message loop configuration file.
#[derive(Clone, Debug)]
pub struct Config(pub Yaml);

/// Tunables of a [crate::MessageLoop].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoopOptions {
    /// Cap on the number of passes made over the queues at destruction. Tasks whose destruction keeps posting more
    /// tasks are abandoned after this many passes.
    pub teardown_max_passes: usize,
    /// Number of readiness events an IO loop collects per wait.
    pub io_max_events: usize,
    /// Name of the thread running the loop, for diagnostics.
    pub thread_name: Option<String>,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl Config {
    /// Reads a configuration file into a [Config] object.
    pub fn new(config_path: &str) -> Result<Self, Fail> {
        let config_s: String = match fs::read_to_string(config_path) {
            Ok(config_s) => config_s,
            Err(e) => {
                let cause: String = format!("could not read config file {:?}: {:?}", config_path, e);
                error!("new(): {}", cause);
                return Err(Fail::new(e.raw_os_error().unwrap_or(libc::EIO), &cause));
            },
        };
        Self::parse(&config_s)
    }

    /// Parses a YAML document holding exactly one configuration object.
    pub fn parse(config_s: &str) -> Result<Self, Fail> {
        let config: Vec<Yaml> = match YamlLoader::load_from_str(config_s) {
            Ok(config) => config,
            Err(e) => {
                let cause: String = format!("malformed config: {:?}", e);
                error!("parse(): {}", cause);
                return Err(Fail::new(libc::EINVAL, &cause));
            },
        };
        let config_obj: &Yaml = match &config[..] {
            [c] => c,
            _ => return Err(Fail::new(libc::EINVAL, "Wrong number of config objects")),
        };

        Ok(Self(config_obj.clone()))
    }

    fn get_loop_config(&self) -> Result<&Yaml, Fail> {
        Self::get_subsection(&self.0, loop_config::SECTION_NAME)
    }

    /// Reads the "teardown max passes" parameter from the environment variable first and then the underlying
    /// configuration file. Returns `None` if neither sets it.
    pub fn teardown_max_passes(&self) -> Result<Option<usize>, Fail> {
        let passes: Option<usize> = match Self::get_typed_env_option(loop_config::TEARDOWN_MAX_PASSES)? {
            Some(passes) => Some(passes),
            None => self.get_optional_int_option(loop_config::TEARDOWN_MAX_PASSES)?,
        };
        Self::require_positive(loop_config::TEARDOWN_MAX_PASSES, passes)
    }

    /// Reads the "IO max events" parameter from the environment variable first and then the underlying
    /// configuration file. Returns `None` if neither sets it.
    pub fn io_max_events(&self) -> Result<Option<usize>, Fail> {
        let max_events: Option<usize> = match Self::get_typed_env_option(loop_config::IO_MAX_EVENTS)? {
            Some(max_events) => Some(max_events),
            None => self.get_optional_int_option(loop_config::IO_MAX_EVENTS)?,
        };
        Self::require_positive(loop_config::IO_MAX_EVENTS, max_events)
    }

    /// Reads the "thread name" parameter from the environment variable first and then the underlying configuration
    /// file.
    pub fn thread_name(&self) -> Result<Option<String>, Fail> {
        if let Some(name) = Self::get_typed_env_option(loop_config::THREAD_NAME)? {
            return Ok(Some(name));
        }
        let section: &Yaml = match self.get_loop_config() {
            Ok(section) => section,
            Err(_) => return Ok(None),
        };
        match section.index(loop_config::THREAD_NAME) {
            Yaml::BadValue => Ok(None),
            Yaml::String(name) => Ok(Some(name.clone())),
            _ => {
                let message: String = format!("parameter {} has unexpected type", loop_config::THREAD_NAME);
                Err(Fail::new(libc::EINVAL, message.as_str()))
            },
        }
    }

    //==================================================================================================================
    // Static Functions
    //==================================================================================================================

    /// Similar to `get_typed_option` using `Yaml::as_hash` receiver. This method returns a `&Yaml` instead of
    /// yaml::Hash, and Yaml is more natural for indexing.
    fn get_subsection<'a>(yaml: &'a Yaml, index: &str) -> Result<&'a Yaml, Fail> {
        let section: &'a Yaml = Self::get_option(yaml, index)?;
        match section {
            Yaml::Hash(_) => Ok(section),
            _ => {
                let message: String = format!("parameter \"{}\" has unexpected type", index);
                Err(Fail::new(libc::EINVAL, message.as_str()))
            },
        }
    }

    /// Index `yaml` to find the value at `index`, validating that the index exists.
    fn get_option<'a>(yaml: &'a Yaml, index: &str) -> Result<&'a Yaml, Fail> {
        match yaml.index(index) {
            Yaml::BadValue => {
                let message: String = format!("missing configuration option \"{}\"", index);
                Err(Fail::new(libc::EINVAL, message.as_str()))
            },
            value => Ok(value),
        }
    }

    /// Get value where the environment value overrides the config file if it exists.
    fn get_typed_env_option<T: FromStr>(index: &str) -> Result<Option<T>, Fail> {
        // Check for the environment variable.
        if let Ok(var) = ::std::env::var(index.to_uppercase()) {
            if let Ok(value) = var.as_str().parse() {
                return Ok(Some(value));
            } else {
                let message: String = format!("parameter {} has unexpected type", index);
                return Err(Fail::new(libc::EINVAL, message.as_str()));
            }
        }
        Ok(None)
    }

    /// Reads an integer option of the loop section, verifying that the destination type may hold it. A missing
    /// section or option is not an error.
    fn get_optional_int_option<T: TryFrom<i64>>(&self, index: &str) -> Result<Option<T>, Fail> {
        let section: &Yaml = match self.get_loop_config() {
            Ok(section) => section,
            Err(_) => return Ok(None),
        };
        let val: i64 = match section.index(index) {
            Yaml::BadValue => return Ok(None),
            Yaml::Integer(val) => *val,
            _ => {
                let message: String = format!("parameter {} has unexpected type", index);
                return Err(Fail::new(libc::EINVAL, message.as_str()));
            },
        };
        match T::try_from(val) {
            Ok(val) => Ok(Some(val)),
            _ => {
                let message: String = format!("parameter \"{}\" is out of range", index);
                Err(Fail::new(libc::ERANGE, message.as_str()))
            },
        }
    }

    fn require_positive(index: &str, value: Option<usize>) -> Result<Option<usize>, Fail> {
        match value {
            Some(0) => {
                let message: String = format!("parameter \"{}\" must be at least 1", index);
                Err(Fail::new(libc::ERANGE, message.as_str()))
            },
            value => Ok(value),
        }
    }
}

impl LoopOptions {
    /// Builds options out of a configuration file. Options the file does not set keep their defaults.
    pub fn from_config(config: &Config) -> Result<Self, Fail> {
        let defaults: LoopOptions = LoopOptions::default();
        Ok(Self {
            teardown_max_passes: config.teardown_max_passes()?.unwrap_or(defaults.teardown_max_passes),
            io_max_events: config.io_max_events()?.unwrap_or(defaults.io_max_events),
            thread_name: config.thread_name()?,
        })
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for LoopOptions {
    fn default() -> Self {
        Self {
            teardown_max_passes: DEFAULT_TEARDOWN_MAX_PASSES,
            io_max_events: DEFAULT_IO_MAX_EVENTS,
            thread_name: None,
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
