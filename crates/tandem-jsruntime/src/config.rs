//! Runtime configuration

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("initial_heap_size requires max_heap_size to be set as well")]
    InitialWithoutMax,
    #[error("initial_heap_size ({initial}) cannot exceed max_heap_size ({max})")]
    InitialExceedsMax { initial: usize, max: usize },
    #[error("max_marshal_depth must be at least 1")]
    ZeroMarshalDepth,
}

/// Settings applied when a thread's runtime is created.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// V8 heap ceiling in bytes
    pub max_heap_size: Option<usize>,
    /// Initial V8 heap size in bytes; needs `max_heap_size`
    pub initial_heap_size: Option<usize>,
    /// Nesting limit when copying host lists and dicts into the engine
    pub max_marshal_depth: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_heap_size: None,
            initial_heap_size: None,
            max_marshal_depth: 64,
        }
    }
}

impl RuntimeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_heap_size.is_some() && self.max_heap_size.is_none() {
            return Err(ConfigError::InitialWithoutMax);
        }
        if let (Some(initial), Some(max)) = (self.initial_heap_size, self.max_heap_size) {
            if initial > max {
                return Err(ConfigError::InitialExceedsMax { initial, max });
            }
        }
        if self.max_marshal_depth == 0 {
            return Err(ConfigError::ZeroMarshalDepth);
        }
        Ok(())
    }

    /// Isolate parameters, or `None` to use V8's defaults.
    pub(crate) fn create_params(&self) -> Option<deno_core::v8::CreateParams> {
        self.max_heap_size.map(|max| {
            deno_core::v8::CreateParams::default()
                .heap_limits(self.initial_heap_size.unwrap_or(0), max)
        })
    }
}
