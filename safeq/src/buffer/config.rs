use serde_derive::{Deserialize, Serialize};

use crate::errors::SafeqError;

pub const DEFAULT_BUFFER_NAME: &str = "buffer";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Used for worker thread names and log events.
    pub name: String,
    // 0 makes the channel a rendezvous: a send completes only when the other side takes it.
    pub entry_capacity: usize,
    pub exit_capacity: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        BufferConfig {
            name: DEFAULT_BUFFER_NAME.to_string(),
            entry_capacity: 0,
            exit_capacity: 0,
        }
    }
}

impl BufferConfig {
    pub fn builder() -> BufferConfigBuilder {
        BufferConfigBuilder::default()
    }

    pub fn validate(&self) -> Result<(), SafeqError> {
        if self.name.trim().is_empty() {
            return Err(SafeqError::Logic("buffer name must not be empty".to_string()));
        }
        if self.name.contains('\0') {
            return Err(SafeqError::Logic("buffer name must not contain NUL".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct BufferConfigBuilder {
    name: Option<String>,
    entry_capacity: Option<usize>,
    exit_capacity: Option<usize>,
}

impl BufferConfigBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn entry_capacity(mut self, capacity: usize) -> Self {
        self.entry_capacity = Some(capacity);
        self
    }

    pub fn exit_capacity(mut self, capacity: usize) -> Self {
        self.exit_capacity = Some(capacity);
        self
    }

    pub fn build(self) -> Result<BufferConfig, SafeqError> {
        let defaults = BufferConfig::default();
        let cfg = BufferConfig {
            name: self.name.unwrap_or(defaults.name),
            entry_capacity: self.entry_capacity.unwrap_or(defaults.entry_capacity),
            exit_capacity: self.exit_capacity.unwrap_or(defaults.exit_capacity),
        };
        cfg.validate()?;
        Ok(cfg)
    }
}
