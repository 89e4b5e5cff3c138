use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct LoadedLibraryConfig {
    pub path: String,
    pub base_address: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct GadgetLibraryConfig {
    pub path: String,
    #[serde(default = "default_max_gadget_length")]
    pub max_gadget_length: usize,
    pub sample_size: Option<usize>,
    pub base_address: Option<u64>,
    /// Placed after the primary binary unless they carry their own base.
    pub loaded_libraries: Option<Vec<LoadedLibraryConfig>>,
}

fn default_max_gadget_length() -> usize {
    4
}

impl GadgetLibraryConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            max_gadget_length: default_max_gadget_length(),
            sample_size: None,
            base_address: None,
            loaded_libraries: None,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_gadget_length == 0 {
            return Err(ConfigError::Invalid { field: "library.max_gadget_length", reason: "must be positive".into() });
        }
        if self.sample_size == Some(0) {
            return Err(ConfigError::Invalid { field: "library.sample_size", reason: "must be positive".into() });
        }
        Ok(())
    }
}
