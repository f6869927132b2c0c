use serde::{Deserialize, Serialize};

use crate::types::block::DEFAULT_BLOCK_SIZE;
use crate::types::{Result, TreeError};

/// Smallest block size a tree accepts.
pub const MIN_SUPPORTED_BLOCK_SIZE: usize = 256;
/// Largest block size a tree accepts.
pub const MAX_SUPPORTED_BLOCK_SIZE: usize = 1 << 24;

/// Configuration knobs for a tree.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TreeOptions {
    /// Block size of new nodes when the root carries no canonical size
    pub default_block_size: usize,
    /// Floor for downsizing; blocks never shrink below it
    pub min_block_size: usize,
    /// Ceiling for upsizing; content that does not fit splits instead
    pub max_block_size: usize,
    /// Nodes below this share of their capacity (0-100) try to merge
    pub merge_threshold_pct: u8,
}

impl Default for TreeOptions {
    fn default() -> Self {
        Self {
            default_block_size: DEFAULT_BLOCK_SIZE,
            min_block_size: DEFAULT_BLOCK_SIZE,
            max_block_size: DEFAULT_BLOCK_SIZE * 8,
            merge_threshold_pct: 50,
        }
    }
}

impl TreeOptions {
    /// Parses options from TOML; missing keys take their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let options: TreeOptions =
            toml::from_str(text).map_err(|err| TreeError::Config(err.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    /// Renders the options as TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self).map_err(|err| TreeError::Config(err.to_string()))
    }

    /// Checks sizes are powers of two, ordered, and within the supported range.
    pub fn validate(&self) -> Result<()> {
        for (name, size) in [
            ("default_block_size", self.default_block_size),
            ("min_block_size", self.min_block_size),
            ("max_block_size", self.max_block_size),
        ] {
            if !size.is_power_of_two() {
                return Err(TreeError::Config(format!(
                    "{name} = {size} is not a power of two"
                )));
            }
            if !(MIN_SUPPORTED_BLOCK_SIZE..=MAX_SUPPORTED_BLOCK_SIZE).contains(&size) {
                return Err(TreeError::Config(format!(
                    "{name} = {size} outside {MIN_SUPPORTED_BLOCK_SIZE}..={MAX_SUPPORTED_BLOCK_SIZE}"
                )));
            }
        }
        if self.min_block_size > self.default_block_size
            || self.default_block_size > self.max_block_size
        {
            return Err(TreeError::Config(
                "block sizes must satisfy min <= default <= max".into(),
            ));
        }
        if self.merge_threshold_pct > 100 {
            return Err(TreeError::Config(format!(
                "merge_threshold_pct = {} exceeds 100",
                self.merge_threshold_pct
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        TreeOptions::default().validate().unwrap();
    }

    #[test]
    fn toml_overrides_selected_keys() {
        let options = TreeOptions::from_toml_str(
            r#"
            default_block_size = 1024
            min_block_size = 512
            "#,
        )
        .unwrap();
        assert_eq!(options.default_block_size, 1024);
        assert_eq!(options.min_block_size, 512);
        assert_eq!(options.max_block_size, TreeOptions::default().max_block_size);
        let text = options.to_toml_string().unwrap();
        assert_eq!(TreeOptions::from_toml_str(&text).unwrap(), options);
    }

    #[test]
    fn validation_rejects_bad_sizes() {
        let bad = [
            TreeOptions {
                default_block_size: 1000,
                ..TreeOptions::default()
            },
            TreeOptions {
                min_block_size: 128,
                ..TreeOptions::default()
            },
            TreeOptions {
                min_block_size: 16384,
                ..TreeOptions::default()
            },
            TreeOptions {
                merge_threshold_pct: 101,
                ..TreeOptions::default()
            },
        ];
        for options in bad {
            assert!(matches!(options.validate(), Err(TreeError::Config(_))));
        }
        assert!(TreeOptions::from_toml_str("max_block_size = \"big\"").is_err());
    }
}
