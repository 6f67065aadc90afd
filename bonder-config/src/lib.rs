// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! File-backed configuration loading shared by the bonder binaries.

use anyhow::{anyhow, Context, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Yaml,
    Json,
}

fn format_of(path: &Path) -> Format {
    match path.extension().and_then(|s| s.to_str()) {
        Some("yaml") | Some("yml") => Format::Yaml,
        _ => Format::Json,
    }
}

// Any serde type can be loaded from / saved to a yaml or json file.
pub trait Config: Serialize + DeserializeOwned {
    fn persisted(self, path: &Path) -> PersistedConfig<Self>
    where
        Self: Sized,
    {
        PersistedConfig {
            inner: self,
            path: path.to_path_buf(),
        }
    }

    fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = match format_of(path) {
            Format::Yaml => serde_yaml::from_str(&content)
                .map_err(|e| anyhow!("Invalid yaml config {}: {}", path.display(), e))?,
            Format::Json => serde_json::from_str(&content)
                .map_err(|e| anyhow!("Invalid json config {}: {}", path.display(), e))?,
        };
        Ok(config)
    }

    fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = match format_of(path) {
            Format::Yaml => serde_yaml::to_string(self)?,
            Format::Json => serde_json::to_string_pretty(self)?,
        };
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;
        Ok(())
    }
}

pub struct PersistedConfig<C> {
    inner: C,
    path: PathBuf,
}

impl<C: Config> PersistedConfig<C> {
    pub fn read(&self) -> Result<C> {
        C::load(&self.path)
    }

    pub fn save(&self) -> Result<()> {
        self.inner.save(&self.path)
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }
}
