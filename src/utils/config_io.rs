use anyhow::Context;
use config::Config;
use serde::Deserialize;
use std::path::Path;

/// Reads a configuration file in any format the `config` crate recognises by
/// extension and deserializes it into `T`.
pub fn load_cfg<T: for<'a> Deserialize<'a>>(path: impl AsRef<Path>) -> anyhow::Result<T> {
    let path = path.as_ref();
    let cfg = Config::builder()
        .add_source(config::File::from(path))
        .build()
        .with_context(|| format!("failed to read engine config from {}", path.display()))?;

    cfg.try_deserialize()
        .with_context(|| format!("failed to deserialize engine config from {}", path.display()))
}
