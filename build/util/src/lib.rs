// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use std::env;
use std::path::PathBuf;

/// Returns the directory build scripts should write generated sources into.
pub fn out_dir() -> PathBuf {
    PathBuf::from(env::var_os("OUT_DIR").expect("OUT_DIR not set"))
}

/// Reads an environment variable and asks cargo to rerun the build script
/// when it changes.
pub fn env_var(var: &str) -> Result<String> {
    println!("cargo:rerun-if-env-changed={var}");
    env::var(var).with_context(|| format!("reading ${var}"))
}

///
/// Loads the board configuration for a build script.
///
/// If the environment variable `var` is set, it names the toml file to load;
/// otherwise `default` (relative to the crate being built) is used. As with
/// any serde-driven config, `T` only needs to describe the parts of the file
/// the caller cares about.
///
pub fn board_config<T: DeserializeOwned>(
    var: &str,
    default: &str,
) -> Result<T> {
    let path = match env_var(var) {
        Ok(path) => PathBuf::from(path),
        Err(_) => {
            let manifest = env::var_os("CARGO_MANIFEST_DIR")
                .context("CARGO_MANIFEST_DIR not set")?;
            PathBuf::from(manifest).join(default)
        }
    };
    println!("cargo:rerun-if-changed={}", path.display());

    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    println!("--- board config {} ---", path.display());
    println!("{text}");
    toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}
