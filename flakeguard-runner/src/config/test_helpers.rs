// Copyright (c) The flakeguard Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::FlakeguardConfig;
use camino::Utf8PathBuf;
use camino_tempfile::Utf8TempDir;

/// Writes `config_contents` to the default config location in `workspace_dir`, and returns the
/// workspace root.
pub(crate) fn temp_workspace(workspace_dir: &Utf8TempDir, config_contents: &str) -> Utf8PathBuf {
    let root = workspace_dir.path().to_owned();
    let config_path = root.join(FlakeguardConfig::CONFIG_PATH);
    let config_dir = config_path.parent().expect("config path has a parent");
    std::fs::create_dir_all(config_dir).expect("created config dir");
    std::fs::write(&config_path, config_contents).expect("wrote config file");
    root
}
