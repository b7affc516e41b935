//! `fixloop init`: scaffold the config file and log directory.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use crate::io::config::{CONFIG_FILE, FixConfig, write_config};

/// Options for `init_project`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite an existing config file.
    pub force: bool,
}

/// Paths created by `init_project`.
#[derive(Debug, Clone)]
pub struct InitPaths {
    pub config_path: PathBuf,
    pub log_dir: PathBuf,
    pub gitignore_path: PathBuf,
}

/// Write the default `fixloop.toml` and the log directory into `root`.
///
/// Fails if the config exists unless `options.force` is set.
pub fn init_project(root: &Path, options: &InitOptions) -> Result<InitPaths> {
    let config_path = root.join(CONFIG_FILE);
    if config_path.exists() && !options.force {
        return Err(anyhow!(
            "fixloop init: {CONFIG_FILE} already exists (use --force to overwrite)"
        ));
    }

    let config = FixConfig::default();
    write_config(&config_path, &config)?;

    let log_dir = root.join(&config.run.log_dir);
    if log_dir.exists() && !log_dir.is_dir() {
        return Err(anyhow!(
            "fixloop init: {} exists but is not a directory",
            log_dir.display()
        ));
    }
    fs::create_dir_all(&log_dir)
        .with_context(|| format!("create directory {}", log_dir.display()))?;
    let gitignore_path = log_dir.join(".gitignore");
    fs::write(&gitignore_path, LOG_GITIGNORE)
        .with_context(|| format!("write file {}", gitignore_path.display()))?;

    Ok(InitPaths {
        config_path,
        log_dir,
        gitignore_path,
    })
}

const LOG_GITIGNORE: &str = "*\n";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::load_config;

    #[test]
    fn init_writes_loadable_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_project(temp.path(), &InitOptions { force: false }).expect("init");

        assert!(paths.config_path.is_file());
        assert!(paths.log_dir.is_dir());
        assert_eq!(fs::read_to_string(&paths.gitignore_path).expect("read"), "*\n");

        let loaded: FixConfig =
            toml::from_str(&fs::read_to_string(&paths.config_path).expect("read"))
                .expect("parse");
        assert_eq!(loaded, FixConfig::default());
        load_config(&paths.config_path).expect("load");
    }

    #[test]
    fn init_refuses_to_overwrite_without_force() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config_path = temp.path().join(CONFIG_FILE);
        fs::write(&config_path, "[loop]\nmax_iterations = 2\n").expect("write");

        let err = init_project(temp.path(), &InitOptions { force: false }).unwrap_err();
        assert!(err.to_string().contains("already exists"));
        assert_eq!(
            fs::read_to_string(&config_path).expect("read"),
            "[loop]\nmax_iterations = 2\n"
        );

        init_project(temp.path(), &InitOptions { force: true }).expect("force init");
        assert!(fs::read_to_string(&config_path).expect("read").contains("[build]"));
    }
}
