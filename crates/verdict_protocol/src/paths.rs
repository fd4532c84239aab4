use std::path::PathBuf;
use std::sync::Once;

static CREATE_DIR_WARNED: Once = Once::new();

/// Resolve the Verdict home directory.
///
/// Priority:
/// 1) VERDICT_HOME
/// 2) HOME/USERPROFILE
/// 3) ./.verdict
pub fn verdict_home() -> PathBuf {
    if let Ok(override_path) = std::env::var("VERDICT_HOME") {
        return PathBuf::from(override_path);
    }
    if let Ok(home) = std::env::var("HOME").or_else(|_| std::env::var("USERPROFILE")) {
        return PathBuf::from(home).join(".verdict");
    }
    PathBuf::from(".").join(".verdict")
}

fn ensure_home_dir(home: &PathBuf) {
    if let Err(err) = std::fs::create_dir_all(home) {
        CREATE_DIR_WARNED.call_once(|| {
            eprintln!(
                "Warning: failed to create Verdict home directory {}: {}. Set VERDICT_HOME or pass --config-store.",
                home.display(),
                err
            );
        });
    }
}

/// Default configuration store path: ~/.verdict/verdict.sqlite
pub fn default_config_store_path() -> PathBuf {
    let home = verdict_home();
    ensure_home_dir(&home);
    home.join("verdict.sqlite")
}

/// Default scratch root for task data directories: ~/.verdict/tasks
pub fn default_scratch_root() -> PathBuf {
    let home = verdict_home();
    ensure_home_dir(&home);
    home.join("tasks")
}

/// Default logs directory: ~/.verdict/logs
pub fn default_logs_dir() -> PathBuf {
    let home = verdict_home();
    ensure_home_dir(&home);
    home.join("logs")
}
