use std::path::PathBuf;

pub fn default_data_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => {
            let path = PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("snaplens");
            let _ = std::fs::create_dir_all(&path);
            path
        }
        None => PathBuf::from("."),
    }
}

pub fn default_settings_path() -> PathBuf {
    default_data_dir().join("settings.toml")
}

pub fn default_overlay_state_path() -> PathBuf {
    default_data_dir().join("overlay.toml")
}

pub fn default_answer_log_path() -> PathBuf {
    default_data_dir().join("answers.md")
}
