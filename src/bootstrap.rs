//! Process bootstrap: base directory resolution and `.env` loading.

use std::path::PathBuf;

/// Base directory for all toolforge state (default: `~/.toolforge`).
///
/// `TOOLFORGE_BASE_DIR` overrides the location, which tests use to keep
/// artifacts inside a temp dir.
pub fn toolforge_base_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("TOOLFORGE_BASE_DIR")
        && !dir.trim().is_empty()
    {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".toolforge")
}

/// Path of the bootstrap `.env` file inside the base directory.
pub fn bootstrap_env_path() -> PathBuf {
    toolforge_base_dir().join(".env")
}

/// Load `.env` files into the process environment.
///
/// The working-directory `.env` is loaded first so it wins over the
/// base-directory one; dotenvy never overrides variables that are already set.
pub fn load_dotenv() {
    match dotenvy::dotenv() {
        Ok(path) => tracing::debug!(path = %path.display(), "Loaded .env"),
        Err(e) if e.not_found() => {}
        Err(e) => tracing::warn!("Failed to load .env: {}", e),
    }

    let base_env = bootstrap_env_path();
    if base_env.exists()
        && let Err(e) = dotenvy::from_path(&base_env)
    {
        tracing::warn!(path = %base_env.display(), "Failed to load bootstrap .env: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bootstrap_env_path_is_under_base_dir() {
        let path = bootstrap_env_path();
        assert!(path.ends_with(".env"));
        assert_eq!(path.parent(), Some(toolforge_base_dir().as_path()));
    }
}
