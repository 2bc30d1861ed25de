//! `loopwire config`: Print the default configuration or its location.

use loopwire_config::AppConfig;

pub fn run(path: bool) -> Result<(), Box<dyn std::error::Error>> {
    if path {
        println!("{}", config_path().display());
    } else {
        print!("{}", AppConfig::default_toml());
    }
    Ok(())
}

fn config_path() -> std::path::PathBuf {
    AppConfig::config_dir().join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_path_is_valid() {
        let path = config_path();
        assert!(path.to_str().unwrap().ends_with("config.toml"));
    }

    #[test]
    fn default_toml_round_trips() {
        let parsed: Result<AppConfig, _> = toml_roundtrip(&AppConfig::default_toml());
        assert!(parsed.is_ok());
    }

    fn toml_roundtrip(text: &str) -> Result<AppConfig, Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let file = dir.path().join("config.toml");
        std::fs::write(&file, text)?;
        Ok(AppConfig::load_from(&file)?)
    }
}
