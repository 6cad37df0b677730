//! Player configuration.
//!
//! Configuration is read from an optional TOML file; every key has a
//! default, and command line flags override whatever the file sets.
//!
//! ```toml
//! base_url = "https://cdn.example.com/audio/"
//! volume = 0.8
//! loop_mode = "all"
//! click_window_ms = 250
//! prefetch_ahead = 1
//! read_timeout_secs = 10
//! requests_per_second = 10
//! ```

use std::{fs, num::NonZeroU32, path::Path, time::Duration};

use serde::Deserialize;
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use url::Url;

use crate::{
    error::{Error, Result},
    state::LoopMode,
};

#[serde_as]
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Directory URL that track filenames are resolved against.
    pub base_url: Url,

    /// Initial volume, `0.0..=1.0`.
    pub volume: f32,

    pub loop_mode: LoopMode,

    /// Maximum delay between two clicks on a playlist row for them to
    /// count as a double click.
    #[serde(rename = "click_window_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub click_window: Duration,

    /// Number of upcoming tracks to prefetch once a track starts playing.
    pub prefetch_ahead: usize,

    /// Limit on individual network reads. Without one, a stalled read
    /// keeps its prefetch in progress indefinitely.
    #[serde(rename = "read_timeout_secs")]
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    pub read_timeout: Option<Duration>,

    /// Maximum number of track requests started per second.
    pub requests_per_second: NonZeroU32,

    #[serde(skip)]
    pub user_agent: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: Self::DEFAULT_BASE_URL
                .parse()
                .expect("default base url is invalid"),
            volume: 1.0,
            loop_mode: LoopMode::None,
            click_window: Self::DEFAULT_CLICK_WINDOW,
            prefetch_ahead: 1,
            read_timeout: None,
            requests_per_second: Self::DEFAULT_REQUESTS_PER_SECOND,
            user_agent: Self::user_agent(),
        }
    }
}

impl Config {
    const DEFAULT_BASE_URL: &'static str = "http://localhost:8000/audio/";
    const DEFAULT_CLICK_WINDOW: Duration = Duration::from_millis(250);
    const DEFAULT_REQUESTS_PER_SECOND: NonZeroU32 = NonZeroU32::MIN.saturating_add(9);

    /// Reads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not valid TOML, or
    /// holds invalid values.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    /// Parses configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for malformed TOML or invalid values.
    pub fn from_toml(text: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(text)?;
        config.normalize()?;
        Ok(config)
    }

    /// Sets the base URL, making sure relative filenames resolve below it.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the URL cannot be a base.
    pub fn set_base_url(&mut self, base_url: Url) -> Result<()> {
        self.base_url = base_url;
        self.normalize()
    }

    /// Checks and normalizes values, for use after setting fields
    /// directly.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for a base URL that cannot be a base or a
    /// volume that is not a number.
    pub fn normalize(&mut self) -> Result<()> {
        if self.base_url.cannot_be_a_base() {
            return Err(Error::invalid_argument(format!(
                "{} cannot be used as base url",
                self.base_url
            )));
        }

        // Without a trailing slash `Url::join` would replace the last path
        // segment instead of appending to it.
        if !self.base_url.path().ends_with('/') {
            let path = format!("{}/", self.base_url.path());
            self.base_url.set_path(&path);
        }

        if self.volume.is_nan() {
            return Err(Error::invalid_argument("volume is not a number"));
        }
        self.volume = self.volume.clamp(0.0, 1.0);

        Ok(())
    }

    /// `User-Agent` in the form `tapedeck/0.1.0 (Rust; linux/24.04)`.
    fn user_agent() -> String {
        let app_name = env!("CARGO_PKG_NAME");
        let app_version = env!("CARGO_PKG_VERSION");

        let os_name = match std::env::consts::OS {
            "macos" => "osx",
            other => other,
        };
        let os_version = sysinfo::System::os_version().unwrap_or_else(|| String::from("0"));

        // `;` and `/` would break the product token syntax.
        let os_version = os_version.replace(['/', ';'], "-");

        let user_agent = format!("{app_name}/{app_version} (Rust; {os_name}/{os_version})");
        trace!("user agent: {user_agent}");
        user_agent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_missing_keys() {
        let config = Config::from_toml("volume = 0.5").unwrap();
        assert!((config.volume - 0.5).abs() < f32::EPSILON);
        assert_eq!(config.click_window, Duration::from_millis(250));
        assert_eq!(config.loop_mode, LoopMode::None);
        assert_eq!(config.read_timeout, None);
        assert_eq!(config.requests_per_second.get(), 10);
        assert!(config.user_agent.starts_with("tapedeck/"));
    }

    #[test]
    fn parses_all_keys() {
        let config = Config::from_toml(
            r#"
            base_url = "https://cdn.example.com/audio"
            volume = 3.0
            loop_mode = "one"
            click_window_ms = 400
            prefetch_ahead = 2
            read_timeout_secs = 5
            requests_per_second = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.base_url.as_str(), "https://cdn.example.com/audio/");
        assert!((config.volume - 1.0).abs() < f32::EPSILON);
        assert_eq!(config.loop_mode, LoopMode::One);
        assert_eq!(config.click_window, Duration::from_millis(400));
        assert_eq!(config.prefetch_ahead, 2);
        assert_eq!(config.read_timeout, Some(Duration::from_secs(5)));
        assert_eq!(config.requests_per_second.get(), 3);
    }

    #[test]
    fn rejects_opaque_base_url() {
        let err = Config::from_toml(r#"base_url = "mailto:someone@example.com""#).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::InvalidArgument);
    }

    #[test]
    fn rejects_unknown_loop_mode() {
        assert!(Config::from_toml(r#"loop_mode = "shuffle""#).is_err());
    }
}
