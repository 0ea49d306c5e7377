//! Repository addressing and credentials.

use std::fmt;

use tokio::process::Command;

/// Environment variables that would override the password we pass.
const CONFLICTING_ENV: &[&str] = &["RESTIC_PASSWORD_FILE", "RESTIC_PASSWORD_COMMAND"];

/// Where a restic repository lives and how to unlock it.
#[derive(Clone)]
pub struct Repository {
    location: String,
    password: String,
    webdav: Option<(String, String)>,
    via_rclone: bool,
}

impl Repository {
    /// A repository addressed directly by restic (local path or native backend URL).
    pub fn new(location: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            password: password.into(),
            webdav: None,
            via_rclone: false,
        }
    }

    /// Reach the location through rclone's `webdav` remote.
    pub fn via_rclone_webdav(mut self) -> Self {
        self.via_rclone = true;
        self
    }

    /// WebDAV credentials. Only applied when both parts are non-empty.
    pub fn with_webdav_auth(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        let (user, password) = (user.into(), password.into());
        self.webdav = (!user.is_empty() && !password.is_empty()).then_some((user, password));
        self
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    /// Value for `RESTIC_REPOSITORY`.
    pub fn url(&self) -> String {
        if self.via_rclone {
            format!("rclone:webdav:{}", self.location)
        } else {
            self.location.clone()
        }
    }

    /// Set the environment restic reads the repository and secrets from.
    pub(crate) fn apply_env(&self, cmd: &mut Command) {
        for key in CONFLICTING_ENV {
            cmd.env_remove(key);
        }
        cmd.env("RESTIC_REPOSITORY", self.url());
        cmd.env("RESTIC_PASSWORD", &self.password);
        if let Some((user, password)) = &self.webdav {
            cmd.env("WEBDAV_USERNAME", user);
            cmd.env("WEBDAV_PASSWORD", password);
        }
    }
}

impl fmt::Debug for Repository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Repository")
            .field("url", &self.url())
            .field("password", &"[REDACTED]")
            .field("webdav_auth", &self.webdav.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url() {
        let local = Repository::new("/mnt/backup/repo", "pw");
        assert_eq!(local.url(), "/mnt/backup/repo");

        let remote = Repository::new("https://dav.example.com/backup", "pw").via_rclone_webdav();
        assert_eq!(remote.url(), "rclone:webdav:https://dav.example.com/backup");
    }

    #[test]
    fn test_webdav_auth_requires_both_parts() {
        let repo = Repository::new("/r", "pw").with_webdav_auth("me", "");
        assert!(repo.webdav.is_none());

        let repo = Repository::new("/r", "pw").with_webdav_auth("me", "secret");
        assert!(repo.webdav.is_some());
    }

    #[test]
    fn test_debug_hides_secrets() {
        let repo = Repository::new("/r", "hunter2").with_webdav_auth("me", "s3cret");
        let rendered = format!("{repo:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("s3cret"));
        assert!(rendered.contains("/r"));
    }
}
