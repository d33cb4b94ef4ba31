use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const THEME_DARK: &str = "dark";
pub const THEME_LIGHT: &str = "light";

/// Process-wide session state: who is "logged in" and which theme is
/// active. The login check is a superficial email-shape gate, not a
/// security boundary. Persisted as a small JSON file and injected into the
/// worker instead of being read from ambient globals.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStore {
    path: PathBuf,
    account: Option<String>,
    theme: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionFile {
    account: Option<String>,
    theme: String,
}

impl SessionStore {
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut session = Self {
            path,
            account: None,
            theme: THEME_DARK.to_string(),
        };
        let Ok(raw) = std::fs::read_to_string(&session.path) else {
            return session;
        };
        if let Ok(parsed) = serde_json::from_str::<SessionFile>(&raw) {
            session.account = parsed
                .account
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty());
            if parsed.theme == THEME_LIGHT {
                session.theme = THEME_LIGHT.to_string();
            }
        }
        session
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn account(&self) -> Option<&str> {
        self.account.as_deref()
    }

    pub fn is_logged_in(&self) -> bool {
        self.account.is_some()
    }

    pub fn theme(&self) -> &str {
        &self.theme
    }

    /// Accepts anything shaped like `name@host.tld`; rejects the rest.
    pub fn login(&mut self, email: &str) -> anyhow::Result<bool> {
        let trimmed = email.trim();
        if !looks_like_email(trimmed) {
            return Ok(false);
        }
        self.account = Some(trimmed.to_string());
        self.save()?;
        Ok(true)
    }

    pub fn logout(&mut self) -> anyhow::Result<()> {
        self.account = None;
        self.save()
    }

    pub fn toggle_theme(&mut self) -> anyhow::Result<&str> {
        self.theme = if self.theme == THEME_DARK {
            THEME_LIGHT.to_string()
        } else {
            THEME_DARK.to_string()
        };
        self.save()?;
        Ok(&self.theme)
    }

    fn save(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let payload = SessionFile {
            account: self.account.clone(),
            theme: self.theme.clone(),
        };
        std::fs::write(
            &self.path,
            serde_json::to_string_pretty(&serde_json::to_value(&payload)?)?,
        )?;
        Ok(())
    }
}

fn looks_like_email(value: &str) -> bool {
    let Some((local, host)) = value.split_once('@') else {
        return false;
    };
    if local.is_empty() || host.contains('@') || value.contains(char::is_whitespace) {
        return false;
    }
    let Some((domain, tld)) = host.rsplit_once('.') else {
        return false;
    };
    !domain.is_empty() && tld.len() >= 2 && tld.chars().all(|ch| ch.is_ascii_alphabetic())
}

/// Serde helper kept close to the store so callers can render state rows.
pub fn session_summary(session: &SessionStore) -> Value {
    serde_json::json!({
        "account": session.account(),
        "theme": session.theme(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_requires_email_shape() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut session = SessionStore::load(temp.path().join("session.json"));

        assert!(!session.login("not-an-email")?);
        assert!(!session.login("two@at@host.com")?);
        assert!(!session.login("user@host")?);
        assert!(!session.login("user@host.c")?);
        assert!(!session.login("user@host.c0m")?);
        assert!(!session.is_logged_in());

        assert!(session.login("  user@example.com ")?);
        assert!(session.is_logged_in());
        assert_eq!(session.account(), Some("user@example.com"));
        Ok(())
    }

    #[test]
    fn session_persists_across_loads() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("session.json");
        let mut session = SessionStore::load(&path);
        session.login("user@example.com")?;
        session.toggle_theme()?;

        let reloaded = SessionStore::load(&path);
        assert_eq!(reloaded.account(), Some("user@example.com"));
        assert_eq!(reloaded.theme(), THEME_LIGHT);
        Ok(())
    }

    #[test]
    fn logout_clears_account_but_keeps_theme() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("session.json");
        let mut session = SessionStore::load(&path);
        session.login("user@example.com")?;
        session.toggle_theme()?;
        session.logout()?;

        let reloaded = SessionStore::load(&path);
        assert!(!reloaded.is_logged_in());
        assert_eq!(reloaded.theme(), THEME_LIGHT);
        Ok(())
    }

    #[test]
    fn summary_renders_account_and_theme() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut session = SessionStore::load(temp.path().join("session.json"));
        assert_eq!(
            session_summary(&session),
            serde_json::json!({"account": null, "theme": "dark"})
        );

        session.login("user@example.com")?;
        assert_eq!(
            session_summary(&session),
            serde_json::json!({"account": "user@example.com", "theme": "dark"})
        );
        Ok(())
    }

    #[test]
    fn theme_toggle_flips_between_dark_and_light() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut session = SessionStore::load(temp.path().join("session.json"));
        assert_eq!(session.theme(), THEME_DARK);
        assert_eq!(session.toggle_theme()?, THEME_LIGHT);
        assert_eq!(session.toggle_theme()?, THEME_DARK);
        Ok(())
    }
}
