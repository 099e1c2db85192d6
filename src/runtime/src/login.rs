//! Boot/login synchronizer.
//!
//! Detects the graphical login screen from monitor screenshots and types the
//! user's password with synthesized key presses. There is no feedback from the
//! guest beyond the screenshot, so key injection is purely timing based.

use testvm_core::error::{Result, VmError};
use testvm_core::LoginPolicy;

use crate::console::MonitorClient;

/// First pixels of the login screen's background, as they appear at the start
/// of the fourth line of a PPM screendump.
const LOGIN_SCREEN_SENTINEL: &[u8] = b"\"\"&";

/// Line of the screendump the sentinel is checked on (zero-based).
const SENTINEL_LINE: usize = 3;

pub struct LoginSynchronizer {
    client: MonitorClient,
    policy: LoginPolicy,
    password: String,
}

impl LoginSynchronizer {
    pub fn new(client: MonitorClient, policy: LoginPolicy, password: impl Into<String>) -> Self {
        Self {
            client,
            policy,
            password: password.into(),
        }
    }

    /// Poll screenshots until the login screen shows up.
    ///
    /// Returns the number of checks it took.
    pub async fn wait_for_login_screen(&self) -> Result<u32> {
        let attempts = self.policy.attempts;
        for attempt in 1..=attempts {
            if self.is_on_login_screen().await? {
                tracing::info!(attempt, "Login screen detected");
                return Ok(attempt);
            }
            if attempt < attempts {
                tracing::debug!(attempt, attempts, "Login screen not shown yet");
                tokio::time::sleep(self.policy.poll_interval()).await;
            }
        }

        let waited = self.policy.poll_interval() * attempts.saturating_sub(1);
        Err(VmError::ReadinessTimeout {
            target: "login screen".to_string(),
            waited_secs: waited.as_secs(),
        })
    }

    /// Take one screenshot and check it for the login screen.
    pub async fn is_on_login_screen(&self) -> Result<bool> {
        let capture = tempfile::Builder::new()
            .prefix("testvm-screendump-")
            .suffix(".ppm")
            .tempfile()?;
        self.client.screendump(capture.path()).await?;
        let content = std::fs::read(capture.path())?;
        Ok(is_login_screen(&content))
    }

    /// Confirm the greeter, type the password, and submit.
    ///
    /// Returns the number of key events sent (`password length + 2`).
    pub async fn log_in(&self) -> Result<usize> {
        let keys = password_keys(&self.password)?;

        self.client.send_key("ret").await?;
        tokio::time::sleep(self.policy.confirm_delay()).await;
        for key in &keys {
            self.client.send_key(key).await?;
            tokio::time::sleep(self.policy.key_delay()).await;
        }
        self.client.send_key("ret").await?;

        tracing::info!("Login keys sent");
        Ok(keys.len() + 2)
    }
}

/// Check a screendump for the login screen sentinel.
pub fn is_login_screen(capture: &[u8]) -> bool {
    split_lines(capture)
        .nth(SENTINEL_LINE)
        .is_some_and(|line| line.starts_with(LOGIN_SCREEN_SENTINEL))
}

/// Split on `\n`, `\r\n` and lone `\r`, dropping the terminators.
fn split_lines(bytes: &[u8]) -> impl Iterator<Item = &[u8]> {
    let mut rest = bytes;
    std::iter::from_fn(move || {
        if rest.is_empty() {
            return None;
        }
        match rest.iter().position(|&b| b == b'\n' || b == b'\r') {
            Some(i) => {
                let line = &rest[..i];
                let skip = if rest[i] == b'\r' && rest.get(i + 1) == Some(&b'\n') {
                    2
                } else {
                    1
                };
                rest = &rest[i + skip..];
                Some(line)
            }
            None => {
                let line = rest;
                rest = &[];
                Some(line)
            }
        }
    })
}

/// Translate password characters into monitor `sendkey` names.
pub fn password_keys(password: &str) -> Result<Vec<String>> {
    password
        .chars()
        .map(|c| {
            key_name(c).ok_or_else(|| {
                VmError::Config(format!("password character {:?} cannot be typed", c))
            })
        })
        .collect()
}

/// Monitor key name for a character, if it can be typed on a US layout.
pub fn key_name(c: char) -> Option<String> {
    if c.is_ascii_lowercase() || c.is_ascii_digit() {
        return Some(c.to_string());
    }
    if c.is_ascii_uppercase() {
        return Some(format!("shift-{}", c.to_ascii_lowercase()));
    }
    let name = match c {
        ' ' => "spc",
        '-' => "minus",
        '=' => "equal",
        '.' => "dot",
        ',' => "comma",
        '/' => "slash",
        ';' => "semicolon",
        '\'' => "apostrophe",
        '`' => "grave_accent",
        '[' => "bracket_left",
        ']' => "bracket_right",
        '\\' => "backslash",
        '!' => "shift-1",
        '@' => "shift-2",
        '#' => "shift-3",
        '$' => "shift-4",
        '%' => "shift-5",
        '^' => "shift-6",
        '&' => "shift-7",
        '*' => "shift-8",
        '(' => "shift-9",
        ')' => "shift-0",
        '_' => "shift-minus",
        '+' => "shift-equal",
        ':' => "shift-semicolon",
        '"' => "shift-apostrophe",
        '?' => "shift-slash",
        '<' => "shift-comma",
        '>' => "shift-dot",
        '~' => "shift-grave_accent",
        '{' => "shift-bracket_left",
        '}' => "shift-bracket_right",
        '|' => "shift-backslash",
        _ => return None,
    };
    Some(name.to_string())
}
