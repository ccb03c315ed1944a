use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ClockStatus {
    Stopped,
    Running,
}

impl Default for ClockStatus {
    fn default() -> Self {
        ClockStatus::Stopped
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Visibility {
    Visible,
    Hidden,
}

impl Default for Visibility {
    fn default() -> Self {
        Visibility::Visible
    }
}

/// Activity Clock and Visibility Monitor state.
///
/// `pending_seconds` is the in-memory counter: active seconds observed since
/// the last successful checkpoint. It is never persisted directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityState {
    pub status: ClockStatus,
    pub visibility: Visibility,
    pub pending_seconds: u64,
    /// Set when the tab was hidden at any point since the last checkpoint.
    pub hidden_in_window: bool,
    pub idle_seconds: u64,
    #[serde(skip)]
    idle_timeout_secs: Option<u64>,
}

impl Default for ActivityState {
    fn default() -> Self {
        Self {
            status: ClockStatus::Stopped,
            visibility: Visibility::Visible,
            pending_seconds: 0,
            hidden_in_window: false,
            idle_seconds: 0,
            idle_timeout_secs: None,
        }
    }
}

impl ActivityState {
    pub fn new(idle_timeout_secs: Option<u64>) -> Self {
        Self {
            idle_timeout_secs,
            ..Self::default()
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == ClockStatus::Running
    }

    pub fn is_visible(&self) -> bool {
        self.visibility == Visibility::Visible
    }

    pub fn is_idle(&self) -> bool {
        self.idle_timeout_secs
            .map(|timeout| self.idle_seconds >= timeout)
            .unwrap_or(false)
    }

    /// The Visibility Monitor's `isActive` flag combined with idle detection.
    pub fn is_active(&self) -> bool {
        self.is_visible() && !self.is_idle()
    }

    pub fn start(&mut self) {
        self.status = ClockStatus::Running;
        self.pending_seconds = 0;
        self.hidden_in_window = !self.is_visible();
        self.idle_seconds = 0;
    }

    pub fn stop(&mut self) {
        self.status = ClockStatus::Stopped;
        self.pending_seconds = 0;
    }

    /// One second elapsed. Counts only while running, visible and not idle.
    pub fn tick(&mut self) {
        if !self.is_running() {
            return;
        }
        if self.is_active() {
            self.pending_seconds = self.pending_seconds.saturating_add(1);
        }
        self.idle_seconds = self.idle_seconds.saturating_add(1);
    }

    /// Returns true when this call changed the visibility.
    pub fn set_visibility(&mut self, visibility: Visibility) -> bool {
        if self.visibility == visibility {
            return false;
        }
        self.visibility = visibility;
        if visibility == Visibility::Hidden {
            self.hidden_in_window = true;
        } else {
            self.idle_seconds = 0;
        }
        true
    }

    pub fn record_input(&mut self) {
        self.idle_seconds = 0;
    }

    /// Whether the window that ends now stayed in the foreground throughout.
    pub fn window_was_active(&self) -> bool {
        !self.hidden_in_window
    }

    /// Called after the counter was durably checkpointed.
    pub fn reset_window(&mut self) {
        self.pending_seconds = 0;
        self.hidden_in_window = !self.is_visible();
    }
}
