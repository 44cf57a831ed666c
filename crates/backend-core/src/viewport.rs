use crate::types::{ScrollDirective, ScrollMetrics};

/// Distance from the bottom under which the view counts as "at bottom".
pub const AT_BOTTOM_THRESHOLD_PX: f64 = 40.0;
/// Distance from the bottom over which the scroll-to-bottom button shows.
pub const SHOW_SCROLL_BUTTON_THRESHOLD_PX: f64 = 200.0;
/// Offset from the top under which older messages are requested.
pub const LOAD_MORE_THRESHOLD_PX: f64 = 100.0;

/// Message-window flags the viewport needs before asking for older pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadGate {
    pub initial_loading: bool,
    pub loading_more: bool,
    pub has_more: bool,
}

impl LoadGate {
    fn allows_load(self) -> bool {
        !self.initial_loading && !self.loading_more && self.has_more
    }
}

/// Outcome of one scroll event.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ScrollOutcome {
    /// Request the next older page.
    pub load_more: bool,
    /// The view is at the bottom; run a read check.
    pub read_check: bool,
    /// New visibility of the scroll-to-bottom button, when it changed.
    pub show_button: Option<bool>,
}

/// Outcome of rendering a changed message window.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RenderOutcome {
    /// Scroll offset that keeps the previously visible message in place.
    pub restore_scroll_top: Option<f64>,
    /// The view was at the bottom and must follow new content.
    pub scroll_to_bottom: bool,
    /// The view is (again) at the bottom; run a read check.
    pub reached_bottom: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct PrependAnchor {
    scroll_height: f64,
    scroll_top: f64,
}

/// Scroll position state machine for the message list.
#[derive(Debug, Clone)]
pub struct ViewportController {
    at_bottom: bool,
    show_button: bool,
    anchor: Option<PrependAnchor>,
    top_armed: bool,
    first_message_id: Option<i64>,
}

impl Default for ViewportController {
    fn default() -> Self {
        Self {
            at_bottom: true,
            show_button: false,
            anchor: None,
            top_armed: true,
            first_message_id: None,
        }
    }
}

impl ViewportController {
    pub fn at_bottom(&self) -> bool {
        self.at_bottom
    }

    pub fn show_button(&self) -> bool {
        self.show_button
    }

    pub fn has_anchor(&self) -> bool {
        self.anchor.is_some()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn on_scroll(&mut self, metrics: ScrollMetrics, gate: LoadGate) -> ScrollOutcome {
        let mut outcome = ScrollOutcome {
            show_button: self.update_position(metrics),
            ..ScrollOutcome::default()
        };
        outcome.read_check = self.at_bottom;

        if metrics.scroll_top < LOAD_MORE_THRESHOLD_PX {
            if self.top_armed && gate.allows_load() {
                self.anchor = Some(PrependAnchor {
                    scroll_height: metrics.scroll_height,
                    scroll_top: metrics.scroll_top,
                });
                self.top_armed = false;
                outcome.load_more = true;
            }
        } else {
            self.top_armed = true;
        }

        outcome
    }

    /// Called after the UI rendered a window whose oldest message is
    /// `first_message_id`.
    ///
    /// The prepend anchor is only consumed once older messages actually
    /// landed at the top; bottom appends leave it in place.
    pub fn on_content_changed(
        &mut self,
        first_message_id: Option<i64>,
        metrics: ScrollMetrics,
    ) -> RenderOutcome {
        let prepended = matches!(
            (first_message_id, self.first_message_id),
            (Some(now), Some(before)) if now < before
        );
        self.first_message_id = first_message_id;
        let mut outcome = RenderOutcome::default();

        if prepended && let Some(anchor) = self.anchor.take() {
            outcome.restore_scroll_top =
                Some(anchor.scroll_top + (metrics.scroll_height - anchor.scroll_height));
            self.top_armed = true;
            return outcome;
        }

        if self.at_bottom {
            outcome.scroll_to_bottom = true;
            outcome.reached_bottom = true;
        }
        outcome
    }

    /// Drop a held anchor, e.g. after a failed older-page load.
    pub fn clear_anchor(&mut self) {
        if self.anchor.take().is_some() {
            self.top_armed = true;
        }
    }

    pub fn scroll_to_bottom(&self, smooth: bool) -> ScrollDirective {
        ScrollDirective::ScrollToBottom { smooth }
    }

    /// The UI finished a scroll-to-bottom. Returns whether to run a read check
    /// and the new button visibility when it changed.
    pub fn on_scroll_settled(&mut self, metrics: ScrollMetrics) -> (bool, Option<bool>) {
        let show_changed = self.update_position(metrics);
        (self.at_bottom, show_changed)
    }

    fn update_position(&mut self, metrics: ScrollMetrics) -> Option<bool> {
        let distance = metrics.distance_from_bottom();
        self.at_bottom = distance < AT_BOTTOM_THRESHOLD_PX;

        let show = distance > SHOW_SCROLL_BUTTON_THRESHOLD_PX;
        if show != self.show_button {
            self.show_button = show;
            Some(show)
        } else {
            None
        }
    }
}
