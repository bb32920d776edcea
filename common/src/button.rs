use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc,
};

use crate::{config::DEBOUNCE_WINDOW_MS, state::DeviceState};

/// Debounced falling-edge handler for the active-low button.
///
/// `on_falling_edge` runs in interrupt context: it never blocks, allocates,
/// logs or touches I/O.
#[derive(Debug)]
pub struct ButtonMonitor {
    state: Arc<DeviceState>,
    has_accepted: AtomicBool,
    last_accepted_ms: AtomicU32,
}

impl ButtonMonitor {
    pub fn new(state: Arc<DeviceState>) -> Self {
        Self {
            state,
            has_accepted: AtomicBool::new(false),
            last_accepted_ms: AtomicU32::new(0),
        }
    }

    pub fn state(&self) -> &Arc<DeviceState> {
        &self.state
    }

    /// Returns `true` if the edge was accepted as a press.
    pub fn on_falling_edge(&self, now_ms: u32) -> bool {
        if self.has_accepted.load(Ordering::Acquire) {
            let since = now_ms.wrapping_sub(self.last_accepted_ms.load(Ordering::Acquire));
            if since <= DEBOUNCE_WINDOW_MS {
                return false;
            }
        }

        self.last_accepted_ms.store(now_ms, Ordering::Release);
        self.has_accepted.store(true, Ordering::Release);
        self.state.push_press();
        self.state.touch(now_ms);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> ButtonMonitor {
        ButtonMonitor::new(Arc::new(DeviceState::new(0)))
    }

    #[test]
    fn bounce_inside_window_is_dropped() {
        let monitor = monitor();
        assert!(monitor.on_falling_edge(0));
        assert!(!monitor.on_falling_edge(150));
        assert_eq!(monitor.state().pending(), 1);
    }

    #[test]
    fn edges_outside_window_are_separate_presses() {
        let monitor = monitor();
        assert!(monitor.on_falling_edge(0));
        assert!(monitor.on_falling_edge(350));
        assert_eq!(monitor.state().pending(), 2);
    }

    #[test]
    fn window_is_measured_from_last_accepted_edge() {
        let monitor = monitor();
        assert!(monitor.on_falling_edge(1_000));
        assert!(!monitor.on_falling_edge(1_200));
        assert!(!monitor.on_falling_edge(1_300));
        assert!(monitor.on_falling_edge(1_301));
        assert_eq!(monitor.state().pending(), 2);
    }

    #[test]
    fn accepted_press_refreshes_activity() {
        let monitor = monitor();
        monitor.on_falling_edge(4_242);
        assert_eq!(monitor.state().last_activity_ms(), 4_242);

        monitor.on_falling_edge(4_300);
        assert_eq!(monitor.state().last_activity_ms(), 4_242);
    }

    #[test]
    fn debounce_survives_clock_wrap() {
        let monitor = monitor();
        assert!(monitor.on_falling_edge(u32::MAX - 100));
        assert!(!monitor.on_falling_edge(50));
        assert!(monitor.on_falling_edge(250));
    }

    #[test]
    fn pending_matches_accepted_edges_for_any_sequence() {
        let sequences: [&[u32]; 4] = [
            &[0, 10, 20, 400, 401, 702, 1_500],
            &[5, 306, 607, 908],
            &[100, 100, 100],
            &[],
        ];

        for edges in sequences {
            let monitor = monitor();
            let mut expected = 0_u32;
            let mut last: Option<u32> = None;
            for &t in edges {
                if last.map_or(true, |prev| t - prev > DEBOUNCE_WINDOW_MS) {
                    expected += 1;
                    last = Some(t);
                }
                monitor.on_falling_edge(t);
            }
            assert_eq!(monitor.state().pending(), expected, "edges {edges:?}");
        }
    }
}
