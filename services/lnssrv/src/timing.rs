//! Receive-window timing
//!
//! A downlink is only useful if it reaches the gateway before the device
//! closes its receive window. The watcher anchors on the uplink arrival
//! instant and answers, at each decision point, whether the work still
//! ahead (packaging and sending, optionally a queue poll) fits in the
//! remaining window time.

use std::time::{Duration, Instant};

use crate::device::Device;
use crate::region::RegionParams;

/// Window deadlines for one uplink
#[derive(Debug, Clone, Copy)]
pub struct TimeWatcher {
    start: Instant,
    receive_delay1: Duration,
    receive_delay2: Duration,
    join_accept_delay1: Duration,
    join_accept_delay2: Duration,
    /// Time reserved for packaging and sending the downlink
    package_budget: Duration,
    /// Time reserved for one cloud-to-device queue poll
    poll_budget: Duration,
}

/// Which receive window a downlink targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveWindow {
    First,
    Second,
}

impl TimeWatcher {
    /// Anchor a watcher at the uplink arrival instant. Device-specific
    /// delay overrides take precedence over the regional defaults.
    pub fn new(
        start: Instant,
        region: &RegionParams,
        device: Option<&Device>,
        package_budget: Duration,
        poll_budget: Duration,
    ) -> Self {
        let receive_delay1 = device
            .and_then(Device::receive_delay1)
            .unwrap_or(region.receive_delay1);
        let receive_delay2 = device
            .and_then(Device::receive_delay2)
            .unwrap_or(region.receive_delay2);
        Self {
            start,
            receive_delay1,
            receive_delay2,
            join_accept_delay1: region.join_accept_delay1,
            join_accept_delay2: region.join_accept_delay2,
            package_budget,
            poll_budget,
        }
    }

    pub fn receive_delay1(&self) -> Duration {
        self.receive_delay1
    }

    pub fn receive_delay2(&self) -> Duration {
        self.receive_delay1 + self.receive_delay2
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Time left until the second receive window opens
    pub fn time_to_second_window(&self) -> Duration {
        self.receive_delay2().saturating_sub(self.elapsed())
    }

    pub fn in_time_for_first_window(&self) -> bool {
        self.elapsed() + self.package_budget < self.receive_delay1
    }

    pub fn in_time_for_second_window(&self) -> bool {
        self.elapsed() + self.package_budget < self.receive_delay2()
    }

    pub fn in_time_for_join_first_window(&self) -> bool {
        self.elapsed() + self.package_budget < self.join_accept_delay1
    }

    pub fn in_time_for_join_second_window(&self) -> bool {
        self.elapsed() + self.package_budget < self.join_accept_delay1 + self.join_accept_delay2
    }

    /// Window the next data downlink should target, honoring the device
    /// preference when its window is still reachable
    pub fn select_window(&self, prefer_second: bool) -> Option<ReceiveWindow> {
        if !prefer_second && self.in_time_for_first_window() {
            Some(ReceiveWindow::First)
        } else if self.in_time_for_second_window() {
            Some(ReceiveWindow::Second)
        } else {
            None
        }
    }

    pub fn select_join_window(&self, prefer_second: bool) -> Option<ReceiveWindow> {
        if !prefer_second && self.in_time_for_join_first_window() {
            Some(ReceiveWindow::First)
        } else if self.in_time_for_join_second_window() {
            Some(ReceiveWindow::Second)
        } else {
            None
        }
    }

    /// Budget for one queue poll, or `None` when polling plus packaging no
    /// longer fits before the last window closes
    pub fn poll_timeout(&self) -> Option<Duration> {
        let needed = self.package_budget + self.poll_budget;
        if self.time_to_second_window() <= needed {
            None
        } else {
            Some(self.poll_budget)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::eu868;

    fn backdated(by: Duration) -> Instant {
        Instant::now().checked_sub(by).expect("monotonic clock too young")
    }

    fn watcher(elapsed: Duration) -> TimeWatcher {
        TimeWatcher::new(
            backdated(elapsed),
            &eu868(),
            None,
            Duration::from_millis(200),
            Duration::from_millis(200),
        )
    }

    #[test]
    fn fresh_uplink_fits_first_window() {
        let w = watcher(Duration::from_millis(100));
        assert!(w.in_time_for_first_window());
        assert_eq!(w.select_window(false), Some(ReceiveWindow::First));
    }

    #[test]
    fn late_uplink_falls_back_to_second_window() {
        // 900 ms elapsed + 200 ms budget misses RX1 at 1 s
        let w = watcher(Duration::from_millis(900));
        assert!(!w.in_time_for_first_window());
        assert_eq!(w.select_window(false), Some(ReceiveWindow::Second));
    }

    #[test]
    fn exhausted_budget_selects_no_window() {
        let w = watcher(Duration::from_millis(2900));
        assert_eq!(w.select_window(false), None);
    }

    #[test]
    fn second_window_preference_skips_first() {
        let w = watcher(Duration::from_millis(100));
        assert_eq!(w.select_window(true), Some(ReceiveWindow::Second));
    }

    #[test]
    fn poll_skipped_when_remaining_time_is_tight() {
        // 300 ms to the second window cannot cover 200 ms poll + 200 ms send
        let w = watcher(Duration::from_millis(2700));
        assert!(w.time_to_second_window() <= Duration::from_millis(300));
        assert!(w.poll_timeout().is_none());

        let w = watcher(Duration::from_millis(1000));
        assert_eq!(w.poll_timeout(), Some(Duration::from_millis(200)));
    }

    #[test]
    fn join_windows_use_join_delays() {
        // Way past RX1/RX2 but well within the 5 s join-accept delay
        let w = watcher(Duration::from_secs(4));
        assert!(w.in_time_for_join_first_window());
        assert_eq!(w.select_join_window(false), Some(ReceiveWindow::First));

        let w = watcher(Duration::from_millis(10_900));
        assert!(!w.in_time_for_join_second_window());
        assert_eq!(w.select_join_window(false), None);
    }

    #[test]
    fn device_delay_overrides_region_default() {
        use crate::collaborators::DeviceIdentity;
        use crate::device::Device;

        let identity = DeviceIdentity {
            dev_eui: "0000000000000010".parse().unwrap(),
            receive_delay1_secs: Some(5),
            ..DeviceIdentity::default()
        };
        let device = Device::from_identity(&identity);
        let w = TimeWatcher::new(
            backdated(Duration::from_secs(3)),
            &eu868(),
            Some(&device),
            Duration::from_millis(200),
            Duration::from_millis(200),
        );
        assert!(w.in_time_for_first_window());
    }
}
