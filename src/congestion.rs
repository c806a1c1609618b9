//! Congestion detection for the reliable channel.
//!
//! This is not congestion *control* in the TCP sense: there is no congestion window. The channel
//!  only switches between a regular and a reduced flush rate, based on measured RTT. The point of
//!  the logic here is to avoid rapid oscillation between the two modes:
//!
//! * RTT at or above the threshold switches to congestion mode immediately
//! * leaving congestion mode requires good RTT for an uninterrupted 'disable interval'
//! * re-entering congestion mode shortly after the previous switch doubles the disable interval
//!    (up to a maximum)
//! * while not congested, the disable interval is halved (down to a minimum) for every recovery
//!    interval of good conditions

use std::cmp::{max, min};
use std::time::Duration;
use tracing::debug;
use crate::config::ReliableChannelConfig;

pub struct CongestionMonitor {
    rtt_threshold_millis: f32,
    switch_window: Duration,
    min_disable_interval: Duration,
    max_disable_interval: Duration,
    recovery_interval: Duration,

    congested: bool,
    timer: Duration,
    disable_interval: Duration,
    last_switch: Option<Duration>,
}

impl CongestionMonitor {
    pub fn new(config: &ReliableChannelConfig) -> CongestionMonitor {
        CongestionMonitor {
            rtt_threshold_millis: config.congestion_rtt_threshold.as_secs_f32() * 1000.0,
            switch_window: config.congestion_switch_window,
            min_disable_interval: config.congestion_min_disable_interval,
            max_disable_interval: config.congestion_max_disable_interval,
            recovery_interval: config.congestion_recovery_interval,
            congested: false,
            timer: Duration::ZERO,
            disable_interval: config.congestion_min_disable_interval,
            last_switch: None,
        }
    }

    pub fn is_congested(&self) -> bool {
        self.congested
    }

    pub fn disable_interval(&self) -> Duration {
        self.disable_interval
    }

    pub fn reset(&mut self) {
        self.congested = false;
        self.timer = Duration::ZERO;
        self.disable_interval = self.min_disable_interval;
        self.last_switch = None;
    }

    /// `elapsed` is the time since the previous call
    pub fn on_update(&mut self, time: Duration, elapsed: Duration, rtt_millis: f32) {
        let conditions_bad = rtt_millis >= self.rtt_threshold_millis;

        if conditions_bad {
            if !self.congested {
                if let Some(last_switch) = self.last_switch {
                    if time.saturating_sub(last_switch) < self.switch_window {
                        self.disable_interval = min(self.disable_interval * 2, self.max_disable_interval);
                    }
                }
                self.last_switch = Some(time);
                debug!("RTT {}ms -> entering congestion mode, disable interval is {:?}", rtt_millis, self.disable_interval);
            }

            self.congested = true;
            self.timer = Duration::ZERO;
        }
        else if self.congested {
            self.timer += elapsed;
            if self.timer >= self.disable_interval {
                debug!("RTT {}ms for {:?} -> leaving congestion mode", rtt_millis, self.timer);
                self.congested = false;
                self.last_switch = Some(time);
                self.timer = Duration::ZERO;
            }
        }
        else {
            self.timer += elapsed;
            if self.timer >= self.recovery_interval {
                self.disable_interval = max(self.disable_interval / 2, self.min_disable_interval);
                self.timer = Duration::ZERO;
            }
        }
    }
}
