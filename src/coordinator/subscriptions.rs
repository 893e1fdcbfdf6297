//! Subscribed-channel bookkeeping and staleness detection.

use chrono::{Local, NaiveDateTime};
use std::collections::{HashMap, HashSet};

/// Health of one subscribed push channel. Staleness is tracked per
/// episode: one alarm when the channel goes quiet, none while it stays
/// quiet, armed again once data flows.
#[derive(Debug, Clone)]
pub struct ChannelHealth {
    pub last_update: NaiveDateTime,
    /// Set when the current silence episode has been alarmed
    pub silence_alarmed: bool,
    /// Set when the current stale-tick episode has been alarmed
    pub tick_stale: bool,
}

impl Default for ChannelHealth {
    fn default() -> Self {
        Self {
            last_update: Local::now().naive_local(),
            silence_alarmed: false,
            tick_stale: false,
        }
    }
}

impl ChannelHealth {
    /// Fresh data arrived: clear both episode latches.
    pub fn touch(&mut self) {
        self.last_update = Local::now().naive_local();
        self.silence_alarmed = false;
        self.tick_stale = false;
    }

    /// Check silence; returns true exactly once per episode. The window
    /// restarts so re-subscription retries keep their cadence.
    pub fn note_silence(&mut self, window_secs: i64) -> Option<bool> {
        let now = Local::now().naive_local();
        if (now - self.last_update).num_seconds() <= window_secs {
            return None;
        }
        self.last_update = now;
        let first = !self.silence_alarmed;
        self.silence_alarmed = true;
        Some(first)
    }

    /// A tick arrived but its payload timestamp is old; returns true
    /// exactly once per episode.
    pub fn note_stale_tick(&mut self) -> bool {
        let first = !self.tick_stale;
        self.tick_stale = true;
        first
    }
}

/// All channels one coordinator listens on.
#[derive(Debug, Default)]
pub struct Subscriptions {
    /// Market data channels with health tracking
    pub market: HashMap<String, ChannelHealth>,
    /// Order-update push channels with health tracking
    pub order_update: HashMap<String, ChannelHealth>,
    /// Trade response channels
    pub trade: HashSet<String>,
    /// Balance push channels
    pub balance: HashSet<String>,
}

impl Subscriptions {
    pub fn all_channels(&self) -> Vec<String> {
        self.market
            .keys()
            .chain(self.order_update.keys())
            .chain(self.trade.iter())
            .chain(self.balance.iter())
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn silence_alarms_once_per_episode() {
        let mut health = ChannelHealth::default();
        // nothing yet
        assert_eq!(health.note_silence(300), None);
        // simulate a long quiet period
        health.last_update = Local::now().naive_local() - Duration::seconds(600);
        assert_eq!(health.note_silence(300), Some(true));
        // still quiet after another window: re-subscribe but no new alarm
        health.last_update = Local::now().naive_local() - Duration::seconds(600);
        assert_eq!(health.note_silence(300), Some(false));
        // recovery re-arms the alarm
        health.touch();
        health.last_update = Local::now().naive_local() - Duration::seconds(600);
        assert_eq!(health.note_silence(300), Some(true));
    }

    #[test]
    fn stale_tick_alarms_once_per_episode() {
        let mut health = ChannelHealth::default();
        assert!(health.note_stale_tick());
        assert!(!health.note_stale_tick());
        health.touch();
        assert!(health.note_stale_tick());
    }
}
