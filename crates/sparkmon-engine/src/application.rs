use sparkmon_core::events::{ApplicationEnd, ApplicationStart};
use sparkmon_core::views::ApplicationView;
use sparkmon_core::EpochMillis;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplicationChange {
    /// First application seen in the current epoch.
    Adopted,
    /// A different application started; engine ids restart from here.
    NewEpoch { epoch: u32, retire_at: EpochMillis },
    Duplicate,
}

/// Tracks the running application and the epoch that scopes engine ids.
#[derive(Debug, Clone, Default)]
pub struct ApplicationTracker {
    epoch: u32,
    current: Option<ApplicationView>,
    last_seen: Option<EpochMillis>,
}

impl ApplicationTracker {
    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    pub fn current(&self) -> Option<&ApplicationView> {
        self.current.as_ref()
    }

    /// Latest engine timestamp observed so far.
    pub fn last_seen(&self) -> Option<EpochMillis> {
        self.last_seen
    }

    pub fn observe(&mut self, ts: EpochMillis) {
        self.last_seen = Some(self.last_seen.map_or(ts, |seen| seen.max(ts)));
    }

    pub fn on_start(&mut self, event: &ApplicationStart) -> ApplicationChange {
        let view = ApplicationView {
            app_id: event.app_id.clone(),
            app_name: event.app_name.clone(),
            spark_user: event.spark_user.clone(),
            start_time: event.start_time,
            end_time: None,
        };
        let same_app = match &self.current {
            None => {
                self.current = Some(view);
                return ApplicationChange::Adopted;
            }
            Some(current) => {
                current.app_id == event.app_id
                    && (current.app_id.is_some() || current.start_time == event.start_time)
            }
        };
        if same_app {
            return ApplicationChange::Duplicate;
        }
        self.epoch += 1;
        self.current = Some(view);
        ApplicationChange::NewEpoch {
            epoch: self.epoch,
            retire_at: event.start_time,
        }
    }

    /// Records the end time. Returns false if the end was already known.
    pub fn on_end(&mut self, event: &ApplicationEnd) -> bool {
        let current = self.current.get_or_insert_with(|| ApplicationView {
            start_time: event.end_time,
            ..ApplicationView::default()
        });
        if current.end_time.is_some() {
            return false;
        }
        current.end_time = Some(event.end_time);
        true
    }

    /// Kernel restart: the next application gets a fresh epoch.
    pub fn restart(&mut self) -> u32 {
        self.epoch += 1;
        self.current = None;
        self.epoch
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start(app_id: Option<&str>, at: EpochMillis) -> ApplicationStart {
        ApplicationStart {
            start_time: at,
            app_id: app_id.map(str::to_string),
            app_name: Some("notebook".to_string()),
            app_attempt_id: None,
            spark_user: None,
        }
    }

    #[test]
    fn first_application_is_adopted_and_repeats_are_duplicates() {
        let mut tracker = ApplicationTracker::default();
        assert_eq!(
            tracker.on_start(&start(Some("app-1"), 10)),
            ApplicationChange::Adopted
        );
        assert_eq!(
            tracker.on_start(&start(Some("app-1"), 10)),
            ApplicationChange::Duplicate
        );
        assert_eq!(tracker.epoch(), 0);
    }

    #[test]
    fn different_application_opens_new_epoch() {
        let mut tracker = ApplicationTracker::default();
        tracker.on_start(&start(Some("app-1"), 10));
        assert!(tracker.on_end(&ApplicationEnd { end_time: 50 }));
        assert!(!tracker.on_end(&ApplicationEnd { end_time: 51 }));
        assert_eq!(
            tracker.on_start(&start(Some("app-2"), 60)),
            ApplicationChange::NewEpoch {
                epoch: 1,
                retire_at: 60
            }
        );
        assert_eq!(tracker.current().and_then(|app| app.end_time), None);
    }

    #[test]
    fn restart_clears_application_and_bumps_epoch() {
        let mut tracker = ApplicationTracker::default();
        tracker.on_start(&start(None, 10));
        tracker.observe(40);
        tracker.observe(30);
        assert_eq!(tracker.last_seen(), Some(40));
        assert_eq!(tracker.restart(), 1);
        assert!(tracker.current().is_none());
        assert_eq!(
            tracker.on_start(&start(None, 10)),
            ApplicationChange::Adopted
        );
    }
}
