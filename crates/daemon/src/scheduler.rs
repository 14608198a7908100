// Recurring-task timers. Each armed task gets one interval loop that sends
// its id on the tick channel; the hub drains the channel and runs the task.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

pub type TaskTicks = mpsc::UnboundedReceiver<String>;

pub struct TaskScheduler {
    ticks: mpsc::UnboundedSender<String>,
    timers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl TaskScheduler {
    pub fn new() -> (Self, TaskTicks) {
        let (ticks, rx) = mpsc::unbounded_channel();
        (Self { ticks, timers: Mutex::new(HashMap::new()) }, rx)
    }

    fn timers(&self) -> MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start (or restart) the timer for `task_id`. The first tick fires one
    /// full period from now.
    pub fn arm(&self, task_id: &str, interval_minutes: u32) {
        self.arm_every(task_id, Duration::from_secs(u64::from(interval_minutes.max(1)) * 60));
    }

    pub fn arm_every(&self, task_id: &str, period: Duration) {
        let ticks = self.ticks.clone();
        let id = task_id.to_string();
        let timer = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                debug!(task_id = %id, "task tick");
                if ticks.send(id.clone()).is_err() {
                    break;
                }
            }
        });
        if let Some(previous) = self.timers().insert(task_id.to_string(), timer) {
            previous.abort();
        }
        info!(task_id, period_secs = period.as_secs(), "task armed");
    }

    pub fn disarm(&self, task_id: &str) -> bool {
        match self.timers().remove(task_id) {
            Some(timer) => {
                timer.abort();
                info!(task_id, "task disarmed");
                true
            }
            None => false,
        }
    }

    pub fn is_armed(&self, task_id: &str) -> bool {
        self.timers().contains_key(task_id)
    }

    pub fn armed(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.timers().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn shutdown(&self) {
        for (_, timer) in self.timers().drain() {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn armed_task_ticks_every_period() {
        let (scheduler, mut ticks) = TaskScheduler::new();
        scheduler.arm("r1", 5);

        tokio::time::sleep(Duration::from_secs(299)).await;
        assert!(ticks.try_recv().is_err(), "no tick before the first period");

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(ticks.try_recv().ok().as_deref(), Some("r1"));

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(ticks.try_recv().ok().as_deref(), Some("r1"));
    }

    #[tokio::test(start_paused = true)]
    async fn disarm_stops_ticks_and_rearm_replaces_timer() {
        let (scheduler, mut ticks) = TaskScheduler::new();
        scheduler.arm_every("r1", Duration::from_secs(10));
        scheduler.arm_every("r1", Duration::from_secs(10));
        assert_eq!(scheduler.armed(), vec!["r1".to_string()]);

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(ticks.try_recv().is_ok());
        assert!(ticks.try_recv().is_err(), "replaced timer does not double-fire");

        assert!(scheduler.disarm("r1"));
        assert!(!scheduler.is_armed("r1"));
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(ticks.try_recv().is_err());
    }
}
