use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::models::Timestamp;

/// Named one-shot alarms. Firing is reported back to the engine out of band
/// (for [`TokioAlarm`], as the alarm name on a channel).
pub trait Alarm: Send + Sync {
    fn arm(&self, name: &str, when: Timestamp);
    fn cancel(&self, name: &str);
    fn get(&self, name: &str) -> Option<Timestamp>;
}

/// Alarm backed by tokio timers. Pending alarms do not survive the process,
/// which is why the scheduler re-derives its deadline on every startup.
pub struct TokioAlarm {
    handle: Handle,
    sender: mpsc::UnboundedSender<String>,
    pending: Mutex<HashMap<String, (Timestamp, JoinHandle<()>)>>,
}

impl TokioAlarm {
    pub fn new(handle: Handle) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                handle,
                sender,
                pending: Mutex::new(HashMap::new()),
            },
            receiver,
        )
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<String, (Timestamp, JoinHandle<()>)>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Alarm for TokioAlarm {
    fn arm(&self, name: &str, when: Timestamp) {
        let delay = (when - Utc::now().timestamp_millis()).max(0) as u64;
        let sender = self.sender.clone();
        let alarm_name = name.to_string();
        let task = self.handle.spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            let _ = sender.send(alarm_name);
        });
        if let Some((_, previous)) = self.pending().insert(name.to_string(), (when, task)) {
            previous.abort();
        }
        log::debug!("alarm armed name={name} when={when} delay_ms={delay}");
    }

    fn cancel(&self, name: &str) {
        if let Some((_, task)) = self.pending().remove(name) {
            task.abort();
            log::debug!("alarm cancelled name={name}");
        }
    }

    fn get(&self, name: &str) -> Option<Timestamp> {
        self.pending()
            .get(name)
            .filter(|(_, task)| !task.is_finished())
            .map(|(when, _)| *when)
    }
}
