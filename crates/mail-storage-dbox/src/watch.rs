use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use mail_storage_core::NotifyCallback;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, info, warn};

/// Watches a mailbox's index log and calls back when it changes.
///
/// Events are coalesced: the callback runs at most once per `min_interval`,
/// and a burst of commits within one interval produces a single call.
/// Dropping the watcher stops it; a call still waiting out the interval is
/// skipped.
pub struct LogWatcher {
    // stops the event thread when dropped
    _watcher: RecommendedWatcher,
    stopped: Arc<AtomicBool>,
    log_path: PathBuf,
}

impl LogWatcher {
    pub fn start(
        mailbox: &str,
        log_path: &Path,
        min_interval: Duration,
        callback: NotifyCallback,
    ) -> Result<Self, notify::Error> {
        let (tx, rx) = mpsc::channel::<notify::Result<Event>>();
        let mut watcher = RecommendedWatcher::new(tx, Config::default())?;

        // Watch the log's parent directory (the log may not exist yet)
        let watch_path = log_path.parent().unwrap_or(log_path);
        watcher.watch(watch_path, RecursiveMode::NonRecursive)?;

        let stopped = Arc::new(AtomicBool::new(false));
        let thread_stopped = Arc::clone(&stopped);
        let mailbox = mailbox.to_string();
        let log_name = log_path.file_name().map(|n| n.to_os_string());
        thread::Builder::new()
            .name(format!("notify-{}", mailbox))
            .spawn(move || {
                let is_log = |event: &Event| {
                    event
                        .paths
                        .iter()
                        .any(|p| p.file_name().map(|n| n.to_os_string()) == log_name)
                };
                run_events(rx, min_interval, &thread_stopped, is_log, move || {
                    callback(mailbox.as_str())
                });
            })?;

        info!("Started watching {}", log_path.display());
        Ok(Self {
            _watcher: watcher,
            stopped,
            log_path: log_path.to_path_buf(),
        })
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }
}

impl Drop for LogWatcher {
    fn drop(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
        debug!("Stopped watching {}", self.log_path.display());
    }
}

/// Drive `fire` from the event stream until the sender goes away or
/// `stopped` is set.
fn run_events<P, F>(
    rx: Receiver<notify::Result<Event>>,
    min_interval: Duration,
    stopped: &AtomicBool,
    is_log: P,
    fire: F,
) where
    P: Fn(&Event) -> bool,
    F: Fn(),
{
    let mut last_fired: Option<Instant> = None;
    while let Ok(res) = rx.recv() {
        match res {
            Ok(event) if is_relevant(&event) && is_log(&event) => {}
            Ok(_) => continue,
            Err(e) => {
                warn!("Watch error: {}", e);
                continue;
            }
        }

        if let Some(last) = last_fired {
            let next = last + min_interval;
            let now = Instant::now();
            if next > now {
                thread::sleep(next - now);
            }
        }
        if stopped.load(Ordering::SeqCst) {
            break;
        }
        // everything queued meanwhile is covered by this call
        while rx.try_recv().is_ok() {}

        last_fired = Some(Instant::now());
        fire();
    }
}

fn is_relevant(event: &Event) -> bool {
    matches!(
        event.kind,
        EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
    )
}
