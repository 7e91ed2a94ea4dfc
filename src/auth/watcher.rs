use super::AuthManager;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::SystemTime;
use tokio::time::{Duration, Instant, interval};

const POLL_INTERVAL: Duration = Duration::from_secs(1);
/// A file must hold still this long before it is imported, so partially
/// written credentials are never read.
const STABILITY_THRESHOLD: Duration = Duration::from_secs(2);

/// Which provider a credential file belongs to, inferred from its name.
pub fn provider_for_path(path: &Path) -> &'static str {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    if name.contains("gemini") || name.contains("google") {
        "gemini"
    } else {
        "openai"
    }
}

#[derive(Default)]
struct FileState {
    /// Last modification seen and when this poll loop first saw it.
    last_seen: Option<(SystemTime, Instant)>,
    /// Modification time of the last successful import.
    imported: Option<SystemTime>,
}

impl AuthManager {
    /// Watch token files for external changes, importing each once it has
    /// been stable for 2 s. Starting twice is a no-op.
    pub fn watch_files(self: Arc<Self>, paths: Vec<PathBuf>) {
        if paths.is_empty() {
            return;
        }
        if self.watcher_started.swap(true, Ordering::SeqCst) {
            return;
        }

        let auth = Arc::clone(&self);
        let handle = tokio::spawn(async move {
            let mut states: HashMap<PathBuf, FileState> = paths
                .iter()
                .map(|path| (path.clone(), FileState::default()))
                .collect();
            let mut tick = interval(POLL_INTERVAL);
            loop {
                tick.tick().await;
                for path in &paths {
                    let Some(state) = states.get_mut(path) else {
                        continue;
                    };
                    poll_file(&auth, path, state).await;
                }
            }
        });

        *self
            .watcher_handle
            .lock()
            .expect("watcher handle poisoned") = Some(handle);
        tracing::info!("token file watcher started");
    }

    /// Stop the watcher and release its task. Safe to call without a
    /// running watcher; the next `watch_files` starts fresh.
    pub fn stop_watching(&self) {
        if let Some(handle) = self
            .watcher_handle
            .lock()
            .expect("watcher handle poisoned")
            .take()
        {
            handle.abort();
        }
        self.watcher_started.store(false, Ordering::SeqCst);
    }
}

async fn poll_file(auth: &Arc<AuthManager>, path: &Path, state: &mut FileState) {
    let Ok(metadata) = std::fs::metadata(path) else {
        state.last_seen = None;
        return;
    };
    let Ok(modified) = metadata.modified() else {
        return;
    };

    if state.imported == Some(modified) {
        return;
    }

    match state.last_seen {
        Some((seen_mtime, first_seen)) if seen_mtime == modified => {
            if first_seen.elapsed() >= STABILITY_THRESHOLD {
                let provider = provider_for_path(path);
                // Import failures must never take the watcher down.
                match auth.sync_from_file(path, provider).await {
                    Ok(()) => state.imported = Some(modified),
                    Err(error) => {
                        tracing::warn!(
                            path = %path.display(),
                            provider,
                            "token file sync failed: {error:#}"
                        );
                        // Don't retry this mtime every second.
                        state.imported = Some(modified);
                    }
                }
            }
        }
        _ => {
            state.last_seen = Some((modified, Instant::now()));
        }
    }
}
