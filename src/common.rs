use anyhow::{Context, Result};
use std::{
    fs,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep};

pub fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed creating {}", parent.display()))?;
    }
    Ok(())
}

/// Sibling path used for write-then-rename saves.
pub fn tmp_path_for(path: &Path, fallback_name: &str) -> std::path::PathBuf {
    let file_name = path
        .file_name()
        .and_then(|x| x.to_str())
        .unwrap_or(fallback_name);
    path.with_file_name(format!("{file_name}.tmp"))
}

pub fn truncate_for_log(text: &str) -> String {
    let trimmed = text.trim();
    let max_len = 300usize;
    if trimmed.len() <= max_len {
        return trimmed.to_string();
    }
    let mut cut = max_len;
    while !trimmed.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &trimmed[..cut])
}

pub fn min_request_interval(requests_per_second: u32) -> Duration {
    if requests_per_second == 0 {
        Duration::ZERO
    } else {
        Duration::from_secs_f64(1.0 / requests_per_second as f64)
    }
}

pub async fn wait_for_rate_slot(next_slot: &Arc<Mutex<Instant>>, min_interval: Duration) {
    if min_interval.is_zero() {
        return;
    }
    let mut guard = next_slot.lock().await;
    let now = Instant::now();
    if *guard > now {
        sleep(*guard - now).await;
    }
    *guard = Instant::now() + min_interval;
}

pub fn install_ctrlc_handler(shutdown_requested: Arc<AtomicBool>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let was_set = shutdown_requested.swap(true, Ordering::SeqCst);
            if !was_set {
                eprintln!(
                    "\nReceived Ctrl-C. Closing registry sessions and saving resolved names..."
                );
            }
        }
    });
}

pub fn now_unix_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_keeps_short_text() {
        assert_eq!(truncate_for_log("  ok  "), "ok");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let text = "Ж".repeat(400);
        let out = truncate_for_log(&text);
        assert!(out.ends_with("..."));
        assert!(out.len() <= 303);
    }

    #[test]
    fn zero_rate_means_no_interval() {
        assert!(min_request_interval(0).is_zero());
        assert_eq!(min_request_interval(4), Duration::from_millis(250));
    }

    #[test]
    fn tmp_path_is_a_sibling() {
        let tmp = tmp_path_for(Path::new("data/patients.csv"), "x.csv");
        assert_eq!(tmp, Path::new("data/patients.csv.tmp"));
    }
}
