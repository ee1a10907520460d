use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use headless_chrome::protocol::cdp::Page;
use headless_chrome::{Browser, LaunchOptions, Tab};
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::actions::ACTION_FUNCTION;
use crate::locator::registry_base;

static ACTION_ARGS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"verFolleto\(\s*'([^']*)'\s*,\s*'([^']*)'\s*,\s*'([^']*)'\s*\)")
        .expect("valid action argument regex")
});

/// Element wired to the document action, as seen in the live page.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BrowserCandidate {
    pub index: usize,
    pub onclick: String,
    #[serde(default)]
    pub nearby_text: String,
}

/// One live page in a headless browser.
pub trait BrowserSession {
    fn open(&mut self, url: &str, download_dir: &Path) -> Result<()>;
    /// Bounded wait for the page scripts and pending async loads to finish.
    fn wait_until_settled(&mut self, timeout: Duration) -> Result<bool>;
    fn action_candidates(&mut self) -> Result<Vec<BrowserCandidate>>;
    fn trigger(&mut self, index: usize) -> Result<()>;
}

/// Starts one browser process per retrieval; dropping the session tears it down.
pub trait BrowserLauncher {
    fn launch(&self) -> Result<Box<dyn BrowserSession>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionStrategy {
    ExactId,
    NearbyText,
    FirstAvailable,
}

impl SelectionStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ExactId => "exact_id",
            Self::NearbyText => "nearby_text",
            Self::FirstAvailable => "first_available",
        }
    }
}

/// Candidate whose action arguments name the fund; a matching series wins ties.
pub fn match_exact_id(
    candidates: &[BrowserCandidate],
    registry_id: &str,
    series_code: Option<&str>,
) -> Option<usize> {
    let matching = candidates
        .iter()
        .filter_map(|candidate| {
            let captures = ACTION_ARGS.captures(&candidate.onclick)?;
            (registry_base(&captures[1]) == registry_id).then(|| (candidate.index, captures[2].to_string()))
        })
        .collect::<Vec<_>>();

    series_code
        .and_then(|wanted| {
            matching
                .iter()
                .find(|(_, series)| series.eq_ignore_ascii_case(wanted))
                .map(|(index, _)| *index)
        })
        .or_else(|| matching.first().map(|(index, _)| *index))
}

/// Candidate whose surrounding row text mentions the registry id as a token.
pub fn match_nearby_text(candidates: &[BrowserCandidate], registry_id: &str) -> Option<usize> {
    candidates
        .iter()
        .find(|candidate| {
            candidate
                .nearby_text
                .split(|character: char| !character.is_ascii_digit())
                .any(|token| token == registry_id)
        })
        .map(|candidate| candidate.index)
}

pub fn first_available(candidates: &[BrowserCandidate]) -> Option<usize> {
    candidates.first().map(|candidate| candidate.index)
}

pub fn select_candidate(
    candidates: &[BrowserCandidate],
    registry_id: &str,
    series_code: Option<&str>,
) -> Option<(usize, SelectionStrategy)> {
    match_exact_id(candidates, registry_id, series_code)
        .map(|index| (index, SelectionStrategy::ExactId))
        .or_else(|| {
            match_nearby_text(candidates, registry_id)
                .map(|index| (index, SelectionStrategy::NearbyText))
        })
        .or_else(|| first_available(candidates).map(|index| (index, SelectionStrategy::FirstAvailable)))
}

#[derive(Debug, Clone, Copy)]
pub struct DownloadWait {
    pub timeout: Duration,
    pub min_bytes: u64,
    /// Minimum gap between the two equal size samples that mark a file complete.
    pub stability_interval: Duration,
    pub poll_interval: Duration,
}

impl DownloadWait {
    pub fn with_min_bytes(min_bytes: u64) -> Self {
        Self {
            timeout: Duration::from_secs(60),
            min_bytes,
            stability_interval: Duration::from_secs(1),
            poll_interval: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("no complete download appeared in {dir} within {waited:?}")]
    TimedOut { dir: String, waited: Duration },

    #[error("failed to scan download directory {dir}: {source}")]
    Scan {
        dir: String,
        #[source]
        source: std::io::Error,
    },
}

pub fn pdf_files_in(dir: &Path) -> std::io::Result<HashSet<PathBuf>> {
    let mut files = HashSet::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let is_pdf = path
            .extension()
            .and_then(|value| value.to_str())
            .is_some_and(|extension| extension.eq_ignore_ascii_case("pdf"));
        if is_pdf && path.is_file() {
            files.insert(path);
        }
    }
    Ok(files)
}

/// Polls `dir` for a `.pdf` that was not in `before`, whose size is above the
/// floor and unchanged across samples at least `stability_interval` apart.
pub fn wait_for_download(
    dir: &Path,
    before: &HashSet<PathBuf>,
    wait: DownloadWait,
) -> Result<PathBuf, DownloadError> {
    let started = Instant::now();
    let mut observed: HashMap<PathBuf, (u64, Instant)> = HashMap::new();

    loop {
        let files = pdf_files_in(dir).map_err(|source| DownloadError::Scan {
            dir: dir.display().to_string(),
            source,
        })?;
        let now = Instant::now();

        for path in files.into_iter().filter(|path| !before.contains(path)) {
            let Ok(metadata) = fs::metadata(&path) else {
                continue;
            };
            let size = metadata.len();
            match observed.get(&path) {
                Some((previous, since)) if *previous == size => {
                    if size >= wait.min_bytes && now.duration_since(*since) >= wait.stability_interval {
                        info!(path = %path.display(), size_bytes = size, "download complete");
                        return Ok(path);
                    }
                }
                _ => {
                    debug!(path = %path.display(), size_bytes = size, "download in progress");
                    observed.insert(path, (size, now));
                }
            }
        }

        if started.elapsed() >= wait.timeout {
            return Err(DownloadError::TimedOut {
                dir: dir.display().to_string(),
                waited: started.elapsed(),
            });
        }
        thread::sleep(wait.poll_interval);
    }
}

/// Renames a finished download to `document_{registry_id}.pdf`, replacing
/// any stale file of that name.
pub fn finalize_download(downloaded: &Path, dir: &Path, registry_id: &str) -> Result<PathBuf> {
    let target = dir.join(format!("document_{registry_id}.pdf"));
    if downloaded == target {
        return Ok(target);
    }
    if target.exists() {
        fs::remove_file(&target)
            .with_context(|| format!("failed to remove stale {}", target.display()))?;
    }
    fs::rename(downloaded, &target).with_context(|| {
        format!(
            "failed to rename {} to {}",
            downloaded.display(),
            target.display()
        )
    })?;
    Ok(target)
}

/// Drives the disclosures page in a fresh browser and returns the path of the
/// canonically named download.
pub fn download_with_browser(
    launcher: &dyn BrowserLauncher,
    page_url: &str,
    download_dir: &Path,
    registry_id: &str,
    series_code: Option<&str>,
    settle_timeout: Duration,
    wait: DownloadWait,
) -> Result<PathBuf> {
    crate::util::ensure_directory(download_dir)?;
    let before = pdf_files_in(download_dir)
        .with_context(|| format!("failed to scan {}", download_dir.display()))?;

    let mut session = launcher.launch().context("failed to launch headless browser")?;
    session.open(page_url, download_dir)?;
    if !session.wait_until_settled(settle_timeout)? {
        warn!(registry_id, timeout_ms = settle_timeout.as_millis() as u64, "page did not settle, continuing");
    }

    let candidates = session.action_candidates()?;
    let Some((index, strategy)) = select_candidate(&candidates, registry_id, series_code) else {
        bail!("no element wired to {ACTION_FUNCTION} on {page_url}");
    };
    info!(
        registry_id,
        candidates = candidates.len(),
        index,
        strategy = strategy.as_str(),
        "triggering document action"
    );
    session.trigger(index)?;

    let downloaded = wait_for_download(download_dir, &before, wait)?;
    drop(session);
    finalize_download(&downloaded, download_dir, registry_id)
}

const SETTLED_PROBE: &str = "document.readyState === 'complete' \
    && (typeof jQuery === 'undefined' || jQuery.active === 0) \
    && document.querySelector('#tabs') !== null";

const CANDIDATES_PROBE: &str = r#"JSON.stringify(Array.from(document.querySelectorAll('[onclick*="verFolleto"]')).map(function (el, i) {
    var row = el.closest('tr') || el.parentElement;
    var text = row ? row.innerText : (el.innerText || '');
    return { index: i, onclick: el.getAttribute('onclick') || '', nearby_text: (text || '').slice(0, 500) };
}))"#;

pub struct ChromeLauncher;

impl BrowserLauncher for ChromeLauncher {
    fn launch(&self) -> Result<Box<dyn BrowserSession>> {
        let options = LaunchOptions::default_builder()
            .headless(true)
            .sandbox(false)
            .window_size(Some((1920, 1080)))
            .build()
            .map_err(|error| anyhow!("invalid browser launch options: {error}"))?;
        let browser = Browser::new(options).context("failed to start chrome")?;
        let tab = browser.new_tab().context("failed to open browser tab")?;
        info!("headless browser started");
        Ok(Box::new(ChromeSession { _browser: browser, tab }))
    }
}

struct ChromeSession {
    _browser: Browser,
    tab: Arc<Tab>,
}

impl ChromeSession {
    fn evaluate(&self, expression: &str) -> Result<Option<serde_json::Value>> {
        let object = self
            .tab
            .evaluate(expression, false)
            .context("browser script evaluation failed")?;
        Ok(object.value)
    }
}

impl BrowserSession for ChromeSession {
    fn open(&mut self, url: &str, download_dir: &Path) -> Result<()> {
        self.tab
            .call_method(Page::SetDownloadBehavior {
                behavior: Page::SetDownloadBehaviorBehaviorOption::Allow,
                download_path: Some(download_dir.display().to_string()),
            })
            .context("failed to enable downloads")?;
        self.tab
            .navigate_to(url)
            .with_context(|| format!("failed to navigate to {url}"))?
            .wait_until_navigated()
            .with_context(|| format!("navigation to {url} did not finish"))?;
        Ok(())
    }

    fn wait_until_settled(&mut self, timeout: Duration) -> Result<bool> {
        let started = Instant::now();
        while started.elapsed() < timeout {
            if self.evaluate(SETTLED_PROBE)? == Some(serde_json::Value::Bool(true)) {
                debug!(elapsed_ms = started.elapsed().as_millis() as u64, "page settled");
                return Ok(true);
            }
            thread::sleep(Duration::from_millis(250));
        }
        Ok(false)
    }

    fn action_candidates(&mut self) -> Result<Vec<BrowserCandidate>> {
        let Some(serde_json::Value::String(raw)) = self.evaluate(CANDIDATES_PROBE)? else {
            bail!("candidate probe returned no data");
        };
        serde_json::from_str(&raw).context("failed to parse candidate probe output")
    }

    fn trigger(&mut self, index: usize) -> Result<()> {
        let script = format!(
            "(function () {{ var el = document.querySelectorAll('[onclick*=\"verFolleto\"]')[{index}]; \
             if (!el) {{ return false; }} el.click(); return true; }})()"
        );
        match self.evaluate(&script)? {
            Some(serde_json::Value::Bool(true)) => Ok(()),
            _ => bail!("action element {index} disappeared before it could be clicked"),
        }
    }
}
