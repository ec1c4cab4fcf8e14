use std::fs;

const SMAPS_ROLLUP_PATH: &str = "/proc/self/smaps_rollup";
const STATM_PATH: &str = "/proc/self/statm";
const FD_DIR_PATH: &str = "/proc/self/fd";
const RSS_LINE_PREFIX: &str = "Rss:";
const SOCKET_LINK_PREFIX: &str = "socket:";

#[derive(Debug)]
enum RssSource {
    SmapsRollup,
    Statm { page_size: u64 },
}

#[derive(Debug)]
pub struct Querier {
    rss_source: RssSource,
}

impl Default for Querier {
    fn default() -> Self {
        let rss_source = if fs::metadata(SMAPS_ROLLUP_PATH).is_ok() {
            RssSource::SmapsRollup
        } else {
            RssSource::Statm { page_size: page_size() }
        };

        Self { rss_source }
    }
}

impl Querier {
    pub fn resident_set_size(&mut self) -> Option<u64> {
        match self.rss_source {
            RssSource::SmapsRollup => {
                let contents = fs::read_to_string(SMAPS_ROLLUP_PATH).ok()?;
                parse_smaps_rollup_rss(&contents)
            }
            RssSource::Statm { page_size } => {
                let contents = fs::read_to_string(STATM_PATH).ok()?;
                parse_statm_rss_pages(&contents).map(|pages| pages * page_size)
            }
        }
    }

    pub fn open_sockets(&mut self) -> Option<u64> {
        let entries = fs::read_dir(FD_DIR_PATH).ok()?;

        let mut sockets = 0;
        for entry in entries.flatten() {
            // Descriptors can close between listing and resolving them, so unreadable links are skipped.
            if let Ok(target) = fs::read_link(entry.path()) {
                if target.to_string_lossy().starts_with(SOCKET_LINK_PREFIX) {
                    sockets += 1;
                }
            }
        }

        Some(sockets)
    }
}

fn page_size() -> u64 {
    // SAFETY: `sysconf` has no memory safety preconditions.
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    u64::try_from(page_size).unwrap_or(0)
}

/// Extracts the `Rss:` value (reported in kB) from `smaps_rollup`, in bytes.
fn parse_smaps_rollup_rss(contents: &str) -> Option<u64> {
    contents
        .lines()
        .find_map(|line| line.strip_prefix(RSS_LINE_PREFIX))
        .and_then(|value| value.split_whitespace().next())
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb * 1024)
}

/// Extracts the resident page count, the second field of `statm`.
fn parse_statm_rss_pages(contents: &str) -> Option<u64> {
    contents.split_whitespace().nth(1)?.parse().ok()
}
