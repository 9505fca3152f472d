//! Host and process resource sampling for `/status`.

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct HostResources {
    pub cpu_cores: u32,
    /// 1, 5 and 15 minute load averages. Zero where unsupported.
    pub load_average: [f64; 3],
    pub memory_total_bytes: u64,
    pub memory_available_bytes: u64,
    /// Resident set size of this process, when the platform exposes it.
    pub process_rss_bytes: Option<u64>,
}

impl HostResources {
    pub fn sample() -> Self {
        let (memory_total_bytes, memory_available_bytes) = memory_info();
        Self {
            cpu_cores: cpu_count(),
            load_average: load_average(),
            memory_total_bytes,
            memory_available_bytes,
            process_rss_bytes: process_rss(),
        }
    }
}

fn cpu_count() -> u32 {
    #[cfg(unix)]
    {
        let count = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
        if count > 0 {
            return count as u32;
        }
    }

    std::thread::available_parallelism()
        .map(|p| p.get() as u32)
        .unwrap_or(1)
}

fn load_average() -> [f64; 3] {
    #[cfg(unix)]
    {
        let mut loads = [0f64; 3];
        let n = unsafe { libc::getloadavg(loads.as_mut_ptr(), 3) };
        if n == 3 {
            return loads;
        }
    }
    [0.0; 3]
}

fn page_size() -> Option<u64> {
    #[cfg(unix)]
    {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            return Some(size as u64);
        }
    }
    None
}

#[cfg(target_os = "linux")]
fn memory_info() -> (u64, u64) {
    if let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") {
        let parsed = parse_meminfo(&meminfo);
        if parsed.0 > 0 {
            return parsed;
        }
    }
    sysconf_memory()
}

#[cfg(not(target_os = "linux"))]
fn memory_info() -> (u64, u64) {
    sysconf_memory()
}

fn sysconf_memory() -> (u64, u64) {
    #[cfg(unix)]
    {
        let total_pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
        if let (Some(page), true) = (page_size(), total_pages > 0) {
            let total = page * total_pages as u64;
            return (total, total);
        }
    }
    (0, 0)
}

/// Parse `MemTotal` and `MemAvailable` (or free + buffers + cached on old
/// kernels) from `/proc/meminfo`, in bytes.
fn parse_meminfo(content: &str) -> (u64, u64) {
    let mut total = 0u64;
    let mut available = None;
    let mut reclaimable = 0u64;

    for line in content.lines() {
        let mut parts = line.split_whitespace();
        let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
            continue;
        };
        let bytes = value.parse::<u64>().unwrap_or(0) * 1024;
        match key {
            "MemTotal:" => total = bytes,
            "MemAvailable:" => available = Some(bytes),
            "MemFree:" | "Buffers:" | "Cached:" => reclaimable += bytes,
            _ => {}
        }
    }

    (total, available.unwrap_or(reclaimable))
}

#[cfg(target_os = "linux")]
fn process_rss() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    parse_statm_rss(&statm, page_size()?)
}

#[cfg(not(target_os = "linux"))]
fn process_rss() -> Option<u64> {
    None
}

/// Second field of `/proc/self/statm` is resident pages.
fn parse_statm_rss(statm: &str, page_size: u64) -> Option<u64> {
    let resident: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(resident * page_size)
}
