//! System memory snapshot.

use crate::{Error, Result};

/// Physical memory load at one point in time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryLoad {
    /// Percentage of physical memory in use, 0 to 100.
    pub percent: u32,
    /// Physical memory still available, in bytes.
    pub available_bytes: u64,
    /// Total physical memory, in bytes.
    pub total_bytes: u64,
}

impl MemoryLoad {
    /// Builds a snapshot from total and available byte counts.
    #[must_use]
    pub fn new(total_bytes: u64, available_bytes: u64) -> Self {
        let available_bytes = available_bytes.min(total_bytes);
        let percent = if total_bytes == 0 {
            0
        } else {
            ((total_bytes - available_bytes) as u128 * 100 / total_bytes as u128) as u32
        };
        Self {
            percent,
            available_bytes,
            total_bytes,
        }
    }

    /// Reads the current snapshot from the operating system.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if `/proc/meminfo` cannot be read, [`Error::NotSupported`] on
    /// platforms without it, or [`Error::InvalidArgument`] if its contents are unexpected.
    pub fn query() -> Result<Self> {
        #[cfg(target_os = "linux")]
        {
            let text = std::fs::read_to_string("/proc/meminfo")?;
            Self::parse_meminfo(&text)
        }
        #[cfg(not(target_os = "linux"))]
        {
            Err(Error::NotSupported("memory load"))
        }
    }

    /// Parses the `MemTotal` and `MemAvailable` lines of a meminfo listing.
    pub(crate) fn parse_meminfo(text: &str) -> Result<Self> {
        let field = |name: &str| -> Option<u64> {
            text.lines().find_map(|line| {
                let rest = line.strip_prefix(name)?.strip_prefix(':')?;
                let kib = rest.split_whitespace().next()?.parse::<u64>().ok()?;
                Some(kib * 1024)
            })
        };

        let total = field("MemTotal")
            .ok_or_else(|| Error::InvalidArgument("meminfo has no MemTotal".to_string()))?;
        let available = field("MemAvailable")
            .or_else(|| field("MemFree"))
            .ok_or_else(|| Error::InvalidArgument("meminfo has no MemAvailable".to_string()))?;
        Ok(Self::new(total, available))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_meminfo() {
        let text = "MemTotal:        1000 kB\nMemFree:          100 kB\nMemAvailable:     250 kB\n";
        let load = MemoryLoad::parse_meminfo(text).unwrap();
        assert_eq!(load.total_bytes, 1000 * 1024);
        assert_eq!(load.available_bytes, 250 * 1024);
        assert_eq!(load.percent, 75);
    }

    #[test]
    fn test_parse_meminfo_falls_back_to_free() {
        let load = MemoryLoad::parse_meminfo("MemTotal: 200 kB\nMemFree: 200 kB\n").unwrap();
        assert_eq!(load.percent, 0);
    }

    #[test]
    fn test_parse_meminfo_missing_total() {
        assert!(matches!(
            MemoryLoad::parse_meminfo("MemFree: 1 kB\n"),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_zero_total() {
        assert_eq!(MemoryLoad::new(0, 10).percent, 0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_query_linux() {
        let load = MemoryLoad::query().unwrap();
        assert!(load.total_bytes > 0);
        assert!(load.percent <= 100);
    }
}
