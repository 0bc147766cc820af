use bitflags::bitflags;
use tracing::warn;
use virtring_cs::EncoderConfig;
use virtring_ring::RingConfig;

pub const DEBUG_ENV: &str = "VIRTRING_DEBUG";
pub const RING_SIZE_ENV: &str = "VIRTRING_RING_SIZE";
pub const NO_ABORT_ENV: &str = "VIRTRING_NO_ABORT";

bitflags! {
    /// Debug switches, settable through `VIRTRING_DEBUG=name,name`.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct DebugFlags: u32 {
        /// Keep waiting on a dead remote instead of aborting.
        const NO_ABORT = 1 << 0;
        /// Log every ring submission.
        const LOG_RING = 1 << 1;
        /// Copy oversized streams into the ring instead of uploading them.
        const NO_UPLOAD = 1 << 2;
    }
}

impl DebugFlags {
    /// Parse a comma separated list of flag names. Unknown names are skipped with a warning.
    pub fn parse(list: &str) -> Self {
        let mut flags = Self::empty();
        for name in list.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            match name.to_ascii_lowercase().as_str() {
                "no_abort" => flags |= Self::NO_ABORT,
                "log_ring" => flags |= Self::LOG_RING,
                "no_upload" => flags |= Self::NO_UPLOAD,
                _ => warn!(flag = name, "ignoring unknown {DEBUG_ENV} flag"),
            }
        }
        flags
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceConfig {
    /// Settings of the primary ring and of every queue ring.
    pub ring: RingConfig,
    /// Growth policy of encoders handed out by the instance.
    pub encoder: EncoderConfig,
    /// Minimum backing region size of the command-stream pool.
    pub cs_pool_min_alloc: usize,
    /// Minimum backing region size of the reply pool.
    pub reply_pool_min_alloc: usize,
    pub debug: DebugFlags,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            ring: RingConfig::default(),
            encoder: EncoderConfig::default(),
            cs_pool_min_alloc: 8 * 1024 * 1024,
            reply_pool_min_alloc: 1024 * 1024,
            debug: DebugFlags::empty(),
        }
    }
}

impl InstanceConfig {
    /// Defaults with overrides from the process environment.
    pub fn from_env() -> Self {
        Self::from_env_with(|name| std::env::var(name).ok())
    }

    /// Defaults with overrides looked up through `lookup`.
    pub fn from_env_with(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();

        if let Some(list) = lookup(DEBUG_ENV) {
            cfg.debug |= DebugFlags::parse(&list);
        }
        if lookup(NO_ABORT_ENV).is_some_and(|v| truthy(&v)) {
            cfg.debug |= DebugFlags::NO_ABORT;
        }
        if let Some(raw) = lookup(RING_SIZE_ENV) {
            match raw.trim().parse::<usize>() {
                Ok(size) if size.is_power_of_two() => cfg.ring.buffer_size = size,
                _ => warn!(value = %raw, "ignoring {RING_SIZE_ENV}: not a power of two"),
            }
        }

        cfg.apply_debug_flags();
        cfg
    }

    /// Push `debug` down into the ring settings.
    pub fn apply_debug_flags(&mut self) {
        self.ring.no_abort |= self.debug.contains(DebugFlags::NO_ABORT);
        self.ring.log_submissions |= self.debug.contains(DebugFlags::LOG_RING);
        self.ring.no_upload |= self.debug.contains(DebugFlags::NO_UPLOAD);
    }
}

fn truthy(raw: &str) -> bool {
    let v = raw.trim();
    v == "1"
        || v.eq_ignore_ascii_case("true")
        || v.eq_ignore_ascii_case("yes")
        || v.eq_ignore_ascii_case("on")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from(vars: &[(&str, &str)]) -> InstanceConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        InstanceConfig::from_env_with(|name| vars.get(name).cloned())
    }

    #[test]
    fn empty_environment_keeps_defaults() {
        assert_eq!(from(&[]), InstanceConfig::default());
    }

    #[test]
    fn debug_list_sets_ring_switches() {
        let cfg = from(&[(DEBUG_ENV, "log_ring, NO_UPLOAD,bogus")]);
        assert_eq!(cfg.debug, DebugFlags::LOG_RING | DebugFlags::NO_UPLOAD);
        assert!(cfg.ring.log_submissions);
        assert!(cfg.ring.no_upload);
        assert!(!cfg.ring.no_abort);
    }

    #[test]
    fn no_abort_shorthand() {
        assert!(from(&[(NO_ABORT_ENV, "yes")]).ring.no_abort);
        assert!(!from(&[(NO_ABORT_ENV, "0")]).ring.no_abort);
    }

    #[test]
    fn ring_size_must_be_a_power_of_two() {
        assert_eq!(from(&[(RING_SIZE_ENV, "65536")]).ring.buffer_size, 65536);
        assert_eq!(
            from(&[(RING_SIZE_ENV, "65535")]).ring.buffer_size,
            RingConfig::default().buffer_size
        );
        assert_eq!(
            from(&[(RING_SIZE_ENV, "lots")]).ring.buffer_size,
            RingConfig::default().buffer_size
        );
    }
}
