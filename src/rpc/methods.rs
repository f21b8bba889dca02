//! Host-initiated method catalog.
//!
//! Each method carries a static timeout/retry policy.  Whether a method is
//! fatal-on-timeout is a property of the method itself and cannot be changed
//! by configuration; timeouts and retry counts can.

use std::collections::HashMap;
use std::time::Duration;

use crate::config::RpcConfig;

// ---------------------------------------------------------------------------
// Method names
// ---------------------------------------------------------------------------

pub const PING: &str = "system.ping";
pub const INFO: &str = "system.info";
pub const STATUS: &str = "status.get";
pub const LIST_DEVICES: &str = "audio.list_devices";
pub const SET_DEVICE: &str = "audio.set_device";
pub const METER_START: &str = "audio.meter_start";
pub const METER_STOP: &str = "audio.meter_stop";
pub const RECORDING_START: &str = "recording.start";
pub const RECORDING_STOP: &str = "recording.stop";
pub const RECORDING_CANCEL: &str = "recording.cancel";
pub const ASR_INITIALIZE: &str = "asr.initialize";
pub const MODEL_DOWNLOAD: &str = "model.download";
pub const MODEL_PURGE: &str = "model.purge_cache";

// ---------------------------------------------------------------------------
// MethodSpec
// ---------------------------------------------------------------------------

/// Static metadata for one method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodSpec {
    pub name: &'static str,
    pub timeout: Duration,
    pub max_retries: u32,
    /// A timeout is never retried; it escalates to an error state and marks
    /// the worker unhealthy.
    pub fatal_on_timeout: bool,
    /// Older workers may not implement it; callers must tolerate
    /// `E_METHOD_NOT_FOUND`.
    pub optional: bool,
}

const fn short(name: &'static str, secs: u64, max_retries: u32) -> MethodSpec {
    MethodSpec {
        name,
        timeout: Duration::from_secs(secs),
        max_retries,
        fatal_on_timeout: false,
        optional: false,
    }
}

const TWENTY_MINUTES: Duration = Duration::from_secs(20 * 60);

/// Every method the host knows about.
pub const CATALOG: &[MethodSpec] = &[
    short(PING, 1, 1),
    short(INFO, 2, 1),
    short(STATUS, 2, 1),
    short(LIST_DEVICES, 2, 1),
    short(SET_DEVICE, 2, 1),
    short(METER_START, 2, 1),
    short(METER_STOP, 2, 1),
    short(RECORDING_START, 2, 1),
    short(RECORDING_STOP, 2, 1),
    short(RECORDING_CANCEL, 2, 1),
    MethodSpec {
        name: ASR_INITIALIZE,
        timeout: TWENTY_MINUTES,
        max_retries: 0,
        fatal_on_timeout: true,
        optional: false,
    },
    MethodSpec {
        name: MODEL_DOWNLOAD,
        timeout: TWENTY_MINUTES,
        max_retries: 0,
        fatal_on_timeout: false,
        optional: true,
    },
    short(MODEL_PURGE, 10, 0),
];

/// Policy for methods missing from the catalog.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

pub fn find_method(name: &str) -> Option<&'static MethodSpec> {
    CATALOG.iter().find(|m| m.name == name)
}

// ---------------------------------------------------------------------------
// CallPolicy / MethodTable
// ---------------------------------------------------------------------------

/// Effective policy for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallPolicy {
    pub timeout: Duration,
    pub max_retries: u32,
    pub fatal_on_timeout: bool,
}

impl CallPolicy {
    pub fn new(timeout: Duration, max_retries: u32) -> Self {
        Self {
            timeout,
            max_retries,
            fatal_on_timeout: false,
        }
    }

    pub fn fatal(timeout: Duration) -> Self {
        Self {
            timeout,
            max_retries: 0,
            fatal_on_timeout: true,
        }
    }
}

impl From<&MethodSpec> for CallPolicy {
    fn from(spec: &MethodSpec) -> Self {
        Self {
            timeout: spec.timeout,
            // Fatal methods are never retried, whatever the table says.
            max_retries: if spec.fatal_on_timeout { 0 } else { spec.max_retries },
            fatal_on_timeout: spec.fatal_on_timeout,
        }
    }
}

/// The catalog with configured overrides applied.
#[derive(Debug, Clone, Default)]
pub struct MethodTable {
    overrides: HashMap<String, CallPolicy>,
}

impl MethodTable {
    pub fn from_config(config: &RpcConfig) -> Self {
        let mut overrides = HashMap::new();
        for (name, o) in &config.methods {
            let mut policy = Self::base_policy(name);
            if let Some(ms) = o.timeout_ms {
                policy.timeout = Duration::from_millis(ms);
            }
            if let Some(retries) = o.max_retries {
                if policy.fatal_on_timeout {
                    log::warn!("rpc: ignoring retry override for fatal-on-timeout method {name}");
                } else {
                    policy.max_retries = retries;
                }
            }
            overrides.insert(name.clone(), policy);
        }
        Self { overrides }
    }

    fn base_policy(method: &str) -> CallPolicy {
        find_method(method)
            .map(CallPolicy::from)
            .unwrap_or_else(|| CallPolicy::new(DEFAULT_TIMEOUT, 0))
    }

    /// Effective policy for `method`.
    pub fn policy(&self, method: &str) -> CallPolicy {
        self.overrides
            .get(method)
            .copied()
            .unwrap_or_else(|| Self::base_policy(method))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MethodOverride;

    #[test]
    fn catalog_names_are_unique() {
        let mut names: Vec<_> = CATALOG.iter().map(|m| m.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), CATALOG.len());
    }

    #[test]
    fn only_initialize_is_fatal() {
        let fatal: Vec<_> = CATALOG.iter().filter(|m| m.fatal_on_timeout).collect();
        assert_eq!(fatal.len(), 1);
        assert_eq!(fatal[0].name, ASR_INITIALIZE);
        assert_eq!(fatal[0].max_retries, 0);
    }

    #[test]
    fn representative_timeouts() {
        let table = MethodTable::default();
        assert_eq!(table.policy(PING), CallPolicy::new(Duration::from_secs(1), 1));
        assert_eq!(table.policy(RECORDING_STOP).timeout, Duration::from_secs(2));
        assert_eq!(table.policy(MODEL_PURGE).timeout, Duration::from_secs(10));
        assert!(table.policy(ASR_INITIALIZE).fatal_on_timeout);
        assert!(find_method(MODEL_DOWNLOAD).unwrap().optional);
    }

    #[test]
    fn unknown_method_uses_default_policy() {
        let table = MethodTable::default();
        assert_eq!(table.policy("vendor.custom"), CallPolicy::new(DEFAULT_TIMEOUT, 0));
    }

    #[test]
    fn overrides_apply_but_fatal_flag_is_static() {
        let mut config = RpcConfig::default();
        config.methods.insert(
            PING.into(),
            MethodOverride {
                timeout_ms: Some(250),
                max_retries: Some(3),
            },
        );
        config.methods.insert(
            ASR_INITIALIZE.into(),
            MethodOverride {
                timeout_ms: Some(60_000),
                max_retries: Some(5),
            },
        );

        let table = MethodTable::from_config(&config);
        assert_eq!(table.policy(PING), CallPolicy::new(Duration::from_millis(250), 3));

        let init = table.policy(ASR_INITIALIZE);
        assert_eq!(init.timeout, Duration::from_secs(60));
        assert_eq!(init.max_retries, 0);
        assert!(init.fatal_on_timeout);
    }
}
