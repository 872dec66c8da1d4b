//! Configuration file, §6.
//!
//! The source format is TOML rather than the original INI (see
//! DESIGN.md / SPEC_FULL.md §2 for why); key *names* are kept verbatim for
//! wire/operational compatibility. Parsed with `serde` + `toml`, the same
//! pair the teacher's `cli/src/nonosctl/daemon.rs` uses for its own
//! `nonosd.toml`.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::types::{AnnounceHoldtime, EmptyPolicy, EventWhenCalled, Strategy};

#[derive(Debug, Clone, Deserialize, Default)]
pub struct GeneralSection {
    #[serde(default)]
    pub persistentmembers: bool,
    #[serde(default)]
    pub autofill: bool,
    #[serde(default)]
    pub monitor_type: Option<String>,
    #[serde(default)]
    pub updatecdr: bool,
    #[serde(default)]
    pub keepstats: bool,
}

/// Raw, as-parsed member line: `member = "iface,penalty,name"` becomes a
/// row here after the dialplan-style comma split.
#[derive(Debug, Clone, Deserialize)]
pub struct MemberLine {
    pub iface: String,
    #[serde(default)]
    pub penalty: u32,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueSection {
    #[serde(default)]
    pub strategy: Strategy,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_retry")]
    pub retry: u64,
    #[serde(default)]
    pub wrapuptime: u64,
    #[serde(default)]
    pub maxlen: usize,
    #[serde(default)]
    pub weight: u32,
    #[serde(default)]
    pub servicelevel: u64,
    #[serde(default)]
    pub announce_frequency: u64,
    #[serde(default)]
    pub min_announce_frequency: u64,
    #[serde(default)]
    pub periodic_announce_frequency: u64,
    #[serde(default)]
    pub announce_round_seconds: i64,
    #[serde(default)]
    pub announce_holdtime: AnnounceHoldtime,
    #[serde(default)]
    pub announce_position: bool,
    #[serde(default)]
    pub joinempty: EmptyPolicy,
    #[serde(default)]
    pub leavewhenempty: EmptyPolicy,
    #[serde(default)]
    pub ringinuse: bool,
    #[serde(default)]
    pub autopause: bool,
    #[serde(default)]
    pub timeoutrestart: bool,
    #[serde(default)]
    pub eventwhencalled: EventWhenCalled,
    #[serde(default)]
    pub eventmemberstatus: bool,
    #[serde(default)]
    pub memberdelay: u64,
    #[serde(default)]
    pub mask_member_status: bool,
    #[serde(default)]
    pub member: Vec<MemberLine>,
    /// Keys present in the file this struct doesn't recognize. On a static
    /// queue these are logged as a warning (§6); realtime queues tolerate
    /// them silently. Collected via `#[serde(flatten)]` isn't reliable
    /// across all serde backends for unknown-key capture, so the loader
    /// does its own first pass (see `config::scan_unknown_keys`).
    #[serde(skip)]
    pub unknown_keys: Vec<String>,
}

fn default_timeout() -> u64 {
    15
}
fn default_retry() -> u64 {
    5
}

impl QueueSection {
    pub fn ring_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry)
    }
    pub fn wrapup(&self) -> Duration {
        Duration::from_secs(self.wrapuptime)
    }
    pub fn service_level(&self) -> Duration {
        Duration::from_secs(self.servicelevel)
    }
    pub fn announce_frequency(&self) -> Duration {
        Duration::from_secs(self.announce_frequency)
    }
    pub fn min_announce_frequency(&self) -> Duration {
        Duration::from_secs(self.min_announce_frequency)
    }
    pub fn periodic_announce_frequency(&self) -> Duration {
        Duration::from_secs(self.periodic_announce_frequency)
    }
    pub fn member_delay(&self) -> Duration {
        Duration::from_millis(self.memberdelay)
    }

    /// Strict allow-list validation of `announce-round-seconds`, the
    /// REDESIGN FLAGS directive in §9 (not the original's lenient
    /// `atoi`-style parsing). Invalid values are coerced to 0 with a
    /// `ConfigError` surfaced to the caller for logging.
    pub fn validated_round_seconds(&self) -> std::result::Result<u32, Error> {
        const ALLOWED: [i64; 7] = [0, 1, 5, 10, 15, 20, 30];
        if ALLOWED.contains(&self.announce_round_seconds) {
            Ok(self.announce_round_seconds as u32)
        } else {
            Err(Error::Config {
                key: "announce-round-seconds".to_string(),
                detail: format!("{} not in {{0,1,5,10,15,20,30}}, using 0", self.announce_round_seconds),
            })
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct FileConfig {
    #[serde(default)]
    pub general: GeneralSection,
    #[serde(flatten)]
    pub queues: HashMap<String, QueueSection>,
}

/// Parses the full queues config file from TOML text. Unknown top-level
/// queue keys are detected with a second, weakly-typed pass so a static
/// queue can log a warning for them (§6) without serde hard-failing the
/// whole file.
pub fn parse(text: &str) -> Result<FileConfig> {
    let mut cfg: FileConfig = toml::from_str(text).map_err(|e| Error::Config {
        key: "<file>".to_string(),
        detail: e.to_string(),
    })?;

    let raw: toml::Value = toml::from_str(text).map_err(|e| Error::Config {
        key: "<file>".to_string(),
        detail: e.to_string(),
    })?;
    if let Some(table) = raw.as_table() {
        for (name, section) in cfg.queues.iter_mut() {
            if let Some(raw_section) = table.get(name) {
                section.unknown_keys = unknown_keys(raw_section, KNOWN_QUEUE_KEYS);
            }
        }
    }
    Ok(cfg)
}

/// Returns the keys present in `raw_section` that `QueueSection` doesn't
/// declare, for the static-queue unknown-key warning in §6.
pub fn unknown_keys(raw_section: &toml::Value, known: &[&str]) -> Vec<String> {
    match raw_section.as_table() {
        Some(table) => table
            .keys()
            .filter(|k| !known.contains(&k.as_str()))
            .cloned()
            .collect(),
        None => Vec::new(),
    }
}

pub const KNOWN_QUEUE_KEYS: &[&str] = &[
    "strategy",
    "timeout",
    "retry",
    "wrapuptime",
    "maxlen",
    "weight",
    "servicelevel",
    "announce_frequency",
    "min_announce_frequency",
    "periodic_announce_frequency",
    "announce_round_seconds",
    "announce_holdtime",
    "announce_position",
    "joinempty",
    "leavewhenempty",
    "ringinuse",
    "autopause",
    "timeoutrestart",
    "eventwhencalled",
    "eventmemberstatus",
    "memberdelay",
    "mask_member_status",
    "member",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_queue_section() {
        let text = r#"
            [general]
            persistentmembers = true

            [sales]
            strategy = "ringall"
            timeout = 20
            member = [{ iface = "SIP/a", penalty = 0, name = "Alice" }]
        "#;
        let cfg = parse(text).unwrap();
        assert!(cfg.general.persistentmembers);
        let sales = cfg.queues.get("sales").unwrap();
        assert_eq!(sales.strategy, Strategy::RingAll);
        assert_eq!(sales.timeout, 20);
        assert_eq!(sales.member.len(), 1);
    }

    #[test]
    fn parse_flags_unknown_queue_keys() {
        let text = r#"
            [sales]
            strategy = "ringall"
            bogus_key = true
        "#;
        let cfg = parse(text).unwrap();
        let sales = cfg.queues.get("sales").unwrap();
        assert_eq!(sales.unknown_keys, vec!["bogus_key".to_string()]);
    }

    #[test]
    fn invalid_round_seconds_rejected() {
        let mut s = QueueSection {
            strategy: Strategy::RingAll,
            timeout: 15,
            retry: 5,
            wrapuptime: 0,
            maxlen: 0,
            weight: 0,
            servicelevel: 0,
            announce_frequency: 0,
            min_announce_frequency: 0,
            periodic_announce_frequency: 0,
            announce_round_seconds: 7,
            announce_holdtime: AnnounceHoldtime::No,
            announce_position: false,
            joinempty: EmptyPolicy::Off,
            leavewhenempty: EmptyPolicy::Off,
            ringinuse: false,
            autopause: false,
            timeoutrestart: false,
            eventwhencalled: EventWhenCalled::No,
            eventmemberstatus: false,
            memberdelay: 0,
            mask_member_status: false,
            member: vec![],
            unknown_keys: vec![],
        };
        assert!(s.validated_round_seconds().is_err());
        s.announce_round_seconds = 15;
        assert_eq!(s.validated_round_seconds().unwrap(), 15);
    }
}
