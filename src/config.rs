use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Key of the object whose sections are layered under every named section.
pub const CONFIG_DEFAULT_KEY: &str = "ConfigDefault";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CongestionKind {
    #[default]
    Cubic,
    Bbr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpConfig {
    pub segment_size: u32,
    /// In segments.
    pub initial_cwnd: u32,
    pub initial_ssthresh: u32,
    pub snd_buf_size: u32,
    pub rcv_buf_size: u32,
    #[serde(with = "millis")]
    pub min_rto: Duration,
    #[serde(with = "millis")]
    pub initial_rto: Duration,
    #[serde(with = "millis")]
    pub max_rto: Duration,
    #[serde(with = "millis")]
    pub clock_granularity: Duration,
    /// Base of the SYN retransmission backoff.
    #[serde(with = "millis")]
    pub connection_timeout: Duration,
    pub syn_retries: u32,
    pub data_retries: u32,
    pub delayed_ack_count: u32,
    #[serde(with = "millis")]
    pub delayed_ack_timeout: Duration,
    #[serde(with = "millis")]
    pub persist_timeout: Duration,
    #[serde(with = "millis")]
    pub msl: Duration,
    pub nagle: bool,
    pub sack: bool,
    pub timestamps: bool,
    pub window_scaling: bool,
    pub ecn: bool,
    pub rec_threshold: u32,
    pub limited_transmit: bool,
    pub pacing: bool,
    pub pace_initial_window: bool,
    /// Bytes per second.
    pub max_pacing_rate: u64,
    /// Percent of the cwnd/srtt rate used in slow start.
    pub pacing_ss_ratio: u64,
    /// Percent of the cwnd/srtt rate used in congestion avoidance.
    pub pacing_ca_ratio: u64,
    pub tsq: bool,
    pub congestion_control: CongestionKind,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            segment_size: 536,
            initial_cwnd: 10,
            initial_ssthresh: u32::MAX,
            snd_buf_size: 131072,
            rcv_buf_size: 131072,
            min_rto: Duration::from_secs(1),
            initial_rto: Duration::from_secs(1),
            max_rto: Duration::from_secs(60),
            clock_granularity: Duration::from_millis(1),
            connection_timeout: Duration::from_secs(3),
            syn_retries: 6,
            data_retries: 6,
            delayed_ack_count: 2,
            delayed_ack_timeout: Duration::from_millis(200),
            persist_timeout: Duration::from_secs(6),
            msl: Duration::from_secs(60),
            nagle: true,
            sack: true,
            timestamps: true,
            window_scaling: true,
            ecn: false,
            rec_threshold: 3,
            limited_transmit: true,
            pacing: false,
            pace_initial_window: false,
            // 4 Gbps
            max_pacing_rate: 500_000_000,
            pacing_ss_ratio: 200,
            pacing_ca_ratio: 120,
            tsq: true,
            congestion_control: CongestionKind::Cubic,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HystartDetect {
    Train,
    Delay,
    Both,
}

impl HystartDetect {
    pub fn train(self) -> bool {
        matches!(self, HystartDetect::Train | HystartDetect::Both)
    }

    pub fn delay(self) -> bool {
        matches!(self, HystartDetect::Delay | HystartDetect::Both)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CubicConfig {
    pub fast_convergence: bool,
    pub tcp_friendliness: bool,
    pub beta: f64,
    pub c: f64,
    pub hystart: bool,
    /// In segments.
    pub hystart_low_window: u32,
    pub hystart_detect: HystartDetect,
    pub hystart_min_samples: u32,
    #[serde(with = "millis")]
    pub hystart_ack_delta: Duration,
    #[serde(with = "millis")]
    pub hystart_delay_min: Duration,
    #[serde(with = "millis")]
    pub hystart_delay_max: Duration,
    #[serde(with = "millis")]
    pub cubic_delta: Duration,
    pub cnt_clamp: u32,
}

impl Default for CubicConfig {
    fn default() -> Self {
        Self {
            fast_convergence: true,
            tcp_friendliness: true,
            beta: 0.7,
            c: 0.4,
            hystart: true,
            hystart_low_window: 16,
            hystart_detect: HystartDetect::Both,
            hystart_min_samples: 8,
            hystart_ack_delta: Duration::from_millis(2),
            hystart_delay_min: Duration::from_millis(4),
            hystart_delay_max: Duration::from_millis(16),
            cubic_delta: Duration::from_millis(4),
            cnt_clamp: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BbrConfig {
    /// In packet-timed rounds.
    pub bw_window_length: u64,
    #[serde(with = "millis")]
    pub rtt_window_length: Duration,
    #[serde(with = "millis")]
    pub probe_rtt_duration: Duration,
    pub extra_acked_rtt_window: u32,
    /// In segments.
    pub ack_epoch_acked_reset_threshold: u32,
    pub enable_ack_aggregation: bool,
    pub enable_long_term_bw: bool,
    pub high_gain: f64,
    /// Seeds the gain cycle start phase.
    pub seed: u64,
}

impl Default for BbrConfig {
    fn default() -> Self {
        Self {
            bw_window_length: 10,
            rtt_window_length: Duration::from_secs(10),
            probe_rtt_duration: Duration::from_millis(200),
            extra_acked_rtt_window: 5,
            ack_epoch_acked_reset_threshold: 1 << 20,
            enable_ack_aggregation: true,
            enable_long_term_bw: false,
            high_gain: 2.88539,
            seed: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FqConfig {
    /// Packets across all flows.
    pub limit: u32,
    /// Packets per flow.
    pub flow_limit: u32,
    pub quantum: u32,
    pub initial_quantum: u32,
    #[serde(with = "millis")]
    pub flow_refill_delay: Duration,
    /// Bytes per second, `None` for unlimited.
    pub flow_max_rate: Option<u64>,
    /// CE-mark packets that wait longer than this.
    #[serde(with = "opt_millis")]
    pub ce_threshold: Option<Duration>,
    #[serde(with = "millis")]
    pub horizon: Duration,
    pub horizon_drop: bool,
    pub rate_enable: bool,
    /// log2 of the number of flow hash buckets.
    pub buckets_log: u32,
}

impl Default for FqConfig {
    fn default() -> Self {
        Self {
            limit: 10000,
            flow_limit: 100,
            quantum: 3000,
            initial_quantum: 15000,
            flow_refill_delay: Duration::from_millis(40),
            flow_max_rate: None,
            ce_threshold: None,
            horizon: Duration::from_secs(10),
            horizon_drop: true,
            rate_enable: true,
            buckets_log: 10,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StackConfig {
    pub tcp: TcpConfig,
    pub cubic: CubicConfig,
    pub bbr: BbrConfig,
    pub fq: FqConfig,
}

impl StackConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        let cleaned = strip_comments_and_trailing_commas(text);
        let root: Value = serde_json::from_str(&cleaned).context("Config is not valid json.")?;
        Self::from_value(root)
    }

    fn from_value(mut root: Value) -> Result<Self> {
        if let Some(Value::Object(defaults)) = root.get(CONFIG_DEFAULT_KEY).cloned() {
            if let Value::Object(sections) = &mut root {
                sections.remove(CONFIG_DEFAULT_KEY);
                for (name, default_section) in defaults {
                    let mut merged = default_section;
                    if let Some(explicit) = sections.remove(&name) {
                        merge_patch(&mut merged, explicit);
                    }
                    sections.insert(name, merged);
                }
            }
        }
        serde_json::from_value(root).context("Config has unexpected values.")
    }
}

/// Loads and merges config files in order; later files override earlier ones.
pub fn load_config<P: AsRef<Path>>(paths: &[P]) -> Result<StackConfig> {
    let mut merged = Value::Object(Default::default());
    for path in paths {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}.", path.display()))?;
        let value: Value = serde_json::from_str(&strip_comments_and_trailing_commas(&text))
            .with_context(|| format!("Failed to parse config {}.", path.display()))?;
        merge_patch(&mut merged, value);
    }
    let config = StackConfig::from_value(merged)?;
    log::debug!("Loaded config from {} file(s): {:?}", paths.len(), config);
    Ok(config)
}

// rfc7386
fn merge_patch(target: &mut Value, patch: Value) {
    match patch {
        Value::Object(patch) => {
            if !target.is_object() {
                *target = Value::Object(Default::default());
            }
            if let Value::Object(target) = target {
                for (key, value) in patch {
                    if value.is_null() {
                        target.remove(&key);
                    } else {
                        merge_patch(target.entry(key).or_insert(Value::Null), value);
                    }
                }
            }
        }
        other => *target = other,
    }
}

/// Allows `//` line comments and a trailing comma before `}` or `]`.
fn strip_comments_and_trailing_commas(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    let mut in_str = false;
    let mut pending_comma: Option<String> = None;
    while let Some(c) = chars.next() {
        if in_str {
            out.push(c);
            if c == '\\' {
                if let Some(escaped) = chars.next() {
                    out.push(escaped);
                }
            } else if c == '"' {
                in_str = false;
            }
            continue;
        }
        if c == '/' && chars.peek() == Some(&'/') {
            for skipped in chars.by_ref() {
                if skipped == '\n' {
                    break;
                }
            }
            match pending_comma.as_mut() {
                Some(held) => held.push('\n'),
                None => out.push('\n'),
            }
            continue;
        }
        if let Some(held) = pending_comma.as_mut() {
            if c.is_whitespace() {
                held.push(c);
                continue;
            }
            let held = pending_comma.take().unwrap_or_default();
            if c == '}' || c == ']' {
                // Drop the comma, keep the whitespace.
                out.push_str(&held[1..]);
            } else {
                out.push_str(&held);
            }
        }
        match c {
            ',' => pending_comma = Some(String::from(",")),
            '"' => {
                in_str = true;
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    if let Some(held) = pending_comma {
        out.push_str(&held);
    }
    out
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

mod opt_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod config_tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_config_defaults_when_empty() {
        let config = StackConfig::from_json("{}").unwrap();
        assert_eq!(config, StackConfig::default());
        assert_eq!(config.tcp.segment_size, 536);
        assert_eq!(config.fq.quantum, 3000);
        assert_eq!(config.cubic.beta, 0.7);
    }

    #[test]
    fn test_config_default_section_is_layered() {
        let text = r#"
        {
            // shared defaults
            "ConfigDefault": {
                "tcp": { "segment_size": 1448, "sack": false },
                "bbr": { "seed": 9 },
            },
            "tcp": { "sack": true, "min_rto": 200, "congestion_control": "Bbr" },
        }"#;
        let config = StackConfig::from_json(text).unwrap();
        assert_eq!(config.tcp.segment_size, 1448);
        assert!(config.tcp.sack);
        assert_eq!(config.tcp.min_rto, Duration::from_millis(200));
        assert_eq!(config.tcp.congestion_control, CongestionKind::Bbr);
        assert_eq!(config.bbr.seed, 9);
        assert_eq!(config.bbr.bw_window_length, 10);
    }

    #[rstest]
    #[case(r#"{"tcp": {"segment_size": "big"}}"#)]
    #[case(r#"{"tcp": "#)]
    #[case(r#"{"fq": {"ce_threshold": -1}}"#)]
    fn test_config_rejects_bad_input(#[case] text: &str) {
        assert!(StackConfig::from_json(text).is_err());
    }

    #[rstest]
    #[case(r#"{"a": 1,}"#, r#"{"a": 1}"#)]
    #[case("[1, 2 , ]", "[1, 2  ]")]
    #[case(r#"{"s": "x,}//y"}"#, r#"{"s": "x,}//y"}"#)]
    fn test_config_strip_comments(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(strip_comments_and_trailing_commas(input), expected);
    }

    #[test]
    fn test_config_load_merges_files() {
        let dir = std::env::temp_dir().join(format!("tcpcc_r_config_{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let base = dir.join("base.json");
        let over = dir.join("over.json");
        fs::write(&base, r#"{"fq": {"quantum": 1514, "limit": 50}}"#).unwrap();
        fs::write(&over, r#"{"fq": {"limit": 60}, "tcp": {"ecn": true}}"#).unwrap();
        let config = load_config(&[&base, &over]).unwrap();
        assert_eq!(config.fq.quantum, 1514);
        assert_eq!(config.fq.limit, 60);
        assert!(config.tcp.ecn);
        assert!(load_config(&[dir.join("missing.json")]).is_err());
        fs::remove_dir_all(&dir).unwrap();
    }
}
