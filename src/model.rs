//! Preset and service data model.
//!
//! The serialized form (camelCase fields, SCREAMING-CASE enums) is a
//! compatibility surface: presets written by this engine must read back
//! field-for-field, and the web UI patches services with the same names.
//! One canonical scheme is enforced here at the serde boundary.

use serde::{Deserialize, Serialize};

/// Subchannel bitrates odr-audioenc accepts for DAB+.
pub const ALLOWED_BITRATES_KBPS: [u32; 24] = [
    8, 16, 24, 32, 40, 48, 56, 64, 72, 80, 88, 96, 104, 112, 120, 128, 136, 144, 152, 160, 168,
    176, 184, 192,
];

pub fn bitrate_allowed(kbps: u32) -> bool {
    ALLOWED_BITRATES_KBPS.contains(&kbps)
}

/// 4 hex chars, uppercase. Extra input is truncated, not rejected, matching
/// how the UI feeds this field.
pub fn normalize_pi(pi: &str) -> String {
    pi.to_uppercase().chars().take(4).collect()
}

// --- Preset ----------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Preset {
    pub id: String,
    pub name: String,
    pub services: Vec<Service>,
}

impl Preset {
    pub fn empty(id: &str, name: &str) -> Self {
        Self { id: id.into(), name: name.into(), services: Vec::new() }
    }
}

// --- Service ---------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub id: String,
    pub enabled: bool,
    pub identity: Identity,
    pub dab: DabConfig,
    pub input: InputConfig,
    pub audio: AudioConfig,
    pub pad: PadConfig,
    pub network: NetworkConfig,
    pub watchdog: WatchdogConfig,
    pub metadata: MetadataConfig,
    pub ui: UiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    /// Programme identifier, 4 hex chars uppercase.
    pub pi: String,
    /// Derived: "0x" + pi. Recomputed whenever pi changes.
    pub service_id_hex: String,
    /// Display label, max 8 chars.
    pub ps8: String,
    /// Long display label, max 16 chars.
    pub ps16: Option<String>,
    pub language_hex: String,
    /// Programme type.
    pub pty: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DabConfig {
    pub bitrate_kbps: u32,
    /// EEP protection level 1-4. Lower protects more and costs more CU.
    pub protection_level: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputConfig {
    pub mode: String,
    pub uri: Option<String>,
    pub backup_uri: Option<String>,
    pub zmq_buffer: u32,
    pub zmq_prebuffering: u32,
    pub encoder_buffer_ms: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioConfig {
    pub channels: u32,
    pub sample_rate_hz: u32,
    pub gain_db: f64,
    /// Human-readable codec label, e.g. "HE-AAC v1 (SBR)".
    pub codec: String,
}

impl AudioConfig {
    /// odr-audioenc flags for the selected codec label.
    pub fn encoder_flags(&self) -> &'static [&'static str] {
        let label = self.codec.to_uppercase();
        if label.contains("AAC-LC") {
            &[]
        } else if label.contains("V2") || label.contains("PS") {
            &["--sbr", "--ps"]
        } else {
            &["--sbr"]
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PadConfig {
    pub enabled: bool,
    /// Named pipe the PAD encoder writes into and the audio encoder reads.
    pub fifo_name: String,
    pub dls_file: String,
    pub slide_dir: String,
    /// Relative by convention; resolution rules live in the runtime core.
    pub mot_dir: String,
    pub sls: SlsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlsConfig {
    pub enabled: bool,
    pub logo_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
    pub edi_output_tcp: EdiOutputTcp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdiOutputTcp {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchdogConfig {
    pub enabled: bool,
    pub silence_threshold_sec: u32,
    pub switch_to_backup_on_silence: bool,
    pub return_to_main_after_sec: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MetadataMode {
    None,
    Stream,
    File,
    Json,
    Xml,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataConfig {
    pub mode: MetadataMode,
    pub interval_sec: u32,
    pub url: Option<String>,
    pub artist_key: String,
    pub title_key: String,
    pub sls_key: String,
    pub default_dls: String,
    /// Explicit artwork override; always wins over mode-derived artwork.
    pub sls_url: Option<String>,
    pub sls_back_color: String,
    pub sls_font_color: String,
    pub default_dls_allowed: bool,
    pub default_sls_allowed: bool,
    pub dls_included: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UiConfig {
    pub order: u32,
}

// --- Service creation ------------------------------------------------------

/// Body of `POST /api/services`: everything optional, defaults documented in
/// `Service::from_spec`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewService {
    pub id: Option<String>,
    pub identity: Option<NewIdentity>,
    pub dab: Option<NewDab>,
    pub input: Option<NewInput>,
    pub audio: Option<NewAudio>,
    pub network: Option<NewNetwork>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewIdentity {
    pub pi: Option<String>,
    pub ps8: Option<String>,
    pub ps16: Option<String>,
    pub language_hex: Option<String>,
    pub pty: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewDab {
    pub bitrate_kbps: Option<u32>,
    pub protection_level: Option<u8>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewInput {
    pub uri: Option<String>,
    pub backup_uri: Option<String>,
    pub encoder_buffer_ms: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewAudio {
    pub gain_db: Option<f64>,
    pub codec: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewNetwork {
    pub edi_output_tcp: Option<NewEdiOutputTcp>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewEdiOutputTcp {
    pub port: Option<u16>,
}

impl Service {
    /// Build a complete service from a partial spec. `id` and `port` are
    /// decided by the runtime core (uniqueness and port assignment need the
    /// whole preset), `order` is the 1-based position in the service list.
    ///
    /// Defaults: 96 kbps (also when the requested bitrate is not in the
    /// allowed set), protection 3, stereo 48 kHz, gain 0, HE-AAC v1, input
    /// mode AUDIOENC with zmq 96/48 and a 200 ms encoder buffer, PAD fifo
    /// and DLS file named after the uppercased id, watchdog on with a 10 s
    /// silence threshold and 60 s return-to-main, metadata off.
    pub fn from_spec(spec: &NewService, id: String, port: u16, order: u32) -> Self {
        let upper = id.to_uppercase();
        let identity = spec.identity.clone().unwrap_or_default();
        let dab = spec.dab.clone().unwrap_or_default();
        let input = spec.input.clone().unwrap_or_default();
        let audio = spec.audio.clone().unwrap_or_default();

        let pi = normalize_pi(identity.pi.as_deref().unwrap_or("0000"));
        let bitrate = match dab.bitrate_kbps {
            Some(b) if bitrate_allowed(b) => b,
            _ => 96,
        };

        Self {
            id,
            enabled: true,
            identity: Identity {
                service_id_hex: format!("0x{pi}"),
                pi,
                ps8: identity.ps8.unwrap_or_else(|| "RADIO".into()),
                ps16: identity.ps16,
                language_hex: identity.language_hex.unwrap_or_else(|| "0x0F".into()),
                pty: identity.pty.unwrap_or(10),
            },
            dab: DabConfig {
                bitrate_kbps: bitrate,
                protection_level: dab.protection_level.unwrap_or(3),
            },
            input: InputConfig {
                mode: "AUDIOENC".into(),
                uri: input.uri,
                backup_uri: input.backup_uri,
                zmq_buffer: 96,
                zmq_prebuffering: 48,
                encoder_buffer_ms: input.encoder_buffer_ms.unwrap_or(200),
            },
            audio: AudioConfig {
                channels: 2,
                sample_rate_hz: 48_000,
                gain_db: audio.gain_db.unwrap_or(0.0),
                codec: audio.codec.unwrap_or_else(|| "HE-AAC v1 (SBR)".into()),
            },
            pad: PadConfig {
                enabled: true,
                fifo_name: upper.clone(),
                dls_file: format!("{upper}.dls"),
                slide_dir: "slide".into(),
                mot_dir: format!("mot/{upper}"),
                sls: SlsConfig { enabled: true, logo_path: None },
            },
            network: NetworkConfig {
                edi_output_tcp: EdiOutputTcp { host: "127.0.0.1".into(), port },
            },
            watchdog: WatchdogConfig {
                enabled: true,
                silence_threshold_sec: 10,
                switch_to_backup_on_silence: true,
                return_to_main_after_sec: 60,
            },
            metadata: MetadataConfig {
                mode: MetadataMode::None,
                interval_sec: 10,
                url: None,
                artist_key: "artist".into(),
                title_key: "title".into(),
                sls_key: "cover".into(),
                default_dls: String::new(),
                sls_url: None,
                sls_back_color: String::new(),
                sls_font_color: String::new(),
                default_dls_allowed: true,
                default_sls_allowed: true,
                dls_included: false,
            },
            ui: UiConfig { order },
        }
    }
}

// --- Service patch (`PATCH /api/services/:id`) -----------------------------

/// Field-by-field merge document. Absent fields keep their current values;
/// which present fields actually apply depends on the on-air lock (see the
/// runtime core).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServicePatch {
    pub enabled: Option<bool>,
    pub identity: Option<IdentityPatch>,
    pub dab: Option<DabPatch>,
    pub input: Option<InputPatch>,
    pub audio: Option<AudioPatch>,
    pub watchdog: Option<WatchdogPatch>,
    pub metadata: Option<MetadataPatch>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityPatch {
    pub pi: Option<String>,
    pub ps8: Option<String>,
    pub ps16: Option<String>,
    pub language_hex: Option<String>,
    pub pty: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DabPatch {
    pub bitrate_kbps: Option<u32>,
    pub protection_level: Option<u8>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputPatch {
    pub mode: Option<String>,
    pub uri: Option<String>,
    pub backup_uri: Option<String>,
    pub zmq_buffer: Option<u32>,
    pub zmq_prebuffering: Option<u32>,
    pub encoder_buffer_ms: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioPatch {
    pub gain_db: Option<f64>,
    pub sample_rate_hz: Option<u32>,
    pub channels: Option<u32>,
    pub codec: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchdogPatch {
    pub enabled: Option<bool>,
    pub silence_threshold_sec: Option<u32>,
    pub switch_to_backup_on_silence: Option<bool>,
    pub return_to_main_after_sec: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataPatch {
    pub mode: Option<MetadataMode>,
    pub interval_sec: Option<u32>,
    pub url: Option<String>,
    pub artist_key: Option<String>,
    pub title_key: Option<String>,
    pub sls_key: Option<String>,
    pub default_dls: Option<String>,
    pub sls_url: Option<String>,
    pub sls_back_color: Option<String>,
    pub sls_font_color: Option<String>,
    pub default_dls_allowed: Option<bool>,
    pub default_sls_allowed: Option<bool>,
    pub dls_included: Option<bool>,
}

// --- Runtime ---------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ServiceStatus {
    Stopped,
    Starting,
    Running,
    Warning,
    Restarting,
    Stopping,
    Unknown,
}

/// Per-service runtime bookkeeping. In-memory only — created when a service
/// appears, destroyed when it is deleted, reported in state snapshots but
/// never persisted. All timestamps are unix millis; 0 means "never".
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRuntime {
    pub status: ServiceStatus,
    /// Which of primary/backup currently feeds the encoder.
    pub active_uri: Option<String>,
    pub last_ok_main_ms: u64,
    pub last_ok_backup_ms: u64,
    pub last_switch_ms: u64,
    pub failures_since_ms: u64,
    pub warning_since_ms: u64,
    pub last_meta_update_ms: u64,
    pub current_dls: String,
    pub current_sls_url: String,
}

impl ServiceRuntime {
    pub fn new(active_uri: Option<String>) -> Self {
        Self {
            status: ServiceStatus::Stopped,
            active_uri,
            last_ok_main_ms: 0,
            last_ok_backup_ms: 0,
            last_switch_ms: 0,
            failures_since_ms: 0,
            warning_since_ms: 0,
            last_meta_update_ms: 0,
            current_dls: String::new(),
            current_sls_url: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn demo_service() -> Service {
        Service::from_spec(&NewService::default(), "fip1".into(), 9001, 1)
    }

    #[test]
    fn spec_defaults_fill_every_field() {
        let svc = demo_service();
        assert!(svc.enabled);
        assert_eq!(svc.identity.pi, "0000");
        assert_eq!(svc.identity.service_id_hex, "0x0000");
        assert_eq!(svc.identity.ps8, "RADIO");
        assert_eq!(svc.dab.bitrate_kbps, 96);
        assert_eq!(svc.dab.protection_level, 3);
        assert_eq!(svc.input.mode, "AUDIOENC");
        assert_eq!(svc.input.zmq_buffer, 96);
        assert_eq!(svc.input.zmq_prebuffering, 48);
        assert_eq!(svc.input.encoder_buffer_ms, 200);
        assert_eq!(svc.audio.channels, 2);
        assert_eq!(svc.audio.sample_rate_hz, 48_000);
        assert_eq!(svc.audio.codec, "HE-AAC v1 (SBR)");
        assert_eq!(svc.pad.fifo_name, "FIP1");
        assert_eq!(svc.pad.dls_file, "FIP1.dls");
        assert_eq!(svc.pad.mot_dir, "mot/FIP1");
        assert_eq!(svc.network.edi_output_tcp.port, 9001);
        assert!(svc.watchdog.enabled);
        assert_eq!(svc.watchdog.silence_threshold_sec, 10);
        assert_eq!(svc.watchdog.return_to_main_after_sec, 60);
        assert_eq!(svc.metadata.mode, MetadataMode::None);
        assert_eq!(svc.metadata.interval_sec, 10);
        assert!(svc.metadata.default_dls_allowed);
    }

    #[test]
    fn disallowed_bitrate_in_spec_falls_back_to_96() {
        let spec = NewService {
            dab: Some(NewDab { bitrate_kbps: Some(97), protection_level: None }),
            ..Default::default()
        };
        let svc = Service::from_spec(&spec, "x".into(), 9001, 1);
        assert_eq!(svc.dab.bitrate_kbps, 96);
    }

    #[test]
    fn pi_is_normalized() {
        assert_eq!(normalize_pi("4db0ff"), "4DB0");
        assert_eq!(normalize_pi("f2"), "F2");
    }

    #[test]
    fn preset_round_trips_field_for_field() {
        let mut preset = Preset::empty("demo", "DemoMux");
        let mut svc = demo_service();
        svc.input.uri = Some("http://example.org/stream.mp3".into());
        svc.metadata.mode = MetadataMode::Json;
        preset.services.push(svc);

        let text = serde_json::to_string_pretty(&preset).unwrap();
        let back: Preset = serde_json::from_str(&text).unwrap();
        let again = serde_json::to_string_pretty(&back).unwrap();
        assert_eq!(text, again);
    }

    #[test]
    fn wire_names_are_camel_case_and_screaming_modes() {
        let svc = demo_service();
        let value = serde_json::to_value(&svc).unwrap();
        assert!(value["dab"]["bitrateKbps"].is_number());
        assert!(value["input"]["zmqPrebuffering"].is_number());
        assert!(value["network"]["ediOutputTcp"]["port"].is_number());
        assert_eq!(value["metadata"]["mode"], "NONE");

        let rt = ServiceRuntime::new(None);
        let value = serde_json::to_value(&rt).unwrap();
        assert_eq!(value["status"], "STOPPED");
        assert!(value["lastOkMainMs"].is_number());
    }

    #[test]
    fn encoder_flags_follow_codec_label() {
        let mut audio = demo_service().audio;
        assert_eq!(audio.encoder_flags(), &["--sbr"]);
        audio.codec = "AAC-LC".into();
        assert_eq!(audio.encoder_flags(), &[] as &[&str]);
        audio.codec = "HE-AAC v2 (SBR+PS)".into();
        assert_eq!(audio.encoder_flags(), &["--sbr", "--ps"]);
    }
}
