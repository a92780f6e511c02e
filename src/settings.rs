//! Global engine settings (`settings.json`).
//!
//! Everything here is editable at runtime through `PATCH /api/settings`
//! except the data directory, which is fixed at startup. Defaults are
//! written back on boot so a fresh install always has a complete,
//! hand-editable document on disk.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::storage::{read_json, write_json};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    /// If the ODR tools are not in PATH, set this to e.g. "/usr/local/bin".
    pub odr_bin_dir: String,
    /// Where presets, generated mux files and logs live.
    pub data_dir: String,
    pub dabmux: DabmuxSettings,
    pub ensemble: EnsembleSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DabmuxSettings {
    pub telnet_port: u16,
    pub management_port: u16,
    /// Remote control over ZMQ.
    pub zmq_endpoint: String,
    /// Transmission mode: USRP1 | EDI | EASYDAB.
    pub tx_mode: String,
    /// EASYDAB output (dabmux ZMQ output endpoint).
    pub easy_dab_output: EasyDabOutput,
    /// EDI-over-TCP output (only used when txMode == "EDI").
    pub edi_tcp_listen_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EasyDabOutput {
    pub ip: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EnsembleSettings {
    pub id_hex: String,
    pub ecc_hex: String,
    pub label: String,
    pub shortlabel: String,
    pub international_table: u32,
    pub local_time_offset: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            // Default WebUI port (avoids common conflicts).
            port: 9090,
            odr_bin_dir: String::new(),
            data_dir: "./data".into(),
            dabmux: DabmuxSettings::default(),
            ensemble: EnsembleSettings::default(),
        }
    }
}

impl Default for DabmuxSettings {
    fn default() -> Self {
        Self {
            telnet_port: 12721,
            management_port: 12720,
            zmq_endpoint: "tcp://lo:12722".into(),
            tx_mode: "EASYDAB".into(),
            easy_dab_output: EasyDabOutput::default(),
            edi_tcp_listen_port: 13000,
        }
    }
}

impl Default for EasyDabOutput {
    fn default() -> Self {
        Self { ip: "0.0.0.0".into(), port: 18081 }
    }
}

impl Default for EnsembleSettings {
    fn default() -> Self {
        Self {
            id_hex: "0xF408".into(),
            ecc_hex: "0xE1".into(),
            label: "OpenDigitalRadio".into(),
            shortlabel: "ODR".into(),
            international_table: 1,
            local_time_offset: "auto".into(),
        }
    }
}

/// Patch document for `PATCH /api/settings`: shallow merge of the two
/// runtime-editable groups.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsPatch {
    pub dabmux: Option<DabmuxPatch>,
    pub ensemble: Option<EnsemblePatch>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DabmuxPatch {
    pub telnet_port: Option<u16>,
    pub management_port: Option<u16>,
    pub zmq_endpoint: Option<String>,
    pub tx_mode: Option<String>,
    pub easy_dab_output: Option<EasyDabOutputPatch>,
    pub edi_tcp_listen_port: Option<u16>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EasyDabOutputPatch {
    pub ip: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnsemblePatch {
    pub id_hex: Option<String>,
    pub ecc_hex: Option<String>,
    pub label: Option<String>,
    pub shortlabel: Option<String>,
    pub international_table: Option<u32>,
    pub local_time_offset: Option<String>,
}

impl Settings {
    /// Load from disk, falling back to defaults, and write the effective
    /// document back so the file always reflects what the engine runs with.
    pub fn load_or_init(path: &Path) -> std::io::Result<Self> {
        let settings: Settings = read_json(path).unwrap_or_default();
        write_json(path, &settings)?;
        Ok(settings)
    }

    pub fn apply_patch(&mut self, patch: SettingsPatch) {
        if let Some(e) = patch.ensemble {
            let t = &mut self.ensemble;
            if let Some(v) = e.id_hex { t.id_hex = v; }
            if let Some(v) = e.ecc_hex { t.ecc_hex = v; }
            if let Some(v) = e.label { t.label = v; }
            if let Some(v) = e.shortlabel { t.shortlabel = v; }
            if let Some(v) = e.international_table { t.international_table = v; }
            if let Some(v) = e.local_time_offset { t.local_time_offset = v; }
        }
        if let Some(d) = patch.dabmux {
            let t = &mut self.dabmux;
            if let Some(v) = d.telnet_port { t.telnet_port = v; }
            if let Some(v) = d.management_port { t.management_port = v; }
            if let Some(v) = d.zmq_endpoint { t.zmq_endpoint = v; }
            if let Some(v) = d.tx_mode { t.tx_mode = v; }
            if let Some(v) = d.edi_tcp_listen_port { t.edi_tcp_listen_port = v; }
            if let Some(o) = d.easy_dab_output {
                if let Some(v) = o.ip { t.easy_dab_output.ip = v; }
                if let Some(v) = o.port { t.easy_dab_output.port = v; }
            }
        }
    }
}
