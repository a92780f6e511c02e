//! Runtime core.
//!
//! `AppState` owns the active preset and the per-service runtime map, and is
//! the only writer of both. API handlers call its methods; the watchdog and
//! metadata loops are periodic tasks it spawns while broadcasting. Loop
//! ticks copy what they need out of the core at the top of an iteration,
//! probe/fetch without holding the lock, then re-acquire and re-check the
//! broadcast flag before acting — a mutation racing a tick sees consistent
//! state, and stale loop work after teardown degrades to a no-op.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tokio::sync::{watch, Mutex};
use uuid::Uuid;

use crate::capacity::{estimate_cu, sum_cu, MAX_ENSEMBLE_CU};
use crate::error::{EngineError, Result};
use crate::logging::LogSink;
use crate::metadata;
use crate::model::{
    bitrate_allowed, normalize_pi, MetadataMode, NewService, Preset, Service, ServicePatch,
    ServiceRuntime, ServiceStatus, ALLOWED_BITRATES_KBPS,
};
use crate::muxcfg::generate_mux_config;
use crate::settings::{Settings, SettingsPatch};
use crate::storage::{ensure_dir, read_json, write_json};
use crate::supervisor::ProcessSupervisor;
use crate::watchdog::{self, ProbeOutcome};

pub const DEFAULT_PRESET_ID: &str = "default";

const MUX_PROCESS_KEY: &str = "mux:odr-dabmux";
const WATCHDOG_PERIOD: Duration = Duration::from_secs(5);
const METADATA_PERIOD: Duration = Duration::from_secs(1);

pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn audioenc_key(id: &str) -> String {
    format!("svc:{id}:audioenc")
}

fn padenc_key(id: &str) -> String {
    format!("svc:{id}:padenc")
}

fn mkfifo_key(id: &str) -> String {
    format!("svc:{id}:mkfifo")
}

fn generate_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

// --- Paths -----------------------------------------------------------------

/// Layout under the data directory: presets/, runtime/ (generated mux file,
/// encoder metadata side channels), logs/, mot/ (PAD working dirs).
#[derive(Clone)]
pub struct EnginePaths {
    pub data_dir: PathBuf,
}

impl EnginePaths {
    pub fn new(data_dir: PathBuf) -> Self {
        Self { data_dir }
    }

    pub fn ensure_tree(&self) -> std::io::Result<()> {
        ensure_dir(&self.presets_dir())?;
        ensure_dir(&self.runtime_dir())?;
        ensure_dir(&self.data_dir.join("logs"))?;
        ensure_dir(&self.data_dir.join("mot"))
    }

    pub fn presets_dir(&self) -> PathBuf {
        self.data_dir.join("presets")
    }

    pub fn runtime_dir(&self) -> PathBuf {
        self.data_dir.join("runtime")
    }

    pub fn settings_file(&self) -> PathBuf {
        self.data_dir.join("settings.json")
    }

    pub fn log_file(&self) -> PathBuf {
        self.data_dir.join("logs").join("muxpilot.log")
    }

    pub fn preset_file(&self, id: &str) -> PathBuf {
        self.presets_dir().join(format!("{id}.json"))
    }

    pub fn mux_file(&self) -> PathBuf {
        self.runtime_dir().join("current.mux")
    }

    /// The audio encoder's metadata pass-through file for a service.
    pub fn mta_file(&self, svc: &Service) -> PathBuf {
        let tag = if svc.identity.pi.is_empty() { &svc.id } else { &svc.identity.pi };
        self.runtime_dir().join(format!("{}.mta", tag.to_uppercase()))
    }

    pub fn slide_dir_for(&self, svc_id: &str) -> PathBuf {
        self.data_dir.join("mot").join(svc_id.to_uppercase()).join("slide")
    }
}

// --- Core ------------------------------------------------------------------

struct Core {
    settings: Settings,
    preset: Preset,
    runtime: HashMap<String, ServiceRuntime>,
    mux_running: bool,
    watchdog_stop: Option<watch::Sender<bool>>,
    metadata_stop: Option<watch::Sender<bool>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresetSummary {
    pub id: String,
    pub name: String,
}

struct MetaJob {
    svc: Service,
    current_dls: String,
    current_sls: String,
}

#[derive(Clone)]
pub struct AppState {
    core: Arc<Mutex<Core>>,
    pub supervisor: Arc<ProcessSupervisor>,
    pub sink: Arc<LogSink>,
    pub paths: EnginePaths,
    pub version: String,
    pub started_at: std::time::Instant,
    pub sys: Arc<Mutex<sysinfo::System>>,
    http: reqwest::Client,
}

impl AppState {
    /// Load (or create) the active preset and build the runtime map.
    pub fn new(
        paths: EnginePaths,
        settings: Settings,
        sink: Arc<LogSink>,
        supervisor: Arc<ProcessSupervisor>,
    ) -> std::io::Result<Self> {
        let preset_path = paths.preset_file(DEFAULT_PRESET_ID);
        let preset = match read_json::<Preset>(&preset_path) {
            Some(p) => p,
            None => {
                let p = Preset::empty(DEFAULT_PRESET_ID, "Default");
                write_json(&preset_path, &p)?;
                p
            }
        };

        let mut runtime = HashMap::new();
        for svc in &preset.services {
            runtime.insert(svc.id.clone(), ServiceRuntime::new(svc.input.uri.clone()));
        }

        let core = Core {
            settings,
            preset,
            runtime,
            mux_running: false,
            watchdog_stop: None,
            metadata_stop: None,
        };

        Ok(Self {
            core: Arc::new(Mutex::new(core)),
            supervisor,
            sink,
            paths,
            version: env!("CARGO_PKG_VERSION").to_string(),
            started_at: std::time::Instant::now(),
            sys: Arc::new(Mutex::new(sysinfo::System::new_all())),
            http: reqwest::Client::new(),
        })
    }

    fn save_preset(&self, core: &Core) -> Result<()> {
        write_json(&self.paths.preset_file(&core.preset.id), &core.preset)?;
        Ok(())
    }

    // --- Queries -----------------------------------------------------------

    /// Full state snapshot for the UI: broadcast flag, preset with each
    /// service annotated by its CU estimate and runtime status, aggregate
    /// capacity, the editable settings groups, and the allowed bitrates.
    pub async fn get_state(&self) -> serde_json::Value {
        let core = self.core.lock().await;
        let services: Vec<serde_json::Value> = core
            .preset
            .services
            .iter()
            .map(|svc| {
                let mut v = serde_json::to_value(svc).unwrap_or_default();
                v["cu"] = json!(estimate_cu(svc.dab.bitrate_kbps, svc.dab.protection_level));
                v["runtime"] = match core.runtime.get(&svc.id) {
                    Some(rt) => serde_json::to_value(rt).unwrap_or_default(),
                    None => json!({ "status": ServiceStatus::Unknown }),
                };
                v
            })
            .collect();

        json!({
            "muxRunning": core.mux_running,
            "preset": {
                "id": core.preset.id,
                "name": core.preset.name,
                "services": services,
                "capacity": {
                    "totalCu": sum_cu(&core.preset.services),
                    "maxCu": MAX_ENSEMBLE_CU,
                },
            },
            "settings": {
                "dabmux": core.settings.dabmux,
                "ensemble": core.settings.ensemble,
            },
            "allowedBitratesKbps": ALLOWED_BITRATES_KBPS,
        })
    }

    pub fn list_presets(&self) -> Vec<PresetSummary> {
        let mut out = Vec::new();
        if let Ok(entries) = std::fs::read_dir(self.paths.presets_dir()) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                if let Some(p) = read_json::<Preset>(&path) {
                    out.push(PresetSummary { id: p.id, name: p.name });
                }
            }
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub async fn settings(&self) -> Settings {
        self.core.lock().await.settings.clone()
    }

    pub async fn patch_settings(&self, patch: SettingsPatch) -> Result<Settings> {
        let mut core = self.core.lock().await;
        core.settings.apply_patch(patch);
        write_json(&self.paths.settings_file(), &core.settings)?;
        Ok(core.settings.clone())
    }

    pub async fn mux_running(&self) -> bool {
        self.core.lock().await.mux_running
    }

    // --- Service CRUD ------------------------------------------------------

    /// Merge a patch onto a copy of the service, validate, then commit and
    /// persist. Identity/DAB/audio-format/input-transport fields only apply
    /// off-air; patches to them while broadcasting are silently ignored
    /// (editing a live mux must not corrupt it, and the UI sends whole
    /// forms). Operational fields always apply.
    pub async fn set_service(&self, id: &str, patch: ServicePatch) -> Result<Service> {
        let mut core = self.core.lock().await;
        let idx = core
            .preset
            .services
            .iter()
            .position(|s| s.id == id)
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;

        let locked = core.mux_running;
        let mut next = core.preset.services[idx].clone();

        // Always editable.
        if let Some(enabled) = patch.enabled {
            next.enabled = enabled;
        }
        if let Some(input) = &patch.input {
            if let Some(uri) = &input.uri {
                next.input.uri = Some(uri.clone());
            }
            if let Some(backup) = &input.backup_uri {
                next.input.backup_uri = Some(backup.clone());
            }
            if let Some(ms) = input.encoder_buffer_ms {
                next.input.encoder_buffer_ms = ms;
            }
        }
        if let Some(audio) = &patch.audio {
            if let Some(gain) = audio.gain_db {
                next.audio.gain_db = gain;
            }
            if let Some(codec) = &audio.codec {
                next.audio.codec = codec.clone();
            }
        }
        if let Some(wd) = &patch.watchdog {
            if let Some(v) = wd.enabled {
                next.watchdog.enabled = v;
            }
            if let Some(v) = wd.silence_threshold_sec {
                next.watchdog.silence_threshold_sec = v;
            }
            if let Some(v) = wd.switch_to_backup_on_silence {
                next.watchdog.switch_to_backup_on_silence = v;
            }
            if let Some(v) = wd.return_to_main_after_sec {
                next.watchdog.return_to_main_after_sec = v;
            }
        }
        if let Some(meta) = &patch.metadata {
            let t = &mut next.metadata;
            if let Some(v) = meta.mode {
                t.mode = v;
            }
            if let Some(v) = meta.interval_sec {
                t.interval_sec = v;
            }
            if let Some(v) = &meta.url {
                t.url = Some(v.clone());
            }
            if let Some(v) = &meta.artist_key {
                t.artist_key = v.clone();
            }
            if let Some(v) = &meta.title_key {
                t.title_key = v.clone();
            }
            if let Some(v) = &meta.sls_key {
                t.sls_key = v.clone();
            }
            if let Some(v) = &meta.default_dls {
                t.default_dls = v.clone();
            }
            if let Some(v) = &meta.sls_url {
                t.sls_url = Some(v.clone());
            }
            if let Some(v) = &meta.sls_back_color {
                t.sls_back_color = v.clone();
            }
            if let Some(v) = &meta.sls_font_color {
                t.sls_font_color = v.clone();
            }
            if let Some(v) = meta.default_dls_allowed {
                t.default_dls_allowed = v;
            }
            if let Some(v) = meta.default_sls_allowed {
                t.default_sls_allowed = v;
            }
            if let Some(v) = meta.dls_included {
                t.dls_included = v;
            }
        }

        // Editable only while off-air.
        if !locked {
            if let Some(identity) = &patch.identity {
                if let Some(pi) = &identity.pi {
                    next.identity.pi = normalize_pi(pi);
                    next.identity.service_id_hex = format!("0x{}", next.identity.pi);
                }
                if let Some(v) = &identity.ps8 {
                    next.identity.ps8 = v.clone();
                }
                if let Some(v) = &identity.ps16 {
                    next.identity.ps16 = Some(v.clone());
                }
                if let Some(v) = &identity.language_hex {
                    next.identity.language_hex = v.clone();
                }
                if let Some(v) = identity.pty {
                    next.identity.pty = v;
                }
            }
            if let Some(dab) = &patch.dab {
                if let Some(bitrate) = dab.bitrate_kbps {
                    if !bitrate_allowed(bitrate) {
                        return Err(EngineError::InvalidBitrate(bitrate));
                    }
                    next.dab.bitrate_kbps = bitrate;
                }
                if let Some(protection) = dab.protection_level {
                    if !(1..=4).contains(&protection) {
                        return Err(EngineError::InvalidField(
                            "protectionLevel must be 1-4".into(),
                        ));
                    }
                    next.dab.protection_level = protection;
                }
            }
            if let Some(audio) = &patch.audio {
                if let Some(v) = audio.sample_rate_hz {
                    next.audio.sample_rate_hz = v;
                }
                if let Some(v) = audio.channels {
                    next.audio.channels = v;
                }
            }
            if let Some(input) = &patch.input {
                if let Some(mode) = &input.mode {
                    next.input.mode = mode.clone();
                }
                if let Some(v) = input.zmq_buffer {
                    next.input.zmq_buffer = v;
                }
                if let Some(v) = input.zmq_prebuffering {
                    next.input.zmq_prebuffering = v;
                }
            }
        }

        core.preset.services[idx] = next.clone();
        self.save_preset(&core)?;
        Ok(next)
    }

    pub async fn add_service(&self, spec: NewService) -> Result<Service> {
        let mut core = self.core.lock().await;
        if core.mux_running {
            return Err(EngineError::OnAirLocked("add a service"));
        }

        let id = match &spec.id {
            Some(id) if !id.is_empty() => id.clone(),
            _ => generate_id(),
        };
        if core.preset.services.iter().any(|s| s.id == id) {
            return Err(EngineError::DuplicateId(id));
        }
        if let Some(dab) = &spec.dab {
            if let Some(p) = dab.protection_level {
                if !(1..=4).contains(&p) {
                    return Err(EngineError::InvalidField("protectionLevel must be 1-4".into()));
                }
            }
        }

        let port = spec
            .network
            .as_ref()
            .and_then(|n| n.edi_output_tcp.as_ref())
            .and_then(|e| e.port)
            .unwrap_or_else(|| pick_free_port(&core.preset));
        let order = core.preset.services.len() as u32 + 1;

        let svc = Service::from_spec(&spec, id, port, order);
        core.runtime
            .insert(svc.id.clone(), ServiceRuntime::new(svc.input.uri.clone()));
        core.preset.services.push(svc.clone());
        self.save_preset(&core)?;
        Ok(svc)
    }

    /// Deleting an unknown id is a no-op, not an error.
    pub async fn delete_service(&self, id: &str) -> Result<()> {
        let mut core = self.core.lock().await;
        if core.mux_running {
            return Err(EngineError::OnAirLocked("delete a service"));
        }
        let Some(idx) = core.preset.services.iter().position(|s| s.id == id) else {
            return Ok(());
        };
        core.preset.services.remove(idx);
        core.runtime.remove(id);
        self.save_preset(&core)?;
        Ok(())
    }

    // --- Broadcast control -------------------------------------------------

    pub async fn start_mux(&self) -> Result<()> {
        let mut core = self.core.lock().await;
        if core.mux_running {
            return Ok(());
        }

        // Refuse obviously over-allocated ensembles before anything spawns.
        let total_cu = sum_cu(&core.preset.services);
        if total_cu > MAX_ENSEMBLE_CU {
            return Err(EngineError::CapacityExceeded { total_cu, max_cu: MAX_ENSEMBLE_CU });
        }

        let mux_text = generate_mux_config(&core.settings, &core.preset);
        let mux_path = self.paths.mux_file();
        ensure_dir(&self.paths.runtime_dir())?;
        std::fs::write(&mux_path, mux_text)?;
        self.sink
            .line("mux", &format!("generated mux: {}", mux_path.display()));

        let enabled: Vec<Service> = core
            .preset
            .services
            .iter()
            .filter(|s| s.enabled)
            .cloned()
            .collect();
        for svc in &enabled {
            self.start_service(&mut core, svc).await?;
        }

        self.supervisor.spawn(
            MUX_PROCESS_KEY,
            "odr-dabmux",
            &["-e".to_string(), mux_path.display().to_string()],
            None,
        )?;

        core.mux_running = true;
        self.start_watchdog(&mut core);
        self.start_metadata_loop(&mut core);
        Ok(())
    }

    /// Teardown order matters: loops first (so no tick races the teardown),
    /// then the mux, then every service whether enabled or not — cleanup is
    /// unconditional.
    pub async fn stop_mux(&self) -> Result<()> {
        let mut core = self.core.lock().await;
        if !core.mux_running {
            return Ok(());
        }

        if let Some(stop) = core.watchdog_stop.take() {
            let _ = stop.send(true);
            self.sink.line("watchdog", "stopped");
        }
        if let Some(stop) = core.metadata_stop.take() {
            let _ = stop.send(true);
            self.sink.line("metadata", "stopped");
        }

        self.supervisor.stop(MUX_PROCESS_KEY).await;

        let services: Vec<Service> = core.preset.services.to_vec();
        for svc in &services {
            self.stop_service(&mut core, svc).await;
        }

        core.mux_running = false;
        Ok(())
    }

    // --- Service process sequencing ----------------------------------------

    /// MOT directory for a service. Absolute paths pass through; paths
    /// already rooted at `mot/` or `data/mot/` land under the data dir;
    /// anything else nests under `<dataDir>/mot/`.
    pub fn resolve_mot_dir(&self, svc: &Service) -> PathBuf {
        let fifo = if !svc.pad.fifo_name.is_empty() {
            svc.pad.fifo_name.clone()
        } else if !svc.identity.ps8.is_empty() {
            svc.identity.ps8.clone()
        } else {
            svc.id.clone()
        };
        let mot = if svc.pad.mot_dir.is_empty() {
            format!("mot/{fifo}")
        } else {
            svc.pad.mot_dir.clone()
        };

        if Path::new(&mot).is_absolute() {
            return PathBuf::from(mot);
        }
        let cleaned = mot.trim_start_matches(['.', '/']);
        if let Some(rest) = cleaned.strip_prefix("data/mot/") {
            return self.paths.data_dir.join("mot").join(rest);
        }
        if cleaned.starts_with("mot/") {
            return self.paths.data_dir.join(cleaned);
        }
        self.paths.data_dir.join("mot").join(cleaned)
    }

    /// Pipe helper -> PAD encoder -> audio encoder, in that order. The PAD
    /// encoder is left alone when its key is already live so a failover
    /// restart touches only the audio side.
    async fn start_service(&self, core: &mut Core, svc: &Service) -> Result<()> {
        let scope = format!("svc:{}", svc.id);
        let mot_dir = self.resolve_mot_dir(svc);
        let fifo_path = mot_dir.join(&svc.pad.fifo_name);
        let mta_path = self.paths.mta_file(svc);

        ensure_dir(&mot_dir)?;
        if let Some(parent) = mta_path.parent() {
            ensure_dir(parent)?;
        }

        if !fifo_path.exists() && !self.supervisor.is_running(&mkfifo_key(&svc.id)) {
            self.supervisor.spawn(
                &mkfifo_key(&svc.id),
                "mkfifo",
                &[fifo_path.display().to_string()],
                Some(&mot_dir),
            )?;
        }

        if !self.supervisor.is_running(&padenc_key(&svc.id)) {
            self.supervisor.spawn(
                &padenc_key(&svc.id),
                "odr-padenc",
                &[
                    "-o".to_string(),
                    svc.pad.fifo_name.clone(),
                    "-t".to_string(),
                    svc.pad.dls_file.clone(),
                    "-d".to_string(),
                    svc.pad.slide_dir.clone(),
                ],
                Some(&mot_dir),
            )?;
        }

        if let Some(rt) = core.runtime.get_mut(&svc.id) {
            rt.status = ServiceStatus::Starting;
        }

        let active_uri = core
            .runtime
            .get(&svc.id)
            .and_then(|rt| rt.active_uri.clone())
            .or_else(|| svc.input.uri.clone());
        let Some(uri) = active_uri else {
            self.sink
                .line(&scope, "no input uri configured; audio encoder not started");
            return Ok(());
        };

        let mut args: Vec<String> = vec![
            "-v".into(),
            uri.clone(),
            "-D".into(),
            "-C".into(),
            svc.input.encoder_buffer_ms.to_string(),
            "-L".into(),
            "--audio-resampler=samplerate".into(),
        ];
        args.extend(svc.audio.encoder_flags().iter().map(|s| s.to_string()));
        args.extend([
            "-c".to_string(),
            svc.audio.channels.to_string(),
            "-p".to_string(),
            "64".to_string(),
            "-b".to_string(),
            svc.dab.bitrate_kbps.to_string(),
            "-r".to_string(),
            svc.audio.sample_rate_hz.to_string(),
            "-g".to_string(),
            svc.audio.gain_db.to_string(),
            "-s".to_string(),
            "60".to_string(),
            "-o".to_string(),
            format!("tcp://localhost:{}", svc.network.edi_output_tcp.port),
            "-w".to_string(),
            mta_path.display().to_string(),
            "-P".to_string(),
            svc.pad.fifo_name.clone(),
        ]);

        self.supervisor
            .spawn(&audioenc_key(&svc.id), "odr-audioenc", &args, Some(&mot_dir))?;

        if let Some(rt) = core.runtime.get_mut(&svc.id) {
            rt.status = ServiceStatus::Running;
            rt.active_uri = Some(uri);
        }
        Ok(())
    }

    /// Reverse order of start; every stop is best-effort because any of the
    /// three may have exited on its own (mkfifo always has).
    async fn stop_service(&self, core: &mut Core, svc: &Service) {
        if let Some(rt) = core.runtime.get_mut(&svc.id) {
            rt.status = ServiceStatus::Stopping;
        }
        self.supervisor.stop(&audioenc_key(&svc.id)).await;
        self.supervisor.stop(&padenc_key(&svc.id)).await;
        self.supervisor.stop(&mkfifo_key(&svc.id)).await;
        if let Some(rt) = core.runtime.get_mut(&svc.id) {
            rt.status = ServiceStatus::Stopped;
        }
    }

    /// Failover (or return-to-main): restart only the audio encoder against
    /// the new URI. The PAD side keeps running — slides and text don't care
    /// which source feeds the audio.
    async fn switch_service_uri(&self, core: &mut Core, svc: &Service, new_uri: &str) -> Result<()> {
        self.sink
            .line(&format!("svc:{}", svc.id), &format!("switch stream => {new_uri}"));

        self.supervisor.stop(&audioenc_key(&svc.id)).await;
        if let Some(rt) = core.runtime.get_mut(&svc.id) {
            rt.active_uri = Some(new_uri.to_string());
            rt.last_switch_ms = now_ms();
            rt.status = ServiceStatus::Restarting;
        }
        self.start_service(core, svc).await
    }

    // --- Watchdog loop -----------------------------------------------------

    fn start_watchdog(&self, core: &mut Core) {
        if core.watchdog_stop.is_some() {
            return;
        }
        let (stop_tx, mut stop_rx) = watch::channel(false);
        core.watchdog_stop = Some(stop_tx);

        let state = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(
                tokio::time::Instant::now() + WATCHDOG_PERIOD,
                WATCHDOG_PERIOD,
            );
            loop {
                tokio::select! {
                    _ = ticker.tick() => state.watchdog_tick().await,
                    _ = stop_rx.changed() => break,
                }
            }
        });
        self.sink.line("watchdog", "started");
    }

    async fn watchdog_tick(&self) {
        let services: Vec<Service> = {
            let core = self.core.lock().await;
            if !core.mux_running {
                return;
            }
            core.preset
                .services
                .iter()
                .filter(|s| s.enabled && s.watchdog.enabled)
                .cloned()
                .collect()
        };

        for svc in services {
            // Probe both sources without holding the lock; stamps for both
            // are kept regardless of which one is active.
            let main_ok = watchdog::probe_ok(&self.http, svc.input.uri.as_deref()).await;
            let backup_ok = watchdog::probe_ok(&self.http, svc.input.backup_uri.as_deref()).await;

            let mut core = self.core.lock().await;
            if !core.mux_running {
                return;
            }
            let now = now_ms();
            let target = match core.runtime.get_mut(&svc.id) {
                Some(rt) => watchdog::assess(
                    &svc.watchdog,
                    &svc.input,
                    ProbeOutcome { main_ok, backup_ok },
                    rt,
                    now,
                ),
                None => continue,
            };

            if let Some(uri) = target {
                match self.switch_service_uri(&mut core, &svc, &uri).await {
                    Ok(()) => {
                        if let Some(rt) = core.runtime.get_mut(&svc.id) {
                            rt.failures_since_ms = 0;
                            rt.warning_since_ms = 0;
                        }
                    }
                    Err(e) => {
                        self.sink
                            .line(&format!("svc:{}", svc.id), &format!("failover failed: {e}"));
                    }
                }
            }
        }
    }

    // --- Metadata loop -----------------------------------------------------

    fn start_metadata_loop(&self, core: &mut Core) {
        if core.metadata_stop.is_some() {
            return;
        }
        let (stop_tx, mut stop_rx) = watch::channel(false);
        core.metadata_stop = Some(stop_tx);

        let state = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(
                tokio::time::Instant::now() + METADATA_PERIOD,
                METADATA_PERIOD,
            );
            loop {
                tokio::select! {
                    _ = ticker.tick() => state.metadata_tick().await,
                    _ = stop_rx.changed() => break,
                }
            }
        });
        self.sink.line("metadata", "started");
    }

    /// 1 s tick, but each service only does work once its own polling
    /// interval has elapsed.
    async fn metadata_tick(&self) {
        let now = now_ms();
        let jobs: Vec<MetaJob> = {
            let mut core = self.core.lock().await;
            if !core.mux_running {
                return;
            }
            let services: Vec<Service> = core
                .preset
                .services
                .iter()
                .filter(|s| s.enabled)
                .cloned()
                .collect();

            let mut jobs = Vec::new();
            for svc in services {
                let Some(rt) = core.runtime.get_mut(&svc.id) else { continue };
                let interval_ms = u64::from(svc.metadata.interval_sec.max(1)) * 1000;
                if rt.last_meta_update_ms != 0
                    && now.saturating_sub(rt.last_meta_update_ms) < interval_ms
                {
                    continue;
                }
                rt.last_meta_update_ms = now;
                if svc.metadata.mode == MetadataMode::None {
                    continue;
                }
                jobs.push(MetaJob {
                    current_dls: rt.current_dls.clone(),
                    current_sls: rt.current_sls_url.clone(),
                    svc,
                });
            }
            jobs
        };

        for job in jobs {
            self.update_service_metadata(job).await;
        }
    }

    async fn update_service_metadata(&self, job: MetaJob) {
        let svc = &job.svc;
        let mot_dir = self.resolve_mot_dir(svc);
        let slide: &str =
            if svc.pad.slide_dir.is_empty() { "slide" } else { svc.pad.slide_dir.as_str() };
        let slide_dir = mot_dir.join(slide);
        let dls_path = mot_dir.join(&svc.pad.dls_file);

        if ensure_dir(&mot_dir).is_err() || ensure_dir(&slide_dir).is_err() {
            self.sink
                .line("metadata", &format!("cannot create MOT dirs for {}", svc.id));
            return;
        }

        let resolved =
            metadata::resolve(&self.http, svc, &self.paths.mta_file(svc), &self.sink).await;

        // DLS: only a changed, non-empty line touches the file.
        let mut new_dls = None;
        if !resolved.dls.is_empty() && resolved.dls != job.current_dls {
            match std::fs::write(&dls_path, &resolved.dls) {
                Ok(()) => new_dls = Some(resolved.dls.clone()),
                Err(e) => self
                    .sink
                    .line("metadata", &format!("dls write failed ({}): {e}", svc.id)),
            }
        }

        // Artwork: download on change; the last-applied URL only advances on
        // a successful download so a flaky CDN retries next poll.
        let mut new_sls = None;
        if !resolved.sls_url.is_empty() && resolved.sls_url != job.current_sls {
            let ext = metadata::artwork_ext(&resolved.sls_url);
            let dest = slide_dir.join(format!("cover.{ext}"));
            if metadata::download_image(&self.http, &resolved.sls_url, &dest).await {
                new_sls = Some(resolved.sls_url.clone());
            }
        } else if resolved.sls_url.is_empty() && svc.metadata.default_sls_allowed {
            metadata::copy_default_logo(&slide_dir);
        }

        if new_dls.is_some() || new_sls.is_some() {
            let mut core = self.core.lock().await;
            if let Some(rt) = core.runtime.get_mut(&svc.id) {
                if let Some(dls) = new_dls {
                    rt.current_dls = dls;
                }
                if let Some(sls) = new_sls {
                    rt.current_sls_url = sls;
                }
            }
        }
    }

    // --- Test hooks --------------------------------------------------------

    #[cfg(test)]
    async fn set_on_air(&self, on: bool) {
        self.core.lock().await.mux_running = on;
    }

    #[cfg(test)]
    async fn runtime_snapshot(&self, id: &str) -> Option<ServiceRuntime> {
        self.core.lock().await.runtime.get(id).cloned()
    }
}

fn pick_free_port(preset: &Preset) -> u16 {
    preset
        .services
        .iter()
        .map(|s| s.network.edi_output_tcp.port)
        .max()
        .unwrap_or(9000)
        + 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DabPatch, IdentityPatch, InputPatch, NewDab, NewEdiOutputTcp, NewNetwork};

    fn fixture() -> (tempfile::TempDir, AppState) {
        let dir = tempfile::tempdir().unwrap();
        let paths = EnginePaths::new(dir.path().to_path_buf());
        paths.ensure_tree().unwrap();
        let sink = Arc::new(LogSink::new(paths.log_file()).unwrap());
        let supervisor = Arc::new(ProcessSupervisor::new(String::new(), sink.clone()));
        let state = AppState::new(paths, Settings::default(), sink, supervisor).unwrap();
        (dir, state)
    }

    fn named_spec(id: &str) -> NewService {
        NewService { id: Some(id.to_string()), ..Default::default() }
    }

    #[tokio::test]
    async fn add_service_assigns_ports_and_persists() {
        let (_dir, state) = fixture();

        let first = state.add_service(named_spec("alpha")).await.unwrap();
        assert_eq!(first.network.edi_output_tcp.port, 9001);
        let second = state.add_service(named_spec("beta")).await.unwrap();
        assert_eq!(second.network.edi_output_tcp.port, 9002);

        // Explicit port wins; the next auto-assignment continues above it.
        let spec = NewService {
            id: Some("gamma".into()),
            network: Some(NewNetwork {
                edi_output_tcp: Some(NewEdiOutputTcp { port: Some(9500) }),
            }),
            ..Default::default()
        };
        let third = state.add_service(spec).await.unwrap();
        assert_eq!(third.network.edi_output_tcp.port, 9500);
        let fourth = state.add_service(named_spec("delta")).await.unwrap();
        assert_eq!(fourth.network.edi_output_tcp.port, 9501);

        // Written through to disk.
        let on_disk: Preset =
            read_json(&state.paths.preset_file(DEFAULT_PRESET_ID)).unwrap();
        assert_eq!(on_disk.services.len(), 4);
        assert_eq!(on_disk.services[0].id, "alpha");

        // Runtime entries exist.
        let rt = state.runtime_snapshot("alpha").await.unwrap();
        assert_eq!(rt.status, ServiceStatus::Stopped);
    }

    #[tokio::test]
    async fn duplicate_id_is_refused() {
        let (_dir, state) = fixture();
        state.add_service(named_spec("alpha")).await.unwrap();
        let err = state.add_service(named_spec("alpha")).await.unwrap_err();
        assert!(matches!(err, EngineError::DuplicateId(id) if id == "alpha"));
    }

    #[tokio::test]
    async fn add_and_delete_are_locked_on_air() {
        let (_dir, state) = fixture();
        state.add_service(named_spec("alpha")).await.unwrap();
        state.set_on_air(true).await;

        assert!(matches!(
            state.add_service(named_spec("beta")).await.unwrap_err(),
            EngineError::OnAirLocked(_)
        ));
        assert!(matches!(
            state.delete_service("alpha").await.unwrap_err(),
            EngineError::OnAirLocked(_)
        ));

        state.set_on_air(false).await;
        state.delete_service("alpha").await.unwrap();
        assert!(state.runtime_snapshot("alpha").await.is_none());
        // Unknown id: no-op.
        state.delete_service("alpha").await.unwrap();
    }

    #[tokio::test]
    async fn set_service_unknown_id_is_not_found() {
        let (_dir, state) = fixture();
        let err = state
            .set_service("ghost", ServicePatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound(id) if id == "ghost"));
    }

    #[tokio::test]
    async fn set_service_recomputes_service_id_from_pi() {
        let (_dir, state) = fixture();
        state.add_service(named_spec("alpha")).await.unwrap();
        let patch = ServicePatch {
            identity: Some(IdentityPatch { pi: Some("4db0ff".into()), ..Default::default() }),
            ..Default::default()
        };
        let svc = state.set_service("alpha", patch).await.unwrap();
        assert_eq!(svc.identity.pi, "4DB0");
        assert_eq!(svc.identity.service_id_hex, "0x4DB0");
    }

    #[tokio::test]
    async fn set_service_rejects_bad_bitrate_off_air() {
        let (_dir, state) = fixture();
        state.add_service(named_spec("alpha")).await.unwrap();
        let patch = ServicePatch {
            dab: Some(DabPatch { bitrate_kbps: Some(97), protection_level: None }),
            ..Default::default()
        };
        let err = state.set_service("alpha", patch).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidBitrate(97)));

        // Valid member of the set applies.
        let patch = ServicePatch {
            dab: Some(DabPatch { bitrate_kbps: Some(128), protection_level: Some(2) }),
            ..Default::default()
        };
        let svc = state.set_service("alpha", patch).await.unwrap();
        assert_eq!(svc.dab.bitrate_kbps, 128);
        assert_eq!(svc.dab.protection_level, 2);
    }

    #[tokio::test]
    async fn on_air_lock_freezes_format_but_not_operational_fields() {
        let (_dir, state) = fixture();
        state.add_service(named_spec("alpha")).await.unwrap();
        state.set_on_air(true).await;

        let patch = ServicePatch {
            enabled: Some(false),
            identity: Some(IdentityPatch { pi: Some("ABCD".into()), ..Default::default() }),
            dab: Some(DabPatch { bitrate_kbps: Some(97), protection_level: Some(9) }),
            input: Some(InputPatch {
                mode: Some("OTHER".into()),
                uri: Some("http://new.example/a".into()),
                zmq_buffer: Some(1),
                zmq_prebuffering: Some(1),
                encoder_buffer_ms: Some(500),
                ..Default::default()
            }),
            ..Default::default()
        };
        let svc = state.set_service("alpha", patch).await.unwrap();

        // Locked fields untouched — including the invalid bitrate, which is
        // ignored rather than rejected while ON AIR.
        assert_eq!(svc.identity.pi, "0000");
        assert_eq!(svc.dab.bitrate_kbps, 96);
        assert_eq!(svc.input.mode, "AUDIOENC");
        assert_eq!(svc.input.zmq_buffer, 96);
        assert_eq!(svc.input.zmq_prebuffering, 48);

        // Operational fields applied.
        assert!(!svc.enabled);
        assert_eq!(svc.input.uri.as_deref(), Some("http://new.example/a"));
        assert_eq!(svc.input.encoder_buffer_ms, 500);
    }

    #[tokio::test]
    async fn start_mux_refuses_over_capacity_without_spawning() {
        let (_dir, state) = fixture();
        for i in 0..5 {
            let spec = NewService {
                id: Some(format!("svc{i}")),
                dab: Some(NewDab { bitrate_kbps: Some(192), protection_level: Some(1) }),
                ..Default::default()
            };
            state.add_service(spec).await.unwrap();
        }

        let err = state.start_mux().await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::CapacityExceeded { total_cu, max_cu: 864 } if total_cu > 864
        ));
        assert!(!state.mux_running().await);
        assert!(state.supervisor.running_keys().is_empty());
        assert!(!state.paths.mux_file().exists());
    }

    #[tokio::test]
    async fn stop_mux_is_idempotent_when_off_air() {
        let (_dir, state) = fixture();
        state.stop_mux().await.unwrap();
        assert!(!state.mux_running().await);
    }

    #[tokio::test]
    async fn mot_dir_resolution_rules() {
        let (_dir, state) = fixture();
        let data = state.paths.data_dir.clone();
        let mut svc = Service::from_spec(&NewService::default(), "fip".into(), 9001, 1);

        svc.pad.mot_dir = "mot/FIP".into();
        assert_eq!(state.resolve_mot_dir(&svc), data.join("mot").join("FIP"));

        svc.pad.mot_dir = "./mot/FIP".into();
        assert_eq!(state.resolve_mot_dir(&svc), data.join("mot").join("FIP"));

        svc.pad.mot_dir = "data/mot/FIP".into();
        assert_eq!(state.resolve_mot_dir(&svc), data.join("mot").join("FIP"));

        svc.pad.mot_dir = "custom/FIP".into();
        assert_eq!(
            state.resolve_mot_dir(&svc),
            data.join("mot").join("custom/FIP")
        );

        svc.pad.mot_dir = "/abs/mot".into();
        assert_eq!(state.resolve_mot_dir(&svc), PathBuf::from("/abs/mot"));

        // Empty motDir falls back to the fifo name.
        svc.pad.mot_dir = String::new();
        svc.pad.fifo_name = "FIP".into();
        assert_eq!(state.resolve_mot_dir(&svc), data.join("mot").join("FIP"));
    }

    #[tokio::test]
    async fn state_snapshot_has_capacity_and_runtime_annotations() {
        let (_dir, state) = fixture();
        let spec = NewService {
            id: Some("alpha".into()),
            dab: Some(NewDab { bitrate_kbps: Some(88), protection_level: Some(3) }),
            ..Default::default()
        };
        state.add_service(spec).await.unwrap();

        let snap = state.get_state().await;
        assert_eq!(snap["muxRunning"], false);
        assert_eq!(snap["preset"]["capacity"]["maxCu"], 864);
        assert_eq!(snap["preset"]["capacity"]["totalCu"], 73);
        let svc = &snap["preset"]["services"][0];
        assert_eq!(svc["cu"], 73);
        assert_eq!(svc["runtime"]["status"], "STOPPED");
        assert_eq!(snap["allowedBitratesKbps"][0], 8);
        assert_eq!(snap["settings"]["ensemble"]["shortlabel"], "ODR");
    }

    #[tokio::test]
    async fn list_presets_scans_the_directory() {
        let (_dir, state) = fixture();
        // The default preset was created at startup.
        let presets = state.list_presets();
        assert_eq!(presets.len(), 1);
        assert_eq!(presets[0].id, "default");

        write_json(
            &state.paths.preset_file("other"),
            &Preset::empty("other", "Other"),
        )
        .unwrap();
        std::fs::write(state.paths.presets_dir().join("junk.json"), "{ bad").unwrap();

        let presets = state.list_presets();
        assert_eq!(presets.len(), 2);
        assert_eq!(presets[1].id, "other");
    }

    #[tokio::test]
    async fn metadata_apply_writes_dls_once_and_tracks_it() {
        let (_dir, state) = fixture();
        state.add_service(named_spec("alpha")).await.unwrap();

        let mut svc = {
            let snap: Preset = read_json(&state.paths.preset_file(DEFAULT_PRESET_ID)).unwrap();
            snap.services[0].clone()
        };
        svc.metadata.mode = MetadataMode::File;
        svc.metadata.default_dls = "WELCOME".into();

        let mot_dir = state.resolve_mot_dir(&svc);
        let dls_path = mot_dir.join(&svc.pad.dls_file);

        // First pass: default text lands in the DLS file and in the runtime.
        let job = MetaJob {
            svc: svc.clone(),
            current_dls: String::new(),
            current_sls: String::new(),
        };
        state.update_service_metadata(job).await;
        assert_eq!(std::fs::read_to_string(&dls_path).unwrap(), "WELCOME");
        let rt = state.runtime_snapshot("alpha").await.unwrap();
        assert_eq!(rt.current_dls, "WELCOME");

        // Second pass with unchanged text: the file is not rewritten.
        std::fs::remove_file(&dls_path).unwrap();
        let job = MetaJob {
            svc,
            current_dls: "WELCOME".into(),
            current_sls: String::new(),
        };
        state.update_service_metadata(job).await;
        assert!(!dls_path.exists());
    }
}
