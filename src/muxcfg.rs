//! Multiplexer configuration rendering.
//!
//! The generated text is parsed by the odr-dabmux binary; section names,
//! option spellings and the fixed defaults (`dabmode 1`, `figtype 0x2`, the
//! per-mode output blocks) are its grammar, not ours. Change nothing here
//! without a mux to test against.

use std::fmt::Write;

use crate::model::Preset;
use crate::settings::Settings;

fn escape_label(s: &str) -> String {
    // dabmux labels are double-quoted; embedded quotes become apostrophes.
    s.replace('"', "'")
}

pub fn generate_mux_config(settings: &Settings, preset: &Preset) -> String {
    let e = &settings.ensemble;
    let dm = &settings.dabmux;
    let tx_mode = dm.tx_mode.to_uppercase();
    let mut out = String::new();
    let w = &mut out;

    writeln!(w, "general {{").unwrap();
    writeln!(w, "    dabmode 1").unwrap();
    writeln!(w, "    nbframes 0").unwrap();
    writeln!(w, "    syslog false").unwrap();
    writeln!(w, "    writescca false").unwrap();
    writeln!(w, "    tist true").unwrap();
    if dm.management_port != 0 {
        writeln!(w, "    managementport {}", dm.management_port).unwrap();
    }
    writeln!(w, "}}").unwrap();
    writeln!(w).unwrap();

    writeln!(w, "remotecontrol {{").unwrap();
    writeln!(w, "    telnetport {}", dm.telnet_port).unwrap();
    writeln!(w, "    zmqendpoint {}", dm.zmq_endpoint).unwrap();
    writeln!(w, "}}").unwrap();
    writeln!(w).unwrap();

    writeln!(w, "ensemble {{").unwrap();
    writeln!(w, "    id {}", e.id_hex).unwrap();
    writeln!(w, "    ecc {}", e.ecc_hex).unwrap();
    writeln!(w, "    label \"{}\"", escape_label(&e.label)).unwrap();
    writeln!(w, "    shortlabel \"{}\"", escape_label(&e.shortlabel)).unwrap();
    writeln!(w, "    international-table {}", e.international_table).unwrap();
    writeln!(w, "    local-time-offset {}", e.local_time_offset).unwrap();
    writeln!(w, "}}").unwrap();
    writeln!(w).unwrap();

    writeln!(w, "services {{").unwrap();
    for (idx, svc) in preset.services.iter().enumerate() {
        let label = svc
            .identity
            .ps16
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or(&svc.identity.ps8);
        writeln!(w, "    srv_{} {{", idx + 1).unwrap();
        writeln!(w, "        label \"{}\"", escape_label(label)).unwrap();
        writeln!(w, "        id {}", svc.identity.service_id_hex).unwrap();
        writeln!(w, "        pty {}", svc.identity.pty).unwrap();
        writeln!(w, "        language {}", svc.identity.language_hex).unwrap();
        writeln!(w, "    }}").unwrap();
    }
    writeln!(w, "}}").unwrap();
    writeln!(w).unwrap();

    writeln!(w, "subchannels {{").unwrap();
    for (idx, svc) in preset.services.iter().enumerate() {
        writeln!(w, "    sub_{} {{", idx + 1).unwrap();
        writeln!(w, "        type dabplus").unwrap();
        writeln!(w, "        inputproto \"zmq\"").unwrap();
        writeln!(w, "        inputuri \"tcp://*:{}\"", svc.network.edi_output_tcp.port).unwrap();
        writeln!(w, "        zmq-buffer {}", svc.input.zmq_buffer).unwrap();
        writeln!(w, "        zmq-prebuffering {}", svc.input.zmq_prebuffering).unwrap();
        writeln!(w, "        bitrate {}", svc.dab.bitrate_kbps).unwrap();
        writeln!(w, "        id {}", idx + 1).unwrap();
        writeln!(w, "        protection {}", svc.dab.protection_level).unwrap();
        writeln!(w, "    }}").unwrap();
    }
    writeln!(w, "}}").unwrap();
    writeln!(w).unwrap();

    writeln!(w, "components {{").unwrap();
    for (idx, svc) in preset.services.iter().enumerate() {
        writeln!(w, "    comp_{} {{", idx + 1).unwrap();
        writeln!(w, "        shortlabel \"{}\"", escape_label(&svc.identity.ps8)).unwrap();
        writeln!(w, "        service srv_{}", idx + 1).unwrap();
        writeln!(w, "        subchannel sub_{}", idx + 1).unwrap();
        writeln!(w, "        figtype 0x2").unwrap();
        if svc.pad.sls.enabled {
            writeln!(w, "        user-applications {{").unwrap();
            writeln!(w, "            userapp \"slideshow\"").unwrap();
            writeln!(w, "        }}").unwrap();
        }
        writeln!(w, "    }}").unwrap();
    }
    writeln!(w, "}}").unwrap();
    writeln!(w).unwrap();

    writeln!(w, "outputs {{").unwrap();
    match tx_mode.as_str() {
        // USRP1: raw ETI on stdout, dabmod sits downstream.
        "USRP1" => {
            writeln!(w, "    stdout \"fifo:///dev/stdout?type=raw\"").unwrap();
        }
        // EDI-over-TCP listener.
        "EDI" => {
            writeln!(w, "    throttle \"simul://\"").unwrap();
            writeln!(w, "    edi {{").unwrap();
            writeln!(w, "        destinations {{").unwrap();
            writeln!(w, "            webapp_tcp {{").unwrap();
            writeln!(w, "                protocol tcp").unwrap();
            writeln!(w, "                listenport {}", dm.edi_tcp_listen_port).unwrap();
            writeln!(w, "            }}").unwrap();
            writeln!(w, "        }}").unwrap();
            writeln!(w, "    }}").unwrap();
        }
        // EASYDAB (default): throttle + ZMQ output endpoint.
        _ => {
            writeln!(w, "    throttle \"simul://\"").unwrap();
            writeln!(
                w,
                "    zmq \"zmq+tcp://{}:{}\"",
                dm.easy_dab_output.ip, dm.easy_dab_output.port
            )
            .unwrap();
        }
    }
    writeln!(w, "}}").unwrap();

    out
}
