use anyhow::{anyhow, Result};
use serde::Serialize;
use std::sync::Arc;

use clap::ArgMatches;

use super::{config::SnifferConfig, handlers::PrintSink};
use crate::{
    api::SnifferBuilder,
    core::{
        scanner::scan, task_manager::spawn_blocking_task, FrameStats, RecordFilter, ScanControl,
        ScanOutcome,
    },
    protocol::{
        modbus::values::ValueFormat,
        tty::{available_ports_sorted, SerialLineFactory},
        LinkConfig, Parity,
    },
};

#[derive(Serialize)]
struct ScanReport<'a> {
    port_name: &'a str,
    detected: Option<LinkConfig>,
    stats: Option<FrameStats>,
    tried: usize,
    cancelled: bool,
}

/// Load the configuration file if one was given, then apply flag overrides.
pub fn load_config(matches: &ArgMatches) -> Result<SnifferConfig> {
    let mut config = match matches.get_one::<String>("config") {
        Some(path) => {
            log::info!("Loading configuration from file: {path}");
            SnifferConfig::from_file(path)?
        }
        None => SnifferConfig::default(),
    };

    if let Some(port) = matches.get_one::<String>("port") {
        config.port_name = port.clone();
    }
    if let Some(&baud) = matches.get_one::<u32>("baud") {
        config.link.baud = baud;
    }
    if let Some(&bits) = matches.get_one::<u8>("data-bits") {
        config.link.data_bits = bits;
    }
    if let Some(parity) = matches.get_one::<String>("parity") {
        config.link.parity = parity.parse::<Parity>()?;
    }
    if let Some(&bits) = matches.get_one::<u8>("stop-bits") {
        config.link.stop_bits = bits;
    }
    if matches.get_flag("discard-short-gaps") {
        config.framing.discard_on_short_gap = true;
    }
    Ok(config)
}

pub fn record_filter(matches: &ArgMatches) -> RecordFilter {
    RecordFilter {
        crc_ok_only: matches.get_flag("crc-ok-only"),
        errors_only: matches.get_flag("errors-only"),
    }
}

/// Register formats given with `--values`, in register order.
pub fn value_formats(matches: &ArgMatches) -> Result<Vec<ValueFormat>> {
    matches
        .get_many::<String>("values")
        .into_iter()
        .flatten()
        .map(|s| s.parse::<ValueFormat>())
        .collect()
}

/// Run the action selected on the command line.
pub async fn run(matches: &ArgMatches) -> Result<()> {
    let want_json = matches.get_flag("json");

    if matches.get_flag("list-ports") {
        list_ports(want_json)?;
        return Ok(());
    }

    let config = load_config(matches)?;
    if config.port_name.is_empty() {
        return Err(anyhow!(
            "No port given. Use --port, --config or --list-ports"
        ));
    }

    if matches.get_flag("scan") {
        scan_line(config, want_json).await
    } else {
        let formats = value_formats(matches)?;
        sniff(config, record_filter(matches), formats, want_json).await
    }
}

fn list_ports(want_json: bool) -> Result<()> {
    let ports = available_ports_sorted();
    if want_json {
        println!("{}", serde_json::to_string_pretty(&ports)?);
    } else {
        for p in &ports {
            println!("{}\t{}", p.port_name, p.port_type);
        }
    }
    Ok(())
}

async fn scan_line(config: SnifferConfig, want_json: bool) -> Result<()> {
    let control = ScanControl::new();
    {
        let control = control.clone();
        if let Err(err) = ctrlc::set_handler(move || control.cancel()) {
            log::warn!("Failed to install Ctrl-C handler: {err}");
        }
    }

    let options = config.scan_options();
    let port_name = config.port_name.clone();
    let outcome = spawn_blocking_task(move || {
        let mut factory = SerialLineFactory::new(port_name);
        scan(&mut factory, &options, &control)
    })
    .await??;

    let report = match outcome {
        ScanOutcome::Detected {
            config: link,
            stats,
            tried,
        } => ScanReport {
            port_name: &config.port_name,
            detected: Some(link),
            stats: Some(stats),
            tried,
            cancelled: false,
        },
        ScanOutcome::Cancelled { tried } => ScanReport {
            port_name: &config.port_name,
            detected: None,
            stats: None,
            tried,
            cancelled: true,
        },
    };

    if want_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else if let (Some(link), Some(stats)) = (report.detected, report.stats) {
        println!(
            "{}: {} ({}/{} frames valid, {} candidates tried)",
            report.port_name, link, stats.valid, stats.total, report.tried
        );
    } else {
        println!(
            "{}: scan cancelled after {} candidates",
            report.port_name, report.tried
        );
    }
    Ok(())
}

async fn sniff(
    config: SnifferConfig,
    filter: RecordFilter,
    formats: Vec<ValueFormat>,
    want_json: bool,
) -> Result<()> {
    let sink = if want_json {
        PrintSink::json()
    } else {
        PrintSink::text()
    };
    let sink = sink.with_values(formats);
    let sniffer = SnifferBuilder::new()
        .with_port(&config.port_name)
        .with_link(config.link)
        .with_capture_options(config.capture_options())
        .with_filter(filter)
        .add_sink(Arc::new(sink))
        .build()?;

    let control = sniffer.control();
    if let Err(err) = ctrlc::set_handler(move || control.stop()) {
        log::warn!("Failed to install Ctrl-C handler: {err}");
    }

    let dropped = spawn_blocking_task(move || sniffer.run()).await?;
    if dropped > 0 {
        log::warn!("{dropped} frames were dropped because the decoder queue was full");
    }
    Ok(())
}
